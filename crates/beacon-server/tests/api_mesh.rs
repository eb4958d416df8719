//! Router-level tests of the mesh API using `oneshot` requests.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use beacon_identity::SignatureProvider;
use beacon_mesh::handshake::request_message;
use beacon_server::config::Config;
use beacon_server::proxy::PEER_PATHS;
use beacon_server::{build_state, operator_app, peer_app, AppState};
use beacon_types::{BeaconIdentity, HandshakeRequest};
use serde_json::{json, Value};
use tower::ServiceExt; // for oneshot

fn state(dir: &tempfile::TempDir, domain: &str) -> AppState {
    let mut config = Config::default();
    config.database.path = dir
        .path()
        .join(format!("{domain}.db"))
        .to_string_lossy()
        .into_owned();
    config.mesh.domain = domain.to_string();
    build_state(&config).unwrap()
}

/// The two listeners of one beacon.
struct Apps {
    peer: Router,
    operator: Router,
}

fn apps(state: &AppState) -> Apps {
    Apps {
        peer: peer_app(state.clone()),
        operator: operator_app(state.clone()),
    }
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

/// A handshake request from `requester`, correctly signed.
fn signed_request(requester: &AppState, invite_id: &str, secret: &str) -> Value {
    let identity: BeaconIdentity = requester
        .mesh
        .identity
        .advertised(&requester.mesh.mesh_url)
        .unwrap();
    let signature = requester
        .mesh
        .identity
        .signer()
        .unwrap()
        .sign(request_message(invite_id, &identity.fingerprint).as_bytes());
    serde_json::to_value(HandshakeRequest {
        invite_id: invite_id.to_string(),
        secret: secret.to_string(),
        peer_identity: identity,
        signature: Some(signature),
    })
    .unwrap()
}

#[tokio::test]
async fn liveness_and_identity() {
    let dir = tempfile::tempdir().unwrap();
    let apps = apps(&state(&dir, "alpha.example.org"));

    for app in [&apps.peer, &apps.operator] {
        let (status, body) = send(app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    let (status, body) = send(&apps.peer, "GET", "/api/mesh/identity", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["domain"], "alpha.example.org");
    assert_eq!(body["mesh_url"], "https://mesh.alpha.example.org/api/mesh");
    assert_eq!(body["fingerprint"].as_str().unwrap().len(), 64);

    let (status, ping) = send(&apps.peer, "GET", "/api/mesh/ping", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ping["fingerprint"], body["fingerprint"]);
    assert_eq!(ping["peer_count"], 0);
}

#[tokio::test]
async fn created_invites_are_listed_without_secrets() {
    let dir = tempfile::tempdir().unwrap();
    let app = operator_app(state(&dir, "alpha.example.org"));

    let (status, created) = send(&app, "POST", "/api/mesh/create-invite", None).await;
    assert_eq!(status, StatusCode::OK);
    let token = beacon_mesh::decode_invite_token(created["token"].as_str().unwrap()).unwrap();
    assert_eq!(token.invite_id, created["invite_id"].as_str().unwrap());
    assert_eq!(token.origin_domain, "alpha.example.org");

    let (status, list) = send(&app, "GET", "/api/mesh/invites", None).await;
    assert_eq!(status, StatusCode::OK);
    let list = list.as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["used"], false);
    assert!(list[0].get("secret").is_none());
}

#[tokio::test]
async fn malformed_token_is_bad_request() {
    let dir = tempfile::tempdir().unwrap();
    let app = operator_app(state(&dir, "beta.example.org"));

    let (status, body) = send(
        &app,
        "POST",
        "/api/mesh/accept-invite",
        Some(json!({ "token": "not-a-token" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("invalid invite token"));
}

#[tokio::test]
async fn handshake_errors_map_to_status_codes() {
    let dir = tempfile::tempdir().unwrap();
    let origin = state(&dir, "alpha.example.org");
    let requester = state(&dir, "beta.example.org");
    let app = apps(&origin);

    let (_, created) = send(&app.operator, "POST", "/api/mesh/create-invite", None).await;
    let token = beacon_mesh::decode_invite_token(created["token"].as_str().unwrap()).unwrap();

    let (status, _) = send(
        &app.peer,
        "POST",
        "/api/mesh/handshake",
        Some(signed_request(&requester, "no-such-invite", "x")),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &app.peer,
        "POST",
        "/api/mesh/handshake",
        Some(signed_request(&requester, &token.invite_id, "wrong")),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(
        &app.peer,
        "POST",
        "/api/mesh/handshake",
        Some(signed_request(&origin, &token.invite_id, &token.secret)),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let mut unsigned = signed_request(&requester, &token.invite_id, &token.secret);
    unsigned["signature"] = Value::Null;
    let (status, _) = send(&app.peer, "POST", "/api/mesh/handshake", Some(unsigned)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // None of the rejected attempts consumed the invite.
    let (status, body) = send(
        &app.peer,
        "POST",
        "/api/mesh/handshake",
        Some(signed_request(&requester, &token.invite_id, &token.secret)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["peer_identity"]["domain"], "alpha.example.org");
    assert!(body["signature"].is_string());

    let (status, _) = send(
        &app.peer,
        "POST",
        "/api/mesh/handshake",
        Some(signed_request(&requester, &token.invite_id, &token.secret)),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, peers) = send(&app.operator, "GET", "/api/mesh/peers", None).await;
    assert_eq!(status, StatusCode::OK);
    let peers = peers.as_array().unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0]["domain"], "beta.example.org");
    for forbidden in ["secret", "client_secret", "public_key", "federation"] {
        assert!(peers[0].get(forbidden).is_none(), "{forbidden} leaked");
    }

    let (status, events) = send(
        &app.operator,
        "GET",
        "/api/mesh/events?event_type=SECRET_MISMATCH",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(events["count"], 1);
}

#[tokio::test]
async fn unknown_resources_are_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let app = operator_app(state(&dir, "alpha.example.org"));
    let missing = "ab".repeat(32);

    let (status, _) = send(&app, "GET", "/api/mesh/handshakes/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let uri = format!("/api/mesh/peers/{missing}");
    let (status, body) = send(&app, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());

    let uri = format!("/api/mesh/peers/{missing}/federation");
    let (status, _) = send(&app, "POST", &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn exchange_from_stranger_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let local = state(&dir, "alpha.example.org");
    let stranger = state(&dir, "gamma.example.org");
    let app = peer_app(local);

    let identity = stranger.mesh.identity.get_identity().unwrap();
    let body = json!({
        "identity": identity,
        "federation_credentials": {
            "client_id": "c",
            "client_secret": "s",
            "issuer": "https://auth.gamma.example.org/application/o/x/",
            "authorization_url": "a",
            "token_url": "t",
            "userinfo_url": "u",
            "jwks_url": "j"
        },
        "signature": "00"
    });
    let (status, _) = send(&app, "POST", "/api/mesh/federation-exchange", Some(body)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn events_filter_is_validated() {
    let dir = tempfile::tempdir().unwrap();
    let app = operator_app(state(&dir, "alpha.example.org"));
    send(&app, "POST", "/api/mesh/create-invite", None).await;
    send(&app, "POST", "/api/mesh/create-invite", None).await;

    let (status, _) = send(&app, "GET", "/api/mesh/events?domain=BOGUS", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&app, "GET", "/api/mesh/events?domain=INVITE&limit=1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["events"][0]["event_type"], "INVITE_CREATED");
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let apps = apps(&state(&dir, "alpha.example.org"));

    let body = json!({ "token": "x".repeat(128 * 1024) });
    let (status, _) = send(&apps.operator, "POST", "/api/mesh/accept-invite", Some(body)).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);

    let body = json!({ "invite_id": "x".repeat(128 * 1024) });
    let (status, _) = send(&apps.peer, "POST", "/api/mesh/handshake", Some(body)).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn health_reports_counts() {
    let dir = tempfile::tempdir().unwrap();
    let app = operator_app(state(&dir, "alpha.example.org"));

    let (status, body) = send(&app, "GET", "/api/mesh/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 0);
    assert_eq!(body["peer_count"], 0);
    assert_eq!(body["domain"], "alpha.example.org");
    assert!(body["checked_at"].is_string());
}

#[tokio::test]
async fn peer_listener_serves_only_peer_paths() {
    let dir = tempfile::tempdir().unwrap();
    let apps = apps(&state(&dir, "alpha.example.org"));
    let fingerprint = "ab".repeat(32);

    for (method, uri) in [
        ("POST", "/api/mesh/create-invite".to_string()),
        ("POST", "/api/mesh/accept-invite".to_string()),
        ("GET", "/api/mesh/invites".to_string()),
        ("GET", "/api/mesh/events".to_string()),
        ("GET", "/api/mesh/peers".to_string()),
        ("GET", "/api/mesh/health".to_string()),
        ("GET", "/api/mesh/handshakes/some-job".to_string()),
        ("DELETE", format!("/api/mesh/peers/{fingerprint}")),
        ("POST", format!("/api/mesh/peers/{fingerprint}/federation")),
    ] {
        let (status, _) = send(&apps.peer, method, &uri, Some(json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{method} {uri} reachable on peer listener");
    }

    // Every proxied path is routed on the peer listener.
    for path in PEER_PATHS {
        let method = if path.ends_with("identity") || path.ends_with("ping") {
            "GET"
        } else {
            "POST"
        };
        let (status, _) = send(&apps.peer, method, path, Some(json!({}))).await;
        assert_ne!(status, StatusCode::NOT_FOUND, "{path}");
        assert_ne!(status, StatusCode::METHOD_NOT_ALLOWED, "{path}");
    }

    let (status, _) = send(&apps.operator, "POST", "/api/mesh/handshake", Some(json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cross_origin_requests_only_read_identity() {
    let dir = tempfile::tempdir().unwrap();
    let apps = apps(&state(&dir, "alpha.example.org"));

    let request = Request::builder()
        .method("POST")
        .uri("/api/mesh/create-invite")
        .header("origin", "https://evil.example")
        .body(Body::empty())
        .unwrap();
    let response = apps.operator.clone().oneshot(request).await.unwrap();
    assert!(response
        .headers()
        .get("access-control-allow-origin")
        .is_none());

    let request = Request::builder()
        .method("GET")
        .uri("/api/mesh/identity")
        .header("origin", "https://elsewhere.example")
        .body(Body::empty())
        .unwrap();
    let response = apps.peer.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("access-control-allow-origin").unwrap(),
        "*"
    );
}
