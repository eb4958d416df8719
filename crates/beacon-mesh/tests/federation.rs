mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use beacon_identity::SignatureProvider;
use beacon_mesh::federation::exchange_message;
use beacon_mesh::{federation_slug, FederationError, ObjectKind};
use beacon_types::{FederationCredentials, FederationExchangeRequest, FederationStatus};
use common::{Beacon, FakeIdp, Loopback};

/// Records each beacon as the other's peer without running a handshake.
fn pair(a: &Beacon, b: &Beacon) {
    a.mesh.peers.add_peer(&b.identity).unwrap();
    b.mesh.peers.add_peer(&a.identity).unwrap();
}

fn credentials(client_id: &str) -> FederationCredentials {
    FederationCredentials {
        client_id: client_id.to_string(),
        client_secret: "s3cret".to_string(),
        issuer: "https://auth.beta.example.org/application/o/mesh-x/".to_string(),
        authorization_url: "https://auth.beta.example.org/application/o/authorize/".to_string(),
        token_url: "https://auth.beta.example.org/application/o/token/".to_string(),
        userinfo_url: "https://auth.beta.example.org/application/o/userinfo/".to_string(),
        jwks_url: "https://auth.beta.example.org/application/o/mesh-x/jwks/".to_string(),
    }
}

fn signed_exchange(sender: &Beacon, client_id: &str) -> FederationExchangeRequest {
    let creds = credentials(client_id);
    let message = exchange_message(&sender.identity.fingerprint, &creds.client_id, &creds.issuer);
    FederationExchangeRequest {
        identity: sender.identity.clone(),
        signature: Some(sender.mesh.identity.signer().unwrap().sign(message.as_bytes())),
        federation_credentials: creds,
    }
}

fn count(beacon: &Beacon, event: &str) -> usize {
    beacon.audit_types().into_iter().filter(|t| *t == event).count()
}

#[tokio::test]
async fn idp_outage_marks_failed_and_retry_recovers() {
    let net = Arc::new(Loopback::default());
    let a = Beacon::with_idp(&net, "alpha.example.org", FakeIdp::failing());
    let b = Beacon::on(&net, "beta.example.org");
    pair(&a, &b);
    let b_fp = b.identity.fingerprint.clone();

    let state = a.mesh.federation.configure_peer(&b_fp).await.unwrap();
    assert_eq!(state.status, FederationStatus::Failed);
    let error = state.last_error.unwrap();
    assert!(error.contains("inbound_source"), "{error}");
    assert!(error.contains("outbound_provider"), "{error}");
    assert!(state.source_id.is_none() && state.provider_id.is_none());
    assert!(a.mesh.peers.get_peer(&b_fp).unwrap().is_some());
    assert_eq!(count(&a, "FEDERATION_FAILED"), 2);

    // B's push is authenticated; A's failing IdP is A's problem, not B's.
    let on_b = b
        .mesh
        .federation
        .configure_peer(&a.identity.fingerprint)
        .await
        .unwrap();
    assert_eq!(on_b.status, FederationStatus::Active, "{:?}", on_b.last_error);
    let on_a = a.mesh.peers.get_peer(&b_fp).unwrap().unwrap().federation.unwrap();
    assert_eq!(on_a.status, FederationStatus::Failed);
    assert!(on_a.last_error.unwrap().contains("inbound_source_exchange"));

    a.idp.fail.store(false, Ordering::SeqCst);
    let state = a.mesh.federation.retry(&b_fp).await.unwrap();
    assert_eq!(state.status, FederationStatus::Active, "{:?}", state.last_error);
    assert!(state.last_error.is_none());
    assert!(state.source_id.is_some());
    assert_eq!(
        state.application_slug.as_deref(),
        Some(federation_slug(&b_fp).as_str())
    );
}

#[tokio::test]
async fn retry_of_unknown_peer_fails() {
    let net = Arc::new(Loopback::default());
    let a = Beacon::on(&net, "alpha.example.org");
    let err = a.mesh.federation.retry(&"ab".repeat(32)).await.unwrap_err();
    assert!(matches!(err, FederationError::UnknownPeer(_)));
}

#[tokio::test]
async fn exchange_requires_a_known_signed_peer() {
    let net = Arc::new(Loopback::default());
    let a = Beacon::on(&net, "alpha.example.org");
    let b = Beacon::on(&net, "beta.example.org");
    let c = Beacon::on(&net, "gamma.example.org");
    pair(&a, &b);
    let federation = &a.mesh.federation;

    let err = federation
        .receive_credentials(signed_exchange(&c, "from-c"))
        .await
        .unwrap_err();
    assert!(matches!(err, FederationError::UnknownPeer(_)));

    let mut forged = signed_exchange(&b, "from-b");
    forged.federation_credentials.client_id = "swapped".to_string();
    let err = federation.receive_credentials(forged).await.unwrap_err();
    assert!(matches!(err, FederationError::InvalidSignature(_)));

    let mut unsigned = signed_exchange(&b, "from-b");
    unsigned.signature = None;
    let err = federation.receive_credentials(unsigned).await.unwrap_err();
    assert!(matches!(err, FederationError::InvalidSignature(_)));

    // C's key presented under B's fingerprint.
    let mut impersonated = signed_exchange(&c, "from-c");
    impersonated.identity.fingerprint = b.identity.fingerprint.clone();
    let err = federation.receive_credentials(impersonated).await.unwrap_err();
    assert!(matches!(err, FederationError::InvalidIdentity(_)));

    assert_eq!(count(&a, "FEDERATION_EXCHANGE_REJECTED"), 4);
    assert!(a.idp.sources.lock().unwrap().is_empty());
    let peer = a.mesh.peers.get_peer(&b.identity.fingerprint).unwrap().unwrap();
    assert!(peer.federation.is_none());

    federation
        .receive_credentials(signed_exchange(&b, "from-b"))
        .await
        .unwrap();
    let sources = a.idp.sources.lock().unwrap().clone();
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].client_id, "from-b");
    assert_eq!(sources[0].slug, federation_slug(&b.identity.fingerprint));
    assert_eq!(
        sources[0].oidc_well_known_url,
        "https://auth.beta.example.org/application/o/mesh-x/.well-known/openid-configuration"
    );
    assert!(count(&a, "FEDERATION_CREDENTIALS_RECEIVED") == 1);
}

#[tokio::test]
async fn repeated_exchange_replaces_inbound_source() {
    let net = Arc::new(Loopback::default());
    let a = Beacon::on(&net, "alpha.example.org");
    let b = Beacon::on(&net, "beta.example.org");
    pair(&a, &b);
    let b_fp = &b.identity.fingerprint;
    let slug = federation_slug(b_fp);

    a.mesh
        .federation
        .receive_credentials(signed_exchange(&b, "first"))
        .await
        .unwrap();
    let first = a.mesh.peers.get_peer(b_fp).unwrap().unwrap().federation.unwrap();
    assert_eq!(first.source_id.as_deref(), Some(slug.as_str()));

    // The slug is taken, so the old source has to go before the new one.
    a.mesh
        .federation
        .receive_credentials(signed_exchange(&b, "second"))
        .await
        .unwrap();
    let second = a.mesh.peers.get_peer(b_fp).unwrap().unwrap().federation.unwrap();
    assert_eq!(second.source_id.as_deref(), Some(slug.as_str()));
    assert_eq!(a.idp.live_source(&slug).unwrap().client_id, "second");
    assert!(a
        .idp
        .deleted
        .lock()
        .unwrap()
        .contains(&(ObjectKind::Source, slug.clone())));
}

#[tokio::test]
async fn exchange_during_configure_keeps_pushed_source() {
    let net = Arc::new(Loopback::default());
    let a = Beacon::on(&net, "alpha.example.org");
    let b = Beacon::on(&net, "beta.example.org");
    pair(&a, &b);
    b.idp.source_delay_ms.store(100, Ordering::SeqCst);
    let a_fp = a.identity.fingerprint.clone();
    let slug = federation_slug(&a_fp);

    let (configured, received) = tokio::join!(
        b.mesh.federation.configure_peer(&a_fp),
        b.mesh
            .federation
            .receive_credentials(signed_exchange(&a, "from-a")),
    );
    received.unwrap();
    let configured = configured.unwrap();
    assert_eq!(configured.status, FederationStatus::Active, "{:?}", configured.last_error);

    let stored = b.mesh.peers.get_peer(&a_fp).unwrap().unwrap().federation.unwrap();
    assert_eq!(stored.status, FederationStatus::Active);
    assert_eq!(stored.source_id.as_deref(), Some(slug.as_str()));
    assert_eq!(b.idp.live_source(&slug).unwrap().client_id, "from-a");
}

#[tokio::test]
async fn exchange_failure_during_configure_is_not_overwritten() {
    let net = Arc::new(Loopback::default());
    let a = Beacon::on(&net, "alpha.example.org");
    let b = Beacon::on(&net, "beta.example.org");
    pair(&a, &b);
    b.idp.source_delay_ms.store(100, Ordering::SeqCst);
    *b.idp.reject_client_id.lock().unwrap() = Some("from-a".to_string());
    let a_fp = a.identity.fingerprint.clone();

    let (configured, received) = tokio::join!(
        b.mesh.federation.configure_peer(&a_fp),
        b.mesh
            .federation
            .receive_credentials(signed_exchange(&a, "from-a")),
    );
    received.unwrap();
    let configured = configured.unwrap();
    assert_eq!(configured.status, FederationStatus::Failed);

    let stored = b.mesh.peers.get_peer(&a_fp).unwrap().unwrap().federation.unwrap();
    assert_eq!(stored.status, FederationStatus::Failed);
    let error = stored.last_error.unwrap();
    assert!(error.contains("inbound_source_exchange"), "{error}");
    assert_eq!(count(&b, "FEDERATION_CONFIGURED"), 0);
}

#[tokio::test]
async fn teardown_deletes_every_object() {
    let net = Arc::new(Loopback::default());
    let a = Beacon::on(&net, "alpha.example.org");
    let b = Beacon::on(&net, "beta.example.org");
    pair(&a, &b);
    let b_fp = b.identity.fingerprint.clone();

    let state = a.mesh.federation.configure_peer(&b_fp).await.unwrap();
    assert_eq!(state.status, FederationStatus::Active, "{:?}", state.last_error);

    let peer = a.mesh.peers.get_peer(&b_fp).unwrap().unwrap();
    assert_eq!(a.mesh.federation.teardown_peer(&peer).await, 0);

    let deleted = a.idp.deleted.lock().unwrap().clone();
    assert!(deleted.contains(&(ObjectKind::Application, federation_slug(&b_fp))));
    assert!(deleted.contains(&(ObjectKind::Provider, state.provider_id.unwrap())));
    assert!(deleted.contains(&(ObjectKind::Source, state.source_id.unwrap())));
    assert_eq!(count(&a, "FEDERATION_TORN_DOWN"), 1);
}

#[tokio::test]
async fn teardown_counts_failures_and_skips_unfederated_peers() {
    let net = Arc::new(Loopback::default());
    let a = Beacon::on(&net, "alpha.example.org");
    let b = Beacon::on(&net, "beta.example.org");
    pair(&a, &b);
    let b_fp = b.identity.fingerprint.clone();

    let bare = a.mesh.peers.get_peer(&b_fp).unwrap().unwrap();
    assert_eq!(a.mesh.federation.teardown_peer(&bare).await, 0);
    assert_eq!(count(&a, "FEDERATION_TORN_DOWN"), 0);

    a.mesh.federation.configure_peer(&b_fp).await.unwrap();
    a.idp.fail.store(true, Ordering::SeqCst);
    let peer = a.mesh.peers.get_peer(&b_fp).unwrap().unwrap();
    assert_eq!(a.mesh.federation.teardown_peer(&peer).await, 3);
}
