//! Authentik-style identity-provider admin API.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::federation::{
    ApplicationConfig, FederationError, IdentityProviderAdmin, ObjectKind, ProviderConfig,
    SourceConfig,
};

const SOURCES_PATH: &str = "/api/v3/sources/oauth/";
const PROVIDERS_PATH: &str = "/api/v3/providers/oauth2/";
const APPLICATIONS_PATH: &str = "/api/v3/core/applications/";

/// [`IdentityProviderAdmin`] talking to the identity provider's REST API
/// with a bearer token.
#[derive(Clone)]
pub struct AuthentikAdmin {
    client: reqwest::Client,
    base_url: String,
    api_token: String,
    authorization_flow: Option<String>,
}

impl AuthentikAdmin {
    pub fn new(
        base_url: &str,
        api_token: &str,
        authorization_flow: Option<String>,
        timeout: Duration,
    ) -> Result<Self, FederationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FederationError::Api(format!("HTTP client error: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: api_token.to_string(),
            authorization_flow,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, FederationError> {
        let resp = self
            .client
            .post(self.url(path))
            .bearer_auth(&self.api_token)
            .json(body)
            .send()
            .await
            .map_err(|e| FederationError::Api(format!("POST {path}: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(FederationError::Api(format!(
                "POST {path} returned {status}: {text}"
            )));
        }
        resp.json::<Value>()
            .await
            .map_err(|e| FederationError::Api(format!("POST {path}: invalid response: {e}")))
    }
}

/// Reads an id field that the API may return as a string or a number.
fn id_field(body: &Value, field: &str) -> Result<String, FederationError> {
    match body.get(field) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(FederationError::Api(format!("response is missing {field}"))),
    }
}

fn source_body(config: &SourceConfig) -> Value {
    json!({
        "name": config.name,
        "slug": config.slug,
        "enabled": true,
        "provider_type": "openidconnect",
        "consumer_key": config.client_id,
        "consumer_secret": config.client_secret,
        "authorization_url": config.authorization_url,
        "access_token_url": config.access_token_url,
        "profile_url": config.profile_url,
        "oidc_well_known_url": config.oidc_well_known_url,
        "oidc_jwks_url": config.oidc_jwks_url,
    })
}

fn provider_body(config: &ProviderConfig, authorization_flow: Option<&str>) -> Value {
    let mut body = json!({
        "name": config.name,
        "client_type": "confidential",
        "client_id": config.client_id,
        "client_secret": config.client_secret,
        "redirect_uris": [{ "matching_mode": "strict", "url": config.redirect_uri }],
    });
    if let (Some(flow), Some(map)) = (authorization_flow, body.as_object_mut()) {
        map.insert("authorization_flow".to_string(), Value::String(flow.to_string()));
    }
    body
}

#[async_trait]
impl IdentityProviderAdmin for AuthentikAdmin {
    async fn create_source(&self, config: &SourceConfig) -> Result<String, FederationError> {
        let body = self.post(SOURCES_PATH, &source_body(config)).await?;
        id_field(&body, "slug")
    }

    async fn create_provider(&self, config: &ProviderConfig) -> Result<String, FederationError> {
        let body = provider_body(config, self.authorization_flow.as_deref());
        let resp = self.post(PROVIDERS_PATH, &body).await?;
        id_field(&resp, "pk")
    }

    async fn create_application(
        &self,
        config: &ApplicationConfig,
    ) -> Result<String, FederationError> {
        let provider: Value = config
            .provider_id
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(config.provider_id.clone()));
        let body = json!({
            "name": config.name,
            "slug": config.slug,
            "provider": provider,
        });
        let resp = self.post(APPLICATIONS_PATH, &body).await?;
        id_field(&resp, "slug")
    }

    async fn delete(&self, kind: ObjectKind, id: &str) -> Result<(), FederationError> {
        let collection = match kind {
            ObjectKind::Source => SOURCES_PATH,
            ObjectKind::Provider => PROVIDERS_PATH,
            ObjectKind::Application => APPLICATIONS_PATH,
        };
        let path = format!("{collection}{id}/");
        let resp = self
            .client
            .delete(self.url(&path))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|e| FederationError::Api(format!("DELETE {path}: {e}")))?;
        let status = resp.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(FederationError::Api(format!("DELETE {path} returned {status}")))
    }
}
