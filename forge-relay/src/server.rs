use crate::{
    claims::decode_routing_claims,
    config::{RelayConfig, RoutingPolicy},
    error::{Error, Result},
    relay::{CommentRequest, RelayClient, RelayError, comment_url},
    store::{Channel, CredentialLedger, CredentialRecord, NewCredential},
};
use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, Uri, header::AUTHORIZATION},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

const DIAGNOSTIC_HEADER_PREFIX: &str = "x-forge-oauth-";

/// Captures bearer credentials from the Forge host app and relays comment
/// actions downstream with the latest one.
#[derive(Clone)]
pub struct RelayServer<L>
where
    L: CredentialLedger + Clone,
{
    config: RelayConfig,
    ledger: Arc<L>,
    client: RelayClient,
}

impl<L> RelayServer<L>
where
    L: CredentialLedger + Clone + 'static,
{
    /// Create a new relay server builder.
    pub fn builder() -> RelayServerBuilder<L> {
        RelayServerBuilder::default()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<L> {
        &self.ledger
    }

    /// Create the axum router with the capture and relay endpoints.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(handle_root))
            .route("/forge-token", get(handle_capture_legacy))
            .route("/forge-token-2", get(handle_capture_successor))
            .route("/forge-comment", post(handle_comment))
            .route("/forge-direct-comment", post(handle_direct_comment))
            .with_state(self.clone())
    }

    /// Append the request's bearer credential to `channel`'s ledger.
    ///
    /// Persistence is best effort: a storage failure is logged and the
    /// captured value is still returned.
    pub async fn capture(&self, channel: Channel, headers: &HeaderMap) -> String {
        let token = bearer_token(headers);

        let credential = match channel {
            Channel::Legacy => NewCredential::Legacy {
                value: token.clone(),
            },
            Channel::Successor => {
                log_diagnostic_headers(headers);
                let routing = decode_routing_claims(&token);
                if routing.is_empty() && !token.is_empty() {
                    tracing::debug!("no routing claims recovered from captured token");
                }
                NewCredential::Routed {
                    value: token.clone(),
                    routing,
                }
            }
        };

        match self.ledger.record(credential).await {
            Ok(record) => tracing::info!(
                channel = %channel,
                token_len = token.len(),
                captured_at = %record.captured_at(),
                "captured credential"
            ),
            Err(e) => tracing::error!(
                channel = %channel,
                error = %e,
                "failed to persist captured credential"
            ),
        }

        token
    }

    /// Latest credential on `channel`. Storage failures read as "nothing
    /// captured yet".
    pub async fn resolve_credential(&self, channel: Channel) -> Option<CredentialRecord> {
        match self.ledger.most_recent(channel).await {
            Ok(record) => {
                if record.is_none() {
                    tracing::warn!(channel = %channel, "no credential captured yet, relaying with empty token");
                }
                record
            }
            Err(e) => {
                tracing::error!(channel = %channel, error = %e, "failed to read latest credential");
                None
            }
        }
    }

    /// Downstream base for a tenant relay using `record`.
    fn tenant_base(&self, record: Option<&CredentialRecord>) -> String {
        let claimed = match self.config.routing_policy {
            RoutingPolicy::TrustClaims => record
                .and_then(CredentialRecord::routing)
                .map(|r| r.api_base_url.as_str())
                .filter(|base| !base.is_empty()),
            RoutingPolicy::StaticOnly => None,
        };

        claimed
            .map(str::to_string)
            .unwrap_or_else(|| self.config.site_url.as_str().to_string())
    }

    /// Relay `request` with the latest credential on `channel`.
    pub async fn relay(
        &self,
        channel: Channel,
        target: RelayTarget,
        request: CommentRequest,
    ) -> RelayResponse {
        let record = self.resolve_credential(channel).await;
        let token = record
            .as_ref()
            .map(|r| r.value().to_string())
            .unwrap_or_default();

        let base = match target {
            RelayTarget::Tenant => self.tenant_base(record.as_ref()),
            RelayTarget::Diagnostic => self.config.diagnostic_url.as_str().to_string(),
        };
        let request_url = comment_url(&base, &request.issue_id_or_key);

        tracing::info!(
            channel = %channel,
            issue = %request.issue_id_or_key,
            url = %request_url,
            "relaying comment"
        );

        let outcome = self
            .client
            .post_comment(&request_url, &token, &request.comment_content)
            .await;

        RelayResponse {
            channel,
            token,
            issue_id_or_key: request.issue_id_or_key,
            comment_content: request.comment_content,
            request_url,
            error: outcome.error,
            raw_response_data: outcome.raw_response,
        }
    }

    /// Channel for a relay request: `?channel=` if it names one, otherwise
    /// the configured default.
    fn relay_channel(&self, uri: &Uri) -> Channel {
        let requested = uri.query().and_then(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .find(|(k, _)| k == "channel")
                .map(|(_, v)| v.into_owned())
        });

        match requested {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                tracing::debug!(requested = %raw, "ignoring unknown relay channel");
                self.config.default_channel
            }),
            None => self.config.default_channel,
        }
    }
}

/// Where a relay is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayTarget {
    /// The tenant's API: the claimed `apiBaseUrl` or the configured site.
    Tenant,
    /// The fixed diagnostic endpoint.
    Diagnostic,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptureResponse {
    pub ok: &'static str,
    pub token: String,
}

/// Relay response envelope. Always sent with status 200; failures are
/// reported through `error`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayResponse {
    pub channel: Channel,
    pub token: String,
    pub issue_id_or_key: String,
    pub comment_content: String,
    pub request_url: String,
    pub error: RelayError,
    pub raw_response_data: Option<Value>,
}

// handler functions

async fn handle_root() -> &'static str {
    "Hello World!"
}

async fn handle_capture_legacy<L>(
    State(server): State<RelayServer<L>>,
    headers: HeaderMap,
) -> Response
where
    L: CredentialLedger + Clone + 'static,
{
    let token = server.capture(Channel::Legacy, &headers).await;
    Json(CaptureResponse { ok: "ok", token }).into_response()
}

async fn handle_capture_successor<L>(
    State(server): State<RelayServer<L>>,
    headers: HeaderMap,
) -> Response
where
    L: CredentialLedger + Clone + 'static,
{
    let token = server.capture(Channel::Successor, &headers).await;
    Json(CaptureResponse { ok: "ok", token }).into_response()
}

async fn handle_comment<L>(State(server): State<RelayServer<L>>, uri: Uri, body: Bytes) -> Response
where
    L: CredentialLedger + Clone + 'static,
{
    let channel = server.relay_channel(&uri);
    let request = CommentRequest::from_body(&body);
    Json(server.relay(channel, RelayTarget::Tenant, request).await).into_response()
}

async fn handle_direct_comment<L>(
    State(server): State<RelayServer<L>>,
    uri: Uri,
    body: Bytes,
) -> Response
where
    L: CredentialLedger + Clone + 'static,
{
    let channel = server.relay_channel(&uri);
    let request = CommentRequest::from_body(&body);
    Json(server.relay(channel, RelayTarget::Diagnostic, request).await).into_response()
}

// helpers

/// Credential from `Authorization: Bearer <value>`, or `""` if the header is
/// missing, not UTF-8, or uses another scheme.
pub fn bearer_token(headers: &HeaderMap) -> String {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default()
        .to_string()
}

fn log_diagnostic_headers(headers: &HeaderMap) {
    for (name, value) in headers.iter() {
        if name.as_str().starts_with(DIAGNOSTIC_HEADER_PREFIX) {
            tracing::debug!(header = %name, len = value.len(), "forge oauth header present");
        }
    }
}

/// Builder for [`RelayServer`]
pub struct RelayServerBuilder<L>
where
    L: CredentialLedger + Clone,
{
    config: Option<RelayConfig>,
    ledger: Option<Arc<L>>,
}

impl<L> Default for RelayServerBuilder<L>
where
    L: CredentialLedger + Clone,
{
    fn default() -> Self {
        Self {
            config: None,
            ledger: None,
        }
    }
}

impl<L> RelayServerBuilder<L>
where
    L: CredentialLedger + Clone + 'static,
{
    pub fn config(mut self, config: RelayConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn ledger(mut self, ledger: Arc<L>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn build(self) -> Result<RelayServer<L>> {
        let config = self
            .config
            .ok_or_else(|| Error::InvalidConfig("config is required".to_string()))?;
        let ledger = self
            .ledger
            .ok_or_else(|| Error::InvalidConfig("ledger is required".to_string()))?;
        let client = RelayClient::new(config.downstream_timeout)?;

        Ok(RelayServer {
            config,
            ledger,
            client,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::{RoutingMetadata, encode_unsigned_token};
    use crate::store::MemoryLedger;
    use axum::http::HeaderValue;
    use serde_json::json;

    fn server(policy: RoutingPolicy) -> RelayServer<MemoryLedger> {
        let config = RelayConfig::new(url::Url::parse("https://site.example").unwrap())
            .with_routing_policy(policy);
        RelayServer::builder()
            .config(config)
            .ledger(Arc::new(MemoryLedger::new()))
            .build()
            .unwrap()
    }

    fn auth(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn bearer_extraction() {
        assert_eq!(bearer_token(&auth("Bearer abc123")), "abc123");
        assert_eq!(bearer_token(&auth("Basic dXNlcjpwYXNz")), "");
        assert_eq!(bearer_token(&auth("Bearer")), "");
        assert_eq!(bearer_token(&HeaderMap::new()), "");
    }

    #[test]
    fn builder_requires_ledger() {
        let result = RelayServer::<MemoryLedger>::builder()
            .config(RelayConfig::new(url::Url::parse("https://site.example").unwrap()))
            .build();
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn successor_capture_persists_routing() {
        let server = server(RoutingPolicy::TrustClaims);
        let token = encode_unsigned_token(&json!({
            "app": { "installationId": "INST1", "apiBaseUrl": "https://api.example" }
        }));

        let captured = server
            .capture(Channel::Successor, &auth(&format!("Bearer {}", token)))
            .await;
        assert_eq!(captured, token);

        let record = server.resolve_credential(Channel::Successor).await.unwrap();
        assert_eq!(record.value(), token);
        let routing = record.routing().unwrap();
        assert_eq!(routing.installation_id, "INST1");
        assert_eq!(routing.api_base_url, "https://api.example");
        assert!(server.ledger().most_recent(Channel::Legacy).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tenant_base_honours_policy() {
        let record = NewCredential::Routed {
            value: "t".into(),
            routing: RoutingMetadata {
                api_base_url: "https://api.example".into(),
                ..Default::default()
            },
        }
        .stamp(chrono::Utc::now());

        let trusting = server(RoutingPolicy::TrustClaims);
        assert_eq!(trusting.tenant_base(Some(&record)), "https://api.example");
        assert_eq!(trusting.tenant_base(None), "https://site.example/");

        let strict = server(RoutingPolicy::StaticOnly);
        assert_eq!(strict.tenant_base(Some(&record)), "https://site.example/");
    }

    #[test]
    fn relay_channel_query_override() {
        let server = server(RoutingPolicy::TrustClaims);
        let uri = |s: &str| s.parse::<Uri>().unwrap();

        assert_eq!(server.relay_channel(&uri("/forge-comment")), Channel::Legacy);
        assert_eq!(
            server.relay_channel(&uri("/forge-comment?channel=successor")),
            Channel::Successor
        );
        assert_eq!(
            server.relay_channel(&uri("/forge-comment?channel=bogus")),
            Channel::Legacy
        );
    }
}
