//! Routing claims embedded in Forge invocation tokens.
//!
//! Forge hands the app a JWT whose payload carries the installation and the
//! API base the app should talk to. We only read that payload to route
//! requests; the signature segment is never checked.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Serialize;
use serde_json::Value;

/// Routing context recovered from a credential's claims.
///
/// Every field defaults to the empty string when the claim is missing or the
/// token can't be decoded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingMetadata {
    pub installation_id: String,
    pub api_base_url: String,
    pub app_id: String,
    pub environment_type: String,
    pub environment_id: String,
}

impl RoutingMetadata {
    /// True when nothing could be recovered from the token.
    pub fn is_empty(&self) -> bool {
        self.installation_id.is_empty()
            && self.api_base_url.is_empty()
            && self.app_id.is_empty()
            && self.environment_type.is_empty()
            && self.environment_id.is_empty()
    }
}

/// Decode the routing claims of `token` without verifying it.
///
/// Never fails: anything that isn't a three-segment base64url token with a
/// JSON object payload yields [`RoutingMetadata::default`].
pub fn decode_routing_claims(token: &str) -> RoutingMetadata {
    let Some(payload) = decode_payload(token) else {
        return RoutingMetadata::default();
    };

    RoutingMetadata {
        installation_id: claim_str(&payload, "/app/installationId"),
        api_base_url: claim_str(&payload, "/app/apiBaseUrl"),
        app_id: claim_str(&payload, "/app/id"),
        environment_type: claim_str(&payload, "/app/environment/type"),
        environment_id: claim_str(&payload, "/app/environment/id"),
    }
}

fn decode_payload(token: &str) -> Option<Value> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return None;
    }

    // Some issuers keep the padding, URL_SAFE_NO_PAD rejects it.
    let payload_b64 = parts[1].trim_end_matches('=');
    let payload_json = URL_SAFE_NO_PAD.decode(payload_b64).ok()?;

    serde_json::from_slice(&payload_json).ok()
}

fn claim_str(claims: &Value, pointer: &str) -> String {
    claims
        .pointer(pointer)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
pub(crate) fn encode_unsigned_token(claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.c2lnbmF0dXJl", header, payload)
}
