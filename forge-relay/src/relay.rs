//! Outbound comment relay.
//!
//! A relay never fails from the caller's point of view: every outcome is
//! folded into a [`RelayOutcome`] whose `error` describes what went wrong.

use crate::error::{Error, Result};
use http::HeaderValue;
use http::header::{ACCEPT, AUTHORIZATION};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::time::Duration;

/// Comment action as posted by the host app.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentRequest {
    pub issue_id_or_key: String,
    pub comment_content: String,
}

impl CommentRequest {
    /// Parse a request body, coercing anything unusable to empty strings.
    ///
    /// A body that isn't JSON, or fields that aren't strings, are not errors.
    pub fn from_body(body: &[u8]) -> Self {
        let value: Value = serde_json::from_slice(body).unwrap_or(Value::Null);

        Self {
            issue_id_or_key: string_field(&value, "issueIdOrKey"),
            comment_content: string_field(&value, "commentContent"),
        }
    }
}

fn string_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Jira REST v3 comment endpoint under `base`.
pub fn comment_url(base: &str, issue_id_or_key: &str) -> String {
    format!(
        "{}/rest/api/3/issue/{}/comment",
        base.trim_end_matches('/'),
        urlencoding::encode(issue_id_or_key)
    )
}

/// Atlassian Document Format body holding a single text paragraph.
pub fn adf_comment(text: &str) -> Value {
    json!({
        "body": {
            "type": "doc",
            "version": 1,
            "content": [
                {
                    "type": "paragraph",
                    "content": [
                        { "type": "text", "text": text }
                    ]
                }
            ]
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Downstream answered with a non-2xx status.
    Response,
    /// The request went out but nothing usable came back.
    NoResponse,
    /// The request could not be built.
    RequestConstruction,
}

/// What was sent, for failures where no response arrived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestDescription {
    pub method: String,
    pub url: String,
}

/// Structured downstream failure. Serializes to `{}` when nothing failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RelayError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestDescription>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RelayError {
    pub fn response(status: u16, data: Value, headers: BTreeMap<String, String>) -> Self {
        Self {
            kind: Some(FailureKind::Response),
            status: Some(status),
            data: Some(data),
            headers: Some(headers),
            message: Some(format!("downstream responded with status {}", status)),
            ..Default::default()
        }
    }

    pub fn no_response(request: RequestDescription, message: impl Into<String>) -> Self {
        Self {
            kind: Some(FailureKind::NoResponse),
            request: Some(request),
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn request_construction(message: impl Into<String>) -> Self {
        Self {
            kind: Some(FailureKind::RequestConstruction),
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.kind.is_none()
    }
}

/// Result of one downstream call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelayOutcome {
    /// Body of a 2xx response.
    pub raw_response: Option<Value>,
    pub error: RelayError,
}

impl RelayOutcome {
    fn failed(error: RelayError) -> Self {
        Self {
            raw_response: None,
            error,
        }
    }
}

/// Sends comments downstream with a captured bearer credential.
#[derive(Debug, Clone)]
pub struct RelayClient {
    http: reqwest::Client,
}

impl RelayClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Network(e.to_string()))?;

        Ok(Self { http })
    }

    /// POST `comment` to `url` authenticated as `credential`.
    pub async fn post_comment(&self, url: &str, credential: &str, comment: &str) -> RelayOutcome {
        let auth = match HeaderValue::from_str(&format!("Bearer {}", credential)) {
            Ok(v) => v,
            Err(e) => {
                return RelayOutcome::failed(RelayError::request_construction(format!(
                    "invalid credential for Authorization header: {}",
                    e
                )));
            }
        };

        let request = match self
            .http
            .post(url)
            .header(AUTHORIZATION, auth)
            .header(ACCEPT, "application/json")
            .json(&adf_comment(comment))
            .build()
        {
            Ok(req) => req,
            Err(e) => return RelayOutcome::failed(RelayError::request_construction(e.to_string())),
        };

        let description = RequestDescription {
            method: request.method().to_string(),
            url: request.url().to_string(),
        };

        let response = match self.http.execute(request).await {
            Ok(resp) => resp,
            Err(e) if e.is_builder() => {
                return RelayOutcome::failed(RelayError::request_construction(e.to_string()));
            }
            Err(e) => {
                tracing::warn!(url = %description.url, error = %e, "no response from downstream");
                return RelayOutcome::failed(RelayError::no_response(description, e.to_string()));
            }
        };

        let status = response.status();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let body = match response.bytes().await {
            Ok(bytes) => parse_body(&bytes),
            Err(e) => {
                tracing::warn!(url = %description.url, error = %e, "downstream body read failed");
                return RelayOutcome::failed(RelayError::no_response(description, e.to_string()));
            }
        };

        if status.is_success() {
            tracing::info!(url = %description.url, status = status.as_u16(), "comment relayed");
            RelayOutcome {
                raw_response: Some(body),
                error: RelayError::default(),
            }
        } else {
            tracing::warn!(
                url = %description.url,
                status = status.as_u16(),
                "downstream rejected comment"
            );
            RelayOutcome::failed(RelayError::response(status.as_u16(), body, headers))
        }
    }
}

/// JSON when it parses, the raw text otherwise, `null` when empty.
fn parse_body(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permissive_body_parsing() {
        let req = CommentRequest::from_body(br#"{"issueIdOrKey":"X-1","commentContent":"hi"}"#);
        assert_eq!(req.issue_id_or_key, "X-1");
        assert_eq!(req.comment_content, "hi");

        let req = CommentRequest::from_body(br#"{"issueIdOrKey":7,"commentContent":["hi"]}"#);
        assert_eq!(req, CommentRequest::default());

        let req = CommentRequest::from_body(b"definitely not json");
        assert_eq!(req, CommentRequest::default());

        let req = CommentRequest::from_body(b"");
        assert_eq!(req, CommentRequest::default());
    }

    #[test]
    fn comment_url_appends_rest_path() {
        assert_eq!(
            comment_url("https://api.example", "X-1"),
            "https://api.example/rest/api/3/issue/X-1/comment"
        );
        assert_eq!(
            comment_url("https://tenant.atlassian.net/", "10042"),
            "https://tenant.atlassian.net/rest/api/3/issue/10042/comment"
        );
    }

    #[test]
    fn comment_url_escapes_issue_key() {
        assert_eq!(
            comment_url("https://api.example", "../admin?x=1"),
            "https://api.example/rest/api/3/issue/..%2Fadmin%3Fx%3D1/comment"
        );
    }

    #[test]
    fn empty_error_serializes_as_empty_object() {
        let value = serde_json::to_value(RelayError::default()).unwrap();
        assert_eq!(value, json!({}));
    }

    #[test]
    fn response_error_shape() {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        let err = RelayError::response(401, json!({"message": "Unauthorized"}), headers);

        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["kind"], "response");
        assert_eq!(value["status"], 401);
        assert_eq!(value["data"]["message"], "Unauthorized");
        assert_eq!(value["headers"]["content-type"], "application/json");
        assert!(value.get("request").is_none());
    }

    #[test]
    fn body_parsing_falls_back_to_text() {
        assert_eq!(parse_body(b""), Value::Null);
        assert_eq!(parse_body(br#"{"id":"1"}"#), json!({"id": "1"}));
        assert_eq!(parse_body(b"<html>oops</html>"), json!("<html>oops</html>"));
    }

    #[tokio::test]
    async fn unparseable_url_is_a_construction_failure() {
        let client = RelayClient::new(Duration::from_secs(2)).unwrap();
        let outcome = client.post_comment("not a url", "tok", "hi").await;

        assert_eq!(outcome.error.kind, Some(FailureKind::RequestConstruction));
        assert!(outcome.raw_response.is_none());
    }

    #[tokio::test]
    async fn control_characters_in_credential_are_a_construction_failure() {
        let client = RelayClient::new(Duration::from_secs(2)).unwrap();
        let outcome = client
            .post_comment("http://127.0.0.1:1/x", "tok\nevil: 1", "hi")
            .await;

        assert_eq!(outcome.error.kind, Some(FailureKind::RequestConstruction));
    }

    #[tokio::test]
    async fn unreachable_host_is_a_no_response_failure() {
        // Grab a free port, then close it so nothing is listening.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = RelayClient::new(Duration::from_secs(2)).unwrap();
        let url = comment_url(&format!("http://{}", addr), "X-1");
        let outcome = client.post_comment(&url, "tok", "hi").await;

        assert_eq!(outcome.error.kind, Some(FailureKind::NoResponse));
        let request = outcome.error.request.unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(request.url, url);
    }
}
