use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    // Storage errors
    #[error("storage error: {0}")]
    Storage(String),

    // Configuration errors
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // Network errors
    #[error("network error: {0}")]
    Network(String),
}

// axum IntoResponse implementation
impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        use axum::Json;
        use axum::http::StatusCode;

        let status = match self {
            Error::Network(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({
            "msg": self.to_string(),
        });

        (status, Json(body)).into_response()
    }
}
