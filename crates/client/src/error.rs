use thiserror::Error;

/// Failures surfaced by the control channel and stream subscription.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("request rejected with status {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("invalid response payload: {0}")]
    Json(#[from] serde_json::Error),
}
