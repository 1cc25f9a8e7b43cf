use thiserror::Error;

/// Failures a provider can report. Callers downcast from `anyhow::Error` to
/// decide whether a request is worth retrying.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider `{provider}` is not configured. configured providers: {available}")]
    NotConfigured { provider: String, available: String },
    #[error("no provider configured")]
    NoneConfigured,
    #[error("provider request failed with status {status}: {detail}")]
    Status { status: u16, detail: String },
    #[error("provider request timed out: {0}")]
    Timeout(String),
    #[error("provider connection failed: {0}")]
    Connection(String),
    #[error("provider returned an empty response for model `{model}`")]
    EmptyResponse { model: String },
    #[error("provider returned malformed JSON: {0}")]
    MalformedPayload(String),
    #[error("provider error: {0}")]
    Api(String),
}

impl ProviderError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout(err.to_string())
        } else if err.is_decode() {
            ProviderError::MalformedPayload(err.to_string())
        } else if let Some(status) = err.status() {
            ProviderError::Status {
                status: status.as_u16(),
                detail: err.to_string(),
            }
        } else {
            ProviderError::Connection(err.to_string())
        }
    }
}
