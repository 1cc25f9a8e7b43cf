use thiserror::Error;

#[derive(Debug, Error)]
pub enum JsonError {
    #[error("arguments are incomplete JSON ({received} bytes received)")]
    Incomplete { received: usize },
    #[error("arguments are not valid JSON: {0}")]
    Invalid(#[from] serde_json::Error),
    #[error("no JSON object found in text")]
    NoObject,
}

pub type Result<T> = std::result::Result<T, JsonError>;
