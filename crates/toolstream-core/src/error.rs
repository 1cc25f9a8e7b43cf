use thiserror::Error;

use toolstream_tools::CallValidationError;
use toolstream_types::ToolCall;

use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum ToolStreamError {
    #[error("tool call `{0}` was already started")]
    DuplicateStart(String),
    #[error("tool call `{0}` was never started")]
    UnknownCall(String),
    #[error("tool call `{0}` already finished")]
    AlreadyFinished(String),
    #[error("tool call `{}` rejected: {reason}", .call.id)]
    Rejected {
        call: ToolCall,
        #[source]
        reason: CallValidationError,
    },
    #[error("model returned neither text nor tool calls")]
    EmptyTurn,
    #[error("turn cancelled")]
    Cancelled,
    #[error(transparent)]
    Storage(#[from] StorageError),
}
