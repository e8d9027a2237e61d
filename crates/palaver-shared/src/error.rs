use thiserror::Error;

/// Errors produced by the messaging core.
#[derive(Error, Debug)]
pub enum ChatError {
    /// No authenticated user session is available.
    #[error("No authenticated user")]
    Unauthenticated,

    /// Conversation, message, or profile does not exist.
    #[error("Record not found")]
    NotFound,

    /// The local user is not a participant of the conversation.
    #[error("Operation not permitted for this user")]
    PermissionDenied,

    /// A backend call failed; the caller may retry.
    #[error("Transient backend error: {0}")]
    Transient(String),

    /// Cascade deletion stopped partway.  Rows deleted by earlier stages
    /// are not re-created.
    #[error("Conversation deletion aborted at the {stage} stage: {reason}")]
    PartialCascade { stage: &'static str, reason: String },

    /// The caller passed an argument the operation cannot act on.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The conversation view has been closed and its task torn down.
    #[error("Conversation view is closed")]
    Closed,
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, ChatError>;
