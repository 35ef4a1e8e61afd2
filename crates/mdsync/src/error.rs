use thiserror::Error;

/// Result type for mdsync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while serving collaborative documents
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Document not found: {id}")]
    DocumentNotFound { id: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Malformed update: {0}")]
    Replica(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Document actor stopped: {id}")]
    ActorStopped { id: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        SyncError::Protocol {
            message: message.into(),
        }
    }

    /// Whether the error means an update could not be made durable.
    ///
    /// Transports close the connection on these so the client replays.
    pub fn is_persistence(&self) -> bool {
        matches!(self, SyncError::Persistence(_))
    }
}

/// Map a lib0 decoding failure into a protocol error
pub(crate) fn decode_error(e: impl std::fmt::Display) -> SyncError {
    SyncError::protocol(format!("Failed to decode lib0 frame: {}", e))
}
