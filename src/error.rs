//! Error types for the listening-room client.

use thiserror::Error;

use crate::error_codes::ErrorCode;

/// Errors that can occur while creating, joining or synchronizing a room.
///
/// None of these are fatal: every variant is meant to be recovered at the UI
/// boundary, either by showing a dismissible notice or by degrading the
/// session to unsynchronized playback.
#[derive(Debug, Error)]
pub enum ListeningRoomError {
    /// The room document does not exist (never created, or already closed).
    #[error("room not found")]
    NotFound,

    /// A follower attempted an admin-only operation.
    #[error("operation requires the room admin")]
    Forbidden,

    /// The room has reached its capacity.
    #[error("room is full")]
    Full,

    /// The requested username is already present in the room.
    #[error("username is already taken in this room")]
    DuplicateName,

    /// Malformed parameters (room name, username, capacity, track list, ...).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The room state channel or the room store could not be reached.
    #[error("channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// Room creation failed part-way; prior steps were rolled back.
    #[error("room creation failed: {0}")]
    CreateFailed(String),

    /// A channel or store operation did not complete within the configured timeout.
    #[error("operation timed out")]
    Timeout,

    /// Failed to serialize or deserialize a document or relay message.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Failed to send a message through the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a message from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection was closed.
    #[error("transport connection closed")]
    TransportClosed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ListeningRoomError {
    /// Structured code for this error, suitable for user-facing notices.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound => ErrorCode::RoomNotFound,
            Self::Forbidden => ErrorCode::Forbidden,
            Self::Full => ErrorCode::RoomFull,
            Self::DuplicateName => ErrorCode::DuplicateName,
            Self::InvalidInput(_) => ErrorCode::InvalidInput,
            Self::CreateFailed(_) => ErrorCode::RoomCreationFailed,
            Self::Serialization(_) => ErrorCode::MalformedDocument,
            Self::ChannelUnavailable(_)
            | Self::Timeout
            | Self::TransportSend(_)
            | Self::TransportReceive(_)
            | Self::TransportClosed
            | Self::Io(_) => ErrorCode::ChannelUnavailable,
        }
    }

    /// Returns `true` for failures of the backend rather than of the request.
    ///
    /// Transient errors are retried for writes and degrade subscriptions to
    /// unsynchronized mode.
    pub fn is_transient(&self) -> bool {
        matches!(self.code(), ErrorCode::ChannelUnavailable)
    }
}

/// A specialized [`Result`] type for listening-room operations.
pub type Result<T> = std::result::Result<T, ListeningRoomError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn rejections_are_not_transient() {
        for err in [
            ListeningRoomError::NotFound,
            ListeningRoomError::Forbidden,
            ListeningRoomError::Full,
            ListeningRoomError::DuplicateName,
            ListeningRoomError::InvalidInput("x".into()),
            ListeningRoomError::CreateFailed("x".into()),
        ] {
            assert!(!err.is_transient(), "{err} should not be transient");
        }
    }

    #[test]
    fn backend_failures_are_transient() {
        assert!(ListeningRoomError::Timeout.is_transient());
        assert!(ListeningRoomError::TransportClosed.is_transient());
        assert!(ListeningRoomError::ChannelUnavailable("down".into()).is_transient());
    }

    #[test]
    fn codes_match_taxonomy() {
        assert_eq!(ListeningRoomError::Full.code(), ErrorCode::RoomFull);
        assert_eq!(
            ListeningRoomError::DuplicateName.code(),
            ErrorCode::DuplicateName
        );
        assert_eq!(ListeningRoomError::Timeout.code(), ErrorCode::ChannelUnavailable);
    }
}
