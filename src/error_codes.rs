//! Error codes for structured error handling.
//!
//! These codes travel over the relay protocol and serialize using
//! `SCREAMING_SNAKE_CASE` (e.g. `"ROOM_FULL"`). They are also what a UI shows
//! to the user: [`description()`](ErrorCode::description) is the text of the
//! dismissible notice.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Structured error codes shared by the client and a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Room errors
    RoomNotFound,
    RoomFull,
    DuplicateName,
    RoomCreationFailed,

    // Authorization
    Forbidden,

    // Validation errors
    InvalidInput,
    InvalidRoomName,
    InvalidUsername,
    InvalidCapacity,
    EmptyTrackList,
    MalformedDocument,

    // Channel errors
    ChannelUnavailable,
    PermissionDenied,
    UnknownPath,
    InternalError,
}

impl ErrorCode {
    /// Returns a human-readable description of this error code.
    pub fn description(&self) -> &'static str {
        match self {
            Self::RoomNotFound => {
                "This listening room does not exist. It may have been closed by its admin."
            }
            Self::RoomFull => {
                "This listening room is full. Ask the admin for a bigger room or try again later."
            }
            Self::DuplicateName => {
                "Someone in this room already uses that name. Pick another username."
            }
            Self::RoomCreationFailed => {
                "The room could not be created. Nothing was saved, please try again."
            }

            Self::Forbidden => "Only the admin of the room can do that.",

            Self::InvalidInput => "Some of the information you entered is invalid.",
            Self::InvalidRoomName => "The room name must contain between 1 and 50 characters.",
            Self::InvalidUsername => {
                "Usernames contain between 1 and 30 letters; digits are not allowed."
            }
            Self::InvalidCapacity => "The number of participants is outside the allowed range.",
            Self::EmptyTrackList => "Select at least one track for the room.",
            Self::MalformedDocument => "The room data received from the server is unreadable.",

            Self::ChannelUnavailable => {
                "The connection to the room was lost. Playback continues without synchronization."
            }
            Self::PermissionDenied => "The server refused this operation.",
            Self::UnknownPath => "The server does not know this room.",
            Self::InternalError => "The server ran into an error. Please try again.",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}
