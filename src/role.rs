//! Session roles and shareable room links.
//!
//! A client's [`SessionRole`] is decided locally when it enters a room: the
//! creator arrives through a link carrying `admin=true`, everyone else
//! through the plain share link. The marker selects behavior on this client
//! only. Nothing on the backend checks it, so any participant who edits the
//! link can act as admin from their own client.

use url::Url;
use uuid::Uuid;

use crate::error::{ListeningRoomError, Result};
use crate::protocol::RoomId;

const ROOMS_SEGMENT: &str = "rooms";
const ADMIN_KEY: &str = "admin";

/// How this client takes part in a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Controls the shared playback state.
    Admin,
    /// Mirrors the shared playback state.
    Follower,
}

impl SessionRole {
    pub fn is_admin(self) -> bool {
        self == Self::Admin
    }

    /// Fails with [`ListeningRoomError::Forbidden`] unless `self` is `Admin`.
    pub fn require_admin(self) -> Result<()> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(ListeningRoomError::Forbidden)
        }
    }
}

/// A parsed `{base}/rooms/{roomId}[?admin=true]` link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShareLink {
    pub room_id: RoomId,
    pub admin: bool,
}

impl ShareLink {
    /// The link handed out to followers.
    pub fn follower(room_id: RoomId) -> Self {
        Self {
            room_id,
            admin: false,
        }
    }

    /// The link the creator is sent to after creating a room.
    pub fn admin(room_id: RoomId) -> Self {
        Self {
            room_id,
            admin: true,
        }
    }

    /// Role this link selects for the local session.
    pub fn role(&self) -> SessionRole {
        if self.admin {
            SessionRole::Admin
        } else {
            SessionRole::Follower
        }
    }

    pub fn to_url(&self, base_url: &str) -> String {
        let base = base_url.trim_end_matches('/');
        if self.admin {
            format!("{base}/{ROOMS_SEGMENT}/{}?{ADMIN_KEY}=true", self.room_id)
        } else {
            format!("{base}/{ROOMS_SEGMENT}/{}", self.room_id)
        }
    }

    /// Parse a share link.
    ///
    /// The path must end in `rooms/{roomId}`; the base URL may carry a path
    /// prefix of its own. Only the query string is searched for the marker.
    ///
    /// # Errors
    ///
    /// Returns [`ListeningRoomError::InvalidInput`] when the link is not a
    /// URL, has no `rooms/{roomId}` path, or the room id is not a UUID.
    pub fn parse(link: &str) -> Result<Self> {
        let url = Url::parse(link).map_err(|_| invalid_link(link))?;
        let segments: Vec<&str> = url
            .path_segments()
            .ok_or_else(|| invalid_link(link))?
            .filter(|segment| !segment.is_empty())
            .collect();
        let room_id = match segments.as_slice() {
            [.., ROOMS_SEGMENT, id] => Uuid::parse_str(id).map_err(|_| invalid_link(link))?,
            _ => return Err(invalid_link(link)),
        };
        let admin = url
            .query_pairs()
            .any(|(key, value)| key == ADMIN_KEY && value == "true");
        Ok(Self { room_id, admin })
    }
}

fn invalid_link(url: &str) -> ListeningRoomError {
    ListeningRoomError::InvalidInput(format!("not a room link: {url}"))
}
