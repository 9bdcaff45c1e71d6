//! Durable storage of room documents.

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::{RoomDocument, RoomId};

/// Key-value document store holding one [`RoomDocument`] per room.
///
/// Implementations wrap whatever document database the deployment uses.
/// Every method is called under the caller's operation timeout.
#[async_trait]
pub trait RoomStore: Send + Sync + 'static {
    /// The document for `id`, or `None` if no such room exists.
    async fn get(&self, id: RoomId) -> Result<Option<RoomDocument>>;

    /// Create or replace the document for `id`.
    async fn set(&self, id: RoomId, document: RoomDocument) -> Result<()>;

    /// Delete the document for `id`. Deleting an absent document succeeds.
    async fn delete(&self, id: RoomId) -> Result<()>;

    /// Every stored room, for the join-a-room listing.
    async fn list_all(&self) -> Result<Vec<RoomDocument>>;
}
