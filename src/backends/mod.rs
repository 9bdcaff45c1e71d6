//! Backend implementations of the room store, room state channel and catalog.
//!
//! - [`memory`]: in-process backends with fault injection.
//! - [`relay`]: a [`RoomChannel`](crate::channel::RoomChannel) reached over a
//!   [`Transport`](crate::transport::Transport), plus the relay side that
//!   serves one.

pub mod memory;
pub mod relay;
