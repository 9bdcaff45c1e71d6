//! Relay transport implementations.
//!
//! | Feature                | Transport              |
//! |------------------------|------------------------|
//! | (always)               | [`LoopbackTransport`]  |
//! | `transport-websocket`  | `WebSocketTransport`   |

pub mod loopback;

#[cfg(feature = "transport-websocket")]
pub mod websocket;

pub use loopback::{loopback_pair, LoopbackTransport};

#[cfg(feature = "transport-websocket")]
pub use websocket::WebSocketTransport;
