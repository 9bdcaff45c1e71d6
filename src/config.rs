//! Tunables shared by the room manager, presence tracker and sessions.
//!
//! # Example
//!
//! ```
//! use listening_room::config::RoomConfig;
//! use std::time::Duration;
//!
//! let config = RoomConfig::new("https://listen.example")
//!     .with_drift_tolerance(Duration::from_millis(500))
//!     .with_operation_timeout(Duration::from_secs(3));
//! assert_eq!(config.drift_tolerance, Duration::from_millis(500));
//! assert_eq!(config.share_url(uuid::Uuid::nil()),
//!     "https://listen.example/rooms/00000000-0000-0000-0000-000000000000");
//! ```

use std::time::Duration;

use crate::error::{ListeningRoomError, Result};
use crate::protocol::RoomId;
use crate::role::ShareLink;

/// Default minimum position discrepancy that triggers a corrective seek.
pub const DEFAULT_DRIFT_TOLERANCE: Duration = Duration::from_millis(750);

/// Default client-side timeout for a single channel or store operation.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for stopping a session's listener task.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Default capacity of a session's bounded event channel.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 64;

/// Largest room the create form accepts.
pub const DEFAULT_MAX_CAPACITY: u32 = 59;

const DEFAULT_JOIN_ATTEMPTS: u32 = 3;

// ── Retry policy ────────────────────────────────────────────────────

/// Exponential backoff applied to channel writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one. At least 1.
    pub attempts: u32,
    /// Delay before the first retry; doubled for every further retry.
    pub base_delay: Duration,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay to wait after the failed attempt number `attempt` (zero based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

// ── Name rules ──────────────────────────────────────────────────────

/// Accepted-character policy for room names and usernames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameRules {
    pub room_name_max_length: usize,
    pub username_max_length: usize,
    /// Usernames may contain letters, plus these symbols.
    pub allowed_symbols: Vec<char>,
    pub allow_digits: bool,
}

impl Default for NameRules {
    fn default() -> Self {
        Self {
            room_name_max_length: 50,
            username_max_length: 30,
            allowed_symbols: vec![' ', ',', '.', '\'', '-'],
            allow_digits: false,
        }
    }
}

impl NameRules {
    /// Room names: any characters, 1 to `room_name_max_length` of them, not blank.
    ///
    /// # Errors
    ///
    /// Returns [`ListeningRoomError::InvalidInput`] when the name is rejected.
    pub fn validate_room_name(&self, name: &str) -> Result<()> {
        let length = name.chars().count();
        if name.trim().is_empty() || length > self.room_name_max_length {
            return Err(ListeningRoomError::InvalidInput(format!(
                "room name must contain between 1 and {} characters",
                self.room_name_max_length
            )));
        }
        Ok(())
    }

    /// Usernames: letters and the allowed symbols, 1 to `username_max_length`.
    ///
    /// # Errors
    ///
    /// Returns [`ListeningRoomError::InvalidInput`] when the username is rejected.
    pub fn validate_username(&self, username: &str) -> Result<()> {
        let length = username.chars().count();
        if username.trim().is_empty() || length > self.username_max_length {
            return Err(ListeningRoomError::InvalidInput(format!(
                "username must contain between 1 and {} characters",
                self.username_max_length
            )));
        }
        if let Some(bad) = username.chars().find(|c| !self.username_char_allowed(*c)) {
            return Err(ListeningRoomError::InvalidInput(format!(
                "username contains a forbidden character: {bad:?}"
            )));
        }
        Ok(())
    }

    fn username_char_allowed(&self, c: char) -> bool {
        c.is_alphabetic()
            || (self.allow_digits && c.is_numeric())
            || self.allowed_symbols.contains(&c)
    }
}

// ── Room configuration ──────────────────────────────────────────────

/// Configuration shared by [`RoomManager`](crate::lifecycle::RoomManager) and
/// [`RoomSession`](crate::session::RoomSession).
///
/// The only required field is `base_url`, the public address share links are
/// built from; every other field has a default.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Public base URL of the listening-room site, without trailing slash.
    pub base_url: String,
    /// Minimum local/remote position gap that triggers a seek on followers.
    ///
    /// Defaults to **750 ms**.
    pub drift_tolerance: Duration,
    /// Timeout for each individual channel or store operation.
    ///
    /// Defaults to **5 seconds**. Values below 1 ms are clamped to 1 ms.
    pub operation_timeout: Duration,
    /// Backoff for channel writes.
    pub retry: RetryPolicy,
    /// How often a presence join is attempted when a concurrent writer wins.
    ///
    /// Defaults to **3**. Values below 1 are clamped to 1.
    pub join_attempts: u32,
    /// Largest capacity accepted at room creation. Defaults to **59**.
    pub max_capacity: u32,
    pub name_rules: NameRules,
    /// Capacity of each session's bounded event channel.
    ///
    /// When the consumer falls behind, events are dropped with a warning;
    /// `RoomClosed` is always delivered. Defaults to **64**.
    pub event_channel_capacity: usize,
    /// Time given to a session's listener task to stop on `leave`.
    ///
    /// Defaults to **1 second**; after that the task is aborted.
    pub shutdown_timeout: Duration,
}

impl RoomConfig {
    /// Create a configuration with the given base URL and default values.
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            drift_tolerance: DEFAULT_DRIFT_TOLERANCE,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            retry: RetryPolicy::default(),
            join_attempts: DEFAULT_JOIN_ATTEMPTS,
            max_capacity: DEFAULT_MAX_CAPACITY,
            name_rules: NameRules::default(),
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_drift_tolerance(mut self, tolerance: Duration) -> Self {
        self.drift_tolerance = tolerance;
        self
    }

    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout.max(Duration::from_millis(1));
        self
    }

    /// Set the write retry policy. `attempts` below 1 are clamped to 1.
    #[must_use]
    pub fn with_retry(mut self, mut retry: RetryPolicy) -> Self {
        retry.attempts = retry.attempts.max(1);
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_join_attempts(mut self, attempts: u32) -> Self {
        self.join_attempts = attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_max_capacity(mut self, max_capacity: u32) -> Self {
        self.max_capacity = max_capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_name_rules(mut self, rules: NameRules) -> Self {
        self.name_rules = rules;
        self
    }

    /// Set the event channel capacity. Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Shareable follower link for a room.
    pub fn share_url(&self, room_id: RoomId) -> String {
        ShareLink::follower(room_id).to_url(&self.base_url)
    }
}
