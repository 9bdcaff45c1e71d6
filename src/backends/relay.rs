//! Room state channel over a relay connection.
//!
//! [`RelayChannel`] implements [`RoomChannel`] by speaking the relay protocol
//! ([`ChannelRequest`] / [`ChannelNotice`]) over any [`Transport`]. Like a
//! transport client, it is a thin handle in front of a background loop: calls
//! are queued on an unbounded command channel, the loop writes them to the
//! transport and resolves each call when the matching acknowledgement comes
//! back.
//!
//! [`serve_channel`] is the other end: it answers relay requests from one
//! connection against any local [`RoomChannel`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::channel::{ChannelPath, ChannelUpdate, RoomChannel, UpdateReceiver};
use crate::error::{ListeningRoomError, Result};
use crate::error_codes::ErrorCode;
use crate::protocol::{ChannelNotice, ChannelRequest, RequestId, SubscriptionId};
use crate::transport::Transport;

/// Default timeout for stopping the relay loop.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Heartbeat periods without any inbound message before the relay is
/// considered gone.
const SILENT_HEARTBEATS: u32 = 2;

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`RelayChannel`].
///
/// ```
/// use listening_room::backends::relay::RelayConfig;
/// use std::time::Duration;
///
/// let config = RelayConfig::default().with_heartbeat_interval(Duration::from_secs(20));
/// assert_eq!(config.heartbeat_interval, Some(Duration::from_secs(20)));
/// ```
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Time given to the loop to close the transport on shutdown.
    pub shutdown_timeout: Duration,
    /// Send a `Ping` this often. `None` disables heartbeats.
    ///
    /// With heartbeats on, a relay that sends nothing for two periods is
    /// treated as disconnected.
    pub heartbeat_interval: Option<Duration>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            heartbeat_interval: None,
        }
    }
}

impl RelayConfig {
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Enable heartbeats. Intervals below 10 ms are clamped to 10 ms.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval.max(Duration::from_millis(10)));
        self
    }
}

// ── Client handle ───────────────────────────────────────────────────

type Reply = oneshot::Sender<Result<Option<Value>>>;

enum Command {
    /// A `Read`, `Write` or `Remove` request.
    Call { request: ChannelRequest, reply: Reply },
    Subscribe {
        request_id: RequestId,
        subscription: SubscriptionId,
        path: String,
        updates: mpsc::UnboundedSender<ChannelUpdate>,
        reply: Reply,
    },
    Unsubscribe { subscription: SubscriptionId },
}

/// A [`RoomChannel`] reached through a relay.
///
/// Request ids and subscription ids are assigned by the client, both
/// starting at 1.
pub struct RelayChannel {
    cmd_tx: mpsc::UnboundedSender<Command>,
    connected: Arc<AtomicBool>,
    next_request: AtomicU64,
    next_subscription: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    shutdown_timeout: Duration,
}

impl RelayChannel {
    /// Spawn the relay loop on `transport`. Must be called inside a tokio
    /// runtime.
    pub fn start(transport: impl Transport, config: RelayConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let connected = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(relay_loop(
            transport,
            cmd_rx,
            Arc::clone(&connected),
            shutdown_rx,
            config.heartbeat_interval,
        ));
        Self {
            cmd_tx,
            connected,
            next_request: AtomicU64::new(1),
            next_subscription: AtomicU64::new(1),
            task: Mutex::new(Some(task)),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_timeout: config.shutdown_timeout,
        }
    }

    /// `true` until the transport closes or [`shutdown`](Self::shutdown) runs.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Close the transport and stop the loop. Pending calls fail and every
    /// subscription stream ends.
    pub async fn shutdown(&self) {
        debug!("relay channel: shutdown requested");
        let shutdown_tx = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = shutdown_tx {
            let _ = tx.send(());
        }
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut task) = task {
            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => warn!("relay loop terminated with join error: {join_err}"),
                Err(_) => {
                    warn!("relay loop did not exit within timeout; aborting task");
                    task.abort();
                }
            }
        }
        self.connected.store(false, Ordering::Release);
    }

    fn next_request_id(&self) -> RequestId {
        self.next_request.fetch_add(1, Ordering::Relaxed)
    }

    async fn call(&self, command: impl FnOnce(Reply) -> Command) -> Result<Option<Value>> {
        if !self.is_connected() {
            return Err(disconnected());
        }
        let (reply, response) = oneshot::channel();
        self.cmd_tx
            .send(command(reply))
            .map_err(|_| disconnected())?;
        response.await.map_err(|_| disconnected())?
    }
}

fn disconnected() -> ListeningRoomError {
    ListeningRoomError::ChannelUnavailable("relay connection closed".into())
}

#[async_trait]
impl RoomChannel for RelayChannel {
    async fn read(&self, path: &ChannelPath) -> Result<Option<Value>> {
        let request_id = self.next_request_id();
        let path = path.to_string();
        self.call(|reply| Command::Call {
            request: ChannelRequest::Read { request_id, path },
            reply,
        })
        .await
    }

    async fn write(&self, path: &ChannelPath, value: Value) -> Result<()> {
        let request_id = self.next_request_id();
        let path = path.to_string();
        self.call(|reply| Command::Call {
            request: ChannelRequest::Write {
                request_id,
                path,
                value,
            },
            reply,
        })
        .await
        .map(drop)
    }

    async fn subscribe(&self, path: &ChannelPath) -> Result<(SubscriptionId, UpdateReceiver)> {
        let request_id = self.next_request_id();
        let subscription = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let (updates, receiver) = mpsc::unbounded_channel();
        let path = path.to_string();
        self.call(|reply| Command::Subscribe {
            request_id,
            subscription,
            path,
            updates,
            reply,
        })
        .await?;
        Ok((subscription, receiver))
    }

    fn unsubscribe(&self, subscription: SubscriptionId) {
        if self
            .cmd_tx
            .send(Command::Unsubscribe { subscription })
            .is_err()
        {
            trace!(subscription, "relay loop gone, nothing to unsubscribe");
        }
    }

    async fn remove(&self, path: &ChannelPath) -> Result<()> {
        let request_id = self.next_request_id();
        let path = path.to_string();
        self.call(|reply| Command::Call {
            request: ChannelRequest::Remove { request_id, path },
            reply,
        })
        .await
        .map(drop)
    }
}

impl std::fmt::Debug for RelayChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayChannel")
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Drop for RelayChannel {
    fn drop(&mut self) {
        let task = self
            .task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

// ── Relay loop ──────────────────────────────────────────────────────

#[derive(Default)]
struct LoopState {
    pending: HashMap<RequestId, Reply>,
    subscribers: HashMap<SubscriptionId, mpsc::UnboundedSender<ChannelUpdate>>,
    /// Subscribe requests not yet acknowledged, by request id.
    subscribing: HashMap<RequestId, SubscriptionId>,
}

impl LoopState {
    /// Apply one notice. Returns a request to send back, if any.
    fn handle(&mut self, notice: ChannelNotice) -> Option<ChannelRequest> {
        match notice {
            ChannelNotice::Ack { request_id } => {
                let subscribing = self.subscribing.remove(&request_id);
                let delivered = self.resolve(request_id, Ok(None));
                if let (Some(subscription), false) = (subscribing, delivered) {
                    // The subscribe call was cancelled; nobody owns the stream.
                    debug!(subscription, "releasing abandoned subscription");
                    self.subscribers.remove(&subscription);
                    return Some(ChannelRequest::Unsubscribe { subscription });
                }
            }
            ChannelNotice::ReadResult { request_id, value } => {
                self.resolve(request_id, Ok(value));
            }
            ChannelNotice::Value {
                subscription,
                value,
            } => self.deliver(subscription, ChannelUpdate::Value(value)),
            ChannelNotice::Removed { subscription } => {
                self.deliver(subscription, ChannelUpdate::Removed);
            }
            ChannelNotice::Error {
                request_id: Some(request_id),
                message,
                error_code,
            } => {
                if let Some(subscription) = self.subscribing.remove(&request_id) {
                    self.subscribers.remove(&subscription);
                }
                self.resolve(request_id, Err(relay_error(error_code, message)));
            }
            ChannelNotice::Error {
                request_id: None,
                message,
                error_code,
            } => warn!(?error_code, "relay reported: {message}"),
            ChannelNotice::Pong => trace!("relay pong"),
        }
        None
    }

    /// Hand `result` to the waiting caller. Returns `false` when no caller
    /// is waiting any more.
    fn resolve(&mut self, request_id: RequestId, result: Result<Option<Value>>) -> bool {
        match self.pending.remove(&request_id) {
            Some(reply) => {
                let delivered = reply.send(result).is_ok();
                if !delivered {
                    trace!(request_id, "caller gave up before the answer arrived");
                }
                delivered
            }
            None => {
                debug!(request_id, "answer for unknown request");
                false
            }
        }
    }

    fn deliver(&mut self, subscription: SubscriptionId, update: ChannelUpdate) {
        let Some(updates) = self.subscribers.get(&subscription) else {
            trace!(subscription, "update for released subscription");
            return;
        };
        if updates.send(update).is_err() {
            self.subscribers.remove(&subscription);
        }
    }

    /// Fail every outstanding call and end every subscription stream.
    fn disconnect(&mut self) {
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(disconnected()));
        }
        self.subscribers.clear();
        self.subscribing.clear();
    }
}

/// Map a relay error back to the error the backend would have raised.
fn relay_error(code: Option<ErrorCode>, message: String) -> ListeningRoomError {
    match code {
        Some(ErrorCode::PermissionDenied | ErrorCode::Forbidden) => ListeningRoomError::Forbidden,
        Some(ErrorCode::UnknownPath | ErrorCode::InvalidInput | ErrorCode::MalformedDocument) => {
            ListeningRoomError::InvalidInput(message)
        }
        _ => ListeningRoomError::ChannelUnavailable(message),
    }
}

async fn tick(heartbeat: &mut Option<tokio::time::Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Background loop multiplexing calls, heartbeats and relay notices.
///
/// Exits when the handle is dropped, on shutdown, or when the transport
/// fails or closes.
async fn relay_loop(
    mut transport: impl Transport,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    connected: Arc<AtomicBool>,
    mut shutdown_rx: oneshot::Receiver<()>,
    heartbeat_interval: Option<Duration>,
) {
    debug!("relay loop started");
    let mut state = LoopState::default();
    let mut last_inbound = tokio::time::Instant::now();
    let mut heartbeat = heartbeat_interval.map(|period| {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval
    });

    loop {
        let outgoing = tokio::select! {
            command = cmd_rx.recv() => match command {
                Some(Command::Call { request, reply }) => {
                    if let Some(request_id) = request_id_of(&request) {
                        state.pending.insert(request_id, reply);
                    }
                    request
                }
                Some(Command::Subscribe { request_id, subscription, path, updates, reply }) => {
                    state.pending.insert(request_id, reply);
                    state.subscribers.insert(subscription, updates);
                    state.subscribing.insert(request_id, subscription);
                    ChannelRequest::Subscribe { request_id, subscription, path }
                }
                Some(Command::Unsubscribe { subscription }) => {
                    if state.subscribers.remove(&subscription).is_none() {
                        continue;
                    }
                    ChannelRequest::Unsubscribe { subscription }
                }
                None => {
                    debug!("relay channel handle dropped");
                    let _ = transport.close().await;
                    break;
                }
            },

            _ = &mut shutdown_rx => {
                debug!("relay shutdown signal received");
                let _ = transport.close().await;
                break;
            }

            () = tick(&mut heartbeat) => {
                let silent_limit = heartbeat_interval.map(|period| period * SILENT_HEARTBEATS);
                if silent_limit.is_some_and(|limit| last_inbound.elapsed() > limit) {
                    warn!(silent_for = ?last_inbound.elapsed(), "relay stopped answering heartbeats");
                    let _ = transport.close().await;
                    break;
                }
                ChannelRequest::Ping
            }

            incoming = transport.recv() => {
                last_inbound = tokio::time::Instant::now();
                match incoming {
                    Some(Ok(text)) => match serde_json::from_str::<ChannelNotice>(&text) {
                        Ok(notice) => match state.handle(notice) {
                            Some(reply) => reply,
                            None => continue,
                        },
                        Err(e) => {
                            warn!("failed to decode relay notice: {e} (raw: {text})");
                            continue;
                        }
                    },
                    Some(Err(e)) => {
                        error!("relay transport receive error: {e}");
                        break;
                    }
                    None => {
                        debug!("relay closed the connection");
                        break;
                    }
                }
            }
        };

        match serde_json::to_string(&outgoing) {
            Ok(json) => {
                if let Err(e) = transport.send(json).await {
                    error!("relay transport send error: {e}");
                    break;
                }
            }
            Err(e) => error!("failed to serialize relay request: {e}"),
        }
    }

    connected.store(false, Ordering::Release);
    state.disconnect();
    debug!("relay loop exited");
}

fn request_id_of(request: &ChannelRequest) -> Option<RequestId> {
    match request {
        ChannelRequest::Read { request_id, .. }
        | ChannelRequest::Write { request_id, .. }
        | ChannelRequest::Remove { request_id, .. }
        | ChannelRequest::Subscribe { request_id, .. } => Some(*request_id),
        ChannelRequest::Unsubscribe { .. } | ChannelRequest::Ping => None,
    }
}

// ── Relay side ──────────────────────────────────────────────────────

/// Serve relay requests from one connection against `channel`.
///
/// Runs until the peer closes the connection. Subscriptions opened by the
/// peer are released when it unsubscribes or disconnects.
///
/// # Errors
///
/// Returns the transport error that ended the connection, if any.
pub async fn serve_channel(
    channel: Arc<dyn RoomChannel>,
    mut transport: impl Transport,
) -> Result<()> {
    let (notice_tx, mut notice_rx) = mpsc::unbounded_channel::<ChannelNotice>();
    let mut forwarders: HashMap<SubscriptionId, (SubscriptionId, JoinHandle<()>)> = HashMap::new();

    let outcome = loop {
        tokio::select! {
            notice = notice_rx.recv() => {
                // `notice_tx` lives in this function, the queue never closes.
                let Some(notice) = notice else { continue };
                if let Err(e) = send_notice(&mut transport, &notice).await {
                    break Err(e);
                }
            }

            incoming = transport.recv() => {
                let text = match incoming {
                    Some(Ok(text)) => text,
                    Some(Err(e)) => break Err(e),
                    None => break Ok(()),
                };
                let request = match serde_json::from_str::<ChannelRequest>(&text) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!("failed to decode relay request: {e}");
                        let notice = ChannelNotice::Error {
                            request_id: None,
                            message: e.to_string(),
                            error_code: Some(ErrorCode::MalformedDocument),
                        };
                        if let Err(e) = send_notice(&mut transport, &notice).await {
                            break Err(e);
                        }
                        continue;
                    }
                };
                let reply = answer(channel.as_ref(), request, &notice_tx, &mut forwarders).await;
                if let Some(reply) = reply {
                    if let Err(e) = send_notice(&mut transport, &reply).await {
                        break Err(e);
                    }
                }
            }
        }
    };

    for (_, (local_id, forwarder)) in forwarders.drain() {
        forwarder.abort();
        channel.unsubscribe(local_id);
    }
    let _ = transport.close().await;
    debug!("relay connection finished");
    outcome
}

async fn send_notice(transport: &mut impl Transport, notice: &ChannelNotice) -> Result<()> {
    let json = serde_json::to_string(notice)?;
    transport.send(json).await
}

fn error_notice(request_id: RequestId, error: &ListeningRoomError) -> ChannelNotice {
    let error_code = match error {
        ListeningRoomError::InvalidInput(_) => ErrorCode::UnknownPath,
        other => other.code(),
    };
    ChannelNotice::Error {
        request_id: Some(request_id),
        message: error.to_string(),
        error_code: Some(error_code),
    }
}

/// Execute one request. Returns the notice to send back, if any.
async fn answer(
    channel: &dyn RoomChannel,
    request: ChannelRequest,
    notice_tx: &mpsc::UnboundedSender<ChannelNotice>,
    forwarders: &mut HashMap<SubscriptionId, (SubscriptionId, JoinHandle<()>)>,
) -> Option<ChannelNotice> {
    let notice = match request {
        ChannelRequest::Read { request_id, path } => {
            match async { channel.read(&path.parse()?).await }.await {
                Ok(value) => ChannelNotice::ReadResult { request_id, value },
                Err(e) => error_notice(request_id, &e),
            }
        }
        ChannelRequest::Write {
            request_id,
            path,
            value,
        } => match async { channel.write(&path.parse()?, value).await }.await {
            Ok(()) => ChannelNotice::Ack { request_id },
            Err(e) => error_notice(request_id, &e),
        },
        ChannelRequest::Remove { request_id, path } => {
            match async { channel.remove(&path.parse()?).await }.await {
                Ok(()) => ChannelNotice::Ack { request_id },
                Err(e) => error_notice(request_id, &e),
            }
        }
        ChannelRequest::Subscribe {
            request_id,
            subscription,
            path,
        } => match async { channel.subscribe(&path.parse()?).await }.await {
            Ok((local_id, mut updates)) => {
                let notices = notice_tx.clone();
                let forwarder = tokio::spawn(async move {
                    while let Some(update) = updates.recv().await {
                        let notice = match update {
                            ChannelUpdate::Value(value) => ChannelNotice::Value {
                                subscription,
                                value,
                            },
                            ChannelUpdate::Removed => ChannelNotice::Removed { subscription },
                        };
                        if notices.send(notice).is_err() {
                            break;
                        }
                    }
                });
                if let Some((previous, old)) = forwarders.insert(subscription, (local_id, forwarder))
                {
                    old.abort();
                    channel.unsubscribe(previous);
                }
                ChannelNotice::Ack { request_id }
            }
            Err(e) => error_notice(request_id, &e),
        },
        ChannelRequest::Unsubscribe { subscription } => {
            if let Some((local_id, forwarder)) = forwarders.remove(&subscription) {
                forwarder.abort();
                channel.unsubscribe(local_id);
            }
            return None;
        }
        ChannelRequest::Ping => ChannelNotice::Pong,
    };
    Some(notice)
}
