//! Command relay: multiplexes commands, results and events for a session.
//!
//! Each session has at most one responder connection (the host application)
//! and any number of initiator callers. Commands are admitted through the
//! broker, the scope enforcer and the rate limiter, then forwarded to the
//! responder and correlated back by `(session_id, message_id)`:
//!
//! - one-shot commands park a `oneshot` sender with a deadline;
//! - streaming commands get a monitored queue closed by a terminal chunk.
//!
//! Every correlation resolves exactly once. Revocation, responder disconnect,
//! cancellation, deadlines and abandoned waiters all remove the entry.

pub mod envelope;
mod stream;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEventType, AuditLog};
use crate::broker::{AccessBroker, BrokerError, CloseReason, Session, SessionObserver};
use crate::config::RelayConfig;
use crate::ratelimit::{RateDecision, RateLimiter};
use crate::scope::{self, Denied, Operation};

use self::envelope::{
    Command, CommandOutcome, CommandResult, Envelope, EventMessage, ResultStatus, CANCEL_ACTION,
    STREAM_END_EVENT,
};
pub use self::stream::CommandStream;
use self::stream::StreamItem;

/// Buffered uncorrelated events per session before slow subscribers lag.
const EVENT_BUFFER: usize = 64;

/// `(session_id, message_id)`.
type CorrelationKey = (String, String);

/// Deadline `timeout` from now, clamped to the latest representable instant.
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .or_else(|| now.checked_add(Duration::from_secs(u64::from(u32::MAX))))
        .unwrap_or(now)
}

/// Command relay errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    /// Authentication, quota or lookup failure from the broker.
    #[error(transparent)]
    Broker(#[from] BrokerError),
    /// The scope enforcer rejected the operation.
    #[error("operation denied: {0}")]
    Denied(#[from] Denied),
    /// The rate limiter rejected the request.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        /// Suggested wait before retrying.
        retry_after: Duration,
    },
    /// No responder is connected for the session.
    #[error("no responder connected")]
    NoResponder,
    /// No result, or no stream chunk, arrived in time.
    #[error("timed out waiting for the responder")]
    Timeout,
    /// The stream queue grew past its depth limit.
    #[error("stream queue overflow")]
    Overflow,
    /// The session was revoked or expired while the command was in flight.
    #[error("session revoked")]
    SessionRevoked,
    /// The responder connection went away while the command was in flight.
    #[error("responder disconnected")]
    Disconnected,
    /// The command was cancelled.
    #[error("command cancelled")]
    Cancelled,
    /// Another command with this id is already in flight for the session.
    #[error("duplicate in-flight message id: {0}")]
    DuplicateId(String),
    /// A stream ended with an error result from the responder.
    #[error("responder error {code}: {message}")]
    Remote {
        /// Responder's error code.
        code: String,
        /// Responder's message.
        message: String,
    },
}

impl RelayError {
    /// Stable machine-readable code for wire errors.
    pub fn code(&self) -> &str {
        match self {
            Self::Broker(err) => err.code(),
            Self::Denied(_) => "denied",
            Self::RateLimited { .. } => "rate_limited",
            Self::NoResponder => "no_responder",
            Self::Timeout => "timeout",
            Self::Overflow => "overflow",
            Self::SessionRevoked => "session_revoked",
            Self::Disconnected => "disconnected",
            Self::Cancelled => "cancelled",
            Self::DuplicateId(_) => "duplicate_id",
            Self::Remote { code, .. } => code,
        }
    }
}

/// What [`CommandRelay::deliver`] did with a responder frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// A one-shot caller received its result.
    Resolved,
    /// A chunk was queued on its stream.
    Chunk,
    /// The stream was closed by this frame.
    StreamEnded,
    /// The stream exceeded its queue depth and was failed.
    Overflow,
    /// An uncorrelated event was fanned out to this many subscribers.
    Broadcast(usize),
    /// No live correlation matched; the frame was dropped and audited.
    Orphaned,
    /// Responders may not send commands.
    Rejected,
}

/// Responder side of a registered connection.
#[derive(Debug)]
pub struct ResponderLink {
    /// Session this connection serves.
    pub session_id: String,
    /// Relay-assigned connection id; pass back to `deliver` and `unregister_responder`.
    pub connection_id: u64,
    /// Commands to write to the responder socket. Closes when the session
    /// ends or another connection replaces this one.
    pub outbound: mpsc::UnboundedReceiver<Envelope>,
}

/// Initiator side of a registered connection.
#[derive(Debug)]
pub struct InitiatorLink {
    /// Session this connection acts for.
    pub session_id: String,
    /// Relay-assigned connection id.
    pub connection_id: u64,
    /// Uncorrelated events from the responder.
    pub events: broadcast::Receiver<EventMessage>,
}

struct ResponderHandle {
    connection_id: u64,
    tx: mpsc::UnboundedSender<Envelope>,
}

struct PendingCorrelation {
    generation: u64,
    connection_id: u64,
    sender: oneshot::Sender<Result<CommandOutcome, RelayError>>,
    deadline: Instant,
}

// Manual Debug impl because oneshot::Sender doesn't carry useful state.
impl std::fmt::Debug for PendingCorrelation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCorrelation")
            .field("generation", &self.generation)
            .field("connection_id", &self.connection_id)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

struct StreamChannel {
    generation: u64,
    connection_id: u64,
    tx: mpsc::UnboundedSender<StreamItem>,
    depth: Arc<AtomicUsize>,
    deadline: Instant,
}

impl StreamChannel {
    fn fail(self, err: RelayError) {
        let _ = self.tx.send(Err(err));
    }
}

#[derive(Default)]
struct RelayState {
    responders: HashMap<String, ResponderHandle>,
    pending: HashMap<CorrelationKey, PendingCorrelation>,
    streams: HashMap<CorrelationKey, StreamChannel>,
    subscribers: HashMap<String, broadcast::Sender<EventMessage>>,
}

impl RelayState {
    fn in_flight(&self, key: &CorrelationKey) -> bool {
        self.pending.contains_key(key) || self.streams.contains_key(key)
    }

    /// Fail every correlation matching `filter` with `err`. Returns how many.
    fn fail_where(
        &mut self,
        filter: impl Fn(&CorrelationKey, u64) -> bool,
        err: &RelayError,
    ) -> usize {
        let pending: Vec<CorrelationKey> = self
            .pending
            .iter()
            .filter(|(key, p)| filter(key, p.connection_id))
            .map(|(key, _)| key.clone())
            .collect();
        let streams: Vec<CorrelationKey> = self
            .streams
            .iter()
            .filter(|(key, s)| filter(key, s.connection_id))
            .map(|(key, _)| key.clone())
            .collect();

        let mut failed = 0_usize;
        for key in pending {
            if let Some(entry) = self.pending.remove(&key) {
                let _ = entry.sender.send(Err(err.clone()));
                failed = failed.saturating_add(1);
            }
        }
        for key in streams {
            if let Some(channel) = self.streams.remove(&key) {
                channel.fail(err.clone());
                failed = failed.saturating_add(1);
            }
        }
        failed
    }
}

pub(crate) struct RelayInner {
    broker: Arc<AccessBroker>,
    limiter: Arc<RateLimiter>,
    audit: Arc<AuditLog>,
    config: RelayConfig,
    state: Mutex<RelayState>,
    next_id: AtomicU64,
}

impl RelayInner {
    fn lock_state(&self) -> MutexGuard<'_, RelayState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("relay state lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn discard_pending(&self, key: &CorrelationKey, generation: u64) {
        let mut state = self.lock_state();
        if state
            .pending
            .get(key)
            .is_some_and(|p| p.generation == generation)
        {
            state.pending.remove(key);
        }
    }

    fn discard_stream(&self, key: &CorrelationKey, generation: u64) {
        let mut state = self.lock_state();
        if state
            .streams
            .get(key)
            .is_some_and(|s| s.generation == generation)
        {
            state.streams.remove(key);
        }
    }

    fn audit_orphan(&self, session_id: &str, connection_id: u64, message_id: &str, kind: &str) {
        warn!(session_id, connection_id, message_id, kind, "orphaned responder message");
        self.audit.record(
            AuditEventType::OrphanedMessage,
            json!({
                "session_id": session_id,
                "connection_id": connection_id,
                "message_id": message_id,
                "kind": kind,
            }),
        );
    }
}

impl SessionObserver for RelayInner {
    fn session_closed(&self, session_id: &str, reason: CloseReason) {
        let (failed, had_responder) = {
            let mut state = self.lock_state();
            let had_responder = state.responders.remove(session_id).is_some();
            state.subscribers.remove(session_id);
            let failed =
                state.fail_where(|key, _| key.0 == session_id, &RelayError::SessionRevoked);
            (failed, had_responder)
        };
        if failed > 0 || had_responder {
            info!(session_id, ?reason, failed, "relay released closed session");
        }
    }
}

/// Correlates commands with responder results and streams.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CommandRelay {
    inner: Arc<RelayInner>,
}

impl std::fmt::Debug for CommandRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock_state();
        f.debug_struct("CommandRelay")
            .field("responders", &state.responders.len())
            .field("pending", &state.pending.len())
            .field("streams", &state.streams.len())
            .finish_non_exhaustive()
    }
}

/// Removes a one-shot correlation if its waiter goes away first.
struct PendingGuard<'a> {
    inner: &'a RelayInner,
    key: CorrelationKey,
    generation: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.discard_pending(&self.key, self.generation);
    }
}

impl CommandRelay {
    /// Create a relay and subscribe it to the broker's session closures.
    pub fn new(
        broker: Arc<AccessBroker>,
        limiter: Arc<RateLimiter>,
        audit: Arc<AuditLog>,
        config: RelayConfig,
    ) -> Self {
        let inner = Arc::new(RelayInner {
            broker,
            limiter,
            audit,
            config,
            state: Mutex::new(RelayState::default()),
            next_id: AtomicU64::new(1),
        });
        let observer: Arc<dyn SessionObserver> = inner.clone();
        inner.broker.add_observer(Arc::downgrade(&observer));
        Self { inner }
    }

    /// The broker this relay authenticates against.
    pub fn broker(&self) -> &Arc<AccessBroker> {
        &self.inner.broker
    }

    /// The rate limiter this relay charges.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.inner.limiter
    }

    /// Attach the responder connection for a session.
    ///
    /// A newer connection replaces an older one; the older connection's
    /// in-flight commands fail with [`RelayError::Disconnected`].
    ///
    /// # Errors
    ///
    /// [`RelayError::Broker`] with `AuthError` if the token does not resolve,
    /// [`RelayError::SessionRevoked`] if the session closed meanwhile.
    pub fn register_responder(
        &self,
        session_id: &str,
        token: &str,
    ) -> Result<ResponderLink, RelayError> {
        let session = self.inner.broker.resolve_session(session_id, token)?;
        let connection_id = self.inner.next_id();
        let (tx, rx) = mpsc::unbounded_channel();

        let replaced = {
            let mut state = self.inner.lock_state();
            if !self.inner.broker.is_active(session_id) {
                return Err(RelayError::SessionRevoked);
            }
            let previous = state
                .responders
                .insert(session_id.to_owned(), ResponderHandle { connection_id, tx });
            previous.map(|old| {
                let failed = state.fail_where(
                    |key, conn| key.0 == session_id && conn == old.connection_id,
                    &RelayError::Disconnected,
                );
                (old.connection_id, failed)
            })
        };

        if let Some((old_connection, failed)) = replaced {
            warn!(session_id, old_connection, failed, "responder replaced");
        }
        info!(session_id, connection_id, agent_id = %session.agent_id, "responder connected");
        self.inner.audit.record(
            AuditEventType::ConnectionOpened,
            json!({
                "session_id": session_id,
                "connection_id": connection_id,
                "role": "responder",
            }),
        );
        Ok(ResponderLink {
            session_id: session_id.to_owned(),
            connection_id,
            outbound: rx,
        })
    }

    /// Detach a responder connection and fail its in-flight commands with
    /// [`RelayError::Disconnected`]. The session itself stays active.
    pub fn unregister_responder(&self, session_id: &str, connection_id: u64) {
        let failed = {
            let mut state = self.inner.lock_state();
            if state
                .responders
                .get(session_id)
                .is_some_and(|r| r.connection_id == connection_id)
            {
                state.responders.remove(session_id);
            }
            state.fail_where(
                |key, conn| key.0 == session_id && conn == connection_id,
                &RelayError::Disconnected,
            )
        };
        info!(session_id, connection_id, failed, "responder disconnected");
        self.inner.audit.record(
            AuditEventType::ConnectionClosed,
            json!({
                "session_id": session_id,
                "connection_id": connection_id,
                "role": "responder",
                "failed_in_flight": failed,
            }),
        );
    }

    /// Whether a responder is attached to the session.
    pub fn has_responder(&self, session_id: &str) -> bool {
        self.inner.lock_state().responders.contains_key(session_id)
    }

    /// Attach an initiator connection: authenticates and subscribes it to
    /// the session's uncorrelated events.
    ///
    /// # Errors
    ///
    /// [`RelayError::Broker`] with `AuthError` if the token does not resolve,
    /// [`RelayError::SessionRevoked`] if the session closed meanwhile.
    pub fn open_initiator(
        &self,
        session_id: &str,
        token: &str,
    ) -> Result<InitiatorLink, RelayError> {
        self.inner.broker.resolve_session(session_id, token)?;
        let connection_id = self.inner.next_id();
        let events = {
            let mut state = self.inner.lock_state();
            // Checked under the relay lock so a concurrent close either sees
            // the sender and drops it, or we see the session gone.
            if !self.inner.broker.is_active(session_id) {
                return Err(RelayError::SessionRevoked);
            }
            state
                .subscribers
                .entry(session_id.to_owned())
                .or_insert_with(|| broadcast::channel(EVENT_BUFFER).0)
                .subscribe()
        };
        info!(session_id, connection_id, "initiator connected");
        self.inner.audit.record(
            AuditEventType::ConnectionOpened,
            json!({
                "session_id": session_id,
                "connection_id": connection_id,
                "role": "initiator",
            }),
        );
        Ok(InitiatorLink {
            session_id: session_id.to_owned(),
            connection_id,
            events,
        })
    }

    /// Record that an initiator connection closed.
    pub fn close_initiator(&self, session_id: &str, connection_id: u64) {
        info!(session_id, connection_id, "initiator disconnected");
        self.inner.audit.record(
            AuditEventType::ConnectionClosed,
            json!({
                "session_id": session_id,
                "connection_id": connection_id,
                "role": "initiator",
            }),
        );
    }

    /// Relay a one-shot command and wait for its result.
    ///
    /// # Errors
    ///
    /// Admission failures (`Broker`, `Denied`, `RateLimited`), `NoResponder`,
    /// `DuplicateId`, and the in-flight outcomes `Timeout`, `SessionRevoked`,
    /// `Disconnected` and `Cancelled`.
    pub async fn send(
        &self,
        session_id: &str,
        token: &str,
        mut command: Command,
    ) -> Result<CommandOutcome, RelayError> {
        command.stream = false;
        self.admit(session_id, token, &command)?;

        let key: CorrelationKey = (session_id.to_owned(), command.id.clone());
        let generation = self.inner.next_id();
        let timeout = self.inner.config.command_timeout();
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.lock_state();
            let connection_id = forward_target(&state, &key)?;
            state.pending.insert(
                key.clone(),
                PendingCorrelation {
                    generation,
                    connection_id,
                    sender: tx,
                    deadline: deadline_after(timeout),
                },
            );
            if let Err(err) = forward(&mut state, session_id, Envelope::Command(command)) {
                state.pending.remove(&key);
                return Err(err);
            }
            debug!(session_id, message_id = %key.1, connection_id, "command forwarded");
        }

        let guard = PendingGuard {
            inner: &self.inner,
            key,
            generation,
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped without an answer: the entry was torn down.
            Ok(Err(_)) => Err(RelayError::Disconnected),
            Err(_) => {
                warn!(session_id, message_id = %guard.key.1, "command timed out");
                Err(RelayError::Timeout)
            }
        }
    }

    /// Relay a streaming command and return its chunk sequence.
    ///
    /// # Errors
    ///
    /// Admission failures (`Broker`, `Denied`, `RateLimited`), `NoResponder`
    /// and `DuplicateId`. In-flight failures surface from the stream itself.
    pub fn stream(
        &self,
        session_id: &str,
        token: &str,
        mut command: Command,
    ) -> Result<CommandStream, RelayError> {
        command.stream = true;
        self.admit(session_id, token, &command)?;

        let key: CorrelationKey = (session_id.to_owned(), command.id.clone());
        let generation = self.inner.next_id();
        let inactivity = self.inner.config.stream_inactivity_timeout();
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        {
            let mut state = self.inner.lock_state();
            let connection_id = forward_target(&state, &key)?;
            state.streams.insert(
                key.clone(),
                StreamChannel {
                    generation,
                    connection_id,
                    tx,
                    depth: Arc::clone(&depth),
                    deadline: deadline_after(inactivity),
                },
            );
            if let Err(err) = forward(&mut state, session_id, Envelope::Command(command)) {
                state.streams.remove(&key);
                return Err(err);
            }
            debug!(session_id, message_id = %key.1, connection_id, "stream forwarded");
        }

        Ok(CommandStream::new(
            key,
            generation,
            rx,
            depth,
            inactivity,
            Arc::clone(&self.inner),
        ))
    }

    /// Route a frame received from the responder connection `connection_id`.
    pub fn deliver(&self, session_id: &str, connection_id: u64, envelope: Envelope) -> Delivery {
        match envelope {
            Envelope::Result(result) => self.deliver_result(session_id, connection_id, result),
            Envelope::Event(event) => self.deliver_event(session_id, connection_id, event),
            Envelope::Command(command) => {
                warn!(
                    session_id,
                    connection_id,
                    message_id = %command.id,
                    "responder sent a command"
                );
                Delivery::Rejected
            }
        }
    }

    fn deliver_result(
        &self,
        session_id: &str,
        connection_id: u64,
        result: CommandResult,
    ) -> Delivery {
        let key: CorrelationKey = (session_id.to_owned(), result.id.clone());
        let mut state = self.inner.lock_state();

        if state
            .pending
            .get(&key)
            .is_some_and(|p| p.connection_id == connection_id)
        {
            if let Some(entry) = state.pending.remove(&key) {
                let _ = entry.sender.send(Ok(result.into_outcome()));
            }
            return Delivery::Resolved;
        }

        if state
            .streams
            .get(&key)
            .is_some_and(|s| s.connection_id == connection_id)
        {
            if let Some(channel) = state.streams.remove(&key) {
                match result.status {
                    ResultStatus::Ok => {
                        if let Some(data) = result.data.filter(|d| !d.is_null()) {
                            let _ = channel
                                .tx
                                .send(Ok(EventMessage::new(result.id, STREAM_END_EVENT, data)));
                        }
                    }
                    ResultStatus::Error => {
                        let (code, message) = result
                            .error
                            .map(|e| (e.code, e.message))
                            .unwrap_or_else(|| ("unknown".to_owned(), String::new()));
                        channel.fail(RelayError::Remote { code, message });
                    }
                }
            }
            return Delivery::StreamEnded;
        }

        drop(state);
        self.inner
            .audit_orphan(session_id, connection_id, &result.id, "result");
        Delivery::Orphaned
    }

    fn deliver_event(&self, session_id: &str, connection_id: u64, event: EventMessage) -> Delivery {
        let key: CorrelationKey = (session_id.to_owned(), event.id.clone());
        let max_depth = self.inner.config.max_stream_queue_depth;
        let inactivity = self.inner.config.stream_inactivity_timeout();
        let mut state = self.inner.lock_state();

        let owner = state.streams.get(&key).map(|s| s.connection_id);
        match owner {
            Some(owner) if owner == connection_id => {
                let Some(channel) = state.streams.get_mut(&key) else {
                    return Delivery::Orphaned;
                };
                if channel.depth.load(Ordering::Acquire) >= max_depth {
                    if let Some(channel) = state.streams.remove(&key) {
                        channel.fail(RelayError::Overflow);
                    }
                    warn!(session_id, message_id = %key.1, max_depth, "stream queue overflow");
                    return Delivery::Overflow;
                }
                let terminal = event.is_terminal();
                channel.depth.fetch_add(1, Ordering::AcqRel);
                channel.deadline = deadline_after(inactivity);
                let consumer_gone = channel.tx.send(Ok(event)).is_err();
                if consumer_gone || terminal {
                    state.streams.remove(&key);
                    return Delivery::StreamEnded;
                }
                Delivery::Chunk
            }
            Some(_) => {
                drop(state);
                self.inner
                    .audit_orphan(session_id, connection_id, &event.id, "event");
                Delivery::Orphaned
            }
            None => {
                let receivers = state
                    .subscribers
                    .get(session_id)
                    .and_then(|tx| tx.send(event).ok())
                    .unwrap_or(0);
                debug!(session_id, receivers, "uncorrelated event broadcast");
                Delivery::Broadcast(receivers)
            }
        }
    }

    /// Cancel an in-flight command.
    ///
    /// The waiter receives [`RelayError::Cancelled`] and the responder is sent
    /// a best-effort `cancel` command. Returns `false` if nothing was in
    /// flight under that id.
    pub fn cancel(&self, session_id: &str, message_id: &str) -> bool {
        let key: CorrelationKey = (session_id.to_owned(), message_id.to_owned());
        let mut state = self.inner.lock_state();

        let found = if let Some(entry) = state.pending.remove(&key) {
            let _ = entry.sender.send(Err(RelayError::Cancelled));
            true
        } else if let Some(channel) = state.streams.remove(&key) {
            channel.fail(RelayError::Cancelled);
            true
        } else {
            false
        };

        if found {
            let notice = Command::new(
                Uuid::new_v4().to_string(),
                CANCEL_ACTION,
                json!({ "id": message_id }),
            );
            if forward(&mut state, session_id, Envelope::Command(notice)).is_err() {
                debug!(session_id, message_id, "cancel notice not delivered");
            }
            info!(session_id, message_id, "command cancelled");
        }
        found
    }

    /// Fail every correlation whose deadline has passed with
    /// [`RelayError::Timeout`], including ones nobody is polling.
    ///
    /// Returns the number of correlations discarded.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.inner.lock_state();
        let due_pending: Vec<CorrelationKey> = state
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        let due_streams: Vec<CorrelationKey> = state
            .streams
            .iter()
            .filter(|(_, s)| s.deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();

        let mut swept = 0_usize;
        for key in due_pending {
            if let Some(entry) = state.pending.remove(&key) {
                let _ = entry.sender.send(Err(RelayError::Timeout));
                swept = swept.saturating_add(1);
            }
        }
        for key in due_streams {
            if let Some(channel) = state.streams.remove(&key) {
                channel.fail(RelayError::Timeout);
                swept = swept.saturating_add(1);
            }
        }
        if swept > 0 {
            info!(swept, "expired relay correlations swept");
        }
        swept
    }

    /// Number of one-shot commands and streams in flight.
    pub fn in_flight(&self) -> usize {
        let state = self.inner.lock_state();
        state.pending.len().saturating_add(state.streams.len())
    }

    /// Authenticate, authorize, rate-limit and count one command.
    fn admit(
        &self,
        session_id: &str,
        token: &str,
        command: &Command,
    ) -> Result<Session, RelayError> {
        let inner = &self.inner;
        let session = inner.broker.resolve_session(session_id, token)?;

        let decision = Operation::from_command(command)
            .and_then(|op| scope::authorize(&session, &op).map(|()| op));
        if let Err(denied) = decision {
            warn!(session_id, action = %command.action, reason = %denied, "operation denied");
            inner.audit.record(
                AuditEventType::ScopeDenied,
                json!({
                    "session_id": session_id,
                    "agent_id": session.agent_id,
                    "message_id": command.id,
                    "action": command.action,
                    "reason": denied.to_string(),
                }),
            );
            return Err(denied.into());
        }

        if let RateDecision::Denied {
            kind,
            reason,
            retry_after,
        } = inner.limiter.check(&session.agent_id, command.token_cost())
        {
            warn!(
                session_id,
                agent_id = %session.agent_id,
                limit = kind.label(),
                %reason,
                "rate limited"
            );
            inner.audit.record(
                AuditEventType::RateLimited,
                json!({
                    "session_id": session_id,
                    "agent_id": session.agent_id,
                    "message_id": command.id,
                    "limit": kind.label(),
                    "reason": reason,
                    "retry_after_ms": u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
                }),
            );
            return Err(RelayError::RateLimited { retry_after });
        }

        Ok(inner.broker.record_activity(session_id)?)
    }
}

/// Responder connection to forward to, if the id is free.
fn forward_target(state: &RelayState, key: &CorrelationKey) -> Result<u64, RelayError> {
    let responder = state
        .responders
        .get(&key.0)
        .ok_or(RelayError::NoResponder)?;
    if state.in_flight(key) {
        return Err(RelayError::DuplicateId(key.1.clone()));
    }
    Ok(responder.connection_id)
}

/// Queue a frame for the session's responder; drops a dead handle.
fn forward(state: &mut RelayState, session_id: &str, envelope: Envelope) -> Result<(), RelayError> {
    let sent = state
        .responders
        .get(session_id)
        .map(|r| r.tx.send(envelope).is_ok());
    match sent {
        Some(true) => Ok(()),
        Some(false) => {
            state.responders.remove(session_id);
            Err(RelayError::NoResponder)
        }
        None => Err(RelayError::NoResponder),
    }
}
