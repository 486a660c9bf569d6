//! Access broker: access requests, approvals and session lifecycle.
//!
//! The broker is the single owner of the request and session tables. Callers
//! go through its methods only, which keeps the lifecycle rules in one place:
//!
//! - `AccessRequest`: `pending → approved | denied`, exactly once.
//! - `Session`: `active → expired | revoked`, never back to `active`.
//! - `approved_scopes` is always a subset of the request's `scopes`.
//! - `expires_at` is fixed at approval; activity never extends it.
//!
//! Every transition writes one audit record. Session closure is also pushed to
//! registered [`SessionObserver`]s (the command relay) so in-flight work can be
//! failed promptly.

pub mod token;

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{AuditEventType, AuditLog};
use crate::config::BrokerConfig;
use crate::scope::{is_known_scope, normalize_lexically};

use self::token::{generate_token, TokenHash};

/// How long closed sessions stay listed before the sweep forgets them.
const RETIRED_RETENTION_SECS: i64 = 3600;

/// Upper bound on any TTL (ten years), keeping date arithmetic in range.
const MAX_TTL_SECS: i64 = 315_360_000;

/// Lifecycle state of an access request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Awaiting a decision.
    Pending,
    /// Approved; a session was issued.
    Approved,
    /// Denied; terminal.
    Denied,
}

/// An agent's request for scoped access.
#[derive(Debug, Clone, Serialize)]
pub struct AccessRequest {
    /// Unique request identifier.
    pub request_id: String,
    /// Agent asking for access.
    pub agent_id: String,
    /// Requested capability scopes.
    pub scopes: BTreeSet<String>,
    /// Requested filesystem roots (normalized, absolute).
    pub roots: BTreeSet<PathBuf>,
    /// Free-text justification shown to the approver.
    pub reason: String,
    /// Current status.
    pub status: RequestStatus,
    /// When the request was submitted.
    pub created_at: DateTime<Utc>,
    /// When the request was approved or denied.
    pub decided_at: Option<DateTime<Utc>>,
    /// Approver's reason for a denial.
    pub decision_reason: Option<String>,
    /// Session issued on approval.
    pub session_id: Option<String>,
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Usable until `expires_at`.
    Active,
    /// Reached its TTL.
    Expired,
    /// Closed by an explicit revoke.
    Revoked,
}

/// A time-limited grant of scopes and roots to one agent.
///
/// This is a snapshot; the broker owns the live record.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    /// Unique session identifier.
    pub session_id: String,
    /// Request this session was issued for.
    pub request_id: String,
    /// Agent holding the session.
    pub agent_id: String,
    /// Scopes granted by the approver.
    pub approved_scopes: BTreeSet<String>,
    /// Roots file operations must stay under.
    pub allowed_roots: BTreeSet<PathBuf>,
    /// When the session was issued.
    pub created_at: DateTime<Utc>,
    /// Fixed expiry instant.
    pub expires_at: DateTime<Utc>,
    /// Last relayed command.
    pub last_activity: DateTime<Utc>,
    /// Relayed commands so far.
    pub request_count: u64,
    /// Current status.
    pub status: SessionStatus,
    /// When the session left the active set.
    pub closed_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Whether `scope` was granted.
    pub fn has_scope(&self, scope: &str) -> bool {
        self.approved_scopes.contains(scope)
    }

    /// Whether the TTL has elapsed at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// A freshly issued session together with its raw token.
///
/// The token is only ever available here.
#[derive(Clone)]
pub struct IssuedSession {
    /// The new session.
    pub session: Session,
    /// Raw bearer token for the transport handshake.
    pub token: String,
}

impl std::fmt::Debug for IssuedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedSession")
            .field("session", &self.session)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Why a session left the active set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Explicit revoke.
    Revoked,
    /// TTL elapsed.
    Expired,
}

/// Receives session-closure notifications from the broker.
///
/// Called synchronously, outside the broker's lock.
pub trait SessionObserver: Send + Sync {
    /// `session_id` is no longer active.
    fn session_closed(&self, session_id: &str, reason: CloseReason);
}

/// Access broker errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    /// A scope is not in the catalog, or not part of the original request.
    #[error("invalid scope: {0}")]
    InvalidScope(String),
    /// A root is not an absolute path.
    #[error("invalid root: {0}")]
    InvalidRoot(String),
    /// A TTL of zero was requested.
    #[error("session TTL must be greater than zero")]
    InvalidTtl,
    /// No request or session with this id.
    #[error("not found: {0}")]
    NotFound(String),
    /// The request was already approved or denied.
    #[error("request {request_id} already decided ({status:?})")]
    AlreadyDecided {
        /// The request id.
        request_id: String,
        /// Its terminal status.
        status: RequestStatus,
    },
    /// The active-session limit is reached.
    #[error("active session limit reached ({max})")]
    CapacityExceeded {
        /// Configured maximum.
        max: usize,
    },
    /// Unknown session, wrong token, or session no longer active.
    #[error("authentication failed")]
    AuthError,
    /// The session used up its relayed-command allowance.
    #[error("session {session_id} reached its request limit ({limit})")]
    QuotaExhausted {
        /// The session id.
        session_id: String,
        /// Configured maximum.
        limit: u64,
    },
}

impl BrokerError {
    /// Stable machine-readable code for wire errors.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidScope(_) => "invalid_scope",
            Self::InvalidRoot(_) => "invalid_root",
            Self::InvalidTtl => "invalid_ttl",
            Self::NotFound(_) => "not_found",
            Self::AlreadyDecided { .. } => "already_decided",
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::AuthError => "auth_error",
            Self::QuotaExhausted { .. } => "quota_exhausted",
        }
    }
}

struct SessionRecord {
    session: Session,
    token_hash: TokenHash,
}

#[derive(Default)]
struct BrokerState {
    requests: HashMap<String, AccessRequest>,
    active: HashMap<String, SessionRecord>,
    retired: HashMap<String, Session>,
}

impl BrokerState {
    /// Move an active session to the retired table.
    fn retire(
        &mut self,
        session_id: &str,
        status: SessionStatus,
        now: DateTime<Utc>,
    ) -> Option<Session> {
        let mut record = self.active.remove(session_id)?;
        record.session.status = status;
        record.session.closed_at = Some(now);
        self.retired
            .insert(session_id.to_owned(), record.session.clone());
        Some(record.session)
    }

    fn live_session_count(&self, now: DateTime<Utc>) -> usize {
        self.active
            .values()
            .filter(|r| !r.session.is_expired_at(now))
            .count()
    }
}

/// Owner of all access requests and sessions.
pub struct AccessBroker {
    config: BrokerConfig,
    audit: Arc<AuditLog>,
    state: Mutex<BrokerState>,
    observers: Mutex<Vec<Weak<dyn SessionObserver>>>,
}

impl std::fmt::Debug for AccessBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessBroker")
            .field("config", &self.config)
            .field("active_sessions", &self.active_session_count())
            .finish_non_exhaustive()
    }
}

impl AccessBroker {
    /// Create a broker with empty tables.
    pub fn new(config: BrokerConfig, audit: Arc<AuditLog>) -> Self {
        Self {
            config,
            audit,
            state: Mutex::new(BrokerState::default()),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Broker configuration.
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Register an observer for session closure. Dead observers are pruned lazily.
    pub fn add_observer(&self, observer: Weak<dyn SessionObserver>) {
        if let Ok(mut observers) = self.observers.lock() {
            observers.push(observer);
        }
    }

    /// Submit a new access request in `pending` status.
    ///
    /// # Errors
    ///
    /// [`BrokerError::InvalidScope`] if no scope is requested or any scope is
    /// not in the catalog; [`BrokerError::InvalidRoot`] for relative roots.
    pub fn submit_request<S, P>(
        &self,
        agent_id: &str,
        scopes: impl IntoIterator<Item = S>,
        roots: impl IntoIterator<Item = P>,
        reason: &str,
    ) -> Result<AccessRequest, BrokerError>
    where
        S: Into<String>,
        P: Into<PathBuf>,
    {
        let scopes: BTreeSet<String> = scopes.into_iter().map(Into::into).collect();
        if scopes.is_empty() {
            return Err(BrokerError::InvalidScope("no scopes requested".to_owned()));
        }
        if let Some(unknown) = scopes.iter().find(|s| !is_known_scope(s)) {
            return Err(BrokerError::InvalidScope(unknown.clone()));
        }

        let mut normalized_roots = BTreeSet::new();
        for root in roots {
            let root: PathBuf = root.into();
            if !root.is_absolute() {
                return Err(BrokerError::InvalidRoot(root.display().to_string()));
            }
            normalized_roots.insert(normalize_lexically(&root));
        }

        let request = AccessRequest {
            request_id: Uuid::new_v4().to_string(),
            agent_id: agent_id.to_owned(),
            scopes,
            roots: normalized_roots,
            reason: reason.to_owned(),
            status: RequestStatus::Pending,
            created_at: Utc::now(),
            decided_at: None,
            decision_reason: None,
            session_id: None,
        };

        self.lock_state()
            .requests
            .insert(request.request_id.clone(), request.clone());

        info!(
            request_id = %request.request_id,
            agent_id = %request.agent_id,
            scopes = ?request.scopes,
            "access requested"
        );
        self.audit.record(
            AuditEventType::AccessRequested,
            json!({
                "request_id": request.request_id,
                "agent_id": request.agent_id,
                "scopes": request.scopes,
                "roots": request.roots,
                "reason": request.reason,
            }),
        );
        Ok(request)
    }

    /// Approve a pending request and issue a session.
    ///
    /// `approved_scopes` narrows the grant (default: every requested scope);
    /// `ttl_seconds` overrides the configured TTL. The returned token is never
    /// retrievable again.
    ///
    /// # Errors
    ///
    /// [`BrokerError::NotFound`], [`BrokerError::AlreadyDecided`],
    /// [`BrokerError::CapacityExceeded`], [`BrokerError::InvalidScope`] when
    /// the narrowed set is empty or not a subset, [`BrokerError::InvalidTtl`].
    pub fn approve(
        &self,
        request_id: &str,
        approved_scopes: Option<Vec<String>>,
        ttl_seconds: Option<u64>,
    ) -> Result<IssuedSession, BrokerError> {
        self.approve_at(request_id, approved_scopes, ttl_seconds, Utc::now())
    }

    /// [`approve`](Self::approve) evaluated at `now`.
    #[doc(hidden)]
    pub fn approve_at(
        &self,
        request_id: &str,
        approved_scopes: Option<Vec<String>>,
        ttl_seconds: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<IssuedSession, BrokerError> {
        let ttl_seconds = ttl_seconds.unwrap_or(self.config.session_ttl_seconds);
        if ttl_seconds == 0 {
            return Err(BrokerError::InvalidTtl);
        }

        let issued = {
            let mut state = self.lock_state();
            let live = state.live_session_count(now);

            let request = state
                .requests
                .get_mut(request_id)
                .ok_or_else(|| BrokerError::NotFound(request_id.to_owned()))?;
            if request.status != RequestStatus::Pending {
                return Err(BrokerError::AlreadyDecided {
                    request_id: request_id.to_owned(),
                    status: request.status,
                });
            }

            let scopes = match approved_scopes {
                None => request.scopes.clone(),
                Some(narrowed) => {
                    let narrowed: BTreeSet<String> = narrowed.into_iter().collect();
                    if narrowed.is_empty() {
                        return Err(BrokerError::InvalidScope(
                            "approved scope set is empty".to_owned(),
                        ));
                    }
                    if let Some(extra) = narrowed.iter().find(|s| !request.scopes.contains(*s)) {
                        return Err(BrokerError::InvalidScope(extra.clone()));
                    }
                    narrowed
                }
            };

            if live >= self.config.max_sessions {
                return Err(BrokerError::CapacityExceeded {
                    max: self.config.max_sessions,
                });
            }

            let ttl = i64::try_from(ttl_seconds).unwrap_or(MAX_TTL_SECS).min(MAX_TTL_SECS);
            let expires_at = now
                .checked_add_signed(Duration::seconds(ttl))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);

            let token = generate_token();
            let session = Session {
                session_id: Uuid::new_v4().to_string(),
                request_id: request.request_id.clone(),
                agent_id: request.agent_id.clone(),
                approved_scopes: scopes,
                allowed_roots: request.roots.clone(),
                created_at: now,
                expires_at,
                last_activity: now,
                request_count: 0,
                status: SessionStatus::Active,
                closed_at: None,
            };

            request.status = RequestStatus::Approved;
            request.decided_at = Some(now);
            request.session_id = Some(session.session_id.clone());

            state.active.insert(
                session.session_id.clone(),
                SessionRecord {
                    session: session.clone(),
                    token_hash: TokenHash::new(&token),
                },
            );
            IssuedSession { session, token }
        };

        let session = &issued.session;
        info!(
            request_id,
            session_id = %session.session_id,
            agent_id = %session.agent_id,
            ttl_seconds,
            "access approved"
        );
        self.audit.record(
            AuditEventType::AccessApproved,
            json!({
                "request_id": request_id,
                "session_id": session.session_id,
                "agent_id": session.agent_id,
                "approved_scopes": session.approved_scopes,
                "allowed_roots": session.allowed_roots,
                "ttl_seconds": ttl_seconds,
                "expires_at": session.expires_at.to_rfc3339(),
            }),
        );
        Ok(issued)
    }

    /// Deny a pending request.
    ///
    /// # Errors
    ///
    /// [`BrokerError::NotFound`] or [`BrokerError::AlreadyDecided`].
    pub fn deny(&self, request_id: &str, reason: &str) -> Result<AccessRequest, BrokerError> {
        let denied = {
            let mut state = self.lock_state();
            let request = state
                .requests
                .get_mut(request_id)
                .ok_or_else(|| BrokerError::NotFound(request_id.to_owned()))?;
            if request.status != RequestStatus::Pending {
                return Err(BrokerError::AlreadyDecided {
                    request_id: request_id.to_owned(),
                    status: request.status,
                });
            }
            request.status = RequestStatus::Denied;
            request.decided_at = Some(Utc::now());
            request.decision_reason = Some(reason.to_owned());
            request.clone()
        };

        info!(request_id, agent_id = %denied.agent_id, reason, "access denied");
        self.audit.record(
            AuditEventType::AccessDenied,
            json!({
                "request_id": request_id,
                "agent_id": denied.agent_id,
                "reason": reason,
            }),
        );
        Ok(denied)
    }

    /// Revoke a session immediately.
    ///
    /// Revoking an already revoked or expired session is a no-op.
    ///
    /// # Errors
    ///
    /// [`BrokerError::NotFound`] if the session was never issued (or has been
    /// forgotten by the sweep).
    pub fn revoke(&self, session_id: &str, reason: &str) -> Result<(), BrokerError> {
        let now = Utc::now();
        let revoked = {
            let mut state = self.lock_state();
            match state.retire(session_id, SessionStatus::Revoked, now) {
                Some(session) => session,
                None if state.retired.contains_key(session_id) => {
                    debug!(session_id, "revoke on closed session ignored");
                    return Ok(());
                }
                None => return Err(BrokerError::NotFound(session_id.to_owned())),
            }
        };

        info!(session_id, agent_id = %revoked.agent_id, reason, "session revoked");
        self.audit.record(
            AuditEventType::SessionRevoked,
            json!({
                "session_id": session_id,
                "agent_id": revoked.agent_id,
                "reason": reason,
                "request_count": revoked.request_count,
            }),
        );
        self.notify_closed(session_id, CloseReason::Revoked);
        Ok(())
    }

    /// Authenticate `token` for `session_id` and return the active session.
    ///
    /// # Errors
    ///
    /// [`BrokerError::AuthError`] for unknown or closed sessions, a wrong
    /// token, or an elapsed TTL (the session is expired on the spot).
    pub fn resolve_session(&self, session_id: &str, token: &str) -> Result<Session, BrokerError> {
        self.resolve_session_at(session_id, token, Utc::now())
    }

    /// [`resolve_session`](Self::resolve_session) evaluated at `now`.
    #[doc(hidden)]
    pub fn resolve_session_at(
        &self,
        session_id: &str,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Session, BrokerError> {
        let expired = {
            let mut state = self.lock_state();
            let Some(record) = state.active.get(session_id) else {
                debug!(session_id, "resolve for inactive session");
                return Err(BrokerError::AuthError);
            };
            if !record.token_hash.verify(token) {
                warn!(session_id, "session token mismatch");
                return Err(BrokerError::AuthError);
            }
            if !record.session.is_expired_at(now) {
                return Ok(record.session.clone());
            }
            state.retire(session_id, SessionStatus::Expired, now)
        };

        if let Some(session) = expired {
            self.after_expiry(&session);
        }
        Err(BrokerError::AuthError)
    }

    /// Count one relayed command against the session.
    ///
    /// # Errors
    ///
    /// [`BrokerError::AuthError`] if the session is no longer active,
    /// [`BrokerError::QuotaExhausted`] once `max_requests_per_session` is reached.
    pub fn record_activity(&self, session_id: &str) -> Result<Session, BrokerError> {
        let mut state = self.lock_state();
        let record = state
            .active
            .get_mut(session_id)
            .ok_or(BrokerError::AuthError)?;
        let limit = self.config.max_requests_per_session;
        if record.session.request_count >= limit {
            return Err(BrokerError::QuotaExhausted {
                session_id: session_id.to_owned(),
                limit,
            });
        }
        record.session.request_count = record.session.request_count.saturating_add(1);
        record.session.last_activity = Utc::now();
        Ok(record.session.clone())
    }

    /// Expire every session whose TTL has elapsed and forget old tombstones.
    ///
    /// Returns the number of sessions expired.
    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Utc::now())
    }

    /// [`sweep_expired`](Self::sweep_expired) evaluated at `now`.
    #[doc(hidden)]
    pub fn sweep_expired_at(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<Session> = {
            let mut state = self.lock_state();
            let due: Vec<String> = state
                .active
                .iter()
                .filter(|(_, r)| r.session.is_expired_at(now))
                .map(|(id, _)| id.clone())
                .collect();
            let expired = due
                .iter()
                .filter_map(|id| state.retire(id, SessionStatus::Expired, now))
                .collect();

            let horizon = now
                .checked_sub_signed(Duration::seconds(RETIRED_RETENTION_SECS))
                .unwrap_or(now);
            state
                .retired
                .retain(|_, s| s.closed_at.map_or(true, |closed| closed > horizon));
            expired
        };

        for session in &expired {
            self.after_expiry(session);
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "expired sessions swept");
        }
        expired.len()
    }

    /// Look up one request.
    pub fn get_request(&self, request_id: &str) -> Option<AccessRequest> {
        self.lock_state().requests.get(request_id).cloned()
    }

    /// Requests, oldest first, optionally filtered by status.
    pub fn list_requests(&self, status: Option<RequestStatus>) -> Vec<AccessRequest> {
        let mut requests: Vec<AccessRequest> = self
            .lock_state()
            .requests
            .values()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        requests.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        requests
    }

    /// Active and recently closed sessions, oldest first.
    pub fn list_sessions(&self) -> Vec<Session> {
        let state = self.lock_state();
        let mut sessions: Vec<Session> = state
            .active
            .values()
            .map(|r| r.session.clone())
            .chain(state.retired.values().cloned())
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    /// Whether the session is still in the active set.
    ///
    /// Sessions leave the set before observers hear about the closure.
    pub fn is_active(&self, session_id: &str) -> bool {
        self.lock_state().active.contains_key(session_id)
    }

    /// Number of sessions in the active set.
    pub fn active_session_count(&self) -> usize {
        self.lock_state().active.len()
    }

    fn after_expiry(&self, session: &Session) {
        info!(session_id = %session.session_id, agent_id = %session.agent_id, "session expired");
        self.audit.record(
            AuditEventType::SessionExpired,
            json!({
                "session_id": session.session_id,
                "agent_id": session.agent_id,
                "expires_at": session.expires_at.to_rfc3339(),
                "request_count": session.request_count,
            }),
        );
        self.notify_closed(&session.session_id, CloseReason::Expired);
    }

    fn notify_closed(&self, session_id: &str, reason: CloseReason) {
        let live: Vec<Arc<dyn SessionObserver>> = match self.observers.lock() {
            Ok(mut observers) => {
                observers.retain(|o| o.strong_count() > 0);
                observers.iter().filter_map(Weak::upgrade).collect()
            }
            Err(_) => Vec::new(),
        };
        for observer in live {
            observer.session_closed(session_id, reason);
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, BrokerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("broker state lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}
