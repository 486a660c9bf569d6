//! WebSocket transport: authenticates connections at handshake and pumps
//! envelopes between sockets and the [`CommandRelay`].
//!
//! Handshake headers:
//!
//! - `Authorization: Bearer <session token>`
//! - `X-Session-Id: <session id>`
//! - `X-Relay-Role: initiator | responder`
//!
//! Each connection runs one `select!` loop over inbound frames and an
//! outbound queue. Closing a connection ends its relay activity but never
//! touches the session.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderMap, StatusCode};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::relay::envelope::{
    Command, CommandOutcome, CommandResult, Envelope, ERROR_CODE_INVALID_ENVELOPE,
    ERROR_CODE_UNEXPECTED_ENVELOPE, CANCEL_ACTION,
};
use crate::relay::{CommandRelay, Delivery, RelayError};

/// Header carrying the session id.
pub const SESSION_ID_HEADER: &str = "x-session-id";
/// Header selecting the connection role.
pub const ROLE_HEADER: &str = "x-relay-role";

/// Which end of the relay a connection is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The agent side: sends commands, receives results and events.
    Initiator,
    /// The host application: receives commands, sends results and events.
    Responder,
}

impl Role {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "initiator" => Some(Self::Initiator),
            "responder" => Some(Self::Responder),
            _ => None,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Initiator => "initiator",
            Self::Responder => "responder",
        }
    }
}

/// Credentials presented in the handshake headers.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Session to act for.
    pub session_id: String,
    /// Raw bearer token.
    pub token: String,
    /// Connection role.
    pub role: Role,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("session_id", &self.session_id)
            .field("token", &"<redacted>")
            .field("role", &self.role)
            .finish()
    }
}

impl Credentials {
    /// Extract credentials from handshake headers.
    ///
    /// # Errors
    ///
    /// A short reason naming the missing or malformed header.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, &'static str> {
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

        let token = header("authorization")
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or("missing bearer token")?;
        let session_id = header(SESSION_ID_HEADER)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or("missing session id")?;
        let role = header(ROLE_HEADER)
            .and_then(Role::parse)
            .ok_or("missing or unknown relay role")?;

        Ok(Self {
            session_id: session_id.to_owned(),
            token: token.to_owned(),
            role,
        })
    }
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_owned()));
    *response.status_mut() = status;
    response
}

/// Accepts relay connections until shut down.
#[derive(Debug, Clone)]
pub struct RelayServer {
    relay: CommandRelay,
    config: ServerConfig,
}

impl RelayServer {
    /// Create a server over an existing relay.
    pub fn new(relay: CommandRelay, config: ServerConfig) -> Self {
        Self { relay, config }
    }

    /// Bind the configured address.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid or already in use.
    pub async fn bind(&self) -> anyhow::Result<TcpListener> {
        TcpListener::bind(&self.config.bind)
            .await
            .with_context(|| format!("failed to bind {}", self.config.bind))
    }

    /// Accept connections on `listener` until `shutdown` flips to `true`.
    ///
    /// # Errors
    ///
    /// Returns an error only if the listener's local address is unavailable;
    /// per-connection failures are logged.
    pub async fn serve(
        self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let local = listener.local_addr().context("listener has no local address")?;
        info!(%local, "relay server listening");
        let handshake_timeout = self.config.handshake_timeout();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let relay = self.relay.clone();
                        connections.spawn(async move {
                            handle_connection(relay, stream, peer, handshake_timeout).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("relay server shutting down");
                        break;
                    }
                }
            }
        }
        connections.shutdown().await;
        Ok(())
    }
}

/// Run the handshake and the role-specific loop for one connection.
pub async fn handle_connection<S>(
    relay: CommandRelay,
    stream: S,
    peer: SocketAddr,
    handshake_timeout: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut credentials = None;
    let broker = Arc::clone(relay.broker());
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let presented = Credentials::from_headers(request.headers())
            .map_err(|r| reject(StatusCode::BAD_REQUEST, r))?;
        if broker
            .resolve_session(&presented.session_id, &presented.token)
            .is_err()
        {
            return Err(reject(StatusCode::UNAUTHORIZED, "invalid session credentials"));
        }
        credentials = Some(presented);
        Ok(response)
    };

    let handshake = tokio::time::timeout(
        handshake_timeout,
        tokio_tungstenite::accept_hdr_async(stream, callback),
    )
    .await;
    let ws = match handshake {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            debug!(%peer, error = %e, "handshake rejected");
            return;
        }
        Err(_) => {
            warn!(%peer, "handshake timed out");
            return;
        }
    };
    let Some(credentials) = credentials else {
        return;
    };

    debug!(
        %peer,
        session_id = %credentials.session_id,
        role = credentials.role.label(),
        "handshake accepted"
    );
    match credentials.role {
        Role::Responder => run_responder(relay, ws, credentials).await,
        Role::Initiator => run_initiator(relay, ws, credentials).await,
    }
}

async fn send_envelope<S>(ws: &mut S, envelope: &Envelope) -> bool
where
    S: futures_util::Sink<Message> + Unpin,
{
    match envelope.to_json() {
        Ok(text) => ws.send(Message::text(text)).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "failed to serialize envelope");
            true
        }
    }
}

fn error_frame(id: &str, err: &RelayError) -> Envelope {
    Envelope::Result(CommandResult::error(id, err.code(), err.to_string()))
}

async fn run_responder<S>(relay: CommandRelay, ws: WebSocketStream<S>, credentials: Credentials)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let session_id = credentials.session_id;
    let link = match relay.register_responder(&session_id, &credentials.token) {
        Ok(link) => link,
        Err(e) => {
            warn!(%session_id, error = %e, "responder registration failed");
            return;
        }
    };
    let connection_id = link.connection_id;
    let mut outbound = link.outbound;
    let (mut sink, mut source) = ws.split();

    loop {
        tokio::select! {
            next = outbound.recv() => match next {
                Some(envelope) => {
                    if !send_envelope(&mut sink, &envelope).await {
                        break;
                    }
                }
                None => {
                    // Session closed or connection replaced.
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let reply = match Envelope::parse(text.as_str()) {
                        Ok(envelope) => {
                            let id = envelope.id().to_owned();
                            match relay.deliver(&session_id, connection_id, envelope) {
                                Delivery::Rejected => Some(Envelope::Result(CommandResult::error(
                                    id,
                                    ERROR_CODE_UNEXPECTED_ENVELOPE,
                                    "responders may only send result and event frames",
                                ))),
                                _ => None,
                            }
                        }
                        Err(e) => Some(Envelope::Result(CommandResult::error(
                            "",
                            ERROR_CODE_INVALID_ENVELOPE,
                            e.to_string(),
                        ))),
                    };
                    if let Some(reply) = reply {
                        if !send_envelope(&mut sink, &reply).await {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(%session_id, error = %e, "responder socket error");
                    break;
                }
            },
        }
    }

    relay.unregister_responder(&session_id, connection_id);
}

async fn run_initiator<S>(relay: CommandRelay, ws: WebSocketStream<S>, credentials: Credentials)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Credentials {
        session_id, token, ..
    } = credentials;
    let link = match relay.open_initiator(&session_id, &token) {
        Ok(link) => link,
        Err(e) => {
            warn!(%session_id, error = %e, "initiator registration failed");
            return;
        }
    };
    let connection_id = link.connection_id;
    let mut events = link.events;
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Envelope>();
    let (mut sink, mut source) = ws.split();
    // Dropping the set aborts in-flight commands along with their correlations.
    let mut commands = JoinSet::new();

    loop {
        tokio::select! {
            Some(envelope) = out_rx.recv() => {
                if !send_envelope(&mut sink, &envelope).await {
                    break;
                }
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if !send_envelope(&mut sink, &Envelope::Event(event)).await {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(%session_id, skipped, "initiator lagging behind events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    // Session closed.
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            Some(_) = commands.join_next(), if !commands.is_empty() => {}
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => match Envelope::parse(text.as_str()) {
                    Ok(Envelope::Command(command)) => {
                        dispatch(&relay, &session_id, &token, command, &out_tx, &mut commands);
                    }
                    Ok(other) => {
                        let _ = out_tx.send(Envelope::Result(CommandResult::error(
                            other.id(),
                            ERROR_CODE_UNEXPECTED_ENVELOPE,
                            "initiators may only send cmd frames",
                        )));
                    }
                    Err(e) => {
                        let _ = out_tx.send(Envelope::Result(CommandResult::error(
                            "",
                            ERROR_CODE_INVALID_ENVELOPE,
                            e.to_string(),
                        )));
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(%session_id, error = %e, "initiator socket error");
                    break;
                }
            },
        }
    }

    commands.shutdown().await;
    relay.close_initiator(&session_id, connection_id);
}

/// Start one initiator command; its frames are queued on `out`.
fn dispatch(
    relay: &CommandRelay,
    session_id: &str,
    token: &str,
    command: Command,
    out: &mpsc::UnboundedSender<Envelope>,
    commands: &mut JoinSet<()>,
) {
    let id = command.id.clone();

    if command.action == CANCEL_ACTION {
        let target = command.arg_str("id").unwrap_or_default();
        let cancelled = relay.cancel(session_id, target);
        let _ = out.send(Envelope::Result(CommandResult::ok(
            id,
            json!({ "cancelled": cancelled }),
        )));
        return;
    }

    if command.stream {
        match relay.stream(session_id, token, command) {
            Ok(mut chunks) => {
                let out = out.clone();
                commands.spawn(async move {
                    while let Some(item) = chunks.next().await {
                        match item {
                            Ok(chunk) => {
                                let _ = out.send(Envelope::Event(chunk));
                            }
                            Err(e) => {
                                let _ = out.send(error_frame(&id, &e));
                                return;
                            }
                        }
                    }
                    let done = CommandResult::ok(id, json!({ "finished": true }));
                    let _ = out.send(Envelope::Result(done));
                });
            }
            Err(e) => {
                let _ = out.send(error_frame(&id, &e));
            }
        }
        return;
    }

    let relay = relay.clone();
    let session_id = session_id.to_owned();
    let token = token.to_owned();
    let out = out.clone();
    commands.spawn(async move {
        let frame = match relay.send(&session_id, &token, command).await {
            Ok(CommandOutcome::Ok(data)) => Envelope::Result(CommandResult::ok(id, data)),
            Ok(CommandOutcome::Error(remote)) => {
                Envelope::Result(CommandResult::error(id, remote.code, remote.message))
            }
            Err(e) => error_frame(&id, &e),
        };
        let _ = out.send(frame);
    });
}
