//! Shared fixtures for relay tests.

use std::io::Write;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use switchboard::audit::AuditLog;
use switchboard::broker::AccessBroker;
use switchboard::config::{BrokerConfig, RelayConfig};
use switchboard::ratelimit::RateLimiter;
use switchboard::relay::envelope::{Command, Envelope};
use switchboard::relay::{CommandRelay, ResponderLink};

#[derive(Clone, Default)]
pub struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().expect("test lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub struct Harness {
    pub broker: Arc<AccessBroker>,
    pub relay: CommandRelay,
    pub audit: Arc<AuditLog>,
    pub session_id: String,
    pub token: String,
    buf: SharedBuf,
}

impl Harness {
    /// Audit records written so far.
    pub fn audit_events(&self) -> Vec<Value> {
        let bytes = self.buf.0.lock().expect("test lock").clone();
        String::from_utf8_lossy(&bytes)
            .lines()
            .map(|line| serde_json::from_str(line).expect("audit line is JSON"))
            .collect()
    }

    pub fn count(&self, event_type: &str) -> usize {
        self.audit_events()
            .iter()
            .filter(|e| e["event_type"] == event_type)
            .count()
    }

    pub fn responder(&self) -> ResponderLink {
        self.relay
            .register_responder(&self.session_id, &self.token)
            .expect("responder should register")
    }
}

pub fn harness(scopes: &[&str]) -> Harness {
    harness_with(scopes, RelayConfig::default(), RateLimiter::new(100, 100_000))
}

pub fn harness_with(scopes: &[&str], relay_config: RelayConfig, limiter: RateLimiter) -> Harness {
    let buf = SharedBuf::default();
    let audit = Arc::new(AuditLog::from_writer(Box::new(buf.clone())));
    let broker = Arc::new(AccessBroker::new(BrokerConfig::default(), Arc::clone(&audit)));
    let relay = CommandRelay::new(
        Arc::clone(&broker),
        Arc::new(limiter),
        Arc::clone(&audit),
        relay_config,
    );
    let request = broker
        .submit_request("agent-1", scopes.iter().copied(), ["/repo"], "integration test")
        .expect("submit should succeed");
    let issued = broker
        .approve(&request.request_id, None, None)
        .expect("approve should succeed");
    Harness {
        broker,
        relay,
        audit,
        session_id: issued.session.session_id,
        token: issued.token,
        buf,
    }
}

/// Wait for the next command forwarded to a responder.
pub async fn next_command(link: &mut ResponderLink) -> Command {
    match link.outbound.recv().await {
        Some(Envelope::Command(cmd)) => cmd,
        other => panic!("expected a forwarded command, got {other:?}"),
    }
}

pub fn read_file(id: &str) -> Command {
    Command::new(id, "read_file", serde_json::json!({ "path": "/repo/src/main.rs" }))
}

pub fn chat(id: &str) -> Command {
    Command::new(id, "chat_completion", serde_json::json!({ "max_tokens": 64 })).streaming()
}
