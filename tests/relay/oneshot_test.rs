//! One-shot command correlation.

use std::time::Duration;

use serde_json::json;
use switchboard::broker::BrokerError;
use switchboard::config::RelayConfig;
use switchboard::ratelimit::RateLimiter;
use switchboard::relay::envelope::{
    Command, CommandOutcome, CommandResult, Envelope, RemoteError, CANCEL_ACTION,
};
use switchboard::relay::{Delivery, RelayError};
use switchboard::scope::Denied;

use crate::support::{harness, harness_with, next_command, read_file};

#[tokio::test]
async fn result_resolves_the_waiting_caller() {
    let h = harness(&["read:files"]);
    let mut link = h.responder();

    let relay = h.relay.clone();
    let session_id = h.session_id.clone();
    let responder = tokio::spawn(async move {
        let cmd = next_command(&mut link).await;
        assert_eq!(cmd.action, "read_file");
        assert!(!cmd.stream);
        relay.deliver(
            &session_id,
            link.connection_id,
            Envelope::Result(CommandResult::ok(cmd.id, json!({ "content": "fn main() {}" }))),
        )
    });

    let outcome = h
        .relay
        .send(&h.session_id, &h.token, read_file("m1"))
        .await
        .expect("send should succeed");
    assert_eq!(outcome, CommandOutcome::Ok(json!({ "content": "fn main() {}" })));
    assert_eq!(responder.await.expect("responder task"), Delivery::Resolved);
    assert_eq!(h.relay.in_flight(), 0);

    let session = h
        .broker
        .resolve_session(&h.session_id, &h.token)
        .expect("session still active");
    assert_eq!(session.request_count, 1);
}

#[tokio::test]
async fn error_result_is_an_outcome_not_a_relay_error() {
    let h = harness(&["read:files"]);
    let mut link = h.responder();

    let relay = h.relay.clone();
    let session_id = h.session_id.clone();
    tokio::spawn(async move {
        let cmd = next_command(&mut link).await;
        relay.deliver(
            &session_id,
            link.connection_id,
            Envelope::Result(CommandResult::error(cmd.id, "enoent", "no such file")),
        );
    });

    let outcome = h
        .relay
        .send(&h.session_id, &h.token, read_file("m1"))
        .await
        .expect("send should succeed");
    assert_eq!(
        outcome,
        CommandOutcome::Error(RemoteError {
            code: "enoent".to_owned(),
            message: "no such file".to_owned(),
        })
    );
}

#[tokio::test(start_paused = true)]
async fn silent_responder_times_out_and_late_result_is_orphaned() {
    let h = harness(&["read:files"]);
    let mut link = h.responder();

    let err = h
        .relay
        .send(&h.session_id, &h.token, read_file("m1"))
        .await
        .expect_err("should time out");
    assert_eq!(err, RelayError::Timeout);
    assert_eq!(h.relay.in_flight(), 0);

    let cmd = next_command(&mut link).await;
    let late = h.relay.deliver(
        &h.session_id,
        link.connection_id,
        Envelope::Result(CommandResult::ok(cmd.id, json!(null))),
    );
    assert_eq!(late, Delivery::Orphaned);
    assert_eq!(h.count("orphaned_message"), 1);
}

#[tokio::test]
async fn missing_responder_fails_immediately() {
    let h = harness(&["read:files"]);
    let err = h
        .relay
        .send(&h.session_id, &h.token, read_file("m1"))
        .await
        .expect_err("no responder");
    assert_eq!(err, RelayError::NoResponder);
}

#[tokio::test]
async fn out_of_scope_command_is_denied_without_forwarding() {
    let h = harness(&["read:files"]);
    let mut link = h.responder();
    let before = h.audit.recorded();

    let write = Command::new("m1", "write_file", json!({ "path": "/repo/a.txt", "content": "x" }));
    let err = h
        .relay
        .send(&h.session_id, &h.token, write)
        .await
        .expect_err("write should be denied");

    assert_eq!(err, RelayError::Denied(Denied::ScopeNotApproved("write:files".to_owned())));
    assert!(link.outbound.try_recv().is_err(), "nothing may be forwarded");
    assert_eq!(h.audit.recorded(), before + 1);
    assert_eq!(h.count("scope_denied"), 1);
}

#[tokio::test]
async fn path_outside_roots_is_denied() {
    let h = harness(&["read:files"]);
    let _link = h.responder();
    let escape = Command::new("m1", "read_file", json!({ "path": "/repo/../etc/passwd" }));
    let err = h
        .relay
        .send(&h.session_id, &h.token, escape)
        .await
        .expect_err("escape should be denied");
    assert!(matches!(err, RelayError::Denied(Denied::OutsideRoots(_))));
}

#[tokio::test]
async fn wrong_token_is_an_auth_error() {
    let h = harness(&["read:files"]);
    let err = h
        .relay
        .send(&h.session_id, "sbt_forged", read_file("m1"))
        .await
        .expect_err("forged token");
    assert_eq!(err, RelayError::Broker(BrokerError::AuthError));
}

#[tokio::test(start_paused = true)]
async fn rate_limit_applies_before_forwarding_and_recovers() {
    let h = harness_with(&["read:files"], RelayConfig::default(), RateLimiter::new(2, 100_000));

    // Admission runs before the responder lookup, so these still count.
    for id in ["m1", "m2"] {
        let err = h
            .relay
            .send(&h.session_id, &h.token, read_file(id))
            .await
            .expect_err("no responder");
        assert_eq!(err, RelayError::NoResponder);
    }
    let err = h
        .relay
        .send(&h.session_id, &h.token, read_file("m3"))
        .await
        .expect_err("third request in the window");
    assert!(matches!(err, RelayError::RateLimited { .. }));
    assert_eq!(h.count("rate_limited"), 1);

    tokio::time::advance(Duration::from_secs(61)).await;
    let err = h
        .relay
        .send(&h.session_id, &h.token, read_file("m4"))
        .await
        .expect_err("no responder");
    assert_eq!(err, RelayError::NoResponder);
}

#[tokio::test]
async fn cancel_releases_waiter_and_notifies_responder() {
    let h = harness(&["read:files"]);
    let mut link = h.responder();

    let relay = h.relay.clone();
    let (session_id, token) = (h.session_id.clone(), h.token.clone());
    let waiter =
        tokio::spawn(async move { relay.send(&session_id, &token, read_file("m1")).await });

    let forwarded = next_command(&mut link).await;
    assert_eq!(forwarded.id, "m1");

    assert!(h.relay.cancel(&h.session_id, "m1"));
    assert_eq!(
        waiter.await.expect("waiter task").expect_err("cancelled"),
        RelayError::Cancelled
    );

    let notice = next_command(&mut link).await;
    assert_eq!(notice.action, CANCEL_ACTION);
    assert_eq!(notice.arg_str("id"), Some("m1"));

    // Idempotent.
    assert!(!h.relay.cancel(&h.session_id, "m1"));
    assert_eq!(h.relay.in_flight(), 0);
}

#[tokio::test]
async fn duplicate_in_flight_id_is_rejected() {
    let h = harness(&["read:files"]);
    let mut link = h.responder();

    let relay = h.relay.clone();
    let (session_id, token) = (h.session_id.clone(), h.token.clone());
    let first = tokio::spawn(async move { relay.send(&session_id, &token, read_file("m1")).await });
    let forwarded = next_command(&mut link).await;

    let err = h
        .relay
        .send(&h.session_id, &h.token, read_file("m1"))
        .await
        .expect_err("duplicate id");
    assert_eq!(err, RelayError::DuplicateId("m1".to_owned()));

    h.relay.deliver(
        &h.session_id,
        link.connection_id,
        Envelope::Result(CommandResult::ok(forwarded.id, json!(1))),
    );
    assert_eq!(
        first.await.expect("first task").expect("first send"),
        CommandOutcome::Ok(json!(1))
    );
}

#[tokio::test]
async fn result_from_another_connection_is_orphaned() {
    let h = harness(&["read:files"]);
    let mut link = h.responder();

    let relay = h.relay.clone();
    let (session_id, token) = (h.session_id.clone(), h.token.clone());
    let waiter =
        tokio::spawn(async move { relay.send(&session_id, &token, read_file("m1")).await });
    let forwarded = next_command(&mut link).await;

    let foreign = h.relay.deliver(
        &h.session_id,
        link.connection_id + 1_000,
        Envelope::Result(CommandResult::ok("m1", json!("spoofed"))),
    );
    assert_eq!(foreign, Delivery::Orphaned);

    let genuine = h.relay.deliver(
        &h.session_id,
        link.connection_id,
        Envelope::Result(CommandResult::ok(forwarded.id, json!("genuine"))),
    );
    assert_eq!(genuine, Delivery::Resolved);
    assert_eq!(
        waiter.await.expect("waiter task").expect("send"),
        CommandOutcome::Ok(json!("genuine"))
    );
}

#[tokio::test]
async fn responder_disconnect_fails_in_flight_but_keeps_session() {
    let h = harness(&["read:files"]);
    let mut link = h.responder();

    let relay = h.relay.clone();
    let (session_id, token) = (h.session_id.clone(), h.token.clone());
    let waiter =
        tokio::spawn(async move { relay.send(&session_id, &token, read_file("m1")).await });
    next_command(&mut link).await;

    h.relay.unregister_responder(&h.session_id, link.connection_id);
    assert_eq!(
        waiter.await.expect("waiter task").expect_err("disconnected"),
        RelayError::Disconnected
    );
    assert!(!h.relay.has_responder(&h.session_id));
    assert!(h.broker.resolve_session(&h.session_id, &h.token).is_ok());
    assert_eq!(h.count("connection_closed"), 1);
}

#[tokio::test]
async fn far_future_deadlines_do_not_overflow() {
    let config = RelayConfig {
        command_timeout_seconds: u64::MAX,
        stream_inactivity_timeout_seconds: u64::MAX,
        ..RelayConfig::default()
    };
    let limiter = RateLimiter::new(100, 100_000);
    let h = harness_with(&["read:files", "chat:completions"], config, limiter);
    let mut link = h.responder();

    let relay = h.relay.clone();
    let session_id = h.session_id.clone();
    let responder = tokio::spawn(async move {
        let cmd = next_command(&mut link).await;
        let delivery = relay.deliver(
            &session_id,
            link.connection_id,
            Envelope::Result(CommandResult::ok(cmd.id, json!("ok"))),
        );
        assert_eq!(delivery, Delivery::Resolved);
        next_command(&mut link).await
    });

    let outcome = h
        .relay
        .send(&h.session_id, &h.token, read_file("m1"))
        .await
        .expect("send should succeed");
    assert_eq!(outcome, CommandOutcome::Ok(json!("ok")));

    let stream = h
        .relay
        .stream(&h.session_id, &h.token, crate::support::chat("m2"))
        .expect("stream should start");
    assert_eq!(responder.await.expect("responder task").id, "m2");
    assert_eq!(h.relay.sweep_expired(), 0);
    drop(stream);
}
