//! Streaming command correlation.

use std::time::Duration;

use serde_json::json;
use switchboard::config::RelayConfig;
use switchboard::ratelimit::RateLimiter;
use switchboard::relay::envelope::{CommandResult, Envelope, EventMessage, STREAM_END_EVENT};
use switchboard::relay::{Delivery, RelayError};

use crate::support::{chat, harness, harness_with, next_command};

fn chunk(id: &str, delta: &str) -> Envelope {
    let data = json!({ "delta": delta, "finish_reason": null });
    Envelope::Event(EventMessage::new(id, "chunk", data))
}

#[tokio::test(start_paused = true)]
async fn chunks_arrive_in_order_then_silence_times_out() {
    let h = harness(&["chat:completions"]);
    let mut link = h.responder();

    let mut stream = h
        .relay
        .stream(&h.session_id, &h.token, chat("s1"))
        .expect("stream should start");
    let forwarded = next_command(&mut link).await;
    assert!(forwarded.stream);

    for delta in ["Hel", "lo", " world"] {
        assert_eq!(
            h.relay.deliver(&h.session_id, link.connection_id, chunk("s1", delta)),
            Delivery::Chunk
        );
    }

    let mut received = Vec::new();
    for _ in 0..3 {
        let chunk = stream.next().await.expect("chunk").expect("not an error");
        received.push(chunk.data["delta"].as_str().unwrap_or_default().to_owned());
    }
    assert_eq!(received, ["Hel", "lo", " world"]);

    assert_eq!(stream.next().await, Some(Err(RelayError::Timeout)));
    assert_eq!(stream.next().await, None);
    assert!(stream.is_done());
    assert_eq!(h.relay.in_flight(), 0);

    // The id is no longer correlated; a straggler goes to the event fan-out.
    assert_eq!(
        h.relay.deliver(&h.session_id, link.connection_id, chunk("s1", "late")),
        Delivery::Broadcast(0)
    );
}

#[tokio::test]
async fn finish_reason_terminates_the_stream() {
    let h = harness(&["chat:completions"]);
    let mut link = h.responder();
    let stream = h
        .relay
        .stream(&h.session_id, &h.token, chat("s1"))
        .expect("stream should start");
    next_command(&mut link).await;

    h.relay.deliver(&h.session_id, link.connection_id, chunk("s1", "done"));
    let last = Envelope::Event(EventMessage::new(
        "s1",
        "chunk",
        json!({ "delta": ".", "finish_reason": "stop" }),
    ));
    assert_eq!(
        h.relay.deliver(&h.session_id, link.connection_id, last),
        Delivery::StreamEnded
    );

    let chunks = stream.collect().await.expect("stream should finish cleanly");
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[1].data["finish_reason"], "stop");
}

#[tokio::test]
async fn result_envelope_terminates_the_stream() {
    let h = harness(&["chat:completions"]);
    let mut link = h.responder();
    let stream = h
        .relay
        .stream(&h.session_id, &h.token, chat("s1"))
        .expect("stream should start");
    next_command(&mut link).await;

    h.relay.deliver(&h.session_id, link.connection_id, chunk("s1", "a"));
    let end = Envelope::Result(CommandResult::ok("s1", json!({ "usage": { "tokens": 3 } })));
    assert_eq!(
        h.relay.deliver(&h.session_id, link.connection_id, end),
        Delivery::StreamEnded
    );

    let chunks = stream.collect().await.expect("clean finish");
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[1].event, STREAM_END_EVENT);
    assert_eq!(chunks[1].data["usage"]["tokens"], 3);
}

#[tokio::test]
async fn error_result_fails_the_stream() {
    let h = harness(&["chat:completions"]);
    let mut link = h.responder();
    let stream = h
        .relay
        .stream(&h.session_id, &h.token, chat("s1"))
        .expect("stream should start");
    next_command(&mut link).await;

    h.relay.deliver(
        &h.session_id,
        link.connection_id,
        Envelope::Result(CommandResult::error("s1", "model_unavailable", "no model loaded")),
    );
    assert_eq!(
        stream.collect().await.expect_err("remote failure"),
        RelayError::Remote {
            code: "model_unavailable".to_owned(),
            message: "no model loaded".to_owned(),
        }
    );
}

#[tokio::test]
async fn queue_past_its_depth_fails_with_overflow() {
    let config = RelayConfig {
        max_stream_queue_depth: 2,
        ..RelayConfig::default()
    };
    let h = harness_with(&["chat:completions"], config, RateLimiter::new(100, 100_000));
    let mut link = h.responder();
    let mut stream = h
        .relay
        .stream(&h.session_id, &h.token, chat("s1"))
        .expect("stream should start");
    next_command(&mut link).await;

    let deliveries: Vec<Delivery> = ["a", "b", "c"]
        .iter()
        .map(|d| h.relay.deliver(&h.session_id, link.connection_id, chunk("s1", d)))
        .collect();
    assert_eq!(deliveries, [Delivery::Chunk, Delivery::Chunk, Delivery::Overflow]);

    assert!(stream.next().await.expect("a").is_ok());
    assert!(stream.next().await.expect("b").is_ok());
    assert_eq!(stream.next().await, Some(Err(RelayError::Overflow)));
    assert_eq!(stream.next().await, None);
}

#[tokio::test]
async fn uncorrelated_events_reach_subscribers() {
    let h = harness(&["read:editor"]);
    let link = h.responder();
    let mut initiator = h
        .relay
        .open_initiator(&h.session_id, &h.token)
        .expect("initiator should open");

    let notice = EventMessage::new("evt-1", "buffer_changed", json!({ "path": "/repo/a.rs" }));
    assert_eq!(
        h.relay
            .deliver(&h.session_id, link.connection_id, Envelope::Event(notice.clone())),
        Delivery::Broadcast(1)
    );
    assert_eq!(initiator.events.recv().await.expect("event"), notice);
}

#[tokio::test(start_paused = true)]
async fn sweep_discards_streams_nobody_polls() {
    let h = harness(&["chat:completions"]);
    let _link = h.responder();
    let mut stream = h
        .relay
        .stream(&h.session_id, &h.token, chat("s1"))
        .expect("stream should start");

    assert_eq!(h.relay.sweep_expired(), 0);
    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(h.relay.sweep_expired(), 1);
    assert_eq!(h.relay.in_flight(), 0);
    assert_eq!(stream.next().await, Some(Err(RelayError::Timeout)));
}
