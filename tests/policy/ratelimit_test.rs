//! Sliding-window rate limiting on the Tokio clock.

use std::time::Duration;

use switchboard::ratelimit::{LimitKind, RateDecision, RateLimiter};

#[tokio::test(start_paused = true)]
async fn request_past_the_ceiling_is_limited_until_the_window_passes() {
    let limiter = RateLimiter::new(5, 100_000);
    for _ in 0..5 {
        assert!(limiter.check("agent", 0).is_allowed());
    }
    match limiter.check("agent", 0) {
        RateDecision::Denied {
            kind, retry_after, ..
        } => {
            assert_eq!(kind, LimitKind::Requests);
            assert!(retry_after <= Duration::from_secs(60));
        }
        RateDecision::Allowed => panic!("sixth request should be limited"),
    }

    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(limiter.check("agent", 0).is_allowed());
}

#[tokio::test(start_paused = true)]
async fn token_cost_is_limited_independently() {
    let limiter = RateLimiter::new(100, 1_000);
    assert!(limiter.check("agent", 800).is_allowed());
    tokio::time::advance(Duration::from_secs(30)).await;

    match limiter.check("agent", 300) {
        RateDecision::Denied {
            kind, retry_after, ..
        } => {
            assert_eq!(kind, LimitKind::Tokens);
            assert_eq!(retry_after, Duration::from_secs(30));
        }
        RateDecision::Allowed => panic!("token ceiling should apply"),
    }
    assert!(limiter.check("agent", 200).is_allowed());
}

#[tokio::test(start_paused = true)]
async fn sweep_drops_idle_clients() {
    let limiter = RateLimiter::new(10, 1_000);
    assert!(limiter.check("a", 10).is_allowed());
    assert!(limiter.check("b", 0).is_allowed());
    assert_eq!(limiter.tracked_clients(), 2);

    tokio::time::advance(Duration::from_secs(3_601)).await;
    assert_eq!(limiter.sweep(), 2);
    assert_eq!(limiter.tracked_clients(), 0);
}
