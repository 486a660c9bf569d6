//! Background sweeps: session expiry, relay deadlines and rate-limit windows.
//!
//! Runs as one Tokio task with an independent interval per sweep, so a slow
//! sweep never delays the others' schedule by more than its own run time.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::broker::AccessBroker;
use crate::config::Config;
use crate::ratelimit::RateLimiter;
use crate::relay::CommandRelay;

/// How often relay deadlines are checked.
const RELAY_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Intervals for the three sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepIntervals {
    /// Broker expiry sweep.
    pub broker: Duration,
    /// Relay deadline sweep.
    pub relay: Duration,
    /// Rate-limiter window sweep.
    pub rate_limit: Duration,
}

impl SweepIntervals {
    /// Intervals from config.
    pub fn from_config(config: &Config) -> Self {
        Self {
            broker: config.broker.cleanup_interval(),
            relay: RELAY_SWEEP_INTERVAL,
            rate_limit: Duration::from_secs(config.rate_limit.sweep_interval_seconds),
        }
    }
}

/// Run the sweeps until `shutdown_rx` flips to `true` or its sender drops.
pub async fn run_sweeper(
    broker: Arc<AccessBroker>,
    relay: CommandRelay,
    limiter: Arc<RateLimiter>,
    intervals: SweepIntervals,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(
        broker_secs = intervals.broker.as_secs(),
        rate_limit_secs = intervals.rate_limit.as_secs(),
        "sweeper started"
    );

    let mut broker_tick = tokio::time::interval(intervals.broker);
    let mut relay_tick = tokio::time::interval(intervals.relay);
    let mut limiter_tick = tokio::time::interval(intervals.rate_limit);
    for tick in [&mut broker_tick, &mut relay_tick, &mut limiter_tick] {
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    }

    loop {
        tokio::select! {
            _ = broker_tick.tick() => {
                let expired = broker.sweep_expired();
                debug!(expired, "broker sweep");
            }
            _ = relay_tick.tick() => {
                relay.sweep_expired();
            }
            _ = limiter_tick.tick() => {
                let removed = limiter.sweep();
                debug!(removed, "rate limiter sweep");
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("sweeper shutting down");
                    break;
                }
            }
        }
    }
}
