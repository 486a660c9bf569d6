//! Switchboard: access broker and command relay between AI agents and editor hosts.
//!
//! An agent asks for scoped, time-limited access; an approver grants or denies
//! it; the resulting session authenticates a pair of WebSocket connections
//! (agent initiator, editor responder) over which commands, results and
//! streamed events are correlated by message id.
//!
//! See `DESIGN.md` for the architecture.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod broker;
pub mod config;
pub mod logging;
pub mod ratelimit;
pub mod relay;
pub mod scope;
pub mod server;
pub mod sweeper;
