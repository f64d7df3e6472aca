//! Session-recording orchestrator for CDP browsers.
//!
//! One [`SessionCoordinator`](coordinator::SessionCoordinator) per browser
//! session multiplexes the browser-wide debugger socket plus one socket per
//! page, injects recording instrumentation into every page and challenge
//! iframe as it appears, drains the in-page event buffers on a fixed cadence
//! with self-healing re-injection, and finalizes per-tab recordings exactly
//! once. A [`ChallengeSolver`](solver::ChallengeSolver) races five detection
//! paths per page and drives a human-presence input pipeline to clear
//! anti-bot challenges while the recording runs.
//!
//! External clients connect to the same browser; the coordinator observes
//! all protocol events without ever interfering with their traffic.

#![warn(missing_debug_implementations, rust_2018_idioms)]

pub mod cmd;
pub mod config;
pub mod conn;
pub mod coordinator;
pub mod error;
pub mod http;
pub(crate) mod javascript;
pub mod metrics;
pub mod screencast;
pub mod session;
pub mod solver;
pub mod store;

pub use crate::config::Config;
pub use crate::conn::Connection;
pub use crate::coordinator::{CoordinatorConfig, SessionCoordinator};
pub use crate::error::{CdpError, ReplayStoreError, Result};
pub use crate::metrics::Metrics;
pub use crate::session::{launch_session, SessionHandle, SessionRegistry};
pub use crate::solver::{ChallengeEvent, ChallengeSolver, ChallengeType};
pub use crate::store::ReplayStore;

/// re-export the protocol types
pub use replaymux_cdp::cdp;
pub use replaymux_cdp::{self as types, Command, Method, MethodType};
/// re-export the input planning crate
pub use replaymux_humanize;
