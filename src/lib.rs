//! flowgen - a controllable multi-flow TCP load generator
//!
//! The active role opens a configurable number of TCP flows to a peer and
//! paces writes across them at an aggregate rate. A separate control
//! connection can change the flow count, rate and interval while it runs, and
//! receives the cumulative byte counter once per second. The passive role
//! accepts flows and discards what they send.
//!
//! # Features
//!
//! - Live reconfiguration over a five-byte binary control protocol
//! - Interval pacing with overrun catch-up and periodic checkpoint correction
//! - Non-blocking writes: full, partial and empty writes are counted, never retried
//! - Asynchronous I/O using tokio

pub mod config;
pub mod control;
pub mod error;
pub mod flow;
pub mod generator;
pub mod pacer;
pub mod pool;
pub mod protocol;
pub mod reporter;
pub mod sink;
pub mod stats;

pub use config::{GeneratorConfig, SharedConfig, SinkConfig};
pub use control::ControlListener;
pub use error::{Error, Result};
pub use generator::{run_active, Generator};
pub use sink::Sink;
pub use stats::{CumulativeStats, StatsSnapshot};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
