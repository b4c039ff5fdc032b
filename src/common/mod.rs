//! Common utilities and types shared across kvkeeper

pub mod config;
pub mod error;
pub mod hash;
pub mod labels;
pub mod metrics;
pub mod utils;

pub use config::{Config, ControllerConfig, QuorumRule, ServerConfig};
pub use error::{Error, ErrorClass, Result};
pub use hash::{blake3_hash, fingerprint, short_hash};
pub use metrics::{MetricsRegistry, Outcome, METRICS};
pub use utils::{
    backoff_delay, elapsed_since, format_timestamp, parse_duration, parse_timestamp, with_timeout,
};
