//! # kvkeeper
//!
//! A control loop reconciling the stateful components of a distributed
//! key-value database cluster:
//! - Store membership tracking against the placement coordinator
//! - One-ordinal-per-tick scaling with deferred volume deletion
//! - Failure records, replacement replicas and quorum-gated recovery
//! - Partition-driven rolling upgrades with leader eviction
//! - Drain and owner-resign handshake for change-data-capture replicas
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │             Controller loop              │
//! │   work queue ── workers ── resync timer  │
//! └───────────────────┬──────────────────────┘
//!                     │ one tick per cluster
//! ┌───────────────────▼──────────────────────┐
//! │            ClusterReconciler             │
//! │ coordinator → storage → columnar → ...   │
//! └───────────────────┬──────────────────────┘
//!                     │ per component
//!   ┌─────────────────┼─────────────────┐
//!   │                 │                 │
//! ┌─▼────────┐  ┌─────▼──────┐  ┌───────▼─────┐
//! │ Scaler   │  │ Failover   │  │ Upgrader    │
//! │ + volumes│  │            │  │ + shutdown  │
//! └──────────┘  └────────────┘  └─────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Dry run against an in-memory object store
//! ```bash
//! kvkeeper run --topology ./cluster.toml
//! ```
//!
//! ### Inspect a live coordinator
//! ```bash
//! kvkeeper stores --namespace prod --cluster basic --component storage
//! ```
//!
//! ### Pre-termination hook of a capture replica
//! ```bash
//! kvkeeper shutdown-hook --namespace prod --cluster basic --ordinal 2
//! ```

#![allow(clippy::result_large_err)]

pub mod client;
pub mod common;
pub mod controller;
pub mod member;
pub mod model;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use controller::Controller;
pub use member::{ClusterReconciler, ComponentReconciler};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
