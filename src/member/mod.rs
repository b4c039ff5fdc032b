//! Reconciliation of the stateful components of a cluster
//!
//! - [`ClusterReconciler`]: every component of a cluster, in dependency order
//! - [`ComponentReconciler`]: the ordered tick for one component
//! - [`store_status`]: classification of the coordinator's store membership
//! - [`scaler`], [`volume`]: one-ordinal scaling and claim lifecycle
//! - [`failover`]: failure records and recovery
//! - [`upgrader`]: partition-driven rolling upgrades
//! - [`shutdown`]: drain and resign handshake for capture replicas

pub mod cluster;
pub mod desired;
pub mod failover;
pub mod reconciler;
pub mod scaler;
pub mod shutdown;
pub mod store_status;
pub mod upgrader;
pub mod volume;

pub use cluster::ClusterReconciler;
pub use failover::{Failover, PodFailover, StoreFailover};
pub use reconciler::ComponentReconciler;
pub use scaler::{CaptureScaler, GeneralScaler, Scaler, StoreScaler};
pub use shutdown::{graceful_shutdown_capture, shutdown_hook_step, HookStep, ShutdownPhase};
pub use store_status::{classify_stores, refresh_store_status, StoreSnapshot};
pub use upgrader::{replica_set_is_upgrading, RollingUpgrader, UpgradeSafety};
