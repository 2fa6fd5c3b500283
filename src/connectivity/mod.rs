//! Device and server liveness tracking.
//!
//! Two independent signals feed a single [`ConnectionState`]: the platform's
//! device network flag and a periodic liveness probe against the server.

mod monitor;
mod probe;
mod state;

pub use monitor::{
  ConnectivityMonitor, ConnectivitySnapshot, PeriodicProbe, Subscription, DEFAULT_PROBE_INTERVAL,
  DEFAULT_PROBE_TIMEOUT,
};
pub use probe::{HttpProbe, LivenessProbe, ProbeOutcome};
pub use state::{ConnectionState, ConnectivityEvent, OfflineReason};
