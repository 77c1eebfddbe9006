//! Library crate for colo-probe: concurrent endpoint latency probing with
//! trace metadata extraction, exposed as reusable modules.
pub mod config;
pub mod error;
pub mod filter;
pub mod location;
pub mod prober;
pub mod progress;
pub mod scanner;
pub mod server;
pub mod targets;
pub mod types;

pub use config::{ProbeConfig, ProbeMode};
pub use error::ProbeError;
pub use scanner::{probe_endpoints, ProbeRun, Scheduler};
pub use types::{Endpoint, ProbeOutcome, ProgressSnapshot};
