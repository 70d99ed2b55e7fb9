//! fleet-control - configuration and coordination core of a fleet monitor
//!
//! Resolves layered configuration for a server and every managed database
//! cluster, keeps secrets encrypted at rest, persists the effective state
//! only when it changed, distributes it through git, and arbitrates with a
//! peer monitor to avoid split-brain.

pub mod arbitration;
pub mod config;
pub mod fleet;
pub mod git;
pub mod mock;
pub mod persist;
pub mod scheduler;
pub mod timing;
pub mod vault;

pub use config::{ConfigSources, LayeredResolver, ResolvedScope, SourceOptions};
pub use fleet::{ClusterHandle, Collaborators, Fleet, FleetError, ManagedCluster, SetOutcome};
pub use scheduler::{Scheduler, ShutdownState};
pub use timing::TickConfig;
