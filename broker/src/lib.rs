#![warn(missing_docs)]
//! The run orchestrator and fleet pool.
//!
//! A [`Broker`] owns a cross-region [`Pool`] of cloud instances and a
//! [`Repository`] of plans and runs. Submitting a plan spawns a
//! [`RunManager`] which leases one [`Collection`] of instances per
//! step, starts the step containers on schedule, polls their
//! completion predicates, and hands everything back to the pool.
//!
//! All coordination state is single-writer: pool free lists, recovery
//! buckets, and the registry of live runs are each guarded by one
//! async mutex and only ever mutated from the owning task. Fan-outs
//! collect their results and commit state changes after the await, so
//! no timestamps or flags are written from a continuation.

use snafu::Snafu;

pub mod broker;
pub mod collection;
pub mod config;
pub mod db;
pub mod docker;
pub mod extensions;
pub mod images;
pub mod pool;
pub mod run;
pub mod state;
pub mod steps;
pub mod testing;

pub use crate::broker::Broker;
pub use collection::{Collection, ExtensionState, Member};
pub use config::BrokerConfig;
pub use db::{
    MemRepository, Plan, PlanId, Project, ProjectId, Repository, Run, RunId, RunState, Step,
    StepId, StepRecord,
};
pub use images::ImageRegistry;
pub use pool::Pool;
pub use run::RunManager;

use cloud::CloudError;
use db::DbError;

/// Broker version, injected into every step container as
/// `BROKER_VERSION`
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Common error type for the orchestration core
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum BrokerError {
    #[snafu(display("IaaS request failed"))]
    Cloud { source: CloudError },
    #[snafu(display("Repository request failed"))]
    Storage { source: DbError },
    #[snafu(display("Plan '{}' not found", uuid))]
    PlanNotFound { uuid: String },
    #[snafu(display("Plan '{}' is disabled", uuid))]
    PlanDisabled { uuid: String },
    #[snafu(display("Run '{}' not found", uuid))]
    RunNotFound { uuid: String },
    #[snafu(display("Run '{}' has already completed", uuid))]
    RunAlreadyCompleted { uuid: String },
    #[snafu(display("Instance '{}' not found in the pool", id))]
    InstanceNotFound { id: String },
    #[snafu(display("Step '{}' failed to start anywhere", step))]
    StepFailed { step: String },
    #[snafu(display(
        "Failed to tag instances for run {} step {} after {} attempts",
        run_id,
        step_id,
        attempts
    ))]
    TagInstances {
        run_id: String,
        step_id: String,
        attempts: usize,
        source: CloudError,
    },
}

impl From<CloudError> for BrokerError {
    fn from(source: CloudError) -> Self {
        BrokerError::Cloud { source }
    }
}

impl From<DbError> for BrokerError {
    fn from(source: DbError) -> Self {
        BrokerError::Storage { source }
    }
}
