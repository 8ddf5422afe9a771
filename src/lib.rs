//! Sprinkler - a horizontally-replicable workflow scheduler for Orchard
//!
//! Operators register recurring workflows through the control API. One or
//! more scheduler replicas cooperatively detect workflows whose next runtime
//! has elapsed, create their instances on the external Orchard orchestration
//! service, activate them once their staggered start times pass, and advance
//! the schedule. The key components are:
//!
//! ## Scheduling pipeline
//!
//! - [`SchedulerTask`]: finds due workflows and fans out dispatcher workers
//! - [`ActivatorTask`]: activates previously-created instances
//! - [`CleanupTask`]: expires abandoned leases and old instance rows
//!
//! Replicas coordinate exclusively through lease rows in the workflow store;
//! there is no separate coordination service.
//!
//! ## Collaborators
//!
//! - [`store`]: workflow catalog behind capability traits, with Postgres and
//!   in-memory backends
//! - [`orchard`]: outbound Orchard REST gateway and its in-memory twin
//! - [`generator`]: subprocess payload generation, with S3 artifact staging
//! - [`control`]: operator-facing HTTP API

pub mod artifact;
pub mod cleanup;
pub mod config;
pub mod control;
pub mod every;
pub mod fake_orchard;
pub mod generator;
pub mod metrics;
pub mod notify;
pub mod orchard;
pub mod scheduler;
pub mod store;

pub use cleanup::{spawn_cleanup, CleanupConfig, CleanupTask};
pub use config::Config;
pub use control::{run_control_server, AuthConfig, ControlState};
pub use every::{Every, EveryUnit};
pub use fake_orchard::FakeOrchard;
pub use orchard::{OrchardClient, OrchardGateway};
pub use scheduler::{
    spawn_activator, spawn_scheduler, ActivatorConfig, ActivatorDeps, ActivatorTask,
    SchedulerConfig, SchedulerDeps, SchedulerTask,
};
pub use store::{
    MemoryStore, PostgresStore, ScheduleStatus, ScheduledWorkflow, Workflow, WorkflowStore,
};
