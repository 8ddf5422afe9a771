//! Workflow catalog persistence.
//!
//! The store holds four tables: workflows, their materialized scheduled
//! instances, and one lease table per pipeline stage. Capability traits keep
//! each component coupled only to the operations it needs; `PostgresStore`
//! implements all of them, and `MemoryStore` backs the tests.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::every::Every;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for a workflow definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a scheduled workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScheduledId(pub Uuid);

impl ScheduledId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ScheduledId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ScheduledId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Models
// ============================================================================

/// A recurring workflow definition.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub id: WorkflowId,
    /// Unique among live (non-soft-deleted) workflows.
    pub name: String,
    /// `s3://bucket/key` of a blob to fetch before running the generator,
    /// or empty when the generator is already available locally.
    pub artifact: String,
    /// JSON-encoded argv of the payload generator.
    pub command: String,
    pub every: Every,
    pub next_runtime: DateTime<Utc>,
    pub backfill: bool,
    /// Notification topic for dispatch failures.
    pub owner: Option<String>,
    pub is_active: bool,
    /// Stagger between instance start times produced by one tick.
    pub schedule_delay_minutes: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// User-visible workflow fields accepted by the control API upsert.
#[derive(Debug, Clone)]
pub struct WorkflowFields {
    pub name: String,
    pub artifact: String,
    pub command: String,
    pub every: Every,
    pub next_runtime: DateTime<Utc>,
    pub backfill: bool,
    pub owner: Option<String>,
    pub is_active: bool,
    pub schedule_delay_minutes: i64,
}

/// Status of a scheduled workflow instance.
///
/// `Created` is the only non-terminal state; everything else records the
/// outcome of an activation or a compensation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleStatus {
    Created,
    Activated,
    Canceled,
    CancelFailed,
    Deleted,
    DeleteFailed,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Activated => "activated",
            Self::Canceled => "canceled",
            Self::CancelFailed => "cancel_failed",
            Self::Deleted => "deleted",
            Self::DeleteFailed => "delete_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "activated" => Some(Self::Activated),
            "canceled" => Some(Self::Canceled),
            "cancel_failed" => Some(Self::CancelFailed),
            "deleted" => Some(Self::Deleted),
            "delete_failed" => Some(Self::DeleteFailed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One materialized run of a workflow on Orchard.
#[derive(Debug, Clone)]
pub struct ScheduledWorkflow {
    pub id: ScheduledId,
    pub workflow_id: WorkflowId,
    /// Identifier returned by Orchard on create.
    pub orchard_id: String,
    /// The parent's `next_runtime` at dispatch time.
    pub scheduled_start_time: DateTime<Utc>,
    /// When the activator becomes eligible to activate this instance.
    pub start_time: DateTime<Utc>,
    pub status: ScheduleStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything one dispatcher tick persists atomically: the per-payload
/// outcome rows and the advanced schedule.
#[derive(Debug, Clone)]
pub struct DispatchRecord {
    pub workflow_id: WorkflowId,
    /// `next_runtime` of the workflow at dispatch, stamped on every row.
    pub scheduled_start_time: DateTime<Utc>,
    /// `(orchard_id, status)` in generator order.
    pub outcomes: Vec<(String, ScheduleStatus)>,
    /// Start time of the first instance; each following instance is
    /// staggered by `delay`.
    pub first_start_time: DateTime<Utc>,
    pub delay: Duration,
    /// The advanced `next_runtime` to write back on the workflow.
    pub next_runtime: DateTime<Utc>,
}

// ============================================================================
// Listing
// ============================================================================

/// Sortable workflow columns exposed by the control API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderBy {
    Name,
    NextRuntime,
    IsActive,
    Owner,
    ScheduleDelayMinutes,
    Artifact,
    Command,
    Backfill,
}

impl OrderBy {
    /// Parse the camelCase field name used on the wire.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "name" => Some(Self::Name),
            "nextRuntime" => Some(Self::NextRuntime),
            "isActive" => Some(Self::IsActive),
            "owner" => Some(Self::Owner),
            "scheduleDelayMinutes" => Some(Self::ScheduleDelayMinutes),
            "artifact" => Some(Self::Artifact),
            "command" => Some(Self::Command),
            "backfill" => Some(Self::Backfill),
            _ => None,
        }
    }

    pub fn column(&self) -> &'static str {
        match self {
            Self::Name => "name",
            Self::NextRuntime => "next_runtime",
            Self::IsActive => "is_active",
            Self::Owner => "owner",
            Self::ScheduleDelayMinutes => "schedule_delay_minutes",
            Self::Artifact => "artifact",
            Self::Command => "command",
            Self::Backfill => "backfill",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDir {
    Asc,
    Desc,
}

impl OrderDir {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "asc" => Some(Self::Asc),
            "desc" => Some(Self::Desc),
            _ => None,
        }
    }

    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Validated list query; `page` and `limit` are both >= 1.
#[derive(Debug, Clone)]
pub struct ListQuery {
    pub order_by: OrderBy,
    pub order_dir: OrderDir,
    pub page: i64,
    pub limit: i64,
    /// Substring filter on `name`.
    pub like: Option<String>,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            order_by: OrderBy::Name,
            order_dir: OrderDir::Asc,
            page: 1,
            limit: 50,
            like: None,
        }
    }
}

/// One page of workflows plus the unpaged match count.
#[derive(Debug, Clone)]
pub struct WorkflowPage {
    pub workflows: Vec<Workflow>,
    pub total: i64,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A persisted value failed validation on read, e.g. an unknown
    /// instance status or a malformed `every` string.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ============================================================================
// Capability traits
// ============================================================================

/// Store operations backing the control API.
#[async_trait]
pub trait ControlStore: Send + Sync {
    /// Insert or, on a name conflict, update the recognized columns and
    /// clear the soft-delete marker.
    async fn upsert_workflow(&self, fields: &WorkflowFields) -> StoreResult<()>;

    /// Soft-delete by name. Returns false when no live row matched.
    async fn soft_delete_workflow(&self, name: &str) -> StoreResult<bool>;

    /// Fetch a live workflow by name.
    async fn get_workflow(&self, name: &str) -> StoreResult<Option<Workflow>>;

    async fn list_workflows(&self, query: &ListQuery) -> StoreResult<WorkflowPage>;
}

/// Store operations backing the scheduler loop and dispatcher workers.
#[async_trait]
pub trait SchedulerStore: Send + Sync {
    /// Active, unleased workflows whose `next_runtime` has elapsed.
    async fn find_due_workflows(&self, now: DateTime<Utc>) -> StoreResult<Vec<Workflow>>;

    /// Insert a scheduler lease row and read it back. Returns false when the
    /// insert conflicts or the read-back token differs; the caller must not
    /// dispatch in that case.
    async fn try_acquire_scheduler_lease(
        &self,
        workflow_id: WorkflowId,
        token: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Delete the lease row matching `(workflow_id, token)`.
    async fn release_scheduler_lease(&self, workflow_id: WorkflowId, token: Uuid)
        -> StoreResult<()>;

    /// Persist one tick's outcome rows and advance `next_runtime`, in a
    /// single transaction. An observer never sees the schedule move forward
    /// without its instance rows.
    async fn record_dispatch(&self, record: &DispatchRecord) -> StoreResult<()>;
}

/// Store operations backing the activator loop and workers.
#[async_trait]
pub trait ActivatorStore: Send + Sync {
    /// Unleased `created` instances whose `start_time` has elapsed, in
    /// `start_time` ascending order.
    async fn find_due_instances(&self, now: DateTime<Utc>) -> StoreResult<Vec<ScheduledWorkflow>>;

    async fn try_acquire_activator_lease(
        &self,
        scheduled_id: ScheduledId,
        token: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn release_activator_lease(
        &self,
        scheduled_id: ScheduledId,
        token: Uuid,
    ) -> StoreResult<()>;

    async fn set_instance_status(
        &self,
        scheduled_id: ScheduledId,
        status: ScheduleStatus,
    ) -> StoreResult<()>;

    /// Load the live parent workflow of an instance, if any.
    async fn workflow_for_instance(&self, workflow_id: WorkflowId)
        -> StoreResult<Option<Workflow>>;
}

/// Store operations backing the cleanup sweep.
#[async_trait]
pub trait CleanupStore: Send + Sync {
    /// Delete scheduler leases with `lock_time` before `horizon`.
    async fn purge_expired_scheduler_leases(&self, horizon: DateTime<Utc>) -> StoreResult<u64>;

    /// Delete activator leases with `lock_time` before `horizon`.
    async fn purge_expired_activator_leases(&self, horizon: DateTime<Utc>) -> StoreResult<u64>;

    /// Hard-delete instance rows last touched before `horizon`.
    async fn purge_expired_instances(&self, horizon: DateTime<Utc>) -> StoreResult<u64>;
}

/// Convenience bound for backends implementing the full surface.
pub trait WorkflowStore: ControlStore + SchedulerStore + ActivatorStore + CleanupStore {}

impl<T: ControlStore + SchedulerStore + ActivatorStore + CleanupStore> WorkflowStore for T {}
