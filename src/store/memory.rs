//! In-memory store for tests and local runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{
    ActivatorStore, CleanupStore, ControlStore, DispatchRecord, ListQuery, OrderBy, OrderDir,
    ScheduleStatus, ScheduledId, ScheduledWorkflow, SchedulerStore, StoreResult, Workflow,
    WorkflowFields, WorkflowId, WorkflowPage,
};

#[derive(Debug, Clone, Copy)]
struct Lease {
    token: Uuid,
    lock_time: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    workflows: HashMap<WorkflowId, Workflow>,
    instances: HashMap<ScheduledId, ScheduledWorkflow>,
    scheduler_locks: HashMap<WorkflowId, Lease>,
    activator_locks: HashMap<ScheduledId, Lease>,
}

/// Store that keeps the whole catalog behind a mutex.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all instance rows, ordered by start time.
    pub fn instances(&self) -> Vec<ScheduledWorkflow> {
        let inner = self.inner.lock().expect("memory store poisoned");
        let mut instances: Vec<_> = inner.instances.values().cloned().collect();
        instances.sort_by_key(|i| (i.start_time, i.created_at));
        instances
    }

    /// Snapshot of all workflow rows, soft-deleted included.
    pub fn workflows(&self) -> Vec<Workflow> {
        let inner = self.inner.lock().expect("memory store poisoned");
        inner.workflows.values().cloned().collect()
    }

    pub fn scheduler_lock_count(&self) -> usize {
        let inner = self.inner.lock().expect("memory store poisoned");
        inner.scheduler_locks.len()
    }

    pub fn activator_lock_count(&self) -> usize {
        let inner = self.inner.lock().expect("memory store poisoned");
        inner.activator_locks.len()
    }

    /// Insert a workflow row directly, bypassing upsert defaults.
    pub fn insert_workflow(&self, workflow: Workflow) {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.workflows.insert(workflow.id, workflow);
    }

    /// Insert an instance row directly.
    pub fn insert_instance(&self, instance: ScheduledWorkflow) {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.instances.insert(instance.id, instance);
    }
}

#[async_trait]
impl ControlStore for MemoryStore {
    async fn upsert_workflow(&self, fields: &WorkflowFields) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let now = Utc::now();
        let existing = inner
            .workflows
            .values()
            .find(|w| w.name == fields.name)
            .map(|w| w.id);
        match existing {
            Some(id) => {
                let workflow = inner
                    .workflows
                    .get_mut(&id)
                    .expect("workflow disappeared under lock");
                workflow.artifact = fields.artifact.clone();
                workflow.command = fields.command.clone();
                workflow.every = fields.every;
                workflow.next_runtime = fields.next_runtime;
                workflow.backfill = fields.backfill;
                workflow.owner = fields.owner.clone();
                workflow.is_active = fields.is_active;
                workflow.schedule_delay_minutes = fields.schedule_delay_minutes;
                workflow.updated_at = now;
                workflow.deleted_at = None;
            }
            None => {
                let id = WorkflowId::new();
                inner.workflows.insert(
                    id,
                    Workflow {
                        id,
                        name: fields.name.clone(),
                        artifact: fields.artifact.clone(),
                        command: fields.command.clone(),
                        every: fields.every,
                        next_runtime: fields.next_runtime,
                        backfill: fields.backfill,
                        owner: fields.owner.clone(),
                        is_active: fields.is_active,
                        schedule_delay_minutes: fields.schedule_delay_minutes,
                        created_at: now,
                        updated_at: now,
                        deleted_at: None,
                    },
                );
            }
        }
        Ok(())
    }

    async fn soft_delete_workflow(&self, name: &str) -> StoreResult<bool> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let now = Utc::now();
        let target = inner
            .workflows
            .values_mut()
            .find(|w| w.name == name && w.deleted_at.is_none());
        match target {
            Some(workflow) => {
                workflow.deleted_at = Some(now);
                workflow.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_workflow(&self, name: &str) -> StoreResult<Option<Workflow>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner
            .workflows
            .values()
            .find(|w| w.name == name && w.deleted_at.is_none())
            .cloned())
    }

    async fn list_workflows(&self, query: &ListQuery) -> StoreResult<WorkflowPage> {
        let inner = self.inner.lock().expect("memory store poisoned");
        let mut matches: Vec<Workflow> = inner
            .workflows
            .values()
            .filter(|w| w.deleted_at.is_none())
            .filter(|w| match &query.like {
                Some(pattern) => w.name.contains(pattern.as_str()),
                None => true,
            })
            .cloned()
            .collect();

        matches.sort_by(|a, b| {
            let ordering = match query.order_by {
                OrderBy::Name => a.name.cmp(&b.name),
                OrderBy::NextRuntime => a.next_runtime.cmp(&b.next_runtime),
                OrderBy::IsActive => a.is_active.cmp(&b.is_active),
                OrderBy::Owner => a.owner.cmp(&b.owner),
                OrderBy::ScheduleDelayMinutes => {
                    a.schedule_delay_minutes.cmp(&b.schedule_delay_minutes)
                }
                OrderBy::Artifact => a.artifact.cmp(&b.artifact),
                OrderBy::Command => a.command.cmp(&b.command),
                OrderBy::Backfill => a.backfill.cmp(&b.backfill),
            };
            match query.order_dir {
                OrderDir::Asc => ordering,
                OrderDir::Desc => ordering.reverse(),
            }
        });

        let total = matches.len() as i64;
        let offset = ((query.page - 1) * query.limit).max(0) as usize;
        let workflows = matches
            .into_iter()
            .skip(offset)
            .take(query.limit.max(0) as usize)
            .collect();
        Ok(WorkflowPage { workflows, total })
    }
}

#[async_trait]
impl SchedulerStore for MemoryStore {
    async fn find_due_workflows(&self, now: DateTime<Utc>) -> StoreResult<Vec<Workflow>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner
            .workflows
            .values()
            .filter(|w| {
                w.next_runtime <= now
                    && w.is_active
                    && w.deleted_at.is_none()
                    && !inner.scheduler_locks.contains_key(&w.id)
            })
            .cloned()
            .collect())
    }

    async fn try_acquire_scheduler_lease(
        &self,
        workflow_id: WorkflowId,
        token: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        if inner.scheduler_locks.contains_key(&workflow_id) {
            return Ok(false);
        }
        inner
            .scheduler_locks
            .insert(workflow_id, Lease { token, lock_time: now });
        // Read-back check, as the SQL backend does.
        Ok(inner
            .scheduler_locks
            .get(&workflow_id)
            .is_some_and(|lease| lease.token == token))
    }

    async fn release_scheduler_lease(
        &self,
        workflow_id: WorkflowId,
        token: Uuid,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        if inner
            .scheduler_locks
            .get(&workflow_id)
            .is_some_and(|lease| lease.token == token)
        {
            inner.scheduler_locks.remove(&workflow_id);
        }
        Ok(())
    }

    async fn record_dispatch(&self, record: &DispatchRecord) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let now = Utc::now();
        let mut start_time = record.first_start_time;
        for (orchard_id, status) in &record.outcomes {
            let id = ScheduledId::new();
            inner.instances.insert(
                id,
                ScheduledWorkflow {
                    id,
                    workflow_id: record.workflow_id,
                    orchard_id: orchard_id.clone(),
                    scheduled_start_time: record.scheduled_start_time,
                    start_time,
                    status: *status,
                    created_at: now,
                    updated_at: now,
                },
            );
            start_time += record.delay;
        }
        if let Some(workflow) = inner.workflows.get_mut(&record.workflow_id) {
            workflow.next_runtime = record.next_runtime;
            workflow.updated_at = now;
        }
        Ok(())
    }
}

#[async_trait]
impl ActivatorStore for MemoryStore {
    async fn find_due_instances(&self, now: DateTime<Utc>) -> StoreResult<Vec<ScheduledWorkflow>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        let mut due: Vec<ScheduledWorkflow> = inner
            .instances
            .values()
            .filter(|i| {
                i.start_time <= now
                    && i.status == ScheduleStatus::Created
                    && !inner.activator_locks.contains_key(&i.id)
            })
            .cloned()
            .collect();
        due.sort_by_key(|i| (i.start_time, i.created_at));
        Ok(due)
    }

    async fn try_acquire_activator_lease(
        &self,
        scheduled_id: ScheduledId,
        token: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        if inner.activator_locks.contains_key(&scheduled_id) {
            return Ok(false);
        }
        inner
            .activator_locks
            .insert(scheduled_id, Lease { token, lock_time: now });
        Ok(inner
            .activator_locks
            .get(&scheduled_id)
            .is_some_and(|lease| lease.token == token))
    }

    async fn release_activator_lease(
        &self,
        scheduled_id: ScheduledId,
        token: Uuid,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        if inner
            .activator_locks
            .get(&scheduled_id)
            .is_some_and(|lease| lease.token == token)
        {
            inner.activator_locks.remove(&scheduled_id);
        }
        Ok(())
    }

    async fn set_instance_status(
        &self,
        scheduled_id: ScheduledId,
        status: ScheduleStatus,
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        if let Some(instance) = inner.instances.get_mut(&scheduled_id) {
            instance.status = status;
            instance.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn workflow_for_instance(
        &self,
        workflow_id: WorkflowId,
    ) -> StoreResult<Option<Workflow>> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner
            .workflows
            .get(&workflow_id)
            .filter(|w| w.deleted_at.is_none())
            .cloned())
    }
}

#[async_trait]
impl CleanupStore for MemoryStore {
    async fn purge_expired_scheduler_leases(&self, horizon: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let before = inner.scheduler_locks.len();
        inner.scheduler_locks.retain(|_, lease| lease.lock_time >= horizon);
        Ok((before - inner.scheduler_locks.len()) as u64)
    }

    async fn purge_expired_activator_leases(&self, horizon: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let before = inner.activator_locks.len();
        inner.activator_locks.retain(|_, lease| lease.lock_time >= horizon);
        Ok((before - inner.activator_locks.len()) as u64)
    }

    async fn purge_expired_instances(&self, horizon: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        let before = inner.instances.len();
        inner.instances.retain(|_, instance| instance.updated_at >= horizon);
        Ok((before - inner.instances.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::every::{Every, EveryUnit};

    fn fields(name: &str) -> WorkflowFields {
        WorkflowFields {
            name: name.to_string(),
            artifact: String::new(),
            command: r#"["echo", "[]"]"#.to_string(),
            every: Every::new(1, EveryUnit::Day),
            next_runtime: Utc::now(),
            backfill: false,
            owner: None,
            is_active: true,
            schedule_delay_minutes: 0,
        }
    }

    #[tokio::test]
    async fn upsert_updates_existing_row_by_name() {
        let store = MemoryStore::new();
        store.upsert_workflow(&fields("daily")).await.unwrap();

        let mut updated = fields("daily");
        updated.artifact = "s3://bucket/job.jar".to_string();
        store.upsert_workflow(&updated).await.unwrap();

        assert_eq!(store.workflows().len(), 1);
        let workflow = store.get_workflow("daily").await.unwrap().unwrap();
        assert_eq!(workflow.artifact, "s3://bucket/job.jar");
    }

    #[tokio::test]
    async fn upsert_resurrects_soft_deleted_row() {
        let store = MemoryStore::new();
        store.upsert_workflow(&fields("daily")).await.unwrap();
        assert!(store.soft_delete_workflow("daily").await.unwrap());
        assert!(store.get_workflow("daily").await.unwrap().is_none());

        store.upsert_workflow(&fields("daily")).await.unwrap();
        assert_eq!(store.workflows().len(), 1, "no duplicate row after resurrect");
        assert!(store.get_workflow("daily").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn soft_delete_missing_workflow_reports_not_found() {
        let store = MemoryStore::new();
        assert!(!store.soft_delete_workflow("ghost").await.unwrap());
    }

    #[tokio::test]
    async fn due_workflows_exclude_leased_inactive_and_deleted() {
        let store = MemoryStore::new();
        let now = Utc::now();

        for (name, active) in [("due", true), ("inactive", false), ("leased", true)] {
            let mut f = fields(name);
            f.is_active = active;
            f.next_runtime = now - Duration::seconds(5);
            store.upsert_workflow(&f).await.unwrap();
        }
        let mut future = fields("future");
        future.next_runtime = now + Duration::hours(1);
        store.upsert_workflow(&future).await.unwrap();
        store.upsert_workflow(&fields("deleted")).await.unwrap();
        store.soft_delete_workflow("deleted").await.unwrap();

        let leased = store.get_workflow("leased").await.unwrap().unwrap();
        assert!(store
            .try_acquire_scheduler_lease(leased.id, Uuid::new_v4(), now)
            .await
            .unwrap());

        let due = store.find_due_workflows(now).await.unwrap();
        let names: Vec<&str> = due.iter().map(|w| w.name.as_str()).collect();
        assert_eq!(names, vec!["due"]);
    }

    #[tokio::test]
    async fn second_lease_acquire_is_contended() {
        let store = MemoryStore::new();
        let id = WorkflowId::new();
        let now = Utc::now();

        assert!(store
            .try_acquire_scheduler_lease(id, Uuid::new_v4(), now)
            .await
            .unwrap());
        assert!(!store
            .try_acquire_scheduler_lease(id, Uuid::new_v4(), now)
            .await
            .unwrap());
        assert_eq!(store.scheduler_lock_count(), 1);
    }

    #[tokio::test]
    async fn release_requires_matching_token() {
        let store = MemoryStore::new();
        let id = WorkflowId::new();
        let token = Uuid::new_v4();

        assert!(store
            .try_acquire_scheduler_lease(id, token, Utc::now())
            .await
            .unwrap());
        store
            .release_scheduler_lease(id, Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(store.scheduler_lock_count(), 1, "foreign token must not release");
        store.release_scheduler_lease(id, token).await.unwrap();
        assert_eq!(store.scheduler_lock_count(), 0);
    }

    #[tokio::test]
    async fn purges_respect_horizons() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let stale = WorkflowId::new();
        let fresh = WorkflowId::new();

        store
            .try_acquire_scheduler_lease(stale, Uuid::new_v4(), now - Duration::hours(2))
            .await
            .unwrap();
        store
            .try_acquire_scheduler_lease(fresh, Uuid::new_v4(), now)
            .await
            .unwrap();

        let purged = store
            .purge_expired_scheduler_leases(now - Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(store.scheduler_lock_count(), 1);
    }
}
