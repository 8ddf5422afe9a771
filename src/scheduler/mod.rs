//! Background scheduler loop and dispatcher workers.
//!
//! Each tick finds due, active, unleased workflows and hands every one to a
//! detached dispatcher worker. The worker serializes its tick through the
//! scheduler lease table, generates payloads, creates Orchard instances, and
//! persists the outcome rows together with the advanced `next_runtime` in a
//! single transaction. Replica coordination happens entirely through the
//! lease rows; the loop never waits for its workers.

pub mod activator;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::every::next_runtime;
use crate::generator::PayloadGenerator;
use crate::notify::{notify_owner, OwnerNotifier};
use crate::orchard::OrchardClient;
use crate::store::{DispatchRecord, ScheduleStatus, SchedulerStore, Workflow};

pub use activator::{spawn_activator, ActivatorConfig, ActivatorDeps, ActivatorTask};

/// Configuration for the scheduler task.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often to poll for due workflows.
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
        }
    }
}

/// Shared dependencies of the dispatcher workers.
#[derive(Clone)]
pub struct SchedulerDeps {
    pub store: Arc<dyn SchedulerStore>,
    pub orchard: Arc<dyn OrchardClient>,
    pub generator: Arc<dyn PayloadGenerator>,
    pub notifier: Arc<dyn OwnerNotifier>,
}

/// Background scheduler task.
pub struct SchedulerTask {
    deps: SchedulerDeps,
    config: SchedulerConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl SchedulerTask {
    pub fn new(
        deps: SchedulerDeps,
        config: SchedulerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            deps,
            config,
            shutdown_rx,
        }
    }

    /// Run the scheduler loop until shutdown.
    pub async fn run(mut self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis(),
            "scheduler task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("scheduler task shutting down");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(err) = self.poll_and_dispatch().await {
                        error!(error = ?err, "scheduler poll failed");
                    }
                }
            }
        }
    }

    /// Find due workflows and hand each to a detached worker. Mutual
    /// exclusion comes from the lease table, not from awaiting workers.
    async fn poll_and_dispatch(&self) -> Result<()> {
        let due = self.deps.store.find_due_workflows(Utc::now()).await?;
        if due.is_empty() {
            return Ok(());
        }
        debug!(count = due.len(), "found due workflows");

        for workflow in due {
            let deps = self.deps.clone();
            tokio::spawn(async move {
                if let Err(err) = dispatch_workflow(&deps, &workflow).await {
                    error!(
                        workflow = %workflow.name,
                        workflow_id = %workflow.id,
                        error = ?err,
                        "dispatch worker failed"
                    );
                }
            });
        }
        Ok(())
    }
}

/// Dispatch one due workflow under a scheduler lease.
///
/// On contention the tick already belongs to another worker and this is a
/// silent no-op. After acquisition the lease is released on every exit path;
/// if the process dies first, the cleanup sweep's TTL frees the workflow.
async fn dispatch_workflow(deps: &SchedulerDeps, workflow: &Workflow) -> Result<()> {
    let token = Uuid::new_v4();
    if !deps
        .store
        .try_acquire_scheduler_lease(workflow.id, token, Utc::now())
        .await?
    {
        debug!(
            workflow = %workflow.name,
            workflow_id = %workflow.id,
            "another worker owns this dispatch tick, skipping"
        );
        return Ok(());
    }

    info!(workflow = %workflow.name, %token, "dispatching workflow");
    let outcome = run_dispatch(deps, workflow).await;

    if let Err(err) = deps.store.release_scheduler_lease(workflow.id, token).await {
        error!(
            workflow_id = %workflow.id,
            error = ?err,
            "failed to release scheduler lease, cleanup will expire it"
        );
    }
    outcome
}

async fn run_dispatch(deps: &SchedulerDeps, workflow: &Workflow) -> Result<()> {
    let payloads = match deps
        .generator
        .generate(&workflow.artifact, &workflow.command)
        .await
    {
        Ok(payloads) => payloads,
        Err(err) => {
            error!(workflow = %workflow.name, error = %err, "payload generation failed");
            report_failure(deps, workflow, &err.to_string()).await;
            // The schedule still moves forward with zero instances; a broken
            // generator must not redispatch on every tick.
            Vec::new()
        }
    };

    let outcomes = create_instances(deps, workflow, &payloads).await;

    let now = Utc::now();
    let record = DispatchRecord {
        workflow_id: workflow.id,
        scheduled_start_time: workflow.next_runtime,
        outcomes,
        first_start_time: now,
        delay: chrono::Duration::minutes(workflow.schedule_delay_minutes),
        next_runtime: next_runtime(workflow.next_runtime, &workflow.every, workflow.backfill, now),
    };
    deps.store.record_dispatch(&record).await?;
    Ok(())
}

/// Create one Orchard instance per payload, in order.
///
/// On the first failure the previously-created siblings are deleted
/// best-effort and only the compensation outcomes survive; the tick then
/// persists no `created` rows.
async fn create_instances(
    deps: &SchedulerDeps,
    workflow: &Workflow,
    payloads: &[String],
) -> Vec<(String, ScheduleStatus)> {
    let mut outcomes: Vec<(String, ScheduleStatus)> = Vec::with_capacity(payloads.len());
    for payload in payloads {
        match deps.orchard.create(payload).await {
            Ok(orchard_id) => outcomes.push((orchard_id, ScheduleStatus::Created)),
            Err(err) => {
                error!(
                    workflow = %workflow.name,
                    error = %err,
                    created = outcomes.len(),
                    "orchard create failed, deleting siblings from this tick"
                );
                report_failure(deps, workflow, &err.to_string()).await;
                for (orchard_id, status) in &mut outcomes {
                    match deps.orchard.delete(orchard_id).await {
                        Ok(()) => *status = ScheduleStatus::Deleted,
                        Err(delete_err) => {
                            error!(
                                orchard_id = orchard_id.as_str(),
                                error = %delete_err,
                                "failed to delete orphaned orchard workflow"
                            );
                            *status = ScheduleStatus::DeleteFailed;
                        }
                    }
                }
                break;
            }
        }
    }
    outcomes
}

async fn report_failure(deps: &SchedulerDeps, workflow: &Workflow, error: &str) {
    let message = format!(
        "failed to schedule workflow {:?} with error: {error}",
        workflow.name
    );
    notify_owner(deps.notifier.as_ref(), workflow.owner.as_deref(), &message).await;
}

/// Convenience function to spawn a scheduler task.
pub fn spawn_scheduler(
    deps: SchedulerDeps,
    config: SchedulerConfig,
) -> (tokio::task::JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = SchedulerTask::new(deps, config, shutdown_rx);
    let handle = tokio::spawn(task.run());
    (handle, shutdown_tx)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration, Utc};

    use super::*;
    use crate::every::{Every, EveryUnit};
    use crate::generator::GeneratorError;
    use crate::notify::MemoryNotifier;
    use crate::orchard::MemoryOrchard;
    use crate::store::{MemoryStore, SchedulerStore, WorkflowId};

    struct StaticGenerator {
        payloads: Vec<String>,
        fail: bool,
    }

    impl StaticGenerator {
        fn ok(payloads: &[&str]) -> Self {
            Self {
                payloads: payloads.iter().map(|p| p.to_string()).collect(),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                payloads: Vec::new(),
                fail: true,
            }
        }
    }

    #[async_trait]
    impl PayloadGenerator for StaticGenerator {
        async fn generate(
            &self,
            _artifact: &str,
            _command: &str,
        ) -> Result<Vec<String>, GeneratorError> {
            if self.fail {
                return Err(GeneratorError::Failed {
                    status: "exit status: 1".to_string(),
                    output: "boom".to_string(),
                });
            }
            Ok(self.payloads.clone())
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        orchard: Arc<MemoryOrchard>,
        notifier: Arc<MemoryNotifier>,
        deps: SchedulerDeps,
    }

    fn harness(generator: StaticGenerator) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let orchard = Arc::new(MemoryOrchard::new());
        let notifier = Arc::new(MemoryNotifier::new());
        let deps = SchedulerDeps {
            store: store.clone(),
            orchard: orchard.clone(),
            generator: Arc::new(generator),
            notifier: notifier.clone(),
        };
        Harness {
            store,
            orchard,
            notifier,
            deps,
        }
    }

    fn due_workflow(next_runtime: DateTime<Utc>, delay_minutes: i64) -> Workflow {
        let now = Utc::now();
        Workflow {
            id: WorkflowId::new(),
            name: "w1".to_string(),
            artifact: String::new(),
            command: r#"["generator"]"#.to_string(),
            every: Every::new(1, EveryUnit::Hour),
            next_runtime,
            backfill: false,
            owner: Some("arn:owner-topic".to_string()),
            is_active: true,
            schedule_delay_minutes: delay_minutes,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn dispatches_single_instance_and_advances_schedule() {
        let h = harness(StaticGenerator::ok(&["p"]));
        let scheduled_start = Utc::now() - ChronoDuration::seconds(1);
        let workflow = due_workflow(scheduled_start, 5);
        h.store.insert_workflow(workflow.clone());

        dispatch_workflow(&h.deps, &workflow).await.unwrap();

        let instances = h.store.instances();
        assert_eq!(instances.len(), 1);
        let instance = &instances[0];
        assert_eq!(instance.status, ScheduleStatus::Created);
        assert_eq!(instance.scheduled_start_time, scheduled_start);
        assert!(instance.scheduled_start_time <= instance.start_time);
        assert_eq!(
            h.orchard.status_of(&instance.orchard_id).as_deref(),
            Some("pending")
        );

        let stored = &h.store.workflows()[0];
        assert_eq!(stored.next_runtime, scheduled_start + ChronoDuration::hours(1));
        assert!(h.notifier.messages().is_empty());
    }

    #[tokio::test]
    async fn staggers_instances_in_generator_order() {
        let h = harness(StaticGenerator::ok(&["pa", "pb", "pc"]));
        let workflow = due_workflow(Utc::now() - ChronoDuration::seconds(1), 5);
        h.store.insert_workflow(workflow.clone());

        dispatch_workflow(&h.deps, &workflow).await.unwrap();

        let instances = h.store.instances();
        assert_eq!(instances.len(), 3);
        for pair in instances.windows(2) {
            assert_eq!(
                pair[1].start_time - pair[0].start_time,
                ChronoDuration::minutes(5)
            );
        }
        // MemoryStore::instances is start_time-ordered, so activation order
        // matches the generator's payload order.
        assert_eq!(h.orchard.created_payloads(), vec!["pa", "pb", "pc"]);
    }

    #[tokio::test]
    async fn partial_create_failure_compensates_and_still_advances() {
        let h = harness(StaticGenerator::ok(&["pa", "pb", "pc"]));
        h.orchard.fail_create_at(1);
        let scheduled_start = Utc::now() - ChronoDuration::seconds(1);
        let workflow = due_workflow(scheduled_start, 5);
        h.store.insert_workflow(workflow.clone());

        dispatch_workflow(&h.deps, &workflow).await.unwrap();

        let instances = h.store.instances();
        assert_eq!(instances.len(), 1, "only the compensated sibling is recorded");
        assert_eq!(instances[0].status, ScheduleStatus::Deleted);
        assert_eq!(h.orchard.deleted_ids().len(), 1);
        assert!(
            !instances
                .iter()
                .any(|i| i.status == ScheduleStatus::Created),
            "a failed tick must not leave created rows"
        );

        assert_eq!(h.notifier.messages().len(), 1);
        let stored = &h.store.workflows()[0];
        assert_eq!(stored.next_runtime, scheduled_start + ChronoDuration::hours(1));
    }

    #[tokio::test]
    async fn delete_failure_during_compensation_is_recorded() {
        let h = harness(StaticGenerator::ok(&["pa", "pb"]));
        h.orchard.fail_create_at(1);
        h.orchard.fail_deletes();
        let workflow = due_workflow(Utc::now() - ChronoDuration::seconds(1), 0);
        h.store.insert_workflow(workflow.clone());

        dispatch_workflow(&h.deps, &workflow).await.unwrap();

        let instances = h.store.instances();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].status, ScheduleStatus::DeleteFailed);
    }

    #[tokio::test]
    async fn contended_lease_skips_dispatch() {
        let h = harness(StaticGenerator::ok(&["p"]));
        let workflow = due_workflow(Utc::now() - ChronoDuration::seconds(1), 0);
        h.store.insert_workflow(workflow.clone());

        // Another replica already owns this tick.
        assert!(h
            .store
            .try_acquire_scheduler_lease(workflow.id, Uuid::new_v4(), Utc::now())
            .await
            .unwrap());

        dispatch_workflow(&h.deps, &workflow).await.unwrap();

        assert!(h.store.instances().is_empty());
        assert_eq!(
            h.store.workflows()[0].next_runtime,
            workflow.next_runtime,
            "schedule untouched on contention"
        );
    }

    #[tokio::test]
    async fn lease_is_released_after_dispatch() {
        let h = harness(StaticGenerator::ok(&["p"]));
        let workflow = due_workflow(Utc::now() - ChronoDuration::seconds(1), 0);
        h.store.insert_workflow(workflow.clone());

        dispatch_workflow(&h.deps, &workflow).await.unwrap();
        assert_eq!(h.store.scheduler_lock_count(), 0);
    }

    #[tokio::test]
    async fn non_backfill_catchup_lands_strictly_in_the_future() {
        let h = harness(StaticGenerator::ok(&["p"]));
        let workflow = due_workflow(Utc::now() - ChronoDuration::hours(3), 0);
        h.store.insert_workflow(workflow.clone());

        dispatch_workflow(&h.deps, &workflow).await.unwrap();

        assert_eq!(h.store.instances().len(), 1);
        assert!(h.store.workflows()[0].next_runtime > Utc::now());
    }

    #[tokio::test]
    async fn backfill_advances_exactly_one_interval() {
        let h = harness(StaticGenerator::ok(&["p"]));
        let start = Utc::now() - ChronoDuration::hours(3);
        let mut workflow = due_workflow(start, 0);
        workflow.backfill = true;
        h.store.insert_workflow(workflow.clone());

        dispatch_workflow(&h.deps, &workflow).await.unwrap();

        assert_eq!(
            h.store.workflows()[0].next_runtime,
            start + ChronoDuration::hours(1),
            "backfill leaves catch-up runs for following ticks"
        );
    }

    #[tokio::test]
    async fn generator_failure_notifies_owner_and_ticks_clock() {
        let h = harness(StaticGenerator::failing());
        let scheduled_start = Utc::now() - ChronoDuration::seconds(1);
        let workflow = due_workflow(scheduled_start, 0);
        h.store.insert_workflow(workflow.clone());

        dispatch_workflow(&h.deps, &workflow).await.unwrap();

        assert!(h.store.instances().is_empty());
        let messages = h.notifier.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, "arn:owner-topic");
        assert!(messages[0].1.contains("boom"));
        assert_eq!(
            h.store.workflows()[0].next_runtime,
            scheduled_start + ChronoDuration::hours(1)
        );
        assert_eq!(h.store.scheduler_lock_count(), 0);
    }

    #[tokio::test]
    async fn empty_generator_output_advances_without_instances() {
        let h = harness(StaticGenerator::ok(&[]));
        let scheduled_start = Utc::now() - ChronoDuration::seconds(1);
        let workflow = due_workflow(scheduled_start, 0);
        h.store.insert_workflow(workflow.clone());

        dispatch_workflow(&h.deps, &workflow).await.unwrap();

        assert!(h.store.instances().is_empty());
        assert!(h.notifier.messages().is_empty());
        assert_eq!(
            h.store.workflows()[0].next_runtime,
            scheduled_start + ChronoDuration::hours(1)
        );
    }
}
