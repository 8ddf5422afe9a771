//! Background activator loop and workers.
//!
//! Mirror of the scheduler loop: each tick finds created-but-unactivated
//! instances whose start time has passed and hands each one to a detached
//! worker. Workers serialize through the activator lease table. A failed
//! activation leaves the instance in `created` so the next tick retries it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::notify::{notify_owner, OwnerNotifier};
use crate::orchard::OrchardClient;
use crate::store::{ActivatorStore, ScheduleStatus, ScheduledWorkflow};

/// Configuration for the activator task.
#[derive(Debug, Clone)]
pub struct ActivatorConfig {
    /// How often to poll for activatable instances.
    pub poll_interval: Duration,
}

impl Default for ActivatorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
        }
    }
}

/// Shared dependencies of the activator workers.
#[derive(Clone)]
pub struct ActivatorDeps {
    pub store: Arc<dyn ActivatorStore>,
    pub orchard: Arc<dyn OrchardClient>,
    pub notifier: Arc<dyn OwnerNotifier>,
}

/// Background activator task.
pub struct ActivatorTask {
    deps: ActivatorDeps,
    config: ActivatorConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl ActivatorTask {
    pub fn new(
        deps: ActivatorDeps,
        config: ActivatorConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            deps,
            config,
            shutdown_rx,
        }
    }

    /// Run the activator loop until shutdown.
    pub async fn run(mut self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis(),
            "activator task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        info!("activator task shutting down");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(err) = self.poll_and_activate().await {
                        error!(error = ?err, "activator poll failed");
                    }
                }
            }
        }
    }

    async fn poll_and_activate(&self) -> Result<()> {
        let due = self.deps.store.find_due_instances(Utc::now()).await?;
        if due.is_empty() {
            return Ok(());
        }
        debug!(count = due.len(), "found activatable instances");

        for instance in due {
            let deps = self.deps.clone();
            tokio::spawn(async move {
                if let Err(err) = activate_instance(&deps, &instance).await {
                    error!(
                        scheduled_id = %instance.id,
                        orchard_id = instance.orchard_id.as_str(),
                        error = ?err,
                        "activator worker failed"
                    );
                }
            });
        }
        Ok(())
    }
}

/// Activate one due instance under an activator lease.
async fn activate_instance(deps: &ActivatorDeps, instance: &ScheduledWorkflow) -> Result<()> {
    let token = Uuid::new_v4();
    if !deps
        .store
        .try_acquire_activator_lease(instance.id, token, Utc::now())
        .await?
    {
        debug!(
            scheduled_id = %instance.id,
            "another worker owns this activation, skipping"
        );
        return Ok(());
    }

    info!(
        orchard_id = instance.orchard_id.as_str(),
        %token,
        "activating workflow instance"
    );
    let outcome = run_activation(deps, instance).await;

    if let Err(err) = deps.store.release_activator_lease(instance.id, token).await {
        error!(
            scheduled_id = %instance.id,
            error = ?err,
            "failed to release activator lease, cleanup will expire it"
        );
    }
    outcome
}

async fn run_activation(deps: &ActivatorDeps, instance: &ScheduledWorkflow) -> Result<()> {
    let workflow = deps.store.workflow_for_instance(instance.workflow_id).await?;

    match deps.orchard.activate(&instance.orchard_id).await {
        Ok(()) => {
            deps.store
                .set_instance_status(instance.id, ScheduleStatus::Activated)
                .await?;
            Ok(())
        }
        Err(err) => {
            // Status stays `created`; the instance remains due and the next
            // activator tick retries it.
            error!(
                orchard_id = instance.orchard_id.as_str(),
                error = %err,
                "orchard activate failed"
            );
            if let Some(workflow) = workflow {
                let message = format!(
                    "failed to activate workflow {:?} instance {} with error: {err}",
                    workflow.name, instance.orchard_id
                );
                notify_owner(deps.notifier.as_ref(), workflow.owner.as_deref(), &message).await;
            }
            Ok(())
        }
    }
}

/// Convenience function to spawn an activator task.
pub fn spawn_activator(
    deps: ActivatorDeps,
    config: ActivatorConfig,
) -> (tokio::task::JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = ActivatorTask::new(deps, config, shutdown_rx);
    let handle = tokio::spawn(task.run());
    (handle, shutdown_tx)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, Utc};

    use super::*;
    use crate::every::{Every, EveryUnit};
    use crate::notify::MemoryNotifier;
    use crate::orchard::{MemoryOrchard, OrchardClient};
    use crate::store::{MemoryStore, ScheduledId, Workflow, WorkflowId};

    struct Harness {
        store: Arc<MemoryStore>,
        orchard: Arc<MemoryOrchard>,
        notifier: Arc<MemoryNotifier>,
        deps: ActivatorDeps,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let orchard = Arc::new(MemoryOrchard::new());
        let notifier = Arc::new(MemoryNotifier::new());
        let deps = ActivatorDeps {
            store: store.clone(),
            orchard: orchard.clone(),
            notifier: notifier.clone(),
        };
        Harness {
            store,
            orchard,
            notifier,
            deps,
        }
    }

    async fn seed_instance(h: &Harness) -> ScheduledWorkflow {
        let now = Utc::now();
        let workflow_id = WorkflowId::new();
        h.store.insert_workflow(Workflow {
            id: workflow_id,
            name: "w1".to_string(),
            artifact: String::new(),
            command: r#"["generator"]"#.to_string(),
            every: Every::new(1, EveryUnit::Hour),
            next_runtime: now + ChronoDuration::hours(1),
            backfill: false,
            owner: Some("arn:owner-topic".to_string()),
            is_active: true,
            schedule_delay_minutes: 0,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        });

        let orchard_id = h.orchard.create("{\"name\": \"p\"}").await.unwrap();
        let instance = ScheduledWorkflow {
            id: ScheduledId::new(),
            workflow_id,
            orchard_id,
            scheduled_start_time: now - ChronoDuration::minutes(1),
            start_time: now - ChronoDuration::minutes(1),
            status: ScheduleStatus::Created,
            created_at: now,
            updated_at: now,
        };
        h.store.insert_instance(instance.clone());
        instance
    }

    #[tokio::test]
    async fn activates_due_instance() {
        let h = harness();
        let instance = seed_instance(&h).await;

        activate_instance(&h.deps, &instance).await.unwrap();

        assert_eq!(h.store.instances()[0].status, ScheduleStatus::Activated);
        assert_eq!(
            h.orchard.status_of(&instance.orchard_id).as_deref(),
            Some("activated")
        );
        assert_eq!(h.store.activator_lock_count(), 0);
        assert!(h.notifier.messages().is_empty());
    }

    #[tokio::test]
    async fn activation_failure_leaves_created_and_notifies() {
        let h = harness();
        let instance = seed_instance(&h).await;
        h.orchard.fail_activations();

        activate_instance(&h.deps, &instance).await.unwrap();

        assert_eq!(
            h.store.instances()[0].status,
            ScheduleStatus::Created,
            "failed activation stays due for the next tick"
        );
        let messages = h.notifier.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, "arn:owner-topic");
        assert_eq!(h.store.activator_lock_count(), 0);
    }

    #[tokio::test]
    async fn contended_lease_skips_activation() {
        let h = harness();
        let instance = seed_instance(&h).await;
        assert!(h
            .store
            .try_acquire_activator_lease(instance.id, Uuid::new_v4(), Utc::now())
            .await
            .unwrap());

        activate_instance(&h.deps, &instance).await.unwrap();

        assert_eq!(h.store.instances()[0].status, ScheduleStatus::Created);
        assert_eq!(
            h.orchard.status_of(&instance.orchard_id).as_deref(),
            Some("pending")
        );
    }

    #[tokio::test]
    async fn activated_instances_are_no_longer_due() {
        let h = harness();
        let instance = seed_instance(&h).await;

        activate_instance(&h.deps, &instance).await.unwrap();

        let due = h.store.find_due_instances(Utc::now()).await.unwrap();
        assert!(due.is_empty());
    }
}
