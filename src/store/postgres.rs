//! PostgreSQL store implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

use super::{
    ActivatorStore, CleanupStore, ControlStore, DispatchRecord, ListQuery, ScheduleStatus,
    ScheduledId, ScheduledWorkflow, SchedulerStore, StoreError, StoreResult, Workflow,
    WorkflowFields, WorkflowId, WorkflowPage,
};
use crate::every::Every;

const WORKFLOW_COLUMNS: &str = "id, name, artifact, command, every, next_runtime, backfill, \
     owner, is_active, schedule_delay_minutes, created_at, updated_at, deleted_at";

const SCHEDULED_COLUMNS: &str =
    "id, workflow_id, orchard_id, scheduled_start_time, start_time, status, created_at, updated_at";

/// Store backed by a PostgreSQL connection pool.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to the database and run migrations.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        Self::connect_with_pool_size(database_url, 10).await
    }

    /// Connect with a custom pool size.
    pub async fn connect_with_pool_size(
        database_url: &str,
        max_connections: u32,
    ) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool, running migrations first.
    pub async fn from_pool(pool: PgPool) -> StoreResult<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn workflow_from_row(row: &PgRow) -> StoreResult<Workflow> {
    let every: String = row.get("every");
    let every: Every = every
        .parse()
        .map_err(|err| StoreError::Corrupt(format!("workflow every: {err}")))?;
    Ok(Workflow {
        id: WorkflowId(row.get("id")),
        name: row.get("name"),
        artifact: row.get("artifact"),
        command: row.get("command"),
        every,
        next_runtime: row.get("next_runtime"),
        backfill: row.get("backfill"),
        owner: row.get("owner"),
        is_active: row.get("is_active"),
        schedule_delay_minutes: row.get("schedule_delay_minutes"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        deleted_at: row.get("deleted_at"),
    })
}

fn scheduled_from_row(row: &PgRow) -> StoreResult<ScheduledWorkflow> {
    let status: String = row.get("status");
    let status = ScheduleStatus::parse(&status)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown instance status {status:?}")))?;
    Ok(ScheduledWorkflow {
        id: ScheduledId(row.get("id")),
        workflow_id: WorkflowId(row.get("workflow_id")),
        orchard_id: row.get("orchard_id"),
        scheduled_start_time: row.get("scheduled_start_time"),
        start_time: row.get("start_time"),
        status,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[async_trait]
impl ControlStore for PostgresStore {
    async fn upsert_workflow(&self, fields: &WorkflowFields) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO workflows
                (name, artifact, command, every, next_runtime, backfill, owner,
                 is_active, schedule_delay_minutes)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (name) DO UPDATE SET
                artifact = EXCLUDED.artifact,
                command = EXCLUDED.command,
                every = EXCLUDED.every,
                next_runtime = EXCLUDED.next_runtime,
                backfill = EXCLUDED.backfill,
                owner = EXCLUDED.owner,
                is_active = EXCLUDED.is_active,
                schedule_delay_minutes = EXCLUDED.schedule_delay_minutes,
                updated_at = now(),
                deleted_at = NULL
            "#,
        )
        .bind(&fields.name)
        .bind(&fields.artifact)
        .bind(&fields.command)
        .bind(fields.every.to_string())
        .bind(fields.next_runtime)
        .bind(fields.backfill)
        .bind(&fields.owner)
        .bind(fields.is_active)
        .bind(fields.schedule_delay_minutes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn soft_delete_workflow(&self, name: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workflows
            SET deleted_at = now(), updated_at = now()
            WHERE name = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_workflow(&self, name: &str) -> StoreResult<Option<Workflow>> {
        let row = sqlx::query(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE name = $1 AND deleted_at IS NULL"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(workflow_from_row).transpose()
    }

    async fn list_workflows(&self, query: &ListQuery) -> StoreResult<WorkflowPage> {
        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM workflows
            WHERE deleted_at IS NULL
              AND ($1::text IS NULL OR name LIKE '%' || $1 || '%')
            "#,
        )
        .bind(&query.like)
        .fetch_one(&self.pool)
        .await?;

        // Column and direction come from closed enums, never from the wire.
        let rows = sqlx::query(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows \
             WHERE deleted_at IS NULL \
               AND ($1::text IS NULL OR name LIKE '%' || $1 || '%') \
             ORDER BY {} {} \
             LIMIT $2 OFFSET $3",
            query.order_by.column(),
            query.order_dir.as_sql(),
        ))
        .bind(&query.like)
        .bind(query.limit)
        .bind((query.page - 1) * query.limit)
        .fetch_all(&self.pool)
        .await?;

        let workflows = rows
            .iter()
            .map(workflow_from_row)
            .collect::<StoreResult<Vec<_>>>()?;
        Ok(WorkflowPage { workflows, total })
    }
}

#[async_trait]
impl SchedulerStore for PostgresStore {
    async fn find_due_workflows(&self, now: DateTime<Utc>) -> StoreResult<Vec<Workflow>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM workflows w \
             LEFT JOIN workflow_scheduler_locks l ON w.id = l.workflow_id \
             WHERE w.next_runtime <= $1 \
               AND w.is_active \
               AND w.deleted_at IS NULL \
               AND l.token IS NULL",
            qualified_workflow_columns(),
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(workflow_from_row).collect()
    }

    async fn try_acquire_scheduler_lease(
        &self,
        workflow_id: WorkflowId,
        token: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let inserted = sqlx::query(
            "INSERT INTO workflow_scheduler_locks (workflow_id, token, lock_time) \
             VALUES ($1, $2, $3)",
        )
        .bind(workflow_id.0)
        .bind(token)
        .bind(now)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        }

        // Read back by key: if a racy insert was coalesced by the driver, the
        // surviving token tells us who actually owns the lease.
        let owner: Option<Uuid> = sqlx::query_scalar(
            "SELECT token FROM workflow_scheduler_locks WHERE workflow_id = $1",
        )
        .bind(workflow_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(owner == Some(token))
    }

    async fn release_scheduler_lease(
        &self,
        workflow_id: WorkflowId,
        token: Uuid,
    ) -> StoreResult<()> {
        sqlx::query(
            "DELETE FROM workflow_scheduler_locks WHERE workflow_id = $1 AND token = $2",
        )
        .bind(workflow_id.0)
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_dispatch(&self, record: &DispatchRecord) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let mut start_time = record.first_start_time;
        for (orchard_id, status) in &record.outcomes {
            sqlx::query(
                r#"
                INSERT INTO scheduled_workflows
                    (workflow_id, orchard_id, scheduled_start_time, start_time, status)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(record.workflow_id.0)
            .bind(orchard_id)
            .bind(record.scheduled_start_time)
            .bind(start_time)
            .bind(status.as_str())
            .execute(&mut *tx)
            .await?;
            start_time += record.delay;
        }
        sqlx::query("UPDATE workflows SET next_runtime = $1, updated_at = now() WHERE id = $2")
            .bind(record.next_runtime)
            .bind(record.workflow_id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl ActivatorStore for PostgresStore {
    async fn find_due_instances(&self, now: DateTime<Utc>) -> StoreResult<Vec<ScheduledWorkflow>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM scheduled_workflows s \
             LEFT JOIN workflow_activator_locks l ON s.id = l.scheduled_id \
             WHERE s.start_time <= $1 \
               AND s.status = 'created' \
               AND l.token IS NULL \
             ORDER BY s.start_time",
            qualified_scheduled_columns(),
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(scheduled_from_row).collect()
    }

    async fn try_acquire_activator_lease(
        &self,
        scheduled_id: ScheduledId,
        token: Uuid,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let inserted = sqlx::query(
            "INSERT INTO workflow_activator_locks (scheduled_id, token, lock_time) \
             VALUES ($1, $2, $3)",
        )
        .bind(scheduled_id.0)
        .bind(token)
        .bind(now)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        }

        let owner: Option<Uuid> = sqlx::query_scalar(
            "SELECT token FROM workflow_activator_locks WHERE scheduled_id = $1",
        )
        .bind(scheduled_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(owner == Some(token))
    }

    async fn release_activator_lease(
        &self,
        scheduled_id: ScheduledId,
        token: Uuid,
    ) -> StoreResult<()> {
        sqlx::query(
            "DELETE FROM workflow_activator_locks WHERE scheduled_id = $1 AND token = $2",
        )
        .bind(scheduled_id.0)
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_instance_status(
        &self,
        scheduled_id: ScheduledId,
        status: ScheduleStatus,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE scheduled_workflows SET status = $1, updated_at = now() WHERE id = $2")
            .bind(status.as_str())
            .bind(scheduled_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn workflow_for_instance(
        &self,
        workflow_id: WorkflowId,
    ) -> StoreResult<Option<Workflow>> {
        let row = sqlx::query(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = $1 AND deleted_at IS NULL"
        ))
        .bind(workflow_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(workflow_from_row).transpose()
    }
}

#[async_trait]
impl CleanupStore for PostgresStore {
    async fn purge_expired_scheduler_leases(&self, horizon: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM workflow_scheduler_locks WHERE lock_time < $1")
            .bind(horizon)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn purge_expired_activator_leases(&self, horizon: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM workflow_activator_locks WHERE lock_time < $1")
            .bind(horizon)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn purge_expired_instances(&self, horizon: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM scheduled_workflows WHERE updated_at < $1")
            .bind(horizon)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn qualified_workflow_columns() -> String {
    WORKFLOW_COLUMNS
        .split(", ")
        .map(|col| format!("w.{col}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn qualified_scheduled_columns() -> String {
    SCHEDULED_COLUMNS
        .split(", ")
        .map(|col| format!("s.{col}"))
        .collect::<Vec<_>>()
        .join(", ")
}
