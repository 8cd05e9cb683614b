//! Postgres-backed persistence adapter.
//!
//! ## Atomicity
//!
//! - `lock_queue_item` is a single conditional `UPDATE … RETURNING`; the
//!   `WHERE` clause is the compare-and-set condition.
//! - `mark_queue_item_result` runs in a transaction holding the row with
//!   `SELECT … FOR UPDATE` while the retry policy is applied.
//! - Every other operation is a single statement.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (check violation) | `23514` | `Serialization` |
//! | Database (other) | Any other | `Storage` |
//! | ColumnDecode / Decode | N/A | `Serialization` |
//! | Other | N/A | `Storage` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use agentops_access::{
    AgentConfig, AgentInstance, BillingPeriod, Entitlement, EntitlementStatus, GateRecords,
    Guardrails, PermissionRecord,
};
use agentops_agents::Usage;
use agentops_core::{AgentInstanceId, QueueItemId, RunId, RunnerId, WorkspaceId};

use super::{OrchestratorStore, QueueStats, StoreError};
use crate::queue::{
    AttemptResult, ErrorDetail, LEASE_DURATION, NewQueueItem, QueueItem, QueueStatus, RetryPolicy,
};
use crate::records::{
    AgentRun, ErrorReport, NewAgentRun, RunCompletion, RunStatus, SystemEvent,
};

/// Schema applied by [`PostgresStore::migrate`]. Idempotent.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS agent_instances (
    id UUID PRIMARY KEY,
    workspace_id UUID NOT NULL,
    agent_type TEXT NOT NULL,
    config JSONB NOT NULL DEFAULT '{}'::jsonb,
    guardrails JSONB NOT NULL DEFAULT '{}'::jsonb
);

CREATE TABLE IF NOT EXISTS agent_permissions (
    agent_instance_id UUID PRIMARY KEY,
    workspace_id UUID NOT NULL,
    scopes JSONB NOT NULL DEFAULT '[]'::jsonb,
    field_restrictions JSONB NOT NULL DEFAULT '{}'::jsonb,
    require_approval_for JSONB NOT NULL DEFAULT '[]'::jsonb
);

CREATE TABLE IF NOT EXISTS workspace_entitlements (
    workspace_id UUID NOT NULL,
    plan_code TEXT NOT NULL,
    status TEXT NOT NULL,
    limits JSONB NOT NULL DEFAULT '{}'::jsonb,
    features JSONB NOT NULL DEFAULT '{}'::jsonb,
    period_start TIMESTAMPTZ NOT NULL,
    period_end TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (workspace_id, period_start)
);

CREATE TABLE IF NOT EXISTS agent_queue_items (
    id UUID PRIMARY KEY,
    workspace_id UUID NOT NULL,
    agent_instance_id UUID NOT NULL,
    job_type TEXT NOT NULL,
    payload JSONB NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    scheduled_at TIMESTAMPTZ NOT NULL,
    status TEXT NOT NULL,
    locked_by TEXT,
    locked_at TIMESTAMPTZ,
    attempts INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
    max_attempts INTEGER NOT NULL CHECK (max_attempts >= 1),
    last_error_code TEXT,
    last_error_message TEXT,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS agent_queue_items_eligible_idx
    ON agent_queue_items (priority DESC, scheduled_at ASC)
    WHERE status = 'queued';

CREATE INDEX IF NOT EXISTS agent_queue_items_held_idx
    ON agent_queue_items (locked_at)
    WHERE status IN ('locked', 'running');

CREATE TABLE IF NOT EXISTS agent_runs (
    id UUID PRIMARY KEY,
    queue_item_id UUID NOT NULL,
    workspace_id UUID NOT NULL,
    agent_instance_id UUID NOT NULL,
    job_type TEXT NOT NULL,
    runner_id TEXT NOT NULL,
    input JSONB NOT NULL,
    output JSONB,
    status TEXT NOT NULL,
    started_at TIMESTAMPTZ NOT NULL,
    ended_at TIMESTAMPTZ,
    duration_ms BIGINT,
    usage JSONB,
    error_code TEXT,
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS agent_runs_queue_item_idx ON agent_runs (queue_item_id, started_at);

CREATE TABLE IF NOT EXISTS system_events (
    id UUID PRIMARY KEY,
    event_type TEXT NOT NULL,
    ok BOOLEAN NOT NULL,
    data JSONB NOT NULL,
    occurred_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS error_reports (
    id UUID PRIMARY KEY,
    environment TEXT NOT NULL,
    source TEXT NOT NULL,
    message TEXT NOT NULL,
    stack TEXT,
    context JSONB NOT NULL,
    severity TEXT NOT NULL,
    occurred_at TIMESTAMPTZ NOT NULL
);
"#;

const QUEUE_COLUMNS: &str = "id, workspace_id, agent_instance_id, job_type, payload, priority, \
     scheduled_at, status, locked_by, locked_at, attempts, max_attempts, last_error_code, \
     last_error_message, created_at, updated_at";

const RUN_COLUMNS: &str = "id, queue_item_id, workspace_id, agent_instance_id, job_type, \
     runner_id, input, output, status, started_at, ended_at, duration_ms, usage, error_code, \
     error_message";

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
    lease: Duration,
    retry_policy: RetryPolicy,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            lease: LEASE_DURATION,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    // Seeding for the read-only records; written by other systems in production.

    pub async fn upsert_agent_instance(&self, agent: &AgentInstance) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO agent_instances (id, workspace_id, agent_type, config, guardrails)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE
            SET workspace_id = EXCLUDED.workspace_id,
                agent_type = EXCLUDED.agent_type,
                config = EXCLUDED.config,
                guardrails = EXCLUDED.guardrails
            "#,
        )
        .bind(agent.id.as_uuid())
        .bind(agent.workspace_id.as_uuid())
        .bind(&agent.agent_type)
        .bind(to_json(&agent.config)?)
        .bind(to_json(&agent.guardrails)?)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_agent_instance", e))?;
        Ok(())
    }

    pub async fn upsert_entitlement(&self, entitlement: &Entitlement) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workspace_entitlements
                (workspace_id, plan_code, status, limits, features, period_start, period_end)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (workspace_id, period_start) DO UPDATE
            SET plan_code = EXCLUDED.plan_code,
                status = EXCLUDED.status,
                limits = EXCLUDED.limits,
                features = EXCLUDED.features,
                period_end = EXCLUDED.period_end
            "#,
        )
        .bind(entitlement.workspace_id.as_uuid())
        .bind(&entitlement.plan_code)
        .bind(entitlement.status.as_str())
        .bind(to_json(&entitlement.limits)?)
        .bind(to_json(&entitlement.features)?)
        .bind(entitlement.period.starts_at)
        .bind(entitlement.period.ends_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_entitlement", e))?;
        Ok(())
    }

    pub async fn upsert_permission_record(
        &self,
        record: &PermissionRecord,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO agent_permissions
                (agent_instance_id, workspace_id, scopes, field_restrictions, require_approval_for)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (agent_instance_id) DO UPDATE
            SET workspace_id = EXCLUDED.workspace_id,
                scopes = EXCLUDED.scopes,
                field_restrictions = EXCLUDED.field_restrictions,
                require_approval_for = EXCLUDED.require_approval_for
            "#,
        )
        .bind(record.agent_instance_id.as_uuid())
        .bind(record.workspace_id.as_uuid())
        .bind(to_json(&record.scopes)?)
        .bind(to_json(&record.field_restrictions)?)
        .bind(to_json(&record.require_approval_for)?)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_permission_record", e))?;
        Ok(())
    }

    fn lease_ms(&self) -> i64 {
        i64::try_from(self.lease.as_millis()).unwrap_or(i64::MAX)
    }
}

#[async_trait]
impl GateRecords for PostgresStore {
    type Error = StoreError;

    #[instrument(skip(self), fields(agent_instance_id = %id), err)]
    async fn get_agent_instance(
        &self,
        id: AgentInstanceId,
    ) -> Result<Option<AgentInstance>, StoreError> {
        let row = sqlx::query(
            "SELECT id, workspace_id, agent_type, config, guardrails FROM agent_instances WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_agent_instance", e))?;

        row.map(|row| -> Result<AgentInstance, StoreError> {
            let config: JsonValue = row.try_get("config").map_err(decode_error)?;
            let guardrails: JsonValue = row.try_get("guardrails").map_err(decode_error)?;
            Ok(AgentInstance {
                id: AgentInstanceId::from_uuid(row.try_get("id").map_err(decode_error)?),
                workspace_id: WorkspaceId::from_uuid(
                    row.try_get("workspace_id").map_err(decode_error)?,
                ),
                agent_type: row.try_get("agent_type").map_err(decode_error)?,
                config: from_json::<AgentConfig>(config)?,
                guardrails: from_json::<Guardrails>(guardrails)?,
            })
        })
        .transpose()
    }

    #[instrument(skip(self), fields(workspace_id = %workspace_id), err)]
    async fn get_active_entitlement(
        &self,
        workspace_id: WorkspaceId,
    ) -> Result<Option<Entitlement>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT workspace_id, plan_code, status, limits, features, period_start, period_end
            FROM workspace_entitlements
            WHERE workspace_id = $1 AND status = 'active'
            ORDER BY period_end DESC
            LIMIT 1
            "#,
        )
        .bind(workspace_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_active_entitlement", e))?;

        row.map(|row| -> Result<Entitlement, StoreError> {
            let status: String = row.try_get("status").map_err(decode_error)?;
            let status = EntitlementStatus::parse(&status).ok_or_else(|| {
                StoreError::Serialization(format!("unknown entitlement status '{status}'"))
            })?;
            Ok(Entitlement {
                workspace_id: WorkspaceId::from_uuid(
                    row.try_get("workspace_id").map_err(decode_error)?,
                ),
                plan_code: row.try_get("plan_code").map_err(decode_error)?,
                status,
                limits: from_json(row.try_get("limits").map_err(decode_error)?)?,
                features: from_json(row.try_get("features").map_err(decode_error)?)?,
                period: BillingPeriod {
                    starts_at: row.try_get("period_start").map_err(decode_error)?,
                    ends_at: row.try_get("period_end").map_err(decode_error)?,
                },
            })
        })
        .transpose()
    }

    #[instrument(skip(self), fields(agent_instance_id = %agent_instance_id), err)]
    async fn get_permission_record(
        &self,
        agent_instance_id: AgentInstanceId,
    ) -> Result<Option<PermissionRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT agent_instance_id, workspace_id, scopes, field_restrictions, require_approval_for
            FROM agent_permissions
            WHERE agent_instance_id = $1
            "#,
        )
        .bind(agent_instance_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_permission_record", e))?;

        row.map(|row| -> Result<PermissionRecord, StoreError> {
            Ok(PermissionRecord {
                agent_instance_id: AgentInstanceId::from_uuid(
                    row.try_get("agent_instance_id").map_err(decode_error)?,
                ),
                workspace_id: WorkspaceId::from_uuid(
                    row.try_get("workspace_id").map_err(decode_error)?,
                ),
                scopes: from_json(row.try_get("scopes").map_err(decode_error)?)?,
                field_restrictions: from_json(
                    row.try_get("field_restrictions").map_err(decode_error)?,
                )?,
                require_approval_for: from_json(
                    row.try_get("require_approval_for").map_err(decode_error)?,
                )?,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl OrchestratorStore for PostgresStore {
    #[instrument(skip(self, item), fields(job_type = %item.job_type), err)]
    async fn enqueue_queue_item(
        &self,
        item: NewQueueItem,
        now: DateTime<Utc>,
    ) -> Result<QueueItem, StoreError> {
        let item = item.into_queue_item(now)?;
        let sql = format!(
            r#"
            INSERT INTO agent_queue_items ({QUEUE_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NULL, NULL, 0, $9, NULL, NULL, $10, $10)
            RETURNING {QUEUE_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(item.id.as_uuid())
            .bind(item.workspace_id.as_uuid())
            .bind(item.agent_instance_id.as_uuid())
            .bind(&item.job_type)
            .bind(&item.payload)
            .bind(item.priority)
            .bind(item.scheduled_at)
            .bind(QueueStatus::Queued.as_str())
            .bind(to_i32(item.max_attempts))
            .bind(now)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("enqueue_queue_item", e))?;
        queue_item_from_row(&row)
    }

    #[instrument(skip(self), fields(queue_item_id = %id), err)]
    async fn get_queue_item(&self, id: QueueItemId) -> Result<Option<QueueItem>, StoreError> {
        let sql = format!("SELECT {QUEUE_COLUMNS} FROM agent_queue_items WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_queue_item", e))?;
        row.as_ref().map(queue_item_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn fetch_next_queue_item(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueItem>, StoreError> {
        let sql = format!(
            r#"
            SELECT {QUEUE_COLUMNS}
            FROM agent_queue_items
            WHERE status = 'queued' AND scheduled_at <= $1
            ORDER BY priority DESC, scheduled_at ASC, created_at ASC, id ASC
            LIMIT 1
            "#
        );
        let row = sqlx::query(&sql)
            .bind(now)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_next_queue_item", e))?;
        row.as_ref().map(queue_item_from_row).transpose()
    }

    #[instrument(skip(self), fields(queue_item_id = %id, runner_id = %runner_id), err)]
    async fn lock_queue_item(
        &self,
        id: QueueItemId,
        runner_id: &RunnerId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE agent_queue_items
            SET status = 'locked', locked_by = $2, locked_at = $3, updated_at = $3
            WHERE id = $1
              AND (
                status = 'queued'
                OR (
                  status IN ('locked', 'running')
                  AND locked_by IS DISTINCT FROM $2
                  AND (locked_at IS NULL OR locked_at <= $3 - ($4 * INTERVAL '1 millisecond'))
                )
              )
            RETURNING id
            "#,
        )
        .bind(id.as_uuid())
        .bind(runner_id.as_str())
        .bind(now)
        .bind(self.lease_ms())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("lock_queue_item", e))?;
        Ok(row.is_some())
    }

    #[instrument(skip(self), fields(queue_item_id = %id, runner_id = %runner_id), err)]
    async fn mark_queue_item_running(
        &self,
        id: QueueItemId,
        runner_id: &RunnerId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE agent_queue_items
            SET status = 'running', locked_at = $3, updated_at = $3
            WHERE id = $1 AND status = 'locked' AND locked_by = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(runner_id.as_str())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_queue_item_running", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, result), fields(queue_item_id = %id), err)]
    async fn mark_queue_item_result(
        &self,
        id: QueueItemId,
        result: AttemptResult,
    ) -> Result<QueueItem, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let sql = format!("SELECT {QUEUE_COLUMNS} FROM agent_queue_items WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("mark_queue_item_result", e))?
            .ok_or_else(|| StoreError::NotFound(format!("queue item {id}")))?;

        let mut item = queue_item_from_row(&row)?;
        item.apply_result(&result, &self.retry_policy)?;

        sqlx::query(
            r#"
            UPDATE agent_queue_items
            SET status = $2, attempts = $3, scheduled_at = $4, locked_by = NULL, locked_at = NULL,
                last_error_code = $5, last_error_message = $6, updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(item.status.as_str())
        .bind(to_i32(item.attempts))
        .bind(item.scheduled_at)
        .bind(item.last_error.as_ref().map(|e| e.code.clone()))
        .bind(item.last_error.as_ref().map(|e| e.message.clone()))
        .bind(item.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("mark_queue_item_result", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(item)
    }

    #[instrument(skip(self), fields(queue_item_id = %id, runner_id = %runner_id), err)]
    async fn release_lock(
        &self,
        id: QueueItemId,
        runner_id: &RunnerId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE agent_queue_items
            SET locked_by = NULL,
                locked_at = NULL,
                status = CASE WHEN status IN ('locked', 'running') THEN 'queued' ELSE status END,
                updated_at = $3
            WHERE id = $1 AND locked_by = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(runner_id.as_str())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release_lock", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(queue_item_id = %id, runner_id = %runner_id), err)]
    async fn renew_lease(
        &self,
        id: QueueItemId,
        runner_id: &RunnerId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE agent_queue_items
            SET locked_at = $3, updated_at = $3
            WHERE id = $1 AND locked_by = $2 AND status IN ('locked', 'running')
            "#,
        )
        .bind(id.as_uuid())
        .bind(runner_id.as_str())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("renew_lease", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn requeue_expired_leases(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE agent_queue_items
            SET status = 'queued',
                last_error_code = 'lease_expired',
                last_error_message = 'lease held by ''' || COALESCE(locked_by, '') || ''' expired',
                locked_by = NULL,
                locked_at = NULL,
                updated_at = $1
            WHERE status IN ('locked', 'running')
              AND (locked_at IS NULL OR locked_at <= $1 - ($2 * INTERVAL '1 millisecond'))
            "#,
        )
        .bind(now)
        .bind(self.lease_ms())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue_expired_leases", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(queue_item_id = %id), err)]
    async fn cancel_queue_item(
        &self,
        id: QueueItemId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE agent_queue_items SET status = 'canceled', updated_at = $2 WHERE id = $1 AND status = 'queued'",
        )
        .bind(id.as_uuid())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("cancel_queue_item", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get_queue_item(id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(format!("queue item {id}"))),
        }
    }

    #[instrument(skip(self), err)]
    async fn queue_stats(&self) -> Result<QueueStats, StoreError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM agent_queue_items GROUP BY status",
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("queue_stats", e))?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(decode_error)?;
            let count: i64 = row.try_get("count").map_err(decode_error)?;
            let count = u64::try_from(count).unwrap_or(0);
            match QueueStatus::parse(&status) {
                Some(QueueStatus::Queued) => stats.queued = count,
                Some(QueueStatus::Locked) => stats.locked = count,
                Some(QueueStatus::Running) => stats.running = count,
                Some(QueueStatus::Succeeded) => stats.succeeded = count,
                Some(QueueStatus::Failed) => stats.failed = count,
                Some(QueueStatus::Canceled) => stats.canceled = count,
                None => {
                    return Err(StoreError::Serialization(format!(
                        "unknown queue status '{status}'"
                    )));
                }
            }
        }
        Ok(stats)
    }

    #[instrument(skip(self, run), fields(queue_item_id = %run.queue_item_id), err)]
    async fn create_agent_run(&self, run: NewAgentRun) -> Result<AgentRun, StoreError> {
        let run = run.into_run();
        sqlx::query(
            r#"
            INSERT INTO agent_runs
                (id, queue_item_id, workspace_id, agent_instance_id, job_type, runner_id, input,
                 status, started_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(run.id.as_uuid())
        .bind(run.queue_item_id.as_uuid())
        .bind(run.workspace_id.as_uuid())
        .bind(run.agent_instance_id.as_uuid())
        .bind(&run.job_type)
        .bind(run.runner_id.as_str())
        .bind(&run.input)
        .bind(run.status.as_str())
        .bind(run.started_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_agent_run", e))?;
        Ok(run)
    }

    #[instrument(skip(self, completion), fields(run_id = %id), err)]
    async fn complete_agent_run(
        &self,
        id: RunId,
        completion: RunCompletion,
    ) -> Result<AgentRun, StoreError> {
        if !completion.status.is_terminal() {
            return Err(StoreError::Serialization(
                "run completion must carry a terminal status".into(),
            ));
        }
        let usage = completion.usage.as_ref().map(to_json).transpose()?;
        let sql = format!(
            r#"
            UPDATE agent_runs
            SET status = $2, output = $3, usage = $4, error_code = $5, error_message = $6,
                ended_at = $7, duration_ms = $8
            WHERE id = $1 AND status IN ('queued', 'running')
            RETURNING {RUN_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(completion.status.as_str())
            .bind(&completion.output)
            .bind(usage)
            .bind(completion.error.as_ref().map(|e| e.code.clone()))
            .bind(completion.error.as_ref().map(|e| e.message.clone()))
            .bind(completion.ended_at)
            .bind(i64::try_from(completion.duration_ms).unwrap_or(i64::MAX))
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("complete_agent_run", e))?;

        match row {
            Some(row) => agent_run_from_row(&row),
            None => match self.get_agent_run(id).await? {
                Some(run) => Err(StoreError::Conflict(format!(
                    "run {id} already completed as {}",
                    run.status.as_str()
                ))),
                None => Err(StoreError::NotFound(format!("run {id}"))),
            },
        }
    }

    #[instrument(skip(self), fields(run_id = %id), err)]
    async fn get_agent_run(&self, id: RunId) -> Result<Option<AgentRun>, StoreError> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM agent_runs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_agent_run", e))?;
        row.as_ref().map(agent_run_from_row).transpose()
    }

    #[instrument(skip(self), fields(queue_item_id = %queue_item_id), err)]
    async fn list_runs_for_queue_item(
        &self,
        queue_item_id: QueueItemId,
    ) -> Result<Vec<AgentRun>, StoreError> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM agent_runs WHERE queue_item_id = $1 ORDER BY started_at ASC, id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(queue_item_id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_runs_for_queue_item", e))?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in rows {
            runs.push(agent_run_from_row(&row)?);
        }
        Ok(runs)
    }

    #[instrument(skip(self, event), fields(event_type = %event.event_type), err)]
    async fn record_system_event(&self, event: SystemEvent) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO system_events (id, event_type, ok, data, occurred_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(event.id.as_uuid())
        .bind(&event.event_type)
        .bind(event.ok)
        .bind(&event.data)
        .bind(event.occurred_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_system_event", e))?;
        Ok(())
    }

    #[instrument(skip(self, report), fields(source = %report.source), err)]
    async fn record_error_report(&self, report: ErrorReport) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO error_reports
                (id, environment, source, message, stack, context, severity, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(report.id.as_uuid())
        .bind(&report.environment)
        .bind(&report.source)
        .bind(&report.message)
        .bind(&report.stack)
        .bind(&report.context)
        .bind(report.severity.as_str())
        .bind(report.occurred_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_error_report", e))?;
        Ok(())
    }
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                Some("23514") => StoreError::Serialization(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Serialization(format!("decode error in {}: {}", operation, err))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn decode_error(err: sqlx::Error) -> StoreError {
    map_sqlx_error("decode_row", err)
}

fn to_json<T: Serialize>(value: &T) -> Result<JsonValue, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn from_json<T: DeserializeOwned>(value: JsonValue) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

// SQLx row types

#[derive(Debug)]
struct QueueItemRow {
    id: uuid::Uuid,
    workspace_id: uuid::Uuid,
    agent_instance_id: uuid::Uuid,
    job_type: String,
    payload: JsonValue,
    priority: i32,
    scheduled_at: DateTime<Utc>,
    status: String,
    locked_by: Option<String>,
    locked_at: Option<DateTime<Utc>>,
    attempts: i32,
    max_attempts: i32,
    last_error_code: Option<String>,
    last_error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for QueueItemRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(QueueItemRow {
            id: row.try_get("id")?,
            workspace_id: row.try_get("workspace_id")?,
            agent_instance_id: row.try_get("agent_instance_id")?,
            job_type: row.try_get("job_type")?,
            payload: row.try_get("payload")?,
            priority: row.try_get("priority")?,
            scheduled_at: row.try_get("scheduled_at")?,
            status: row.try_get("status")?,
            locked_by: row.try_get("locked_by")?,
            locked_at: row.try_get("locked_at")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            last_error_code: row.try_get("last_error_code")?,
            last_error_message: row.try_get("last_error_message")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<QueueItemRow> for QueueItem {
    type Error = StoreError;

    fn try_from(row: QueueItemRow) -> Result<Self, Self::Error> {
        let status = QueueStatus::parse(&row.status).ok_or_else(|| {
            StoreError::Serialization(format!("unknown queue status '{}'", row.status))
        })?;
        let locked_by = row.locked_by.map(RunnerId::new).transpose()?;
        let last_error = row
            .last_error_code
            .map(|code| ErrorDetail::new(code, row.last_error_message.unwrap_or_default()));

        Ok(QueueItem {
            id: QueueItemId::from_uuid(row.id),
            workspace_id: WorkspaceId::from_uuid(row.workspace_id),
            agent_instance_id: AgentInstanceId::from_uuid(row.agent_instance_id),
            job_type: row.job_type,
            payload: row.payload,
            priority: row.priority,
            scheduled_at: row.scheduled_at,
            status,
            locked_by,
            locked_at: row.locked_at,
            attempts: to_u32(row.attempts),
            max_attempts: to_u32(row.max_attempts),
            last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn queue_item_from_row(row: &PgRow) -> Result<QueueItem, StoreError> {
    QueueItem::try_from(QueueItemRow::from_row(row).map_err(decode_error)?)
}

#[derive(Debug)]
struct AgentRunRow {
    id: uuid::Uuid,
    queue_item_id: uuid::Uuid,
    workspace_id: uuid::Uuid,
    agent_instance_id: uuid::Uuid,
    job_type: String,
    runner_id: String,
    input: JsonValue,
    output: Option<JsonValue>,
    status: String,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    duration_ms: Option<i64>,
    usage: Option<JsonValue>,
    error_code: Option<String>,
    error_message: Option<String>,
}

impl<'r> FromRow<'r, PgRow> for AgentRunRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(AgentRunRow {
            id: row.try_get("id")?,
            queue_item_id: row.try_get("queue_item_id")?,
            workspace_id: row.try_get("workspace_id")?,
            agent_instance_id: row.try_get("agent_instance_id")?,
            job_type: row.try_get("job_type")?,
            runner_id: row.try_get("runner_id")?,
            input: row.try_get("input")?,
            output: row.try_get("output")?,
            status: row.try_get("status")?,
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
            duration_ms: row.try_get("duration_ms")?,
            usage: row.try_get("usage")?,
            error_code: row.try_get("error_code")?,
            error_message: row.try_get("error_message")?,
        })
    }
}

impl TryFrom<AgentRunRow> for AgentRun {
    type Error = StoreError;

    fn try_from(row: AgentRunRow) -> Result<Self, Self::Error> {
        let status = RunStatus::parse(&row.status).ok_or_else(|| {
            StoreError::Serialization(format!("unknown run status '{}'", row.status))
        })?;
        let usage = row.usage.map(from_json::<Usage>).transpose()?;
        let error = row
            .error_code
            .map(|code| ErrorDetail::new(code, row.error_message.unwrap_or_default()));

        Ok(AgentRun {
            id: RunId::from_uuid(row.id),
            queue_item_id: QueueItemId::from_uuid(row.queue_item_id),
            workspace_id: WorkspaceId::from_uuid(row.workspace_id),
            agent_instance_id: AgentInstanceId::from_uuid(row.agent_instance_id),
            job_type: row.job_type,
            runner_id: RunnerId::new(row.runner_id)?,
            input: row.input,
            output: row.output,
            status,
            started_at: row.started_at,
            ended_at: row.ended_at,
            duration_ms: row.duration_ms.and_then(|ms| u64::try_from(ms).ok()),
            usage,
            error,
        })
    }
}

fn agent_run_from_row(row: &PgRow) -> Result<AgentRun, StoreError> {
    AgentRun::try_from(AgentRunRow::from_row(row).map_err(decode_error)?)
}
