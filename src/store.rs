use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crate::models::{DlqEntry, DlqPage, Job, JobPage, JobStatus, MetricsSummary, Tenant};

const JOB_COLUMNS: &str = "id, tenant_id, status, payload, result, error_message, \
     idempotency_key, trace_id, retry_count, max_retries, worker_id, \
     lease_expires_at, created_at, started_at, completed_at";

/// Outcome of `create_job`: either a fresh row or the prior job for the
/// same `(tenant, idempotency_key)`.
#[derive(Debug)]
pub enum CreateOutcome {
    Created(Job),
    IdempotencyHit(Job),
}

impl CreateOutcome {
    pub fn into_job(self) -> Job {
        match self {
            CreateOutcome::Created(job) | CreateOutcome::IdempotencyHit(job) => job,
        }
    }
}

/// Outcome of `fail_and_retry` when the caller still owned the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retried,
    DeadLettered,
}

/// Transactional primitives over the jobs tables. All worker-facing
/// mutations are either a single atomic statement or a transaction, so a
/// failure mid-way leaves the row in its prior state.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the persisted layout if it does not exist yet. Schema
    /// *evolution* stays with an external migration tool; this only
    /// bootstraps empty databases (and the per-test databases).
    pub async fn init_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                api_key TEXT NOT NULL UNIQUE,
                name TEXT,
                max_concurrent_jobs INTEGER NOT NULL DEFAULT 5,
                rate_limit_per_minute INTEGER NOT NULL DEFAULT 10,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id UUID PRIMARY KEY,
                tenant_id TEXT NOT NULL REFERENCES users(id),
                status TEXT NOT NULL DEFAULT 'pending',
                payload JSONB NOT NULL,
                result JSONB,
                error_message TEXT,
                idempotency_key TEXT,
                trace_id TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                worker_id TEXT,
                lease_expires_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                started_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_jobs_status_created ON jobs (status, created_at)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_tenant_idempotency \
             ON jobs (tenant_id, idempotency_key) WHERE idempotency_key IS NOT NULL",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_jobs_lease_expires ON jobs (lease_expires_at)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_jobs_tenant_status ON jobs (tenant_id, status)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dlq (
                id UUID PRIMARY KEY,
                original_job_id UUID NOT NULL,
                tenant_id TEXT NOT NULL,
                payload JSONB NOT NULL,
                error_message TEXT,
                retry_count INTEGER NOT NULL,
                original_created_at TIMESTAMPTZ NOT NULL,
                failed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                trace_id TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_dlq_tenant_failed ON dlq (tenant_id, failed_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS metrics (
                id UUID PRIMARY KEY,
                recorded_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                tenant_id TEXT NOT NULL,
                total_jobs BIGINT NOT NULL,
                pending_jobs BIGINT NOT NULL,
                running_jobs BIGINT NOT NULL,
                completed_jobs BIGINT NOT NULL,
                failed_jobs BIGINT NOT NULL,
                dlq_jobs BIGINT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("database schema ready");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Tenants
    // -----------------------------------------------------------------------

    pub async fn find_tenant_by_api_key(
        &self,
        api_key: &str,
    ) -> Result<Option<Tenant>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT id, api_key, name, max_concurrent_jobs, rate_limit_per_minute, created_at \
             FROM users WHERE api_key = $1",
        )
        .bind(api_key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| map_tenant(&r)).transpose()
    }

    /// Provisioning is an out-of-band operation; exposed for ops tooling
    /// and tests, not on the HTTP surface.
    pub async fn create_tenant(
        &self,
        id: &str,
        api_key: &str,
        name: Option<&str>,
        max_concurrent_jobs: i32,
        rate_limit_per_minute: i32,
    ) -> Result<Tenant, sqlx::Error> {
        let row = sqlx::query(
            r#"
            INSERT INTO users (id, api_key, name, max_concurrent_jobs, rate_limit_per_minute)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, api_key, name, max_concurrent_jobs, rate_limit_per_minute, created_at
            "#,
        )
        .bind(id)
        .bind(api_key)
        .bind(name)
        .bind(max_concurrent_jobs)
        .bind(rate_limit_per_minute)
        .fetch_one(&self.pool)
        .await?;

        map_tenant(&row)
    }

    // -----------------------------------------------------------------------
    // Submission path
    // -----------------------------------------------------------------------

    /// Insert a new pending job, or return the existing one for the same
    /// `(tenant, idempotency_key)`. A partial unique index arbitrates the
    /// race between concurrent submissions of the same key.
    pub async fn create_job(
        &self,
        tenant_id: &str,
        payload: JsonValue,
        idempotency_key: Option<&str>,
        max_retries: i32,
    ) -> Result<CreateOutcome, sqlx::Error> {
        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO jobs (id, tenant_id, status, payload, idempotency_key, trace_id, max_retries)
            VALUES ($1, $2, 'pending', $3, $4, $5, $6)
            ON CONFLICT (tenant_id, idempotency_key) WHERE idempotency_key IS NOT NULL
            DO NOTHING
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(payload)
        .bind(idempotency_key)
        .bind(Uuid::new_v4().to_string())
        .bind(max_retries)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(CreateOutcome::Created(map_job(&row)?));
        }

        // The insert was skipped, so the key must already be taken.
        let Some(key) = idempotency_key else {
            return Err(sqlx::Error::RowNotFound);
        };
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE tenant_id = $1 AND idempotency_key = $2",
        ))
        .bind(tenant_id)
        .bind(key)
        .fetch_one(&self.pool)
        .await?;

        Ok(CreateOutcome::IdempotencyHit(map_job(&row)?))
    }

    // -----------------------------------------------------------------------
    // Worker path
    // -----------------------------------------------------------------------

    /// Atomically claim the oldest pending job, skipping rows locked by
    /// concurrent claimers. Returns `None` when the queue is drained.
    pub async fn claim_next_pending(
        &self,
        worker_id: &str,
        lease_ttl: Duration,
    ) -> Result<Option<Job>, sqlx::Error> {
        let row = sqlx::query(&format!(
            r#"
            WITH next_job AS (
                SELECT id
                FROM jobs
                WHERE status = 'pending'
                ORDER BY created_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'running',
                worker_id = $1,
                started_at = NOW(),
                lease_expires_at = NOW() + make_interval(secs => $2)
            WHERE id IN (SELECT id FROM next_job)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(worker_id)
        .bind(lease_ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| map_job(&r)).transpose()
    }

    /// Heartbeat: extend the lease, but only while the caller still owns a
    /// running job. Returns false once the row was reclaimed or finished.
    pub async fn renew_lease(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease_ttl: Duration,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET lease_expires_at = NOW() + make_interval(secs => $3)
            WHERE id = $1 AND worker_id = $2 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(lease_ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Owner-guarded completion. Returns false when the lease was lost,
    /// in which case the caller's result must be discarded.
    pub async fn complete_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        result: JsonValue,
    ) -> Result<bool, sqlx::Error> {
        let done = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed',
                result = $3,
                completed_at = NOW(),
                worker_id = NULL,
                lease_expires_at = NULL
            WHERE id = $1 AND worker_id = $2 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(result)
        .execute(&self.pool)
        .await?;

        Ok(done.rows_affected() > 0)
    }

    /// Owner-guarded failure handling. Retryable failures under the ceiling
    /// return the job to pending; exhausted or permanent failures
    /// copy-forward into the DLQ. Returns `None` when the caller no longer
    /// owns the row.
    pub async fn fail_and_retry(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
        permanent: bool,
    ) -> Result<Option<FailOutcome>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT tenant_id, payload, retry_count, max_retries, created_at, trace_id \
             FROM jobs WHERE id = $1 AND worker_id = $2 AND status = 'running' FOR UPDATE",
        )
        .bind(job_id)
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            // Reclaimed or finished by someone else; nothing to do.
            return Ok(None);
        };

        let retry_count: i32 = row.try_get("retry_count")?;
        let max_retries: i32 = row.try_get("max_retries")?;

        if !permanent && retry_count < max_retries {
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'pending',
                    retry_count = retry_count + 1,
                    worker_id = NULL,
                    lease_expires_at = NULL,
                    started_at = NULL,
                    error_message = NULL
                WHERE id = $1
                "#,
            )
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(Some(FailOutcome::Retried));
        }

        let tenant_id: String = row.try_get("tenant_id")?;
        let payload: JsonValue = row.try_get("payload")?;
        let created_at: DateTime<Utc> = row.try_get("created_at")?;
        let trace_id: String = row.try_get("trace_id")?;

        sqlx::query(
            r#"
            INSERT INTO dlq (id, original_job_id, tenant_id, payload, error_message,
                             retry_count, original_created_at, trace_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(job_id)
        .bind(&tenant_id)
        .bind(payload)
        .bind(error)
        .bind(retry_count)
        .bind(created_at)
        .bind(&trace_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'dlq',
                error_message = $2,
                completed_at = NOW(),
                worker_id = NULL,
                lease_expires_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(error)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(FailOutcome::DeadLettered))
    }

    /// Return running jobs whose lease expired to pending so another worker
    /// can pick them up. A crashed worker is not the job's fault, so
    /// `retry_count` is left alone.
    pub async fn reclaim_expired_leases(&self) -> Result<Vec<Job>, sqlx::Error> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET status = 'pending',
                worker_id = NULL,
                lease_expires_at = NULL,
                started_at = NULL
            WHERE status = 'running' AND lease_expires_at < NOW()
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_job).collect()
    }

    // -----------------------------------------------------------------------
    // Read paths (tenant-scoped in SQL)
    // -----------------------------------------------------------------------

    pub async fn get_job(
        &self,
        job_id: Uuid,
        tenant_id: &str,
    ) -> Result<Option<Job>, sqlx::Error> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 AND tenant_id = $2",
        ))
        .bind(job_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| map_job(&r)).transpose()
    }

    pub async fn list_jobs(
        &self,
        tenant_id: &str,
        status: Option<JobStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<JobPage, sqlx::Error> {
        let status_str = status.map(|s| s.as_str());

        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE tenant_id = $1 AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#
        ))
        .bind(tenant_id)
        .bind(status_str)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs \
             WHERE tenant_id = $1 AND ($2::text IS NULL OR status = $2)",
        )
        .bind(tenant_id)
        .bind(status_str)
        .fetch_one(&self.pool)
        .await?;

        let jobs = rows.iter().map(map_job).collect::<Result<Vec<_>, _>>()?;
        Ok(JobPage { jobs, total })
    }

    pub async fn list_dlq(
        &self,
        tenant_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<DlqPage, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, original_job_id, tenant_id, payload, error_message,
                   retry_count, original_created_at, failed_at, trace_id
            FROM dlq
            WHERE tenant_id = $1
            ORDER BY failed_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(tenant_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dlq WHERE tenant_id = $1")
            .bind(tenant_id)
            .fetch_one(&self.pool)
            .await?;

        let entries = rows
            .iter()
            .map(map_dlq_entry)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(DlqPage { entries, total })
    }

    pub async fn summarize(&self, tenant_id: &str) -> Result<MetricsSummary, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                   COUNT(*) FILTER (WHERE status = 'running') AS running,
                   COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                   COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                   COUNT(*) FILTER (WHERE status = 'dlq') AS dlq
            FROM jobs
            WHERE tenant_id = $1
            "#,
        )
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(MetricsSummary {
            total: row.try_get("total")?,
            pending: row.try_get("pending")?,
            running: row.try_get("running")?,
            completed: row.try_get("completed")?,
            failed: row.try_get("failed")?,
            dlq: row.try_get("dlq")?,
        })
    }

    /// Append a roll-up snapshot to the metrics table.
    pub async fn record_metrics_snapshot(
        &self,
        tenant_id: &str,
        summary: &MetricsSummary,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO metrics (id, tenant_id, total_jobs, pending_jobs, running_jobs,
                                 completed_jobs, failed_jobs, dlq_jobs)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(summary.total)
        .bind(summary.pending)
        .bind(summary.running)
        .bind(summary.completed)
        .bind(summary.failed)
        .bind(summary.dlq)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Startup rebuild for the in-memory concurrency counters.
    pub async fn running_counts_by_tenant(&self) -> Result<Vec<(String, i64)>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT tenant_id, COUNT(*) AS running FROM jobs \
             WHERE status = 'running' GROUP BY tenant_id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| Ok((r.try_get("tenant_id")?, r.try_get("running")?)))
            .collect()
    }
}

fn map_job(row: &PgRow) -> Result<Job, sqlx::Error> {
    let status_raw: String = row.try_get("status")?;
    let status = JobStatus::from_str(&status_raw)
        .ok_or_else(|| sqlx::Error::Decode(format!("unknown job status: {status_raw}").into()))?;

    Ok(Job {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        status,
        payload: row.try_get("payload")?,
        result: row.try_get("result")?,
        error_message: row.try_get("error_message")?,
        idempotency_key: row.try_get("idempotency_key")?,
        trace_id: row.try_get("trace_id")?,
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
        worker_id: row.try_get("worker_id")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn map_dlq_entry(row: &PgRow) -> Result<DlqEntry, sqlx::Error> {
    Ok(DlqEntry {
        id: row.try_get("id")?,
        original_job_id: row.try_get("original_job_id")?,
        tenant_id: row.try_get("tenant_id")?,
        payload: row.try_get("payload")?,
        error_message: row.try_get("error_message")?,
        retry_count: row.try_get("retry_count")?,
        original_created_at: row.try_get("original_created_at")?,
        failed_at: row.try_get("failed_at")?,
        trace_id: row.try_get("trace_id")?,
    })
}

fn map_tenant(row: &PgRow) -> Result<Tenant, sqlx::Error> {
    Ok(Tenant {
        id: row.try_get("id")?,
        api_key: row.try_get("api_key")?,
        name: row.try_get("name")?,
        max_concurrent_jobs: row.try_get("max_concurrent_jobs")?,
        rate_limit_per_minute: row.try_get("rate_limit_per_minute")?,
        created_at: row.try_get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn setup(pool: PgPool) -> Store {
        let store = Store::new(pool);
        store.init_schema().await.unwrap();
        store
            .create_tenant("acme", "acme-key", Some("Acme"), 5, 10)
            .await
            .unwrap();
        store
    }

    #[sqlx::test]
    async fn create_job_starts_pending_with_trace_id(pool: PgPool) {
        let store = setup(pool).await;

        let job = store
            .create_job("acme", json!({"x": 1}), None, 3)
            .await
            .unwrap()
            .into_job();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.max_retries, 3);
        assert!(job.worker_id.is_none());
        assert!(job.lease_expires_at.is_none());
        assert!(!job.trace_id.is_empty());
    }

    #[sqlx::test]
    async fn duplicate_idempotency_key_returns_prior_job(pool: PgPool) {
        let store = setup(pool).await;

        let first = store
            .create_job("acme", json!({"n": 1}), Some("k1"), 3)
            .await
            .unwrap();
        let second = store
            .create_job("acme", json!({"n": 2}), Some("k1"), 3)
            .await
            .unwrap();

        let first = match first {
            CreateOutcome::Created(job) => job,
            other => panic!("expected fresh job, got {other:?}"),
        };
        let second = match second {
            CreateOutcome::IdempotencyHit(job) => job,
            other => panic!("expected idempotency hit, got {other:?}"),
        };

        assert_eq!(first.id, second.id);
        // The payload of the first submission wins.
        assert_eq!(second.payload, json!({"n": 1}));

        let page = store.list_jobs("acme", None, 100, 0).await.unwrap();
        assert_eq!(page.total, 1);
    }

    #[sqlx::test]
    async fn same_key_is_independent_across_tenants(pool: PgPool) {
        let store = setup(pool).await;
        store
            .create_tenant("globex", "globex-key", None, 5, 10)
            .await
            .unwrap();

        let a = store
            .create_job("acme", json!({}), Some("k1"), 3)
            .await
            .unwrap();
        let b = store
            .create_job("globex", json!({}), Some("k1"), 3)
            .await
            .unwrap();

        assert!(matches!(a, CreateOutcome::Created(_)));
        assert!(matches!(b, CreateOutcome::Created(_)));
    }

    #[sqlx::test]
    async fn claim_is_fifo_and_sets_lease_fields(pool: PgPool) {
        let store = setup(pool).await;

        let first = store
            .create_job("acme", json!({"n": 1}), None, 3)
            .await
            .unwrap()
            .into_job();
        store.create_job("acme", json!({"n": 2}), None, 3).await.unwrap();

        let claimed = store
            .claim_next_pending("worker-1", Duration::from_secs(300))
            .await
            .unwrap()
            .expect("a job should be claimable");

        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.worker_id.as_deref(), Some("worker-1"));
        assert!(claimed.started_at.is_some());
        assert!(claimed.lease_expires_at.is_some());
    }

    #[sqlx::test]
    async fn claimed_job_is_not_claimable_again(pool: PgPool) {
        let store = setup(pool).await;
        store.create_job("acme", json!({}), None, 3).await.unwrap();

        let first = store
            .claim_next_pending("worker-1", Duration::from_secs(300))
            .await
            .unwrap();
        let second = store
            .claim_next_pending("worker-2", Duration::from_secs(300))
            .await
            .unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
    }

    #[sqlx::test]
    async fn complete_is_owner_guarded(pool: PgPool) {
        let store = setup(pool).await;
        store.create_job("acme", json!({}), None, 3).await.unwrap();
        let job = store
            .claim_next_pending("worker-1", Duration::from_secs(300))
            .await
            .unwrap()
            .unwrap();

        let stale = store
            .complete_job(job.id, "worker-2", json!({"ok": true}))
            .await
            .unwrap();
        assert!(!stale);

        let done = store
            .complete_job(job.id, "worker-1", json!({"ok": true}))
            .await
            .unwrap();
        assert!(done);

        let stored = store.get_job(job.id, "acme").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.result, Some(json!({"ok": true})));
        assert!(stored.completed_at.is_some());
        assert!(stored.worker_id.is_none());
        assert!(stored.lease_expires_at.is_none());
    }

    #[sqlx::test]
    async fn retry_ladder_ends_in_dlq(pool: PgPool) {
        let store = setup(pool).await;
        let job = store
            .create_job("acme", json!({"doomed": true}), None, 2)
            .await
            .unwrap()
            .into_job();

        // Attempts 1 and 2 fail and re-queue.
        for expected_retry in 1..=2 {
            let claimed = store
                .claim_next_pending("worker-1", Duration::from_secs(300))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(claimed.id, job.id);

            let outcome = store
                .fail_and_retry(job.id, "worker-1", "boom", false)
                .await
                .unwrap();
            assert_eq!(outcome, Some(FailOutcome::Retried));

            let stored = store.get_job(job.id, "acme").await.unwrap().unwrap();
            assert_eq!(stored.status, JobStatus::Pending);
            assert_eq!(stored.retry_count, expected_retry);
            assert!(stored.worker_id.is_none());
        }

        // Attempt 3 exhausts the ladder.
        store
            .claim_next_pending("worker-1", Duration::from_secs(300))
            .await
            .unwrap()
            .unwrap();
        let outcome = store
            .fail_and_retry(job.id, "worker-1", "boom", false)
            .await
            .unwrap();
        assert_eq!(outcome, Some(FailOutcome::DeadLettered));

        let stored = store.get_job(job.id, "acme").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Dlq);
        assert_eq!(stored.retry_count, 2);
        assert_eq!(stored.error_message.as_deref(), Some("boom"));
        assert!(stored.completed_at.is_some());

        let dlq = store.list_dlq("acme", 100, 0).await.unwrap();
        assert_eq!(dlq.total, 1);
        assert_eq!(dlq.entries[0].original_job_id, job.id);
        assert_eq!(dlq.entries[0].retry_count, 2);
        assert_eq!(dlq.entries[0].trace_id, job.trace_id);
    }

    #[sqlx::test]
    async fn permanent_failure_bypasses_the_ladder(pool: PgPool) {
        let store = setup(pool).await;
        let job = store
            .create_job("acme", json!({}), None, 5)
            .await
            .unwrap()
            .into_job();
        store
            .claim_next_pending("worker-1", Duration::from_secs(300))
            .await
            .unwrap()
            .unwrap();

        let outcome = store
            .fail_and_retry(job.id, "worker-1", "bad payload", true)
            .await
            .unwrap();
        assert_eq!(outcome, Some(FailOutcome::DeadLettered));

        let stored = store.get_job(job.id, "acme").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Dlq);
        assert_eq!(stored.retry_count, 0);
    }

    #[sqlx::test]
    async fn fail_and_retry_rejects_stale_owner(pool: PgPool) {
        let store = setup(pool).await;
        let job = store
            .create_job("acme", json!({}), None, 3)
            .await
            .unwrap()
            .into_job();
        store
            .claim_next_pending("worker-1", Duration::from_secs(300))
            .await
            .unwrap()
            .unwrap();

        let outcome = store
            .fail_and_retry(job.id, "worker-2", "boom", false)
            .await
            .unwrap();
        assert_eq!(outcome, None);

        let stored = store.get_job(job.id, "acme").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Running);
        assert_eq!(stored.retry_count, 0);
    }

    #[sqlx::test]
    async fn reclaim_returns_expired_jobs_without_charging_retries(pool: PgPool) {
        let store = setup(pool).await;
        let job = store
            .create_job("acme", json!({}), None, 3)
            .await
            .unwrap()
            .into_job();
        store
            .claim_next_pending("worker-1", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        let reclaimed = store.reclaim_expired_leases().await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, job.id);
        assert_eq!(reclaimed[0].status, JobStatus::Pending);
        assert_eq!(reclaimed[0].retry_count, 0);
        assert!(reclaimed[0].worker_id.is_none());

        // The old owner cannot renew or complete after the reclaim.
        let renewed = store
            .renew_lease(job.id, "worker-1", Duration::from_secs(300))
            .await
            .unwrap();
        assert!(!renewed);
        let completed = store
            .complete_job(job.id, "worker-1", json!({}))
            .await
            .unwrap();
        assert!(!completed);
    }

    #[sqlx::test]
    async fn reclaim_leaves_live_leases_alone(pool: PgPool) {
        let store = setup(pool).await;
        store.create_job("acme", json!({}), None, 3).await.unwrap();
        store
            .claim_next_pending("worker-1", Duration::from_secs(300))
            .await
            .unwrap()
            .unwrap();

        let reclaimed = store.reclaim_expired_leases().await.unwrap();
        assert!(reclaimed.is_empty());
    }

    #[sqlx::test]
    async fn renew_extends_only_for_the_owner(pool: PgPool) {
        let store = setup(pool).await;
        let job = store
            .create_job("acme", json!({}), None, 3)
            .await
            .unwrap()
            .into_job();
        store
            .claim_next_pending("worker-1", Duration::from_secs(300))
            .await
            .unwrap()
            .unwrap();

        assert!(store
            .renew_lease(job.id, "worker-1", Duration::from_secs(300))
            .await
            .unwrap());
        assert!(!store
            .renew_lease(job.id, "worker-2", Duration::from_secs(300))
            .await
            .unwrap());
    }

    #[sqlx::test]
    async fn reads_are_tenant_scoped(pool: PgPool) {
        let store = setup(pool).await;
        store
            .create_tenant("globex", "globex-key", None, 5, 10)
            .await
            .unwrap();
        let job = store
            .create_job("acme", json!({}), None, 3)
            .await
            .unwrap()
            .into_job();

        assert!(store.get_job(job.id, "globex").await.unwrap().is_none());
        assert!(store.get_job(job.id, "acme").await.unwrap().is_some());

        let foreign = store.list_jobs("globex", None, 100, 0).await.unwrap();
        assert_eq!(foreign.total, 0);
    }

    #[sqlx::test]
    async fn list_filters_by_status_and_paginates(pool: PgPool) {
        let store = setup(pool).await;
        for n in 0..3 {
            store
                .create_job("acme", json!({"n": n}), None, 3)
                .await
                .unwrap();
        }
        store
            .claim_next_pending("worker-1", Duration::from_secs(300))
            .await
            .unwrap()
            .unwrap();

        let pending = store
            .list_jobs("acme", Some(JobStatus::Pending), 100, 0)
            .await
            .unwrap();
        assert_eq!(pending.total, 2);

        let page = store.list_jobs("acme", None, 2, 0).await.unwrap();
        assert_eq!(page.jobs.len(), 2);
        assert_eq!(page.total, 3);
        let rest = store.list_jobs("acme", None, 2, 2).await.unwrap();
        assert_eq!(rest.jobs.len(), 1);
    }

    #[sqlx::test]
    async fn summarize_counts_by_status(pool: PgPool) {
        let store = setup(pool).await;
        for _ in 0..2 {
            store.create_job("acme", json!({}), None, 3).await.unwrap();
        }
        let running = store
            .claim_next_pending("worker-1", Duration::from_secs(300))
            .await
            .unwrap()
            .unwrap();
        store
            .complete_job(running.id, "worker-1", json!({}))
            .await
            .unwrap();

        let summary = store.summarize("acme").await.unwrap();
        assert_eq!(
            summary,
            MetricsSummary {
                total: 2,
                pending: 1,
                running: 0,
                completed: 1,
                failed: 0,
                dlq: 0,
            }
        );

        store.record_metrics_snapshot("acme", &summary).await.unwrap();
    }

    #[sqlx::test]
    async fn running_counts_feed_the_startup_rebuild(pool: PgPool) {
        let store = setup(pool).await;
        store.create_job("acme", json!({}), None, 3).await.unwrap();
        store
            .claim_next_pending("worker-1", Duration::from_secs(300))
            .await
            .unwrap()
            .unwrap();

        let counts = store.running_counts_by_tenant().await.unwrap();
        assert_eq!(counts, vec![("acme".to_string(), 1)]);
    }

    #[sqlx::test]
    async fn tenant_lookup_by_api_key(pool: PgPool) {
        let store = setup(pool).await;

        let tenant = store.find_tenant_by_api_key("acme-key").await.unwrap();
        assert_eq!(tenant.unwrap().id, "acme");

        let missing = store.find_tenant_by_api_key("nope").await.unwrap();
        assert!(missing.is_none());
    }
}
