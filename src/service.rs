use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::admission::Admission;
use crate::error::AppError;
use crate::events::{Event, EventBus, EventKind};
use crate::models::{
    DlqPage, Job, JobPage, JobStatus, ListDlqQuery, ListJobsQuery, MetricsSummary,
    SubmitJobRequest, Tenant,
};
use crate::store::{CreateOutcome, Store};

const DEFAULT_PAGE_LIMIT: i64 = 100;
const MAX_PAGE_LIMIT: i64 = 1000;
const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

#[derive(Debug)]
pub struct SubmitOutcome {
    pub job: Job,
    /// False when an idempotency key resolved to a prior job.
    pub created: bool,
}

/// The submission and query API: admission checks, idempotency resolution,
/// persistence, and event publication.
pub struct JobService {
    store: Store,
    admission: Arc<Admission>,
    events: EventBus,
    default_max_retries: i32,
}

impl JobService {
    pub fn new(
        store: Store,
        admission: Arc<Admission>,
        events: EventBus,
        default_max_retries: i32,
    ) -> Self {
        Self {
            store,
            admission,
            events,
            default_max_retries,
        }
    }

    pub async fn submit(
        &self,
        tenant: &Tenant,
        request: SubmitJobRequest,
    ) -> Result<SubmitOutcome, AppError> {
        validate_submit(&request)?;

        if !self
            .admission
            .try_acquire_rate(&tenant.id, tenant.rate_limit_per_minute)
        {
            return Err(AppError::RateLimited(format!(
                "rate limit exceeded: {} submissions per minute",
                tenant.rate_limit_per_minute
            )));
        }

        if !self
            .admission
            .has_capacity(&tenant.id, tenant.max_concurrent_jobs)
        {
            return Err(AppError::ConcurrencyExceeded(format!(
                "concurrent job limit reached: {}",
                tenant.max_concurrent_jobs
            )));
        }

        let max_retries = request.max_retries.unwrap_or(self.default_max_retries);
        let outcome = self
            .store
            .create_job(
                &tenant.id,
                request.payload,
                request.idempotency_key.as_deref(),
                max_retries,
            )
            .await?;

        match outcome {
            CreateOutcome::Created(job) => {
                info!(
                    job_id = %job.id,
                    tenant_id = %job.tenant_id,
                    trace_id = %job.trace_id,
                    "job submitted"
                );
                self.events.publish(Event::for_job(EventKind::JobSubmitted, &job));
                Ok(SubmitOutcome { job, created: true })
            }
            // A replayed submission is not a new unit of work: no event.
            CreateOutcome::IdempotencyHit(job) => {
                info!(
                    job_id = %job.id,
                    tenant_id = %job.tenant_id,
                    idempotency_key = ?job.idempotency_key,
                    "idempotent submission resolved to existing job"
                );
                Ok(SubmitOutcome {
                    job,
                    created: false,
                })
            }
        }
    }

    pub async fn get_job(&self, tenant: &Tenant, job_id: Uuid) -> Result<Job, AppError> {
        self.store
            .get_job(job_id, &tenant.id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("job {job_id} not found")))
    }

    pub async fn list_jobs(
        &self,
        tenant: &Tenant,
        query: ListJobsQuery,
    ) -> Result<JobPage, AppError> {
        let status = query
            .status
            .as_deref()
            .map(|raw| {
                JobStatus::from_str(raw)
                    .ok_or_else(|| AppError::Validation(format!("unknown status: {raw}")))
            })
            .transpose()?;

        let (limit, offset) = page_bounds(query.limit, query.offset)?;
        Ok(self.store.list_jobs(&tenant.id, status, limit, offset).await?)
    }

    pub async fn list_dlq(
        &self,
        tenant: &Tenant,
        query: ListDlqQuery,
    ) -> Result<DlqPage, AppError> {
        let (limit, offset) = page_bounds(query.limit, query.offset)?;
        Ok(self.store.list_dlq(&tenant.id, limit, offset).await?)
    }

    pub async fn metrics(&self, tenant: &Tenant) -> Result<MetricsSummary, AppError> {
        let summary = self.store.summarize(&tenant.id).await?;
        self.store
            .record_metrics_snapshot(&tenant.id, &summary)
            .await?;
        Ok(summary)
    }
}

fn validate_submit(request: &SubmitJobRequest) -> Result<(), AppError> {
    if !request.payload.is_object() {
        return Err(AppError::Validation(
            "payload must be a JSON object".to_string(),
        ));
    }
    if let Some(key) = &request.idempotency_key {
        if key.is_empty() || key.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(AppError::Validation(format!(
                "idempotency_key must be 1..={MAX_IDEMPOTENCY_KEY_LEN} characters"
            )));
        }
    }
    if let Some(max_retries) = request.max_retries {
        if max_retries < 0 {
            return Err(AppError::Validation(
                "max_retries must be non-negative".to_string(),
            ));
        }
    }
    Ok(())
}

fn page_bounds(limit: Option<i64>, offset: Option<i64>) -> Result<(i64, i64), AppError> {
    let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    if limit < 1 || limit > MAX_PAGE_LIMIT {
        return Err(AppError::Validation(format!(
            "limit must be 1..={MAX_PAGE_LIMIT}"
        )));
    }
    let offset = offset.unwrap_or(0);
    if offset < 0 {
        return Err(AppError::Validation("offset must be non-negative".to_string()));
    }
    Ok((limit, offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use sqlx::PgPool;
    use tokio::sync::broadcast::error::TryRecvError;

    async fn setup(pool: PgPool) -> (JobService, Tenant, EventBus) {
        let store = Store::new(pool);
        store.init_schema().await.unwrap();
        let tenant = store
            .create_tenant("acme", "acme-key", Some("Acme"), 2, 10)
            .await
            .unwrap();

        let events = EventBus::new(64);
        let service = JobService::new(store, Arc::new(Admission::new()), events.clone(), 3);
        (service, tenant, events)
    }

    fn submit_request(key: Option<&str>) -> SubmitJobRequest {
        SubmitJobRequest {
            payload: json!({"x": 1}),
            idempotency_key: key.map(str::to_string),
            max_retries: None,
        }
    }

    #[sqlx::test]
    async fn submit_creates_pending_job_and_emits_event(pool: PgPool) {
        let (service, tenant, events) = setup(pool).await;
        let mut rx = events.subscribe();

        let outcome = service.submit(&tenant, submit_request(None)).await.unwrap();

        assert!(outcome.created);
        assert_eq!(outcome.job.status, JobStatus::Pending);
        assert_eq!(outcome.job.max_retries, 3);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, EventKind::JobSubmitted);
        assert_eq!(event.job_id, outcome.job.id);
        assert_eq!(event.trace_id, outcome.job.trace_id);
    }

    #[sqlx::test]
    async fn idempotent_submit_returns_same_job_and_one_event(pool: PgPool) {
        let (service, tenant, events) = setup(pool).await;
        let mut rx = events.subscribe();

        let first = service
            .submit(&tenant, submit_request(Some("k1")))
            .await
            .unwrap();
        let second = service
            .submit(&tenant, submit_request(Some("k1")))
            .await
            .unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.job.id, second.job.id);

        assert_eq!(rx.try_recv().unwrap().kind, EventKind::JobSubmitted);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[sqlx::test]
    async fn submissions_beyond_the_bucket_are_rate_limited(pool: PgPool) {
        let (service, mut tenant, _events) = setup(pool).await;
        tenant.rate_limit_per_minute = 2;

        service.submit(&tenant, submit_request(None)).await.unwrap();
        service.submit(&tenant, submit_request(None)).await.unwrap();
        let denied = service.submit(&tenant, submit_request(None)).await;

        match denied {
            Err(AppError::RateLimited(_)) => {}
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[sqlx::test]
    async fn saturated_tenant_is_denied_with_concurrency_exceeded(pool: PgPool) {
        let store = Store::new(pool);
        store.init_schema().await.unwrap();
        let tenant = store
            .create_tenant("acme", "acme-key", None, 1, 100)
            .await
            .unwrap();

        let admission = Arc::new(Admission::new());
        admission.rebuild_running(vec![("acme".to_string(), 1)]);
        let service = JobService::new(store, admission, EventBus::new(64), 3);

        let denied = service.submit(&tenant, submit_request(None)).await;
        match denied {
            Err(AppError::ConcurrencyExceeded(_)) => {}
            other => panic!("expected ConcurrencyExceeded, got {other:?}"),
        }
    }

    #[sqlx::test]
    async fn non_object_payload_is_rejected(pool: PgPool) {
        let (service, tenant, _events) = setup(pool).await;

        let denied = service
            .submit(
                &tenant,
                SubmitJobRequest {
                    payload: json!([1, 2, 3]),
                    idempotency_key: None,
                    max_retries: None,
                },
            )
            .await;

        match denied {
            Err(AppError::Validation(_)) => {}
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[sqlx::test]
    async fn get_job_hides_foreign_jobs(pool: PgPool) {
        let (service, tenant, _events) = setup(pool).await;
        let outcome = service.submit(&tenant, submit_request(None)).await.unwrap();

        let other = Tenant {
            id: "globex".into(),
            ..tenant.clone()
        };
        // globex exists as a tenant in other tests; here the lookup alone
        // must come back empty regardless.
        let denied = service.get_job(&other, outcome.job.id).await;
        match denied {
            Err(AppError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[sqlx::test]
    async fn list_rejects_unknown_status(pool: PgPool) {
        let (service, tenant, _events) = setup(pool).await;

        let denied = service
            .list_jobs(
                &tenant,
                ListJobsQuery {
                    status: Some("queued".into()),
                    limit: None,
                    offset: None,
                },
            )
            .await;

        match denied {
            Err(AppError::Validation(_)) => {}
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[sqlx::test]
    async fn metrics_summarizes_and_snapshots(pool: PgPool) {
        let (service, tenant, _events) = setup(pool).await;
        service.submit(&tenant, submit_request(None)).await.unwrap();

        let summary = service.metrics(&tenant).await.unwrap();
        assert_eq!(summary.total, 1);
        assert_eq!(summary.pending, 1);
    }
}
