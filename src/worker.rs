use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::{json, Value as JsonValue};
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::admission::Admission;
use crate::events::{Event, EventBus, EventKind};
use crate::models::Job;
use crate::store::{FailOutcome, Store};

/// How a handler attempt failed. Retryable errors traverse the retry
/// ladder; permanent ones go straight to the DLQ.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Retryable(String),
    #[error("{0}")]
    Permanent(String),
}

/// Handed to the handler for lease heartbeats and cancellation checks.
pub struct HandlerContext {
    job_id: Uuid,
    worker_id: String,
    deadline: Option<DateTime<Utc>>,
    lease_ttl: Duration,
    store: Store,
    cancelled: AtomicBool,
}

impl HandlerContext {
    fn new(job: &Job, worker_id: String, lease_ttl: Duration, store: Store) -> Self {
        Self {
            job_id: job.id,
            worker_id,
            deadline: job.lease_expires_at,
            lease_ttl,
            store,
            cancelled: AtomicBool::new(false),
        }
    }

    /// The handler should wind down by this instant; past it the lease may
    /// be reclaimed at any moment.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }

    /// Heartbeat for long-running handlers. Returns false once the job was
    /// reclaimed, after which the handler must stop: any result it still
    /// produces will be discarded.
    pub async fn renew_lease(&self) -> bool {
        match self
            .store
            .renew_lease(self.job_id, &self.worker_id, self.lease_ttl)
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                self.cancelled.store(true, Ordering::SeqCst);
                false
            }
            Err(e) => {
                warn!(job_id = %self.job_id, error = %e, "lease renewal failed");
                false
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// The pluggable business logic executed for each job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: &Job, ctx: &HandlerContext) -> Result<JsonValue, HandlerError>;
}

/// Built-in stub handler: sleeps for `sleep_ms` (default one second) and
/// succeeds, unless the payload asks for a failure. Real deployments plug
/// in their own handler.
pub struct SleepHandler;

pub(crate) fn failure_directive(payload: &JsonValue) -> Option<HandlerError> {
    if payload
        .get("permanent")
        .and_then(JsonValue::as_bool)
        .unwrap_or(false)
    {
        let message = payload
            .get("fail")
            .and_then(JsonValue::as_str)
            .unwrap_or("permanent failure requested");
        return Some(HandlerError::Permanent(message.to_string()));
    }
    payload
        .get("fail")
        .and_then(JsonValue::as_str)
        .map(|message| HandlerError::Retryable(message.to_string()))
}

#[async_trait]
impl JobHandler for SleepHandler {
    async fn run(&self, job: &Job, _ctx: &HandlerContext) -> Result<JsonValue, HandlerError> {
        let sleep_ms = job
            .payload
            .get("sleep_ms")
            .and_then(JsonValue::as_u64)
            .unwrap_or(1000);
        sleep(Duration::from_millis(sleep_ms)).await;

        if let Some(err) = failure_directive(&job.payload) {
            return Err(err);
        }
        Ok(json!({"result": "success", "processed": job.payload}))
    }
}

/// One dequeue/execute/ack loop. Peers coordinate purely through the
/// store's locking discipline.
pub struct Worker {
    worker_id: String,
    store: Store,
    admission: Arc<Admission>,
    events: EventBus,
    handler: Arc<dyn JobHandler>,
    lease_ttl: Duration,
    poll_interval: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: String,
        store: Store,
        admission: Arc<Admission>,
        events: EventBus,
        handler: Arc<dyn JobHandler>,
        lease_ttl: Duration,
        poll_interval: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            worker_id,
            store,
            admission,
            events,
            handler,
            lease_ttl,
            poll_interval,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        info!(worker_id = %self.worker_id, "worker started");

        loop {
            if self.shutdown_requested() {
                break;
            }

            match self.run_once().await {
                // A job was processed; go straight back for the next one.
                Ok(true) => {}
                Ok(false) => {
                    if self.idle_wait().await {
                        break;
                    }
                }
                Err(e) => {
                    error!(worker_id = %self.worker_id, error = %e, "claim failed; backing off");
                    if self.idle_wait().await {
                        break;
                    }
                }
            }
        }

        info!(worker_id = %self.worker_id, "worker stopped");
    }

    /// Claim and process at most one job. Returns whether a job was
    /// processed, so callers know whether to poll again immediately.
    pub async fn run_once(&mut self) -> Result<bool, sqlx::Error> {
        let Some(job) = self
            .store
            .claim_next_pending(&self.worker_id, self.lease_ttl)
            .await?
        else {
            return Ok(false);
        };

        self.admission.reserve(&job.tenant_id);
        self.process_job(job).await;
        Ok(true)
    }

    async fn process_job(&self, job: Job) {
        info!(
            job_id = %job.id,
            tenant_id = %job.tenant_id,
            worker_id = %self.worker_id,
            trace_id = %job.trace_id,
            attempt = job.retry_count + 1,
            "job started"
        );
        self.events.publish(Event::for_job(EventKind::JobStarted, &job));

        let ctx = HandlerContext::new(
            &job,
            self.worker_id.clone(),
            self.lease_ttl,
            self.store.clone(),
        );

        match self.handler.run(&job, &ctx).await {
            Ok(result) => self.ack_success(&job, result).await,
            Err(err) => self.ack_failure(&job, err).await,
        }
    }

    async fn ack_success(&self, job: &Job, result: JsonValue) {
        match self
            .store
            .complete_job(job.id, &self.worker_id, result.clone())
            .await
        {
            Ok(true) => {
                self.admission.release(&job.tenant_id);
                info!(
                    job_id = %job.id,
                    tenant_id = %job.tenant_id,
                    trace_id = %job.trace_id,
                    "job completed"
                );
                self.events
                    .publish(Event::for_job(EventKind::JobCompleted, job).with_payload(result));
            }
            Ok(false) => {
                // Lease was reclaimed mid-flight; the reaper already
                // released the slot and the result must not be recorded.
                warn!(
                    job_id = %job.id,
                    worker_id = %self.worker_id,
                    "lease lost before completion; result discarded"
                );
            }
            Err(e) => {
                // Leave the row alone: the lease will expire and another
                // worker will pick the job up.
                error!(job_id = %job.id, error = %e, "failed to record completion");
            }
        }
    }

    async fn ack_failure(&self, job: &Job, err: HandlerError) {
        let permanent = matches!(err, HandlerError::Permanent(_));
        let message = err.to_string();

        match self
            .store
            .fail_and_retry(job.id, &self.worker_id, &message, permanent)
            .await
        {
            Ok(Some(FailOutcome::Retried)) => {
                self.admission.release(&job.tenant_id);
                warn!(
                    job_id = %job.id,
                    tenant_id = %job.tenant_id,
                    trace_id = %job.trace_id,
                    retry_count = job.retry_count + 1,
                    max_retries = job.max_retries,
                    error = %message,
                    "job failed; re-queued"
                );
                self.events.publish(
                    Event::for_job(EventKind::JobRetry, job)
                        .with_payload(json!({"retry_count": job.retry_count + 1})),
                );
            }
            Ok(Some(FailOutcome::DeadLettered)) => {
                self.admission.release(&job.tenant_id);
                warn!(
                    job_id = %job.id,
                    tenant_id = %job.tenant_id,
                    trace_id = %job.trace_id,
                    error = %message,
                    "job moved to DLQ"
                );
                self.events.publish(
                    Event::for_job(EventKind::JobDlq, job)
                        .with_payload(json!({"error_message": message})),
                );
            }
            Ok(None) => {
                warn!(
                    job_id = %job.id,
                    worker_id = %self.worker_id,
                    "lease lost before failure ack"
                );
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "failed to record failure");
            }
        }
    }

    fn shutdown_requested(&mut self) -> bool {
        use broadcast::error::TryRecvError;
        match self.shutdown.try_recv() {
            Ok(()) | Err(TryRecvError::Closed) => true,
            Err(_) => false,
        }
    }

    /// Sleep one (jittered) poll interval, waking early on shutdown.
    /// Returns true when shutdown was signalled.
    async fn idle_wait(&mut self) -> bool {
        let jitter: u64 = rand::thread_rng().gen_range(0..=250);
        let nap = self.poll_interval + Duration::from_millis(jitter);
        tokio::select! {
            _ = sleep(nap) => false,
            _ = self.shutdown.recv() => true,
        }
    }
}
