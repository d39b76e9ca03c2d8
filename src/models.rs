use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Dlq,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Dlq => "dlq",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "dlq" => Some(JobStatus::Dlq),
            _ => None,
        }
    }

    /// Statuses a worker will never touch again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Dlq
        )
    }
}

/// A unit of work owned by a tenant. The payload is opaque to the queue;
/// only the pluggable handler interprets it.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub tenant_id: String,
    pub status: JobStatus,
    pub payload: JsonValue,
    pub result: Option<JsonValue>,
    pub error_message: Option<String>,
    pub idempotency_key: Option<String>,
    pub trace_id: String,
    pub retry_count: i32,
    pub max_retries: i32,
    pub worker_id: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// An isolated principal with its own credential and admission limits.
/// Rows are provisioned out-of-band; the queue only reads them.
#[derive(Debug, Clone, Serialize)]
pub struct Tenant {
    pub id: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub name: Option<String>,
    pub max_concurrent_jobs: i32,
    pub rate_limit_per_minute: i32,
    pub created_at: DateTime<Utc>,
}

/// Copy-forward of a job that exhausted its retries. Immutable once written.
#[derive(Debug, Clone, Serialize)]
pub struct DlqEntry {
    pub id: Uuid,
    pub original_job_id: Uuid,
    pub tenant_id: String,
    pub payload: JsonValue,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub original_created_at: DateTime<Utc>,
    pub failed_at: DateTime<Utc>,
    pub trace_id: String,
}

// ---------------------------------------------------------------------------
// API DTOs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub payload: JsonValue,
    pub idempotency_key: Option<String>,
    pub max_retries: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ListDlqQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    pub total: i64,
}

#[derive(Debug, Serialize)]
pub struct DlqPage {
    pub entries: Vec<DlqEntry>,
    pub total: i64,
}

/// Counts by status for one tenant, derived from the jobs table on demand.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetricsSummary {
    pub total: i64,
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub dlq: i64,
}
