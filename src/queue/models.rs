//! Row types for the scrape job queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The kind of page a scrape job targets, determining which handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "scrape_job_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Navigation,
    Category,
    Product,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Navigation => "navigation",
            JobType::Category => "category",
            JobType::Product => "product",
        }
    }
}

impl std::str::FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "navigation" => Ok(JobType::Navigation),
            "category" => Ok(JobType::Category),
            "product" => Ok(JobType::Product),
            other => Err(format!("unknown job type: {other}")),
        }
    }
}

/// Queue lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "scrape_job_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

/// A job row as stored in `scrape_job`.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct ScrapeJob {
    pub id: Uuid,
    pub job_type: JobType,
    pub target_url: String,
    pub priority: i32,
    pub status: JobStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub last_error: Option<String>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Pipeline outcome summary merged into the job's metadata on completion
/// (or on failure, for whatever partial progress was made).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultSummary {
    pub items_processed: i64,
    pub duration_ms: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_by: Option<String>,
}

/// Per-status row counts plus the number of currently held leases.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct QueueStats {
    pub queued: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub locked: i64,
}
