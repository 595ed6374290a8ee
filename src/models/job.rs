use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Lifecycle state of an image generation job.
///
/// Stored as free text in `image_jobs.status`; the spellings below are the
/// only values the stages read or write.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq, Hash)]
pub enum JobStatus {
    ReadyToGenerate,
    Generate,
    ReadyToPublish,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::ReadyToGenerate => "ReadyToGenerate",
            JobStatus::Generate => "Generate",
            JobStatus::ReadyToPublish => "ReadyToPublish",
            JobStatus::Failed => "Failed",
        }
    }

    /// `ReadyToPublish` and `Failed` are never claimed again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::ReadyToPublish | JobStatus::Failed)
    }
}

/// A row of `image_jobs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageJob {
    pub id: i64,
    pub prompt: Option<String>,
    pub correlation_id: Option<String>,
    pub status: JobStatus,
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImageJob {
    pub fn prompt_text(&self) -> &str {
        self.prompt.as_deref().unwrap_or_default()
    }

    /// Correlation id, treating an empty string the same as NULL.
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref().filter(|id| !id.is_empty())
    }
}
