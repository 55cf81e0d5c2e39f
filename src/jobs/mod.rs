//! Asynchronous batch mapping jobs.
//!
//! Jobs live only in process memory; a restart loses them. The queue runs a
//! bounded number of jobs concurrently, items within a job strictly in
//! order.

pub mod queue;
pub mod runner;

pub use queue::{JobQueue, JobQueueConfig, ProgressEvent};
pub use runner::{BatchItemRunner, PipelineItemRunner};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::models::SourceSystem;
use crate::service::MappingPayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// One entry of a job's input list.
#[derive(Debug, Clone, Serialize)]
pub struct JobItem {
    pub code: String,
    pub system: SourceSystem,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<MappingPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobItem {
    fn new(code: String, system: SourceSystem) -> Self {
        Self {
            code,
            system,
            status: ItemStatus::Pending,
            result: None,
            error: None,
        }
    }
}

/// Progress counters. `completed` counts items processed without error,
/// `successful` the subset that resolved to a target, `failed` the items
/// that errored. Percentage is over completed items.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct JobProgress {
    pub total: u32,
    pub completed: u32,
    pub successful: u32,
    pub failed: u32,
    pub percentage: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchJob {
    pub id: Uuid,
    pub status: JobStatus,
    pub items: Vec<JobItem>,
    pub progress: JobProgress,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    pub save_results: bool,
}

impl BatchJob {
    pub fn new(
        codes: Vec<(String, SourceSystem)>,
        actor: Option<String>,
        callback_url: Option<String>,
        save_results: bool,
    ) -> Self {
        let items: Vec<JobItem> = codes
            .into_iter()
            .map(|(code, system)| JobItem::new(code, system))
            .collect();
        let progress = JobProgress {
            total: items.len() as u32,
            ..Default::default()
        };
        Self {
            id: Uuid::new_v4(),
            status: JobStatus::Pending,
            items,
            progress,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            actor,
            callback_url,
            save_results,
        }
    }

    pub(crate) fn recompute_progress(&mut self) {
        let total = self.items.len() as u32;
        let completed = self
            .items
            .iter()
            .filter(|i| i.status == ItemStatus::Completed)
            .count() as u32;
        let successful = self
            .items
            .iter()
            .filter(|i| {
                i.status == ItemStatus::Completed
                    && i.result.as_ref().is_some_and(|r| r.matched())
            })
            .count() as u32;
        let failed = self
            .items
            .iter()
            .filter(|i| i.status == ItemStatus::Failed)
            .count() as u32;
        self.progress = JobProgress {
            total,
            completed,
            successful,
            failed,
            percentage: if total > 0 { completed * 100 / total } else { 0 },
        };
    }
}

/// Rough wall-clock estimate returned on admission: inter-item delay plus a
/// couple of seconds of model latency per item.
pub fn estimate_duration_secs(item_count: usize, item_delay_ms: u64) -> u64 {
    (item_count as u64) * (item_delay_ms + 2000) / 1000
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Equivalence;
    use crate::service::{MappingPayload, SourceRef, TargetRef};

    fn payload(matched: bool) -> MappingPayload {
        MappingPayload {
            source: SourceRef {
                code: "AAA-1".to_string(),
                system: SourceSystem::Ayurveda,
                term: "jvara".to_string(),
                english_name: None,
            },
            target: matched.then(|| TargetRef {
                code: "SK00.0".to_string(),
                title: "Fever disorder".to_string(),
            }),
            equivalence: if matched {
                Equivalence::Equivalent
            } else {
                Equivalence::Unmatched
            },
            confidence: if matched { 0.9 } else { 0.0 },
            reasoning: String::new(),
        }
    }

    #[test]
    fn progress_counts_by_item_state() {
        let mut job = BatchJob::new(
            vec![
                ("AAA-1".to_string(), SourceSystem::Ayurveda),
                ("AAA-2".to_string(), SourceSystem::Ayurveda),
                ("AAA-3".to_string(), SourceSystem::Ayurveda),
                ("AAA-4".to_string(), SourceSystem::Ayurveda),
            ],
            None,
            None,
            true,
        );
        job.items[0].status = ItemStatus::Completed;
        job.items[0].result = Some(payload(true));
        job.items[1].status = ItemStatus::Completed;
        job.items[1].result = Some(payload(false));
        job.items[2].status = ItemStatus::Failed;
        job.items[2].error = Some("code not found".to_string());
        job.recompute_progress();

        assert_eq!(job.progress.total, 4);
        assert_eq!(job.progress.completed, 2);
        assert_eq!(job.progress.successful, 1);
        assert_eq!(job.progress.failed, 1);
        assert_eq!(job.progress.percentage, 50);
        assert!(job.progress.completed + job.progress.failed <= job.progress.total);
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
    }
}
