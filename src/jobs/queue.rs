//! The in-memory job queue and its scheduler.
//!
//! All queue state lives behind one mutex: the job map, the FIFO of pending
//! ids, the running count, and the set of cancellation flags. Progress
//! events are emitted outside the lock. Workers check cancellation at item
//! boundaries only, so an in-flight item always completes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use super::{BatchItemRunner, BatchJob, ItemStatus, JobProgress, JobStatus};
use crate::error::{AppError, AppResult};
use crate::models::SourceSystem;

#[derive(Debug, Clone)]
pub struct JobQueueConfig {
    pub max_concurrent: usize,
    pub item_delay: Duration,
    pub retention: Duration,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            item_delay: Duration::from_millis(500),
            retention: Duration::from_millis(86_400_000),
        }
    }
}

/// Emitted after every processed item. Delivery is best-effort; slow
/// listeners lose events, never block workers.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProgressEvent {
    pub job_id: Uuid,
    pub item_index: usize,
    pub item_status: ItemStatus,
    pub progress: JobProgress,
}

struct QueueState {
    jobs: HashMap<Uuid, BatchJob>,
    pending: VecDeque<Uuid>,
    active: usize,
    cancel_requested: HashSet<Uuid>,
}

pub struct JobQueue {
    state: Mutex<QueueState>,
    events: broadcast::Sender<ProgressEvent>,
    config: JobQueueConfig,
    runner: Arc<dyn BatchItemRunner>,
    http: reqwest::Client,
}

impl JobQueue {
    pub fn new(config: JobQueueConfig, runner: Arc<dyn BatchItemRunner>) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            state: Mutex::new(QueueState {
                jobs: HashMap::new(),
                pending: VecDeque::new(),
                active: 0,
                cancel_requested: HashSet::new(),
            }),
            events,
            config,
            runner,
            http: reqwest::Client::new(),
        })
    }

    /// Admit a job and return its initial snapshot. Scheduling happens
    /// immediately when a worker slot is free.
    pub fn submit(
        queue: &Arc<Self>,
        codes: Vec<(String, SourceSystem)>,
        actor: Option<String>,
        callback_url: Option<String>,
        save_results: bool,
    ) -> BatchJob {
        let job = BatchJob::new(codes, actor, callback_url, save_results);
        let snapshot = job.clone();
        {
            let mut state = queue.state.lock();
            state.pending.push_back(job.id);
            state.jobs.insert(job.id, job);
        }
        info!(job_id = %snapshot.id, items = snapshot.items.len(), "batch job admitted");
        Self::dispatch(queue);
        snapshot
    }

    pub fn snapshot(&self, id: Uuid) -> Option<BatchJob> {
        self.state.lock().jobs.get(&id).cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    /// Cancel a PENDING or PROCESSING job. A pending job terminates here;
    /// a running one stops at the next item boundary.
    pub fn cancel(&self, id: Uuid) -> AppResult<BatchJob> {
        let mut state = self.state.lock();
        let job = state
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("job {} not found", id)))?;

        match job.status {
            JobStatus::Pending => {
                state.pending.retain(|pending| *pending != id);
                match state.jobs.get_mut(&id) {
                    Some(job) => {
                        job.status = JobStatus::Cancelled;
                        job.completed_at = Some(Utc::now());
                        Ok(job.clone())
                    }
                    None => Err(AppError::NotFound(format!("job {} not found", id))),
                }
            }
            JobStatus::Processing => {
                state.cancel_requested.insert(id);
                Ok(job)
            }
            status => Err(AppError::Validation(format!(
                "job {} is already {}",
                id, status
            ))),
        }
    }

    /// Fill free worker slots from the pending FIFO.
    fn dispatch(queue: &Arc<Self>) {
        loop {
            let next = {
                let mut state = queue.state.lock();
                if state.active >= queue.config.max_concurrent {
                    return;
                }
                match state.pending.pop_front() {
                    Some(id) => {
                        state.active += 1;
                        id
                    }
                    None => return,
                }
            };
            let worker = Arc::clone(queue);
            tokio::spawn(async move {
                worker.run_job(next).await;
            });
        }
    }

    async fn run_job(self: Arc<Self>, id: Uuid) {
        let plan = {
            let mut state = self.state.lock();
            match state.jobs.get_mut(&id) {
                // Cancelled between admission and dispatch.
                Some(job) if job.status != JobStatus::Pending => None,
                Some(job) => {
                    job.status = JobStatus::Processing;
                    job.started_at = Some(Utc::now());
                    Some((
                        job.items
                            .iter()
                            .map(|i| (i.code.clone(), i.system))
                            .collect::<Vec<_>>(),
                        job.save_results,
                    ))
                }
                None => None,
            }
        };
        let Some((items, save_results)) = plan else {
            Self::finish_slot(&self);
            return;
        };

        for (index, (code, system)) in items.iter().enumerate() {
            if self.state.lock().cancel_requested.contains(&id) {
                break;
            }
            if index > 0 && !self.config.item_delay.is_zero() {
                tokio::time::sleep(self.config.item_delay).await;
            }

            self.update_item(id, index, |item| {
                item.status = ItemStatus::Processing;
            });

            let result = self.runner.run_item(code, *system, save_results).await;

            let event = {
                let mut state = self.state.lock();
                let Some(job) = state.jobs.get_mut(&id) else {
                    break;
                };
                let item = &mut job.items[index];
                match result {
                    Ok(payload) => {
                        item.status = ItemStatus::Completed;
                        item.result = Some(payload);
                    }
                    Err(message) => {
                        item.status = ItemStatus::Failed;
                        item.error = Some(message);
                    }
                }
                let item_status = item.status;
                job.recompute_progress();
                ProgressEvent {
                    job_id: id,
                    item_index: index,
                    item_status,
                    progress: job.progress,
                }
            };
            let _ = self.events.send(event);
        }

        Self::finalize(&self, id).await;
    }

    /// Set the terminal status, release the worker slot, fire the webhook,
    /// and pull the next pending job.
    async fn finalize(queue: &Arc<Self>, id: Uuid) {
        let terminal = {
            let mut state = queue.state.lock();
            let cancelled = state.cancel_requested.remove(&id);
            let job = state.jobs.get_mut(&id).map(|job| {
                job.status = if cancelled {
                    JobStatus::Cancelled
                } else if job.progress.completed >= 1 {
                    JobStatus::Completed
                } else {
                    JobStatus::Failed
                };
                job.completed_at = Some(Utc::now());
                job.clone()
            });
            state.active = state.active.saturating_sub(1);
            job
        };

        // Free the slot before the webhook so the next job is not held up
        // by a slow callback endpoint.
        Self::dispatch(queue);

        if let Some(job) = terminal {
            info!(job_id = %id, status = %job.status, "batch job finished");
            if let Some(url) = job.callback_url.clone() {
                queue.post_callback(&url, &job).await;
            }
        }
    }

    fn finish_slot(queue: &Arc<Self>) {
        {
            let mut state = queue.state.lock();
            state.active = state.active.saturating_sub(1);
        }
        Self::dispatch(queue);
    }

    fn update_item<F: FnOnce(&mut super::JobItem)>(&self, id: Uuid, index: usize, f: F) {
        let mut state = self.state.lock();
        if let Some(job) = state.jobs.get_mut(&id) {
            if let Some(item) = job.items.get_mut(index) {
                f(item);
            }
        }
    }

    /// One POST, never retried.
    async fn post_callback(&self, url: &str, job: &BatchJob) {
        let body = serde_json::json!({
            "job_id": job.id,
            "status": job.status,
            "progress": job.progress,
            "completed_at": job.completed_at,
        });
        match self
            .http
            .post(url)
            .timeout(Duration::from_secs(10))
            .json(&body)
            .send()
            .await
        {
            Ok(response) if !response.status().is_success() => {
                warn!(job_id = %job.id, status = %response.status(), "job callback rejected");
            }
            Err(e) => warn!(job_id = %job.id, error = %e, "job callback failed"),
            _ => {}
        }
    }

    /// Periodic reaper for terminal jobs past the retention window.
    pub fn start_retention_sweeper(queue: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(3600));
            loop {
                interval.tick().await;
                let cutoff = Utc::now()
                    - chrono::Duration::from_std(queue.config.retention)
                        .unwrap_or_else(|_| chrono::Duration::hours(24));
                let mut state = queue.state.lock();
                state.jobs.retain(|_, job| {
                    !(job.status.is_terminal()
                        && job.completed_at.map(|at| at < cutoff).unwrap_or(false))
                });
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Equivalence;
    use crate::service::{MappingPayload, SourceRef, TargetRef};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn payload(code: &str) -> MappingPayload {
        MappingPayload {
            source: SourceRef {
                code: code.to_string(),
                system: SourceSystem::Ayurveda,
                term: "jvara".to_string(),
                english_name: None,
            },
            target: Some(TargetRef {
                code: "SK00.0".to_string(),
                title: "Fever disorder".to_string(),
            }),
            equivalence: Equivalence::Equivalent,
            confidence: 0.9,
            reasoning: String::new(),
        }
    }

    /// Runner scripted to fail for codes starting with "BAD".
    struct ScriptedRunner {
        calls: AtomicU32,
        gate: Option<tokio::sync::Semaphore>,
    }

    impl ScriptedRunner {
        fn new() -> Self {
            Self {
                calls: AtomicU32::new(0),
                gate: None,
            }
        }

        fn gated(permits: usize) -> Self {
            Self {
                calls: AtomicU32::new(0),
                gate: Some(tokio::sync::Semaphore::new(permits)),
            }
        }
    }

    #[async_trait]
    impl BatchItemRunner for ScriptedRunner {
        async fn run_item(
            &self,
            code: &str,
            _system: SourceSystem,
            _save_results: bool,
        ) -> Result<MappingPayload, String> {
            // Each item consumes one permit for good, so tests can meter
            // exactly how far a job may advance.
            if let Some(gate) = &self.gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            if code.starts_with("BAD") {
                Err("code not found".to_string())
            } else {
                Ok(payload(code))
            }
        }
    }

    fn fast_config() -> JobQueueConfig {
        JobQueueConfig {
            max_concurrent: 3,
            item_delay: Duration::from_millis(0),
            retention: Duration::from_secs(3600),
        }
    }

    async fn wait_terminal(queue: &Arc<JobQueue>, id: Uuid) -> BatchJob {
        for _ in 0..200 {
            if let Some(job) = queue.snapshot(id) {
                if job.status.is_terminal() {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job never reached a terminal state");
    }

    #[tokio::test]
    async fn job_completes_in_order_with_progress() {
        let queue = JobQueue::new(fast_config(), Arc::new(ScriptedRunner::new()));
        let mut events = queue.subscribe();
        let job = JobQueue::submit(
            &queue,
            vec![
                ("AAA-1".to_string(), SourceSystem::Ayurveda),
                ("AAA-2".to_string(), SourceSystem::Ayurveda),
            ],
            None,
            None,
            false,
        );
        assert_eq!(job.status, JobStatus::Pending);

        let terminal = wait_terminal(&queue, job.id).await;
        assert_eq!(terminal.status, JobStatus::Completed);
        assert_eq!(terminal.progress.completed, 2);
        assert_eq!(terminal.progress.failed, 0);
        assert_eq!(
            terminal.progress.completed + terminal.progress.failed,
            terminal.progress.total
        );
        assert!(terminal.completed_at.is_some());

        // Events arrive in item order with nondecreasing completion counts.
        let first = events.recv().await.unwrap();
        let second = events.recv().await.unwrap();
        assert_eq!(first.item_index, 0);
        assert_eq!(second.item_index, 1);
        assert!(second.progress.completed >= first.progress.completed);
    }

    #[tokio::test]
    async fn partial_failure_still_completes() {
        let queue = JobQueue::new(fast_config(), Arc::new(ScriptedRunner::new()));
        let job = JobQueue::submit(
            &queue,
            vec![
                ("AAA-1".to_string(), SourceSystem::Ayurveda),
                ("BAD-1".to_string(), SourceSystem::Ayurveda),
            ],
            None,
            None,
            false,
        );
        let terminal = wait_terminal(&queue, job.id).await;
        assert_eq!(terminal.status, JobStatus::Completed);
        assert_eq!(terminal.progress.completed, 1);
        assert_eq!(terminal.progress.failed, 1);
        assert_eq!(terminal.items[1].error.as_deref(), Some("code not found"));
    }

    #[tokio::test]
    async fn all_failures_mean_failed() {
        let queue = JobQueue::new(fast_config(), Arc::new(ScriptedRunner::new()));
        let job = JobQueue::submit(
            &queue,
            vec![
                ("BAD-1".to_string(), SourceSystem::Ayurveda),
                ("BAD-2".to_string(), SourceSystem::Ayurveda),
            ],
            None,
            None,
            false,
        );
        let terminal = wait_terminal(&queue, job.id).await;
        assert_eq!(terminal.status, JobStatus::Failed);
        assert_eq!(terminal.progress.completed, 0);
        assert_eq!(terminal.progress.failed, 2);
    }

    #[tokio::test]
    async fn cancellation_stops_at_item_boundary() {
        let runner = Arc::new(ScriptedRunner::gated(1));
        let queue = JobQueue::new(fast_config(), runner.clone());
        let mut events = queue.subscribe();
        let job = JobQueue::submit(
            &queue,
            vec![
                ("AAA-1".to_string(), SourceSystem::Ayurveda),
                ("AAA-2".to_string(), SourceSystem::Ayurveda),
                ("AAA-3".to_string(), SourceSystem::Ayurveda),
            ],
            None,
            None,
            true,
        );

        // First item finishes (one gate permit), then cancel and open the
        // gate for anything already past the boundary check.
        let first = events.recv().await.unwrap();
        assert_eq!(first.item_index, 0);
        queue.cancel(job.id).unwrap();
        if let Some(gate) = &runner.gate {
            gate.add_permits(8);
        }

        let terminal = wait_terminal(&queue, job.id).await;
        assert_eq!(terminal.status, JobStatus::Cancelled);
        assert!(terminal.progress.completed >= 1);
        assert!(terminal.progress.completed + terminal.progress.failed <= 3);
        // At most the in-flight item ran after cancellation.
        assert!(runner.calls.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn cancelling_a_pending_job_terminates_it() {
        // One gated job occupies the only worker; the second stays pending.
        let runner = Arc::new(ScriptedRunner::gated(0));
        let config = JobQueueConfig {
            max_concurrent: 1,
            ..fast_config()
        };
        let queue = JobQueue::new(config, runner.clone());
        let _busy = JobQueue::submit(
            &queue,
            vec![("AAA-1".to_string(), SourceSystem::Ayurveda)],
            None,
            None,
            false,
        );
        let waiting = JobQueue::submit(
            &queue,
            vec![("AAA-2".to_string(), SourceSystem::Ayurveda)],
            None,
            None,
            false,
        );

        let cancelled = queue.cancel(waiting.id).unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());

        // Cancelling a terminal job is a validation error.
        assert!(queue.cancel(waiting.id).is_err());

        if let Some(gate) = &runner.gate {
            gate.add_permits(8);
        }
    }
}
