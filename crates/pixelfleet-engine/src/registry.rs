use pixelfleet_common::error::{ErrorKind, FleetError, Result};
use pixelfleet_common::job::{
    Job, JobFailure, JobId, JobInput, JobKind, JobOutcome, JobState,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::Notify;
use tracing::{debug, info};

/// Mutable fields applied together with a state transition.
#[derive(Default)]
pub struct JobPatch {
    pub assigned_worker: Option<String>,
    pub prompt_id: Option<String>,
    pub result: Option<JobOutcome>,
    pub error: Option<JobFailure>,
}

/// Filter for [`JobRegistry::list`].
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub kind: Option<JobKind>,
    pub worker: Option<String>,
}

/// Counts by state, kind and worker.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub by_state: HashMap<String, usize>,
    pub by_kind: HashMap<String, usize>,
    pub by_worker: HashMap<String, usize>,
}

struct JobEntry {
    job: Job,
    notify: Arc<Notify>,
    /// Timer generation; a cleanup task only fires if its captured epoch
    /// still matches, so rescheduling cancels the previous timer.
    cleanup_epoch: u64,
}

/// Central source of truth for job existence, state and results.
///
/// The map lives behind one mutex with non-suspending critical sections; every
/// returned `Job` is a defensive copy. Each job carries at most one live
/// cleanup timer: one scheduled at `job_timeout` on creation, replaced by a
/// `terminal_retention` timer when the job reaches a terminal state.
pub struct JobRegistry {
    jobs: Mutex<HashMap<JobId, JobEntry>>,
    job_timeout: Duration,
    terminal_retention: Duration,
    /// Self-reference for spawning cleanup timers from `&self` methods.
    me: Weak<JobRegistry>,
}

impl JobRegistry {
    pub fn new(job_timeout: Duration, terminal_retention: Duration) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            jobs: Mutex::new(HashMap::new()),
            job_timeout,
            terminal_retention,
            me: me.clone(),
        })
    }

    /// Creates a job in `pending` state and schedules its deadline timer.
    pub fn create(&self, kind: JobKind, input: JobInput) -> Job {
        let job = Job::new(kind, input);
        let id = job.id;
        {
            let mut jobs = self.jobs.lock().unwrap();
            jobs.insert(
                id,
                JobEntry {
                    job: job.clone(),
                    notify: Arc::new(Notify::new()),
                    cleanup_epoch: 0,
                },
            );
        }
        self.schedule_cleanup(id, 0, self.job_timeout);
        debug!(job = %id, kind = %kind, "job created");
        job
    }

    /// Defensive-copy lookup.
    pub fn get(&self, id: JobId) -> Option<Job> {
        self.jobs.lock().unwrap().get(&id).map(|e| e.job.clone())
    }

    /// Atomically transitions a job, rejecting illegal transitions.
    ///
    /// Terminal transitions set `finished_at`, reschedule cleanup to the
    /// retention window, and wake any synchronous waiters. A `completed`
    /// transition requires a result in the patch; `failed` requires an error.
    pub fn transition(&self, id: JobId, next: JobState, patch: JobPatch) -> Result<Job> {
        let (job, notify, reschedule) = {
            let mut jobs = self.jobs.lock().unwrap();
            let entry = jobs
                .get_mut(&id)
                .ok_or_else(|| FleetError::UnknownJob(id.to_string()))?;

            let current = entry.job.state;
            if !current.can_transition_to(next) {
                return Err(FleetError::IllegalTransition(format!(
                    "job {id}: {current} -> {next}"
                )));
            }
            if next == JobState::Completed && patch.result.is_none() {
                return Err(FleetError::IllegalTransition(format!(
                    "job {id}: completed without a result"
                )));
            }
            if next == JobState::Failed && patch.error.is_none() {
                return Err(FleetError::IllegalTransition(format!(
                    "job {id}: failed without an error"
                )));
            }

            let now = SystemTime::now();
            entry.job.state = next;
            entry.job.last_touched_at = now;
            if let Some(worker) = patch.assigned_worker {
                entry.job.assigned_worker = Some(worker);
            }
            if let Some(prompt_id) = patch.prompt_id {
                entry.job.prompt_id = Some(prompt_id);
            }
            if next == JobState::Processing {
                entry.job.processing_started_at = Some(now);
            }
            if let Some(result) = patch.result {
                entry.job.result = Some(result);
            }
            if let Some(error) = patch.error {
                entry.job.error = Some(error);
            }

            let reschedule = if next.is_terminal() {
                entry.job.finished_at = Some(now);
                entry.cleanup_epoch += 1;
                Some(entry.cleanup_epoch)
            } else {
                None
            };
            (entry.job.clone(), entry.notify.clone(), reschedule)
        };

        if let Some(epoch) = reschedule {
            notify.notify_waiters();
            self.schedule_cleanup(id, epoch, self.terminal_retention);
        }
        Ok(job)
    }

    /// Records the upstream submission id without a state change.
    pub fn note_submission(&self, id: JobId, prompt_id: &str) {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(entry) = jobs.get_mut(&id) {
            entry.job.prompt_id = Some(prompt_id.to_string());
            entry.job.last_touched_at = SystemTime::now();
        }
    }

    /// Removes a job; idempotent. Waiters are woken so they observe the
    /// disappearance.
    pub fn delete(&self, id: JobId) -> bool {
        let entry = self.jobs.lock().unwrap().remove(&id);
        match entry {
            Some(entry) => {
                entry.notify.notify_waiters();
                debug!(job = %id, "job deleted");
                true
            }
            None => false,
        }
    }

    /// Evicts every terminal job immediately. Idempotent.
    pub fn cleanup_terminal(&self) -> usize {
        let mut jobs = self.jobs.lock().unwrap();
        let before = jobs.len();
        jobs.retain(|_, entry| !entry.job.state.is_terminal());
        before - jobs.len()
    }

    /// Snapshots matching the filter, FIFO by creation time.
    pub fn list(&self, filter: &JobFilter) -> Vec<Job> {
        let jobs = self.jobs.lock().unwrap();
        let mut out: Vec<Job> = jobs
            .values()
            .filter(|e| filter.state.map_or(true, |s| e.job.state == s))
            .filter(|e| filter.kind.map_or(true, |k| e.job.kind == k))
            .filter(|e| {
                filter
                    .worker
                    .as_deref()
                    .map_or(true, |w| e.job.assigned_worker.as_deref() == Some(w))
            })
            .map(|e| e.job.clone())
            .collect();
        out.sort_by_key(|j| j.created_at);
        out
    }

    /// Snapshots in one state, FIFO by creation time. The scheduler's pending
    /// scan.
    pub fn list_by_state(&self, state: JobState) -> Vec<Job> {
        self.list(&JobFilter {
            state: Some(state),
            ..Default::default()
        })
    }

    pub fn stats(&self) -> RegistryStats {
        let jobs = self.jobs.lock().unwrap();
        let mut stats = RegistryStats {
            total: jobs.len(),
            ..Default::default()
        };
        for entry in jobs.values() {
            *stats
                .by_state
                .entry(entry.job.state.as_str().to_string())
                .or_default() += 1;
            *stats
                .by_kind
                .entry(entry.job.kind.as_str().to_string())
                .or_default() += 1;
            if let Some(worker) = &entry.job.assigned_worker {
                *stats.by_worker.entry(worker.clone()).or_default() += 1;
            }
        }
        stats
    }

    /// Waits until the job reaches a terminal state, is deleted, or the
    /// deadline passes. Returns the latest snapshot (`None` if the job no
    /// longer exists).
    pub async fn wait_terminal(&self, id: JobId, deadline: Duration) -> Option<Job> {
        let until = Instant::now() + deadline;
        loop {
            let notify = {
                let jobs = self.jobs.lock().unwrap();
                let entry = jobs.get(&id)?;
                if entry.job.state.is_terminal() {
                    return Some(entry.job.clone());
                }
                entry.notify.clone()
            };

            let notified = notify.notified();
            tokio::pin!(notified);
            // Register interest before re-checking, so a transition landing
            // between the check and the await cannot be missed.
            notified.as_mut().enable();

            {
                let jobs = self.jobs.lock().unwrap();
                let entry = jobs.get(&id)?;
                if entry.job.state.is_terminal() {
                    return Some(entry.job.clone());
                }
            }

            let remaining = match until.checked_duration_since(Instant::now()) {
                Some(r) => r,
                None => return self.get(id),
            };
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(remaining) => return self.get(id),
            }
        }
    }

    /// Timer body: fires at `delay` and evicts the job if its epoch is still
    /// current. A non-terminal job at its deadline is failed as stuck and
    /// retained briefly so clients can read the verdict.
    fn schedule_cleanup(&self, id: JobId, epoch: u64, delay: Duration) {
        let Some(registry) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            registry.expire(id, epoch);
        });
    }

    fn expire(&self, id: JobId, epoch: u64) {
        let (notify, reschedule) = {
            let mut jobs = self.jobs.lock().unwrap();
            let Some(entry) = jobs.get_mut(&id) else {
                return;
            };
            if entry.cleanup_epoch != epoch {
                // A newer timer owns this job.
                return;
            }
            if entry.job.state.is_terminal() {
                let notify = entry.notify.clone();
                jobs.remove(&id);
                debug!(job = %id, "terminal job evicted");
                (notify, None)
            } else {
                info!(job = %id, state = %entry.job.state, "job exceeded deadline, failing as stuck");
                entry.job.state = JobState::Failed;
                entry.job.error = Some(JobFailure::new(
                    ErrorKind::Stuck,
                    "job exceeded its deadline before completing",
                ));
                let now = SystemTime::now();
                entry.job.finished_at = Some(now);
                entry.job.last_touched_at = now;
                entry.cleanup_epoch += 1;
                (entry.notify.clone(), Some(entry.cleanup_epoch))
            }
        };
        notify.notify_waiters();
        if let Some(epoch) = reschedule {
            self.schedule_cleanup(id, epoch, self.terminal_retention);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pixelfleet_common::job::ImageFormat;

    fn input() -> JobInput {
        JobInput {
            image_b64: "aGVsbG8=".to_string(),
            format: ImageFormat::Png,
            crop: false,
        }
    }

    fn registry() -> Arc<JobRegistry> {
        JobRegistry::new(Duration::from_secs(300), Duration::from_secs(30))
    }

    fn completed_patch() -> JobPatch {
        JobPatch {
            result: Some(JobOutcome {
                image: "data:image/png;base64,QUFB".to_string(),
                content_type: "image/png".to_string(),
                filename: "out.png".to_string(),
                prompt_id: "p1".to_string(),
            }),
            ..Default::default()
        }
    }

    fn failed_patch() -> JobPatch {
        JobPatch {
            error: Some(JobFailure::new(ErrorKind::Transport, "refused")),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let registry = registry();
        let job = registry.create(JobKind::Upscale, input());
        let fetched = registry.get(job.id).unwrap();
        assert_eq!(fetched.state, JobState::Pending);
        assert_eq!(fetched.kind, JobKind::Upscale);
    }

    #[tokio::test]
    async fn test_get_returns_defensive_copy() {
        let registry = registry();
        let job = registry.create(JobKind::Upscale, input());
        let mut copy = registry.get(job.id).unwrap();
        copy.state = JobState::Completed;
        // Mutating the copy does not touch the registry.
        assert_eq!(registry.get(job.id).unwrap().state, JobState::Pending);
    }

    #[tokio::test]
    async fn test_legal_transition_chain() {
        let registry = registry();
        let job = registry.create(JobKind::Upscale, input());

        let processing = registry
            .transition(
                job.id,
                JobState::Processing,
                JobPatch {
                    assigned_worker: Some("w1".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(processing.state, JobState::Processing);
        assert_eq!(processing.assigned_worker.as_deref(), Some("w1"));
        assert!(processing.processing_started_at.is_some());

        let completed = registry
            .transition(job.id, JobState::Completed, completed_patch())
            .unwrap();
        assert_eq!(completed.state, JobState::Completed);
        assert!(completed.result.is_some());
        assert!(completed.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_illegal_transitions_rejected() {
        let registry = registry();
        let job = registry.create(JobKind::Upscale, input());

        // pending -> completed skips processing.
        assert!(registry
            .transition(job.id, JobState::Completed, completed_patch())
            .is_err());

        registry
            .transition(job.id, JobState::Processing, JobPatch::default())
            .unwrap();
        registry
            .transition(job.id, JobState::Failed, failed_patch())
            .unwrap();

        // No backward transitions from a terminal state.
        assert!(registry
            .transition(job.id, JobState::Processing, JobPatch::default())
            .is_err());
        let state = registry.get(job.id).unwrap().state;
        assert_eq!(state, JobState::Failed);
    }

    #[tokio::test]
    async fn test_completed_requires_result_failed_requires_error() {
        let registry = registry();
        let job = registry.create(JobKind::Upscale, input());
        registry
            .transition(job.id, JobState::Processing, JobPatch::default())
            .unwrap();

        assert!(registry
            .transition(job.id, JobState::Completed, JobPatch::default())
            .is_err());
        assert!(registry
            .transition(job.id, JobState::Failed, JobPatch::default())
            .is_err());
        // Still processing after both rejections.
        assert_eq!(registry.get(job.id).unwrap().state, JobState::Processing);
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let registry = registry();
        let err = registry
            .transition(JobId::new(), JobState::Processing, JobPatch::default())
            .unwrap_err();
        assert!(matches!(err, FleetError::UnknownJob(_)));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let registry = registry();
        let job = registry.create(JobKind::Upscale, input());
        assert!(registry.delete(job.id));
        assert!(!registry.delete(job.id));
        assert!(registry.get(job.id).is_none());
    }

    #[tokio::test]
    async fn test_list_filters_and_fifo_order() {
        let registry = registry();
        let a = registry.create(JobKind::Upscale, input());
        let b = registry.create(JobKind::RemoveBackground, input());
        let c = registry.create(JobKind::Upscale, input());
        registry
            .transition(
                b.id,
                JobState::Processing,
                JobPatch {
                    assigned_worker: Some("w1".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        let pending = registry.list_by_state(JobState::Pending);
        assert_eq!(
            pending.iter().map(|j| j.id).collect::<Vec<_>>(),
            vec![a.id, c.id]
        );

        let upscales = registry.list(&JobFilter {
            kind: Some(JobKind::Upscale),
            ..Default::default()
        });
        assert_eq!(upscales.len(), 2);

        let on_w1 = registry.list(&JobFilter {
            worker: Some("w1".to_string()),
            ..Default::default()
        });
        assert_eq!(on_w1.len(), 1);
        assert_eq!(on_w1[0].id, b.id);
    }

    #[tokio::test]
    async fn test_stats() {
        let registry = registry();
        registry.create(JobKind::Upscale, input());
        let b = registry.create(JobKind::RemoveBackground, input());
        registry
            .transition(
                b.id,
                JobState::Processing,
                JobPatch {
                    assigned_worker: Some("w1".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        let stats = registry.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_state["pending"], 1);
        assert_eq!(stats.by_state["processing"], 1);
        assert_eq!(stats.by_kind["upscale"], 1);
        assert_eq!(stats.by_worker["w1"], 1);
    }

    #[tokio::test]
    async fn test_cleanup_terminal_is_idempotent() {
        let registry = registry();
        let a = registry.create(JobKind::Upscale, input());
        registry.create(JobKind::Upscale, input());
        registry
            .transition(a.id, JobState::Processing, JobPatch::default())
            .unwrap();
        registry
            .transition(a.id, JobState::Completed, completed_patch())
            .unwrap();

        assert_eq!(registry.cleanup_terminal(), 1);
        assert_eq!(registry.cleanup_terminal(), 0);
        assert_eq!(registry.stats().total, 1);
    }

    #[tokio::test]
    async fn test_wait_terminal_wakes_on_transition() {
        let registry = registry();
        let job = registry.create(JobKind::Upscale, input());
        registry
            .transition(job.id, JobState::Processing, JobPatch::default())
            .unwrap();

        let waiter = {
            let registry = registry.clone();
            let id = job.id;
            tokio::spawn(async move { registry.wait_terminal(id, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        registry
            .transition(job.id, JobState::Completed, completed_patch())
            .unwrap();
        let observed = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(observed.state, JobState::Completed);
    }

    #[tokio::test]
    async fn test_wait_terminal_returns_snapshot_on_timeout() {
        let registry = registry();
        let job = registry.create(JobKind::Upscale, input());
        let observed = registry
            .wait_terminal(job.id, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(observed.state, JobState::Pending);
    }

    #[tokio::test]
    async fn test_job_deadline_fails_as_stuck_then_evicts() {
        let registry = JobRegistry::new(Duration::from_millis(100), Duration::from_millis(100));
        let job = registry.create(JobKind::Upscale, input());

        // Past the deadline: failed as stuck, still readable.
        tokio::time::sleep(Duration::from_millis(150)).await;
        let snapshot = registry.get(job.id).unwrap();
        assert_eq!(snapshot.state, JobState::Failed);
        assert_eq!(snapshot.error.as_ref().unwrap().kind, ErrorKind::Stuck);

        // Past the retention window: gone.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(registry.get(job.id).is_none());
    }

    #[tokio::test]
    async fn test_terminal_retention_window() {
        let registry = JobRegistry::new(Duration::from_secs(300), Duration::from_millis(150));
        let job = registry.create(JobKind::Upscale, input());
        registry
            .transition(job.id, JobState::Processing, JobPatch::default())
            .unwrap();
        registry
            .transition(job.id, JobState::Completed, completed_patch())
            .unwrap();

        // Within retention: result readable.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(registry.get(job.id).unwrap().result.is_some());

        // After retention: evicted.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(registry.get(job.id).is_none());
    }

    #[tokio::test]
    async fn test_terminal_transition_cancels_deadline_timer() {
        // Deadline shorter than retention: completing before the deadline
        // must replace the stuck timer, and the job must survive the original
        // deadline inside its retention window.
        let registry = JobRegistry::new(Duration::from_millis(100), Duration::from_millis(300));
        let job = registry.create(JobKind::Upscale, input());
        registry
            .transition(job.id, JobState::Processing, JobPatch::default())
            .unwrap();
        registry
            .transition(job.id, JobState::Completed, completed_patch())
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        let snapshot = registry.get(job.id).unwrap();
        assert_eq!(snapshot.state, JobState::Completed, "stale timer must not fire");
    }

    #[tokio::test]
    async fn test_note_submission() {
        let registry = registry();
        let job = registry.create(JobKind::Upscale, input());
        registry.note_submission(job.id, "prompt-123");
        assert_eq!(
            registry.get(job.id).unwrap().prompt_id.as_deref(),
            Some("prompt-123")
        );
    }
}
