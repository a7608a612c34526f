// Job Store: the only owner of job records

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jexec_common::types::{ExecutionRequest, ExecutionResult, Job, JobStatus, TransitionError};
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error("job is {status}; the result is only available once it has completed")]
    NotReady { status: JobStatus },
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),
    #[error("job store unavailable: {0}")]
    Backend(String),
}

/// Safe under concurrent use. Transitions only move forward; a transition
/// from the wrong state fails with `InvalidTransition` and changes nothing.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new pending job and return its identifier
    async fn create(&self, request: ExecutionRequest) -> Result<Uuid, StoreError>;

    async fn get(&self, job_id: Uuid) -> Result<Job, StoreError>;

    async fn mark_running(&self, job_id: Uuid) -> Result<Job, StoreError>;

    async fn complete(&self, job_id: Uuid, result: ExecutionResult) -> Result<Job, StoreError>;

    async fn fail(&self, job_id: Uuid, error: String) -> Result<Job, StoreError>;

    /// Remove completed and failed jobs that finished before `cutoff`
    async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Fail running jobs that started before `cutoff`; their worker is gone
    async fn fail_stalled(&self, cutoff: DateTime<Utc>, reason: &str) -> Result<usize, StoreError>;

    /// Ids of jobs still waiting to be started
    async fn pending(&self) -> Result<Vec<Uuid>, StoreError>;

    fn backend(&self) -> &'static str;

    async fn result(&self, job_id: Uuid) -> Result<ExecutionResult, StoreError> {
        let job = self.get(job_id).await?;
        match job.result() {
            Some(result) => Ok(result.clone()),
            None => Err(StoreError::NotReady {
                status: job.status(),
            }),
        }
    }
}

/// Process-local store. Every operation holds the lock for its whole
/// read-check-write, so concurrent transitions on one job serialize.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }

    fn update<F>(&self, job_id: Uuid, apply: F) -> Result<Job, StoreError>
    where
        F: FnOnce(&mut Job) -> Result<(), TransitionError>,
    {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        apply(job)?;
        Ok(job.clone())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, request: ExecutionRequest) -> Result<Uuid, StoreError> {
        let job = Job::new(Uuid::new_v4(), request, Utc::now());
        let job_id = job.id;
        self.jobs.write().insert(job_id, job);
        Ok(job_id)
    }

    async fn get(&self, job_id: Uuid) -> Result<Job, StoreError> {
        self.jobs
            .read()
            .get(&job_id)
            .cloned()
            .ok_or(StoreError::NotFound(job_id))
    }

    async fn mark_running(&self, job_id: Uuid) -> Result<Job, StoreError> {
        self.update(job_id, |job| job.start(Utc::now()))
    }

    async fn complete(&self, job_id: Uuid, result: ExecutionResult) -> Result<Job, StoreError> {
        self.update(job_id, |job| job.complete(result, Utc::now()))
    }

    async fn fail(&self, job_id: Uuid, error: String) -> Result<Job, StoreError> {
        self.update(job_id, |job| job.fail(error, Utc::now()))
    }

    async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut jobs = self.jobs.write();
        let before = jobs.len();
        jobs.retain(|_, job| {
            let expired = job.status().is_finished()
                && job.completed_at().is_some_and(|done| done < cutoff);
            !expired
        });
        Ok(before - jobs.len())
    }

    async fn fail_stalled(&self, cutoff: DateTime<Utc>, reason: &str) -> Result<usize, StoreError> {
        let now = Utc::now();
        let mut jobs = self.jobs.write();
        let mut failed = 0;
        for job in jobs.values_mut() {
            let stalled = job.status() == JobStatus::Running
                && job.started_at().is_some_and(|started| started < cutoff);
            if stalled && job.fail(reason, now).is_ok() {
                failed += 1;
            }
        }
        Ok(failed)
    }

    async fn pending(&self) -> Result<Vec<Uuid>, StoreError> {
        Ok(self
            .jobs
            .read()
            .values()
            .filter(|job| job.status() == JobStatus::Pending)
            .map(|job| job.id)
            .collect())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn sample_result() -> ExecutionResult {
        ExecutionResult {
            stdout: "42\n".to_string(),
            stderr: String::new(),
            exit_code: 0,
            execution_time: 0.3,
        }
    }

    #[tokio::test]
    async fn test_create_starts_pending() {
        let store = InMemoryJobStore::new();
        let before = Utc::now();
        let job_id = store.create(ExecutionRequest::new("int x;")).await.unwrap();

        let job = store.get(job_id).await.unwrap();
        assert_eq!(job.status(), JobStatus::Pending);
        assert!(job.created_at >= before);
        assert!(job.started_at().is_none());
        assert!(job.result().is_none());
        assert!(job.error().is_none());
        assert_eq!(job.request.code, "int x;");
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let store = InMemoryJobStore::new();
        let a = store.create(ExecutionRequest::new("a")).await.unwrap();
        let b = store.create(ExecutionRequest::new("b")).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_full_lifecycle_to_completed() {
        let store = InMemoryJobStore::new();
        let job_id = store.create(ExecutionRequest::new("x")).await.unwrap();

        let running = store.mark_running(job_id).await.unwrap();
        assert_eq!(running.status(), JobStatus::Running);
        assert!(running.started_at().is_some());
        assert!(matches!(
            store.result(job_id).await,
            Err(StoreError::NotReady { status: JobStatus::Running })
        ));

        let done = store.complete(job_id, sample_result()).await.unwrap();
        assert_eq!(done.status(), JobStatus::Completed);
        assert!(done.completed_at().unwrap() >= done.started_at().unwrap());
        assert_eq!(store.result(job_id).await.unwrap(), sample_result());
    }

    #[tokio::test]
    async fn test_failed_job_has_error_but_no_result() {
        let store = InMemoryJobStore::new();
        let job_id = store.create(ExecutionRequest::new("x")).await.unwrap();
        store.mark_running(job_id).await.unwrap();

        let failed = store.fail(job_id, "sandbox crashed".to_string()).await.unwrap();
        assert_eq!(failed.error(), Some("sandbox crashed"));
        assert!(failed.result().is_none());
        assert!(matches!(
            store.result(job_id).await,
            Err(StoreError::NotReady { status: JobStatus::Failed })
        ));
    }

    #[tokio::test]
    async fn test_out_of_order_transitions_are_rejected() {
        let store = InMemoryJobStore::new();
        let job_id = store.create(ExecutionRequest::new("x")).await.unwrap();

        // completing a pending job skips running
        let err = store.complete(job_id, sample_result()).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::InvalidTransition(TransitionError {
                from: JobStatus::Pending,
                to: JobStatus::Completed,
            })
        );
        assert_eq!(store.get(job_id).await.unwrap().status(), JobStatus::Pending);

        store.mark_running(job_id).await.unwrap();
        assert!(matches!(
            store.mark_running(job_id).await,
            Err(StoreError::InvalidTransition(_))
        ));

        store.fail(job_id, "boom".to_string()).await.unwrap();
        assert!(matches!(
            store.complete(job_id, sample_result()).await,
            Err(StoreError::InvalidTransition(_))
        ));
        assert_eq!(store.get(job_id).await.unwrap().status(), JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let store = InMemoryJobStore::new();
        let missing = Uuid::new_v4();
        assert_eq!(store.get(missing).await.unwrap_err(), StoreError::NotFound(missing));
        assert_eq!(store.result(missing).await.unwrap_err(), StoreError::NotFound(missing));
        assert_eq!(store.mark_running(missing).await.unwrap_err(), StoreError::NotFound(missing));
    }

    #[tokio::test]
    async fn test_concurrent_starts_have_one_winner() {
        let store = Arc::new(InMemoryJobStore::new());
        let job_id = store.create(ExecutionRequest::new("x")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.mark_running(job_id).await.is_ok() }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_fail_stalled_only_touches_old_running_jobs() {
        let store = InMemoryJobStore::new();
        let pending = store.create(ExecutionRequest::new("p")).await.unwrap();
        let running = store.create(ExecutionRequest::new("r")).await.unwrap();
        store.mark_running(running).await.unwrap();

        let past = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(store.fail_stalled(past, "stalled").await.unwrap(), 0);
        assert_eq!(store.get(running).await.unwrap().status(), JobStatus::Running);

        let future = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(store.fail_stalled(future, "stalled").await.unwrap(), 1);
        let failed = store.get(running).await.unwrap();
        assert_eq!(failed.status(), JobStatus::Failed);
        assert_eq!(failed.error(), Some("stalled"));
        assert_eq!(store.get(pending).await.unwrap().status(), JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_pending_lists_unstarted_jobs() {
        let store = InMemoryJobStore::new();
        let waiting = store.create(ExecutionRequest::new("w")).await.unwrap();
        let started = store.create(ExecutionRequest::new("s")).await.unwrap();
        store.mark_running(started).await.unwrap();

        assert_eq!(store.pending().await.unwrap(), vec![waiting]);
    }

    #[tokio::test]
    async fn test_purge_removes_only_old_finished_jobs() {
        let store = InMemoryJobStore::new();
        let pending = store.create(ExecutionRequest::new("p")).await.unwrap();
        let finished = store.create(ExecutionRequest::new("f")).await.unwrap();
        store.mark_running(finished).await.unwrap();
        store.complete(finished, sample_result()).await.unwrap();

        let past = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(store.purge_finished_before(past).await.unwrap(), 0);

        let future = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(store.purge_finished_before(future).await.unwrap(), 1);
        assert!(store.get(pending).await.is_ok());
        assert_eq!(store.get(finished).await.unwrap_err(), StoreError::NotFound(finished));
    }
}
