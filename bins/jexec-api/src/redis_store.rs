// Redis-backed Job Store, for deployments that want jobs to survive restarts

use crate::store::{JobStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jexec_common::redis::{self as keys, TransitionOutcome};
use jexec_common::types::{ExecutionRequest, ExecutionResult, Job, JobStatus, TransitionError};
use redis::aio::ConnectionManager;
use tracing::{debug, info};
use uuid::Uuid;

pub struct RedisJobStore {
    conn: ConnectionManager,
    ttl_secs: u64,
}

impl RedisJobStore {
    pub async fn connect(redis_url: &str, ttl_secs: u64) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url).map_err(backend_error)?;
        let conn = ConnectionManager::new(client).await.map_err(backend_error)?;
        info!(ttl_secs, "Connected to Redis job store");
        Ok(Self { conn, ttl_secs })
    }

    async fn jobs(&self) -> Result<Vec<Job>, StoreError> {
        let mut conn = self.conn.clone();
        let ids = keys::job_ids(&mut conn).await.map_err(backend_error)?;
        let mut jobs = Vec::with_capacity(ids.len());
        for job_id in ids {
            // Keys may expire between the scan and the load
            if let Some(job) = keys::load_job(&mut conn, &job_id).await.map_err(backend_error)? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    /// Load, apply `transition` locally, then write back only if nobody
    /// changed the stored status in between.
    async fn transition<F>(&self, job_id: Uuid, transition: F) -> Result<Job, StoreError>
    where
        F: FnOnce(&mut Job) -> Result<(), TransitionError> + Send,
    {
        let mut conn = self.conn.clone();
        let mut job = keys::load_job(&mut conn, &job_id)
            .await
            .map_err(backend_error)?
            .ok_or(StoreError::NotFound(job_id))?;

        let expected = job.status();
        transition(&mut job)?;

        match keys::transition_job(&mut conn, &job, expected, self.ttl_secs)
            .await
            .map_err(backend_error)?
        {
            TransitionOutcome::Applied => Ok(job),
            TransitionOutcome::Missing => Err(StoreError::NotFound(job_id)),
            TransitionOutcome::Conflict => {
                let current = keys::load_job(&mut conn, &job_id)
                    .await
                    .map_err(backend_error)?
                    .ok_or(StoreError::NotFound(job_id))?;
                Err(StoreError::InvalidTransition(TransitionError {
                    from: current.status(),
                    to: job.status(),
                }))
            }
        }
    }
}

fn backend_error(e: redis::RedisError) -> StoreError {
    StoreError::Backend(e.to_string())
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn create(&self, request: ExecutionRequest) -> Result<Uuid, StoreError> {
        let job = Job::new(Uuid::new_v4(), request, Utc::now());
        let mut conn = self.conn.clone();
        keys::insert_job(&mut conn, &job, self.ttl_secs)
            .await
            .map_err(backend_error)?;
        Ok(job.id)
    }

    async fn get(&self, job_id: Uuid) -> Result<Job, StoreError> {
        let mut conn = self.conn.clone();
        keys::load_job(&mut conn, &job_id)
            .await
            .map_err(backend_error)?
            .ok_or(StoreError::NotFound(job_id))
    }

    async fn mark_running(&self, job_id: Uuid) -> Result<Job, StoreError> {
        self.transition(job_id, |job| job.start(Utc::now())).await
    }

    async fn complete(&self, job_id: Uuid, result: ExecutionResult) -> Result<Job, StoreError> {
        self.transition(job_id, |job| job.complete(result, Utc::now()))
            .await
    }

    async fn fail(&self, job_id: Uuid, error: String) -> Result<Job, StoreError> {
        self.transition(job_id, |job| job.fail(error, Utc::now())).await
    }

    /// Keys carry their own expiry
    async fn purge_finished_before(&self, _cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        Ok(0)
    }

    async fn fail_stalled(&self, cutoff: DateTime<Utc>, reason: &str) -> Result<usize, StoreError> {
        let mut failed = 0;
        for job in self.jobs().await? {
            let stalled = job.status() == JobStatus::Running
                && job.started_at().is_some_and(|started| started < cutoff);
            if !stalled {
                continue;
            }
            match self.fail(job.id, reason.to_string()).await {
                Ok(_) => failed += 1,
                // Finished or expired since it was listed
                Err(StoreError::InvalidTransition(_) | StoreError::NotFound(_)) => {
                    debug!(job_id = %job.id, "Stalled job moved on before it was failed");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(failed)
    }

    async fn pending(&self) -> Result<Vec<Uuid>, StoreError> {
        Ok(self
            .jobs()
            .await?
            .into_iter()
            .filter(|job| job.status() == JobStatus::Pending)
            .map(|job| job.id)
            .collect())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
