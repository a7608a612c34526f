// Background job execution
//
// Submitted job ids flow through a bounded channel to a fixed pool of
// workers. Only the worker that dequeues a job drives it forward; the
// reaper steps in only for jobs running far longer than any execution may,
// whose worker is gone. Store writes that hit a backend error are retried.

use crate::store::{JobStore, StoreError};
use chrono::Utc;
use jexec_common::types::RequestLimits;
use jexec_engine::Sandbox;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// How often the reaper looks for expired and stalled jobs
pub const REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Slack on top of the execution timeout before a running job counts as stalled
pub const STALL_GRACE: Duration = Duration::from_secs(300);

const STALLED_JOB_ERROR: &str = "job was interrupted before it finished";

const STORE_ATTEMPTS: u32 = 5;
const STORE_RETRY_BASE: Duration = Duration::from_millis(100);

/// Run a store write, retrying with exponential backoff while the backend
/// is unavailable. Other errors are returned immediately.
async fn with_retry<T, F, Fut>(mut write: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut delay = STORE_RETRY_BASE;
    let mut attempt = 1;
    loop {
        match write().await {
            Err(StoreError::Backend(e)) if attempt < STORE_ATTEMPTS => {
                warn!(attempt, error = %e, "Job store unavailable, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            outcome => return outcome,
        }
    }
}

pub fn spawn_workers(
    count: usize,
    receiver: mpsc::Receiver<Uuid>,
    store: Arc<dyn JobStore>,
    sandbox: Arc<dyn Sandbox>,
    limits: RequestLimits,
) -> Vec<JoinHandle<()>> {
    let receiver = Arc::new(Mutex::new(receiver));

    (0..count)
        .map(|worker_id| {
            let receiver = receiver.clone();
            let store = store.clone();
            let sandbox = sandbox.clone();
            tokio::spawn(async move {
                debug!(worker_id, "Worker started");
                loop {
                    // Hold the lock only while waiting for the next id
                    let next = receiver.lock().await.recv().await;
                    let Some(job_id) = next else {
                        break;
                    };
                    process_job(job_id, store.as_ref(), &sandbox, &limits).await;
                }
                debug!(worker_id, "Worker stopped, queue closed");
            })
        })
        .collect()
}

/// Drive one job from pending to completed or failed
#[instrument(skip_all, fields(job_id = %job_id))]
pub async fn process_job(
    job_id: Uuid,
    store: &dyn JobStore,
    sandbox: &Arc<dyn Sandbox>,
    limits: &RequestLimits,
) {
    let job = match with_retry(|| store.mark_running(job_id)).await {
        Ok(job) => job,
        // Another worker or instance got there first
        Err(StoreError::InvalidTransition(e)) => {
            debug!(error = %e, "Job already taken");
            return;
        }
        Err(e) => {
            // Still pending; a persistent store re-queues it on the next startup
            error!(error = %e, "Could not start job");
            return;
        }
    };

    // A panic inside the sandbox becomes a failed job instead of a dead worker
    let execution = {
        let sandbox = sandbox.clone();
        let limits = *limits;
        tokio::spawn(async move { jexec_engine::execute(sandbox.as_ref(), &job.request, &limits).await })
    };

    let outcome = match execution.await {
        Ok(Ok(result)) => {
            info!(exit_code = result.exit_code, execution_time = result.execution_time, "Job completed");
            with_retry(|| store.complete(job_id, result.clone())).await
        }
        Ok(Err(invalid)) => {
            warn!(error = %invalid, "Job request rejected");
            let message = invalid.to_string();
            with_retry(|| store.fail(job_id, message.clone())).await
        }
        Err(join_error) => {
            error!(error = %join_error, "Job execution aborted");
            let message = format!("execution aborted: {}", join_error);
            with_retry(|| store.fail(job_id, message.clone())).await
        }
    };

    if let Err(e) = outcome {
        error!(error = %e, "Failed to record job outcome");
    }
}

fn cutoff(age: Duration) -> Option<chrono::DateTime<Utc>> {
    Utc::now().checked_sub_signed(chrono::Duration::from_std(age).ok()?)
}

/// Fail jobs running for longer than `stall_after`, then remove finished
/// jobs older than `ttl`
pub async fn reap_once(store: &dyn JobStore, ttl: Duration, stall_after: Duration) {
    if let Some(stalled_before) = cutoff(stall_after) {
        match store.fail_stalled(stalled_before, STALLED_JOB_ERROR).await {
            Ok(0) => {}
            Ok(failed) => warn!(failed, "Failed stalled jobs"),
            Err(e) => warn!(error = %e, "Stalled job sweep failed"),
        }
    }

    if let Some(finished_before) = cutoff(ttl) {
        match store.purge_finished_before(finished_before).await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "Reaped expired jobs"),
            Err(e) => warn!(error = %e, "Job reaper failed"),
        }
    }
}

pub fn spawn_reaper(store: Arc<dyn JobStore>, ttl: Duration, stall_after: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REAP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            reap_once(store.as_ref(), ttl, stall_after).await;
        }
    })
}

/// Queue jobs left pending by an earlier process. Returns how many were queued.
pub async fn requeue_pending(store: &dyn JobStore, queue: &mpsc::Sender<Uuid>) -> Result<usize, StoreError> {
    let pending = with_retry(|| store.pending()).await?;
    let mut queued = 0;
    for job_id in pending {
        if queue.send(job_id).await.is_err() {
            break;
        }
        queued += 1;
    }
    Ok(queued)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryJobStore;
    use async_trait::async_trait;
    use chrono::DateTime;
    use jexec_common::types::{ExecutionRequest, ExecutionResult, Job, JobStatus};
    use jexec_engine::Program;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoSandbox;

    #[async_trait]
    impl Sandbox for EchoSandbox {
        fn kind(&self) -> &'static str {
            "echo"
        }

        fn is_isolated(&self) -> bool {
            true
        }

        async fn runtime_available(&self) -> bool {
            true
        }

        async fn run(&self, program: &Program, stdin: Option<&str>, _timeout: Duration) -> ExecutionResult {
            ExecutionResult {
                stdout: format!("{}:{}", program.name, stdin.unwrap_or("")),
                stderr: String::new(),
                exit_code: 0,
                execution_time: 0.05,
            }
        }
    }

    struct PanickingSandbox;

    #[async_trait]
    impl Sandbox for PanickingSandbox {
        fn kind(&self) -> &'static str {
            "panicking"
        }

        fn is_isolated(&self) -> bool {
            true
        }

        async fn runtime_available(&self) -> bool {
            true
        }

        async fn run(&self, _program: &Program, _stdin: Option<&str>, _timeout: Duration) -> ExecutionResult {
            panic!("sandbox blew up")
        }
    }

    /// In-memory store whose writes report a backend outage a set number of times
    struct FlakyStore {
        inner: InMemoryJobStore,
        outages: AtomicUsize,
    }

    impl FlakyStore {
        fn new(outages: usize) -> Self {
            Self {
                inner: InMemoryJobStore::new(),
                outages: AtomicUsize::new(outages),
            }
        }

        fn outage(&self) -> Result<(), StoreError> {
            let remaining = self
                .outages
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            match remaining {
                Ok(_) => Err(StoreError::Backend("connection reset".to_string())),
                Err(_) => Ok(()),
            }
        }
    }

    #[async_trait]
    impl JobStore for FlakyStore {
        async fn create(&self, request: ExecutionRequest) -> Result<Uuid, StoreError> {
            self.inner.create(request).await
        }

        async fn get(&self, job_id: Uuid) -> Result<Job, StoreError> {
            self.inner.get(job_id).await
        }

        async fn mark_running(&self, job_id: Uuid) -> Result<Job, StoreError> {
            self.outage()?;
            self.inner.mark_running(job_id).await
        }

        async fn complete(&self, job_id: Uuid, result: ExecutionResult) -> Result<Job, StoreError> {
            self.outage()?;
            self.inner.complete(job_id, result).await
        }

        async fn fail(&self, job_id: Uuid, error: String) -> Result<Job, StoreError> {
            self.outage()?;
            self.inner.fail(job_id, error).await
        }

        async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
            self.inner.purge_finished_before(cutoff).await
        }

        async fn fail_stalled(&self, cutoff: DateTime<Utc>, reason: &str) -> Result<usize, StoreError> {
            self.inner.fail_stalled(cutoff, reason).await
        }

        async fn pending(&self) -> Result<Vec<Uuid>, StoreError> {
            self.outage()?;
            self.inner.pending().await
        }

        fn backend(&self) -> &'static str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_process_job_completes() {
        let store = InMemoryJobStore::new();
        let sandbox: Arc<dyn Sandbox> = Arc::new(EchoSandbox);
        let mut request = ExecutionRequest::new("int x = 1;");
        request.stdin = Some("in".to_string());
        let job_id = store.create(request).await.unwrap();

        process_job(job_id, &store, &sandbox, &RequestLimits::default()).await;

        let job = store.get(job_id).await.unwrap();
        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(job.result().unwrap().stdout, "Main:in");
    }

    #[tokio::test]
    async fn test_invalid_request_fails_job() {
        let store = InMemoryJobStore::new();
        let sandbox: Arc<dyn Sandbox> = Arc::new(EchoSandbox);
        let job_id = store.create(ExecutionRequest::new("")).await.unwrap();

        process_job(job_id, &store, &sandbox, &RequestLimits::default()).await;

        let job = store.get(job_id).await.unwrap();
        assert_eq!(job.status(), JobStatus::Failed);
        assert!(job.error().unwrap().contains("empty"));
    }

    #[tokio::test]
    async fn test_sandbox_panic_fails_job() {
        let store = InMemoryJobStore::new();
        let sandbox: Arc<dyn Sandbox> = Arc::new(PanickingSandbox);
        let job_id = store.create(ExecutionRequest::new("int x;")).await.unwrap();

        process_job(job_id, &store, &sandbox, &RequestLimits::default()).await;

        let job = store.get(job_id).await.unwrap();
        assert_eq!(job.status(), JobStatus::Failed);
        assert!(job.error().unwrap().contains("aborted"));
        assert!(matches!(
            store.result(job_id).await,
            Err(StoreError::NotReady { status: JobStatus::Failed })
        ));
    }

    #[tokio::test]
    async fn test_already_started_job_is_left_alone() {
        let store = InMemoryJobStore::new();
        let sandbox: Arc<dyn Sandbox> = Arc::new(EchoSandbox);
        let job_id = store.create(ExecutionRequest::new("int x;")).await.unwrap();
        store.mark_running(job_id).await.unwrap();

        process_job(job_id, &store, &sandbox, &RequestLimits::default()).await;

        assert_eq!(store.get(job_id).await.unwrap().status(), JobStatus::Running);
    }

    #[tokio::test]
    async fn test_pool_drains_queue_then_stops() {
        let store = Arc::new(InMemoryJobStore::new());
        let (sender, receiver) = mpsc::channel(16);
        let workers = spawn_workers(
            3,
            receiver,
            store.clone(),
            Arc::new(EchoSandbox),
            RequestLimits::default(),
        );

        let mut ids = Vec::new();
        for i in 0..10 {
            let job_id = store
                .create(ExecutionRequest::new(format!("int x = {};", i)))
                .await
                .unwrap();
            sender.send(job_id).await.unwrap();
            ids.push(job_id);
        }
        drop(sender);

        for worker in workers {
            worker.await.unwrap();
        }
        for job_id in ids {
            assert_eq!(store.get(job_id).await.unwrap().status(), JobStatus::Completed);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_outage_is_retried() {
        let store = FlakyStore::new(3);
        let sandbox: Arc<dyn Sandbox> = Arc::new(EchoSandbox);
        let job_id = store.create(ExecutionRequest::new("int x;")).await.unwrap();

        process_job(job_id, &store, &sandbox, &RequestLimits::default()).await;

        assert_eq!(store.get(job_id).await.unwrap().status(), JobStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_outage_leaves_job_pending() {
        let store = FlakyStore::new(usize::MAX);
        let sandbox: Arc<dyn Sandbox> = Arc::new(EchoSandbox);
        let job_id = store.create(ExecutionRequest::new("int x;")).await.unwrap();

        process_job(job_id, &store, &sandbox, &RequestLimits::default()).await;

        assert_eq!(store.get(job_id).await.unwrap().status(), JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_reap_once_fails_stalled_jobs() {
        let store = InMemoryJobStore::new();
        let job_id = store.create(ExecutionRequest::new("x")).await.unwrap();
        store.mark_running(job_id).await.unwrap();

        reap_once(&store, Duration::from_secs(3600), Duration::from_secs(3600)).await;
        assert_eq!(store.get(job_id).await.unwrap().status(), JobStatus::Running);

        tokio::time::sleep(Duration::from_millis(20)).await;
        reap_once(&store, Duration::from_secs(3600), Duration::from_millis(1)).await;
        let job = store.get(job_id).await.unwrap();
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.error(), Some(STALLED_JOB_ERROR));
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeue_pending_feeds_the_queue() {
        let store = FlakyStore::new(1);
        let first = store.create(ExecutionRequest::new("a")).await.unwrap();
        let second = store.create(ExecutionRequest::new("b")).await.unwrap();
        let started = store.create(ExecutionRequest::new("c")).await.unwrap();
        store.inner.mark_running(started).await.unwrap();

        let (sender, mut receiver) = mpsc::channel(8);
        assert_eq!(requeue_pending(&store, &sender).await.unwrap(), 2);
        drop(sender);

        let mut queued = Vec::new();
        while let Some(job_id) = receiver.recv().await {
            queued.push(job_id);
        }
        queued.sort();
        let mut expected = vec![first, second];
        expected.sort();
        assert_eq!(queued, expected);
    }

    #[tokio::test]
    async fn test_reap_once_respects_ttl() {
        let store = InMemoryJobStore::new();
        let job_id = store.create(ExecutionRequest::new("x")).await.unwrap();
        store.mark_running(job_id).await.unwrap();
        store
            .complete(
                job_id,
                ExecutionResult {
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: 0,
                    execution_time: 0.0,
                },
            )
            .await
            .unwrap();

        reap_once(&store, Duration::from_secs(3600), Duration::from_secs(3600)).await;
        assert_eq!(store.len(), 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        reap_once(&store, Duration::from_millis(1), Duration::from_secs(3600)).await;
        assert!(store.is_empty());
    }
}
