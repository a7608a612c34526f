use crate::types::{Job, JobStatus};
use redis::aio::ConnectionManager;
use redis::{RedisResult, Script};
use uuid::Uuid;

/// Redis layout for persisted jobs.
///
/// Each job is a hash under `jexec:job:{id}` holding the status string (so
/// transitions can compare-and-set on it) and the full job as JSON.

pub const JOB_PREFIX: &str = "jexec:job";
pub const STATUS_FIELD: &str = "status";
pub const JOB_FIELD: &str = "job";

/// Returns -1 if the key is missing, 0 if the stored status differs from
/// ARGV[1], 1 after writing the new status and job body.
const TRANSITION_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'status')
if not current then
  return -1
end
if current ~= ARGV[1] then
  return 0
end
redis.call('HSET', KEYS[1], 'status', ARGV[2], 'job', ARGV[3])
redis.call('EXPIRE', KEYS[1], ARGV[4])
return 1
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    Missing,
    /// Someone else moved the job first
    Conflict,
}

/// Generate the key for a job
pub fn job_key(job_id: &Uuid) -> String {
    format!("{}:{}", JOB_PREFIX, job_id)
}

/// Job id encoded in a key produced by `job_key`
pub fn parse_job_key(key: &str) -> Option<Uuid> {
    key.strip_prefix(JOB_PREFIX)?.strip_prefix(':')?.parse().ok()
}

/// Ids of every stored job, walked with `SCAN` so the server is never blocked
pub async fn job_ids(conn: &mut ConnectionManager) -> RedisResult<Vec<Uuid>> {
    let pattern = format!("{}:*", JOB_PREFIX);
    let mut cursor: u64 = 0;
    let mut ids = Vec::new();
    loop {
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(&pattern)
            .arg("COUNT")
            .arg(100)
            .query_async(conn)
            .await?;
        ids.extend(keys.iter().filter_map(|key| parse_job_key(key)));
        if next == 0 {
            return Ok(ids);
        }
        cursor = next;
    }
}

/// Store a freshly created job with a TTL
pub async fn insert_job(conn: &mut ConnectionManager, job: &Job, ttl_secs: u64) -> RedisResult<()> {
    let key = job_key(&job.id);
    let payload = encode(job)?;

    redis::pipe()
        .atomic()
        .cmd("HSET")
        .arg(&key)
        .arg(STATUS_FIELD)
        .arg(job.status().as_str())
        .arg(JOB_FIELD)
        .arg(payload)
        .ignore()
        .cmd("EXPIRE")
        .arg(&key)
        .arg(ttl_secs)
        .ignore()
        .query_async::<_, ()>(conn)
        .await
}

/// Fetch a job, `None` if unknown or expired
pub async fn load_job(conn: &mut ConnectionManager, job_id: &Uuid) -> RedisResult<Option<Job>> {
    let payload: Option<String> = redis::cmd("HGET")
        .arg(job_key(job_id))
        .arg(JOB_FIELD)
        .query_async(conn)
        .await?;

    match payload {
        Some(data) => {
            let job: Job = serde_json::from_str(&data).map_err(|e| {
                redis::RedisError::from((
                    redis::ErrorKind::TypeError,
                    "deserialization error",
                    e.to_string(),
                ))
            })?;
            Ok(Some(job))
        }
        None => Ok(None),
    }
}

/// Replace the stored job with `job` only if its stored status is still `expected`
pub async fn transition_job(
    conn: &mut ConnectionManager,
    job: &Job,
    expected: JobStatus,
    ttl_secs: u64,
) -> RedisResult<TransitionOutcome> {
    let payload = encode(job)?;
    let outcome: i64 = Script::new(TRANSITION_SCRIPT)
        .key(job_key(&job.id))
        .arg(expected.as_str())
        .arg(job.status().as_str())
        .arg(payload)
        .arg(ttl_secs)
        .invoke_async(conn)
        .await?;

    Ok(match outcome {
        1 => TransitionOutcome::Applied,
        0 => TransitionOutcome::Conflict,
        _ => TransitionOutcome::Missing,
    })
}

fn encode(job: &Job) -> RedisResult<String> {
    serde_json::to_string(job).map_err(|e| {
        redis::RedisError::from((redis::ErrorKind::TypeError, "serialization error", e.to_string()))
    })
}
