use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Exit code reported when a program is killed for exceeding its time limit
pub const TIMEOUT_EXIT_CODE: i64 = 124;

/// Exit code reported when the sandbox itself failed, not the submitted program
pub const INFRASTRUCTURE_EXIT_CODE: i64 = -1;

/// Code submitted for execution, exactly as the caller sent it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    /// Timeout override in whole seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// Server-enforced bounds applied to every inbound request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestLimits {
    pub max_code_chars: usize,
    pub max_stdin_chars: usize,
    pub max_timeout_secs: u64,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_code_chars: 50_000,
            max_stdin_chars: 1_000,
            max_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("code must not be empty")]
    EmptyCode,
    #[error("code is {len} characters, maximum is {max}")]
    CodeTooLarge { len: usize, max: usize },
    #[error("stdin is {len} characters, maximum is {max}")]
    StdinTooLarge { len: usize, max: usize },
    #[error("timeout must be between 1 and {max} seconds, got {requested}")]
    TimeoutOutOfRange { requested: u64, max: u64 },
    #[error("'{0}' is not a valid program name")]
    InvalidProgramName(String),
    #[error("malformed request body: {0}")]
    MalformedBody(String),
    #[error("request body too large")]
    BodyTooLarge,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            stdin: None,
            class_name: None,
            timeout: None,
        }
    }

    /// Check size and timeout bounds, returning the timeout the run should use.
    pub fn validate(&self, limits: &RequestLimits) -> Result<Duration, ValidationError> {
        if self.code.trim().is_empty() {
            return Err(ValidationError::EmptyCode);
        }

        let code_len = self.code.chars().count();
        if code_len > limits.max_code_chars {
            return Err(ValidationError::CodeTooLarge {
                len: code_len,
                max: limits.max_code_chars,
            });
        }

        if let Some(stdin) = &self.stdin {
            let stdin_len = stdin.chars().count();
            if stdin_len > limits.max_stdin_chars {
                return Err(ValidationError::StdinTooLarge {
                    len: stdin_len,
                    max: limits.max_stdin_chars,
                });
            }
        }

        let timeout_secs = self.timeout.unwrap_or(limits.max_timeout_secs);
        if timeout_secs == 0 || timeout_secs > limits.max_timeout_secs {
            return Err(ValidationError::TimeoutOutOfRange {
                requested: timeout_secs,
                max: limits.max_timeout_secs,
            });
        }

        Ok(Duration::from_secs(timeout_secs))
    }
}

/// Captured outcome of one compile-and-run attempt.
///
/// Every field is always populated, whatever path produced the result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    /// Wall-clock seconds spanning compile and run
    pub execution_time: f64,
}

impl ExecutionResult {
    pub fn timed_out(timeout: Duration) -> Self {
        Self {
            stdout: String::new(),
            stderr: "Execution timed out".to_string(),
            exit_code: TIMEOUT_EXIT_CODE,
            execution_time: timeout.as_secs_f64(),
        }
    }

    pub fn infrastructure_failure(message: impl fmt::Display, elapsed: Duration) -> Self {
        Self {
            stdout: String::new(),
            stderr: format!("Sandbox error: {}", message),
            exit_code: INFRASTRUCTURE_EXIT_CODE,
            execution_time: elapsed.as_secs_f64(),
        }
    }

}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cannot move job from {from} to {to}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Lifecycle state of a job. The result exists only once completed and the
/// error only once failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running {
        started_at: DateTime<Utc>,
    },
    Completed {
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        result: ExecutionResult,
    },
    Failed {
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub request: ExecutionRequest,
    pub state: JobState,
}

impl Job {
    pub fn new(id: Uuid, request: ExecutionRequest, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            created_at,
            request,
            state: JobState::Pending,
        }
    }

    pub fn status(&self) -> JobStatus {
        match self.state {
            JobState::Pending => JobStatus::Pending,
            JobState::Running { .. } => JobStatus::Running,
            JobState::Completed { .. } => JobStatus::Completed,
            JobState::Failed { .. } => JobStatus::Failed,
        }
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            JobState::Pending => None,
            JobState::Running { started_at }
            | JobState::Completed { started_at, .. }
            | JobState::Failed { started_at, .. } => Some(started_at),
        }
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            JobState::Completed { completed_at, .. } | JobState::Failed { completed_at, .. } => {
                Some(completed_at)
            }
            _ => None,
        }
    }

    pub fn result(&self) -> Option<&ExecutionResult> {
        match &self.state {
            JobState::Completed { result, .. } => Some(result),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.state {
            JobState::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        match self.state {
            JobState::Pending => {
                self.state = JobState::Running { started_at: now };
                Ok(())
            }
            _ => Err(self.refuse(JobStatus::Running)),
        }
    }

    pub fn complete(
        &mut self,
        result: ExecutionResult,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        match self.state {
            JobState::Running { started_at } => {
                self.state = JobState::Completed {
                    started_at,
                    completed_at: now,
                    result,
                };
                Ok(())
            }
            _ => Err(self.refuse(JobStatus::Completed)),
        }
    }

    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> Result<(), TransitionError> {
        match self.state {
            JobState::Running { started_at } => {
                self.state = JobState::Failed {
                    started_at,
                    completed_at: now,
                    error: error.into(),
                };
                Ok(())
            }
            _ => Err(self.refuse(JobStatus::Failed)),
        }
    }

    fn refuse(&self, to: JobStatus) -> TransitionError {
        TransitionError {
            from: self.status(),
            to,
        }
    }
}

/// Body of `GET /status/{job_id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl From<&Job> for JobStatusView {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status(),
            created_at: job.created_at,
            started_at: job.started_at(),
            completed_at: job.completed_at(),
            error: job.error().map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub docker_available: bool,
    pub sandbox: String,
    pub timestamp: DateTime<Utc>,
}

/// Uniform body for every rejected request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}
