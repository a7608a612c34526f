//! Request execution: validate, prepare the program, run it in the sandbox.
//!
//! Shared by the synchronous run endpoint and the job workers so both apply
//! exactly the same checks. Source code and stdin are never logged, only
//! their sizes.

use crate::sandbox::Sandbox;
use crate::source;
use jexec_common::types::{ExecutionRequest, ExecutionResult, RequestLimits, ValidationError};
use tracing::{debug, info};

pub async fn execute(
    sandbox: &dyn Sandbox,
    request: &ExecutionRequest,
    limits: &RequestLimits,
) -> Result<ExecutionResult, ValidationError> {
    let timeout = request.validate(limits)?;
    let program = source::prepare(request)?;

    debug!(
        program = %program.name,
        code_chars = request.code.chars().count(),
        stdin_chars = request.stdin.as_deref().map_or(0, |s| s.chars().count()),
        "Prepared program"
    );

    let result = sandbox
        .run(&program, request.stdin.as_deref(), timeout)
        .await;

    info!(
        program = %program.name,
        sandbox = sandbox.kind(),
        timeout_secs = timeout.as_secs(),
        exit_code = result.exit_code,
        execution_time = result.execution_time,
        "Request executed"
    );

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Program;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Records what it was asked to run and echoes it back
    #[derive(Default)]
    struct RecordingSandbox {
        calls: Mutex<Vec<(Program, Option<String>, Duration)>>,
    }

    #[async_trait]
    impl Sandbox for RecordingSandbox {
        fn kind(&self) -> &'static str {
            "recording"
        }

        fn is_isolated(&self) -> bool {
            true
        }

        async fn runtime_available(&self) -> bool {
            true
        }

        async fn run(&self, program: &Program, stdin: Option<&str>, timeout: Duration) -> ExecutionResult {
            self.calls
                .lock()
                .push((program.clone(), stdin.map(str::to_string), timeout));
            ExecutionResult {
                stdout: format!("ran {}\n", program.name),
                stderr: String::new(),
                exit_code: 0,
                execution_time: 0.01,
            }
        }
    }

    #[tokio::test]
    async fn test_execute_uses_max_timeout_by_default() {
        let sandbox = RecordingSandbox::default();
        let request = ExecutionRequest::new("System.out.println(1);");

        let result = execute(&sandbox, &request, &RequestLimits::default()).await.unwrap();

        assert_eq!(result.stdout, "ran Main\n");
        let calls = sandbox.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].2, Duration::from_secs(5));
        assert!(calls[0].0.source.starts_with("public class Main"));
    }

    #[tokio::test]
    async fn test_execute_passes_stdin_and_timeout() {
        let sandbox = RecordingSandbox::default();
        let mut request = ExecutionRequest::new("public class Echo { public static void main(String[] a) {} }");
        request.stdin = Some("42\n".to_string());
        request.timeout = Some(2);

        let result = execute(&sandbox, &request, &RequestLimits::default()).await.unwrap();

        assert_eq!(result.stdout, "ran Echo\n");
        let calls = sandbox.calls.lock();
        assert_eq!(calls[0].1.as_deref(), Some("42\n"));
        assert_eq!(calls[0].2, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_invalid_request_never_reaches_sandbox() {
        let sandbox = RecordingSandbox::default();
        let limits = RequestLimits::default();

        let empty = ExecutionRequest::new("   ");
        assert_eq!(
            execute(&sandbox, &empty, &limits).await.unwrap_err(),
            ValidationError::EmptyCode
        );

        let mut slow = ExecutionRequest::new("int x = 1;");
        slow.timeout = Some(60);
        assert!(matches!(
            execute(&sandbox, &slow, &limits).await.unwrap_err(),
            ValidationError::TimeoutOutOfRange { requested: 60, max: 5 }
        ));

        let mut bad_name = ExecutionRequest::new("int x = 1;");
        bad_name.class_name = Some("A;B".to_string());
        assert!(matches!(
            execute(&sandbox, &bad_name, &limits).await.unwrap_err(),
            ValidationError::InvalidProgramName(_)
        ));

        assert!(sandbox.calls.lock().is_empty());
    }
}
