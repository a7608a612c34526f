//! Fallback execution directly on the host.
//!
//! Used only when no isolation runtime is available. Submitted code runs with
//! the service's own privileges: there is no network, memory or process-count
//! restriction beyond the timeout. Compilation happens in a per-call temporary
//! directory that is reclaimed when the call returns, whatever the outcome.
//!
//! Compile and run share one deadline. Each step runs in its own process
//! group, and the whole group is killed once the step's main process exits
//! or the deadline passes, so nothing the program spawned outlives the call.

use super::output::{drain_capped, MAX_OUTPUT_BYTES};
use super::{scratch, Sandbox};
use crate::language::{LanguageConfig, TemplateVars};
use crate::source::Program;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use jexec_common::types::ExecutionResult;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

pub struct LocalSandbox {
    language: LanguageConfig,
    scratch_root: PathBuf,
}

/// Captured output of one host process
#[derive(Debug)]
struct ProcessOutput {
    stdout: String,
    stderr: String,
    exit_code: i64,
}

impl LocalSandbox {
    pub fn new(language: LanguageConfig, scratch_root: &Path) -> Result<Self> {
        let scratch_root = scratch::prepare_root(scratch_root)?;
        Ok(Self {
            language,
            scratch_root,
        })
    }

    async fn execute(
        &self,
        program: &Program,
        stdin: Option<&str>,
        timeout: Duration,
    ) -> Result<ExecutionResult> {
        let workspace = scratch::run_dir(&self.scratch_root)?;

        let file = self.language.source_file(&program.name);
        tokio::fs::write(workspace.path().join(&file), &program.source)
            .await
            .context("Failed to write source file")?;

        let dir = workspace.path().to_string_lossy().into_owned();
        let vars = TemplateVars {
            file: &file,
            name: &program.name,
            dir: &dir,
        };

        let start_time = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;

        let compile_cmd = self.language.compile.render(vars);
        let compiled = match run_process(&compile_cmd, workspace.path(), None, deadline).await? {
            Some(output) => output,
            None => {
                warn!(program = %program.name, timeout_secs = timeout.as_secs_f64(), "Compilation timed out");
                return Ok(ExecutionResult::timed_out(timeout));
            }
        };

        if compiled.exit_code != 0 {
            debug!(program = %program.name, exit_code = compiled.exit_code, "Compilation failed");
            // Some compilers report diagnostics on stdout
            let diagnostics = if compiled.stderr.is_empty() {
                compiled.stdout
            } else {
                compiled.stderr
            };
            return Ok(ExecutionResult {
                stdout: String::new(),
                stderr: diagnostics,
                exit_code: compiled.exit_code,
                execution_time: start_time.elapsed().as_secs_f64(),
            });
        }

        let run_cmd = self.language.run.render(vars);
        match run_process(&run_cmd, workspace.path(), stdin, deadline).await? {
            Some(output) => Ok(ExecutionResult {
                stdout: output.stdout,
                stderr: output.stderr,
                exit_code: output.exit_code,
                execution_time: start_time.elapsed().as_secs_f64(),
            }),
            None => {
                warn!(program = %program.name, timeout_secs = timeout.as_secs_f64(), "Execution timed out");
                Ok(ExecutionResult::timed_out(timeout))
            }
        }
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn kind(&self) -> &'static str {
        "local"
    }

    fn is_isolated(&self) -> bool {
        false
    }

    async fn runtime_available(&self) -> bool {
        false
    }

    async fn run(&self, program: &Program, stdin: Option<&str>, timeout: Duration) -> ExecutionResult {
        let start_time = Instant::now();
        match self.execute(program, stdin, timeout).await {
            Ok(result) => {
                info!(
                    program = %program.name,
                    exit_code = result.exit_code,
                    duration_secs = result.execution_time,
                    sandbox = "local",
                    "Execution finished"
                );
                result
            }
            Err(e) => {
                error!(program = %program.name, error = %format!("{:#}", e), "Local sandbox failure");
                ExecutionResult::infrastructure_failure(format!("{:#}", e), start_time.elapsed())
            }
        }
    }
}

/// Kills a process group when dropped, unless already killed
struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_group(pgid);
        }
    }
}

#[cfg(unix)]
fn kill_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: killpg only sends a signal; ESRCH for an empty group is fine
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Run `argv` in `cwd`, feeding `stdin` if given. Returns `None` if the
/// process was still running at `deadline`; its process group is killed.
async fn run_process(
    argv: &[String],
    cwd: &Path,
    stdin: Option<&str>,
    deadline: tokio::time::Instant,
) -> Result<Option<ProcessOutput>> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("Toolchain command is empty"))?;

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(cwd)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command
        .spawn()
        .with_context(|| format!("Failed to spawn '{}'", program))?;
    let mut group = ProcessGroup { pgid: child.id() };

    let stdin_pipe = child.stdin.take();
    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let input = stdin.unwrap_or_default().to_owned();

    let work = async move {
        let feed = async move {
            if let Some(mut pipe) = stdin_pipe {
                // The program may exit without reading its input
                let _ = pipe.write_all(input.as_bytes()).await;
            }
        };
        let reap = async {
            let status = child.wait().await;
            // Leftover descendants would keep the output pipes open
            group.kill();
            status
        };
        let (_, stdout, stderr, status) = tokio::join!(
            feed,
            drain_capped(stdout_pipe, MAX_OUTPUT_BYTES),
            drain_capped(stderr_pipe, MAX_OUTPUT_BYTES),
            reap,
        );

        Ok::<ProcessOutput, anyhow::Error>(ProcessOutput {
            stdout: stdout.context("Failed to read stdout")?.into_string(),
            stderr: stderr.context("Failed to read stderr")?.into_string(),
            exit_code: exit_code_of(status.context("Failed to wait for process")?),
        })
    };

    match tokio::time::timeout_at(deadline, work).await {
        Ok(output) => output.map(Some),
        Err(_) => Ok(None),
    }
}

/// Shell convention: 128 + signal number for signal deaths
fn exit_code_of(status: ExitStatus) -> i64 {
    if let Some(code) = status.code() {
        return i64::from(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + i64::from(signal);
        }
    }
    jexec_common::types::INFRASTRUCTURE_EXIT_CODE
}
