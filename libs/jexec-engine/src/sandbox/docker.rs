//! Isolated execution in throwaway Docker containers.
//!
//! Each run gets a fresh scratch directory bind-mounted at `/code` and a fresh
//! container with no network, capped memory, CPU and process count, and all
//! capabilities dropped. The container compiles and then runs the program in
//! a single `sh -c` invocation; it is force-removed when the run ends, even
//! if the caller is cancelled.

use super::output::{CappedOutput, MAX_OUTPUT_BYTES};
use super::scratch;
use super::Sandbox;
use crate::language::{shell_join, LanguageConfig, TemplateVars};
use crate::source::Program;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use jexec_common::types::ExecutionResult;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const CONTAINER_WORKDIR: &str = "/code";
const CONTAINER_STDIN_FILE: &str = "/code/input.txt";
const PING_TIMEOUT: Duration = Duration::from_secs(3);
const OOM_EXIT_CODE: i64 = 137;

/// Removes the container when dropped, whatever path the run took
struct ContainerGuard {
    docker: Docker,
    container_id: String,
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let docker = self.docker.clone();
        let container_id = std::mem::take(&mut self.container_id);

        tokio::spawn(async move {
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(e) = docker.remove_container(&container_id, Some(options)).await {
                warn!(container = %container_id, error = %e, "Failed to remove container");
            }
        });
    }
}

pub struct DockerSandbox {
    docker: Docker,
    language: LanguageConfig,
    scratch_root: PathBuf,
}

impl DockerSandbox {
    /// Connect to the local daemon, check that it answers and make sure the
    /// toolchain image is present.
    pub async fn connect(language: LanguageConfig, scratch_root: &Path) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker daemon")?;

        tokio::time::timeout(PING_TIMEOUT, docker.ping())
            .await
            .context("Timed out pinging Docker daemon")?
            .context("Docker daemon did not answer ping")?;

        let sandbox = Self {
            docker,
            language,
            scratch_root: scratch::prepare_root(scratch_root)?,
        };
        sandbox.ensure_image().await?;
        Ok(sandbox)
    }

    pub fn image(&self) -> &str {
        &self.language.image
    }

    /// Pull the toolchain image if it is not cached locally
    async fn ensure_image(&self) -> Result<()> {
        let image = self.image();
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image, "Image cache hit");
            return Ok(());
        }

        warn!(image, "Image cache miss, pulling");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(progress) = stream.next().await {
            progress.with_context(|| format!("Failed to pull Docker image '{}'", image))?;
        }

        info!(image, "Image pulled");
        Ok(())
    }

    async fn execute(
        &self,
        program: &Program,
        stdin: Option<&str>,
        timeout: Duration,
    ) -> Result<ExecutionResult> {
        // The image may have been pruned since startup
        self.ensure_image().await?;

        let workdir = scratch::run_dir(&self.scratch_root)?;
        let source_path = workdir.path().join(self.language.source_file(&program.name));
        tokio::fs::write(&source_path, &program.source)
            .await
            .context("Failed to write source file")?;
        if let Some(input) = stdin {
            tokio::fs::write(workdir.path().join("input.txt"), input)
                .await
                .context("Failed to write stdin file")?;
        }

        let config = Config {
            image: Some(self.language.image.clone()),
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                container_script(&self.language, program, stdin.is_some()),
            ]),
            env: Some(vec!["HOME=/tmp".to_string()]),
            working_dir: Some(CONTAINER_WORKDIR.to_string()),
            user: scratch::owner(workdir.path()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(true),
            host_config: Some(HostConfig {
                memory: Some(self.language.memory_limit_bytes()),
                memory_swap: Some(self.language.memory_limit_bytes()),
                nano_cpus: Some(self.language.nano_cpus()),
                pids_limit: Some(self.language.pids_limit),
                network_mode: Some("none".to_string()),
                binds: Some(vec![format!(
                    "{}:{}:rw",
                    workdir.path().display(),
                    CONTAINER_WORKDIR
                )]),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let container_name = format!("jexec-{}", Uuid::new_v4());
        let container = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: container_name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await
            .context("Failed to create Docker container")?;

        let container_id = container.id.clone();
        let _guard = ContainerGuard {
            docker: self.docker.clone(),
            container_id: container_id.clone(),
        };

        let start_time = Instant::now();
        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start Docker container")?;

        match tokio::time::timeout(timeout, self.collect(&container_id)).await {
            Ok(collected) => {
                let (stdout, mut stderr, exit_code) = collected?;
                if exit_code == OOM_EXIT_CODE {
                    stderr.push_str("\n[Container killed: likely exceeded memory limit]");
                }
                Ok(ExecutionResult {
                    stdout,
                    stderr,
                    exit_code,
                    execution_time: start_time.elapsed().as_secs_f64(),
                })
            }
            Err(_) => {
                warn!(container = %container_id, timeout_secs = timeout.as_secs_f64(), "Execution timed out, killing container");
                if let Err(e) = self
                    .docker
                    .kill_container(&container_id, None::<KillContainerOptions<String>>)
                    .await
                {
                    warn!(container = %container_id, error = %e, "Failed to kill timed-out container");
                }
                Ok(ExecutionResult::timed_out(timeout))
            }
        }
    }

    /// Stream the container's output until it stops, then read its exit code
    async fn collect(&self, container_id: &str) -> Result<(String, String, i64)> {
        let mut stdout = CappedOutput::new(MAX_OUTPUT_BYTES);
        let mut stderr = CappedOutput::new(MAX_OUTPUT_BYTES);

        let logs_options = Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: true,
            ..Default::default()
        });
        let mut logs = self.docker.logs(container_id, logs_options);
        while let Some(chunk) = logs.next().await {
            match chunk.context("Failed to read container logs")? {
                LogOutput::StdOut { message } => stdout.push(&message),
                LogOutput::StdErr { message } => stderr.push(&message),
                _ => {}
            }
        }

        let wait_options = Some(WaitContainerOptions {
            condition: "not-running",
        });
        let mut wait = self.docker.wait_container(container_id, wait_options);
        let exit_code = match wait.next().await {
            Some(Ok(response)) => response.status_code,
            // Non-zero exits are reported as errors by the daemon client
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => return Err(e).context("Failed to wait for container"),
            None => bail!("No wait response from container"),
        };

        Ok((stdout.into_string(), stderr.into_string(), exit_code))
    }
}

/// Shell line run inside the container: compile, then run only if the
/// compile succeeded.
fn container_script(language: &LanguageConfig, program: &Program, has_stdin: bool) -> String {
    let file = language.source_file(&program.name);
    let vars = TemplateVars {
        file: &file,
        name: &program.name,
        dir: CONTAINER_WORKDIR,
    };
    let stdin = if has_stdin { CONTAINER_STDIN_FILE } else { "/dev/null" };

    format!(
        "{} && {} < {}",
        shell_join(&language.compile.render(vars)),
        shell_join(&language.run.render(vars)),
        stdin
    )
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn kind(&self) -> &'static str {
        "docker"
    }

    fn is_isolated(&self) -> bool {
        true
    }

    async fn runtime_available(&self) -> bool {
        matches!(
            tokio::time::timeout(PING_TIMEOUT, self.docker.ping()).await,
            Ok(Ok(_))
        )
    }

    async fn run(&self, program: &Program, stdin: Option<&str>, timeout: Duration) -> ExecutionResult {
        let start_time = Instant::now();
        match self.execute(program, stdin, timeout).await {
            Ok(result) => {
                info!(
                    program = %program.name,
                    exit_code = result.exit_code,
                    duration_secs = result.execution_time,
                    sandbox = "docker",
                    "Execution finished"
                );
                result
            }
            Err(e) => {
                error!(program = %program.name, error = %format!("{:#}", e), "Docker sandbox failure");
                ExecutionResult::infrastructure_failure(format!("{:#}", e), start_time.elapsed())
            }
        }
    }
}
