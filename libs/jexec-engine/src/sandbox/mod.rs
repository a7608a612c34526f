//! Sandbox Runner
//!
//! A `Sandbox` compiles and runs one prepared program under a timeout and
//! reports what happened. Two implementations exist: `DockerSandbox` runs
//! each program in a throwaway, network-less, resource-capped container and
//! `LocalSandbox` runs it on the host. Which one serves a deployment is
//! decided once at startup by `select_sandbox`.

pub mod docker;
pub mod local;
pub mod output;
pub mod scratch;

use crate::language::LanguageConfig;
use crate::source::Program;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use jexec_common::config::SandboxMode;
use jexec_common::types::ExecutionResult;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub use docker::DockerSandbox;
pub use local::LocalSandbox;

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Short name reported by the health endpoint
    fn kind(&self) -> &'static str;

    /// Whether submitted code is isolated from the host
    fn is_isolated(&self) -> bool;

    /// Whether the isolation runtime currently answers
    async fn runtime_available(&self) -> bool;

    /// Compile and run `program`. Never fails: infrastructure problems come
    /// back as a result with a negative exit code and a diagnostic on stderr.
    async fn run(&self, program: &Program, stdin: Option<&str>, timeout: Duration) -> ExecutionResult;
}

/// Pick the sandbox for this deployment.
///
/// `auto` prefers Docker and only degrades to host execution when
/// `allow_unisolated` is set; otherwise startup fails.
pub async fn select_sandbox(
    mode: SandboxMode,
    allow_unisolated: bool,
    language: LanguageConfig,
    scratch_root: &Path,
) -> Result<Arc<dyn Sandbox>> {
    match mode {
        SandboxMode::Docker => {
            let sandbox = DockerSandbox::connect(language, scratch_root)
                .await
                .context("SANDBOX_MODE=docker but Docker is unavailable")?;
            info!(image = %sandbox.image(), "Using Docker sandbox");
            Ok(Arc::new(sandbox))
        }
        SandboxMode::Local => {
            warn!("SANDBOX_MODE=local: submitted code runs on the host WITHOUT isolation");
            Ok(Arc::new(LocalSandbox::new(language, scratch_root)?))
        }
        SandboxMode::Auto => match DockerSandbox::connect(language.clone(), scratch_root).await {
            Ok(sandbox) => {
                info!(image = %sandbox.image(), "Using Docker sandbox");
                Ok(Arc::new(sandbox))
            }
            Err(e) if allow_unisolated => {
                warn!(
                    error = %format!("{:#}", e),
                    "Docker unavailable, falling back to host execution WITHOUT isolation"
                );
                Ok(Arc::new(LocalSandbox::new(language, scratch_root)?))
            }
            Err(e) => {
                bail!(
                    "Docker is unavailable and ALLOW_UNISOLATED is not set; refusing to run code on the host: {:#}",
                    e
                )
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_mode_is_not_isolated() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = select_sandbox(SandboxMode::Local, false, LanguageConfig::java(), root.path())
            .await
            .unwrap();
        assert_eq!(sandbox.kind(), "local");
        assert!(!sandbox.is_isolated());
        assert!(!sandbox.runtime_available().await);
    }

    #[tokio::test]
    #[ignore] // Requires that no Docker daemon is reachable
    async fn test_auto_without_docker_refuses_unless_allowed() {
        let root = tempfile::tempdir().unwrap();

        let refused = select_sandbox(SandboxMode::Auto, false, LanguageConfig::java(), root.path()).await;
        let message = format!("{:#}", refused.err().unwrap());
        assert!(message.contains("ALLOW_UNISOLATED"));

        let fallback = select_sandbox(SandboxMode::Auto, true, LanguageConfig::java(), root.path())
            .await
            .unwrap();
        assert_eq!(fallback.kind(), "local");
    }

    #[tokio::test]
    #[ignore] // Requires Docker daemon
    async fn test_auto_prefers_docker() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = select_sandbox(SandboxMode::Auto, true, LanguageConfig::java(), root.path())
            .await
            .unwrap();
        assert_eq!(sandbox.kind(), "docker");
        assert!(sandbox.is_isolated());
        assert!(sandbox.runtime_available().await);
    }
}
