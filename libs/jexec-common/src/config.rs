// Service configuration, sourced from the environment

use crate::types::RequestLimits;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxMode {
    /// Probe for Docker and fall back to local execution only if permitted
    Auto,
    Docker,
    Local,
}

impl FromStr for SandboxMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(SandboxMode::Auto),
            "docker" => Ok(SandboxMode::Docker),
            "local" => Ok(SandboxMode::Local),
            other => Err(format!("expected auto, docker or local, got '{}'", other)),
        }
    }
}

impl fmt::Display for SandboxMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SandboxMode::Auto => "auto",
            SandboxMode::Docker => "docker",
            SandboxMode::Local => "local",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} has invalid value '{value}': {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Clone)]
pub struct ServiceConfig {
    pub bind_addr: SocketAddr,
    pub api_secret: String,
    pub limits: RequestLimits,
    pub scratch_dir: PathBuf,
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub job_ttl_secs: u64,
    pub sandbox_mode: SandboxMode,
    pub allow_unisolated: bool,
    pub redis_url: Option<String>,
    pub language: String,
    pub language_config: PathBuf,
}

// Keeps the secret out of logs
impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("bind_addr", &self.bind_addr)
            .field("api_secret", &"<redacted>")
            .field("limits", &self.limits)
            .field("scratch_dir", &self.scratch_dir)
            .field("worker_count", &self.worker_count)
            .field("queue_capacity", &self.queue_capacity)
            .field("job_ttl_secs", &self.job_ttl_secs)
            .field("sandbox_mode", &self.sandbox_mode)
            .field("allow_unisolated", &self.allow_unisolated)
            .field("redis_url", &self.redis_url)
            .field("language", &self.language)
            .field("language_config", &self.language_config)
            .finish()
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset and empty values take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let api_secret = get("API_SECRET").ok_or(ConfigError::Missing("API_SECRET"))?;

        let limits = RequestLimits {
            max_code_chars: parse_or(&get, "MAX_CODE_SIZE", 50_000)?,
            max_stdin_chars: parse_or(&get, "MAX_STDIN_SIZE", 1_000)?,
            max_timeout_secs: parse_or(&get, "MAX_EXECUTION_TIME", 5)?,
        };
        if limits.max_timeout_secs == 0 {
            return Err(invalid("MAX_EXECUTION_TIME", "0", "must be at least 1"));
        }

        let worker_count: usize = parse_or(&get, "WORKER_COUNT", 4)?;
        if worker_count == 0 {
            return Err(invalid("WORKER_COUNT", "0", "must be at least 1"));
        }
        let queue_capacity: usize = parse_or(&get, "QUEUE_CAPACITY", 64)?;
        if queue_capacity == 0 {
            return Err(invalid("QUEUE_CAPACITY", "0", "must be at least 1"));
        }

        Ok(Self {
            bind_addr: parse_or(&get, "BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8081)))?,
            api_secret,
            limits,
            scratch_dir: get("SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("temp")),
            worker_count,
            queue_capacity,
            job_ttl_secs: parse_or(&get, "JOB_TTL_SECS", 3600)?,
            sandbox_mode: parse_or(&get, "SANDBOX_MODE", SandboxMode::Auto)?,
            allow_unisolated: parse_bool_or(&get, "ALLOW_UNISOLATED", false)?,
            redis_url: get("REDIS_URL"),
            language: get("LANGUAGE").unwrap_or_else(|| "java".to_string()),
            language_config: get("LANGUAGE_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("config/languages.json")),
        })
    }
}

fn parse_or<T, G>(get: &G, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(name, &raw, e.to_string())),
        None => Ok(default),
    }
}

fn parse_bool_or<G>(get: &G, name: &'static str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(raw) => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(invalid(name, &raw, "expected true or false")),
        },
        None => Ok(default),
    }
}

fn invalid(name: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: value.to_string(),
        reason: reason.into(),
    }
}
