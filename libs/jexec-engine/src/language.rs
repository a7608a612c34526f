// Toolchain configuration for the execution language
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::info;

/// A command line with `{file}`, `{name}` and `{dir}` placeholders
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Values substituted into a `CommandTemplate`
#[derive(Debug, Clone, Copy)]
pub struct TemplateVars<'a> {
    pub file: &'a str,
    pub name: &'a str,
    pub dir: &'a str,
}

impl CommandTemplate {
    pub fn new(command: &str, args: &[&str]) -> Self {
        Self {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Program followed by its arguments, placeholders filled in
    pub fn render(&self, vars: TemplateVars<'_>) -> Vec<String> {
        std::iter::once(&self.command)
            .chain(self.args.iter())
            .map(|part| {
                part.replace("{file}", vars.file)
                    .replace("{name}", vars.name)
                    .replace("{dir}", vars.dir)
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageConfig {
    pub name: String,
    pub version: String,
    pub image: String,
    pub file_extension: String,
    pub compile: CommandTemplate,
    pub run: CommandTemplate,
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u32,
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: f32,
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,
}

fn default_memory_limit_mb() -> u32 {
    256
}

fn default_cpu_limit() -> f32 {
    0.5
}

fn default_pids_limit() -> i64 {
    64
}

impl LanguageConfig {
    /// Built-in Java toolchain, used when no configuration file is present
    pub fn java() -> Self {
        Self {
            name: "java".to_string(),
            version: "17".to_string(),
            image: "openjdk:17-slim".to_string(),
            file_extension: "java".to_string(),
            compile: CommandTemplate::new("javac", &["{file}"]),
            run: CommandTemplate::new("java", &["-cp", "{dir}", "{name}"]),
            memory_limit_mb: default_memory_limit_mb(),
            cpu_limit: default_cpu_limit(),
            pids_limit: default_pids_limit(),
        }
    }

    /// File name the program's source is written to
    pub fn source_file(&self, program_name: &str) -> String {
        format!("{}.{}", program_name, self.file_extension)
    }

    pub fn memory_limit_bytes(&self) -> i64 {
        i64::from(self.memory_limit_mb) * 1024 * 1024
    }

    pub fn nano_cpus(&self) -> i64 {
        (f64::from(self.cpu_limit) * 1_000_000_000.0) as i64
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageConfig>,
}

/// Language configuration manager
#[derive(Debug, Clone)]
pub struct LanguageConfigManager {
    configs: HashMap<String, LanguageConfig>,
}

impl LanguageConfigManager {
    /// Load language configurations from languages.json
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let languages_json: LanguagesJson = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        if languages_json.languages.is_empty() {
            bail!("No languages configured in {}", config_path.display());
        }

        let mut configs = HashMap::new();
        for lang in languages_json.languages {
            if lang.pids_limit <= 0 || lang.memory_limit_mb == 0 || lang.cpu_limit <= 0.0 {
                bail!("Language '{}' has non-positive resource limits", lang.name);
            }
            configs.insert(lang.name.clone(), lang);
        }

        Ok(Self { configs })
    }

    /// Load `config_path` if it exists, otherwise use the built-in Java toolchain
    pub fn load_or_builtin(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            return Self::load(config_path);
        }
        info!(path = %config_path.display(), "No language config file, using built-in Java toolchain");
        Ok(Self::builtin())
    }

    pub fn builtin() -> Self {
        let java = LanguageConfig::java();
        Self {
            configs: HashMap::from([(java.name.clone(), java)]),
        }
    }

    /// Get configuration for a specific language
    pub fn get_config(&self, language: &str) -> Result<&LanguageConfig> {
        self.configs
            .get(&language.to_lowercase())
            .ok_or_else(|| anyhow::anyhow!("No configuration found for language: {}", language))
    }

    /// List all configured languages
    pub fn list_languages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Quote `arg` for POSIX `sh`
pub fn shell_quote(arg: &str) -> String {
    let is_plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/' | '=' | ':'));
    if is_plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Join rendered arguments into a single `sh -c` command line
pub fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}
