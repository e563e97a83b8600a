use crate::stage::Stage;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CARGO_TERM_COLOR: &str = "always";
pub const SQLX_VERSION: &str = "0.7.4";
pub const SQLX_FEATURES: &str = "rustls,postgres";
pub const POSTGRES_IMAGE: &str = "postgres:16-bookworm";
pub const POSTGRES_HOST: &str = "postgres";
pub const POSTGRES_PORT: u16 = 5432;
pub const POSTGRES_USER: &str = "postgres";
pub const POSTGRES_PASSWORD: &str = "password";
pub const POSTGRES_DB: &str = "newsletter";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {var}: {reason}")]
    Env { var: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// How the configured stages are scheduled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionPolicy {
    /// One stage at a time in fixed order, stopping at the first failure
    #[default]
    Sequential,
    /// All stages at once against the shared environment
    Concurrent,
}

impl ExecutionPolicy {
    /// Stages run when the configuration does not name any.
    pub fn default_stages(&self) -> Vec<Stage> {
        match self {
            ExecutionPolicy::Sequential => Stage::ALL.to_vec(),
            ExecutionPolicy::Concurrent => vec![Stage::Format, Stage::Lint, Stage::Test],
        }
    }
}

impl fmt::Display for ExecutionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionPolicy::Sequential => write!(f, "sequential"),
            ExecutionPolicy::Concurrent => write!(f, "concurrent"),
        }
    }
}

impl std::str::FromStr for ExecutionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sequential" => Ok(Self::Sequential),
            "concurrent" => Ok(Self::Concurrent),
            other => Err(format!(
                "{other} is not a supported policy. Use either `sequential` or `concurrent`."
            )),
        }
    }
}

/// What a stage keeps from its last command
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Capture {
    #[default]
    Stdout,
    /// Only success or failure; output is left empty
    ExitStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub image: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub name: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            image: POSTGRES_IMAGE.to_string(),
            host: POSTGRES_HOST.to_string(),
            port: POSTGRES_PORT,
            username: POSTGRES_USER.to_string(),
            password: POSTGRES_PASSWORD.to_string(),
            name: POSTGRES_DB.to_string(),
        }
    }
}

impl DatabaseSettings {
    pub fn connection_string(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, self.name
        )
    }
}

/// Everything a run needs. Built once at startup and only read afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Host directory holding the project sources
    pub source_dir: PathBuf,
    /// Where the sources land inside the toolchain container
    pub mount_path: String,
    pub toolchain_image: String,
    /// Persistent cache volume for build artifacts
    pub cache_volume: String,
    pub cache_path: String,
    pub cargo_term_color: String,
    pub sqlx_version: String,
    pub sqlx_features: String,
    pub app_environment: String,
    pub skip_docker: bool,
    pub system_packages: Vec<String>,
    pub init_script: String,
    pub database: DatabaseSettings,
    /// Stages to run; the policy's defaults when unset
    pub stages: Option<Vec<Stage>>,
    pub policy: ExecutionPolicy,
    pub capture: Capture,
    /// Abort running siblings once a concurrent stage fails
    pub cancel_siblings: bool,
    pub service_ready_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("."),
            mount_path: "/hello-rust".to_string(),
            toolchain_image: "rust:slim-bookworm".to_string(),
            cache_volume: "rust-target-001".to_string(),
            cache_path: "/target".to_string(),
            cargo_term_color: CARGO_TERM_COLOR.to_string(),
            sqlx_version: SQLX_VERSION.to_string(),
            sqlx_features: SQLX_FEATURES.to_string(),
            app_environment: "ci".to_string(),
            skip_docker: true,
            system_packages: vec![
                "lld".to_string(),
                "clang".to_string(),
                "postgresql-client".to_string(),
            ],
            init_script: "./scripts/init_db.sh".to_string(),
            database: DatabaseSettings::default(),
            stages: None,
            policy: ExecutionPolicy::default(),
            capture: Capture::default(),
            cancel_siblings: false,
            service_ready_timeout_secs: 30,
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_toml_str(contents: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Defaults, then the optional file, then `PIPELINE_*` environment variables.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> ConfigResult<Self> {
        if let Ok(dir) = std::env::var("PIPELINE_SOURCE_DIR") {
            self.source_dir = PathBuf::from(dir);
        }
        if let Ok(policy) = std::env::var("PIPELINE_POLICY") {
            self.policy = policy.parse().map_err(|reason| ConfigError::Env {
                var: "PIPELINE_POLICY".to_string(),
                reason,
            })?;
        }
        if let Ok(stages) = std::env::var("PIPELINE_STAGES") {
            let stages = stages
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(str::parse)
                .collect::<Result<Vec<Stage>, String>>()
                .map_err(|reason| ConfigError::Env {
                    var: "PIPELINE_STAGES".to_string(),
                    reason,
                })?;
            self.stages = Some(stages);
        }
        if let Ok(password) = std::env::var("PIPELINE_DATABASE_PASSWORD") {
            self.database.password = password;
        }
        Ok(self)
    }

    pub fn with_policy(mut self, policy: ExecutionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_stages(mut self, stages: Vec<Stage>) -> Self {
        self.stages = Some(stages);
        self
    }

    pub fn with_source_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.source_dir = dir.into();
        self
    }

    pub fn with_capture(mut self, capture: Capture) -> Self {
        self.capture = capture;
        self
    }

    pub fn with_cancel_siblings(mut self, cancel: bool) -> Self {
        self.cancel_siblings = cancel;
        self
    }

    /// The stages this run executes, in pipeline order.
    pub fn stages(&self) -> Vec<Stage> {
        let mut stages = self
            .stages
            .clone()
            .unwrap_or_else(|| self.policy.default_stages());
        stages.sort();
        stages
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(stages) = &self.stages {
            if stages.is_empty() {
                return Err(ConfigError::Invalid(
                    "at least one stage must be configured".to_string(),
                ));
            }
            for (i, stage) in stages.iter().enumerate() {
                if stages[..i].contains(stage) {
                    return Err(ConfigError::Invalid(format!(
                        "stage '{stage}' is listed more than once"
                    )));
                }
            }
        }

        for (name, path) in [
            ("mount_path", &self.mount_path),
            ("cache_path", &self.cache_path),
        ] {
            if !path.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be absolute, got '{path}'"
                )));
            }
        }

        if self.toolchain_image.is_empty() || self.database.image.is_empty() {
            return Err(ConfigError::Invalid("images cannot be empty".to_string()));
        }

        if self.database.host.is_empty()
            || self.database.username.is_empty()
            || self.database.password.is_empty()
            || self.database.name.is_empty()
        {
            return Err(ConfigError::Invalid(
                "database host, user, password and name are required".to_string(),
            ));
        }

        if self.service_ready_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "service_ready_timeout_secs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
