//! Stage runners.
//!
//! Each stage derives its own container from the shared environment, so
//! stages never observe each other's layers.

use crate::config::Capture;
use clap::ValueEnum;
use engine::{Container, Engine, EngineError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use tracing::{error, info};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Format,
    Lint,
    Test,
    Coverage,
}

impl Stage {
    /// Every stage in pipeline order
    pub const ALL: [Stage; 4] = [Stage::Format, Stage::Lint, Stage::Test, Stage::Coverage];

    pub fn label(&self) -> &'static str {
        match self {
            Stage::Format => "format",
            Stage::Lint => "lint",
            Stage::Test => "test",
            Stage::Coverage => "coverage",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Stage::Format => "rustfmt in check-only mode",
            Stage::Lint => "clippy with warnings as errors, offline query metadata",
            Stage::Test => "verify offline query metadata against the database, then cargo test",
            Stage::Coverage => "cargo-llvm-cov across all features and workspace members",
        }
    }

    /// Layers this stage appends to the shared environment.
    pub fn extend(&self, env: &Container) -> Container {
        match self {
            Stage::Format => env
                .with_exec(["rustup", "component", "add", "rustfmt"])
                .with_exec(["cargo", "fmt", "--check"]),
            Stage::Lint => env
                .with_env_variable("SQLX_OFFLINE", "true")
                .with_exec(["rustup", "component", "add", "clippy"])
                .with_exec(["cargo", "clippy", "--", "-D", "warnings"]),
            Stage::Test => env
                .with_exec(["cargo", "sqlx", "prepare", "--workspace", "--check"])
                .with_exec(["cargo", "test"]),
            Stage::Coverage => env
                .with_exec(["cargo", "install", "cargo-llvm-cov", "--locked"])
                .with_exec(["cargo", "llvm-cov", "--all-features", "--workspace"]),
        }
    }

    /// Evaluate this stage on top of `env`.
    pub async fn run(&self, engine: &dyn Engine, env: &Container, capture: Capture) -> StageResult {
        let container = self.extend(env);
        let started = Instant::now();
        info!(stage = %self, "Stage started");

        let outcome = match capture {
            Capture::Stdout => engine.stdout(&container).await,
            Capture::ExitStatus => engine.evaluate(&container).await.map(|_| String::new()),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(output) => {
                info!(stage = %self, duration_ms, "Stage passed");
                StageResult::passed(*self, output, duration_ms)
            }
            Err(e) => {
                error!(stage = %self, duration_ms, "Stage failed: {}", e);
                StageResult::failed(*self, e, duration_ms)
            }
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        Stage::ALL
            .into_iter()
            .find(|stage| stage.label() == wanted)
            .ok_or_else(|| {
                format!("{s} is not a stage. Use one of `format`, `lint`, `test`, `coverage`.")
            })
    }
}

/// Outcome of one stage. The error is kept as text once the run is over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: Stage,
    pub output: String,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl StageResult {
    pub fn passed(stage: Stage, output: String, duration_ms: u64) -> Self {
        Self {
            stage,
            output,
            error: None,
            duration_ms,
        }
    }

    pub fn failed(stage: Stage, error: EngineError, duration_ms: u64) -> Self {
        // The tool's own report: rustfmt diffs and test failures go to stdout
        let output = match &error {
            EngineError::ExecFailed { stdout, stderr, .. } => [stdout, stderr]
                .into_iter()
                .map(|stream| stream.trim_end())
                .filter(|stream| !stream.is_empty())
                .collect::<Vec<_>>()
                .join("\n"),
            _ => String::new(),
        };
        Self {
            stage,
            output,
            error: Some(error.to_string()),
            duration_ms,
        }
    }

    pub fn aborted(stage: Stage) -> Self {
        Self {
            stage,
            output: String::new(),
            error: Some("stage was aborted before it finished".to_string()),
            duration_ms: 0,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    /// Output with every line prefixed by the stage label, so interleaved
    /// concurrent output stays attributable. `None` when there is no output.
    pub fn labelled_output(&self) -> Option<String> {
        if self.output.trim().is_empty() {
            return None;
        }
        let text = self
            .output
            .lines()
            .map(|line| format!("[{}] {}", self.stage, line))
            .collect::<Vec<_>>()
            .join("\n");
        Some(text)
    }
}
