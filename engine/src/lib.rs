//! Container automation for the CI pipeline
//!
//! Containers are declared as immutable values ([`Container`]) and handed to
//! an [`Engine`] for evaluation. The engine is always passed explicitly; there
//! is no process-wide client, which keeps everything above this crate testable
//! against a fake implementation.

pub mod cli;
pub mod container;
pub mod plan;
pub mod runtime;

use async_trait::async_trait;
use thiserror::Error;

pub use cli::CliEngine;
pub use container::{CacheVolume, Container, HostDirectory, Layer, Service, ServiceOpts};
pub use plan::{Plan, Step, StepKind};
pub use runtime::{detect_runtime, ContainerRuntime};

/// Errors related to evaluating containers
#[derive(Error, Debug)]
pub enum EngineError {
    /// No container runtime is available
    #[error("No container runtime available. Please install Docker or Podman to run the pipeline.")]
    NoRuntimeAvailable,

    /// An exec layer exited non-zero
    #[error("Command `{command}` exited with {}: {stderr}", describe_exit(.exit_code))]
    ExecFailed {
        command: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    /// A bound service never passed its readiness probe
    #[error("Service '{alias}' did not become ready within {timeout}s")]
    ServiceUnreachable { alias: String, timeout: u64 },

    /// A runtime command could not be run or was rejected
    #[error("Runtime command failed: {command}: {reason}")]
    CommandFailed { command: String, reason: String },

    /// The declaration uses something this engine cannot express
    #[error("Unsupported declaration: {0}")]
    Unsupported(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_string(),
    }
}

/// Captured output of the last exec layer of a container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// The execution context every container is evaluated against.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Apply every layer in order, stopping at the first failing exec.
    async fn evaluate(&self, container: &Container) -> EngineResult<ExecOutput>;

    /// Evaluate `container` and retain the result so that containers
    /// extending it only evaluate their own layers.
    async fn sync(&self, container: &Container) -> EngineResult<()>;

    fn name(&self) -> &str;

    async fn stdout(&self, container: &Container) -> EngineResult<String> {
        Ok(self.evaluate(container).await?.stdout)
    }

    /// Exit status of the last exec. A command that exits non-zero yields
    /// its status rather than an error; one killed by a signal is still an
    /// error.
    async fn exit_code(&self, container: &Container) -> EngineResult<i32> {
        match self.evaluate(container).await {
            Ok(output) => Ok(output.exit_code),
            Err(EngineError::ExecFailed {
                exit_code: Some(code),
                ..
            }) => Ok(code),
            Err(e) => Err(e),
        }
    }
}
