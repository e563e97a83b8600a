pub mod config;
pub mod environment;
pub mod orchestrator;
pub mod service;
pub mod stage;
pub mod telemetry;

pub use config::{
    Capture, ConfigError, ConfigResult, DatabaseSettings, ExecutionPolicy, PipelineConfig,
};
pub use environment::{build_env, EnvironmentBuilder};
pub use orchestrator::{
    FailedStep, Failure, Pipeline, PipelineError, PipelineResult, RunReport, RunState,
};
pub use service::postgres_service;
pub use stage::{Stage, StageResult};
pub use telemetry::{init_tracing, TelemetryConfig, TelemetryError};
