//! Pipeline orchestration.
//!
//! A run moves through `Idle → EnvironmentBuilding → RunningStages` and ends
//! in `Success` or `Failed`. There are no retries; every failure is terminal.
//!
//! Under [`ExecutionPolicy::Sequential`] stages run in pipeline order and the
//! first failure stops the run. Under [`ExecutionPolicy::Concurrent`] every
//! stage is spawned at once; the first failure to be observed is the one
//! reported, and the other stages still run to completion unless
//! `cancel_siblings` is set.

use crate::config::{ConfigError, ExecutionPolicy, PipelineConfig};
use crate::environment::build_env;
use crate::stage::{Stage, StageResult};
use chrono::{DateTime, Utc};
use engine::{Container, Engine, EngineError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid pipeline configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Container engine unavailable: {0}")]
    Engine(#[from] EngineError),

    #[error("Environment build failed: {0}")]
    EnvironmentBuild(#[source] EngineError),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunState {
    Idle,
    EnvironmentBuilding,
    RunningStages,
    Success,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Success | RunState::Failed)
    }
}

/// Where a run failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailedStep {
    Environment,
    Stage(Stage),
}

impl fmt::Display for FailedStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailedStep::Environment => write!(f, "environment"),
            FailedStep::Stage(stage) => write!(f, "{stage}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub step: FailedStep,
    pub message: String,
}

impl Failure {
    fn from_stage(result: &StageResult) -> Option<Self> {
        result.error.as_ref().map(|message| Failure {
            step: FailedStep::Stage(result.stage),
            message: message.clone(),
        })
    }
}

/// Summary of one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub policy: ExecutionPolicy,
    pub state: RunState,
    /// Results of the stages that ran, in pipeline order
    pub stages: Vec<StageResult>,
    /// First failure observed
    pub failure: Option<Failure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.state == RunState::Success
    }

    pub fn exit_code(&self) -> u8 {
        if self.is_success() {
            0
        } else {
            1
        }
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageResult> {
        self.stages.iter().find(|result| result.stage == stage)
    }

    /// Result of the stage named by `failure`, if the run failed in a stage.
    pub fn failed_stage(&self) -> Option<&StageResult> {
        match self.failure.as_ref()?.step {
            FailedStep::Stage(stage) => self.stage(stage),
            FailedStep::Environment => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Runs the configured stages against one shared environment.
pub struct Pipeline {
    engine: Arc<dyn Engine>,
    config: PipelineConfig,
    state: RunState,
    print_output: bool,
}

impl Pipeline {
    pub fn new(engine: Arc<dyn Engine>, config: PipelineConfig) -> PipelineResult<Self> {
        config.validate()?;
        Ok(Self {
            engine,
            config,
            state: RunState::Idle,
            print_output: true,
        })
    }

    /// Keep stage output off stdout; it is still in the report.
    pub fn quiet(mut self) -> Self {
        self.print_output = false;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// The environment declaration for this configuration, not yet evaluated.
    pub fn environment(&self) -> Container {
        build_env(&self.config)
    }

    /// Evaluate the environment once so every stage starts from it.
    pub async fn build_environment(&self) -> PipelineResult<Container> {
        let env = self.environment();
        self.engine
            .sync(&env)
            .await
            .map_err(PipelineError::EnvironmentBuild)?;
        Ok(env)
    }

    pub async fn run(&mut self) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let policy = self.config.policy;
        info!(%run_id, %policy, engine = self.engine.name(), "Pipeline run started");

        self.transition_to(RunState::EnvironmentBuilding);
        let built = self.build_environment().await;
        let (stages, failure) = match built {
            Ok(env) => {
                self.transition_to(RunState::RunningStages);
                match policy {
                    ExecutionPolicy::Sequential => self.run_sequential(&env).await,
                    ExecutionPolicy::Concurrent => self.run_concurrent(&env).await,
                }
            }
            Err(e) => {
                error!("{}", e);
                let failure = Failure {
                    step: FailedStep::Environment,
                    message: e.to_string(),
                };
                (Vec::new(), Some(failure))
            }
        };

        if failure.is_some() {
            self.transition_to(RunState::Failed);
        } else {
            self.transition_to(RunState::Success);
        }
        info!(%run_id, state = ?self.state, "Pipeline run finished");

        RunReport {
            run_id,
            policy,
            state: self.state,
            stages,
            failure,
            started_at,
            finished_at: Utc::now(),
        }
    }

    async fn run_sequential(&self, env: &Container) -> (Vec<StageResult>, Option<Failure>) {
        let mut results = Vec::new();

        for stage in self.config.stages() {
            let result = stage
                .run(self.engine.as_ref(), env, self.config.capture)
                .await;
            self.print(&result);

            let failure = Failure::from_stage(&result);
            results.push(result);
            if failure.is_some() {
                return (results, failure);
            }
        }

        (results, None)
    }

    async fn run_concurrent(&self, env: &Container) -> (Vec<StageResult>, Option<Failure>) {
        let stages = self.config.stages();
        let capture = self.config.capture;
        let mut tasks = JoinSet::new();

        for stage in &stages {
            let stage = *stage;
            let engine = Arc::clone(&self.engine);
            let env = env.clone();
            tasks.spawn(async move { stage.run(engine.as_ref(), &env, capture).await });
        }

        let mut results: Vec<StageResult> = Vec::with_capacity(stages.len());
        let mut failure = None;

        // Completion order, so the first failure recorded is the first observed
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => {
                    self.print(&result);
                    if failure.is_none() {
                        failure = Failure::from_stage(&result);
                        if failure.is_some() && self.config.cancel_siblings {
                            debug!("Aborting {} sibling stages", tasks.len());
                            tasks.abort_all();
                        }
                    }
                    results.push(result);
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!("Stage task ended abnormally: {}", e),
            }
        }

        for stage in stages {
            if !results.iter().any(|result| result.stage == stage) {
                let aborted = StageResult::aborted(stage);
                if failure.is_none() {
                    failure = Failure::from_stage(&aborted);
                }
                results.push(aborted);
            }
        }
        results.sort_by_key(|result| result.stage);

        (results, failure)
    }

    /// Echo a finished stage's output as soon as it completes. Failed
    /// stages go to stderr next to the logs.
    fn print(&self, result: &StageResult) {
        if !self.print_output {
            return;
        }
        if let Some(text) = result.labelled_output() {
            if result.succeeded() {
                println!("{}", text);
            } else {
                eprintln!("{}", text);
            }
        }
    }

    fn transition_to(&mut self, new_state: RunState) {
        debug!("State transition: {:?} → {:?}", self.state, new_state);
        self.state = new_state;
    }
}
