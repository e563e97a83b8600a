use async_trait::async_trait;
use engine::{Container, Engine, EngineError, EngineResult, ExecOutput, Plan, StepKind};
use std::sync::Mutex;
use std::time::Duration;

struct Failure {
    stdout: String,
    stderr: String,
}

/// Scripted engine: every exec succeeds unless a failure rule matches it.
/// Extensions of a synced container skip the synced layers, like the real
/// engine does.
#[derive(Default)]
pub struct FakeEngine {
    failures: Vec<(String, Failure)>,
    delays: Vec<(String, Duration)>,
    outputs: Vec<(String, String)>,
    executed: Mutex<Vec<String>>,
    evaluated: Mutex<Vec<Container>>,
    synced: Mutex<Vec<Container>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands containing `pattern` exit 1 with `stderr`.
    pub fn fail_on(self, pattern: &str, stderr: &str) -> Self {
        self.fail_with(pattern, "", stderr)
    }

    /// Commands containing `pattern` exit 1, printing on both streams.
    pub fn fail_with(mut self, pattern: &str, stdout: &str, stderr: &str) -> Self {
        self.failures.push((
            pattern.to_string(),
            Failure {
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            },
        ));
        self
    }

    /// Commands containing `pattern` take `delay` to finish.
    pub fn delay(mut self, pattern: &str, delay: Duration) -> Self {
        self.delays.push((pattern.to_string(), delay));
        self
    }

    /// Commands containing `pattern` print `stdout`.
    pub fn output(mut self, pattern: &str, stdout: &str) -> Self {
        self.outputs.push((pattern.to_string(), stdout.to_string()));
        self
    }

    /// Every command that ran, in the order it finished.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn ran(&self, pattern: &str) -> bool {
        self.executed().iter().any(|command| command.contains(pattern))
    }

    pub fn count(&self, pattern: &str) -> usize {
        self.executed()
            .iter()
            .filter(|command| command.contains(pattern))
            .count()
    }

    pub fn evaluated(&self) -> Vec<Container> {
        self.evaluated.lock().unwrap().clone()
    }

    pub fn synced(&self) -> Vec<Container> {
        self.synced.lock().unwrap().clone()
    }

    fn retained_prefix(&self, container: &Container) -> usize {
        self.synced
            .lock()
            .unwrap()
            .iter()
            .filter(|synced| container.extends(synced))
            .map(|synced| synced.layers().len())
            .max()
            .unwrap_or(0)
    }

    fn lookup<'a, T>(rules: &'a [(String, T)], command: &str) -> Option<&'a T> {
        rules
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, value)| value)
    }
}

#[async_trait]
impl Engine for FakeEngine {
    async fn evaluate(&self, container: &Container) -> EngineResult<ExecOutput> {
        self.evaluated.lock().unwrap().push(container.clone());

        let plan = Plan::resolve(container);
        let start = self.retained_prefix(container);
        let mut last = ExecOutput::default();

        for step in plan.steps_from(start) {
            let StepKind::Exec { args, .. } = &step.kind else {
                continue;
            };
            let command = args.join(" ");

            if let Some(delay) = Self::lookup(&self.delays, &command) {
                tokio::time::sleep(*delay).await;
            }
            self.executed.lock().unwrap().push(command.clone());

            if let Some(failure) = Self::lookup(&self.failures, &command) {
                return Err(EngineError::ExecFailed {
                    command,
                    exit_code: Some(1),
                    stdout: failure.stdout.clone(),
                    stderr: failure.stderr.clone(),
                });
            }

            last = ExecOutput {
                stdout: Self::lookup(&self.outputs, &command)
                    .cloned()
                    .unwrap_or_default(),
                stderr: String::new(),
                exit_code: 0,
            };
        }

        Ok(last)
    }

    async fn sync(&self, container: &Container) -> EngineResult<()> {
        self.evaluate(container).await?;
        self.synced.lock().unwrap().push(container.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "fake"
    }
}
