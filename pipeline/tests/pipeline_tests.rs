mod support;

use engine::{Engine, Layer};
use pipeline::{
    Capture, ExecutionPolicy, FailedStep, Pipeline, PipelineConfig, RunState, Stage,
};
use std::sync::Arc;
use std::time::Duration;
use support::FakeEngine;
use tokio::time::timeout;

const ENVIRONMENT_COMMANDS: [&str; 4] = [
    "apt-get update",
    "apt-get install lld clang postgresql-client -y",
    "cargo install sqlx-cli --version=0.7.4 --features=rustls,postgres --no-default-features --locked",
    "./scripts/init_db.sh",
];

// The command that decides each stage's outcome
fn deciding_command(stage: Stage) -> &'static str {
    match stage {
        Stage::Format => "cargo fmt --check",
        Stage::Lint => "cargo clippy -- -D warnings",
        Stage::Test => "cargo test",
        Stage::Coverage => "cargo llvm-cov --all-features --workspace",
    }
}

fn pipeline_with(fake: &Arc<FakeEngine>, config: PipelineConfig) -> Pipeline {
    let engine: Arc<dyn Engine> = fake.clone();
    Pipeline::new(engine, config).unwrap().quiet()
}

#[tokio::test]
async fn test_all_stages_pass_sequentially() {
    let fake = Arc::new(FakeEngine::new().output("cargo test", "test result: ok. 12 passed"));
    let mut pipeline = pipeline_with(&fake, PipelineConfig::default());

    let report = pipeline.run().await;

    assert_eq!(report.state, RunState::Success);
    assert_eq!(pipeline.state(), RunState::Success);
    assert!(report.is_success());
    assert_eq!(report.exit_code(), 0);
    assert!(report.failure.is_none());
    assert_eq!(
        report.stages.iter().map(|r| r.stage).collect::<Vec<_>>(),
        Stage::ALL.to_vec()
    );
    assert_eq!(
        report.stage(Stage::Test).unwrap().output,
        "test result: ok. 12 passed"
    );

    let mut expected: Vec<String> = ENVIRONMENT_COMMANDS.iter().map(|c| c.to_string()).collect();
    expected.extend(
        [
            "rustup component add rustfmt",
            "cargo fmt --check",
            "rustup component add clippy",
            "cargo clippy -- -D warnings",
            "cargo sqlx prepare --workspace --check",
            "cargo test",
            "cargo install cargo-llvm-cov --locked",
            "cargo llvm-cov --all-features --workspace",
        ]
        .iter()
        .map(|c| c.to_string()),
    );
    assert_eq!(fake.executed(), expected);
}

#[tokio::test]
async fn test_sequential_lint_failure_skips_later_stages() {
    let fake = Arc::new(
        FakeEngine::new().fail_on("cargo clippy", "error: unused variable: `x`"),
    );
    let mut pipeline = pipeline_with(&fake, PipelineConfig::default());

    let report = pipeline.run().await;

    assert_eq!(report.state, RunState::Failed);
    assert_eq!(report.exit_code(), 1);
    let failure = report.failure.as_ref().unwrap();
    assert_eq!(failure.step, FailedStep::Stage(Stage::Lint));
    assert!(failure.message.contains("cargo clippy -- -D warnings"));

    assert_eq!(report.stages.len(), 2);
    assert!(report.stage(Stage::Format).unwrap().succeeded());
    let lint = report.stage(Stage::Lint).unwrap();
    assert!(!lint.succeeded());
    assert_eq!(lint.output, "error: unused variable: `x`");

    assert!(!fake.ran("cargo sqlx prepare"));
    assert!(!fake.ran("cargo test"));
    assert!(!fake.ran("llvm-cov"));
}

#[tokio::test]
async fn test_sequential_failure_at_any_position_stops_the_rest() {
    for (position, failing) in Stage::ALL.into_iter().enumerate() {
        let fake = Arc::new(FakeEngine::new().fail_on(deciding_command(failing), "failed"));
        let mut pipeline = pipeline_with(&fake, PipelineConfig::default());

        let report = pipeline.run().await;

        assert_eq!(report.state, RunState::Failed, "failing {failing}");
        assert_eq!(report.stages.len(), position + 1, "failing {failing}");
        for later in &Stage::ALL[position + 1..] {
            assert!(
                !fake.ran(deciding_command(*later)),
                "{later} ran after {failing} failed"
            );
        }
    }
}

#[tokio::test]
async fn test_concurrent_failure_lets_siblings_finish() {
    let fake = Arc::new(
        FakeEngine::new()
            .fail_on("cargo clippy", "warning treated as error")
            .delay("cargo test", Duration::from_millis(200))
            .delay("cargo fmt --check", Duration::from_millis(100)),
    );
    let config = PipelineConfig::default().with_policy(ExecutionPolicy::Concurrent);
    let mut pipeline = pipeline_with(&fake, config);

    let report = pipeline.run().await;

    assert_eq!(report.state, RunState::Failed);
    assert_eq!(
        report.failure.as_ref().unwrap().step,
        FailedStep::Stage(Stage::Lint)
    );
    // Coverage is not part of the concurrent default set
    assert_eq!(
        report.stages.iter().map(|r| r.stage).collect::<Vec<_>>(),
        vec![Stage::Format, Stage::Lint, Stage::Test]
    );
    assert!(report.stage(Stage::Format).unwrap().succeeded());
    assert!(report.stage(Stage::Test).unwrap().succeeded());
    assert!(fake.ran("cargo test"));
    assert!(fake.ran("cargo fmt --check"));
    assert!(!fake.ran("llvm-cov"));
}

#[tokio::test]
async fn test_concurrent_reports_first_observed_failure() {
    let fake = Arc::new(
        FakeEngine::new()
            .fail_on("cargo fmt --check", "Diff in src/main.rs")
            .delay("cargo fmt --check", Duration::from_millis(300))
            .fail_on("cargo test", "1 test failed"),
    );
    let config = PipelineConfig::default().with_policy(ExecutionPolicy::Concurrent);
    let mut pipeline = pipeline_with(&fake, config);

    let report = pipeline.run().await;

    assert_eq!(report.state, RunState::Failed);
    assert_eq!(
        report.failure.as_ref().unwrap().step,
        FailedStep::Stage(Stage::Test)
    );
    // The slower failure is still computed and kept
    assert!(!report.stage(Stage::Format).unwrap().succeeded());
}

#[tokio::test]
async fn test_concurrent_cancel_siblings_aborts_running_stages() {
    let fake = Arc::new(
        FakeEngine::new()
            .fail_on("cargo clippy", "warning treated as error")
            .delay("cargo test", Duration::from_secs(30)),
    );
    let config = PipelineConfig::default()
        .with_policy(ExecutionPolicy::Concurrent)
        .with_cancel_siblings(true);
    let mut pipeline = pipeline_with(&fake, config);

    let report = timeout(Duration::from_secs(5), pipeline.run())
        .await
        .expect("aborted siblings should not be awaited to completion");

    assert_eq!(report.state, RunState::Failed);
    assert_eq!(
        report.failure.as_ref().unwrap().step,
        FailedStep::Stage(Stage::Lint)
    );
    let test = report.stage(Stage::Test).unwrap();
    assert!(!test.succeeded());
    assert!(test.error.as_ref().unwrap().contains("aborted"));
    assert!(!fake.ran("cargo test"));
}

#[tokio::test]
async fn test_failed_stage_keeps_tool_stdout() {
    let fake = Arc::new(FakeEngine::new().fail_with(
        "cargo fmt --check",
        "Diff in /hello-rust/src/main.rs at line 1:\n-fn main(){}\n+fn main() {}",
        "",
    ));
    let mut pipeline = pipeline_with(&fake, PipelineConfig::default());

    let report = pipeline.run().await;

    assert_eq!(report.state, RunState::Failed);
    let format = report.failed_stage().unwrap();
    assert_eq!(format.stage, Stage::Format);
    assert!(format.output.contains("Diff in /hello-rust/src/main.rs at line 1:"));
    assert!(format.output.contains("+fn main() {}"));
    assert!(format
        .labelled_output()
        .unwrap()
        .starts_with("[format] Diff in /hello-rust/src/main.rs"));
}

#[tokio::test]
async fn test_failure_output_follows_reported_stage() {
    let fake = Arc::new(
        FakeEngine::new()
            .fail_with("cargo fmt --check", "FORMAT DIFF", "")
            .delay("cargo fmt --check", Duration::from_millis(300))
            .fail_with("cargo test", "TEST FAILURE", "error: test failed, to rerun pass `--lib`"),
    );
    let config = PipelineConfig::default().with_policy(ExecutionPolicy::Concurrent);
    let mut pipeline = pipeline_with(&fake, config);

    let report = pipeline.run().await;

    assert_eq!(
        report.failure.as_ref().unwrap().step,
        FailedStep::Stage(Stage::Test)
    );
    let failed = report.failed_stage().unwrap();
    assert_eq!(failed.stage, Stage::Test);
    assert_eq!(
        failed.output,
        "TEST FAILURE\nerror: test failed, to rerun pass `--lib`"
    );
    // The later failure keeps its own output
    assert_eq!(report.stage(Stage::Format).unwrap().output, "FORMAT DIFF");
}

#[tokio::test]
async fn test_environment_failure_runs_no_stage() {
    let fake = Arc::new(FakeEngine::new().fail_on(
        "./scripts/init_db.sh",
        "psql: error: could not connect to server: Connection refused",
    ));

    for policy in [ExecutionPolicy::Sequential, ExecutionPolicy::Concurrent] {
        let mut pipeline = pipeline_with(&fake, PipelineConfig::default().with_policy(policy));
        let report = pipeline.run().await;

        assert_eq!(report.state, RunState::Failed);
        let failure = report.failure.as_ref().unwrap();
        assert_eq!(failure.step, FailedStep::Environment);
        assert!(failure.message.contains("Connection refused"));
        assert!(report.stages.is_empty());
        assert!(report.failed_stage().is_none());
    }

    assert!(fake.evaluated().iter().all(|c| c.layers().len() == 18));
    assert!(!fake.ran("rustup"));
    assert!(!fake.ran("cargo test"));
}

#[tokio::test]
async fn test_format_check_on_formatted_source() {
    let fake = Arc::new(FakeEngine::new());
    let config = PipelineConfig::default().with_stages(vec![Stage::Format]);
    let mut pipeline = pipeline_with(&fake, config);

    let report = pipeline.run().await;

    assert!(report.is_success());
    let format = report.stage(Stage::Format).unwrap();
    assert!(format.succeeded());
    assert!(format.output.is_empty());
}

#[tokio::test]
async fn test_environment_is_built_once_and_shared() {
    let fake = Arc::new(FakeEngine::new());
    let config = PipelineConfig::default().with_policy(ExecutionPolicy::Concurrent);
    let mut pipeline = pipeline_with(&fake, config);

    let report = pipeline.run().await;

    assert!(report.is_success());
    assert_eq!(fake.synced().len(), 1);
    for command in ENVIRONMENT_COMMANDS {
        assert_eq!(fake.count(command), 1, "{command}");
    }

    let base = pipeline.environment();
    let stage_containers: Vec<_> = fake
        .evaluated()
        .into_iter()
        .filter(|c| c != &base)
        .collect();
    assert_eq!(stage_containers.len(), 3);
    assert!(stage_containers.iter().all(|c| c.extends(&base)));

    // SQLX_OFFLINE belongs to lint alone
    let offline = Layer::EnvVariable {
        name: "SQLX_OFFLINE".to_string(),
        value: "true".to_string(),
    };
    let with_offline: Vec<_> = stage_containers
        .iter()
        .filter(|c| c.layers().contains(&offline))
        .collect();
    assert_eq!(with_offline.len(), 1);
    assert_eq!(*with_offline[0], Stage::Lint.extend(&base));
}

#[tokio::test]
async fn test_environment_build_is_deterministic() {
    let first = Arc::new(FakeEngine::new());
    let second = Arc::new(FakeEngine::new());

    let env_a = pipeline_with(&first, PipelineConfig::default())
        .build_environment()
        .await
        .unwrap();
    let env_b = pipeline_with(&second, PipelineConfig::default())
        .build_environment()
        .await
        .unwrap();

    assert_eq!(env_a, env_b);
    assert_eq!(first.executed(), second.executed());
    assert_eq!(first.executed(), ENVIRONMENT_COMMANDS.to_vec());
}

#[tokio::test]
async fn test_exit_status_capture_discards_output() {
    let fake = Arc::new(FakeEngine::new().output("cargo test", "test result: ok"));
    let config = PipelineConfig::default()
        .with_stages(vec![Stage::Test])
        .with_capture(Capture::ExitStatus);
    let mut pipeline = pipeline_with(&fake, config);

    let report = pipeline.run().await;

    assert!(report.is_success());
    assert_eq!(report.stage(Stage::Test).unwrap().output, "");
}

#[tokio::test]
async fn test_concurrent_stages_overlap() {
    let fake = Arc::new(
        FakeEngine::new()
            .delay("cargo fmt --check", Duration::from_millis(400))
            .delay("cargo clippy", Duration::from_millis(400))
            .delay("cargo test", Duration::from_millis(400)),
    );
    let config = PipelineConfig::default().with_policy(ExecutionPolicy::Concurrent);
    let mut pipeline = pipeline_with(&fake, config);

    let started = std::time::Instant::now();
    let report = pipeline.run().await;

    assert!(report.is_success());
    assert!(started.elapsed() < Duration::from_millis(1100));
}
