use clap::{Args, Parser, Subcommand};
use engine::{CliEngine, ContainerRuntime, Engine, Plan};
use pipeline::{
    build_env, init_tracing, Capture, ExecutionPolicy, Pipeline, PipelineConfig, PipelineError,
    Stage, TelemetryConfig,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "pipeline")]
#[command(about = "Run the newsletter CI stages in containers against PostgreSQL")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the environment and run the stages
    Run {
        #[command(flatten)]
        options: RunOptions,
        /// Container runtime to use (detected when omitted)
        #[arg(long)]
        runtime: Option<String>,
        /// Write the JSON run report to this path
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Print the commands a run would execute, without running them
    Plan {
        #[command(flatten)]
        options: RunOptions,
    },
    /// List the stages
    Stages,
}

#[derive(Args)]
struct RunOptions {
    /// TOML file with configuration overrides
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Project sources to check
    #[arg(short, long)]
    source: Option<PathBuf>,
    /// How stages are scheduled
    #[arg(short, long, value_enum)]
    policy: Option<ExecutionPolicy>,
    /// Stage to run; repeat for several (defaults depend on the policy)
    #[arg(long = "stage", value_enum)]
    stages: Vec<Stage>,
    /// Keep stdout of each stage, or only its exit status
    #[arg(long, value_enum)]
    capture: Option<Capture>,
    /// Abort other concurrent stages as soon as one fails
    #[arg(long)]
    cancel_siblings: bool,
}

impl RunOptions {
    fn into_config(self) -> Result<PipelineConfig, PipelineError> {
        let mut config = PipelineConfig::load(self.config.as_deref())?;
        if let Some(source) = self.source {
            config = config.with_source_dir(source);
        }
        if let Some(policy) = self.policy {
            config = config.with_policy(policy);
        }
        if !self.stages.is_empty() {
            config = config.with_stages(self.stages);
        }
        if let Some(capture) = self.capture {
            config = config.with_capture(capture);
        }
        if self.cancel_siblings {
            config = config.with_cancel_siblings(true);
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let telemetry = if cli.verbose {
        TelemetryConfig::verbose()
    } else {
        TelemetryConfig::default()
    };
    if let Err(e) = init_tracing(&telemetry) {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Commands::Run {
            options,
            runtime,
            report,
        } => run(options, runtime, report).await,
        Commands::Plan { options } => plan(options),
        Commands::Stages => {
            list_stages();
            Ok(ExitCode::SUCCESS)
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(
    options: RunOptions,
    runtime: Option<String>,
    report_path: Option<PathBuf>,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let config = options.into_config()?;

    let engine = match runtime {
        Some(name) => {
            let runtime: ContainerRuntime = name.parse()?;
            CliEngine::new(runtime).map_err(PipelineError::from)?
        }
        None => CliEngine::detect().map_err(PipelineError::from)?,
    };
    let engine: Arc<dyn Engine> = Arc::new(engine);

    let mut pipeline = Pipeline::new(engine, config)?;
    let report = pipeline.run().await;

    if let Some(path) = report_path {
        std::fs::write(&path, report.to_json()?)?;
        info!("Run report written to {}", path.display());
    }

    for result in &report.stages {
        let status = if result.succeeded() { "ok" } else { "FAILED" };
        eprintln!(
            "  {:<10} {:<7} {:.1}s",
            result.stage.label(),
            status,
            result.duration_ms as f64 / 1000.0
        );
    }

    if let Some(failure) = &report.failure {
        eprintln!("error: {}: {}", failure.step, failure.message);
        if let Some(text) = report.failed_stage().and_then(|r| r.labelled_output()) {
            eprintln!("{}", text);
        }
    }

    Ok(ExitCode::from(report.exit_code()))
}

fn plan(options: RunOptions) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let config = options.into_config()?;
    let env = build_env(&config);

    println!("environment ({}):", env.image());
    print_commands(&Plan::resolve(&env), 0);

    let skip = env.layers().len();
    for stage in config.stages() {
        println!("{} ({} policy):", stage, config.policy);
        print_commands(&Plan::resolve(&stage.extend(&env)), skip);
    }

    Ok(ExitCode::SUCCESS)
}

fn print_commands(plan: &Plan, from_layer: usize) {
    for step in plan.steps_from(from_layer) {
        match &step.kind {
            engine::StepKind::CopyDirectory { source, path } => {
                println!("  copy {} -> {}", source.path().display(), path)
            }
            engine::StepKind::Exec { args, .. } => println!("  {}", args.join(" ")),
        }
    }
}

fn list_stages() {
    println!("Available stages:");
    for stage in Stage::ALL {
        println!("  - {}: {}", stage, stage.description());
        let commands = Plan::resolve(&stage.extend(&engine::Container::from_image("")))
            .exec_commands()
            .into_iter()
            .map(|args| args.join(" "))
            .collect::<Vec<_>>();
        for command in commands {
            println!("      {}", command);
        }
    }
}
