//! RNN Training Harness CLI
//!
//! Runs, plans and inspects staged training experiments.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use rnn_config::{StageArgs, StageSpec};
use rnn_harness::{
    config::ExperimentConfig,
    observer::RunObserver,
    report::MailNotifier,
    scheduler::{self, RunOutcome, Scheduler},
    state::{RunStatus, StateManager},
    toolkit::CommandToolkit,
};
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "rnn-harness", about = "RNN Training Harness")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the experiment
    Run {
        /// Path to the experiment TOML config file
        #[arg(short, long, default_value = "train.toml")]
        config: PathBuf,

        #[command(flatten)]
        stages: StageArgs,

        /// Start after the last stage recorded in the state file
        #[arg(long, conflicts_with = "stage")]
        resume: bool,
    },

    /// Print the iteration plan without training
    Plan {
        /// Path to the experiment TOML config file
        #[arg(short, long, default_value = "train.toml")]
        config: PathBuf,
    },

    /// Show the recorded state of an experiment
    Status {
        /// Experiment directory
        #[arg(short, long)]
        dir: PathBuf,
    },

    /// Forget the recorded state of an experiment
    Reset {
        /// Experiment directory
        #[arg(short, long)]
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // tracing needs to be initialized with indicatif_layer to not clobber progress bars
    let indicatif_layer = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .with(indicatif_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            stages,
            resume,
        } => {
            let experiment = ExperimentConfig::load(&config)?;
            let mut options = experiment.train.with_stages(&stages);

            if resume {
                let state = StateManager::for_dir(&options.dir).load()?;
                if let Some(stage) = state.resume_stage() {
                    println!("Resuming {} from stage {stage}", options.dir.display());
                    options.stage = StageSpec::Index(stage);
                }
            }

            let toolkit = CommandToolkit::new(experiment.toolkit.clone(), &options.dir);
            let notifier = options
                .email
                .as_ref()
                .map(|address| MailNotifier::with_program(&experiment.harness.mail_program, address));
            let observer = RunObserver::new(&options.dir);

            println!("Starting training with config: {}", config.display());
            let scheduler = Scheduler::new(options, toolkit, notifier)
                .with_settings(experiment.harness.clone())
                .with_observer(observer);

            match scheduler.run().await? {
                RunOutcome::Completed { num_iters } => {
                    println!();
                    println!("=== Training Complete ===");
                    println!("Iterations: {num_iters}");
                    println!(
                        "Report: {}",
                        scheduler::report_path(&scheduler.options().dir).display()
                    );
                }
                RunOutcome::ExitedEarly { iter } => {
                    println!("Exited before iteration {iter}");
                }
            }
        }

        Commands::Plan { config } => {
            let experiment = ExperimentConfig::load(&config)?;
            let dry = scheduler::dry_run(&experiment.train)?;
            let plan = &dry.plan;

            println!("=== Training Plan ===");
            println!(
                "{} epochs over {} archives = {} iterations",
                plan.num_epochs, plan.num_archives, plan.num_iters
            );
            println!(
                "Jobs: {} -> {}, context: {} left / {} right",
                plan.num_jobs_initial,
                plan.num_jobs_final,
                plan.left_context(),
                plan.right_context()
            );
            let window = plan.deriv_window();
            if !window.is_unconstrained() {
                println!(
                    "Derivative window: {:?} .. {:?}",
                    window.min_deriv_time, window.max_deriv_time
                );
            }
            println!("Models to combine: {:?}", dry.combination.indices());
            println!();

            for planned in &dry.iterations {
                println!(
                    "  iter {:>5}: {:>3} jobs, {:>6} archives processed, lr {:.4e}",
                    planned.iter, planned.num_jobs, planned.archives_processed, planned.learning_rate
                );
            }
        }

        Commands::Status { dir } => {
            let state_manager = StateManager::for_dir(&dir);
            let state = state_manager.load()?;

            let status = match state.status {
                RunStatus::Pending => "PENDING",
                RunStatus::Running => "RUNNING",
                RunStatus::Completed => "COMPLETED",
                RunStatus::Exited => "EXITED",
                RunStatus::Failed => "FAILED",
            };

            print!("{}: {status} ({})", dir.display(), state.phase);
            if let Some(pid) = state.pid {
                print!(" (PID: {pid})");
            }
            if let Some(stage) = state.last_stage {
                print!(" [last stage: {stage}]");
            }
            if let Some(num_iters) = state.num_iters {
                print!(" [iterations: {num_iters}]");
            }
            if state.attempts > 1 {
                print!(" [attempts: {}]", state.attempts);
            }
            println!();

            for error in &state.errors {
                println!("  Error: {error}");
            }
        }

        Commands::Reset { dir } => {
            StateManager::for_dir(&dir).reset()?;
            println!("Reset: {}", dir.display());
        }
    }

    Ok(())
}
