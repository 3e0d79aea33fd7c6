use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use pipewright::collab::{
    Collaborators, LocalHost, LocalNodeRegistry, LocalShell, LogMessenger, ProcessGitClient,
    ProcessRemoteRunner, UnsupportedDispatcher,
};
use pipewright::engine::{Engine, ExitStatus, RunOptions};
use pipewright::settings::load_file;
use pipewright::store::WorkspaceArtifacts;
use pipewright::Config;
use serde_json::to_writer_pretty;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, prelude::*};

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = configure_tracing() {
        eprintln!("Failed to initialize logging: {err}");
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("Failed to start runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(dispatch(cli)) {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn configure_tracing() -> Result<()> {
    let debug_mode = std::env::var("DEBUG_MODE")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let default_level = if debug_mode { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Run {
            job_name,
            settings,
            branch,
            workspace,
            dry_run,
            verbose,
            print_report,
        } => {
            run_pipeline(
                job_name,
                settings,
                branch,
                workspace,
                dry_run,
                verbose,
                print_report,
            )
            .await
        }
        Commands::Check { settings, workspace } => {
            let engine = build_engine(workspace)?;
            let opts = RunOptions {
                settings_file: Some(settings),
                ..RunOptions::default()
            };
            if engine.check(&opts).await? {
                info!("Pipeline settings check passed");
                Ok(ExitCode::SUCCESS)
            } else {
                error!("Pipeline settings check failed");
                Ok(ExitCode::FAILURE)
            }
        }
        Commands::Params { settings } => {
            let tree = load_file(&settings, false)?;
            print!("{}", Engine::render_parameters(&tree)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_pipeline(
    job_name: String,
    settings: Option<PathBuf>,
    branch: Option<String>,
    workspace: Option<PathBuf>,
    dry_run: bool,
    verbose: bool,
    print_report: Option<PathBuf>,
) -> Result<ExitCode> {
    let engine = build_engine(workspace)?;
    let opts = RunOptions {
        job_name,
        settings_file: settings,
        branch,
        dry_run,
        verbose,
    };

    let status = engine.run(&opts).await?;

    if let Some(path) = print_report {
        let report = engine.last_report();
        if let Some(report) = report {
            let file = std::fs::File::create(&path)?;
            to_writer_pretty(file, &report)?;
            info!(report = %path.display(), "Run report written");
        }
    }

    Ok(match status {
        ExitStatus::Failed => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    })
}

fn build_engine(workspace: Option<PathBuf>) -> Result<Engine> {
    let workspace = match workspace {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let config = Config::from_env();
    let deps = Collaborators {
        git: Arc::new(ProcessGitClient),
        runner: Arc::new(ProcessRemoteRunner::new(workspace.clone())),
        shell: Arc::new(LocalShell),
        dispatcher: Arc::new(UnsupportedDispatcher),
        artifacts: Arc::new(WorkspaceArtifacts::new(workspace.clone())),
        messenger: Arc::new(LogMessenger),
        nodes: Arc::new(LocalNodeRegistry),
        host: Arc::new(LocalHost::new(workspace)),
    };
    Ok(Engine::new(config, deps))
}

#[derive(Parser)]
#[command(
    name = "pipewright",
    version,
    about = "Declarative CI pipeline orchestrator driven by YAML settings"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load, validate and execute a pipeline.
    Run {
        /// Job name; derives the settings filename when cloning.
        #[arg(long, default_value = "pipeline")]
        job_name: String,
        /// Local settings file; skips the settings repository clone.
        #[arg(long)]
        settings: Option<PathBuf>,
        /// Settings repository branch.
        #[arg(long)]
        branch: Option<String>,
        /// Workspace directory (defaults to the current directory).
        #[arg(long)]
        workspace: Option<PathBuf>,
        /// Log intents without side effects.
        #[arg(long)]
        dry_run: bool,
        /// Log the raw settings file before parsing.
        #[arg(long)]
        verbose: bool,
        /// Write the run report as JSON to this path.
        #[arg(long = "print-report")]
        print_report: Option<PathBuf>,
    },
    /// Validate a settings file without executing anything.
    Check {
        settings: PathBuf,
        #[arg(long)]
        workspace: Option<PathBuf>,
    },
    /// Print the derived build parameter declaration.
    Params {
        settings: PathBuf,
    },
}
