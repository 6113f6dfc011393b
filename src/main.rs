use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use conductor::cmd;
use conductor::config::Config;
use conductor::model::task::Priority;
use conductor::notify::TracingNotifier;
use conductor::orchestrator::Orchestrator;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Autonomous multi-agent delivery orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Project directory (defaults to the current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a new task
    Submit {
        title: String,
        /// Longer description of the work
        #[arg(short, long, default_value = "")]
        description: String,
        #[arg(short, long, default_value = "medium")]
        priority: String,
        /// Target repository names (defaults to all configured)
        #[arg(short, long)]
        repo: Vec<String>,
    },
    /// Run (or resume) the pipeline for a task
    Run { task_id: String },
    /// Show a task's phases and spend
    Status { task_id: String },
    /// Grant a pending approval so a paused run can resume
    Approve { task_id: String },
    /// Dump the event log for a task
    Events { task_id: String },
    /// Append requirements to a task, forcing phases to re-run
    Continue {
        task_id: String,
        requirements: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "conductor=debug" } else { "conductor=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let project_dir = cli
        .project_dir
        .unwrap_or_else(|| std::env::current_dir().expect("cannot resolve current directory"));
    let config = Config::load(&project_dir)?;
    let orchestrator = Orchestrator::new(config, Arc::new(TracingNotifier))?;

    match cli.command {
        Commands::Submit {
            title,
            description,
            priority,
            repo,
        } => {
            let priority: Priority = priority
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))?;
            cmd::submit::execute(&orchestrator, &title, &description, priority, repo).await
        }
        Commands::Run { task_id } => cmd::run::execute(&orchestrator, &task_id).await,
        Commands::Status { task_id } => cmd::status::execute(&orchestrator, &task_id).await,
        Commands::Approve { task_id } => cmd::approve::execute(&orchestrator, &task_id).await,
        Commands::Events { task_id } => cmd::events::execute(&orchestrator, &task_id).await,
        Commands::Continue {
            task_id,
            requirements,
        } => {
            orchestrator.continue_task(&task_id, &requirements).await?;
            println!("Continuation recorded; re-run with: conductor run {task_id}");
            Ok(())
        }
    }
}
