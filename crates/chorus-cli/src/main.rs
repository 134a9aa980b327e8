//! `chorus`: run coding agents in parallel git worktrees and merge their work.

mod commands;
mod config;
mod console;

use clap::{Parser, Subcommand, ValueEnum};
use chorus_session::Mode;
use chorus_tasks::{NewTask, TaskStatus, TaskType};
use commands::{TaskFilter, Workspace};
use config::ChorusConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chorus", version, about = "Chorus: parallel coding agents with a serialized merge queue")]
struct Cli {
    /// Path to config file, relative to the repository
    #[arg(short, long, default_value = "chorus.toml")]
    config: PathBuf,

    /// Repository root
    #[arg(short = 'C', long, default_value = ".")]
    repo: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the orchestrator and read operator commands from stdin
    Run {
        /// Switch to this mode on start (semi-auto or autopilot)
        #[arg(long)]
        mode: Option<Mode>,
    },
    /// Manage tasks
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Queue a branch and merge it into the integration branch
    Merge {
        branch: String,
        /// 0 (highest) to 4
        #[arg(short, long)]
        priority: Option<u8>,
    },
    /// Manage checkpoints
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// Create a task and print its id
    Add {
        title: String,
        #[arg(short, long)]
        description: Option<String>,
        /// 0 (highest) to 4
        #[arg(short, long)]
        priority: Option<u8>,
        #[arg(short = 't', long = "type", value_enum, default_value_t = Kind::Task)]
        kind: Kind,
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Task that must be done first (repeatable)
        #[arg(long = "after")]
        dependencies: Vec<String>,
    },
    /// List tasks
    List {
        #[arg(long, value_enum)]
        status: Option<StatusFilter>,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// Tag the current HEAD
    Create,
    /// List checkpoints, oldest first
    List,
    /// Hard-reset to a checkpoint and reopen the tasks it undoes
    Restore { id: String },
    /// Delete old checkpoints
    Prune {
        /// How many to keep (defaults to checkpoint.keep)
        #[arg(long)]
        keep: Option<usize>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Kind {
    Task,
    Bug,
    Feature,
    Chore,
}

impl From<Kind> for TaskType {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Task => TaskType::Task,
            Kind::Bug => TaskType::Bug,
            Kind::Feature => TaskType::Feature,
            Kind::Chore => TaskType::Chore,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum StatusFilter {
    Todo,
    Doing,
    Done,
    Failed,
    Ready,
}

impl From<StatusFilter> for TaskFilter {
    fn from(filter: StatusFilter) -> Self {
        match filter {
            StatusFilter::Todo => TaskFilter::Status(TaskStatus::Todo),
            StatusFilter::Doing => TaskFilter::Status(TaskStatus::Doing),
            StatusFilter::Done => TaskFilter::Status(TaskStatus::Done),
            StatusFilter::Failed => TaskFilter::Status(TaskStatus::Failed),
            StatusFilter::Ready => TaskFilter::Ready,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ChorusConfig::load(&commands::resolve(&cli.repo, &cli.config)).await?;
    let workspace = Workspace::new(cli.repo, config);

    match cli.command {
        Commands::Run { mode } => workspace.run(mode).await?,
        Commands::Task { action } => match action {
            TaskAction::Add {
                title,
                description,
                priority,
                kind,
                tags,
                dependencies,
            } => {
                let mut task = NewTask::new(title)
                    .with_type(kind.into())
                    .with_tags(tags)
                    .with_dependencies(dependencies);
                if let Some(description) = description {
                    task = task.with_description(description);
                }
                if let Some(priority) = priority {
                    task = task.with_priority(priority);
                }
                workspace.task_add(task).await?;
            }
            TaskAction::List { status } => workspace.task_list(status.map(Into::into)).await?,
        },
        Commands::Merge { branch, priority } => workspace.merge(&branch, priority).await?,
        Commands::Checkpoint { action } => match action {
            CheckpointAction::Create => workspace.checkpoint_create().await?,
            CheckpointAction::List => workspace.checkpoint_list().await?,
            CheckpointAction::Restore { id } => workspace.checkpoint_restore(&id).await?,
            CheckpointAction::Prune { keep } => workspace.checkpoint_prune(keep).await?,
        },
    }

    Ok(())
}
