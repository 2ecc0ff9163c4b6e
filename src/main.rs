use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use warden::config::Config;
use warden::detect::detect_failure;
use warden::locator::SpecLocator;
use warden::profiles::ConfigProfileStore;
use warden::store::SpecNumberLock;
use warden::{wlog, Notification, Notifier, Orchestrator, Result};
use warden::{SpecCreationRequest, TaskExecutionRequest};

/// Warden - supervisor for autonomous coding-agent workers
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    WARDEN_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.warden/warden.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (defaults to ~/.warden/warden.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the build worker for an existing spec, printing notifications as JSON lines
    Run {
        /// Project root
        project: PathBuf,

        /// Spec id, e.g. 003-add-login
        spec: String,

        /// Task id (generated when omitted)
        #[arg(long)]
        task_id: Option<String>,

        /// Stop for plan approval before coding
        #[arg(long)]
        require_review: bool,
    },

    /// Create a new spec from a task description
    Spec {
        /// Project root
        project: PathBuf,

        /// What the task should accomplish
        description: String,

        /// Task id (generated when omitted)
        #[arg(long)]
        task_id: Option<String>,
    },

    /// Print the next free spec number for a project
    NextSpec {
        /// Project root
        project: PathBuf,
    },

    /// Classify worker output for provider failures (reads stdin without a file)
    Classify {
        file: Option<PathBuf>,

        /// Profile the output was produced under
        #[arg(long)]
        profile: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    warden::log::init(cli.debug);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let rt = tokio::runtime::Runtime::new()?;

    match cli.command {
        Command::Run {
            project,
            spec,
            task_id,
            require_review,
        } => {
            let task_id = task_id.unwrap_or_else(new_task_id);
            let mut req = TaskExecutionRequest::new(task_id, project, spec);
            req.require_review_before_coding = require_review;
            rt.block_on(supervise(config, Start::Task(req)))
        }
        Command::Spec {
            project,
            description,
            task_id,
        } => {
            let task_id = task_id.unwrap_or_else(new_task_id);
            let req = SpecCreationRequest::new(task_id, project, description);
            rt.block_on(supervise(config, Start::Spec(req)))
        }
        Command::NextSpec { project } => rt.block_on(async {
            let mut lock = SpecNumberLock::new(SpecLocator::new(&project));
            lock.acquire().await?;
            let next = lock.next_spec_number();
            lock.release().await;
            println!("{:03}", next?);
            Ok(())
        }),
        Command::Classify { file, profile } => {
            let output = match file {
                Some(path) => std::fs::read_to_string(path)?,
                None => {
                    let mut buf = String::new();
                    io::stdin().read_to_string(&mut buf)?;
                    buf
                }
            };
            let profile = profile.or(config.active_profile);
            match detect_failure(&output, profile.as_deref()) {
                Some(detection) => println!("{}", serde_json::to_string_pretty(&detection)?),
                None => println!("null"),
            }
            Ok(())
        }
    }
}

enum Start {
    Task(TaskExecutionRequest),
    Spec(SpecCreationRequest),
}

fn new_task_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Start one task and supervise it until its worker is gone for good.
async fn supervise(config: Config, start: Start) -> Result<()> {
    let profiles = Arc::new(ConfigProfileStore::from_config(&config));
    let (notifier, rx) = Notifier::channel();
    let printer = tokio::spawn(print_notifications(rx));

    let mut orchestrator = Orchestrator::new(config, profiles, notifier);
    match start {
        Start::Task(req) => {
            wlog!("starting task {} for spec {}", req.task_id, req.spec_id);
            orchestrator.start_task_execution(req).await?;
        }
        Start::Spec(req) => {
            wlog!("starting spec creation for task {}", req.task_id);
            orchestrator.start_spec_creation(req).await?;
        }
    }

    let interrupted = tokio::select! {
        _ = orchestrator.run_until_idle() => false,
        _ = tokio::signal::ctrl_c() => true,
    };
    if interrupted {
        wlog!("interrupted, stopping workers");
        orchestrator.shutdown().await;
    }

    drop(orchestrator);
    let _ = printer.await;
    Ok(())
}

async fn print_notifications(mut rx: mpsc::UnboundedReceiver<Notification>) {
    while let Some(notification) = rx.recv().await {
        match serde_json::to_string(&notification) {
            Ok(line) => println!("{}", line),
            Err(e) => eprintln!("could not serialize notification: {}", e),
        }
    }
}
