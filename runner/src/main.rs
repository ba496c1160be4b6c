mod config;
mod executors;
mod ingest;
mod queue;
mod slots;
mod sync;
mod worker;

use crate::{
    config::{ConfigErrors, RunnerConfig},
    executors::amber::AmberExecutor,
    queue::{JobId, JobQueue, QueueDocument, QueueError},
    slots::{SlotError, SlotId, SlotRegistry},
    sync::SyncError,
    worker::{Generation, Outcome, Successor, WorkerError},
};
use clap::{Parser, Subcommand};
use itertools::Itertools;
use std::{
    env, fs,
    io::{self, Write},
    path::PathBuf,
    process::ExitCode,
};
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Schedule peptide MD runs onto exclusive GPU slots, one process per job
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Directory holding the queue, the slot registry and all job directories
    #[arg(short, long, default_value = ".")]
    base: PathBuf,

    /// YAML config file, see `RunnerConfig`
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    action: Action,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Add peptide sequences to the queue
    Enqueue {
        #[arg(required = true)]
        jobs: Vec<JobId>,
    },
    /// Claim a slot and start a chain of generations on it
    Start {
        /// prompted for on stdin if missing
        #[arg(short, long)]
        slot: Option<SlotId>,
    },
    /// Run one generation on an already claimed slot
    Worker {
        #[arg(short, long)]
        slot: SlotId,
    },
    /// Release a slot, its chain stops after the job in flight
    Release {
        #[arg(short, long)]
        slot: SlotId,
    },
    /// Show all queue partitions and claimed slots
    Status,
    /// List running jobs whose slot has no chain anymore
    Reconcile {
        /// move them back to the queue
        #[arg(long)]
        requeue: bool,
    },
}

#[derive(Error, Debug)]
enum CliError {
    #[error("Failed to resolve base directory {path:?}")]
    Base {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to locate the running executable")]
    CurrentExe(#[source] io::Error),
    #[error("Failed to read the slot from stdin")]
    Prompt(#[source] io::Error),
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Slot(#[from] SlotError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

impl CliError {
    fn exit_code(&self) -> ExitCode {
        match self {
            Self::Queue(
                QueueError::InvalidJobId(_) | QueueError::EmptyBatch | QueueError::Duplicate(_),
            )
            | Self::Slot(SlotError::InvalidSlotId(_)) => ExitCode::from(2),
            _ => ExitCode::FAILURE,
        }
    }
}

/// resolved command line state shared by all actions
struct Context {
    base: PathBuf,
    config_path: Option<PathBuf>,
    config: RunnerConfig,
}

impl Context {
    fn load(cli: &Cli) -> Result<Self, CliError> {
        if matches!(cli.action, Action::Enqueue { .. }) {
            fs::create_dir_all(&cli.base).map_err(|source| CliError::Base {
                path: cli.base.clone(),
                source,
            })?;
        }

        // successors run with the base as working directory, so only absolute paths are passed on
        let base = cli.base.canonicalize().map_err(|source| CliError::Base {
            path: cli.base.clone(),
            source,
        })?;
        let config_path = match &cli.config {
            Some(path) => Some(path.canonicalize().map_err(|source| ConfigErrors::Read {
                path: path.clone(),
                source,
            })?),
            None => None,
        };
        let config = RunnerConfig::load(config_path.as_deref())?;

        Ok(Self {
            base,
            config_path,
            config,
        })
    }

    fn queue(&self) -> JobQueue {
        JobQueue::open(&self.base, self.config.queue.order)
    }

    fn registry(&self) -> SlotRegistry {
        SlotRegistry::open(&self.base)
    }

    fn successor(&self) -> Result<Successor, CliError> {
        Ok(Successor::new(
            env::current_exe().map_err(CliError::CurrentExe)?,
            self.base.clone(),
            self.config_path.clone(),
        ))
    }
}

fn prompt_slot() -> Result<SlotId, CliError> {
    print!("Please specify the gpu index for calculations: ");
    io::stdout().flush().map_err(CliError::Prompt)?;

    let mut line = String::new();
    io::stdin().read_line(&mut line).map_err(CliError::Prompt)?;

    Ok(SlotId::new(line)?)
}

fn start(context: &Context, slot: Option<SlotId>) -> Result<(), CliError> {
    // configuration problems must surface before a slot is claimed
    context.config.toolchain()?.preflight_checks()?;

    let slot = match slot {
        Some(slot) => slot,
        None => prompt_slot()?,
    };
    let registry = context.registry();

    worker::bootstrap(&registry, &slot)?;

    let spawned = context
        .successor()
        .and_then(|successor| Ok(successor.spawn(&slot)?));
    if let Err(error) = spawned {
        // no chain was started, don't leave the claim behind
        registry.release(&slot)?;

        return Err(error);
    }

    Ok(())
}

fn work(context: &Context, slot: SlotId) -> Result<(), CliError> {
    let toolchain = context.config.toolchain()?;
    toolchain.preflight_checks()?;

    match nix::unistd::gethostname() {
        Ok(host) => info!(host = ?host, slot = %slot, pid = std::process::id(), "Generation started"),
        Err(error) => warn!(error = ?error, slot = %slot, "Generation started, hostname unknown"),
    }

    let generation = Generation::new(
        context.base.clone(),
        slot,
        context.queue(),
        context.registry(),
        AmberExecutor::new(
            toolchain,
            context.config.md.nstlim,
            context.config.timeout(),
        ),
    );

    match generation.run()? {
        Outcome::Respawn => {
            context.successor()?.spawn(generation.slot())?;
        }
        Outcome::Released | Outcome::Exhausted => {}
    }

    Ok(())
}

fn status(context: &Context) -> Result<(), CliError> {
    let queue = context.queue();
    let document = match queue.snapshot() {
        Ok(document) => document,
        Err(QueueError::Sync(SyncError::DocumentNotFound(_))) => QueueDocument::default(),
        Err(error) => return Err(error.into()),
    };
    let claimed = context.registry().claimed()?;

    println!("queue document: {}", queue.path().display());
    println!(
        "queued ({}): {}",
        document.queued.len(),
        document.queued.iter().join(" ")
    );
    println!(
        "running ({}): {}",
        document.running.len(),
        document
            .running
            .iter()
            .map(|(job, slot)| format!("{job}@{slot}"))
            .join(" ")
    );
    println!("finished ({}):", document.finished.len());
    for (job, result) in document.finished.iter() {
        match result {
            Some(value) => println!("  {job}\t{value}"),
            None => println!("  {job}\t-"),
        }
    }
    println!(
        "failed ({}): {}",
        document.failed.len(),
        document
            .failed
            .iter()
            .map(|(job, slot)| format!("{job}@{slot}"))
            .join(" ")
    );
    println!("claimed slots: {}", claimed.iter().join(" "));

    Ok(())
}

fn reconcile(context: &Context, requeue: bool) -> Result<(), CliError> {
    let queue = context.queue();
    let document = queue.snapshot()?;

    // the liveness locks stay held until the requeue is written, no generation can start
    // on one of these slots in between
    let idle = context.registry().idle(document.running.values())?;
    let stale = document.stale(|slot| idle.contains_key(slot));

    if stale.is_empty() {
        println!("no stale running jobs");

        return Ok(());
    }

    for (job, slot) in stale.iter() {
        println!("{job}\trunning on slot {slot} without a live worker");
    }

    if requeue {
        let moved = queue.requeue(&stale)?;
        println!("requeued: {}", moved.iter().join(" "));
    }

    Ok(())
}

fn dispatch(cli: Cli) -> Result<(), CliError> {
    let context = Context::load(&cli)?;

    match cli.action {
        Action::Enqueue { jobs } => {
            let count = context.queue().enqueue(jobs)?;
            println!("enqueued {count} jobs");

            Ok(())
        }
        Action::Start { slot } => start(&context, slot),
        Action::Worker { slot } => work(&context, slot),
        Action::Release { slot } => Ok(context.registry().release(&slot)?),
        Action::Status => status(&context),
        Action::Reconcile { requeue } => reconcile(&context, requeue),
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    match dispatch(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(error = ?error, "{error}");

            error.exit_code()
        }
    }
}
