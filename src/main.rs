use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::sync::Arc;
use std::time::Duration;
use std::{fmt::Debug, path::PathBuf};
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use formjobs::config::{AppConfig, CliConfig, FileConfig};
use formjobs::{
    CompletionHeuristic, HttpRemoteJobClient, Job, JobController, JobKind, LoggingListener,
    Poller, SqliteJobStore,
};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

fn parse_options(s: &str) -> Result<serde_json::Value> {
    let value: serde_json::Value =
        serde_json::from_str(s).with_context(|| format!("Invalid options JSON: {}", s))?;
    if !value.is_object() {
        bail!("Options must be a JSON object");
    }
    Ok(value)
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Single,
    Batch,
}

impl From<KindArg> for JobKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Single => JobKind::Single,
            KindArg::Batch => JobKind::Batch,
        }
    }
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to a TOML config file. Values in the file override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory holding the jobs database.
    #[clap(long, value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// Base URL of the automation service.
    #[clap(long)]
    pub remote_url: Option<String>,

    /// Timeout in seconds for automation service requests.
    #[clap(long, default_value_t = 30)]
    pub remote_timeout_sec: u64,

    /// Operator whose jobs are managed.
    #[clap(long)]
    pub owner: Option<String>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll every running job until interrupted.
    Watch {
        /// Interval in hours between stale-job pruning runs. 0 disables it.
        #[clap(long, default_value_t = 1)]
        prune_interval_hours: u64,
    },
    /// Start a single-item job and follow it until it ends.
    StartSingle {
        url: String,
        #[clap(long, value_parser = parse_options, default_value = "{}")]
        options: serde_json::Value,
    },
    /// Start a batch job and follow it until it ends.
    StartBatch {
        item_ids: Vec<String>,
        #[clap(long, value_parser = parse_options, default_value = "{}")]
        options: serde_json::Value,
        /// Continue from where this earlier batch job stopped.
        #[clap(long)]
        resume_from: Option<String>,
    },
    Pause {
        job_id: String,
        #[clap(long)]
        reason: Option<String>,
    },
    Resume {
        job_id: String,
    },
    Cancel {
        job_id: String,
    },
    /// Delete every job of one kind for the owner.
    ClearHistory {
        #[clap(value_enum)]
        kind: KindArg,
    },
    /// Print the owner's jobs as JSON lines.
    List {
        #[clap(long, value_enum)]
        kind: Option<KindArg>,
    },
}

fn print_job(job: &Job) -> Result<()> {
    println!("{}", serde_json::to_string(job)?);
    Ok(())
}

/// Wait until no loop is left polling or the process is interrupted.
async fn follow(controller: &JobController) -> Result<()> {
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for ctrl-c")?;
                info!("Interrupted, leaving jobs running on the automation service");
                return Ok(());
            }
            _ = ticker.tick() => {
                if controller.poller().active_loops() == 0 {
                    return Ok(());
                }
            }
        }
    }
}

async fn watch(controller: &JobController, owner_id: &str, prune_interval_hours: u64) -> Result<()> {
    info!("Watching jobs of {}, press ctrl-c to stop", owner_id);
    let prune_every = Duration::from_secs(prune_interval_hours.max(1) * 60 * 60);
    let mut ticker = tokio::time::interval(prune_every);
    // Skip the first immediate tick, reconcile already pruned
    ticker.tick().await;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for ctrl-c")?;
                info!("Interrupted, stopping all polling loops");
                return Ok(());
            }
            _ = ticker.tick(), if prune_interval_hours > 0 => {
                match controller.jobs(None) {
                    Ok(jobs) => info!("{} jobs stored for {} after pruning", jobs.len(), owner_id),
                    Err(e) => error!("Failed to prune stale jobs: {}", e),
                }
            }
        }
    }
}

async fn run_command(controller: &JobController, owner_id: &str, command: Command) -> Result<()> {
    match command {
        Command::Watch {
            prune_interval_hours,
        } => watch(controller, owner_id, prune_interval_hours).await?,
        Command::StartSingle { url, options } => {
            let job = controller.start_single(&url, options).await?;
            print_job(&job)?;
            follow(controller).await?;
        }
        Command::StartBatch {
            item_ids,
            options,
            resume_from,
        } => {
            let job = controller
                .start_batch(item_ids, options, resume_from.as_deref())
                .await?;
            print_job(&job)?;
            follow(controller).await?;
        }
        Command::Pause { job_id, reason } => print_job(&controller.pause(&job_id, reason).await?)?,
        Command::Resume { job_id } => print_job(&controller.resume(&job_id).await?)?,
        Command::Cancel { job_id } => print_job(&controller.cancel(&job_id).await?)?,
        Command::ClearHistory { kind } => {
            let deleted = controller.clear_history(owner_id, kind.into()).await?;
            println!("{}", deleted);
        }
        Command::List { kind } => {
            for job in controller.jobs(kind.map(JobKind::from))? {
                print_job(&job)?;
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()?;

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading config from {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let cli_config = CliConfig {
        db_dir: cli_args.db_dir.clone(),
        remote_url: cli_args.remote_url.clone(),
        remote_timeout_sec: cli_args.remote_timeout_sec,
        owner_id: cli_args.owner.clone(),
    };
    let config = AppConfig::resolve(&cli_config, file_config)?;
    let owner_id = config
        .owner_id
        .clone()
        .context("owner must be specified via --owner or in config file")?;

    info!("Opening jobs database at {:?}...", config.jobs_db_path());
    let store = Arc::new(SqliteJobStore::new(config.jobs_db_path(), &config.store)?);

    info!("Automation service configured at {}", config.remote_url);
    let remote = Arc::new(HttpRemoteJobClient::new(
        config.remote_url.clone(),
        config.remote_timeout_sec,
    )?);

    let heuristic = CompletionHeuristic::new(&config.heuristic)?;
    let poller = Arc::new(Poller::new(
        store.clone(),
        remote.clone(),
        heuristic,
        config.poller.clone(),
    ));
    let controller = JobController::new(store, remote, poller, Arc::new(LoggingListener));

    controller.reconcile_on_startup(&owner_id)?;
    let result = run_command(&controller, &owner_id, cli_args.command).await;
    controller.shutdown();
    result
}
