use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bookforge::config::SettingsStore;
use bookforge::logging;
use bookforge::runner::{
    Collaborators, JobCoordinator, JobEvent, JobFinished, JobParams, JobStatus, JobType, SyncMode,
};
use bookforge::simulate::{SimulatedCatalog, SimulatedLibrary, SimulatedMedia};
use bookforge::store::{InMemoryJobStore, JobStore, SqliteJobStore};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Settings file
    #[arg(long, env = "BOOKFORGE_SETTINGS", default_value = "settings.json")]
    settings: PathBuf,

    /// Directory for log files
    #[arg(long, env = "BOOKFORGE_LOG_DIR", default_value = "logs")]
    log_dir: PathBuf,

    /// SQLite database URL. Jobs are kept in memory when unset.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Chapters per simulated book
    #[arg(long, default_value_t = 4)]
    chapters: usize,

    /// Simulated encode time per chapter, in milliseconds
    #[arg(long, default_value_t = 250)]
    encode_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert the given books
    Download {
        #[arg(required = true)]
        asins: Vec<String>,
    },
    /// Synchronise the library, optionally converting new books afterwards
    Sync {
        #[arg(long, default_value = "DEEP")]
        mode: SyncMode,
        /// Books the simulated sync reports as new
        #[arg(long = "new")]
        new_asins: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let (log_config, _guard) = logging::init_logging(&args.log_dir)?;
    let settings = SettingsStore::open(&args.settings).await;
    log_config.apply_settings(&settings.current().logging);
    let cleanup_cancel = CancellationToken::new();
    log_config.start_retention_cleanup(cleanup_cancel.clone());

    let store: Arc<dyn JobStore> = match &args.database_url {
        Some(url) => Arc::new(
            SqliteJobStore::connect(url)
                .await
                .with_context(|| format!("Failed to open database {}", url))?,
        ),
        None => Arc::new(InMemoryJobStore::new()),
    };
    let stale = store.fail_stale_jobs().await?;
    if stale > 0 {
        warn!(count = stale, "Marked jobs interrupted by a restart as failed");
    }

    let new_asins = match &args.command {
        Command::Sync { new_asins, .. } => new_asins.clone(),
        Command::Download { .. } => Vec::new(),
    };
    let media = SimulatedMedia::new()
        .with_chapters(args.chapters)
        .with_encode_delay(Duration::from_millis(args.encode_ms));
    let collaborators = Collaborators {
        catalog: Arc::new(SimulatedCatalog::new()),
        media: Arc::new(media),
        library: Arc::new(
            SimulatedLibrary::new()
                .with_new_asins(new_asins)
                .with_phase_delay(Duration::from_millis(200)),
        ),
        store,
    };

    let current = settings.current();
    let coordinator = JobCoordinator::new(&current.runner_config(), collaborators);
    coordinator.start();
    let follower = coordinator.follow_settings(settings.clone());

    let mut events = coordinator.subscribe_to_events();
    let (job_type, asins, params) = match args.command {
        Command::Download { asins } => (JobType::Download, asins, JobParams::new()),
        Command::Sync { mode, .. } => {
            let mut params = JobParams::new();
            params.insert("sync_mode".to_string(), mode.to_string().into());
            (JobType::Sync, Vec::new(), params)
        }
    };
    let job_id = coordinator.enqueue_job(job_type, asins, params).await?;
    info!(%job_id, "Job accepted");

    let chain = current.tasks.process_new_on_sync;
    let mut watching = Some(job_id);
    while let Some(job_id) = watching.take() {
        let finished = follow_job(&coordinator, &mut events, &job_id).await?;
        if chain && finished.job_type == JobType::Sync && finished.status == JobStatus::Completed {
            watching = next_started(&mut events, Duration::from_secs(1)).await?;
        }
    }

    coordinator.shutdown().await;
    follower.abort();
    cleanup_cancel.cancel();
    Ok(())
}

/// Print the events of `job_id` as SSE frames until it finishes. Ctrl-C
/// cancels the job and keeps waiting for its final event.
async fn follow_job(
    coordinator: &JobCoordinator,
    events: &mut broadcast::Receiver<JobEvent>,
    job_id: &str,
) -> anyhow::Result<JobFinished> {
    let mut interrupted = false;
    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                info!(%job_id, "Interrupted, cancelling job");
                interrupted = true;
                coordinator.cancel(job_id);
                continue;
            }
            event = events.recv() => event,
        };
        match event {
            Ok(event) => {
                print!("{}", event.to_sse()?);
                if let JobEvent::JobFinished(finished) = event
                    && finished.job_id == job_id
                {
                    return Ok(finished);
                }
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event stream lagged"),
            Err(RecvError::Closed) => anyhow::bail!("event stream closed"),
        }
    }
}

/// Wait for the next job to start, e.g. a DOWNLOAD chained after a SYNC.
async fn next_started(
    events: &mut broadcast::Receiver<JobEvent>,
    wait: Duration,
) -> anyhow::Result<Option<String>> {
    let next: Result<anyhow::Result<Option<String>>, _> = tokio::time::timeout(wait, async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    print!("{}", event.to_sse()?);
                    if let JobEvent::JobStarted(started) = event {
                        return Ok(Some(started.job_id));
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return Ok(None),
            }
        }
    })
    .await;
    next.unwrap_or(Ok(None))
}
