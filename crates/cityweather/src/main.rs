//! # cityweather CLI
//!
//! Front end over [`CityWeatherService`]. Every command prints JSON on
//! stdout; logs go to stderr.
//!
//! ```bash
//! cityweather import cities.csv --wait
//! cityweather status <job-id>
//! cityweather results <job-id> --limit 50
//! cityweather weather "São Paulo"
//! ```

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::{debug, info, warn};

use cityweather::logging::{init_logging, LogFormat};
use cityweather::status::DEFAULT_PAGE_LIMIT;
use cityweather::{load_config, CityWeatherService, Config, JobEventKind};

const STATUS_POLL: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(
    name = "cityweather",
    about = "City weather lookups and bulk CSV refresh jobs",
    version
)]
struct Cli {
    /// Path to the JSON config file. Defaults apply when omitted.
    #[arg(long, global = true, env = "CITYWEATHER_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format: `plain` or `json`.
    #[arg(long, global = true, default_value = "plain")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a CSV of city names (one per line, `-` for stdin).
    Import {
        csv: PathBuf,

        /// Block until the job finishes and print its final status.
        /// Without it the whole file is still read and queued before exit;
        /// tasks still pending then run on the next start.
        #[arg(long)]
        wait: bool,
    },

    /// Show a job's progress counters.
    Status { job_id: String },

    /// List a job's per-city results, ordered by city name.
    Results {
        job_id: String,

        #[arg(long, default_value_t = DEFAULT_PAGE_LIMIT)]
        limit: u32,

        /// Cursor from a previous page's `nextCursor`.
        #[arg(long)]
        cursor: Option<String>,
    },

    /// Current weather for one city, served from cache when fresh.
    Weather { city: String },

    /// Recently refreshed cities, newest first.
    Recent {
        #[arg(long, default_value_t = DEFAULT_PAGE_LIMIT)]
        limit: u32,

        #[arg(long)]
        cursor: Option<String>,
    },

    /// Request cancellation of an unfinished job.
    Cancel { job_id: String },
}

type CliResult<T> = std::result::Result<T, Box<dyn std::error::Error>>;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> CliResult<()> {
    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };
    let service = CityWeatherService::open(&config)?;

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        ctrlc::set_handler(move || {
            // A second Ctrl-C skips the graceful drain.
            if interrupted.swap(true, Ordering::SeqCst) {
                std::process::exit(130);
            }
        })?;
    }

    match cli.command {
        Commands::Import { csv, wait } => {
            let reader = open_input(&csv)?;
            let events = service.subscribe();
            let job_id = service.start_import(reader)?;
            info!(%job_id, "Import started");
            if wait {
                follow_job(&service, &job_id, events, &interrupted)?;
                print_json(&service.get_job_status(&job_id)?)?;
            } else {
                print_json(&serde_json::json!({ "jobId": job_id }))?;
            }
        }
        Commands::Status { job_id } => print_json(&service.get_job_status(&job_id)?)?,
        Commands::Results {
            job_id,
            limit,
            cursor,
        } => print_json(&service.get_job_results(&job_id, limit, cursor.as_deref())?)?,
        Commands::Weather { city } => print_json(&service.get_cached_weather(&city)?)?,
        Commands::Recent { limit, cursor } => {
            print_json(&service.recently_refreshed(limit, cursor.as_deref())?)?
        }
        Commands::Cancel { job_id } => {
            let cancelled = service.cancel_job(&job_id)?;
            print_json(&serde_json::json!({ "jobId": job_id, "cancelled": cancelled }))?;
        }
    }

    service.shutdown();
    Ok(())
}

fn open_input(path: &Path) -> CliResult<Box<dyn Read + Send>> {
    if path.as_os_str() == "-" {
        return Ok(Box::new(std::io::stdin()));
    }
    let file = File::open(path).map_err(|e| format!("cannot open '{}': {}", path.display(), e))?;
    Ok(Box::new(BufReader::new(file)))
}

/// Waits for the job's terminal event, falling back to polling the job
/// record when events were missed.
fn follow_job(
    service: &CityWeatherService,
    job_id: &str,
    mut events: tokio::sync::broadcast::Receiver<cityweather::JobProgressEvent>,
    interrupted: &AtomicBool,
) -> CliResult<()> {
    let mut last_poll = Instant::now();
    loop {
        if interrupted.load(Ordering::SeqCst) {
            warn!(
                %job_id,
                "Interrupted; finishing ingestion, remaining tasks resume on next start"
            );
            return Ok(());
        }

        match events.try_recv() {
            Ok(event) if event.job_id == job_id => {
                if let JobEventKind::TaskFinished {
                    processed, total, ..
                } = &event.kind
                {
                    debug!(processed, total, "Progress");
                }
                if event.kind.is_terminal() {
                    return Ok(());
                }
                continue;
            }
            Ok(_) => continue,
            Err(TryRecvError::Lagged(skipped)) => {
                debug!(skipped, "Missed progress events");
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => {
                std::thread::sleep(Duration::from_millis(20));
            }
        }

        if last_poll.elapsed() >= STATUS_POLL {
            last_poll = Instant::now();
            if service.get_job_status(job_id)?.status.is_finished() {
                return Ok(());
            }
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
