//! CLI entry point for stopmo-xcode
//!
//! Loads the configuration, installs logging and dispatches to one of the subcommands.

use std::error::Error;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use stopmo_xcode::config::{ensure_dirs, Config};
use stopmo_xcode::{
    convert_dpx_sequences, run_worker_loop, status_snapshot, transcode_one, Daemon,
    DecoderRegistry, FfmpegAssembler, JobProcessor, JobStore, StopFlag,
};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

type CliResult = Result<(), Box<dyn Error + Send + Sync>>;

/// Stop-motion RAW ingest to LogC3/AWG DPX
#[derive(Parser, Debug)]
#[command(name = "stopmo-xcode")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch the source tree and process frames until interrupted
    Watch {
        /// Skip startup checks (directories, ffmpeg availability)
        #[arg(long, default_value = "false")]
        skip_checks: bool,
    },

    /// Run a single claim-loop worker against the shared queue
    Worker {
        /// Worker id recorded on leased jobs
        #[arg(long)]
        id: String,
    },

    /// Process one RAW file immediately and print the DPX path
    TranscodeOne {
        input: PathBuf,

        /// Write outputs here instead of the configured output directory
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },

    /// Print queue counts and the most recent jobs
    Status {
        #[arg(long, default_value_t = 20)]
        limit: usize,

        /// Emit the snapshot as JSON
        #[arg(long)]
        json: bool,
    },

    /// Convert existing */dpx/*.dpx sequences to ProRes 4444 movies
    ConvertDpx {
        input_root: PathBuf,

        /// Flat output directory (default: <input_root>/PRORES)
        #[arg(long)]
        out_dir: Option<PathBuf>,

        /// Override the configured frame rate
        #[arg(long)]
        framerate: Option<u32>,

        /// Skip sequences whose movie already exists
        #[arg(long)]
        no_overwrite: bool,
    },
}

/// Install the fmt subscriber; `RUST_LOG` wins over the configured level.
fn init_logging(config: &Config) -> CliResult {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let file_layer = match &config.logging.file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .try_init()?;
    Ok(())
}

/// Raise `stop` on Ctrl-C
fn stop_on_ctrl_c(stop: StopFlag) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping");
            stop.stop();
        }
    });
}

async fn watch(config: Config, skip_checks: bool) -> CliResult {
    let decoder = Arc::new(DecoderRegistry::new());
    let assembler = Arc::new(FfmpegAssembler::default());
    let daemon = if skip_checks {
        warn!("skipping startup checks (--skip-checks enabled)");
        ensure_dirs(&config)?;
        Daemon::new_without_checks(config, decoder, assembler)?
    } else {
        Daemon::new(config, decoder, assembler)?
    };
    info!(
        "watch service initialized with {} workers ({} cores)",
        daemon.plan().workers,
        daemon.plan().total_cores
    );

    let stop = StopFlag::new();
    stop_on_ctrl_c(stop.clone());
    let summary = daemon.run(stop).await?;
    if summary.workers_abandoned > 0 {
        warn!("{} workers did not stop in time", summary.workers_abandoned);
    }
    Ok(())
}

async fn worker(config: Config, id: String) -> CliResult {
    ensure_dirs(&config)?;
    let config = Arc::new(config);
    let processor = JobProcessor::new(config.clone(), Arc::new(DecoderRegistry::new()))?;
    let store = JobStore::open(&config.watch.db_path)?;

    let stop = StopFlag::new();
    stop_on_ctrl_c(stop.clone());
    tokio::task::spawn_blocking(move || run_worker_loop(&store, &processor, &id, &stop)).await?;
    Ok(())
}

fn status(config: &Config, limit: usize, json: bool) -> CliResult {
    let store = JobStore::open(&config.watch.db_path)?;
    let snapshot = status_snapshot(&store, limit)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    println!("queue {}", config.watch.db_path.display());
    for (state, count) in &snapshot.counts {
        println!("  {:<10} {}", state, count);
    }
    if !snapshot.recent_jobs.is_empty() {
        println!("recent jobs:");
    }
    for job in &snapshot.recent_jobs {
        println!(
            "  #{:<5} {:<10} {:<16} {:>5}  {}{}",
            job.id,
            job.state,
            job.shot_name,
            job.frame_number,
            job.source_path.display(),
            job.last_error
                .as_deref()
                .map(|e| format!("  ({})", e))
                .unwrap_or_default()
        );
    }
    Ok(())
}

async fn convert_dpx(
    config: Config,
    input_root: PathBuf,
    out_dir: Option<PathBuf>,
    framerate: Option<u32>,
    overwrite: bool,
) -> CliResult {
    let framerate = framerate.unwrap_or(config.output.framerate);
    let stop = StopFlag::new();
    stop_on_ctrl_c(stop.clone());

    let outputs = tokio::task::spawn_blocking(move || {
        convert_dpx_sequences(
            &FfmpegAssembler::default(),
            &input_root,
            out_dir.as_deref(),
            framerate,
            overwrite,
            &stop,
        )
    })
    .await??;
    for out in outputs {
        println!("{}", out.display());
    }
    Ok(())
}

async fn dispatch(args: Args, config: Config) -> CliResult {
    match args.command {
        Command::Watch { skip_checks } => watch(config, skip_checks).await,
        Command::Worker { id } => worker(config, id).await,
        Command::TranscodeOne { input, out_dir } => {
            ensure_dirs(&config)?;
            let out = transcode_one(
                &config,
                Arc::new(DecoderRegistry::new()),
                &input,
                out_dir.as_deref(),
            )?;
            println!("{}", out.display());
            Ok(())
        }
        Command::Status { limit, json } => status(&config, limit, json),
        Command::ConvertDpx {
            input_root,
            out_dir,
            framerate,
            no_overwrite,
        } => convert_dpx(config, input_root, out_dir, framerate, !no_overwrite).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config {}: {}", args.config.display(), e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = init_logging(&config) {
        eprintln!("Failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    match dispatch(args, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
