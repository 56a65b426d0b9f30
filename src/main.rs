//! camwatch: records camera usage sessions from availability and torch events.
//!
//! ## Subcommands
//!
//! - `monitor`: run the detector, fed from a replay file or stdin
//! - `history`: list recorded sessions
//! - `export`: write sessions to CSV
//! - `exports`: list previously written CSV files
//! - `delete`: remove one session
//! - `prune`: apply the retention policy now
//! - `config`: print or write the effective configuration

use std::{path::PathBuf, process::ExitCode, time::Duration};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};

use camwatch::{
    config::MonitoringConfig,
    db::CameraSession,
    export,
    monitor::{now_ms, FlushOutcome, MonitorController, MonitorEvent},
    pruning::PrunePolicy,
    sensing::{parse_line, ReplayLine, ReplaySource},
    App, AppPaths,
};

#[derive(Parser)]
#[command(name = "camwatch")]
#[command(about = "Camera usage session monitor")]
#[command(version)]
struct Cli {
    /// SQLite database file
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<PathBuf>,

    /// JSON configuration file
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Directory CSV exports are written to
    #[arg(long, global = true, value_name = "DIR")]
    export_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the detector. Without --events, reads events and control lines
    /// (pause, resume, flush [force], status, stop) from stdin.
    Monitor {
        /// Replay camera events from a file instead of stdin
        #[arg(long, value_name = "FILE")]
        events: Option<PathBuf>,

        /// Keep running this long after the replay ends so pending timers fire
        #[arg(long, default_value_t = 0, value_name = "MS")]
        settle_ms: u64,

        /// Export everything recorded during this run on exit
        #[arg(long)]
        collect: bool,
    },

    /// List recorded sessions, newest first
    History {
        #[arg(long)]
        json: bool,

        /// Only sessions starting at or after this epoch millisecond
        #[arg(long, value_name = "MS")]
        since: Option<i64>,
    },

    /// Write sessions to a CSV file
    Export {
        /// File name without extension; defaults to the current UTC time
        #[arg(long)]
        name: Option<String>,

        #[arg(long, default_value_t = 0, value_name = "MS")]
        since: i64,
    },

    /// List CSV files in the export directory
    Exports,

    /// Delete a recorded session
    Delete {
        #[arg(value_name = "SESSION_ID")]
        session_id: String,
    },

    /// Apply the retention policy now
    Prune,

    /// Print the effective configuration
    Config {
        /// Write it to the config path
        #[arg(long)]
        write: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    camwatch::init_logging();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("camwatch failed: {err:?}");
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let paths = AppPaths::resolve(cli.db, cli.config, cli.export_dir)?;
    let app = App::open(paths)?;

    match cli.command {
        Commands::Monitor {
            events,
            settle_ms,
            collect,
        } => run_monitor(&app, events, settle_ms, collect).await,
        Commands::History { json, since } => {
            let sessions = match since {
                Some(start) => {
                    let mut sessions = app.database().sessions_from(start).await?;
                    sessions.reverse();
                    sessions
                }
                None => app.database().list_sessions().await?,
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else if sessions.is_empty() {
                println!("No camera sessions recorded.");
            } else {
                for session in &sessions {
                    println!("{}", describe(session));
                }
            }
            Ok(())
        }
        Commands::Export { name, since } => {
            let sessions = app.database().sessions_from(since).await?;
            let name = name.unwrap_or_else(|| export::default_file_name(now_ms()));
            let path = export::export_sessions_csv(&app.paths().export_dir, &sessions, &name)?;
            println!("{}", path.display());
            Ok(())
        }
        Commands::Exports => {
            for path in export::list_exports(&app.paths().export_dir)? {
                println!("{}", path.display());
            }
            Ok(())
        }
        Commands::Delete { session_id } => {
            if !app.database().delete_session(&session_id).await? {
                bail!("no session with id {session_id}");
            }
            println!("Deleted {session_id}");
            Ok(())
        }
        Commands::Prune => {
            let report = PrunePolicy::from_config(app.monitor().config())
                .run(app.database(), now_ms())
                .await?;
            println!(
                "Removed {} expired and {} overflow session(s)",
                report.expired, report.overflow
            );
            Ok(())
        }
        Commands::Config { write } => {
            let config: &MonitoringConfig = app.monitor().config();
            if write {
                config.save(&app.paths().config_path)?;
                println!("Wrote {}", app.paths().config_path.display());
            }
            println!("{}", serde_json::to_string_pretty(config)?);
            Ok(())
        }
    }
}

async fn run_monitor(
    app: &App,
    events: Option<PathBuf>,
    settle_ms: u64,
    collect: bool,
) -> Result<()> {
    let replay = match events {
        Some(path) => {
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?;
            Some((path.display().to_string(), file))
        }
        None => None,
    };

    let monitor = app.monitor();
    let started_at = now_ms();
    monitor.start_monitoring().await?;
    let printer = tokio::spawn(print_events(monitor.subscribe()));

    let result = match replay {
        Some((name, file)) => {
            let attached = monitor
                .attach_source(&name, |sink, cancel| {
                    ReplaySource::new(name.clone(), BufReader::new(file)).run(sink, cancel)
                })
                .await;

            if let Err(err) = attached {
                Err(err)
            } else {
                tokio::select! {
                    _ = monitor.wait_for_sources() => {
                        tokio::time::sleep(Duration::from_millis(settle_ms)).await;
                        Ok(())
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("Interrupted");
                        Ok(())
                    }
                }
            }
        }
        None => tokio::select! {
            result = drive_from_stdin(monitor) => result,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                Ok(())
            }
        },
    };

    let outcome = monitor.stop().await;
    printer.abort();
    report_outcome("stop", &outcome?);

    if collect {
        if let Some(path) = app.collect_since(started_at).await? {
            println!("{}", path.display());
        }
    }
    result
}

async fn drive_from_stdin(monitor: &MonitorController) -> Result<()> {
    let sink = monitor.event_sink().await?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        let mut words = trimmed.split_whitespace();
        match words.next() {
            Some("pause") => report_outcome("pause", &monitor.pause().await?),
            Some("resume") => {
                let snapshot = monitor.resume().await?;
                println!("{}", serde_json::to_string(&snapshot)?);
            }
            Some("flush") => {
                let force = words.next() == Some("force");
                report_outcome("flush", &monitor.flush(force).await?);
            }
            Some("status") => {
                let snapshot = monitor.snapshot().await?;
                println!("{}", serde_json::to_string(&snapshot)?);
            }
            Some("stop") | Some("quit") => break,
            _ => match parse_line(trimmed) {
                Ok(Some(ReplayLine::Event(event))) => {
                    if !sink.deliver(event) {
                        warn!("Monitor no longer accepts events");
                        break;
                    }
                }
                Ok(Some(ReplayLine::Sleep(duration))) => tokio::time::sleep(duration).await,
                Ok(None) => {}
                Err(err) => eprintln!("ignored: {err}"),
            },
        }
    }
    Ok(())
}

async fn print_events(mut rx: tokio::sync::broadcast::Receiver<MonitorEvent>) {
    use tokio::sync::broadcast::error::RecvError;

    loop {
        match rx.recv().await {
            Ok(MonitorEvent::SessionCompleted(session)) => {
                println!("completed {}", describe(&session))
            }
            Ok(MonitorEvent::SessionStarted(session)) => {
                println!("started {}", session.session_id)
            }
            Ok(MonitorEvent::SessionDiscarded(session)) => {
                println!("discarded {}", session.session_id)
            }
            Ok(MonitorEvent::Message(message)) => println!("{message}"),
            Ok(MonitorEvent::StateChanged(_)) => {}
            Err(RecvError::Lagged(skipped)) => warn!("Dropped {skipped} monitor events"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn report_outcome(command: &str, outcome: &FlushOutcome) {
    match outcome {
        FlushOutcome::NoSession => println!("{command}: no open session"),
        FlushOutcome::Completed(session) => {
            println!("{command}: saved {}", describe(session))
        }
        FlushOutcome::Discarded(session) => {
            println!("{command}: discarded {}", session.session_id)
        }
    }
}

fn describe(session: &CameraSession) -> String {
    let start = DateTime::<Utc>::from_timestamp_millis(session.start_timestamp)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| session.start_timestamp.to_string());
    let duration = session
        .duration_ms
        .map(|ms| format!("{ms} ms"))
        .unwrap_or_else(|| "open".to_string());
    let cameras = session
        .camera_ids
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(",");

    format!(
        "{} {} {} [{}] {}{}",
        session.session_id,
        start,
        duration,
        cameras,
        session.front_rear_hint.as_str(),
        if session.torch_overlap { " torch" } else { "" }
    )
}
