use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use clap::Parser;
use log::{info, warn};
use tokio::sync::broadcast::{self, error::TryRecvError};

use durafetch::settings::{default_config_dir, SETTINGS_FILE_NAME};
use durafetch::{DurationFetchSettings, DurationFetcher, FetchEvent, FetchPriority, PlaylistItem};

const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Resolve media durations in the background and print them as they arrive
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Local paths, file:// URLs, YouTube or Bilibili links
    #[arg(value_name = "FILE_OR_URL")]
    items: Vec<String>,

    /// Directory holding settings, cache and cookies
    #[arg(short = 'c', long = "config-dir", value_name = "DIR")]
    config_dir: Option<PathBuf>,

    /// Priority for the whole batch: low, normal, high or urgent
    #[arg(short = 'p', long = "priority", value_name = "LEVEL", default_value = "normal", value_parser = parse_priority)]
    priority: FetchPriority,

    /// Override the worker thread count
    #[arg(short = 'w', long = "workers", value_name = "N")]
    workers: Option<usize>,

    /// Override the per-fetch timeout in seconds
    #[arg(short = 't', long = "timeout", value_name = "SECS")]
    timeout: Option<u64>,

    /// Clear the duration cache before fetching
    #[arg(long = "clear-cache")]
    clear_cache: bool,

    /// Print cache and fetch statistics as JSON when done
    #[arg(long = "stats")]
    stats: bool,

    /// Write the effective settings back to the config directory
    #[arg(long = "save-settings")]
    save_settings: bool,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_priority(value: &str) -> Result<FetchPriority, String> {
    match value.to_ascii_lowercase().as_str() {
        "low" => Ok(FetchPriority::Low),
        "normal" => Ok(FetchPriority::Normal),
        "high" => Ok(FetchPriority::High),
        "urgent" => Ok(FetchPriority::Urgent),
        other => Err(format!("unknown priority '{other}'")),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut clog = colog::default_builder();
    clog.filter(
        None,
        match args.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        },
    );
    clog.init();

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{}': {}", thread_name, panic_info);
    }));

    let config_dir = args.config_dir.clone().unwrap_or_else(default_config_dir);
    let settings_path = config_dir.join(SETTINGS_FILE_NAME);
    let mut settings = DurationFetchSettings::load(&settings_path);
    if let Some(workers) = args.workers {
        settings.worker_thread_count = workers;
    }
    if let Some(timeout) = args.timeout {
        settings.fetch_timeout = timeout;
    }
    let settings = settings.sanitized();
    if args.save_settings {
        settings.persist(&settings_path)?;
        info!("Settings written to {}", settings_path.display());
    }

    let (bus_sender, mut bus_receiver) = broadcast::channel::<FetchEvent>(4096);
    let fetcher = DurationFetcher::new(&config_dir, settings, bus_sender);
    if args.clear_cache {
        fetcher.clear_cache();
    }

    let items: Vec<(usize, PlaylistItem)> = args
        .items
        .iter()
        .enumerate()
        .map(|(index, reference)| (index, PlaylistItem::from_reference(reference)))
        .collect();
    let outcome = fetcher.enqueue(items, args.priority, None);
    info!(
        "Queued {} items ({} cached, {} skipped, {} truncated)",
        outcome.queued, outcome.cache_hits, outcome.skipped, outcome.truncated
    );

    let expected = outcome.queued + outcome.cache_hits;
    let mut reported = 0usize;
    let mut failures = 0usize;
    while reported < expected {
        match bus_receiver.try_recv() {
            Ok(FetchEvent::DurationReady {
                playlist_index,
                duration_secs,
                source,
            }) => {
                reported += 1;
                println!(
                    "{}\t{}\t{}",
                    args.items[playlist_index],
                    format_duration(duration_secs),
                    source
                );
            }
            Ok(FetchEvent::FetchError {
                playlist_index,
                message,
                ..
            }) => {
                reported += 1;
                failures += 1;
                println!("{}\terror\t{}", args.items[playlist_index], message);
            }
            Ok(FetchEvent::FetchProgress { completed, total }) => {
                info!("Progress {}/{}", completed, total);
            }
            Ok(FetchEvent::StatsUpdated(_)) => {}
            Err(TryRecvError::Empty) => {
                let stats = fetcher.cache_statistics().fetch_stats;
                if stats.completed + stats.failed >= outcome.queued as u64 {
                    // Terminal events may have been dropped by a lagging receiver.
                    if bus_receiver.is_empty() {
                        break;
                    }
                }
                thread::sleep(EVENT_POLL_INTERVAL);
            }
            Err(TryRecvError::Lagged(skipped)) => {
                warn!("Event receiver lagged, skipped {} events", skipped);
            }
            Err(TryRecvError::Closed) => break,
        }
    }

    fetcher.stop();
    if args.stats {
        println!(
            "{}",
            serde_json::to_string_pretty(&fetcher.cache_statistics())?
        );
    }
    if failures > 0 {
        warn!("{} of {} items failed", failures, expected);
    }
    Ok(())
}

fn format_duration(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}
