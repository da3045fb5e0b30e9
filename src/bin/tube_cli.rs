//! Command-line front end: download, inspect and process videos, schedule
//! recurring downloads and edit `config.json`.

use std::{path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::Value;
use tokio::{signal, task};
use tracing::{error, info};
use tube_automator::{
    config::{ConfigStore, Settings},
    downloader::Downloader,
    files,
    logging::{self, LogOptions},
    processor::{
        DEFAULT_FORMAT, DEFAULT_TIME_OFFSET, MediaProcessor, Operation, ProcessOptions,
        ProcessOutcome, Tier,
    },
    scheduler::{TaskOptions, TaskScheduler},
};

const DOWNLOAD_EXTENSION: &str = ".mp4";

#[derive(Parser, Debug)]
#[command(
    name = "tube_cli",
    author,
    version,
    about = "Download, process and schedule online videos."
)]
struct Cli {
    #[arg(
        long = "config",
        value_name = "PATH",
        help = "Path to the config file (default ./config.json)"
    )]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Download a video into the download directory
    Download {
        url: String,
        #[arg(short = 'q', long = "quality", help = "Quality or format id")]
        quality: Option<String>,
    },
    /// Show title, author, duration and views
    Info { url: String },
    /// Process a downloaded video
    Process {
        filename: String,
        #[arg(
            short = 'o',
            long = "operation",
            default_value = "convert",
            help = "convert|compress|thumbnail|metadata"
        )]
        operation: String,
        #[arg(short = 'f', long = "format", default_value = DEFAULT_FORMAT, help = "Output format for conversion")]
        format: String,
        #[arg(
            short = 'q',
            long = "quality",
            default_value = "medium",
            help = "Conversion quality (low|medium|high)"
        )]
        quality: String,
        #[arg(
            short = 'l',
            long = "level",
            default_value = "medium",
            help = "Compression level (low|medium|high)"
        )]
        level: String,
        #[arg(short = 't', long = "time", default_value = DEFAULT_TIME_OFFSET, help = "Thumbnail time offset")]
        time_offset: String,
    },
    /// List downloaded files
    List,
    /// Schedule a recurring download and keep running until Ctrl+C
    Schedule {
        url: String,
        cron: String,
        #[arg(short = 'q', long = "quality", help = "Quality or format id")]
        quality: Option<String>,
    },
    /// List the tasks of a running server
    Tasks,
    /// Print a dotted config key, or set it when a value is given
    Config { key: String, value: Option<String> },
}

impl Commands {
    fn action(&self) -> &'static str {
        match self {
            Commands::Download { .. } => "Download",
            Commands::Info { .. } => "Info",
            Commands::Process { .. } => "Processing",
            Commands::List => "Listing files",
            Commands::Schedule { .. } => "Scheduling",
            Commands::Tasks => "Listing tasks",
            Commands::Config { .. } => "Config",
        }
    }
}

/// The fields of a server task snapshot the listing prints.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskSummary {
    id: u64,
    url: String,
    schedule: String,
    status: String,
    last_run: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut store = match &cli.config {
        Some(path) => ConfigStore::load(path),
        None => ConfigStore::load_default(),
    };
    let settings = store.settings();

    if let Err(err) = logging::init(&LogOptions {
        directory: settings.logging.directory.clone(),
        level: settings.logging.level.clone(),
        console: false,
    }) {
        eprintln!("File logging disabled: {err:#}");
    }

    let action = cli.command.action();
    match run(cli.command, &mut store, &settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{action} failed: {err:#}");
            error!("{action} failed: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands, store: &mut ConfigStore, settings: &Settings) -> Result<()> {
    match command {
        Commands::Download { url, quality } => {
            let quality = quality.unwrap_or_else(|| settings.downloads.default_quality.clone());
            let downloader = Downloader::from_settings(&settings.downloads);
            info!(%url, %quality, "starting download");
            let result = downloader.download(&url, &quality).await?;
            println!("Downloaded: {}", result.filename);
            info!(filename = %result.filename, "download completed");
        }
        Commands::Info { url } => {
            let downloader = Downloader::from_settings(&settings.downloads);
            let info = downloader.get_info(&url).await?;
            println!();
            println!("Video Information:");
            println!("Title: {}", info.title);
            println!("Author: {}", info.author);
            println!("Duration: {}", format_duration(info.duration));
            println!(
                "Views: {}",
                info.view_count
                    .map(format_thousands)
                    .unwrap_or_else(|| "N/A".to_owned())
            );
        }
        Commands::Process {
            filename,
            operation,
            format,
            quality,
            level,
            time_offset,
        } => {
            let operation: Operation = operation.parse()?;
            let processor = MediaProcessor::from_settings(&settings.processing);
            let input = settings.downloads.directory.join(&filename);
            let options = ProcessOptions {
                format,
                quality: Tier::parse_lenient(&quality),
                level: Tier::parse_lenient(&level),
                time_offset,
            };

            match processor.run(&input, operation, &options).await? {
                ProcessOutcome::File(result) => {
                    println!("Processing completed: {}", result.filename)
                }
                ProcessOutcome::Metadata(metadata) => {
                    println!("{}", serde_json::to_string_pretty(&metadata)?)
                }
            }
        }
        Commands::List => {
            let entries = files::list_with_stats(&settings.downloads.directory, Some(DOWNLOAD_EXTENSION));
            if entries.is_empty() {
                println!("No downloaded files found.");
                return Ok(());
            }

            println!();
            println!("Downloaded Files:");
            for entry in entries {
                let size = entry
                    .stats
                    .map(|stats| stats.size)
                    .unwrap_or_else(|| "Unknown size".to_owned());
                println!("  {} ({size})", entry.name);
            }
        }
        Commands::Schedule { url, cron, quality } => {
            let quality = quality.unwrap_or_else(|| settings.downloads.default_quality.clone());
            let downloader = Arc::new(Downloader::from_settings(&settings.downloads));
            let scheduler =
                TaskScheduler::new(downloader, settings.scheduler.max_concurrent_tasks).await?;

            let id = scheduler
                .create_task(&url, &cron, TaskOptions { quality }, true)
                .await?
                .id;
            println!("Task scheduled with ID: {id}");
            println!("Schedule: {cron}");
            println!("Press Ctrl+C to stop.");
            info!(task = id, %url, schedule = %cron, "task scheduled");

            signal::ctrl_c()
                .await
                .context("waiting for Ctrl+C")?;
            scheduler.shutdown().await?;
        }
        Commands::Tasks => {
            let url = format!(
                "http://{}:{}/tasks",
                settings.server.host, settings.server.port
            );
            let tasks = task::spawn_blocking(move || fetch_tasks(&url))
                .await
                .context("task listing panicked")??;

            if tasks.is_empty() {
                println!("No scheduled tasks found.");
                return Ok(());
            }

            println!();
            println!("Scheduled Tasks:");
            for task in tasks {
                println!(
                    "  ID: {} | Status: {} | Schedule: {}",
                    task.id, task.status, task.schedule
                );
                println!("     URL: {}", task.url);
                if let Some(last_run) = task.last_run {
                    println!("     Last run: {last_run}");
                }
                println!();
            }
        }
        Commands::Config { key, value } => match value {
            None => match store.get(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(value)?),
                None => bail!("{key} is not set"),
            },
            Some(raw) => {
                store.set(&key, parse_config_value(raw));
                println!("Updated {key} in {}", store.path().display());
            }
        },
    }
    Ok(())
}

fn fetch_tasks(url: &str) -> Result<Vec<TaskSummary>> {
    let response = ureq::get(url)
        .call()
        .with_context(|| format!("querying {url}"))?;
    response
        .into_json::<Vec<TaskSummary>>()
        .context("decoding task list")
}

/// JSON when the text parses as JSON, otherwise the text itself.
fn parse_config_value(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or(Value::String(raw))
}

/// `m:ss`, minutes unbounded.
fn format_duration(seconds: i64) -> String {
    let seconds = seconds.max(0);
    format!("{}:{:02}", seconds / 60, seconds % 60)
}

fn format_thousands(value: i64) -> String {
    let digits = value.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (index, ch) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    if value < 0 {
        grouped.insert(0, '-');
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn process_defaults_match_processor_defaults() {
        let cli = Cli::try_parse_from(["tube_cli", "process", "clip.mp4"]).unwrap();
        match cli.command {
            Commands::Process {
                filename,
                operation,
                format,
                level,
                time_offset,
                ..
            } => {
                assert_eq!(filename, "clip.mp4");
                assert_eq!(operation, "convert");
                assert_eq!(format, "mp4");
                assert_eq!(level, "medium");
                assert_eq!(time_offset, "00:00:05");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn schedule_takes_url_and_cron() {
        let cli = Cli::try_parse_from([
            "tube_cli",
            "schedule",
            "https://example.com/v",
            "0 2 * * *",
            "-q",
            "lowest",
        ])
        .unwrap();
        assert_eq!(cli.command.action(), "Scheduling");
        match cli.command {
            Commands::Schedule { cron, quality, .. } => {
                assert_eq!(cron, "0 2 * * *");
                assert_eq!(quality.as_deref(), Some("lowest"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn durations_render_as_minutes_and_seconds() {
        assert_eq!(format_duration(0), "0:00");
        assert_eq!(format_duration(212), "3:32");
        assert_eq!(format_duration(3725), "62:05");
    }

    #[test]
    fn view_counts_get_separators() {
        assert_eq!(format_thousands(0), "0");
        assert_eq!(format_thousands(999), "999");
        assert_eq!(format_thousands(1000), "1,000");
        assert_eq!(format_thousands(1234567), "1,234,567");
        assert_eq!(format_thousands(-12345), "-12,345");
    }

    #[test]
    fn config_values_prefer_json() {
        assert_eq!(parse_config_value("3000".into()), Value::from(3000));
        assert_eq!(parse_config_value("true".into()), Value::Bool(true));
        assert_eq!(
            parse_config_value("[\"mp4\"]".into()),
            serde_json::json!(["mp4"])
        );
        assert_eq!(parse_config_value("0.0.0.0".into()), Value::from("0.0.0.0"));
    }
}
