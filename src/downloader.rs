//! yt-dlp adapter: metadata lookups and single-file downloads.
//!
//! Both operations shell out to the extractor configured under
//! `downloads.extractorPath`. Failures are collapsed into a couple of fixed
//! messages for the front ends; the underlying cause only reaches the logs.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::DownloadSettings;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Failed to fetch video info")]
    Info,

    #[error("Download failed")]
    Download,

    #[error("Failed to write download: {0}")]
    Write(#[from] std::io::Error),
}

/// Metadata surfaced to callers for a remote video.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoInfo {
    pub title: String,
    pub author: String,
    /// Whole seconds.
    pub duration: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_date: Option<String>,
}

/// Where a finished download landed.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadResult {
    pub filepath: PathBuf,
    pub filename: String,
    pub title: String,
}

/// The slice of `yt-dlp --dump-single-json` we read. Everything is optional
/// because extractors other than YouTube omit fields freely.
#[derive(Debug, Deserialize)]
struct RawVideoInfo {
    id: Option<String>,
    title: Option<String>,
    fulltitle: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    duration: Option<f64>,
    view_count: Option<i64>,
    upload_date: Option<String>,
    release_timestamp: Option<i64>,
}

impl RawVideoInfo {
    fn into_video_info(self) -> VideoInfo {
        let title = self
            .fulltitle
            .filter(|t| !t.is_empty())
            .or(self.title.filter(|t| !t.is_empty()))
            .or(self.id)
            .unwrap_or_else(|| "untitled".to_owned());

        let upload_date = self
            .upload_date
            .as_deref()
            .and_then(upload_date_to_iso)
            .or_else(|| self.release_timestamp.and_then(timestamp_to_date));

        VideoInfo {
            title,
            author: self.channel.or(self.uploader).unwrap_or_default(),
            duration: self.duration.map(|d| d.round() as i64).unwrap_or(0),
            view_count: self.view_count,
            upload_date,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Downloader {
    program: PathBuf,
    download_dir: PathBuf,
}

impl Downloader {
    pub fn new(program: impl Into<PathBuf>, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            download_dir: download_dir.into(),
        }
    }

    pub fn from_settings(settings: &DownloadSettings) -> Self {
        Self::new(&settings.extractor_path, &settings.directory)
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Looks up title, author, duration and view count for `url`.
    pub async fn get_info(&self, url: &str) -> Result<VideoInfo, DownloadError> {
        self.fetch_info(url).await.map_err(|err| {
            debug!(url, "metadata lookup failed: {err:#}");
            DownloadError::Info
        })
    }

    /// Streams the `quality` variant of `url` into
    /// `<download_dir>/<sanitized title>.mp4`.
    pub async fn download(&self, url: &str, quality: &str) -> Result<DownloadResult, DownloadError> {
        let info = self.fetch_info(url).await.map_err(|err| {
            warn!(url, "metadata lookup before download failed: {err:#}");
            DownloadError::Download
        })?;

        let filename = format!("{}.mp4", sanitize_filename(&info.title));
        let filepath = self.download_dir.join(&filename);
        tokio::fs::create_dir_all(&self.download_dir).await?;
        let mut file = File::create(&filepath).await?;

        let mut child = Command::new(&self.program)
            .arg("--format")
            .arg(format_selector(quality))
            .arg("--output")
            .arg("-")
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg("--quiet")
            .arg("--")
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                warn!(url, "unable to execute {}: {err}", self.program.display());
                DownloadError::Download
            })?;

        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_end(&mut buf).await;
            }
            buf
        });

        let Some(mut stdout) = child.stdout.take() else {
            return Err(DownloadError::Download);
        };
        let bytes = tokio::io::copy(&mut stdout, &mut file).await?;
        file.flush().await?;

        let status = child.wait().await.map_err(|err| {
            warn!(url, "waiting for extractor failed: {err}");
            DownloadError::Download
        })?;
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            warn!(
                url,
                "extractor exited with {status}: {}",
                stderr_tail(&stderr)
            );
            return Err(DownloadError::Download);
        }

        info!(url, filename = %filename, bytes, "download finished");
        Ok(DownloadResult {
            filepath,
            filename,
            title: info.title,
        })
    }

    /// Runs `yt-dlp --dump-single-json` and parses the response.
    async fn fetch_info(&self, url: &str) -> Result<VideoInfo> {
        let output = Command::new(&self.program)
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg("--")
            .arg(url)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("fetching metadata for {}", url))?;

        if !output.status.success() {
            bail!(
                "metadata command failed for {} (status {}): {}",
                url,
                output.status,
                stderr_tail(&output.stderr)
            );
        }

        let raw: RawVideoInfo =
            serde_json::from_slice(&output.stdout).context("deserializing metadata JSON")?;
        Ok(raw.into_video_info())
    }
}

/// Replaces every character outside `[A-Za-z0-9]` with `_` and lowercases.
pub fn sanitize_filename(title: &str) -> String {
    title
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Maps the quality vocabulary (`highest`, `lowestaudio`, ...) to yt-dlp
/// format selectors. Anything unrecognized is treated as a format id.
pub fn format_selector(quality: &str) -> String {
    match quality {
        "highest" => "best",
        "lowest" => "worst",
        "highestvideo" => "bestvideo",
        "lowestvideo" => "worstvideo",
        "highestaudio" => "bestaudio",
        "lowestaudio" => "worstaudio",
        other => other,
    }
    .to_owned()
}

/// Runs `<program> <flag>` to tell whether an external tool is installed.
pub async fn program_available(program: &Path, flag: &str) -> bool {
    Command::new(program)
        .arg(flag)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Last non-empty line of a tool's stderr, which is where both yt-dlp and
/// ffmpeg put the actual error.
pub(crate) fn stderr_tail(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("no error output")
        .to_owned()
}

/// Converts yt-dlp's `YYYYMMDD` upload date into `YYYY-MM-DD`.
fn upload_date_to_iso(value: &str) -> Option<String> {
    NaiveDate::parse_from_str(value, "%Y%m%d")
        .ok()
        .map(|date| date.format("%Y-%m-%d").to_string())
}

fn timestamp_to_date(timestamp: i64) -> Option<String> {
    chrono::DateTime::<Utc>::from_timestamp(timestamp, 0)
        .map(|datetime| datetime.format("%Y-%m-%d").to_string())
}
