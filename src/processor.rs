//! ffmpeg / ffprobe adapter for downloaded files.
//!
//! Each operation runs the tool once and resolves a single outcome. Outputs
//! land in the configured output directory and are named after the input's
//! file stem (`clip_converted.webm`, `clip_compressed.mp4`, `clip_thumb.jpg`).

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::ProcessingSettings;
use crate::downloader::stderr_tail;

pub const DEFAULT_FORMAT: &str = "mp4";
pub const DEFAULT_TIME_OFFSET: &str = "00:00:05";

#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Conversion failed: {0}")]
    Conversion(String),

    #[error("Compression failed: {0}")]
    Compression(String),

    #[error("Thumbnail generation failed: {0}")]
    Thumbnail(String),

    #[error("Failed to read metadata: {0}")]
    Metadata(String),

    /// Carries the rejected operation name for logging.
    #[error("Invalid operation")]
    InvalidOperation(String),
}

/// Low / medium / high, shared by conversion bitrates and compression levels.
/// Unrecognized names fall back to medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(from = "String")]
pub enum Tier {
    Low,
    #[default]
    Medium,
    High,
}

impl Tier {
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Tier::Low,
            "high" => Tier::High,
            _ => Tier::Medium,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Low => "low",
            Tier::Medium => "medium",
            Tier::High => "high",
        }
    }

    pub fn video_bitrate(self) -> &'static str {
        match self {
            Tier::Low => "500k",
            Tier::Medium => "1000k",
            Tier::High => "2000k",
        }
    }
}

impl From<String> for Tier {
    fn from(value: String) -> Self {
        Tier::parse_lenient(&value)
    }
}

/// x264 constant-rate-factor and speed preset for one compression level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionPreset {
    pub crf: u8,
    pub preset: String,
}

impl CompressionPreset {
    fn new(crf: u8, preset: &str) -> Self {
        Self {
            crf,
            preset: preset.to_owned(),
        }
    }

    pub fn fallback(tier: Tier) -> Self {
        match tier {
            Tier::Low => Self::new(30, "fast"),
            Tier::Medium => Self::new(25, "medium"),
            Tier::High => Self::new(20, "slow"),
        }
    }

    pub fn defaults() -> BTreeMap<String, Self> {
        [Tier::Low, Tier::Medium, Tier::High]
            .into_iter()
            .map(|tier| (tier.as_str().to_owned(), Self::fallback(tier)))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Convert,
    Compress,
    Thumbnail,
    Metadata,
}

impl FromStr for Operation {
    type Err = ProcessingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "convert" => Ok(Operation::Convert),
            "compress" => Ok(Operation::Compress),
            "thumbnail" => Ok(Operation::Thumbnail),
            "metadata" => Ok(Operation::Metadata),
            other => Err(ProcessingError::InvalidOperation(other.to_owned())),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Convert => "convert",
            Operation::Compress => "compress",
            Operation::Thumbnail => "thumbnail",
            Operation::Metadata => "metadata",
        };
        f.write_str(name)
    }
}

/// Per-operation knobs; each operation reads only the ones it needs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProcessOptions {
    pub format: String,
    pub quality: Tier,
    pub level: Tier,
    pub time_offset: String,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            format: DEFAULT_FORMAT.to_owned(),
            quality: Tier::Medium,
            level: Tier::Medium,
            time_offset: DEFAULT_TIME_OFFSET.to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingResult {
    pub success: bool,
    pub output_path: PathBuf,
    pub filename: String,
}

impl ProcessingResult {
    fn for_output(output_path: PathBuf) -> Self {
        let filename = output_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            success: true,
            output_path,
            filename,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoStream {
    pub codec: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioStream {
    pub codec: Option<String>,
    pub channels: Option<u32>,
    pub sample_rate: Option<u32>,
}

/// Container-level numbers plus the first video and audio stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaMetadata {
    pub duration: Option<f64>,
    pub size: Option<u64>,
    pub bitrate: Option<u64>,
    pub video: Option<VideoStream>,
    pub audio: Option<AudioStream>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ProcessOutcome {
    File(ProcessingResult),
    Metadata(MediaMetadata),
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
    size: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    channels: Option<u32>,
    sample_rate: Option<String>,
}

impl MediaMetadata {
    /// Parses `ffprobe -print_format json -show_format -show_streams` output.
    pub fn from_probe_json(raw: &[u8]) -> serde_json::Result<Self> {
        let probe: ProbeOutput = serde_json::from_slice(raw)?;
        let format = probe.format;

        let stream_of = |kind: &str| {
            probe
                .streams
                .iter()
                .find(|stream| stream.codec_type.as_deref() == Some(kind))
        };

        let video = stream_of("video").map(|stream| VideoStream {
            codec: stream.codec_name.clone(),
            width: stream.width,
            height: stream.height,
            fps: stream.r_frame_rate.as_deref().and_then(parse_frame_rate),
        });
        let audio = stream_of("audio").map(|stream| AudioStream {
            codec: stream.codec_name.clone(),
            channels: stream.channels,
            sample_rate: stream.sample_rate.as_deref().and_then(|v| v.parse().ok()),
        });

        Ok(Self {
            duration: format
                .as_ref()
                .and_then(|f| f.duration.as_deref())
                .and_then(|v| v.parse().ok()),
            size: format
                .as_ref()
                .and_then(|f| f.size.as_deref())
                .and_then(|v| v.parse().ok()),
            bitrate: format
                .as_ref()
                .and_then(|f| f.bit_rate.as_deref())
                .and_then(|v| v.parse().ok()),
            video,
            audio,
        })
    }
}

/// Parses ffprobe's `num/den` frame rate (or a bare number). A zero
/// denominator or anything non-numeric yields `None`.
pub fn parse_frame_rate(value: &str) -> Option<f64> {
    let rate = match value.trim().split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => value.trim().parse().ok()?,
    };
    rate.is_finite().then_some(rate)
}

/// Reads an ffmpeg `-progress` line and returns the encoded position in
/// seconds.
fn parse_progress_seconds(line: &str) -> Option<f64> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        // Both keys are reported in microseconds.
        "out_time_us" | "out_time_ms" => value.parse::<f64>().ok().map(|us| us / 1_000_000.0),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct MediaProcessor {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    output_dir: PathBuf,
    presets: BTreeMap<String, CompressionPreset>,
}

impl MediaProcessor {
    pub fn new(
        ffmpeg: impl Into<PathBuf>,
        ffprobe: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            output_dir: output_dir.into(),
            presets: CompressionPreset::defaults(),
        }
    }

    pub fn from_settings(settings: &ProcessingSettings) -> Self {
        Self::new(
            &settings.ffmpeg_path,
            &settings.ffprobe_path,
            &settings.output_directory,
        )
        .with_presets(settings.compression_presets.clone())
    }

    pub fn with_presets(mut self, presets: BTreeMap<String, CompressionPreset>) -> Self {
        self.presets = presets;
        self
    }

    pub fn ffmpeg(&self) -> &Path {
        &self.ffmpeg
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Configured preset for `tier`, or the built-in one when the table lacks
    /// an entry.
    pub fn preset(&self, tier: Tier) -> CompressionPreset {
        self.presets
            .get(tier.as_str())
            .cloned()
            .unwrap_or_else(|| CompressionPreset::fallback(tier))
    }

    /// Dispatches `operation` with the relevant fields of `options`.
    pub async fn run(
        &self,
        input: &Path,
        operation: Operation,
        options: &ProcessOptions,
    ) -> Result<ProcessOutcome, ProcessingError> {
        debug!(input = %input.display(), %operation, "processing");
        match operation {
            Operation::Convert => self
                .convert(input, &options.format, options.quality)
                .await
                .map(ProcessOutcome::File),
            Operation::Compress => self
                .compress(input, options.level)
                .await
                .map(ProcessOutcome::File),
            Operation::Thumbnail => self
                .thumbnail(input, &options.time_offset)
                .await
                .map(ProcessOutcome::File),
            Operation::Metadata => self.metadata(input).await.map(ProcessOutcome::Metadata),
        }
    }

    /// Re-encodes into `format` at the bitrate for `quality`.
    pub async fn convert(
        &self,
        input: &Path,
        format: &str,
        quality: Tier,
    ) -> Result<ProcessingResult, ProcessingError> {
        // The format becomes the output extension, so it must stay one token.
        if format.is_empty() || !format.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ProcessingError::Conversion(format!(
                "unsupported output format {format:?}"
            )));
        }

        let output = self.output_path(input, &format!("_converted.{format}"));
        self.prepare_output_dir()
            .await
            .map_err(ProcessingError::Conversion)?;

        let command = self.convert_command(input, &output, quality);
        run_to_completion(command)
            .await
            .map_err(ProcessingError::Conversion)?;

        info!(output = %output.display(), "conversion finished");
        Ok(ProcessingResult::for_output(output))
    }

    /// Re-encodes to H.264/AAC using the CRF and preset for `level`, logging
    /// progress as ffmpeg reports it.
    pub async fn compress(
        &self,
        input: &Path,
        level: Tier,
    ) -> Result<ProcessingResult, ProcessingError> {
        let output = self.output_path(input, "_compressed.mp4");
        self.prepare_output_dir()
            .await
            .map_err(ProcessingError::Compression)?;

        let total = self
            .metadata(input)
            .await
            .ok()
            .and_then(|meta| meta.duration)
            .filter(|duration| *duration > 0.0);

        let mut command = self.compress_command(input, &output, &self.preset(level));
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|err| ProcessingError::Compression(err.to_string()))?;

        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_end(&mut buf).await;
            }
            buf
        });

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Some(seconds) = parse_progress_seconds(&line) else {
                    continue;
                };
                match total {
                    Some(total) => {
                        let percent = (seconds / total * 100.0).clamp(0.0, 100.0);
                        info!("Compression progress: {percent:.1}%");
                    }
                    None => debug!("Compression progress: {seconds:.1}s encoded"),
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|err| ProcessingError::Compression(err.to_string()))?;
        let stderr = stderr_task.await.unwrap_or_default();
        if !status.success() {
            return Err(ProcessingError::Compression(stderr_tail(&stderr)));
        }

        info!(output = %output.display(), "compression finished");
        Ok(ProcessingResult::for_output(output))
    }

    /// Grabs one frame at `time_offset` as a JPEG.
    pub async fn thumbnail(
        &self,
        input: &Path,
        time_offset: &str,
    ) -> Result<ProcessingResult, ProcessingError> {
        let output = self.output_path(input, "_thumb.jpg");
        self.prepare_output_dir()
            .await
            .map_err(ProcessingError::Thumbnail)?;

        let command = self.thumbnail_command(input, &output, time_offset);
        run_to_completion(command)
            .await
            .map_err(ProcessingError::Thumbnail)?;

        Ok(ProcessingResult::for_output(output))
    }

    /// Probes container and stream details with ffprobe.
    pub async fn metadata(&self, input: &Path) -> Result<MediaMetadata, ProcessingError> {
        let output = self
            .probe_command(input)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| ProcessingError::Metadata(err.to_string()))?;

        if !output.status.success() {
            let reason = if output.stderr.is_empty() {
                format!("ffprobe exited with {}", output.status)
            } else {
                stderr_tail(&output.stderr)
            };
            return Err(ProcessingError::Metadata(reason));
        }

        MediaMetadata::from_probe_json(&output.stdout)
            .map_err(|err| ProcessingError::Metadata(err.to_string()))
    }

    fn output_path(&self, input: &Path, suffix: &str) -> PathBuf {
        let stem = input
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.output_dir.join(format!("{stem}{suffix}"))
    }

    async fn prepare_output_dir(&self) -> Result<(), String> {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|err| format!("creating {}: {err}", self.output_dir.display()))
    }

    fn ffmpeg_command(&self) -> Command {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args(["-hide_banner", "-loglevel", "error", "-y"]);
        cmd
    }

    pub fn convert_command(&self, input: &Path, output: &Path, quality: Tier) -> Command {
        let mut cmd = self.ffmpeg_command();
        cmd.arg("-i").arg(input);
        cmd.arg("-b:v").arg(quality.video_bitrate());
        cmd.arg(output);
        cmd
    }

    pub fn compress_command(
        &self,
        input: &Path,
        output: &Path,
        preset: &CompressionPreset,
    ) -> Command {
        let mut cmd = self.ffmpeg_command();
        cmd.arg("-i").arg(input);
        cmd.arg("-c:v").arg("libx264");
        cmd.arg("-c:a").arg("aac");
        cmd.arg("-crf").arg(preset.crf.to_string());
        cmd.arg("-preset").arg(&preset.preset);
        cmd.args(["-progress", "pipe:1", "-nostats"]);
        cmd.arg(output);
        cmd
    }

    pub fn thumbnail_command(&self, input: &Path, output: &Path, time_offset: &str) -> Command {
        let mut cmd = self.ffmpeg_command();
        cmd.arg("-ss").arg(time_offset);
        cmd.arg("-i").arg(input);
        cmd.arg("-frames:v").arg("1");
        cmd.arg(output);
        cmd
    }

    pub fn probe_command(&self, input: &Path) -> Command {
        let mut cmd = Command::new(&self.ffprobe);
        cmd.args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"]);
        cmd.arg(input);
        cmd
    }
}

/// Runs a prepared ffmpeg command, turning a spawn failure or non-zero exit
/// into the tool's last stderr line.
async fn run_to_completion(mut command: Command) -> Result<(), String> {
    let output = command
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|err| err.to_string())?;

    if output.status.success() {
        Ok(())
    } else {
        Err(stderr_tail(&output.stderr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FAILING_STUB, FFMPEG_STUB, FFPROBE_STUB, install_stub};
    use anyhow::Result;
    use tempfile::tempdir;

    fn command_args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    fn processor() -> MediaProcessor {
        MediaProcessor::new("ffmpeg", "ffprobe", "/out")
    }

    fn arg_after(args: &[String], flag: &str) -> Option<String> {
        args.iter()
            .position(|arg| arg == flag)
            .and_then(|index| args.get(index + 1))
            .cloned()
    }

    #[test]
    fn tier_parsing_is_lenient() {
        assert_eq!(Tier::parse_lenient("low"), Tier::Low);
        assert_eq!(Tier::parse_lenient(" HIGH "), Tier::High);
        assert_eq!(Tier::parse_lenient("medium"), Tier::Medium);
        assert_eq!(Tier::parse_lenient("ultra"), Tier::Medium);
        assert_eq!(Tier::Low.video_bitrate(), "500k");
        assert_eq!(Tier::Medium.video_bitrate(), "1000k");
        assert_eq!(Tier::High.video_bitrate(), "2000k");
    }

    #[test]
    fn operations_parse_and_reject_unknown_names() {
        assert_eq!("convert".parse::<Operation>().unwrap(), Operation::Convert);
        assert_eq!("metadata".parse::<Operation>().unwrap(), Operation::Metadata);
        let err = "explode".parse::<Operation>().unwrap_err();
        assert!(matches!(err, ProcessingError::InvalidOperation(ref op) if op == "explode"));
        assert_eq!(err.to_string(), "Invalid operation");
    }

    #[test]
    fn process_options_fill_defaults() {
        let options: ProcessOptions =
            serde_json::from_value(serde_json::json!({ "format": "webm", "level": "high" }))
                .unwrap();
        assert_eq!(options.format, "webm");
        assert_eq!(options.level, Tier::High);
        assert_eq!(options.quality, Tier::Medium);
        assert_eq!(options.time_offset, DEFAULT_TIME_OFFSET);
    }

    #[test]
    fn frame_rate_fractions_are_parsed_directly() {
        let ntsc = parse_frame_rate("30000/1001").unwrap();
        assert!((ntsc - 29.97).abs() < 0.01);
        assert_eq!(parse_frame_rate("25/1"), Some(25.0));
        assert_eq!(parse_frame_rate("24"), Some(24.0));
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("process.exit()"), None);
        assert_eq!(parse_frame_rate("1/x"), None);
    }

    #[test]
    fn progress_lines_are_read_in_microseconds() {
        assert_eq!(parse_progress_seconds("out_time_us=1500000"), Some(1.5));
        assert_eq!(parse_progress_seconds("out_time_ms=2000000"), Some(2.0));
        assert_eq!(parse_progress_seconds("progress=continue"), None);
        assert_eq!(parse_progress_seconds("out_time_us=N/A"), None);
    }

    #[test]
    fn probe_json_picks_first_streams() {
        let raw = br#"{
            "streams": [
                {"codec_type": "audio", "codec_name": "opus", "channels": 2, "sample_rate": "48000"},
                {"codec_type": "video", "codec_name": "vp9", "width": 1280, "height": 720, "r_frame_rate": "25/1"},
                {"codec_type": "video", "codec_name": "mjpeg", "width": 64, "height": 64, "r_frame_rate": "0/0"}
            ],
            "format": {"duration": "12.5", "size": "1024", "bit_rate": "655"}
        }"#;

        let meta = MediaMetadata::from_probe_json(raw).unwrap();
        assert_eq!(meta.duration, Some(12.5));
        assert_eq!(meta.size, Some(1024));
        assert_eq!(meta.bitrate, Some(655));
        let video = meta.video.unwrap();
        assert_eq!(video.codec.as_deref(), Some("vp9"));
        assert_eq!(video.width, Some(1280));
        assert_eq!(video.fps, Some(25.0));
        let audio = meta.audio.unwrap();
        assert_eq!(audio.channels, Some(2));
        assert_eq!(audio.sample_rate, Some(48_000));
    }

    #[test]
    fn probe_json_without_streams_has_no_summaries() {
        let meta = MediaMetadata::from_probe_json(br#"{"format": {}}"#).unwrap();
        assert_eq!(meta.duration, None);
        assert!(meta.video.is_none());
        assert!(meta.audio.is_none());
    }

    #[test]
    fn convert_command_uses_quality_bitrate() {
        let p = processor();
        let cmd = p.convert_command(
            Path::new("/dl/clip.mp4"),
            Path::new("/out/clip_converted.webm"),
            Tier::High,
        );
        let args = command_args(&cmd);
        assert_eq!(cmd.as_std().get_program(), "ffmpeg");
        assert_eq!(arg_after(&args, "-i").as_deref(), Some("/dl/clip.mp4"));
        assert_eq!(arg_after(&args, "-b:v").as_deref(), Some("2000k"));
        assert_eq!(args.last().map(String::as_str), Some("/out/clip_converted.webm"));
    }

    #[test]
    fn compress_command_uses_preset_table() {
        let p = processor();
        let cmd = p.compress_command(
            Path::new("/dl/clip.mp4"),
            Path::new("/out/clip_compressed.mp4"),
            &p.preset(Tier::High),
        );
        let args = command_args(&cmd);
        assert_eq!(arg_after(&args, "-c:v").as_deref(), Some("libx264"));
        assert_eq!(arg_after(&args, "-c:a").as_deref(), Some("aac"));
        assert_eq!(arg_after(&args, "-crf").as_deref(), Some("20"));
        assert_eq!(arg_after(&args, "-preset").as_deref(), Some("slow"));
        assert_eq!(args.last().map(String::as_str), Some("/out/clip_compressed.mp4"));
    }

    #[test]
    fn presets_can_be_overridden_and_fall_back() {
        let mut presets = BTreeMap::new();
        presets.insert("low".to_owned(), CompressionPreset::new(35, "veryfast"));
        let p = processor().with_presets(presets);

        assert_eq!(p.preset(Tier::Low), CompressionPreset::new(35, "veryfast"));
        assert_eq!(p.preset(Tier::Medium), CompressionPreset::new(25, "medium"));
    }

    #[test]
    fn thumbnail_command_seeks_before_input() {
        let p = processor();
        let cmd = p.thumbnail_command(
            Path::new("/dl/clip.mp4"),
            Path::new("/out/clip_thumb.jpg"),
            "00:00:05",
        );
        let args = command_args(&cmd);
        let seek = args.iter().position(|a| a == "-ss").unwrap();
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert!(seek < input);
        assert_eq!(arg_after(&args, "-ss").as_deref(), Some("00:00:05"));
        assert_eq!(arg_after(&args, "-frames:v").as_deref(), Some("1"));
    }

    #[test]
    fn output_names_follow_input_stem() {
        let p = processor();
        assert_eq!(
            p.output_path(Path::new("/dl/my_clip.mp4"), "_thumb.jpg"),
            PathBuf::from("/out/my_clip_thumb.jpg")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn operations_write_outputs_with_stub_tools() -> Result<()> {
        let dir = tempdir()?;
        let ffmpeg = install_stub(dir.path(), "ffmpeg", FFMPEG_STUB)?;
        let ffprobe = install_stub(dir.path(), "ffprobe", FFPROBE_STUB)?;
        let out = dir.path().join("processed");
        let p = MediaProcessor::new(ffmpeg, ffprobe, &out);
        let input = dir.path().join("clip.mp4");
        std::fs::write(&input, "source")?;

        let converted = p.convert(&input, "webm", Tier::Low).await?;
        assert!(converted.success);
        assert_eq!(converted.filename, "clip_converted.webm");
        assert!(out.join("clip_converted.webm").exists());

        let compressed = p.compress(&input, Tier::parse_lenient("bogus")).await?;
        assert_eq!(compressed.filename, "clip_compressed.mp4");
        assert!(compressed.output_path.exists());

        let thumb = p.thumbnail(&input, DEFAULT_TIME_OFFSET).await?;
        assert_eq!(thumb.filename, "clip_thumb.jpg");
        assert!(thumb.output_path.exists());

        let meta = p.metadata(&input).await?;
        assert_eq!(meta.duration, Some(10.0));
        assert_eq!(meta.video.unwrap().width, Some(1920));
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_dispatches_metadata() -> Result<()> {
        let dir = tempdir()?;
        let ffprobe = install_stub(dir.path(), "ffprobe", FFPROBE_STUB)?;
        let p = MediaProcessor::new("ffmpeg", ffprobe, dir.path());

        let outcome = p
            .run(
                Path::new("clip.mp4"),
                Operation::Metadata,
                &ProcessOptions::default(),
            )
            .await?;
        assert!(matches!(outcome, ProcessOutcome::Metadata(ref meta) if meta.size == Some(2048)));
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tool_failures_carry_prefix_and_stderr() -> Result<()> {
        let dir = tempdir()?;
        let broken = install_stub(dir.path(), "ffmpeg", FAILING_STUB)?;
        let p = MediaProcessor::new(&broken, &broken, dir.path().join("processed"));
        let input = Path::new("clip.mp4");

        let err = p.convert(input, "mp4", Tier::Medium).await.unwrap_err();
        assert_eq!(err.to_string(), "Conversion failed: boom: invalid data");

        let err = p.compress(input, Tier::Medium).await.unwrap_err();
        assert_eq!(err.to_string(), "Compression failed: boom: invalid data");

        let err = p.thumbnail(input, "00:00:01").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Thumbnail generation failed: boom: invalid data"
        );

        let err = p.metadata(input).await.unwrap_err();
        assert_eq!(err.to_string(), "Failed to read metadata: boom: invalid data");
        Ok(())
    }

    #[tokio::test]
    async fn convert_rejects_formats_that_are_not_extensions() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("processed");
        let p = MediaProcessor::new("/nonexistent/ffmpeg", "/nonexistent/ffprobe", &out);

        for format in ["../../escape", "mp4/x", "", "m p4"] {
            let err = p
                .convert(Path::new("clip.mp4"), format, Tier::Medium)
                .await
                .unwrap_err();
            assert!(matches!(err, ProcessingError::Conversion(_)), "{format}");
            assert!(err.to_string().starts_with("Conversion failed: unsupported output format"));
        }
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn missing_tool_is_reported() {
        let p = MediaProcessor::new("/nonexistent/ffmpeg", "/nonexistent/ffprobe", "/tmp");
        let err = p.metadata(Path::new("clip.mp4")).await.unwrap_err();
        assert!(err.to_string().starts_with("Failed to read metadata: "));
    }
}
