//! JSON configuration document with dotted-key access.
//!
//! The document lives in `config.json` next to the working directory. Reads go
//! through [`ConfigStore::get`] (raw values) or [`ConfigStore::settings`]
//! (typed view used by the binaries); every [`ConfigStore::set`] writes the
//! whole document back to disk.

use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use tracing::{error, warn};

use crate::processor::CompressionPreset;

pub const CONFIG_FILE_NAME: &str = "config.json";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_DOWNLOAD_DIR: &str = "downloads";
pub const DEFAULT_QUALITY: &str = "highest";
pub const DEFAULT_EXTRACTOR: &str = "yt-dlp";
pub const DEFAULT_OUTPUT_DIR: &str = "processed";
pub const DEFAULT_FFMPEG: &str = "ffmpeg";
pub const DEFAULT_FFPROBE: &str = "ffprobe";
pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 3;
pub const DEFAULT_CLEANUP_SCHEDULE: &str = "0 2 * * *";
pub const DEFAULT_RETENTION_DAYS: u64 = 30;
pub const DEFAULT_LOG_DIR: &str = "logs";
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// In-memory copy of `config.json` plus the path it is persisted to.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    document: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadSettings {
    pub directory: PathBuf,
    pub default_quality: String,
    pub extractor_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingSettings {
    pub output_directory: PathBuf,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    pub compression_presets: BTreeMap<String, CompressionPreset>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerSettings {
    pub max_concurrent_tasks: usize,
    pub cleanup_schedule: String,
    pub retention_days: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    pub directory: PathBuf,
    pub level: String,
}

/// Typed view over the sections of the document the binaries consume.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub downloads: DownloadSettings,
    pub processing: ProcessingSettings,
    pub scheduler: SchedulerSettings,
    pub logging: LoggingSettings,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            host: DEFAULT_HOST.to_owned(),
        }
    }
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from(DEFAULT_DOWNLOAD_DIR),
            default_quality: DEFAULT_QUALITY.to_owned(),
            extractor_path: PathBuf::from(DEFAULT_EXTRACTOR),
        }
    }
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            output_directory: PathBuf::from(DEFAULT_OUTPUT_DIR),
            ffmpeg_path: PathBuf::from(DEFAULT_FFMPEG),
            ffprobe_path: PathBuf::from(DEFAULT_FFPROBE),
            compression_presets: CompressionPreset::defaults(),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
            cleanup_schedule: DEFAULT_CLEANUP_SCHEDULE.to_owned(),
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from(DEFAULT_LOG_DIR),
            level: DEFAULT_LOG_LEVEL.to_owned(),
        }
    }
}

/// The document used when `config.json` is missing or unreadable. `PORT` and
/// `HOST` from the environment override the server entries.
pub fn default_document() -> Value {
    let port = env::var("PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT);
    let host = env::var("HOST")
        .ok()
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_HOST.to_owned());

    json!({
        "server": {
            "port": port,
            "host": host,
        },
        "downloads": {
            "directory": DEFAULT_DOWNLOAD_DIR,
            "maxFileSize": "1GB",
            "allowedFormats": ["mp4", "webm", "flv"],
            "defaultQuality": DEFAULT_QUALITY,
            "extractorPath": DEFAULT_EXTRACTOR,
        },
        "processing": {
            "outputDirectory": DEFAULT_OUTPUT_DIR,
            "tempDirectory": "temp",
            "ffmpegPath": DEFAULT_FFMPEG,
            "ffprobePath": DEFAULT_FFPROBE,
            "compressionPresets": CompressionPreset::defaults(),
        },
        "scheduler": {
            "maxConcurrentTasks": DEFAULT_MAX_CONCURRENT_TASKS,
            "cleanupSchedule": DEFAULT_CLEANUP_SCHEDULE,
            "retentionDays": DEFAULT_RETENTION_DAYS,
        },
        "api": {
            "rateLimit": {
                "windowMs": 900_000,
                "max": 100,
            },
            "corsEnabled": true,
        },
        "logging": {
            "directory": DEFAULT_LOG_DIR,
            "level": DEFAULT_LOG_LEVEL,
        },
    })
}

/// Reads and parses the document. `Ok(None)` when the file does not exist.
pub fn read_document(path: &Path) -> Result<Option<Value>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let value: Value =
        serde_json::from_str(&content).with_context(|| format!("Parsing {}", path.display()))?;
    Ok(Some(value))
}

impl ConfigStore {
    /// Loads `config.json` from the current working directory.
    pub fn load_default() -> Self {
        let base = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::load(base.join(CONFIG_FILE_NAME))
    }

    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let document = load_document(&path);
        Self { path, document }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn document(&self) -> &Value {
        &self.document
    }

    /// Resolves a dotted key such as `server.port`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        key.split('.')
            .try_fold(&self.document, |value, part| value.as_object()?.get(part))
    }

    /// Stores `value` under the dotted `key`, creating intermediate objects,
    /// then persists the document. A failed write is logged and the in-memory
    /// change is kept.
    pub fn set(&mut self, key: &str, value: Value) {
        let mut parts: Vec<&str> = key.split('.').collect();
        let last = parts.pop().unwrap_or_default();

        let mut target = &mut self.document;
        for part in parts {
            target = object_slot(target, part);
        }
        *object_slot(target, last) = value;

        if let Err(err) = self.save() {
            error!("Failed to save config: {err:#}");
        }
    }

    /// Discards in-memory state and re-reads the file.
    pub fn reload(&mut self) {
        self.document = load_document(&self.path);
    }

    pub fn settings(&self) -> Settings {
        Settings {
            server: self.section("server"),
            downloads: self.section("downloads"),
            processing: self.section("processing"),
            scheduler: self.section("scheduler"),
            logging: self.section("logging"),
        }
    }

    fn section<T: DeserializeOwned + Default>(&self, name: &str) -> T {
        let Some(value) = self.document.get(name) else {
            return T::default();
        };
        match serde_json::from_value(value.clone()) {
            Ok(section) => section,
            Err(err) => {
                warn!("Invalid `{name}` section in config, using defaults: {err}");
                T::default()
            }
        }
    }

    fn save(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.document)?;
        fs::write(&self.path, content).with_context(|| format!("Writing {}", self.path.display()))
    }
}

/// Defaults with the on-disk document merged on top; defaults alone when the
/// file is missing or malformed.
fn load_document(path: &Path) -> Value {
    let mut document = default_document();
    match read_document(path) {
        Ok(Some(loaded @ Value::Object(_))) => merge(&mut document, loaded),
        Ok(Some(_)) => warn!(
            "Config file {} is not a JSON object, using defaults",
            path.display()
        ),
        Ok(None) => {}
        Err(err) => warn!("Failed to load config file, using defaults: {err:#}"),
    }
    document
}

/// Recursively overlays `overlay` onto `base`; objects merge key by key,
/// everything else replaces.
fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// The slot for `key` inside `value`, which is turned into an empty object
/// first when it holds anything else. Missing keys start out as `null`.
fn object_slot<'a>(value: &'a mut Value, key: &str) -> &'a mut Value {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    &mut value[key]
}
