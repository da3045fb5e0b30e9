//! Tracing setup: an optional console layer plus two JSON log files under the
//! log directory, `error.log` (errors only) and `combined.log` (everything),
//! both rotated by size.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use parking_lot::{Mutex, MutexGuard};
use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, MakeWriter, writer::MakeWriterExt},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::files;

pub const ERROR_LOG_FILE: &str = "error.log";
pub const COMBINED_LOG_FILE: &str = "combined.log";
pub const MAX_LOG_BYTES: u64 = 5 * 1024 * 1024;
pub const ERROR_LOG_FILES: usize = 3;
pub const COMBINED_LOG_FILES: usize = 5;

#[derive(Debug, Clone)]
pub struct LogOptions {
    pub directory: PathBuf,
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    pub console: bool,
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init(options: &LogOptions) -> Result<()> {
    files::ensure_directory(&options.directory)?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&options.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let combined = RotatingFile::open(
        options.directory.join(COMBINED_LOG_FILE),
        MAX_LOG_BYTES,
        COMBINED_LOG_FILES,
    )?;
    let errors = RotatingFile::open(
        options.directory.join(ERROR_LOG_FILE),
        MAX_LOG_BYTES,
        ERROR_LOG_FILES,
    )?;

    let console = options.console.then(|| fmt::layer().with_target(false));

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(fmt::layer().json().with_ansi(false).with_writer(combined))
        .with(
            fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(errors.with_max_level(Level::ERROR)),
        )
        .try_init()
        .context("installing tracing subscriber")
}

/// Append-only log file that shifts `x.log` → `x.log.1` → `x.log.2` … once
/// it would grow past `max_bytes`, keeping at most `max_files` files.
#[derive(Clone)]
pub struct RotatingFile {
    inner: Arc<Mutex<RotatingState>>,
}

struct RotatingState {
    path: PathBuf,
    max_bytes: u64,
    max_files: usize,
    file: File,
    written: u64,
}

pub struct RotatingWriter<'a>(MutexGuard<'a, RotatingState>);

impl RotatingFile {
    pub fn open(path: impl Into<PathBuf>, max_bytes: u64, max_files: usize) -> Result<Self> {
        let path = path.into();
        let file = open_append(&path).with_context(|| format!("opening {}", path.display()))?;
        let written = file.metadata().map(|meta| meta.len()).unwrap_or(0);
        Ok(Self {
            inner: Arc::new(Mutex::new(RotatingState {
                path,
                max_bytes,
                max_files: max_files.max(1),
                file,
                written,
            })),
        })
    }
}

impl<'a> MakeWriter<'a> for RotatingFile {
    type Writer = RotatingWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        RotatingWriter(self.inner.lock())
    }
}

impl Write for RotatingWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl RotatingState {
    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        if self.max_files == 1 {
            self.file = File::create(&self.path)?;
            self.written = 0;
            return Ok(());
        }

        let oldest = rotated_path(&self.path, self.max_files - 1);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for index in (1..self.max_files - 1).rev() {
            let from = rotated_path(&self.path, index);
            if from.exists() {
                fs::rename(&from, rotated_path(&self.path, index + 1))?;
            }
        }
        fs::rename(&self.path, rotated_path(&self.path, 1))?;

        self.file = open_append(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingState {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_bytes {
            self.rotate()?;
        }
        let count = self.file.write(buf)?;
        self.written += count as u64;
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn rotated_path(path: &Path, index: usize) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}
