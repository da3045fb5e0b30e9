//! Small filesystem helpers shared by the CLI, the API and the scheduler.
//!
//! Everything here is synchronous and forgiving: listing a
//! missing directory yields nothing and stat-ing a missing file yields `None`,
//! so callers can render "unknown" instead of failing a whole request.

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use walkdir::WalkDir;

const SIZE_UNITS: [&str; 4] = ["Bytes", "KB", "MB", "GB"];

/// Subset of filesystem metadata exposed to the front ends.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStats {
    /// Human readable size such as `1.5 MB`.
    pub size: String,
    pub bytes: u64,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub is_file: bool,
    pub is_directory: bool,
}

/// A directory entry paired with its stats, as listed by `/files`.
#[derive(Debug, Clone, Serialize)]
pub struct FileEntry {
    pub name: String,
    #[serde(flatten)]
    pub stats: Option<FileStats>,
}

/// Renders a byte count with 1024-based units, rounded to two decimals.
pub fn format_file_size(bytes: u64) -> String {
    if bytes == 0 {
        return "0 Bytes".to_owned();
    }

    let mut unit = 0;
    while unit + 1 < SIZE_UNITS.len() && bytes >= 1024u64.pow(unit as u32 + 1) {
        unit += 1;
    }

    let scaled = bytes as f64 / 1024f64.powi(unit as i32);
    let rounded = (scaled * 100.0).round() / 100.0;
    format!("{} {}", rounded, SIZE_UNITS[unit])
}

/// Returns `None` for anything that cannot be stat-ed.
pub fn get_file_stats(path: &Path) -> Option<FileStats> {
    let metadata = fs::metadata(path).ok()?;
    let modified = metadata.modified().ok()?;
    // Not every filesystem records a birth time.
    let created = metadata.created().unwrap_or(modified);

    Some(FileStats {
        size: format_file_size(metadata.len()),
        bytes: metadata.len(),
        created: created.into(),
        modified: modified.into(),
        is_file: metadata.is_file(),
        is_directory: metadata.is_dir(),
    })
}

/// Lists entry names directly inside `directory`, optionally keeping only the
/// ones ending in `extension`. Sorted; empty when the directory is unreadable.
pub fn list_files(directory: &Path, extension: Option<&str>) -> Vec<String> {
    if !directory.is_dir() {
        return Vec::new();
    }

    let mut names: Vec<String> = WalkDir::new(directory)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| extension.is_none_or(|ext| name.ends_with(ext)))
        .collect();

    names.sort();
    names
}

/// Same as [`list_files`] but with stats attached to every entry.
pub fn list_with_stats(directory: &Path, extension: Option<&str>) -> Vec<FileEntry> {
    list_files(directory, extension)
        .into_iter()
        .map(|name| {
            let stats = get_file_stats(&directory.join(&name));
            FileEntry { name, stats }
        })
        .collect()
}

pub fn delete_file(path: &Path) -> bool {
    fs::remove_file(path).is_ok()
}

/// Creates `path` and its parents; a no-op when it already exists.
pub fn ensure_directory(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("creating {}", path.display()))
}

/// Deletes the files directly inside `directory` created before
/// `now - max_age` and returns how many were removed.
pub fn remove_older_than(directory: &Path, max_age: Duration) -> usize {
    let Some(cutoff) = SystemTime::now().checked_sub(max_age) else {
        return 0;
    };

    let mut deleted = 0;
    for name in list_files(directory, None) {
        let path = directory.join(&name);
        let Some(stats) = get_file_stats(&path) else {
            continue;
        };
        if !stats.is_file || SystemTime::from(stats.created) >= cutoff {
            continue;
        }
        if delete_file(&path) {
            deleted += 1;
        }
    }

    deleted
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn format_file_size_uses_binary_units() {
        assert_eq!(format_file_size(0), "0 Bytes");
        assert_eq!(format_file_size(512), "512 Bytes");
        assert_eq!(format_file_size(1024), "1 KB");
        assert_eq!(format_file_size(1536), "1.5 KB");
        assert_eq!(format_file_size(1_048_576), "1 MB");
        assert_eq!(format_file_size(1_073_741_824), "1 GB");
    }

    #[test]
    fn format_file_size_rounds_to_two_decimals() {
        assert_eq!(format_file_size(1234), "1.21 KB");
        assert_eq!(format_file_size(5 * 1024 * 1024 * 1024 * 1024), "5120 GB");
    }

    #[test]
    fn get_file_stats_reports_files() -> Result<()> {
        let dir = tempdir()?;
        let file = dir.path().join("test.txt");
        fs::write(&file, "test content")?;

        let stats = get_file_stats(&file).expect("stats for existing file");
        assert!(stats.is_file);
        assert!(!stats.is_directory);
        assert_eq!(stats.bytes, 12);
        assert!(stats.size.contains("Bytes"));
        Ok(())
    }

    #[test]
    fn get_file_stats_returns_none_for_missing_path() {
        assert!(get_file_stats(Path::new("non-existent.txt")).is_none());
    }

    #[test]
    fn list_files_filters_by_extension() -> Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join("test.txt"), "a")?;
        fs::write(dir.path().join("script.js"), "b")?;

        let all = list_files(dir.path(), None);
        assert_eq!(all, vec!["script.js".to_string(), "test.txt".to_string()]);

        let txt = list_files(dir.path(), Some(".txt"));
        assert_eq!(txt, vec!["test.txt".to_string()]);

        let js = list_files(dir.path(), Some(".js"));
        assert!(!js.contains(&"test.txt".to_string()));
        Ok(())
    }

    #[test]
    fn list_files_is_empty_for_missing_directory() {
        assert!(list_files(Path::new("/definitely/not/here"), None).is_empty());
    }

    #[test]
    fn list_with_stats_pairs_names_and_sizes() -> Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join("clip.mp4"), vec![0u8; 2048])?;

        let entries = list_with_stats(dir.path(), Some(".mp4"));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "clip.mp4");
        assert_eq!(entries[0].stats.as_ref().unwrap().size, "2 KB");
        Ok(())
    }

    #[test]
    fn delete_file_reports_success() -> Result<()> {
        let dir = tempdir()?;
        let file = dir.path().join("gone.txt");
        fs::write(&file, "x")?;

        assert!(delete_file(&file));
        assert!(!file.exists());
        assert!(!delete_file(&file));
        Ok(())
    }

    #[test]
    fn ensure_directory_is_idempotent() -> Result<()> {
        let dir = tempdir()?;
        let nested = dir.path().join("new-dir").join("inner");
        ensure_directory(&nested)?;
        ensure_directory(&nested)?;
        assert!(nested.is_dir());
        Ok(())
    }

    #[test]
    fn remove_older_than_respects_retention() -> Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join("a.mp4"), "a")?;
        fs::write(dir.path().join("b.mp4"), "b")?;
        fs::create_dir(dir.path().join("nested"))?;

        assert_eq!(
            remove_older_than(dir.path(), Duration::from_secs(30 * 24 * 3600)),
            0
        );

        thread::sleep(Duration::from_millis(20));
        assert_eq!(remove_older_than(dir.path(), Duration::ZERO), 2);
        assert_eq!(list_files(dir.path(), None), vec!["nested".to_string()]);
        Ok(())
    }
}
