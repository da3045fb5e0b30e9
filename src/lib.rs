#![forbid(unsafe_code)]

//! Shared pieces of the tube automation toolkit.
//!
//! The `tube_server` and `tube_cli` binaries are thin front ends over these
//! modules: configuration, file helpers, the yt-dlp and ffmpeg adapters and
//! the cron task scheduler.

pub mod api;
pub mod config;
pub mod downloader;
pub mod files;
pub mod logging;
pub mod processor;
pub mod scheduler;

#[cfg(test)]
mod test_support;
