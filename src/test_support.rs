//! Shell-script stand-ins for yt-dlp, ffmpeg and ffprobe used by the unit
//! tests. The adapters take their program paths from configuration, so tests
//! point them at these scripts instead of touching `PATH`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;

/// Writes an executable script named `name` into `dir`.
pub fn install_stub(dir: &Path, name: &str, script: &str) -> Result<PathBuf> {
    let script_path = dir.join(name);
    fs::write(&script_path, script)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&script_path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script_path, perms)?;
    }
    Ok(script_path)
}

/// yt-dlp stand-in: answers `--dump-single-json` with a fixed payload and
/// streams a few bytes to stdout for anything else.
pub const YTDLP_STUB: &str = r#"#!/bin/sh
for arg in "$@"; do
    if [ "$arg" = "--dump-single-json" ]; then
cat <<'JSON'
{
  "id": "alpha",
  "title": "Hello, World! (Official)",
  "fulltitle": "Hello, World! (Official)",
  "channel": "Channel",
  "uploader": "Uploader",
  "duration": 212.4,
  "view_count": 1234567,
  "upload_date": "20240102"
}
JSON
        exit 0
    fi
done
printf 'video-bytes'
"#;

/// yt-dlp stand-in whose metadata works but whose download fails.
pub const YTDLP_BROKEN_DOWNLOAD_STUB: &str = r#"#!/bin/sh
for arg in "$@"; do
    if [ "$arg" = "--dump-single-json" ]; then
        echo '{"title":"Broken"}'
        exit 0
    fi
done
echo "ERROR: requested format not available" >&2
exit 1
"#;

/// yt-dlp stand-in that always fails.
pub const FAILING_STUB: &str = r#"#!/bin/sh
echo "boom: invalid data" >&2
exit 1
"#;

/// ffmpeg stand-in: reports progress and writes a file at the last argument.
pub const FFMPEG_STUB: &str = r#"#!/bin/sh
for last; do :; done
echo "out_time_us=1000000"
echo "progress=end"
printf 'encoded' > "$last"
"#;

/// ffprobe stand-in describing a 10 second 1080p clip.
pub const FFPROBE_STUB: &str = r#"#!/bin/sh
cat <<'JSON'
{
  "streams": [
    {"codec_type": "video", "codec_name": "h264", "width": 1920, "height": 1080, "r_frame_rate": "30000/1001"},
    {"codec_type": "audio", "codec_name": "aac", "channels": 2, "sample_rate": "48000"}
  ],
  "format": {"duration": "10.000000", "size": "2048", "bit_rate": "1638"}
}
JSON
"#;
