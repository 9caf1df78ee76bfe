// SPDX-FileCopyrightText: © 2025 Livereel Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! worker/transcode/muxer.rs: The muxer child process.
//!
//! Raw recorder bytes go in on stdin (container framing preserved); HLS
//! segments and the rolling manifest come out in a private temp directory.
//! The profile is tuned for zero-latency live output: baseline video codec
//! with the fastest preset, fixed bitrate ceiling, low-latency tune.

use std::io;
use std::path::Path;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tracing::{debug, warn};

use super::{lock_state, SharedState, MUXER_ERRORS_RETAINED};

pub struct SpawnedMuxer {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stderr: ChildStderr,
}

/// Spawns the muxer with the zero-latency HLS profile.
///
/// # Errors
///
/// Returns an error if the binary cannot be spawned (e.g. not on PATH) or a
/// pipe cannot be taken.
pub fn spawn(program: &str, out_dir: &Path, segment_seconds: u32) -> io::Result<SpawnedMuxer> {
    let mut command = Command::new(program);
    command
        .arg("-hide_banner")
        .args(["-loglevel", "info"])
        .args(["-i", "pipe:0"])
        .args(["-c:v", "libx264", "-preset", "ultrafast", "-tune", "zerolatency"])
        .args(["-b:v", "2500k", "-maxrate", "2500k", "-bufsize", "5000k"])
        .args(["-c:a", "aac", "-b:a", "128k"])
        .args(["-f", "hls"])
        .arg("-hls_time")
        .arg(segment_seconds.to_string())
        .args(["-hls_list_size", "0"])
        .args(["-hls_flags", "append_list+split_by_time"])
        .arg("-hls_segment_filename")
        .arg(out_dir.join("segment_%05d.ts"))
        .arg(out_dir.join("stream.m3u8"));

    // The child inherits nothing beyond what the worker sets; PATH is kept
    // so the program itself and its codec helpers resolve.
    command.env_clear();
    if let Ok(path) = std::env::var("PATH") {
        command.env("PATH", path);
    }

    command
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn()?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| io::Error::other("muxer stdin not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::other("muxer stderr not captured"))?;

    Ok(SpawnedMuxer { child, stdin, stderr })
}

/// Drains the muxer's stderr line by line. Segment-open markers are
/// informational; error-flagged lines are retained (last
/// [`MUXER_ERRORS_RETAINED`]) for the terminal failure reason.
pub async fn read_stderr(stderr: ChildStderr, stream_id: String, shared: SharedState) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.contains("Opening '") && line.contains(".ts") {
            debug!(stream_id = %stream_id, line = %line, "Muxer opened segment");
            continue;
        }

        let lowered = line.to_ascii_lowercase();
        if lowered.contains("error") || lowered.contains("invalid") {
            warn!(stream_id = %stream_id, line = %line, "Muxer error output");
            let mut state = lock_state(&shared);
            state.muxer_errors.push_back(line);
            while state.muxer_errors.len() > MUXER_ERRORS_RETAINED {
                state.muxer_errors.pop_front();
            }
        } else {
            debug!(stream_id = %stream_id, line = %line, "Muxer output");
        }
    }
}
