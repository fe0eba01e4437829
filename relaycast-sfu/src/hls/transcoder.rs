//! Transcoder subprocess supervision
//!
//! A transcoder reads RTP described by an SDP file and writes a rolling HLS
//! playlist. The process handle is owned by whoever launched it: dropping or
//! terminating the handle kills the process.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::{Result, SfuError};

/// Encoder settings, selected once at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodingPreset {
    /// Small frames and one encoder thread for weak hosts
    Constrained,
    Normal,
}

impl EncodingPreset {
    #[must_use]
    pub const fn from_low_resource(low_resource: bool) -> Self {
        if low_resource {
            Self::Constrained
        } else {
            Self::Normal
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Constrained => "LOW_RESOURCE",
            Self::Normal => "NORMAL",
        }
    }

    /// Target segment duration in seconds
    #[must_use]
    pub const fn segment_seconds(self) -> u32 {
        match self {
            Self::Constrained => 4,
            Self::Normal => 2,
        }
    }

    #[must_use]
    pub fn encoder_args(self) -> Vec<String> {
        let (preset, crf, size, fps, maxrate, bufsize, gop, threads) = match self {
            Self::Constrained => ("ultrafast", "28", "640x480", "15", "500k", "1M", "30", "1"),
            Self::Normal => ("fast", "23", "1280x720", "30", "2M", "4M", "60", "2"),
        };

        [
            "-preset", preset, "-tune", "zerolatency", "-crf", crf, "-s", size, "-r", fps,
            "-maxrate", maxrate, "-bufsize", bufsize, "-g", gop, "-threads", threads,
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }
}

/// Everything needed to start one transcoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeJob {
    pub sdp_path: PathBuf,
    pub manifest_path: PathBuf,
    pub segment_pattern: PathBuf,
    pub preset: EncodingPreset,
    pub list_size: u32,
}

impl TranscodeJob {
    /// Job for bridge slot `slot`: `user<slot>.sdp`, `user<slot>.m3u8`,
    /// `user<slot>_segment%03d.ts`
    pub fn for_slot(output_dir: &Path, slot: u32, preset: EncodingPreset, list_size: u32) -> Self {
        Self {
            sdp_path: output_dir.join(format!("user{slot}.sdp")),
            manifest_path: output_dir.join(format!("user{slot}.m3u8")),
            segment_pattern: output_dir.join(format!("user{slot}_segment%03d.ts")),
            preset,
            list_size,
        }
    }

    /// The standalone ingest job: `stream.sdp`, `playlist.m3u8`, `segment%03d.ts`
    pub fn ingest(output_dir: &Path, preset: EncodingPreset, list_size: u32) -> Self {
        Self {
            sdp_path: output_dir.join("stream.sdp"),
            manifest_path: output_dir.join("playlist.m3u8"),
            segment_pattern: output_dir.join("segment%03d.ts"),
            preset,
            list_size,
        }
    }

    /// Command line arguments, program name excluded
    #[must_use]
    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = [
            "-y",
            "-protocol_whitelist",
            "file,udp,rtp",
            "-max_delay",
            "500000",
            "-f",
            "sdp",
            "-i",
        ]
        .into_iter()
        .map(String::from)
        .collect();

        args.push(self.sdp_path.display().to_string());
        args.extend(["-c:v", "libx264"].map(String::from));
        args.extend(self.preset.encoder_args());
        args.extend([
            "-f".to_string(),
            "hls".to_string(),
            "-hls_time".to_string(),
            self.preset.segment_seconds().to_string(),
            "-hls_list_size".to_string(),
            self.list_size.to_string(),
            "-hls_flags".to_string(),
            "delete_segments".to_string(),
            "-hls_segment_filename".to_string(),
            self.segment_pattern.display().to_string(),
            self.manifest_path.display().to_string(),
        ]);
        args
    }
}

/// Starts transcoder processes
#[async_trait]
pub trait TranscoderLauncher: Send + Sync + 'static {
    async fn launch(&self, job: &TranscodeJob) -> Result<Box<dyn TranscoderProcess>>;
}

/// A running transcoder
pub trait TranscoderProcess: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Kill the process; calling it again is a no-op
    fn terminate(&mut self);
}

/// Launches the ffmpeg binary
#[derive(Debug, Clone)]
pub struct FfmpegLauncher {
    program: PathBuf,
}

impl FfmpegLauncher {
    /// Check that `program -version` runs before anything depends on it
    pub async fn probe(program: impl Into<PathBuf>) -> Result<Self> {
        let program = program.into();
        let unavailable = |reason: String| SfuError::ExternalToolUnavailable {
            tool: program.display().to_string(),
            reason,
        };

        let output = Command::new(&program)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        if !output.status.success() {
            return Err(unavailable(format!("exited with {}", output.status)));
        }

        let version = String::from_utf8_lossy(&output.stdout);
        info!(
            program = %program.display(),
            version = version.lines().next().unwrap_or_default(),
            "Transcoder available"
        );

        Ok(Self { program })
    }

    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }
}

#[async_trait]
impl TranscoderLauncher for FfmpegLauncher {
    async fn launch(&self, job: &TranscodeJob) -> Result<Box<dyn TranscoderProcess>> {
        let args = job.args();
        debug!(program = %self.program.display(), args = %args.join(" "), "Starting transcoder");

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let pid = child.id();
        let manifest = job.manifest_path.display().to_string();

        if let Some(stderr) = child.stderr.take() {
            let manifest = manifest.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.contains("Error") || line.contains("failed") {
                        warn!(manifest = %manifest, "Transcoder: {line}");
                    }
                }
                debug!(manifest = %manifest, "Transcoder output closed");
            });
        }

        info!(
            pid = ?pid,
            manifest = %manifest,
            preset = job.preset.label(),
            "Transcoder started"
        );

        Ok(Box::new(FfmpegProcess {
            child: Some(child),
            pid,
        }))
    }
}

struct FfmpegProcess {
    child: Option<Child>,
    pid: Option<u32>,
}

impl TranscoderProcess for FfmpegProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn terminate(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        if let Err(e) = child.start_kill() {
            debug!(pid = ?self.pid, error = %e, "Transcoder already exited");
        }

        // Reap in the background so the process does not linger as a zombie
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let pid = self.pid;
            handle.spawn(async move {
                match child.wait().await {
                    Ok(status) => debug!(pid = ?pid, %status, "Transcoder exited"),
                    Err(e) => warn!(pid = ?pid, error = %e, "Failed to reap transcoder"),
                }
            });
        }
    }
}

impl Drop for FfmpegProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}
