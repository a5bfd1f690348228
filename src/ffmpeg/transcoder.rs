use std::{
    ffi::OsString,
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Audio parameters passed to ffmpeg.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioSettings {
    pub bitrate: String,
    pub sample_rate: u32,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            bitrate: "192k".to_string(),
            sample_rate: 44100,
        }
    }
}

/// Result of one conversion attempt.
#[derive(Debug)]
pub enum Outcome {
    Succeeded,
    Failed(Failure),
    /// The executable does not exist.
    ToolUnavailable(std::io::Error),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded)
    }
}

/// Why a conversion counted as failed. Only logged, never shown to callers.
#[derive(Debug, Error)]
pub enum Failure {
    #[error("source file not found: {0}")]
    MissingSource(PathBuf),
    #[error("ffmpeg exited with {code:?}")]
    ExitStatus { code: Option<i32>, stderr: String },
    #[error("ffmpeg succeeded but produced no output")]
    NoOutput,
    #[error("ffmpeg did not finish within {0:?}")]
    TimedOut(Duration),
    #[error("conversion cancelled")]
    Cancelled,
    #[error("can't start ffmpeg: {0}")]
    Spawn(std::io::Error),
    #[error("waiting for ffmpeg: {0}")]
    Wait(std::io::Error),
}

/// Arguments for stripping video and re-encoding audio: `-i <in> -vn -ab <rate> -ar <hz> -y <out>`.
pub fn build_args(input: &Path, output: &Path, audio: &AudioSettings) -> Vec<OsString> {
    vec![
        "-i".into(),
        input.into(),
        "-vn".into(),
        "-ab".into(),
        audio.bitrate.as_str().into(),
        "-ar".into(),
        audio.sample_rate.to_string().into(),
        "-y".into(),
        output.into(),
    ]
}

#[tracing::instrument(skip(program, audio, cancel))]
pub async fn transcode(
    program: &Path,
    input: &Path,
    output: &Path,
    audio: &AudioSettings,
    limit: Option<Duration>,
    cancel: &CancellationToken,
) -> Outcome {
    match tokio::fs::metadata(input).await {
        Ok(meta) if meta.is_file() => {}
        _ => {
            tracing::warn!("no source file");
            return Outcome::Failed(Failure::MissingSource(input.to_path_buf()));
        }
    }

    let mut cmd = Command::new(program);
    cmd.args(build_args(input, output, audio))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    tracing::debug!(program = %program.display(), "call ffmpeg");
    let child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::error!(program = %program.display(), "ffmpeg not found");
            return Outcome::ToolUnavailable(e);
        }
        Err(e) => {
            tracing::error!(program = %program.display(), error = %e, "can't start ffmpeg");
            return Outcome::Failed(Failure::Spawn(e));
        }
    };

    // dropping the wait future kills the child
    let run = async move {
        tokio::select! {
            res = child.wait_with_output() => res.map_err(Failure::Wait),
            _ = cancel.cancelled() => Err(Failure::Cancelled),
        }
    };
    let res = match limit {
        Some(limit) => tokio::time::timeout(limit, run)
            .await
            .unwrap_or(Err(Failure::TimedOut(limit))),
        None => run.await,
    };

    let output_info = match res {
        Ok(o) => o,
        Err(e) => {
            tracing::warn!(error = %e, "ffmpeg aborted");
            return Outcome::Failed(e);
        }
    };

    if !output_info.status.success() {
        let stderr = stderr_tail(&output_info.stderr);
        tracing::warn!(code = ?output_info.status.code(), stderr = %stderr, "ffmpeg failed");
        return Outcome::Failed(Failure::ExitStatus {
            code: output_info.status.code(),
            stderr,
        });
    }

    match tokio::fs::metadata(output).await {
        Ok(meta) if meta.len() > 0 => {
            tracing::debug!(len = meta.len(), "ffmpeg done");
            Outcome::Succeeded
        }
        _ => Outcome::Failed(Failure::NoOutput),
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().rev().take(5).collect();
    lines.into_iter().rev().collect::<Vec<_>>().join("\n")
}
