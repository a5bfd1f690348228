use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use anyhow::Context;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::transcoder::{transcode, AudioSettings, Outcome};
use crate::config::ConverterConfig;

#[derive(Clone, Debug)]
pub struct FFMpegWrapper {
    program: PathBuf,
    audio: AudioSettings,
    timeout: Option<Duration>,
}

impl FFMpegWrapper {
    pub fn new(config: &ConverterConfig) -> Self {
        tracing::debug!(program = %config.ffmpeg.display(), "Initializing FFMpegWrapper");
        FFMpegWrapper {
            program: config.ffmpeg.clone(),
            audio: AudioSettings {
                bitrate: config.audio_bitrate.clone(),
                sample_rate: config.sample_rate,
            },
            timeout: config.convert_timeout(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Runs one conversion and waits for it to finish.
    pub async fn transcode(&self, input: &Path, output: &Path) -> Outcome {
        self.transcode_with_cancel(input, output, &CancellationToken::new())
            .await
    }

    #[tracing::instrument(skip(self, cancel))]
    pub async fn transcode_with_cancel(
        &self,
        input: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Outcome {
        transcode(
            &self.program,
            input,
            output,
            &self.audio,
            self.timeout,
            cancel,
        )
        .await
    }

    /// First line of `ffmpeg -version`; fails when the tool is missing.
    pub async fn version(&self) -> anyhow::Result<String> {
        let out = Command::new(&self.program)
            .arg("-version")
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await
            .with_context(|| format!("can't run {}", self.program.display()))?;
        if !out.status.success() {
            anyhow::bail!("{} -version exited with {}", self.program.display(), out.status);
        }
        Ok(String::from_utf8_lossy(&out.stdout)
            .lines()
            .next()
            .unwrap_or_default()
            .to_string())
    }
}
