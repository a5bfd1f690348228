use std::{path::PathBuf, time::Duration};

/// Settings for the ffmpeg invocation, shared by the server and the command line tool.
#[derive(clap::Args, Clone, Debug)]
pub struct ConverterConfig {
    /// ffmpeg executable, resolved on PATH when not absolute
    #[arg(long, env, default_value = "ffmpeg")]
    pub ffmpeg: PathBuf,
    /// Max seconds a single conversion may run, 0 disables the limit
    #[arg(long, env, default_value = "900")]
    pub convert_timeout_sec: u64,
    /// Output audio bitrate (ffmpeg -ab)
    #[arg(long, env, default_value = "192k")]
    pub audio_bitrate: String,
    /// Output sample rate (ffmpeg -ar)
    #[arg(long, env, default_value = "44100")]
    pub sample_rate: u32,
}

impl ConverterConfig {
    pub fn convert_timeout(&self) -> Option<Duration> {
        match self.convert_timeout_sec {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            convert_timeout_sec: 900,
            audio_bitrate: "192k".to_string(),
            sample_rate: 44100,
        }
    }
}

#[derive(clap::Args, Clone, Debug)]
pub struct ServerConfig {
    /// Directory where uploads are staged
    #[arg(long, env, default_value = "uploads")]
    pub upload_dir: PathBuf,
    /// Directory where converted audio is written
    #[arg(long, env, default_value = "output")]
    pub output_dir: PathBuf,
    /// Max request body size in MB
    #[arg(long, env, default_value = "2048")]
    pub max_upload_mb: usize,
    /// Max simultaneous ffmpeg runs, 0 means unlimited
    #[arg(long, env, default_value = "0")]
    pub max_concurrent: usize,
    #[command(flatten)]
    pub converter: ConverterConfig,
}

impl ServerConfig {
    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }

    pub fn concurrency_limit(&self) -> Option<usize> {
        (self.max_concurrent > 0).then_some(self.max_concurrent)
    }
}
