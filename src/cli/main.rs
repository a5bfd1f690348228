use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use anyhow::Context;
use audio_extract_rs::{
    config::ConverterConfig,
    ffmpeg::{FFMpegWrapper, Outcome},
    storage::TARGET_EXTENSION,
    SERVICE_NAME,
};
use clap::{Parser, Subcommand};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const BUSY_TICK: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(version = env!("CARGO_APP_VERSION"), name = "audio-extract-cl", about = "Extracts MP3 audio from MP4 video, locally or through audio-extract-rs",
    long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Convert with the local ffmpeg
    Local {
        /// Input video file
        #[arg(short = 'i', long, env, default_value = "video.mp4")]
        file: PathBuf,
        /// Output audio file, defaults to the input name with .mp3
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[command(flatten)]
        converter: ConverterConfig,
    },
    /// Convert through a running server
    Remote {
        /// Server base url
        #[arg(short, long, env, default_value = "http://localhost:5000")]
        url: String,
        /// Input video file
        #[arg(short = 'i', long, env, default_value = "video.mp4")]
        file: PathBuf,
        /// Submit first, then fetch the download link
        #[arg(long, default_value = "false")]
        json: bool,
        /// Send n times
        #[arg(short, long, default_value = "1")]
        times: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::Layer::default().compact())
        .init();
    let args = Args::parse();
    if let Err(e) = main_int(args).await {
        tracing::error!("{:#}", e);
        return Err(e);
    }
    Ok(())
}

async fn main_int(args: Args) -> anyhow::Result<()> {
    tracing::info!(version = env!("CARGO_APP_VERSION"));
    match args.command {
        Cmd::Local {
            file,
            output,
            converter,
        } => {
            let output = output.unwrap_or_else(|| file.with_extension(TARGET_EXTENSION));
            convert_local(&FFMpegWrapper::new(&converter), &file, &output, BUSY_TICK).await
        }
        Cmd::Remote {
            url,
            file,
            json,
            times,
        } => {
            let client = reqwest::Client::new();
            check_health(&client, &url).await?;
            let video = tokio::fs::read(&file)
                .await
                .with_context(|| format!("read file: {}", file.display()))?;
            let file_name = file
                .file_name()
                .and_then(|n| n.to_str())
                .context("input has no file name")?
                .to_string();
            for i in 0..times {
                let data = if json {
                    tracing::info!(i, "submit and fetch");
                    submit_and_fetch(&client, &url, &file_name, video.clone()).await?
                } else {
                    tracing::info!(i, "sync call");
                    convert_remote(&client, &url, &file_name, video.clone()).await?
                };
                let output = numbered_output(&file, i, times);
                save(&output, &data).await?;
            }
            Ok(())
        }
    }
}

async fn convert_local(
    transcoder: &FFMpegWrapper,
    input: &Path,
    output: &Path,
    tick: Duration,
) -> anyhow::Result<()> {
    tracing::info!(input = %input.display(), output = %output.display(), "converting");
    let started = Instant::now();
    let conversion = transcoder.transcode(input, output);
    tokio::pin!(conversion);
    let mut ticker = tokio::time::interval(tick);
    ticker.tick().await;
    let outcome = loop {
        tokio::select! {
            outcome = &mut conversion => break outcome,
            _ = ticker.tick() => tracing::info!(elapsed = ?started.elapsed(), "still converting..."),
        }
    };
    match outcome {
        Outcome::Succeeded => {
            tracing::info!(elapsed = ?started.elapsed(), output = %output.display(), "done");
            Ok(())
        }
        Outcome::Failed(reason) => Err(anyhow::anyhow!("conversion failed: {reason}")),
        Outcome::ToolUnavailable(e) => Err(anyhow::anyhow!(
            "can't run {}: {e}; install ffmpeg or pass --ffmpeg",
            transcoder.program().display()
        )),
    }
}

#[derive(Debug, Deserialize)]
struct HealthReply {
    status: String,
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConvertReply {
    download_url: String,
}

#[derive(Debug, Deserialize)]
struct ErrorReply {
    error: String,
}

async fn check_health(client: &reqwest::Client, url: &str) -> anyhow::Result<()> {
    let reply: HealthReply = client
        .get(format!("{url}/api/health"))
        .send()
        .await
        .context("health request")?
        .error_for_status()?
        .json()
        .await?;
    tracing::info!(status = %reply.status, version = ?reply.version, "got a response.");
    if reply.status != "ok" {
        anyhow::bail!("{SERVICE_NAME} is not healthy");
    }
    Ok(())
}

fn upload_form(file_name: &str, video: Vec<u8>) -> anyhow::Result<Form> {
    let part = Part::bytes(video)
        .file_name(file_name.to_string())
        .mime_str("video/mp4")?;
    Ok(Form::new().part("file", part))
}

async fn convert_remote(
    client: &reqwest::Client,
    url: &str,
    file_name: &str,
    video: Vec<u8>,
) -> anyhow::Result<Vec<u8>> {
    let resp = client
        .post(format!("{url}/api/convert"))
        .multipart(upload_form(file_name, video)?)
        .send()
        .await
        .context("convert request")?;
    read_body(resp).await
}

async fn submit_and_fetch(
    client: &reqwest::Client,
    url: &str,
    file_name: &str,
    video: Vec<u8>,
) -> anyhow::Result<Vec<u8>> {
    let resp = client
        .post(format!("{url}/api/convert/json"))
        .multipart(upload_form(file_name, video)?)
        .send()
        .await
        .context("convert request")?;
    let reply: ConvertReply = serde_json::from_slice(&read_body(resp).await?)?;
    tracing::info!(link = %reply.download_url, "fetching");
    let resp = client
        .get(format!("{url}{}", reply.download_url))
        .send()
        .await
        .context("download request")?;
    read_body(resp).await
}

async fn read_body(resp: reqwest::Response) -> anyhow::Result<Vec<u8>> {
    let status = resp.status();
    let body = resp.bytes().await?;
    if !status.is_success() {
        let msg = serde_json::from_slice::<ErrorReply>(&body)
            .map(|e| e.error)
            .unwrap_or_else(|_| String::from_utf8_lossy(&body).into_owned());
        anyhow::bail!("server returned {status}: {msg}");
    }
    Ok(body.to_vec())
}

fn numbered_output(input: &Path, i: u32, times: u32) -> PathBuf {
    if times <= 1 {
        return input.with_extension(TARGET_EXTENSION);
    }
    input.with_extension(format!("{i}.{TARGET_EXTENSION}"))
}

async fn save(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    tracing::info!(file = %path.display(), len = data.len(), "saving...");
    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(data)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
