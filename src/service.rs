use std::{path::Path, sync::Arc};

use anyhow::Context;
use axum::{
    body::Body,
    extract::{
        multipart::{Field, MultipartError, MultipartRejection},
        DefaultBodyLimit, Multipart, Path as UrlPath, State,
    },
    http::{
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
        Request, StatusCode,
    },
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use thiserror::Error;
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::Semaphore};
use tokio_util::{io::ReaderStream, sync::CancellationToken};
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::instrument;

use crate::{
    config::ServerConfig,
    ffmpeg::{FFMpegWrapper, Outcome},
    otel::make_span,
    storage::{CleanupGuard, CleanupStream, IntakeError, Job, Workspace},
    SERVICE_NAME,
};

/// Multipart part carrying the video.
pub const UPLOAD_FIELD: &str = "file";
const AUDIO_MIME: &str = "audio/mpeg";

#[derive(Debug)]
pub struct Service {
    transcoder: FFMpegWrapper,
    workspace: Workspace,
    limiter: Option<Semaphore>,
    shutdown: CancellationToken,
}

impl Service {
    pub fn new(
        transcoder: FFMpegWrapper,
        workspace: Workspace,
        max_concurrent: Option<usize>,
        shutdown: CancellationToken,
    ) -> Self {
        tracing::info!(max_concurrent = ?max_concurrent, "new service");
        Self {
            transcoder,
            workspace,
            limiter: max_concurrent.map(Semaphore::new),
            shutdown,
        }
    }

    /// Reads the `file` part of the form into a freshly staged source file.
    async fn receive(&self, multipart: &mut Multipart) -> Result<Job, SrvError> {
        loop {
            let field = match multipart.next_field().await.map_err(multipart_error)? {
                Some(f) => f,
                None => return Err(SrvError::InvalidArgument("no file uploaded".to_string())),
            };
            if field.name() != Some(UPLOAD_FIELD) {
                tracing::debug!(name = ?field.name(), "skip field");
                continue;
            }
            let original = field.file_name().unwrap_or_default().to_string();
            let job = self.workspace.stage(&original)?;
            tracing::info!(original = %original, id = job.id(), "receiving upload");
            let len = save_upload(job.source(), field).await?;
            tracing::info!(len, file = %job.source().display(), "saved upload");
            return Ok(job);
        }
    }

    async fn transcode(&self, job: &Job) -> Result<(), SrvError> {
        let _permit = match &self.limiter {
            Some(limiter) => {
                tracing::debug!(available = limiter.available_permits(), "wait for slot");
                limiter.acquire().await.ok()
            }
            None => None,
        };
        let outcome = self
            .transcoder
            .transcode_with_cancel(job.source(), job.target(), &self.shutdown)
            .await;
        match outcome {
            Outcome::Succeeded => Ok(()),
            Outcome::Failed(reason) => {
                tracing::warn!(id = job.id(), reason = %reason, "conversion failed");
                Err(SrvError::ConversionFailed)
            }
            Outcome::ToolUnavailable(e) => {
                tracing::error!(error = %e, "ffmpeg unavailable");
                Err(SrvError::ToolUnavailable)
            }
        }
    }
}

pub fn router(service: Arc<Service>, config: &ServerConfig) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|req: &Request<Body>| make_span(req.method(), req.uri().path(), req.headers()));

    Router::new()
        .route("/api/health", get(health))
        .route("/api/convert", post(convert))
        .route("/api/convert/json", post(convert_json))
        .route("/api/download/{name}", get(download))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(config.max_upload_bytes()))
        .layer(middleware::map_response(json_payload_too_large))
        .layer(trace_layer)
        .with_state(service)
}

/// The body limit layer answers with plain text before any handler runs.
async fn json_payload_too_large(resp: Response) -> Response {
    if resp.status() == StatusCode::PAYLOAD_TOO_LARGE {
        tracing::warn!("upload over the size limit");
        return SrvError::PayloadTooLarge.into_response();
    }
    resp
}

#[derive(Debug, Serialize)]
pub struct HealthReply {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
}

async fn health() -> Json<HealthReply> {
    Json(HealthReply {
        status: "ok",
        service: SERVICE_NAME,
        version: env!("CARGO_APP_VERSION"),
    })
}

#[derive(Debug, Serialize)]
pub struct ConvertReply {
    pub success: bool,
    pub message: String,
    pub download_url: String,
}

/// Converts the upload and streams the audio back. Both files are gone once
/// the body has been sent.
#[instrument(skip_all)]
async fn convert(
    State(service): State<Arc<Service>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, SrvError> {
    let mut multipart = multipart.map_err(|e| SrvError::InvalidArgument(e.body_text()))?;
    let job = service.receive(&mut multipart).await?;
    service.transcode(&job).await?;
    let download_name = job.download_name();
    send_file(job.into_target(), &download_name).await
}

/// Converts the upload and keeps the audio for a later `/api/download/{name}`.
#[instrument(skip_all)]
async fn convert_json(
    State(service): State<Arc<Service>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<ConvertReply>, SrvError> {
    let mut multipart = multipart.map_err(|e| SrvError::InvalidArgument(e.body_text()))?;
    let job = service.receive(&mut multipart).await?;
    service.transcode(&job).await?;
    let name = job.target_name();
    let kept = job.into_target().keep();
    tracing::info!(file = %kept.display(), "kept for download");
    Ok(Json(ConvertReply {
        success: true,
        message: "conversion finished".to_string(),
        download_url: format!("/api/download/{name}"),
    }))
}

/// Serves a kept conversion once, then removes it.
#[instrument(skip(service))]
async fn download(
    State(service): State<Arc<Service>>,
    UrlPath(name): UrlPath<String>,
) -> Result<Response, SrvError> {
    let path = service.workspace.locate_output(&name)?;
    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => {}
        _ => return Err(SrvError::NotFound),
    }
    send_file(CleanupGuard::new(path), &name).await
}

async fn send_file(file: CleanupGuard, download_name: &str) -> Result<Response, SrvError> {
    let reader = tokio::fs::File::open(file.path())
        .await
        .with_context(|| format!("can't open {}", file.path().display()))?;
    let len = reader.metadata().await.context("output metadata")?.len();
    tracing::debug!(len, file = %file.path().display(), "sending result");
    let body = Body::from_stream(CleanupStream::new(ReaderStream::new(reader), file));
    Ok((
        [
            (CONTENT_TYPE, AUDIO_MIME.to_string()),
            (CONTENT_LENGTH, len.to_string()),
            (
                CONTENT_DISPOSITION,
                format!("attachment; filename=\"{download_name}\""),
            ),
        ],
        body,
    )
        .into_response())
}

#[instrument(skip(field))]
async fn save_upload(path: &Path, mut field: Field<'_>) -> Result<u64, SrvError> {
    // create_new: a colliding id fails instead of overwriting another upload
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
        .with_context(|| format!("file create {}", path.display()))?;
    let mut len = 0u64;
    while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
        file.write_all(&chunk).await.context("file write")?;
        len += chunk.len() as u64;
    }
    file.flush().await.context("file flush")?;
    Ok(len)
}

fn multipart_error(e: MultipartError) -> SrvError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return SrvError::PayloadTooLarge;
    }
    SrvError::InvalidArgument(e.body_text())
}

#[derive(Debug, Error)]
pub enum SrvError {
    #[error("{0}")]
    InvalidArgument(String),
    #[error("file too large")]
    PayloadTooLarge,
    #[error("file not found")]
    NotFound,
    #[error("conversion failed, check that the file is a valid video")]
    ConversionFailed,
    #[error("ffmpeg not found, install ffmpeg on the server")]
    ToolUnavailable,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<IntakeError> for SrvError {
    fn from(err: IntakeError) -> Self {
        SrvError::InvalidArgument(err.to_string())
    }
}

#[derive(Debug, Serialize)]
struct ErrorReply {
    success: bool,
    error: String,
}

impl IntoResponse for SrvError {
    fn into_response(self) -> Response {
        let status = match &self {
            SrvError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            SrvError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            SrvError::NotFound => StatusCode::NOT_FOUND,
            SrvError::ConversionFailed => StatusCode::INTERNAL_SERVER_ERROR,
            SrvError::ToolUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            SrvError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let error = match &self {
            SrvError::Other(e) => {
                tracing::error!(error = ?e, "request error");
                "internal error".to_string()
            }
            e => e.to_string(),
        };
        (
            status,
            Json(ErrorReply {
                success: false,
                error,
            }),
        )
            .into_response()
    }
}
