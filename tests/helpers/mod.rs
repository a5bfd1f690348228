use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
};

use audio_extract_rs::{
    config::{ConverterConfig, ServerConfig},
    ffmpeg::FFMpegWrapper,
    service::{router, Service},
    storage::Workspace,
};
use axum::{
    body::Body,
    http::{header, Request},
    Router,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub const AUDIO_BYTES: &str = "ID3 192k 44100";
pub const VALID_VIDEO: &[u8] = b"\0\0\0\x18ftypmp42 fake video payload";
pub const INVALID_VIDEO: &[u8] = b"this is not a video";

const FAKE_FFMPEG: &str = r#"#!/bin/sh
if [ "$1" = "-version" ]; then echo "ffmpeg version 0.0-fake"; exit 0; fi
[ "$1" = "-i" ] && [ "$3" = "-vn" ] && [ "$4" = "-ab" ] && [ "$6" = "-ar" ] && [ "$8" = "-y" ] || exit 2
if grep -q "not a video" "$2"; then echo "$2: Invalid data found when processing input" >&2; exit 1; fi
printf 'ID3 %s %s' "$5" "$7" > "$9"
"#;

// logs each run into the app root (two levels above the output file)
const LOGGING_FFMPEG: &str = r#"#!/bin/sh
log="$(dirname "$(dirname "$9")")/runs.log"
echo start >> "$log"
sleep 0.3
printf 'ID3 %s %s' "$5" "$7" > "$9"
echo end >> "$log"
"#;

const BOUNDARY: &str = "----audio-extract-test-boundary";

// written once, before any test spawns a child process
fn tools() -> &'static TempDir {
    static TOOLS: OnceLock<TempDir> = OnceLock::new();
    TOOLS.get_or_init(|| {
        let dir = tempfile::tempdir().unwrap();
        for (name, body, mode) in [
            ("ffmpeg", FAKE_FFMPEG, 0o755),
            ("logging-ffmpeg", LOGGING_FFMPEG, 0o755),
            ("noexec-ffmpeg", FAKE_FFMPEG, 0o644),
        ] {
            let path = dir.path().join(name);
            std::fs::write(&path, body).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
        }
        dir
    })
}

pub fn fake_ffmpeg() -> PathBuf {
    tool("ffmpeg")
}

pub fn tool(name: &str) -> PathBuf {
    tools().path().join(name)
}

pub struct TestApp {
    pub router: Router,
    pub dir: TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with(fake_ffmpeg(), 2048).await
    }

    pub async fn with(ffmpeg: PathBuf, max_upload_mb: usize) -> Self {
        Self::with_limits(ffmpeg, max_upload_mb, 2).await
    }

    pub async fn with_limits(ffmpeg: PathBuf, max_upload_mb: usize, max_concurrent: usize) -> Self {
        tools();
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            upload_dir: dir.path().join("uploads"),
            output_dir: dir.path().join("output"),
            max_upload_mb,
            max_concurrent,
            converter: ConverterConfig {
                ffmpeg,
                convert_timeout_sec: 30,
                ..ConverterConfig::default()
            },
        };
        let workspace = Workspace::create(&config.upload_dir, &config.output_dir)
            .await
            .unwrap();
        let service = Service::new(
            FFMpegWrapper::new(&config.converter),
            workspace,
            config.concurrency_limit(),
            CancellationToken::new(),
        );
        Self {
            router: router(Arc::new(service), &config),
            dir,
        }
    }

    /// Lines the logging tool wrote, in order.
    pub fn runs(&self) -> Vec<String> {
        std::fs::read_to_string(self.dir.path().join("runs.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn uploads(&self) -> Vec<PathBuf> {
        list(&self.dir.path().join("uploads"))
    }

    pub fn outputs(&self) -> Vec<PathBuf> {
        list(&self.dir.path().join("output"))
    }
}

fn list(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect()
}

pub fn multipart_body(field: &str, file_name: &str, content: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\nContent-Type: video/mp4\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

pub fn upload_request(uri: &str, field: &str, file_name: &str, content: &[u8]) -> Request<Body> {
    let body = multipart_body(field, file_name, content);
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .header(header::CONTENT_LENGTH, body.len())
        .body(Body::from(body))
        .unwrap()
}

pub fn get_request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}
