//! Staging of uploaded videos and produced audio.
//!
//! Every request gets its own pair of paths, `<stem>_<id>.mp4` in the upload
//! directory and `<stem>_<id>.mp3` in the output directory. Both are owned by
//! [`CleanupGuard`]s, so an early return or error removes whatever was written.

use std::{
    io,
    path::{Path, PathBuf},
    pin::Pin,
    task::{Context, Poll},
};

use anyhow::Context as _;
use futures::Stream;
use thiserror::Error;
use uuid::Uuid;

pub const SOURCE_EXTENSION: &str = "mp4";
pub const TARGET_EXTENSION: &str = "mp3";

const ID_LEN: usize = 8;
const MAX_STEM_LEN: usize = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntakeError {
    #[error("no file selected")]
    NoFileSelected,
    #[error("only .{0} files are accepted")]
    UnsupportedExtension(&'static str),
    #[error("invalid file name")]
    InvalidName,
}

#[derive(Clone, Debug)]
pub struct Workspace {
    upload_dir: PathBuf,
    output_dir: PathBuf,
}

impl Workspace {
    /// Creates both directories if missing.
    pub async fn create(upload_dir: &Path, output_dir: &Path) -> anyhow::Result<Self> {
        for dir in [upload_dir, output_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("create dir {}", dir.display()))?;
        }
        tracing::info!(upload = %upload_dir.display(), output = %output_dir.display(), "workspace");
        Ok(Self {
            upload_dir: upload_dir.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
        })
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Validates the uploaded name and reserves fresh source and target paths.
    /// Nothing is written to disk here.
    pub fn stage(&self, original_name: &str) -> Result<Job, IntakeError> {
        let stem = upload_stem(original_name)?;
        let id = new_id();
        let source = self
            .upload_dir
            .join(format!("{stem}_{id}.{SOURCE_EXTENSION}"));
        let target = self
            .output_dir
            .join(format!("{stem}_{id}.{TARGET_EXTENSION}"));
        tracing::debug!(id = %id, stem = %stem, "staged");
        Ok(Job {
            id,
            stem,
            source: CleanupGuard::new(source),
            target: CleanupGuard::new(target),
        })
    }

    /// Maps a name from a download link back to the output directory.
    pub fn locate_output(&self, name: &str) -> Result<PathBuf, IntakeError> {
        if !is_plain_file_name(name) {
            return Err(IntakeError::InvalidName);
        }
        Ok(self.output_dir.join(name))
    }
}

/// One upload's paths.
#[derive(Debug)]
pub struct Job {
    id: String,
    stem: String,
    source: CleanupGuard,
    target: CleanupGuard,
}

impl Job {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source(&self) -> &Path {
        self.source.path()
    }

    pub fn target(&self) -> &Path {
        self.target.path()
    }

    /// Name offered to the client, without the unique id.
    pub fn download_name(&self) -> String {
        format!("{}.{TARGET_EXTENSION}", self.stem)
    }

    /// Generated file name of the target inside the output directory.
    pub fn target_name(&self) -> String {
        format!("{}_{}.{TARGET_EXTENSION}", self.stem, self.id)
    }

    /// Removes the source and hands over ownership of the target.
    pub fn into_target(self) -> CleanupGuard {
        drop(self.source);
        self.target
    }
}

/// Deletes a file when dropped unless [`CleanupGuard::keep`] was called.
#[derive(Debug)]
pub struct CleanupGuard {
    path: PathBuf,
    armed: bool,
}

impl CleanupGuard {
    pub fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn keep(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(file = %self.path.display(), "removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(file = %self.path.display(), error = %e, "can't remove"),
        }
    }
}

/// Byte stream that owns the guard of the file it reads. The file is removed
/// once the stream is dropped, after the body was sent or the client went away.
pub struct CleanupStream<S> {
    inner: S,
    _guard: CleanupGuard,
}

impl<S> CleanupStream<S> {
    pub fn new(inner: S, guard: CleanupGuard) -> Self {
        Self {
            inner,
            _guard: guard,
        }
    }
}

impl<S: Stream + Unpin> Stream for CleanupStream<S> {
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

fn upload_stem(original_name: &str) -> Result<String, IntakeError> {
    let name = original_name.trim();
    if name.is_empty() {
        return Err(IntakeError::NoFileSelected);
    }
    let suffix = format!(".{SOURCE_EXTENSION}");
    if !name.to_ascii_lowercase().ends_with(&suffix) {
        return Err(IntakeError::UnsupportedExtension(SOURCE_EXTENSION));
    }
    // browsers may send a full client path
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let stem = &base[..base.len() - suffix.len()];
    let stem = sanitize(stem);
    if stem.is_empty() {
        return Ok("upload".to_string());
    }
    Ok(stem)
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_STEM_LEN)
        .collect()
}

fn new_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(ID_LEN);
    id
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}
