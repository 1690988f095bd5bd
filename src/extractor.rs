//! The boundary to the external extraction tool.
//!
//! [`MetadataProvider`] lists the streams behind a URL without downloading
//! anything, [`StreamFetcher`] materializes one selection on disk. [`YtDlp`]
//! implements both by running the `yt-dlp` executable.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Output,
    time::Duration,
};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::{process::Command, time::timeout};
use tracing::{debug, warn};

use crate::error::ServiceError;

/// One retrievable track or mux option as reported by the extractor.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamDescriptor {
    pub format_id: String,
    pub ext: Option<String>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub height: Option<u32>,
    pub fps: Option<f32>,
    pub tbr: Option<f32>,
    pub format_note: Option<String>,
}

impl StreamDescriptor {
    /// `"none"` is how the extractor marks an absent track; a missing codec
    /// field only means the codec is unknown.
    pub fn has_video(&self) -> bool {
        self.vcodec.as_deref() != Some("none")
    }

    pub fn has_audio(&self) -> bool {
        self.acodec.as_deref() != Some("none")
    }

    pub fn is_progressive(&self) -> bool {
        self.has_video() && self.has_audio()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaInfo {
    #[serde(default)]
    pub formats: Vec<StreamDescriptor>,
}

/// A single materialization job handed to a [`StreamFetcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    /// Format expression understood by the extractor.
    pub selector: String,
    pub output_dir: PathBuf,
    /// File stem of the output; the extractor picks the extension.
    pub file_stem: String,
    /// Container to merge separate video and audio tracks into.
    pub merge_container: Option<String>,
    /// Convert the result to an audio-only file in this container.
    pub extract_audio: Option<String>,
}

#[async_trait]
pub trait MetadataProvider: Send + Sync {
    async fn probe(&self, url: &str) -> Result<MediaInfo, ServiceError>;
}

#[async_trait]
pub trait StreamFetcher: Send + Sync {
    /// Downloads the selection and returns the path of the final file.
    async fn fetch(&self, request: &FetchRequest) -> Result<PathBuf, ServiceError>;
}

#[derive(Debug, Clone)]
pub struct YtDlp {
    bin: String,
    timeout: Duration,
}

impl YtDlp {
    pub fn new(bin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            timeout,
        }
    }

    async fn run(&self, args: Vec<String>) -> Result<Output, String> {
        debug!("Running {} {:?}", self.bin, args);
        let command_future = Command::new(&self.bin)
            .args(args)
            .kill_on_drop(true)
            .output();
        let output = timeout(self.timeout, command_future)
            .await
            .map_err(|_| {
                format!(
                    "{} did not finish within {} seconds",
                    self.bin,
                    self.timeout.as_secs()
                )
            })?
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    format!("{} is not installed or not on PATH", self.bin)
                } else {
                    format!("could not run {}: {error}", self.bin)
                }
            })?;

        if !output.status.success() {
            return Err(run_error_message(&output.stderr));
        }

        Ok(output)
    }
}

#[async_trait]
impl MetadataProvider for YtDlp {
    async fn probe(&self, url: &str) -> Result<MediaInfo, ServiceError> {
        let output = self
            .run(probe_args(url))
            .await
            .map_err(ServiceError::Extraction)?;

        serde_json::from_slice(&output.stdout).map_err(|error| {
            warn!("Unreadable extractor JSON for {url:?}: {error}");
            ServiceError::Extraction(format!("could not read stream metadata: {error}"))
        })
    }
}

#[async_trait]
impl StreamFetcher for YtDlp {
    async fn fetch(&self, request: &FetchRequest) -> Result<PathBuf, ServiceError> {
        let output = self
            .run(fetch_args(request))
            .await
            .map_err(ServiceError::Fetch)?;
        let printed_path = extract_printed_path(&output.stdout);
        resolve_downloaded_file(&request.output_dir, &request.file_stem, printed_path.as_deref())
            .await
    }
}

fn probe_args(url: &str) -> Vec<String> {
    vec![
        "-J".to_string(),
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        "--no-check-certificates".to_string(),
        "--".to_string(),
        url.to_string(),
    ]
}

fn fetch_args(request: &FetchRequest) -> Vec<String> {
    let template = request
        .output_dir
        .join(format!("{}.%(ext)s", request.file_stem));

    let mut args = vec![
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        "--no-check-certificates".to_string(),
        "--newline".to_string(),
        "--no-mtime".to_string(),
        "--print".to_string(),
        "after_move:filepath".to_string(),
        "-o".to_string(),
        template.to_string_lossy().into_owned(),
        "-f".to_string(),
        request.selector.clone(),
    ];

    if let Some(container) = &request.merge_container {
        args.push("--merge-output-format".to_string());
        args.push(container.clone());
    }

    if let Some(container) = &request.extract_audio {
        args.push("-x".to_string());
        args.push("--audio-format".to_string());
        args.push(container.clone());
        args.push("--audio-quality".to_string());
        args.push("0".to_string());
    }

    args.push("--".to_string());
    args.push(request.url.clone());
    args
}

fn run_error_message(stderr: &[u8]) -> String {
    let message = String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("the extractor exited without a message")
        .to_string();

    if message.to_ascii_lowercase().contains("unsupported url") {
        "Unsupported or invalid URL.".to_string()
    } else {
        message
    }
}

fn extract_printed_path(stdout: &[u8]) -> Option<String> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .map(ToString::to_string)
}

/// Finds the file the extractor produced, refusing anything outside `dir`.
async fn resolve_downloaded_file(
    dir: &Path,
    file_stem: &str,
    printed_path: Option<&str>,
) -> Result<PathBuf, ServiceError> {
    let canonical_dir = tokio::fs::canonicalize(dir).await?;

    if let Some(path_value) = printed_path {
        for candidate in [PathBuf::from(path_value), dir.join(path_value)] {
            if let Some(path) = resolve_candidate(&canonical_dir, &candidate).await? {
                return Ok(path);
            }
        }
    }

    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let matches_stem = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .is_some_and(|stem| stem == file_stem);
        if matches_stem && let Some(path) = resolve_candidate(&canonical_dir, &path).await? {
            return Ok(path);
        }
    }

    Err(ServiceError::Fetch(
        "the extractor finished but no output file was found".to_string(),
    ))
}

async fn resolve_candidate(
    canonical_dir: &Path,
    candidate: &Path,
) -> Result<Option<PathBuf>, ServiceError> {
    let metadata = match tokio::fs::metadata(candidate).await {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(error.into()),
    };

    if !metadata.is_file() {
        return Ok(None);
    }

    let canonical = tokio::fs::canonicalize(candidate).await?;
    if !canonical.starts_with(canonical_dir) {
        warn!("Ignoring extractor output outside the download directory: {canonical:?}");
        return Ok(None);
    }

    Ok(Some(canonical))
}
