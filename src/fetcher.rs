//! Resolves a selection token to an extractor request and materializes the
//! file in the download directory.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::TranscodePolicy,
    error::ServiceError,
    extractor::{FetchRequest, MetadataProvider, StreamDescriptor, StreamFetcher},
    resolver::{AUDIO_TOKEN, filter_streams, parse_bucket_token},
    site::{Site, SitePolicy, validate_source_url},
    store::{FileStore, cache_key, is_audio_filename},
    transcode::Transcoder,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Audio,
    Bucket(u32),
    Direct(String),
}

impl Selection {
    pub fn parse(token: &str) -> Self {
        if token.eq_ignore_ascii_case(AUDIO_TOKEN) {
            Self::Audio
        } else if let Some(height) = parse_bucket_token(token) {
            Self::Bucket(height)
        } else {
            Self::Direct(token.to_string())
        }
    }
}

/// Highest stream at or below `ceiling`, else the one closest to it.
pub fn pick_for_bucket<'a>(
    candidates: &[&'a StreamDescriptor],
    ceiling: u32,
) -> Option<&'a StreamDescriptor> {
    let below = candidates
        .iter()
        .filter(|stream| stream.height.is_some_and(|height| height <= ceiling))
        .max_by_key(|stream| stream.height);
    if let Some(stream) = below {
        return Some(*stream);
    }

    candidates
        .iter()
        .filter(|stream| stream.height.is_some())
        .min_by_key(|stream| stream.height.map(|height| height.abs_diff(ceiling)))
        .or_else(|| candidates.first())
        .copied()
}

pub struct Fetcher {
    metadata: Arc<dyn MetadataProvider>,
    streams: Arc<dyn StreamFetcher>,
    transcoder: Arc<dyn Transcoder>,
    store: Arc<FileStore>,
    target_container: String,
    audio_container: String,
    transcode: TranscodePolicy,
}

impl Fetcher {
    pub fn new(
        metadata: Arc<dyn MetadataProvider>,
        streams: Arc<dyn StreamFetcher>,
        transcoder: Arc<dyn Transcoder>,
        store: Arc<FileStore>,
        target_container: impl Into<String>,
        audio_container: impl Into<String>,
        transcode: TranscodePolicy,
    ) -> Self {
        Self {
            metadata,
            streams,
            transcoder,
            store,
            target_container: target_container.into(),
            audio_container: audio_container.into(),
            transcode,
        }
    }

    /// Materializes the selection and returns the file's basename.
    pub async fn fetch(&self, url: &str, token: &str) -> Result<String, ServiceError> {
        let url = url.trim();
        let token = token.trim();
        if url.is_empty() {
            return Err(ServiceError::InvalidInput("URL is required".to_string()));
        }
        if token.is_empty() {
            return Err(ServiceError::InvalidInput("format_id is required".to_string()));
        }
        validate_source_url(url)?;

        let key = cache_key(url, token);
        let guard = self.store.begin(&key).await;
        let result = self.fetch_locked(&key, url, token).await;
        self.store.release(&key, guard).await;
        result
    }

    async fn fetch_locked(
        &self,
        key: &str,
        url: &str,
        token: &str,
    ) -> Result<String, ServiceError> {
        if let Some(filename) = self.store.recall(key).await {
            info!("Reusing {filename} for {url:?} [{token}]");
            return Ok(filename);
        }

        let filename = self.materialize(url, Selection::parse(token)).await?;
        self.store.remember(key, &filename).await;
        info!("Materialized {filename} for {url:?} [{token}]");
        Ok(filename)
    }

    async fn materialize(&self, url: &str, selection: Selection) -> Result<String, ServiceError> {
        let policy = Site::detect(url).policy();
        let is_audio = selection == Selection::Audio;

        let (selector, merge_container, extract_audio) = match selection {
            Selection::Audio => (
                format!("bestaudio[ext={0}]/bestaudio", self.audio_container),
                None,
                Some(self.audio_container.clone()),
            ),
            Selection::Bucket(ceiling) => (
                self.bucket_selector(url, &policy, ceiling).await?,
                Some(self.target_container.clone()),
                None,
            ),
            Selection::Direct(format_id) => {
                let selector = if policy.merge_audio {
                    format!("{format_id}+bestaudio/{format_id}")
                } else {
                    format_id
                };
                (selector, Some(self.target_container.clone()), None)
            }
        };

        let request = FetchRequest {
            url: url.to_string(),
            selector,
            output_dir: self.store.root().to_path_buf(),
            file_stem: Uuid::new_v4().simple().to_string(),
            merge_container,
            extract_audio,
        };
        debug!("Fetching {url:?} with selector {:?}", request.selector);

        let mut path = self.streams.fetch(&request).await?;
        if is_audio {
            let filename = basename(&path)?;
            if !is_audio_filename(&filename) {
                remove_quietly(&path).await;
                return Err(ServiceError::Fetch(format!(
                    "audio extraction produced {filename}, not an audio file"
                )));
            }
            return Ok(filename);
        }
        if self.transcode != TranscodePolicy::Off {
            path = self.postprocess(path).await?;
        }

        basename(&path)
    }

    async fn bucket_selector(
        &self,
        url: &str,
        policy: &SitePolicy,
        ceiling: u32,
    ) -> Result<String, ServiceError> {
        let info = self.metadata.probe(url).await.map_err(|error| match error {
            ServiceError::Extraction(message) => ServiceError::Fetch(message),
            other => other,
        })?;
        let candidates = filter_streams(&info.formats, policy, &self.target_container);

        Ok(match pick_for_bucket(&candidates, ceiling) {
            Some(stream) if stream.has_audio() => stream.format_id.clone(),
            Some(stream) => format!("{0}+bestaudio/{0}", stream.format_id),
            None => format!("bestvideo[height<={ceiling}]+bestaudio/best[height<={ceiling}]/best"),
        })
    }

    /// Re-encodes `original` into the target container, replacing it.
    async fn postprocess(&self, original: PathBuf) -> Result<PathBuf, ServiceError> {
        let stem = original
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("download")
            .to_string();
        let intermediate =
            original.with_file_name(format!("{stem}.transcoding.{}", self.target_container));
        let target = original.with_file_name(format!("{stem}.{}", self.target_container));

        match self.transcoder.transcode(&original, &intermediate).await {
            Ok(()) => {
                if original != target {
                    remove_quietly(&original).await;
                }
                tokio::fs::rename(&intermediate, &target).await?;
                Ok(target)
            }
            Err(error) => {
                remove_quietly(&intermediate).await;
                match self.transcode {
                    TranscodePolicy::BestEffort => {
                        warn!("Serving {original:?} untranscoded: {error}");
                        Ok(original)
                    }
                    _ => {
                        remove_quietly(&original).await;
                        Err(error)
                    }
                }
            }
        }
    }
}

fn basename(path: &Path) -> Result<String, ServiceError> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(ToString::to_string)
        .ok_or_else(|| ServiceError::Fetch(format!("unusable output path {path:?}")))
}

async fn remove_quietly(path: &Path) {
    if let Err(error) = tokio::fs::remove_file(path).await
        && error.kind() != ErrorKind::NotFound
    {
        warn!("Could not delete {path:?}: {error}");
    }
}
