//! Turns the extractor's stream list into the quality choices shown to users.

use std::{cmp::Ordering, collections::HashMap, sync::Arc};

use serde::Serialize;
use tracing::{debug, info};

use crate::{
    config::EmptyFormatsPolicy,
    error::ServiceError,
    extractor::{MetadataProvider, StreamDescriptor},
    site::{Site, SitePolicy, validate_source_url},
};

/// Token that selects the best audio-only rendition.
pub const AUDIO_TOKEN: &str = "audio";

/// Height buckets a client may request without naming a concrete stream.
pub const HEIGHT_BUCKETS: [u32; 4] = [1080, 720, 480, 360];

/// Buckets advertised when no concrete stream qualifies.
const FALLBACK_BUCKETS: [u32; 3] = [720, 480, 360];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QualityChoice {
    pub format_id: String,
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolveMode {
    #[default]
    Video,
    Audio,
}

pub fn bucket_token(height: u32) -> String {
    format!("auto-{height}p")
}

/// Parses `auto-<h>p` for one of the known [`HEIGHT_BUCKETS`].
pub fn parse_bucket_token(token: &str) -> Option<u32> {
    let height = token
        .strip_prefix("auto-")?
        .strip_suffix('p')?
        .parse::<u32>()
        .ok()?;
    HEIGHT_BUCKETS.contains(&height).then_some(height)
}

/// Applies container, codec, height and progressive constraints.
pub fn filter_streams<'a>(
    streams: &'a [StreamDescriptor],
    policy: &SitePolicy,
    target_container: &str,
) -> Vec<&'a StreamDescriptor> {
    streams
        .iter()
        .filter(|stream| stream.has_video())
        .filter(|stream| {
            stream
                .ext
                .as_deref()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(target_container))
        })
        .filter(|stream| match policy.codec_family {
            Some(family) => stream
                .vcodec
                .as_deref()
                .is_some_and(|codec| codec.to_ascii_lowercase().starts_with(family)),
            None => true,
        })
        .filter(|stream| match (policy.max_height, stream.height) {
            (Some(ceiling), Some(height)) => height <= ceiling,
            _ => true,
        })
        .filter(|stream| !policy.require_progressive || stream.is_progressive())
        .collect()
}

/// Keeps the highest-bitrate stream per known height, in first-seen order.
/// Streams without a height are never merged.
pub fn dedupe_by_height<'a>(streams: Vec<&'a StreamDescriptor>) -> Vec<&'a StreamDescriptor> {
    let mut kept: Vec<&StreamDescriptor> = Vec::with_capacity(streams.len());
    let mut slot_by_height: HashMap<u32, usize> = HashMap::new();

    for stream in streams {
        let Some(height) = stream.height else {
            kept.push(stream);
            continue;
        };

        match slot_by_height.get(&height) {
            Some(&slot) => {
                let current = kept[slot].tbr.unwrap_or_default();
                if stream.tbr.unwrap_or_default() > current {
                    kept[slot] = stream;
                }
            }
            None => {
                slot_by_height.insert(height, kept.len());
                kept.push(stream);
            }
        }
    }

    kept
}

pub fn label_for(stream: &StreamDescriptor) -> String {
    match stream.height {
        Some(height) => match stream.fps.filter(|fps| *fps > 0.0) {
            Some(fps) => format!("{height}p {}fps", fps.round() as u32),
            None => format!("{height}p"),
        },
        None => stream
            .format_note
            .as_deref()
            .map(str::trim)
            .filter(|note| !note.is_empty())
            .unwrap_or(stream.format_id.as_str())
            .to_uppercase(),
    }
}

/// Full video pipeline: filter, dedupe, label and sort by descending height.
pub fn build_video_choices(
    streams: &[StreamDescriptor],
    policy: &SitePolicy,
    target_container: &str,
) -> Vec<QualityChoice> {
    let mut candidates = dedupe_by_height(filter_streams(streams, policy, target_container));

    // Stable sort keeps input order among equal heights; unknown heights go last.
    candidates.sort_by(|a, b| match (a.height, b.height) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });

    candidates
        .into_iter()
        .map(|stream| QualityChoice {
            format_id: stream.format_id.clone(),
            label: label_for(stream),
        })
        .collect()
}

pub fn audio_choice(audio_container: &str) -> QualityChoice {
    QualityChoice {
        format_id: AUDIO_TOKEN.to_string(),
        label: format!("Audio ({})", audio_container.to_uppercase()),
    }
}

pub fn fallback_choices() -> Vec<QualityChoice> {
    FALLBACK_BUCKETS
        .iter()
        .map(|height| QualityChoice {
            format_id: bucket_token(*height),
            label: format!("{height}p"),
        })
        .collect()
}

pub struct FormatResolver {
    metadata: Arc<dyn MetadataProvider>,
    target_container: String,
    audio_container: String,
    empty_formats: EmptyFormatsPolicy,
}

impl FormatResolver {
    pub fn new(
        metadata: Arc<dyn MetadataProvider>,
        target_container: impl Into<String>,
        audio_container: impl Into<String>,
        empty_formats: EmptyFormatsPolicy,
    ) -> Self {
        Self {
            metadata,
            target_container: target_container.into(),
            audio_container: audio_container.into(),
            empty_formats,
        }
    }

    pub async fn resolve(
        &self,
        url: &str,
        mode: ResolveMode,
    ) -> Result<Vec<QualityChoice>, ServiceError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(ServiceError::InvalidInput("URL is required".to_string()));
        }
        validate_source_url(url)?;

        let site = Site::detect(url);
        let info = self.metadata.probe(url).await?;
        debug!(
            "Extractor listed {} stream(s) for {url:?} ({site:?})",
            info.formats.len()
        );

        let choices = match mode {
            ResolveMode::Video => {
                build_video_choices(&info.formats, &site.policy(), &self.target_container)
            }
            ResolveMode::Audio => {
                if info.formats.iter().any(StreamDescriptor::has_audio) {
                    vec![audio_choice(&self.audio_container)]
                } else {
                    Vec::new()
                }
            }
        };

        if !choices.is_empty() {
            return Ok(choices);
        }

        match self.empty_formats {
            EmptyFormatsPolicy::NotFound => Err(ServiceError::NotFound(
                "No downloadable formats found".to_string(),
            )),
            EmptyFormatsPolicy::Fallback => {
                info!("No qualifying streams for {url:?}; advertising fallback choices.");
                Ok(match mode {
                    ResolveMode::Video => fallback_choices(),
                    ResolveMode::Audio => vec![audio_choice(&self.audio_container)],
                })
            }
        }
    }
}
