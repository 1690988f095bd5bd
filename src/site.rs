use url::Url;

use crate::error::ServiceError;

/// Source sites with their own selection rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Site {
    YouTube,
    TikTok,
    Facebook,
    Generic,
}

/// Per-site stream filtering rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SitePolicy {
    /// Required video codec family prefix, e.g. `avc1`.
    pub codec_family: Option<&'static str>,
    pub max_height: Option<u32>,
    /// Keep only streams that already carry audio.
    pub require_progressive: bool,
    /// Ask the extractor to mux the best audio onto the selected stream.
    pub merge_audio: bool,
}

impl Site {
    pub fn detect(url: &str) -> Self {
        let Some(host) = Url::parse(url)
            .ok()
            .and_then(|parsed| parsed.host_str().map(str::to_ascii_lowercase))
        else {
            return Self::Generic;
        };

        if host_matches(&host, &["youtube.com", "youtu.be", "youtube-nocookie.com"]) {
            Self::YouTube
        } else if host_matches(&host, &["tiktok.com"]) {
            Self::TikTok
        } else if host_matches(&host, &["facebook.com", "fb.watch", "fb.com"]) {
            Self::Facebook
        } else {
            Self::Generic
        }
    }

    pub fn policy(self) -> SitePolicy {
        match self {
            // H.264 keeps the output playable on iOS and older smart TVs.
            Self::YouTube => SitePolicy {
                codec_family: Some("avc1"),
                max_height: Some(1080),
                require_progressive: false,
                merge_audio: true,
            },
            Self::TikTok => SitePolicy {
                codec_family: None,
                max_height: Some(1080),
                require_progressive: true,
                merge_audio: false,
            },
            Self::Facebook => SitePolicy {
                codec_family: None,
                max_height: Some(720),
                require_progressive: false,
                merge_audio: true,
            },
            Self::Generic => SitePolicy {
                codec_family: None,
                max_height: None,
                require_progressive: true,
                merge_audio: false,
            },
        }
    }
}

/// Only absolute http(s) URLs with a host reach the extractor.
pub fn validate_source_url(url: &str) -> Result<(), ServiceError> {
    let supported = Url::parse(url).is_ok_and(|parsed| {
        matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_some()
    });
    if supported {
        Ok(())
    } else {
        Err(ServiceError::InvalidInput(
            "URL must be an http or https link".to_string(),
        ))
    }
}

fn host_matches(host: &str, domains: &[&str]) -> bool {
    domains
        .iter()
        .any(|domain| host == *domain || host.ends_with(&format!(".{domain}")))
}
