use std::{collections::HashSet, sync::Arc};

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, State},
    http::{
        HeaderMap, HeaderValue, Method,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::Config,
    error::{ApiError, ServiceError},
    extractor::{MetadataProvider, StreamFetcher},
    fetcher::Fetcher,
    resolver::{FormatResolver, QualityChoice, ResolveMode},
    store::{FileStore, build_content_disposition, content_type_for_filename},
    transcode::Transcoder,
};

#[derive(Clone)]
pub struct AppState {
    resolver: Arc<FormatResolver>,
    fetcher: Arc<Fetcher>,
    store: Arc<FileStore>,
}

impl AppState {
    pub fn new(
        config: &Config,
        metadata: Arc<dyn MetadataProvider>,
        streams: Arc<dyn StreamFetcher>,
        transcoder: Arc<dyn Transcoder>,
        store: Arc<FileStore>,
    ) -> Self {
        let resolver = FormatResolver::new(
            Arc::clone(&metadata),
            config.target_container.clone(),
            config.audio_container.clone(),
            config.empty_formats,
        );
        let fetcher = Fetcher::new(
            metadata,
            streams,
            transcoder,
            Arc::clone(&store),
            config.target_container.clone(),
            config.audio_container.clone(),
            config.transcode,
        );

        Self {
            resolver: Arc::new(resolver),
            fetcher: Arc::new(fetcher),
            store,
        }
    }
}

#[derive(Debug, Deserialize)]
struct FormatsQuery {
    url: Option<String>,
    mode: Option<String>,
}

#[derive(Debug, Serialize)]
struct FormatsResponse {
    formats: Vec<QualityChoice>,
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    url: Option<String>,
    format_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct DownloadResponse {
    download_url: String,
    filename: String,
}

pub fn build_router(state: AppState, config: &Config) -> Result<Router, ApiError> {
    let mut app = Router::new()
        .route("/", get(root))
        .route("/formats", get(list_formats))
        .route("/download", get(download))
        .route("/file/{filename}", get(serve_file));

    if config.serve_static_files {
        app = app.nest_service("/files", ServeDir::new(state.store.root()));
    }

    let cors = build_cors_layer(&config.allowed_origins)?;

    Ok(app
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors))
}

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "message": concat!(env!("CARGO_PKG_NAME"), " media relay"),
    }))
}

async fn list_formats(
    State(state): State<AppState>,
    Query(query): Query<FormatsQuery>,
) -> Result<Json<FormatsResponse>, ApiError> {
    let url = required(query.url.as_deref(), "URL is required")?;
    let mode = match query.mode.as_deref().map(str::trim) {
        None | Some("") | Some("video") => ResolveMode::Video,
        Some("audio") => ResolveMode::Audio,
        Some(other) => {
            return Err(ApiError::bad_request(format!(
                "Unknown mode {other:?}; use video or audio"
            )));
        }
    };

    let formats = state.resolver.resolve(url, mode).await.map_err(|error| {
        log_failure("formats", url, &error);
        ApiError::from(error)
    })?;

    Ok(Json(FormatsResponse { formats }))
}

async fn download(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
) -> Result<Json<DownloadResponse>, ApiError> {
    let url = required(query.url.as_deref(), "URL is required")?;
    let format_id = required(query.format_id.as_deref(), "format_id is required")?;

    let filename = state.fetcher.fetch(url, format_id).await.map_err(|error| {
        log_failure("download", url, &error);
        ApiError::from(error)
    })?;

    Ok(Json(DownloadResponse {
        download_url: format!("/file/{}", urlencoding::encode(&filename)),
        filename,
    }))
}

async fn serve_file(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, ApiError> {
    let path = state.store.locate(&filename).await?;

    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|error| ApiError::from(ServiceError::Io(error)))?;
    let length = file
        .metadata()
        .await
        .map_err(|error| ApiError::from(ServiceError::Io(error)))?
        .len();
    let body = Body::from_stream(ReaderStream::new(file));

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_filename(&filename)),
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&filename))
            .map_err(|_| ApiError::internal("Could not build the download header."))?,
    );

    Ok((headers, body).into_response())
}

fn required<'a>(value: Option<&'a str>, message: &str) -> Result<&'a str, ApiError> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::bad_request(message))
}

fn log_failure(operation: &str, url: &str, error: &ServiceError) {
    match error {
        ServiceError::InvalidInput(_) | ServiceError::NotFound(_) => {
            debug!("{operation} for {url:?}: {error}")
        }
        _ => warn!("{operation} for {url:?} failed: {error}"),
    }
}

fn build_cors_layer(configured: &[String]) -> Result<CorsLayer, ApiError> {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers([CONTENT_DISPOSITION]);

    if configured.is_empty() {
        info!("ALLOWED_ORIGINS not set; accepting requests from any origin.");
        return Ok(base.allow_origin(Any));
    }

    let allowed_origins = configured
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                ApiError::internal(format!(
                    "Invalid origin in ALLOWED_ORIGINS: {origin}. \
                     Use values like https://example.com"
                ))
            })
        })
        .collect::<Result<HashSet<_>, _>>()?;
    info!(
        "CORS allow-list loaded with {} origin(s): {:?}",
        allowed_origins.len(),
        allowed_origins
    );

    let allowed_origins = Arc::new(allowed_origins);
    Ok(
        base.allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            let normalized = origin.to_str().ok().and_then(normalize_origin);
            let allowed = normalized
                .as_ref()
                .is_some_and(|value| allowed_origins.contains(value));
            debug!("CORS origin check raw={origin:?} normalized={normalized:?} allowed={allowed}");
            allowed
        })),
    )
}

fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    if !matches!(scheme, "http" | "https") {
        return None;
    }
    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    // `Url` already drops the scheme's default port.
    match parsed.port() {
        Some(port) => Some(format!("{scheme}://{host}:{port}")),
        None => Some(format!("{scheme}://{host}")),
    }
}
