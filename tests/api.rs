use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use media_relay::{
    AppState, Config, ServiceError, build_router,
    config::{EmptyFormatsPolicy, TranscodePolicy},
    extractor::{FetchRequest, MediaInfo, MetadataProvider, StreamDescriptor, StreamFetcher},
    store::FileStore,
    transcode::Transcoder,
};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

struct FakeMetadata {
    streams: Vec<StreamDescriptor>,
    fail_with: Option<String>,
    probes: AtomicUsize,
}

#[async_trait]
impl MetadataProvider for FakeMetadata {
    async fn probe(&self, _url: &str) -> Result<MediaInfo, ServiceError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        match &self.fail_with {
            Some(message) => Err(ServiceError::Extraction(message.clone())),
            None => Ok(MediaInfo {
                formats: self.streams.clone(),
            }),
        }
    }
}

#[derive(Default)]
struct FakeFetcher {
    requests: Mutex<Vec<FetchRequest>>,
}

#[async_trait]
impl StreamFetcher for FakeFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<PathBuf, ServiceError> {
        self.requests.lock().unwrap().push(request.clone());
        let ext = request
            .extract_audio
            .clone()
            .or_else(|| request.merge_container.clone())
            .unwrap_or_else(|| "mp4".to_string());
        let path = request
            .output_dir
            .join(format!("{}.{ext}", request.file_stem));
        tokio::fs::write(&path, b"media-bytes").await?;
        Ok(path)
    }
}

struct NoopTranscoder;

#[async_trait]
impl Transcoder for NoopTranscoder {
    async fn transcode(&self, input: &Path, output: &Path) -> Result<(), ServiceError> {
        tokio::fs::copy(input, output).await?;
        Ok(())
    }
}

struct TestApp {
    _dir: TempDir,
    root: PathBuf,
    metadata: Arc<FakeMetadata>,
    fetcher: Arc<FakeFetcher>,
    router: Router,
}

fn stream(id: &str, height: u32, vcodec: &str, acodec: &str) -> StreamDescriptor {
    StreamDescriptor {
        format_id: id.to_string(),
        ext: Some("mp4".to_string()),
        vcodec: Some(vcodec.to_string()),
        acodec: Some(acodec.to_string()),
        height: Some(height),
        ..Default::default()
    }
}

fn sample_streams() -> Vec<StreamDescriptor> {
    vec![
        stream("160", 144, "avc1.4d400c", "none"),
        stream("134", 360, "avc1.4d401e", "none"),
        stream("22", 720, "avc1.64001F", "mp4a.40.2"),
        StreamDescriptor {
            format_id: "140".to_string(),
            ext: Some("m4a".to_string()),
            vcodec: Some("none".to_string()),
            acodec: Some("mp4a.40.2".to_string()),
            ..Default::default()
        },
    ]
}

fn test_app(streams: Vec<StreamDescriptor>, tweak: impl FnOnce(&mut Config)) -> TestApp {
    test_app_with(streams, None, tweak)
}

fn test_app_with(
    streams: Vec<StreamDescriptor>,
    fail_with: Option<&str>,
    tweak: impl FnOnce(&mut Config),
) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let mut config = Config {
        output_dir: root.clone(),
        ..Config::default()
    };
    tweak(&mut config);

    let metadata = Arc::new(FakeMetadata {
        streams,
        fail_with: fail_with.map(ToString::to_string),
        probes: AtomicUsize::new(0),
    });
    let fetcher = Arc::new(FakeFetcher::default());
    let store = Arc::new(FileStore::new(&root));
    let state = AppState::new(
        &config,
        metadata.clone(),
        fetcher.clone(),
        Arc::new(NoopTranscoder),
        store,
    );

    TestApp {
        _dir: dir,
        root,
        metadata,
        fetcher,
        router: build_router(state, &config).unwrap(),
    }
}

impl TestApp {
    async fn get(&self, uri: &str) -> (StatusCode, Vec<u8>, axum::http::HeaderMap) {
        let response = self
            .router
            .clone()
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec(), headers)
    }

    async fn get_json(&self, uri: &str) -> (StatusCode, Value) {
        let (status, body, _) = self.get(uri).await;
        (status, serde_json::from_slice(&body).unwrap())
    }
}

fn encode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

#[tokio::test]
async fn root_reports_liveness() {
    let app = test_app(Vec::new(), |_| {});
    let (status, body) = app.get_json("/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn formats_for_generic_site_returns_the_progressive_stream() {
    let app = test_app(sample_streams(), |_| {});
    let uri = format!("/formats?url={}", encode("https://example.com/watch/1"));

    let (status, body) = app.get_json(&uri).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        serde_json::json!({"formats": [{"format_id": "22", "label": "720p"}]})
    );
}

#[tokio::test]
async fn formats_are_sorted_by_descending_height() {
    let streams = vec![
        stream("18", 360, "avc1", "mp4a"),
        stream("37", 1080, "avc1", "mp4a"),
        stream("22", 720, "avc1", "mp4a"),
    ];
    let app = test_app(streams, |_| {});
    let uri = format!("/formats?url={}", encode("https://example.com/v"));

    let (_, body) = app.get_json(&uri).await;

    let labels: Vec<&str> = body["formats"]
        .as_array()
        .unwrap()
        .iter()
        .map(|choice| choice["label"].as_str().unwrap())
        .collect();
    assert_eq!(labels, ["1080p", "720p", "360p"]);
}

#[tokio::test]
async fn missing_url_is_a_bad_request() {
    let app = test_app(sample_streams(), |_| {});

    for uri in [
        "/formats",
        "/formats?url=",
        "/download?format_id=22",
        "/download?url=%20&format_id=22",
    ] {
        let (status, body) = app.get_json(uri).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        assert!(body["error"].as_str().unwrap().contains("URL"));
    }
    assert_eq!(app.metadata.probes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn non_http_url_is_rejected_before_the_extractor_runs() {
    let app = test_app(sample_streams(), |_| {});

    for uri in [
        "/formats?url=--exec%3Dx".to_string(),
        format!("/formats?url={}", encode("-a/etc/passwd")),
        format!("/download?url={}&format_id=22", encode("--config-location=a.mp4")),
        format!("/download?url={}&format_id=22", encode("file:///etc/passwd")),
    ] {
        let (status, body) = app.get_json(&uri).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        assert!(body["error"].as_str().unwrap().contains("http"));
    }
    assert_eq!(app.metadata.probes.load(Ordering::SeqCst), 0);
    assert!(app.fetcher.requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn missing_format_id_is_a_bad_request() {
    let app = test_app(sample_streams(), |_| {});
    let uri = format!("/download?url={}", encode("https://example.com/v"));

    let (status, _) = app.get_json(&uri).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(app.fetcher.requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn extraction_failure_is_a_server_error_with_message() {
    let app = test_app_with(Vec::new(), Some("Video unavailable"), |_| {});
    let uri = format!("/formats?url={}", encode("https://example.com/v"));

    let (status, body) = app.get_json(&uri).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"].as_str().unwrap().contains("Video unavailable"));
}

#[tokio::test]
async fn empty_formats_follow_the_configured_policy() {
    let only_video = vec![stream("160", 144, "avc1", "none")];
    let uri = format!("/formats?url={}", encode("https://example.com/v"));

    let strict = test_app(only_video.clone(), |_| {});
    let (status, _) = strict.get_json(&uri).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let lenient = test_app(only_video, |config| {
        config.empty_formats = EmptyFormatsPolicy::Fallback;
    });
    let (status, body) = lenient.get_json(&uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["formats"].as_array().unwrap().len(), 3);
    assert_eq!(body["formats"][0]["format_id"], "auto-720p");
}

#[tokio::test]
async fn unknown_mode_is_a_bad_request() {
    let app = test_app(sample_streams(), |_| {});
    let uri = format!("/formats?url={}&mode=3d", encode("https://example.com/v"));
    let (status, _) = app.get_json(&uri).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn every_advertised_choice_downloads_and_serves() {
    let app = test_app(sample_streams(), |config| {
        config.transcode = TranscodePolicy::Strict;
    });
    let url = encode("https://example.com/watch/1");

    let (_, video) = app.get_json(&format!("/formats?url={url}")).await;
    let (_, audio) = app.get_json(&format!("/formats?url={url}&mode=audio")).await;
    let choices: Vec<String> = video["formats"]
        .as_array()
        .unwrap()
        .iter()
        .chain(audio["formats"].as_array().unwrap())
        .map(|choice| choice["format_id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(choices, ["22", "audio"]);

    for token in choices {
        let (status, body) = app
            .get_json(&format!("/download?url={url}&format_id={}", encode(&token)))
            .await;
        assert_eq!(status, StatusCode::OK, "{token}");

        let filename = body["filename"].as_str().unwrap();
        assert_eq!(body["download_url"], format!("/file/{filename}"));
        assert!(app.root.join(filename).is_file());

        let (status, bytes, _) = app.get(&format!("/file/{filename}")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!bytes.is_empty());
    }
}

#[tokio::test]
async fn audio_sentinel_returns_an_audio_file_without_video_selection() {
    let app = test_app(sample_streams(), |_| {});
    let uri = format!(
        "/download?url={}&format_id=audio",
        encode("https://www.youtube.com/watch?v=abc")
    );

    let (status, body) = app.get_json(&uri).await;

    assert_eq!(status, StatusCode::OK);
    assert!(body["filename"].as_str().unwrap().ends_with(".m4a"));
    assert_eq!(app.metadata.probes.load(Ordering::SeqCst), 0);
    let requests = app.fetcher.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].selector.starts_with("bestaudio"));

    drop(requests);
    let filename = body["filename"].as_str().unwrap();
    let (_, _, headers) = app.get(&format!("/file/{filename}")).await;
    assert_eq!(headers[header::CONTENT_TYPE], "audio/mp4");
}

#[tokio::test]
async fn served_file_has_type_length_and_disposition() {
    let app = test_app(Vec::new(), |_| {});
    std::fs::write(app.root.join("clip.webm"), b"0123456789").unwrap();

    let (status, bytes, headers) = app.get("/file/clip.webm").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes, b"0123456789");
    assert_eq!(headers[header::CONTENT_TYPE], "video/webm");
    assert_eq!(headers[header::CONTENT_LENGTH], "10");
    assert!(
        headers[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .contains("filename=\"clip.webm\"")
    );
}

#[tokio::test]
async fn unknown_files_are_not_found() {
    let app = test_app(Vec::new(), |_| {});

    let (status, _, _) = app.get("/file/never-downloaded.mp4").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = app.get("/file/..%2Fsecret").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn static_mount_serves_the_download_directory() {
    let app = test_app(Vec::new(), |_| {});
    std::fs::write(app.root.join("raw.mp4"), b"raw").unwrap();
    let (status, bytes, _) = app.get("/files/raw.mp4").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes, b"raw");

    let hidden = test_app(Vec::new(), |config| config.serve_static_files = false);
    std::fs::write(hidden.root.join("raw.mp4"), b"raw").unwrap();
    let (status, _, _) = hidden.get("/files/raw.mp4").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn repeated_download_reuses_the_materialized_file() {
    let app = test_app(sample_streams(), |_| {});
    let uri = format!(
        "/download?url={}&format_id=22",
        encode("https://example.com/watch/1")
    );

    let (_, first) = app.get_json(&uri).await;
    let (_, second) = app.get_json(&uri).await;

    assert_eq!(first["filename"], second["filename"]);
    assert_eq!(app.fetcher.requests.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn cors_allows_any_origin_by_default() {
    let app = test_app(Vec::new(), |_| {});
    let response = app
        .router
        .clone()
        .oneshot(
            Request::get("/")
                .header(header::ORIGIN, "https://frontend.example")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
}
