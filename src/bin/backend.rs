#![forbid(unsafe_code)]

//! Axum backend for the CNVRTR playlist downloader.
//!
//! Every endpoint is a thin layer over the library crate: metadata requests go
//! through the `PlaylistResolver`, batch downloads through the orchestrator in
//! `download`, and single-track streaming pipes yt-dlp stdout straight into
//! the response body. The yt-dlp client is constructed once at startup and
//! injected via application state.

use std::{
    convert::Infallible,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    pin::Pin,
    sync::Arc,
    task::{Context as TaskContext, Poll},
};

use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use cnvrtr_tools::config::{RuntimeOverrides, resolve_runtime_config};
use cnvrtr_tools::download::{ProgressSink, run_batch, sanitize_title};
use cnvrtr_tools::extractor::{ExtractorClient, MetadataFlags};
use cnvrtr_tools::playlist::{PlaylistInfo, PlaylistResolver, Track};
use cnvrtr_tools::security::ensure_not_root;
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use tokio::{signal, sync::mpsc};
use tokio_util::io::ReaderStream;

#[derive(Debug, Clone)]
struct BackendArgs {
    overrides: RuntimeOverrides,
}

impl BackendArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut overrides = RuntimeOverrides::default();
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--downloads-root=") {
                overrides.downloads_root = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--port=") {
                overrides.port = Some(parse_port_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--host=") {
                overrides.host = Some(parse_host_arg(value)?.to_string());
                continue;
            }
            if let Some(value) = arg.strip_prefix("--ytdlp=") {
                overrides.ytdlp_bin = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--env-file=") {
                overrides.env_path = Some(PathBuf::from(value));
                continue;
            }

            match arg.as_str() {
                "--downloads-root" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--downloads-root requires a value"))?;
                    overrides.downloads_root = Some(PathBuf::from(value));
                }
                "--port" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--port requires a value"))?;
                    overrides.port = Some(parse_port_arg(&value)?);
                }
                "--host" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--host requires a value"))?;
                    overrides.host = Some(parse_host_arg(&value)?.to_string());
                }
                "--ytdlp" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--ytdlp requires a value"))?;
                    overrides.ytdlp_bin = Some(PathBuf::from(value));
                }
                "--env-file" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--env-file requires a value"))?;
                    overrides.env_path = Some(PathBuf::from(value));
                }
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }

        Ok(Self { overrides })
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/CNVRTR_HOST")
}

#[derive(Clone)]
struct AppState {
    client: Arc<ExtractorClient>,
    resolver: Arc<PlaylistResolver>,
    downloads_root: Arc<PathBuf>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
    details: Option<String>,
}

impl ApiError {
    /// Creates a 400 error with the provided message.
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            details: None,
        }
    }

    /// Creates a 500 error with the provided message.
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            details: None,
        }
    }

    fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        let mut body = serde_json::json!({
            "error": self.message,
        });
        if let Some(details) = self.details {
            body["details"] = serde_json::Value::String(details);
        }
        (self.status, headers, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    let BackendArgs { overrides } = BackendArgs::parse()?;

    ensure_not_root("backend")?;

    let config = resolve_runtime_config(overrides)?;
    let host = parse_host_arg(&config.host)?;

    // A misconfigured yt-dlp should fail here, not on the first request.
    let client = Arc::new(ExtractorClient::locate(config.ytdlp_bin.clone())?);
    println!("Using yt-dlp at {}", client.binary().display());

    let state = AppState {
        resolver: Arc::new(PlaylistResolver::new(client.clone())),
        client,
        downloads_root: Arc::new(config.downloads_root.clone()),
    };

    let app = Router::new()
        .route("/api/playlist-info", post(playlist_info))
        .route("/api/download-all", post(download_all))
        .route("/api/download-custom", post(download_custom))
        .route("/api/download-track", post(download_track))
        .route("/api/track-preview", post(track_preview))
        .route("/health", get(health))
        .route("/ping", get(ping))
        .with_state(state);

    let addr = SocketAddr::new(host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    println!("API server listening on http://{}", addr);
    println!("Downloads root: {}", config.downloads_root.display());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

async fn shutdown_signal() {
    // We do not propagate this error up because it only affects graceful
    // shutdown; the process still terminates when Ctrl+C fires.
    if let Err(err) = signal::ctrl_c().await {
        eprintln!("Failed to install Ctrl+C handler: {}", err);
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn ping() -> &'static str {
    "pong"
}

#[derive(Debug, Deserialize)]
struct PlaylistInfoRequest {
    url: Option<String>,
}

async fn playlist_info(
    State(state): State<AppState>,
    Json(request): Json<PlaylistInfoRequest>,
) -> ApiResult<Json<PlaylistInfo>> {
    let url = request
        .url
        .filter(|url| url.contains("soundcloud.com"))
        .ok_or_else(|| ApiError::bad_request("Invalid SoundCloud URL"))?;

    println!("Fetching playlist info for: {url}");

    match state.resolver.resolve(&url).await {
        Ok(info) => Ok(Json(info)),
        Err(err) => {
            eprintln!("Error fetching playlist info: {err:#}");
            Err(classify_resolution_error(&err))
        }
    }
}

/// Maps a resolution failure to the user-facing error the UI expects. The
/// text probes mirror the orchestrator's per-track classification: best
/// effort against whatever yt-dlp prints today.
fn classify_resolution_error(err: &anyhow::Error) -> ApiError {
    let text = format!("{err:#}");
    if text.contains("no track information found") {
        return ApiError::bad_request("No track information found");
    }
    let message = if text.contains("404") {
        "Track or playlist not found. Please check the URL and ensure it is publicly accessible."
    } else if text.contains("HTTP Error") {
        "SoundCloud access error. The content may be restricted or private."
    } else {
        "Failed to fetch track information"
    };
    ApiError::internal(message)
        .with_details("Try using individual track URLs instead of playlist URLs if this continues.")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadAllRequest {
    tracks: Option<Vec<Track>>,
    #[serde(default)]
    playlist_title: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadCustomRequest {
    tracks: Option<Vec<Track>>,
    #[serde(default)]
    playlist_title: String,
    custom_path: Option<String>,
}

async fn download_all(
    State(state): State<AppState>,
    Json(request): Json<DownloadAllRequest>,
) -> ApiResult<Response> {
    let tracks = request
        .tracks
        .ok_or_else(|| ApiError::bad_request("Invalid tracks data"))?;
    let dest = state.downloads_root.join(sanitize_title(&request.playlist_title));
    start_batch_stream(state, tracks, dest)
}

async fn download_custom(
    State(state): State<AppState>,
    Json(request): Json<DownloadCustomRequest>,
) -> ApiResult<Response> {
    let tracks = request
        .tracks
        .ok_or_else(|| ApiError::bad_request("Invalid tracks data"))?;
    let base = match request.custom_path.as_deref().map(str::trim) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => state.downloads_root.as_ref().clone(),
    };
    let dest = base.join(sanitize_title(&request.playlist_title));
    start_batch_stream(state, tracks, dest)
}

/// Kicks off a batch job and returns its progress stream. The destination is
/// created here so an unusable path fails the request with a JSON error
/// before any chunk is written.
fn start_batch_stream(state: AppState, tracks: Vec<Track>, dest: PathBuf) -> ApiResult<Response> {
    std::fs::create_dir_all(&dest).map_err(|err| {
        ApiError::internal("Failed to create download directory").with_details(err.to_string())
    })?;

    println!(
        "Starting download of {} tracks to: {}",
        tracks.len(),
        dest.display()
    );

    let (sender, receiver) = mpsc::unbounded_channel::<Bytes>();
    let client = state.client.clone();
    tokio::spawn(async move {
        let mut sink = ChannelSink { sender };
        if let Err(err) = run_batch(&client, &tracks, &dest, &mut sink).await {
            eprintln!("Batch download aborted: {err:#}");
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(LineStream { receiver }))
        .map_err(|err| ApiError::internal(err.to_string()))
}

/// Progress sink backed by the response channel. A failed send means the
/// client hung up; `closed` lets the orchestrator cancel the in-flight
/// download at that moment instead of at the next line.
struct ChannelSink {
    sender: mpsc::UnboundedSender<Bytes>,
}

impl ProgressSink for ChannelSink {
    fn write_line(&mut self, line: &str) -> bool {
        self.sender
            .send(Bytes::from(format!("{line}\n")))
            .is_ok()
    }

    fn closed(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(self.sender.closed())
    }
}

struct LineStream {
    receiver: mpsc::UnboundedReceiver<Bytes>,
}

impl Stream for LineStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx).map(|chunk| chunk.map(Ok))
    }
}

#[derive(Debug, Deserialize)]
struct DownloadTrackRequest {
    url: Option<String>,
    title: Option<String>,
    // Some clients post `{track: {url, title}}` instead of the flat shape.
    track: Option<TrackRef>,
}

#[derive(Debug, Deserialize)]
struct TrackRef {
    url: Option<String>,
    title: Option<String>,
}

impl DownloadTrackRequest {
    fn into_parts(self) -> Option<(String, String)> {
        let (url, title) = match self.track {
            Some(track) => (track.url, track.title),
            None => (self.url, self.title),
        };
        match (url, title) {
            (Some(url), Some(title)) if !url.is_empty() && !title.is_empty() => {
                Some((url, title))
            }
            _ => None,
        }
    }
}

async fn download_track(
    State(state): State<AppState>,
    Json(request): Json<DownloadTrackRequest>,
) -> ApiResult<Response> {
    let (url, title) = request
        .into_parts()
        .ok_or_else(|| ApiError::bad_request("URL and title are required"))?;

    println!("Streaming track: {title}");
    let stream = state.client.stream_audio(&url).map_err(|err| {
        eprintln!("Error downloading track: {err}");
        ApiError::internal("Failed to download track")
    })?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "audio/mpeg")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}.mp3\"", attachment_filename(&title)),
        )
        .body(Body::from_stream(ReaderStream::new(stream)))
        .map_err(|err| ApiError::internal(err.to_string()))
}

/// Stricter than `sanitize_title`: header values cannot carry quotes or
/// arbitrary punctuation, so only word characters, whitespace and dashes
/// survive.
fn attachment_filename(title: &str) -> String {
    title
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '-' || *c == '_')
        .collect::<String>()
        .trim()
        .to_string()
}

#[derive(Debug, Deserialize)]
struct TrackPreviewRequest {
    url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TrackPreview {
    title: Option<String>,
    uploader: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    url: Option<String>,
}

async fn track_preview(
    State(state): State<AppState>,
    Json(request): Json<TrackPreviewRequest>,
) -> ApiResult<Json<TrackPreview>> {
    let url = request
        .url
        .filter(|url| !url.is_empty())
        .ok_or_else(|| ApiError::bad_request("URL is required"))?;

    let value = state
        .client
        .dump_json(&url, &MetadataFlags::default())
        .await
        .map_err(|err| {
            eprintln!("Error getting track preview: {err}");
            ApiError::internal("Failed to get track preview")
        })?;

    let preview: TrackPreview = serde_json::from_value(value)
        .map_err(|_| ApiError::internal("Failed to get track preview"))?;
    Ok(Json(preview))
}
