//! HTTP front end: JSON endpoints over the adapters plus static assets from
//! the public directory.

use std::{
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{Path as AxumPath, Request, State},
    http::{Method, StatusCode, Uri, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::{fs::File, task};
use tokio_util::io::ReaderStream;
use tracing::{error, info, warn};

use crate::{
    downloader::{DownloadResult, Downloader},
    files::{self, FileEntry},
    processor::{MediaProcessor, Operation, ProcessOptions, ProcessingError, ProcessOutcome},
    scheduler::{ScheduledTask, SchedulerError, TaskOptions, TaskScheduler},
};

const INDEX_FILE: &str = "index.html";
const DOWNLOAD_EXTENSION: &str = ".mp4";

#[derive(Clone)]
pub struct AppState {
    pub downloader: Arc<Downloader>,
    pub processor: Arc<MediaProcessor>,
    pub scheduler: Arc<TaskScheduler>,
    /// Quality used when a request does not name one.
    pub default_quality: String,
    pub public_dir: PathBuf,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::TaskNotFound(_) => Self::not_found(err.to_string()),
            SchedulerError::InvalidCron => Self::bad_request(err.to_string()),
            SchedulerError::Scheduler(_) => Self::internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = self.status.as_u16(), "{}", self.message);
        }
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/video/info", post(video_info))
        .route("/video/download", post(video_download))
        .route("/video/process", post(video_process))
        .route("/files", get(list_downloads))
        .route("/processed", get(list_processed))
        .route("/tasks", get(list_tasks).post(create_task))
        .route("/tasks/{id}", get(get_task).delete(delete_task))
        .route("/tasks/{id}/start", post(start_task))
        .route("/tasks/{id}/stop", post(stop_task))
        .fallback(static_asset)
        .layer(middleware::from_fn(log_requests))
        .with_state(state)
}

/// Logs one line per response.
async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let user_agent = request
        .headers()
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("-")
        .to_owned();
    let started = Instant::now();

    let response = next.run(request).await;

    info!(
        %method,
        %uri,
        status = response.status().as_u16(),
        duration_ms = started.elapsed().as_millis() as u64,
        user_agent = %user_agent,
        "request"
    );
    response
}

/// Reads a JSON body. An empty, malformed or non-object body counts as `{}`
/// so the handlers answer with their own missing-field messages; a field of
/// the wrong type is rejected by name.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> ApiResult<T> {
    let Ok(value @ Value::Object(_)) = serde_json::from_slice::<Value>(body) else {
        return Ok(T::default());
    };
    serde_json::from_value(value.clone()).map_err(|err| match offending_field::<T>(&value) {
        Some(field) => ApiError::bad_request(format!("Invalid value for {field}")),
        None => ApiError::bad_request(format!("Invalid request body: {err}")),
    })
}

/// Dotted path of the field in `root` whose removal lets it deserialize.
fn offending_field<T: DeserializeOwned>(root: &Value) -> Option<String> {
    fn search<T: DeserializeOwned>(root: &Value, path: &mut Vec<String>) -> Option<String> {
        let node = path.iter().try_fold(root, |node, key| node.get(key))?;
        let keys: Vec<String> = node.as_object()?.keys().cloned().collect();
        for key in keys {
            let mut pruned = root.clone();
            let parent = path.iter().try_fold(&mut pruned, |node, key| node.get_mut(key))?;
            parent.as_object_mut()?.remove(&key);
            if serde_json::from_value::<T>(pruned).is_ok() {
                path.push(key);
                return search::<T>(root, path).or_else(|| Some(path.join(".")));
            }
        }
        None
    }

    search::<T>(root, &mut Vec::new())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

#[derive(Debug, Default, Deserialize)]
struct UrlRequest {
    url: Option<String>,
    quality: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ProcessRequest {
    filename: Option<String>,
    operation: Option<String>,
    #[serde(default)]
    options: ProcessOptions,
}

#[derive(Debug, Default, Deserialize)]
struct CreateTaskRequest {
    url: Option<String>,
    schedule: Option<String>,
    quality: Option<String>,
    start: Option<bool>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DownloadResponse {
    #[serde(flatten)]
    result: DownloadResult,
    file_size: String,
}

async fn video_info(State(state): State<AppState>, body: Bytes) -> ApiResult<Response> {
    let request: UrlRequest = parse_body(&body)?;
    let url = non_empty(request.url).ok_or_else(|| ApiError::bad_request("URL is required"))?;

    let info = state
        .downloader
        .get_info(&url)
        .await
        .map_err(|err| ApiError::bad_request(err.to_string()))?;
    Ok(Json(info).into_response())
}

async fn video_download(State(state): State<AppState>, body: Bytes) -> ApiResult<Response> {
    let request: UrlRequest = parse_body(&body)?;
    let url = non_empty(request.url).ok_or_else(|| ApiError::bad_request("URL is required"))?;
    let quality = non_empty(request.quality).unwrap_or_else(|| state.default_quality.clone());

    let result = state
        .downloader
        .download(&url, &quality)
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?;

    let file_size = files::get_file_stats(&result.filepath)
        .map(|stats| stats.size)
        .unwrap_or_else(|| "Unknown".to_owned());

    Ok(Json(DownloadResponse { result, file_size }).into_response())
}

async fn video_process(State(state): State<AppState>, body: Bytes) -> ApiResult<Response> {
    let request: ProcessRequest = parse_body(&body)?;
    let (Some(filename), Some(operation)) =
        (non_empty(request.filename), non_empty(request.operation))
    else {
        return Err(ApiError::bad_request(
            "Filename and operation are required",
        ));
    };

    if !is_plain_file_name(&filename) {
        return Err(ApiError::bad_request("Invalid filename"));
    }
    let operation: Operation = operation
        .parse()
        .map_err(|err: ProcessingError| ApiError::bad_request(err.to_string()))?;

    let input = state.downloader.download_dir().join(&filename);
    let outcome: ProcessOutcome = state
        .processor
        .run(&input, operation, &request.options)
        .await
        .map_err(|err| match err {
            ProcessingError::InvalidOperation(_) => ApiError::bad_request(err.to_string()),
            other => ApiError::internal(other.to_string()),
        })?;
    Ok(Json(outcome).into_response())
}

/// True when `name` is a single normal path component.
fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

async fn list_downloads(State(state): State<AppState>) -> ApiResult<Json<Vec<FileEntry>>> {
    let dir = state.downloader.download_dir().to_path_buf();
    list_dir(dir, Some(DOWNLOAD_EXTENSION)).await
}

async fn list_processed(State(state): State<AppState>) -> ApiResult<Json<Vec<FileEntry>>> {
    let dir = state.processor.output_dir().to_path_buf();
    list_dir(dir, None).await
}

async fn list_dir(
    dir: PathBuf,
    extension: Option<&'static str>,
) -> ApiResult<Json<Vec<FileEntry>>> {
    let entries = task::spawn_blocking(move || files::list_with_stats(&dir, extension))
        .await
        .map_err(|err| ApiError::internal(format!("task join error: {err}")))?;
    Ok(Json(entries))
}

async fn list_tasks(State(state): State<AppState>) -> Json<Vec<ScheduledTask>> {
    Json(state.scheduler.tasks())
}

async fn create_task(State(state): State<AppState>, body: Bytes) -> ApiResult<Response> {
    let request: CreateTaskRequest = parse_body(&body)?;
    let (Some(url), Some(schedule)) = (non_empty(request.url), non_empty(request.schedule))
    else {
        return Err(ApiError::bad_request("URL and schedule are required"));
    };
    let options = TaskOptions {
        quality: non_empty(request.quality).unwrap_or_else(|| state.default_quality.clone()),
    };

    let task = state
        .scheduler
        .create_task(&url, &schedule, options, request.start.unwrap_or(true))
        .await?;
    Ok((StatusCode::CREATED, Json(task)).into_response())
}

async fn get_task(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<u64>,
) -> ApiResult<Json<ScheduledTask>> {
    Ok(Json(state.scheduler.task(id)?))
}

async fn start_task(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<u64>,
) -> ApiResult<Json<ScheduledTask>> {
    state.scheduler.start_task(id).await?;
    Ok(Json(state.scheduler.task(id)?))
}

async fn stop_task(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<u64>,
) -> ApiResult<Json<ScheduledTask>> {
    state.scheduler.stop_task(id).await?;
    Ok(Json(state.scheduler.task(id)?))
}

async fn delete_task(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<u64>,
) -> ApiResult<StatusCode> {
    state.scheduler.delete_task(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn index(State(state): State<AppState>) -> ApiResult<Response> {
    stream_file(state.public_dir.join(INDEX_FILE)).await
}

/// Serves files under the public directory for any unmatched `GET`.
async fn static_asset(State(state): State<AppState>, method: Method, uri: Uri) -> ApiResult<Response> {
    if method != Method::GET && method != Method::HEAD {
        return Err(ApiError::not_found("Not found"));
    }

    let relative = uri.path().trim_start_matches('/');
    let relative = if relative.is_empty() { INDEX_FILE } else { relative };
    let safe = Path::new(relative)
        .components()
        .all(|component| matches!(component, Component::Normal(_)));
    if !safe {
        warn!(path = uri.path(), "rejected static path");
        return Err(ApiError::not_found("Not found"));
    }

    stream_file(state.public_dir.join(relative)).await
}

async fn stream_file(path: PathBuf) -> ApiResult<Response> {
    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("Not found"))?;
    if file.metadata().await.map(|meta| meta.is_dir()).unwrap_or(true) {
        return Err(ApiError::not_found("Not found"));
    }

    let stream = ReaderStream::new(file);
    let mut response = Body::from_stream(stream).into_response();
    if let Some(mime) = MimeGuess::from_path(&path).first()
        && let Ok(value) = mime.to_string().parse()
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }

    Ok(response)
}
