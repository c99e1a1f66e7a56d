use std::path::{Path, PathBuf};

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{info, warn};

use crate::{
    controller::{ControlError, RunController, StatusView},
    tabular,
    types::DEFAULT_CONCURRENCY,
};

const XLSX_MIME: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
const UPLOAD_LIMIT_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub controller: RunController,
    pub upload_dir: PathBuf,
}

#[derive(Debug, Serialize)]
pub struct Message {
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        let status = match err {
            ControlError::AlreadyRunning => StatusCode::CONFLICT,
            ControlError::InvalidConcurrency(_) | ControlError::Input(_) => StatusCode::BAD_REQUEST,
            ControlError::Load(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// API under `/api`, everything else served from `static_dir`.
pub fn router(state: AppState, static_dir: &Path) -> Router {
    let api = Router::new()
        .route("/upload", post(post_upload))
        .route("/status", get(get_status))
        .route("/stop", post(post_stop))
        .route("/download", get(get_download))
        .layer(DefaultBodyLimit::max(UPLOAD_LIMIT_BYTES))
        .with_state(state);

    let static_svc = ServeDir::new(static_dir).append_index_html_on_directories(true);

    Router::new()
        .nest("/api", api)
        .fallback_service(static_svc)
        .layer(TraceLayer::new_for_http())
}

pub async fn spawn_server(bind: &str, state: AppState, static_dir: &Path) -> Result<()> {
    let app = router(state, static_dir);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "serving control API");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn get_status(State(app): State<AppState>) -> Json<StatusView> {
    Json(app.controller.status().await)
}

async fn post_stop(State(app): State<AppState>) -> Json<Message> {
    let message = if app.controller.stop().await {
        "stopping after in-flight probes finish"
    } else {
        "no run in progress"
    };
    Json(Message {
        message: message.to_string(),
    })
}

async fn post_upload(
    State(app): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Message>, ApiError> {
    let mut file: Option<(String, Bytes)> = None;
    let mut concurrency_raw: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("invalid upload: {e}")))?
    {
        match field.name().map(str::to_owned).as_deref() {
            Some("file") => {
                let name = field.file_name().unwrap_or_default().to_string();
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("invalid upload: {e}")))?;
                file = Some((name, data));
            }
            Some("concurrency") => {
                concurrency_raw = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::bad_request(format!("invalid upload: {e}")))?,
                );
            }
            _ => {}
        }
    }

    let Some((name, data)) = file else {
        return Err(ApiError::bad_request("no file uploaded"));
    };
    let name = sanitize_filename(&name).ok_or_else(|| ApiError::bad_request("no file selected"))?;
    if !tabular::is_supported_input(Path::new(&name)) {
        return Err(ApiError::bad_request("only .xls, .xlsx and .csv files are supported"));
    }

    let concurrency = match concurrency_raw.as_deref().map(str::trim) {
        None | Some("") => DEFAULT_CONCURRENCY,
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| ApiError::bad_request("invalid concurrency value"))?,
    };
    RunController::validate_concurrency(concurrency)?;
    if app.controller.is_running().await {
        return Err(ControlError::AlreadyRunning.into());
    }

    let path = app.upload_dir.join(&name);
    save_upload(&path, &data)
        .await
        .map_err(|e| ApiError::internal(format!("failed to save upload: {e}")))?;

    app.controller.start_file(&path, concurrency).await?;
    info!(file = %name, concurrency, "run started from upload");
    Ok(Json(Message {
        message: "file uploaded, test started".to_string(),
    }))
}

async fn save_upload(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    tokio::fs::write(path, data).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666)).await?;
    }
    Ok(())
}

async fn get_download(State(app): State<AppState>) -> Result<Response, ApiError> {
    let Some(path) = app.controller.latest_result_file().await else {
        warn!("download requested but no result file exists");
        return Err(ApiError::new(StatusCode::NOT_FOUND, "no result file available"));
    };
    let body = tokio::fs::read(&path)
        .await
        .map_err(|e| ApiError::internal(format!("failed to read {}: {e}", path.display())))?;

    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "result.xlsx".to_string());
    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{filename}\""))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment; filename=\"result.xlsx\""));
    info!(file = %filename, "serving result file");

    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(XLSX_MIME)),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

/// Keep only the final path component and a conservative character set.
fn sanitize_filename(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}
