use std::sync::Arc;

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path, Query, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Redirect, Response},
    routing::{delete, get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::AppError;
use crate::models::File;
use crate::store::UploadRequest;
use crate::AppState;

type AppResult<T> = Result<T, AppError>;

/// Full application router with all layers applied
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(public_routes())
        .nest("/api", api_routes(state.clone()))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

// ─── Public Routes ───────────────────────────────────────────────

fn public_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(index))
        .route("/d", get(download))
        .route("/hotlink/:id", get(hotlink))
}

// ─── Admin API Routes ────────────────────────────────────────────

fn api_routes(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        // uploads are streamed to disk, so their size is not limited
        .route("/files/add", post(add_file).layer(DefaultBodyLimit::disable()))
        .route("/files/list", get(list_files))
        .route("/files/info/:id", get(file_info))
        .route("/files/:id", delete(delete_file))
        .route_layer(middleware::from_fn_with_state(state, require_admin))
}

async fn require_admin(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> AppResult<Response> {
    let credentials = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_basic_auth);

    match credentials {
        Some((name, password)) if state.settings.verify_admin(&name, &password) => {
            Ok(next.run(request).await)
        }
        _ => {
            tracing::warn!("Rejected API request to {}", request.uri().path());
            Err(AppError::Unauthorized)
        }
    }
}

/// Decode an `Authorization: Basic ...` header into (user, password)
fn parse_basic_auth(value: &str) -> Option<(String, String)> {
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (name, password) = decoded.split_once(':')?;
    Some((name.to_string(), password.to_string()))
}

// ─── Public Handlers ─────────────────────────────────────────────

async fn index(State(state): State<Arc<AppState>>) -> Redirect {
    Redirect::temporary(&state.settings.redirect_url)
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    id: String,
    #[serde(default)]
    password: String,
}

async fn download(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DownloadQuery>,
) -> AppResult<Response> {
    let file = state.store.get_file(&query.id)?;
    if file.is_expired(Utc::now().timestamp()) {
        return Err(AppError::FileNotFound(query.id));
    }
    if !state.store.check_password(&file, &query.password) {
        return Err(AppError::WrongPassword);
    }
    // open before counting, so a failed read does not use up a download
    let handle = tokio::fs::File::open(state.store.content_path(&file)).await?;
    let file = state.store.register_download(&file.id)?;
    Ok(content_response(handle, &file, true))
}

async fn hotlink(
    State(state): State<Arc<AppState>>,
    Path(hotlink_id): Path<String>,
) -> AppResult<Response> {
    let file = state.store.get_by_hotlink(&hotlink_id)?;
    // password protected files are never hotlinked
    if !file.password_hash.is_empty() || file.is_expired(Utc::now().timestamp()) {
        return Err(AppError::FileNotFound(hotlink_id));
    }
    let handle = tokio::fs::File::open(state.store.content_path(&file)).await?;
    let file = state.store.register_download(&file.id)?;
    Ok(content_response(handle, &file, false))
}

fn content_response(handle: tokio::fs::File, file: &File, attachment: bool) -> Response {
    let body = Body::from_stream(ReaderStream::new(handle));

    let disposition = if attachment {
        format!("attachment; filename=\"{}\"", file.name.replace('"', ""))
    } else {
        "inline".to_string()
    };

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&file.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&disposition)
            .unwrap_or_else(|_| HeaderValue::from_static("attachment")),
    );

    (StatusCode::OK, headers, body).into_response()
}

// ─── API Handlers ────────────────────────────────────────────────

fn json_result(state: &AppState, file: &File) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        file.to_json_result(&state.settings.server_url),
    )
        .into_response()
}

async fn add_file(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> AppResult<Response> {
    let mut upload: Option<UploadRequest> = None;
    let mut content = None;
    let mut expiry_days = None;
    let mut allowed_downloads = None;
    let mut password = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::InvalidUpload(format!("Multipart error: {}", e)))?
    {
        let field_name = field.name().unwrap_or_default().to_string();
        match field_name.as_str() {
            "file" => {
                let mut request = UploadRequest::new(field.file_name().unwrap_or("upload"));
                request.content_type = field.content_type().map(|s| s.to_string());

                let mut staged = state
                    .store
                    .stage_upload(state.settings.upload_buffer_size)
                    .await?;
                while let Some(chunk) = field.chunk().await.map_err(|e| {
                    AppError::InvalidUpload(format!("Failed to read upload data: {}", e))
                })? {
                    staged.write_chunk(&chunk).await?;
                }
                content = Some(staged.finish().await?);
                upload = Some(request);
            }
            "expiryDays" => {
                expiry_days = Some(parse_number::<u32>(&field_name, field.text().await)?)
            }
            "allowedDownloads" => {
                allowed_downloads = Some(parse_number::<i32>(&field_name, field.text().await)?)
            }
            "password" => {
                password = Some(field.text().await.map_err(|e| {
                    AppError::InvalidUpload(format!("Cannot read password: {}", e))
                })?)
            }
            other => tracing::debug!("Ignoring multipart field {:?}", other),
        }
    }

    let (mut upload, content) = upload
        .zip(content)
        .ok_or_else(|| AppError::InvalidUpload("No file submitted".to_string()))?;
    if let Some(days) = expiry_days {
        upload.expiry_days = days;
    }
    if let Some(downloads) = allowed_downloads {
        upload.allowed_downloads = downloads;
    }
    upload.password = password;

    let file = state.store.put_staged(&upload, content)?;
    Ok(json_result(&state, &file))
}

fn parse_number<T: std::str::FromStr>(
    name: &str,
    text: Result<String, axum::extract::multipart::MultipartError>,
) -> AppResult<T> {
    let text = text.map_err(|e| AppError::InvalidUpload(format!("Cannot read {}: {}", name, e)))?;
    text.trim()
        .parse()
        .map_err(|_| AppError::InvalidUpload(format!("{} must be a number, got '{}'", name, text)))
}

async fn list_files(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.store.list_files())
}

async fn file_info(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Response> {
    let file = state.store.get_file(&id)?;
    Ok(json_result(&state, &file))
}

async fn delete_file(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    state.store.delete_file(&id)?;
    Ok(StatusCode::NO_CONTENT)
}
