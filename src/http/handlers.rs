use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use axum::Json;
use axum_extra::extract::cookie::{Cookie, SameSite};
use axum_extra::extract::CookieJar;
use axum_extra::headers::authorization::Basic;
use axum_extra::headers::Authorization;
use axum_extra::TypedHeader;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::app::auth::{AuthService, RegisterOutcome};
use crate::app::media::{MediaService, UploadError};
use crate::domain::media::{MediaKind, MediaRecord, OrderType};
use crate::http::range::{self, RangeError};
use crate::http::{AppError, Session, SESSION_COOKIE};
use crate::AppState;

const DEFAULT_PAGE: i64 = 1;
const DEFAULT_PAGE_SIZE: i64 = 10;

fn auth_service(state: &AppState) -> AuthService {
    AuthService::new(
        state.db.clone(),
        state.session_key,
        state.session_ttl_hours,
    )
}

fn media_service(state: &AppState) -> MediaService {
    MediaService::new(state.db.clone(), state.blobs.clone(), state.locks.clone())
}

// ---------------------------------------------------------------------------
// Liveness
// ---------------------------------------------------------------------------

pub async fn index(State(state): State<AppState>) -> &'static str {
    if state.db.ping().await.is_ok() {
        "arca is running"
    } else {
        "arca is degraded"
    }
}

// ---------------------------------------------------------------------------
// Registration and login
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub secret: String,
}

#[derive(Serialize)]
pub struct RegisterResponse {
    pub username: String,
}

pub async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, AppError> {
    let username = payload.username.trim().to_string();
    if username.is_empty() || payload.secret.trim().is_empty() {
        return Err(AppError::bad_request("username and secret are required"));
    }

    let outcome = auth_service(&state)
        .register(&username, &payload.secret)
        .await
        .map_err(|err| {
            tracing::error!(error = ?err, "failed to register account");
            AppError::internal("failed to register account")
        })?;

    match outcome {
        RegisterOutcome::Created => {
            // Device notification delivery is out of process; emit the event
            // and answer the request regardless of what happens to it.
            let notified = username.clone();
            tokio::spawn(async move {
                tracing::info!(username = %notified, "account registered");
            });
            Ok(Json(RegisterResponse { username }))
        }
        RegisterOutcome::Conflict => Err(AppError::conflict("an account is already registered")),
    }
}

#[derive(Serialize)]
pub struct LoginResponse {
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

pub async fn login(
    State(state): State<AppState>,
    basic: Option<TypedHeader<Authorization<Basic>>>,
) -> Result<(CookieJar, Json<LoginResponse>), AppError> {
    let TypedHeader(basic) =
        basic.ok_or_else(|| AppError::unauthorized("missing credentials"))?;

    let session = auth_service(&state)
        .login(basic.username(), basic.password())
        .await
        .map_err(|err| {
            tracing::error!(error = ?err, "failed to verify login");
            AppError::internal("failed to verify login")
        })?
        .ok_or_else(|| AppError::unauthorized("invalid credentials"))?;

    let cookie = Cookie::build((SESSION_COOKIE, session.token))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .build();
    let jar = CookieJar::new().add(cookie);

    Ok((
        jar,
        Json(LoginResponse {
            expires_at: session.expires_at,
        }),
    ))
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct ListQuery {
    pub page: Option<String>,
    #[serde(rename = "pageSize")]
    pub page_size: Option<String>,
    pub order: Option<String>,
}

/// Absent or unparseable values fall back to the default; values that parse
/// below 1 are the client's mistake.
fn paging_param(raw: Option<String>, default: i64, name: &str) -> Result<i64, AppError> {
    let Some(raw) = raw else {
        return Ok(default);
    };
    match raw.parse::<i64>() {
        Err(_) => Ok(default),
        Ok(value) if value >= 1 => Ok(value),
        Ok(_) => Err(AppError::bad_request(format!("{} must be at least 1", name))),
    }
}

pub async fn list_media(
    _session: Session,
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<MediaRecord>>, AppError> {
    let page = paging_param(query.page, DEFAULT_PAGE, "page")?;
    let page_size = paging_param(query.page_size, DEFAULT_PAGE_SIZE, "pageSize")?;
    let order = match query.order.as_deref() {
        None => OrderType::RecentFirst,
        Some(raw) => raw
            .parse::<OrderType>()
            .map_err(|_| AppError::bad_request("unrecognized order"))?,
    };

    let records = media_service(&state)
        .get_page(page_size, (page - 1).saturating_mul(page_size), order)
        .await
        .map_err(|err| {
            tracing::error!(error = ?err, "failed to list media");
            AppError::internal("failed to list media")
        })?;

    Ok(Json(records))
}

// ---------------------------------------------------------------------------
// Upload
// ---------------------------------------------------------------------------

pub async fn upload_media(
    _session: Session,
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    body: Body,
) -> Result<Json<MediaRecord>, AppError> {
    let original_name = headers
        .get(header::CONTENT_DISPOSITION)
        .and_then(|value| value.to_str().ok())
        .and_then(disposition_filename)
        .ok_or_else(|| AppError::bad_request("missing filename in Content-Disposition"))?;

    let declared_size = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<i64>().ok())
        .ok_or_else(|| AppError::bad_request("missing Content-Length"))?;

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_default();
    let kind = MediaKind::from_content_type(&content_type).ok_or_else(|| {
        AppError::unsupported_media_type(format!("cannot store {}", content_type))
    })?;

    let service = media_service(&state);
    let result = match kind {
        MediaKind::Image => {
            let bytes = buffer_body(body, state.image_max_bytes).await?;
            service
                .upload_image(
                    &original_name,
                    &content_type,
                    bytes,
                    declared_size,
                    state.thumb_max_dim,
                )
                .await
        }
        MediaKind::Video => {
            let stream = body
                .into_data_stream()
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err));
            service
                .upload_video(
                    &original_name,
                    &content_type,
                    Box::pin(stream),
                    declared_size,
                    &state.ffmpeg_bin,
                    state.thumb_max_dim,
                )
                .await
        }
    };

    match result {
        Ok(record) => Ok(Json(record)),
        Err(UploadError::Unsupported) => Err(AppError::unsupported_media_type(format!(
            "payload is not valid {}",
            content_type
        ))),
        Err(UploadError::Storage(err)) => {
            tracing::error!(error = ?err, "upload failed");
            Err(AppError::internal("failed to store media"))
        }
    }
}

/// Images are buffered fully in memory per upload policy, bounded by config.
async fn buffer_body(body: Body, max_bytes: usize) -> Result<bytes::Bytes, AppError> {
    let mut stream = body.into_data_stream();
    let mut buf = Vec::new();
    while let Some(chunk) = stream
        .try_next()
        .await
        .map_err(|_| AppError::bad_request("failed to read request body"))?
    {
        if buf.len() + chunk.len() > max_bytes {
            return Err(AppError::bad_request("image exceeds buffering limit"));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(bytes::Bytes::from(buf))
}

/// Pull the filename parameter out of a Content-Disposition header.
fn disposition_filename(value: &str) -> Option<String> {
    for part in value.split(';') {
        let part = part.trim();
        if let Some(raw) = part
            .strip_prefix("filename=")
            .or_else(|| part.strip_prefix("FILENAME="))
        {
            let name = raw.trim().trim_matches('"').trim();
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Download, thumbnail, delete
// ---------------------------------------------------------------------------

fn parse_id(raw: &str) -> Result<i64, AppError> {
    raw.parse::<i64>()
        .map_err(|_| AppError::bad_request("invalid media id"))
}

pub async fn get_media(
    _session: Session,
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: axum::http::HeaderMap,
) -> Result<Response, AppError> {
    let id = parse_id(&id)?;
    let record = media_service(&state)
        .get_by_id(id)
        .await
        .map_err(|err| {
            tracing::error!(error = ?err, media_id = id, "failed to fetch media");
            AppError::internal("failed to fetch media")
        })?
        .ok_or_else(|| AppError::not_found("media not found"))?;

    let total = record.logical_size.max(0) as u64;
    let requested = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok());
    let byte_range = match range::parse(requested, total) {
        Ok(byte_range) => byte_range,
        Err(RangeError::Malformed) => {
            return Err(AppError::bad_request("invalid Range header"));
        }
        Err(RangeError::Unsatisfiable) => {
            return Response::builder()
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(header::CONTENT_RANGE, format!("bytes */{}", total))
                .body(Body::empty())
                .map_err(|err| {
                    tracing::error!(error = ?err, media_id = id, "failed to build response");
                    AppError::internal("failed to stream media")
                });
        }
    };

    let stream = open_blob(&state, &record.stored_name, id).await?;

    // Clients download under the human-meaningful name, not the stored one.
    let disposition = format!(
        "attachment; filename=\"{}\"",
        record.original_name.replace(['"', '\\'], "_")
    );

    let builder = Response::builder()
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_TYPE, &record.content_type)
        .header(header::CONTENT_DISPOSITION, disposition);

    let response = match byte_range {
        Some(byte_range) => builder
            .status(StatusCode::PARTIAL_CONTENT)
            .header(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", byte_range.start, byte_range.end, total),
            )
            .header(header::CONTENT_LENGTH, byte_range.len())
            .body(Body::from_stream(range::slice_stream(stream, &byte_range))),
        None => builder
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, total)
            .body(Body::from_stream(stream)),
    };

    response.map_err(|err| {
        tracing::error!(error = ?err, media_id = id, "failed to build response");
        AppError::internal("failed to stream media")
    })
}

pub async fn get_thumbnail(
    _session: Session,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let id = parse_id(&id)?;
    let record = media_service(&state)
        .get_by_id(id)
        .await
        .map_err(|err| {
            tracing::error!(error = ?err, media_id = id, "failed to fetch media");
            AppError::internal("failed to fetch media")
        })?
        .ok_or_else(|| AppError::not_found("media not found"))?;

    let stream = open_blob(&state, &record.thumb_name, id).await?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "image/png")
        .body(Body::from_stream(stream))
        .map_err(|err| {
            tracing::error!(error = ?err, media_id = id, "failed to build response");
            AppError::internal("failed to stream thumbnail")
        })
}

/// A record whose blob is missing is an invariant violation, not a 404:
/// the id is known, the storage is inconsistent.
async fn open_blob(
    state: &AppState,
    name: &str,
    id: i64,
) -> Result<futures::stream::BoxStream<'static, std::io::Result<bytes::Bytes>>, AppError> {
    state.blobs.open_read(name).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            tracing::error!(media_id = id, stored_name = %name, "blob missing for live record");
        } else {
            tracing::error!(error = ?err, media_id = id, "failed to open blob");
        }
        AppError::internal("failed to open media")
    })
}

pub async fn delete_media(
    _session: Session,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let id = parse_id(&id)?;
    let deleted = media_service(&state).delete(id).await.map_err(|err| {
        tracing::error!(error = ?err, media_id = id, "failed to delete media");
        AppError::internal("failed to delete media")
    })?;

    if deleted {
        Ok(StatusCode::OK)
    } else {
        Err(AppError::not_found("media not found"))
    }
}
