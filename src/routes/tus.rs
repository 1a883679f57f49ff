//! tus HTTP Routes
//!
//! Maps the tus 1.0.0 protocol onto a [`TusService`].
//!
//! Endpoints (relative to the configured upload URL):
//! - OPTIONS {upload_url} - Server capabilities
//! - GET {upload_url} - List live uploads
//! - POST {upload_url} - Create an upload
//! - HEAD {upload_url}/:resource_id - Current offset
//! - PATCH {upload_url}/:resource_id - Append a chunk
//! - DELETE {upload_url}/:resource_id - Terminate an upload
//! - GET {upload_url}/:resource_id - Download a completed upload

use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Path, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, head, options, MethodRouter},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::tus::{
    PatchOptions, PatchOutcome, ResourceId, TusError, TusService, UploadChecksum, UploadLength,
    UploadMetadata, SUPPORTED_ALGORITHMS, TUS_EXTENSIONS, TUS_VERSION,
};

// ============================================================================
// Protocol Headers
// ============================================================================

pub const TUS_RESUMABLE: HeaderName = HeaderName::from_static("tus-resumable");
pub const TUS_VERSION_HEADER: HeaderName = HeaderName::from_static("tus-version");
pub const TUS_EXTENSION: HeaderName = HeaderName::from_static("tus-extension");
pub const TUS_MAX_SIZE: HeaderName = HeaderName::from_static("tus-max-size");
pub const TUS_CHECKSUM_ALGORITHM: HeaderName = HeaderName::from_static("tus-checksum-algorithm");
pub const UPLOAD_OFFSET: HeaderName = HeaderName::from_static("upload-offset");
pub const UPLOAD_LENGTH: HeaderName = HeaderName::from_static("upload-length");
pub const UPLOAD_DEFER_LENGTH: HeaderName = HeaderName::from_static("upload-defer-length");
pub const UPLOAD_METADATA: HeaderName = HeaderName::from_static("upload-metadata");
pub const UPLOAD_CHECKSUM: HeaderName = HeaderName::from_static("upload-checksum");
pub const UPLOAD_EXPIRES: HeaderName = HeaderName::from_static("upload-expires");

/// Caller-chosen id for a new upload
pub const UPLOAD_RESOURCE_ID: HeaderName = HeaderName::from_static("upload-resource-id");

/// Every tus header a browser client needs to read, for CORS
pub const EXPOSED_HEADERS: [HeaderName; 10] = [
    TUS_RESUMABLE,
    TUS_VERSION_HEADER,
    TUS_EXTENSION,
    TUS_MAX_SIZE,
    TUS_CHECKSUM_ALGORITHM,
    UPLOAD_OFFSET,
    UPLOAD_LENGTH,
    UPLOAD_DEFER_LENGTH,
    UPLOAD_METADATA,
    UPLOAD_EXPIRES,
];

const PATCH_CONTENT_TYPE: &str = "application/offset+octet-stream";

// ============================================================================
// Router
// ============================================================================

/// Mount the tus routes for `service` at its configured upload URL
pub fn setup_tus<S>(service: TusService) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    setup_tus_with(service, |route| route)
}

/// Mount the tus routes, passing every handler except OPTIONS through
/// `decorate` (authentication, rate limiting, ...)
pub fn setup_tus_with<S, D>(service: TusService, decorate: D) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
    D: Fn(MethodRouter<TusService>) -> MethodRouter<TusService>,
{
    let base = service.config().upload_url.trim_end_matches('/').to_string();
    let collection = if base.is_empty() { "/".to_string() } else { base.clone() };
    let resource = format!("{base}/:resource_id");
    let max_chunk_size = service.config().max_chunk_size;

    Router::new()
        .route(
            &collection,
            options(upload_options).merge(decorate(get(upload_details).post(start_upload))),
        )
        .route(
            &resource,
            decorate(
                head(resource_details)
                    .patch(upload_resource)
                    .delete(delete_resource)
                    .get(download_resource),
            ),
        )
        .layer(DefaultBodyLimit::max(max_chunk_size))
        .layer(middleware::from_fn(tus_resumable))
        .with_state(service)
}

/// Check the client's protocol version and stamp `Tus-Resumable` on every
/// response
async fn tus_resumable(request: Request, next: Next) -> Response {
    let exempt = matches!(*request.method(), Method::OPTIONS | Method::GET);
    let checked = if exempt {
        Ok(())
    } else {
        check_version(request.headers())
    };

    let mut response = match checked {
        Ok(()) => next.run(request).await,
        Err(e) => e.into_response(),
    };

    response
        .headers_mut()
        .insert(TUS_RESUMABLE, HeaderValue::from_static(TUS_VERSION));
    response
}

fn check_version(headers: &HeaderMap) -> Result<(), TusError> {
    match header_str(headers, &TUS_RESUMABLE)? {
        Some(TUS_VERSION) => Ok(()),
        Some(other) => Err(TusError::UnsupportedVersion(other.to_string())),
        None => Err(TusError::UnsupportedVersion("missing Tus-Resumable".to_string())),
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// OPTIONS {upload_url}
async fn upload_options(State(service): State<TusService>) -> impl IntoResponse {
    let mut headers = TusHeaders::new()
        .insert(TUS_VERSION_HEADER, HeaderValue::from_static(TUS_VERSION))
        .insert(TUS_EXTENSION, HeaderValue::from_static(TUS_EXTENSIONS))
        .insert(TUS_CHECKSUM_ALGORITHM, HeaderValue::from_static(SUPPORTED_ALGORITHMS));

    if let Some(max) = service.config().max_size {
        headers = headers.insert(TUS_MAX_SIZE, HeaderValue::from(max));
    }

    (StatusCode::NO_CONTENT, headers.into_inner())
}

/// GET {upload_url}
async fn upload_details(State(service): State<TusService>) -> impl IntoResponse {
    Json(service.list().await)
}

/// POST {upload_url}
///
/// Create an upload from `Upload-Length` or `Upload-Defer-Length`.
async fn start_upload(
    State(service): State<TusService>,
    headers: HeaderMap,
) -> Result<Response, TusError> {
    let length = upload_length(&headers)?;

    let metadata = match header_str(&headers, &UPLOAD_METADATA)? {
        Some(value) => UploadMetadata::parse(value)?,
        None => UploadMetadata::default(),
    };

    let client_id = header_str(&headers, &UPLOAD_RESOURCE_ID)?
        .map(ResourceId::parse)
        .transpose()?;

    let resource = service.create(metadata, length, client_id).await?;

    let location = format!(
        "{}/{}",
        service.config().upload_url.trim_end_matches('/'),
        resource.id
    );
    let location = HeaderValue::from_str(&location)
        .map_err(|_| TusError::BadRequest(format!("unusable upload location: {location}")))?;

    let headers = TusHeaders::new()
        .insert(header::LOCATION, location)
        .insert(UPLOAD_OFFSET, HeaderValue::from(resource.offset))
        .expires(resource.expires_at);

    Ok((StatusCode::CREATED, headers.into_inner()).into_response())
}

/// HEAD {upload_url}/:resource_id
async fn resource_details(
    State(service): State<TusService>,
    Path(resource_id): Path<String>,
) -> Result<Response, TusError> {
    let id = path_id(&resource_id)?;
    let status = service.head(&id).await?;

    let headers = TusHeaders::new()
        .insert(UPLOAD_OFFSET, HeaderValue::from(status.offset))
        .length(status.length)
        .metadata(&status.metadata)
        .expires(status.expires_at)
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));

    Ok((StatusCode::OK, headers.into_inner()).into_response())
}

/// PATCH {upload_url}/:resource_id
///
/// Append the request body at `Upload-Offset`.
async fn upload_resource(
    State(service): State<TusService>,
    Path(resource_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, TusError> {
    let content_type = header_str(&headers, &header::CONTENT_TYPE)?.unwrap_or_default();
    if !content_type.eq_ignore_ascii_case(PATCH_CONTENT_TYPE) {
        return Err(TusError::UnsupportedMediaType(content_type.to_string()));
    }

    let id = path_id(&resource_id)?;

    let offset = header_u64(&headers, &UPLOAD_OFFSET)?
        .ok_or_else(|| TusError::BadRequest("missing Upload-Offset".to_string()))?;

    let options = PatchOptions {
        declared_length: header_u64(&headers, &UPLOAD_LENGTH)?,
        checksum: header_str(&headers, &UPLOAD_CHECKSUM)?
            .map(UploadChecksum::parse)
            .transpose()?,
    };

    let outcome = patch_detached(service, id, offset, body, options).await?;

    let headers = TusHeaders::new()
        .insert(UPLOAD_OFFSET, HeaderValue::from(outcome.offset))
        .expires(outcome.expires_at);

    Ok((StatusCode::NO_CONTENT, headers.into_inner()).into_response())
}

/// Runs the append on its own task. A client that disconnects mid-request
/// drops the handler future, but the locked section still runs to completion
/// before the next PATCH on the same id can start.
async fn patch_detached(
    service: TusService,
    id: ResourceId,
    offset: u64,
    body: Bytes,
    options: PatchOptions,
) -> Result<PatchOutcome, TusError> {
    tokio::spawn(async move { service.patch_with(&id, offset, &body, options).await })
        .await
        .map_err(|e| TusError::IoFailure(std::io::Error::other(e)))?
}

/// DELETE {upload_url}/:resource_id
async fn delete_resource(
    State(service): State<TusService>,
    Path(resource_id): Path<String>,
) -> Result<StatusCode, TusError> {
    let id = path_id(&resource_id)?;
    service.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET {upload_url}/:resource_id
///
/// Stream the bytes of a completed upload.
async fn download_resource(
    State(service): State<TusService>,
    Path(resource_id): Path<String>,
) -> Result<Response, TusError> {
    let id = path_id(&resource_id)?;
    let status = service.head(&id).await?;
    if !status.completed {
        return Err(TusError::Incomplete(id.to_string()));
    }

    let content_type = status
        .metadata
        .get_str("filetype")
        .and_then(|t| HeaderValue::from_str(t).ok())
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));

    let stream = service.read(&id, 0, status.offset).await?;

    let headers = TusHeaders::new()
        .insert(header::CONTENT_TYPE, content_type)
        .insert(header::CONTENT_LENGTH, HeaderValue::from(status.offset));

    Ok((StatusCode::OK, headers.into_inner(), Body::from_stream(stream)).into_response())
}

// ============================================================================
// Error Response
// ============================================================================

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: String,
}

impl IntoResponse for TusError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = match &self {
            TusError::AlreadyExists(_) => "ALREADY_EXISTS",
            TusError::NotFound(_) => "NOT_FOUND",
            TusError::Gone(_) => "GONE",
            TusError::OffsetMismatch { .. } => "OFFSET_MISMATCH",
            TusError::LengthExceeded { .. } => "LENGTH_EXCEEDED",
            TusError::InvalidLength(_) => "INVALID_LENGTH",
            TusError::ChecksumMismatch { .. } => "CHECKSUM_MISMATCH",
            TusError::UnsupportedChecksum(_) => "UNSUPPORTED_CHECKSUM",
            TusError::InvalidId(_) => "INVALID_ID",
            TusError::Incomplete(_) => "INCOMPLETE",
            TusError::UnsupportedVersion(_) => "UNSUPPORTED_VERSION",
            TusError::UnsupportedMediaType(_) => "UNSUPPORTED_MEDIA_TYPE",
            TusError::BadRequest(_) => "BAD_REQUEST",
            TusError::IoFailure(_) => "IO_FAILURE",
            TusError::Serialization(_) => "SERIALIZATION_ERROR",
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "Upload request failed");
        }

        let body = Json(ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
        });

        let mut response = (status, body).into_response();
        if status == StatusCode::PRECONDITION_FAILED {
            response
                .headers_mut()
                .insert(TUS_VERSION_HEADER, HeaderValue::from_static(TUS_VERSION));
        }
        response
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Response header builder
struct TusHeaders(HeaderMap);

impl TusHeaders {
    fn new() -> Self {
        Self(HeaderMap::new())
    }

    fn insert(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.0.insert(name, value);
        self
    }

    fn length(self, length: UploadLength) -> Self {
        match length {
            UploadLength::Known(total) => self.insert(UPLOAD_LENGTH, HeaderValue::from(total)),
            UploadLength::Deferred => self.insert(UPLOAD_DEFER_LENGTH, HeaderValue::from_static("1")),
        }
    }

    fn metadata(self, metadata: &UploadMetadata) -> Self {
        if metadata.is_empty() {
            return self;
        }
        match HeaderValue::from_str(&metadata.encode()) {
            Ok(value) => self.insert(UPLOAD_METADATA, value),
            Err(_) => self,
        }
    }

    fn expires(self, expires_at: DateTime<Utc>) -> Self {
        let formatted = expires_at.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        match HeaderValue::from_str(&formatted) {
            Ok(value) => self.insert(UPLOAD_EXPIRES, value),
            Err(_) => self,
        }
    }

    fn into_inner(self) -> HeaderMap {
        self.0
    }
}

/// Ids that cannot exist are reported as unknown, not malformed
fn path_id(raw: &str) -> Result<ResourceId, TusError> {
    ResourceId::parse(raw).map_err(|_| TusError::NotFound(raw.to_string()))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Result<Option<&'a str>, TusError> {
    headers
        .get(name)
        .map(|value| {
            value
                .to_str()
                .map(str::trim)
                .map_err(|_| TusError::BadRequest(format!("{name} is not valid ASCII")))
        })
        .transpose()
}

fn header_u64(headers: &HeaderMap, name: &HeaderName) -> Result<Option<u64>, TusError> {
    header_str(headers, name)?
        .map(|value| {
            value
                .parse::<u64>()
                .map_err(|_| TusError::BadRequest(format!("{name} must be a non-negative integer")))
        })
        .transpose()
}

fn upload_length(headers: &HeaderMap) -> Result<UploadLength, TusError> {
    let length = header_str(headers, &UPLOAD_LENGTH)?;
    let defer = header_str(headers, &UPLOAD_DEFER_LENGTH)?;

    match (length, defer) {
        (Some(_), Some(_)) => Err(TusError::InvalidLength(
            "Upload-Length and Upload-Defer-Length are mutually exclusive".to_string(),
        )),
        (Some(value), None) => value
            .parse()
            .map(UploadLength::Known)
            .map_err(|_| TusError::InvalidLength(format!("not a length: {value}"))),
        (None, Some("1")) => Ok(UploadLength::Deferred),
        (None, Some(value)) => Err(TusError::InvalidLength(format!(
            "Upload-Defer-Length must be 1, got {value}"
        ))),
        (None, None) => Err(TusError::InvalidLength(
            "Upload-Length or Upload-Defer-Length required".to_string(),
        )),
    }
}

// ============================================================================
// Tests
// ============================================================================
