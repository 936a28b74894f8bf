//! HTTP handlers for the upload and download gateways.
//! Payloads are streamed in both directions; nothing here buffers a whole
//! video or audio file.

use crate::{
    errors::AppError,
    models::object::ObjectRecord,
    services::{download_service::JobStatusView, identity::Uploader},
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{FromRequest, Multipart, Path, Query, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::io;

/// Query params accepted by `GET /download`.
#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    pub fid: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub fid: String,
}

/// Extract the bearer token from `Authorization`, if any.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Decode a base64 `Content-MD5` header into the hex digest the store uses.
fn expected_hash(headers: &HeaderMap) -> Result<Option<String>, AppError> {
    let Some(value) = headers.get("content-md5") else {
        return Ok(None);
    };
    let digest = value
        .to_str()
        .ok()
        .and_then(|v| general_purpose::STANDARD.decode(v.trim()).ok())
        .filter(|bytes| bytes.len() == 16)
        .ok_or_else(|| AppError::bad_request("invalid Content-MD5 header"))?;
    Ok(Some(digest.iter().map(|b| format!("{:02x}", b)).collect()))
}

fn is_multipart(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim_start().to_ascii_lowercase().starts_with("multipart/form-data"))
}

/// `POST /upload`: submit a video for conversion.
///
/// Accepts either a multipart form carrying exactly one file, or a raw body
/// described by its `Content-Type`. Answers `202 Accepted` with the FID.
pub async fn upload(State(state): State<AppState>, request: Request) -> Result<Response, AppError> {
    let headers = request.headers().clone();
    let uploader = state.identity.authenticate(bearer_token(&headers)).await?;
    let expected = expected_hash(&headers)?;

    let object = if is_multipart(&headers) {
        let multipart = Multipart::from_request(request, &state)
            .await
            .map_err(|rejection| AppError::bad_request(rejection.body_text()))?;
        store_single_file(&state, &uploader, multipart, expected.as_deref()).await?
    } else {
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let stream = request
            .into_body()
            .into_data_stream()
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err));
        state
            .ingest
            .store_upload(&uploader, &content_type, stream, expected.as_deref())
            .await?
    };

    let fid = state.ingest.enqueue(&object, &uploader).await?;
    let body = Json(SubmitResponse {
        fid: fid.to_string(),
    });
    Ok((StatusCode::ACCEPTED, body).into_response())
}

/// Store the one file field of a multipart form. Any stored video is
/// discarded if the form turns out to hold more than one file, or none.
async fn store_single_file(
    state: &AppState,
    uploader: &Uploader,
    mut multipart: Multipart,
    expected: Option<&str>,
) -> Result<ObjectRecord, AppError> {
    let mut stored: Option<ObjectRecord> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                if let Some(object) = stored.take() {
                    state.ingest.discard(object.object_id).await;
                }
                return Err(AppError::bad_request(err.body_text()));
            }
        };
        // Plain form values ride along with the file; only files count.
        if field.file_name().is_none() {
            continue;
        }
        if let Some(object) = stored.take() {
            state.ingest.discard(object.object_id).await;
            return Err(AppError::bad_request("exactly one file is required"));
        }

        let content_type = field.content_type().unwrap_or_default().to_string();
        let stream = field.map_err(|err| io::Error::new(io::ErrorKind::Other, err));
        let object = state
            .ingest
            .store_upload(uploader, &content_type, stream, expected)
            .await?;
        stored = Some(object);
    }

    stored.ok_or_else(|| AppError::bad_request("exactly one file is required"))
}

/// `GET /download?fid=...`: stream the converted audio.
pub async fn download(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, AppError> {
    let fid = query
        .fid
        .filter(|fid| !fid.trim().is_empty())
        .ok_or_else(|| AppError::bad_request("fid is required"))?;

    let audio = state.download.fetch(&fid).await?;

    let mut response = Response::new(Body::from_stream(audio.stream));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&audio.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("audio/mpeg")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(audio.size.max(0)));
    if let Some(hash) = audio.content_hash.as_ref() {
        if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", hash)) {
            headers.insert(header::ETAG, value);
        }
    }
    if let Ok(value) =
        HeaderValue::from_str(&format!("attachment; filename=\"{}.mp3\"", audio.fid))
    {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    Ok(response)
}

/// `GET /jobs/{fid}`: conversion state without the payload.
pub async fn job_status(
    State(state): State<AppState>,
    Path(fid): Path<String>,
) -> Result<Json<JobStatusView>, AppError> {
    Ok(Json(state.download.status(&fid).await?))
}
