//! HTTP handlers for the upload API.
//! Marshal requests into `UploadLifecycle` calls and map the outcome to
//! status codes; no upload state is decided here.

use crate::{
    errors::AppError,
    handlers::AppState,
    models::{FilePart, FileRecord, FileView, NewUpload},
};
use axum::{
    Json,
    body::{Body, to_bytes},
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Query params accepted by `GET /files`.
#[derive(Debug, Deserialize)]
pub struct ListFilesQuery {
    pub limit: Option<u32>,
    #[serde(rename = "continuation-token")]
    pub continuation_token: Option<String>,
}

/// `part` stays a string so a malformed value gets the JSON error body.
#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub part: Option<String>,
}

impl UploadQuery {
    fn part_number(&self) -> Result<Option<u32>, AppError> {
        match self.part.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => raw.parse::<u32>().map(Some).map_err(|_| {
                AppError::bad_request(format!("part must be a positive integer, got `{}`", raw))
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct FinalizeRequest {
    #[serde(default)]
    pub hashes: Vec<FilePart>,
}

#[derive(Serialize)]
struct FileListResponse {
    files: Vec<FileView>,
    next_continuation_token: Option<String>,
}

#[derive(Serialize)]
struct CreatedFileResponse {
    file: FileView,
    upload: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    finalize: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    chunk_size: Option<u64>,
}

#[derive(Serialize)]
struct FileResponse {
    file: FileView,
    #[serde(skip_serializing_if = "Option::is_none")]
    upload: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    finalize: Option<String>,
}

#[derive(Serialize)]
struct PartUploadedResponse {
    part: u32,
    hash: String,
}

/// Ids that do not parse cannot name a record.
fn parse_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| AppError::not_found(format!("file `{}` not found", raw)))
}

fn upload_link(id: Uuid) -> String {
    format!("/files/{}/upload", id)
}

fn finalize_link(id: Uuid) -> String {
    format!("/files/{}/finalize", id)
}

/// Links a client may follow next, given the record's state.
fn next_links(file: &FileRecord) -> (Option<String>, Option<String>) {
    match file.is_multipart() {
        None => (None, None),
        Some(false) => (Some(upload_link(file.id)), None),
        Some(true) => (Some(upload_link(file.id)), Some(finalize_link(file.id))),
    }
}

/// GET `/files` - page through finalized files.
pub async fn list_files(
    State(state): State<AppState>,
    Query(q): Query<ListFilesQuery>,
) -> Result<impl IntoResponse, AppError> {
    let page = state
        .lifecycle
        .list_finalized(q.limit, q.continuation_token.as_deref())
        .await?;
    let storage = state.lifecycle.storage().as_ref();

    Ok(Json(FileListResponse {
        files: page.files.iter().map(|f| f.to_view(storage)).collect(),
        next_continuation_token: page.next.map(|cursor| cursor.encode()),
    }))
}

/// POST `/files` - start a new upload.
pub async fn create_file(
    State(state): State<AppState>,
    Json(request): Json<NewUpload>,
) -> Result<impl IntoResponse, AppError> {
    let file = state.lifecycle.create(request).await?;
    let multipart = file.multipart_token.is_some();

    let body = CreatedFileResponse {
        file: file.to_view(state.lifecycle.storage().as_ref()),
        upload: upload_link(file.id),
        finalize: multipart.then(|| finalize_link(file.id)),
        chunk_size: multipart.then(|| state.lifecycle.chunk_size()),
    };
    Ok((StatusCode::CREATED, Json(body)))
}

/// GET `/files/{id}`
pub async fn view_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let file = state.lifecycle.get(parse_id(&id)?).await?;
    let (upload, finalize) = next_links(&file);

    Ok(Json(FileResponse {
        file: file.to_view(state.lifecycle.storage().as_ref()),
        upload,
        finalize,
    }))
}

/// DELETE `/files/{id}`
pub async fn delete_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    state.lifecycle.delete(parse_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST `/files/{id}/upload?part=N` - raw body is the content.
///
/// Single-part uploads answer `201` with no body; multipart part uploads
/// answer `200` with the part's hash.
pub async fn upload_content(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<UploadQuery>,
    body: Body,
) -> Result<Response, AppError> {
    let id = parse_id(&id)?;
    let part = q.part_number()?;
    let content = to_bytes(body, state.max_body_size).await.map_err(|err| {
        AppError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("could not read upload body: {}", err),
        )
    })?;

    match state.lifecycle.upload_content(id, content, part).await? {
        Some(hash) => Ok(Json(PartUploadedResponse {
            part: part.unwrap_or_default(),
            hash,
        })
        .into_response()),
        None => Ok(StatusCode::CREATED.into_response()),
    }
}

/// POST `/files/{id}/finalize` - body `{"hashes": [{"part": 1, "hash": "..."}]}`.
pub async fn finalize_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<FinalizeRequest>,
) -> Result<impl IntoResponse, AppError> {
    state
        .lifecycle
        .finalize(parse_id(&id)?, &request.hashes)
        .await?;
    Ok(StatusCode::CREATED)
}

/// DELETE `/files/{id}/abort`
pub async fn abort_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    state.lifecycle.abort(parse_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET `/objects/{*key}` - serve the content of a finalized file.
///
/// Backs the `url` handed out when the server itself is the public URL.
pub async fn get_object(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, AppError> {
    let missing = || AppError::not_found(format!("object `{}` not found", key));

    let (id, _) = key.split_once('/').ok_or_else(missing)?;
    let id = Uuid::parse_str(id).map_err(|_| missing())?;
    let file = state.lifecycle.get(id).await?;
    if !file.is_finalized() || file.storage_key() != key {
        return Err(missing());
    }

    let content = state.lifecycle.storage().get(&key).await?;
    let content_type = file
        .mime_type
        .as_deref()
        .and_then(|mime| HeaderValue::from_str(mime).ok())
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));

    let mut response = Response::new(Body::from(content));
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, content_type);
    Ok(response)
}
