use std::time::Duration;

use axum::extract::{Json, Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::{DateTime, NaiveDateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::error::{AppError, AppResult};
use crate::lifecycle::{
    can_delete_file, can_download, can_modify_request, FILE_CATEGORY_REPORT, FILE_CATEGORY_REQUEST,
};
use crate::models::{AnalysisRequest, NewRequestFile, RequestFile};
use crate::schema::{request_files, requests};
use crate::state::AppState;

const DOWNLOAD_URL_EXPIRY_SECONDS: u64 = 300;
const UPLOAD_URL_EXPIRY_SECONDS: u64 = 600;

/// CAD exchange formats, documents and images; everything else is refused
/// at upload initiation.
pub const ALLOWED_CONTENT_TYPES: &[&str] = &[
    "application/step",
    "application/iges",
    "application/x-pdf",
    "application/pdf",
    "image/png",
    "image/jpeg",
    "image/gif",
    "text/plain",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.ms-powerpoint",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
];

#[derive(Deserialize)]
pub struct InitiateUploadRequest {
    pub file_name: String,
    pub file_size: i64,
    pub content_type: Option<String>,
    pub category: Option<String>,
    pub special_notes: Option<String>,
}

#[derive(Serialize)]
pub struct InitiateUploadResponse {
    pub file_id: Uuid,
    pub upload_url: String,
    pub file_path: String,
    pub expires_in: u64,
}

#[derive(Serialize)]
pub struct FileResponse {
    pub id: Uuid,
    pub request_id: Uuid,
    pub file_name: String,
    pub file_path: String,
    pub file_size: i64,
    pub content_type: String,
    pub file_category: String,
    pub uploaded_by: Uuid,
    pub metadata: Value,
    pub uploaded_at: String,
}

impl From<RequestFile> for FileResponse {
    fn from(file: RequestFile) -> Self {
        Self {
            id: file.id,
            request_id: file.request_id,
            file_name: file.file_name,
            file_path: file.file_path,
            file_size: file.file_size,
            content_type: file.content_type,
            file_category: file.file_category,
            uploaded_by: file.uploaded_by,
            metadata: file.metadata,
            uploaded_at: to_iso(file.uploaded_at),
        }
    }
}

#[derive(Serialize)]
pub struct FileListResponse {
    pub files: Vec<FileResponse>,
}

#[derive(Serialize)]
pub struct DownloadResponse {
    pub download_url: String,
    pub file_name: String,
    pub file_size: i64,
    pub content_type: String,
    pub expires_in: u64,
}

fn to_iso(dt: NaiveDateTime) -> String {
    DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc).to_rfc3339()
}

pub async fn list_files(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
    user: AuthenticatedUser,
) -> AppResult<Json<FileListResponse>> {
    let mut conn = state.db()?;
    let request: AnalysisRequest = requests::table.find(request_id).first(&mut conn)?;

    if !can_download(&user.actor(), request.requester_id, request.assignee_id) {
        return Err(AppError::forbidden(
            "not allowed to access this request's files",
        ));
    }

    let files: Vec<RequestFile> = request_files::table
        .filter(request_files::request_id.eq(request_id))
        .order(request_files::uploaded_at.desc())
        .load(&mut conn)?;

    Ok(Json(FileListResponse {
        files: files.into_iter().map(FileResponse::from).collect(),
    }))
}

pub async fn initiate_upload(
    State(state): State<AppState>,
    Path(request_id): Path<Uuid>,
    user: AuthenticatedUser,
    Json(payload): Json<InitiateUploadRequest>,
) -> AppResult<(StatusCode, Json<InitiateUploadResponse>)> {
    let file_name = payload.file_name.trim().to_string();
    if file_name.is_empty() {
        return Err(AppError::bad_request("file_name must not be empty"));
    }
    if payload.file_size <= 0 {
        return Err(AppError::bad_request("file_size must be positive"));
    }
    if payload.file_size > state.config.max_upload_bytes {
        return Err(AppError::bad_request(format!(
            "file size exceeds the {} MiB limit",
            state.config.max_upload_bytes / (1024 * 1024)
        )));
    }

    let content_type = resolve_content_type(payload.content_type.as_deref(), &file_name);
    if !ALLOWED_CONTENT_TYPES.contains(&content_type.as_str()) {
        return Err(AppError::bad_request(format!(
            "unsupported file type '{content_type}'"
        )));
    }

    let category = match payload.category.as_deref() {
        None | Some(FILE_CATEGORY_REQUEST) => FILE_CATEGORY_REQUEST,
        Some(FILE_CATEGORY_REPORT) => FILE_CATEGORY_REPORT,
        Some(other) => {
            return Err(AppError::bad_request(format!(
                "invalid file category '{other}'"
            )))
        }
    };

    let mut conn = state.db()?;
    let request: AnalysisRequest = requests::table.find(request_id).first(&mut conn)?;

    if !can_modify_request(&user.actor(), request.requester_id, request.assignee_id) {
        return Err(AppError::forbidden(
            "not allowed to upload files to this request",
        ));
    }

    let safe_name = sanitize_file_name(&file_name);
    let file_path = storage_key(request_id, user.user_id, &safe_name);

    let mut metadata = json!({
        "originalFileName": file_name,
        "safeFileName": safe_name,
        "type": category,
    });
    if let Some(notes) = payload
        .special_notes
        .as_deref()
        .map(str::trim)
        .filter(|notes| !notes.is_empty())
    {
        metadata["specialNotes"] = json!(notes);
    }

    // Phase one: the metadata row. If the write credential below cannot be
    // issued the row is deleted again so metadata never outlives bytes.
    let new_file = NewRequestFile {
        id: Uuid::new_v4(),
        request_id,
        file_name: file_name.clone(),
        file_path: file_path.clone(),
        file_size: payload.file_size,
        content_type: content_type.clone(),
        file_category: category.to_string(),
        uploaded_by: user.user_id,
        metadata,
    };

    diesel::insert_into(request_files::table)
        .values(&new_file)
        .execute(&mut conn)?;

    drop(conn);

    let upload_url = match state
        .storage
        .presign_put_object(
            &file_path,
            &content_type,
            Duration::from_secs(UPLOAD_URL_EXPIRY_SECONDS),
        )
        .await
    {
        Ok(url) => url,
        Err(err) => {
            error!(request_id = %request_id, key = %file_path, error = %err, "upload credential issuance failed");
            let mut conn = state.db()?;
            diesel::delete(request_files::table.find(new_file.id)).execute(&mut conn)?;
            return Err(AppError::internal("failed to create upload URL"));
        }
    };

    info!(
        request_id = %request_id,
        file_id = %new_file.id,
        category = category,
        uploader_id = %user.user_id,
        "upload initiated"
    );

    Ok((
        StatusCode::CREATED,
        Json(InitiateUploadResponse {
            file_id: new_file.id,
            upload_url,
            file_path,
            expires_in: UPLOAD_URL_EXPIRY_SECONDS,
        }),
    ))
}

pub async fn download_file(
    State(state): State<AppState>,
    Path((request_id, file_id)): Path<(Uuid, Uuid)>,
    user: AuthenticatedUser,
) -> AppResult<Json<DownloadResponse>> {
    let mut conn = state.db()?;

    let file: RequestFile = request_files::table
        .find(file_id)
        .filter(request_files::request_id.eq(request_id))
        .first(&mut conn)?;
    let request: AnalysisRequest = requests::table.find(request_id).first(&mut conn)?;

    if !can_download(&user.actor(), request.requester_id, request.assignee_id) {
        return Err(AppError::forbidden("not allowed to download this file"));
    }

    drop(conn);

    let download_url = state
        .storage
        .presign_get_object(
            &file.file_path,
            Duration::from_secs(DOWNLOAD_URL_EXPIRY_SECONDS),
        )
        .await
        .map_err(|err| AppError::internal(format!("failed to generate download URL: {err}")))?;

    Ok(Json(DownloadResponse {
        download_url,
        file_name: file.file_name,
        file_size: file.file_size,
        content_type: file.content_type,
        expires_in: DOWNLOAD_URL_EXPIRY_SECONDS,
    }))
}

pub async fn delete_file(
    State(state): State<AppState>,
    Path((request_id, file_id)): Path<(Uuid, Uuid)>,
    user: AuthenticatedUser,
) -> AppResult<impl IntoResponse> {
    let mut conn = state.db()?;

    let file: RequestFile = request_files::table
        .find(file_id)
        .filter(request_files::request_id.eq(request_id))
        .first(&mut conn)?;
    let request: AnalysisRequest = requests::table.find(request_id).first(&mut conn)?;

    if !can_delete_file(
        &user.actor(),
        &file.file_category,
        file.uploaded_by,
        request.requester_id,
    ) {
        return Err(AppError::forbidden("not allowed to delete this file"));
    }

    diesel::delete(request_files::table.find(file_id)).execute(&mut conn)?;
    drop(conn);

    // Metadata row is gone; a failed object delete only leaves an orphan
    // in the bucket and is not surfaced.
    if let Err(err) = state.storage.delete_object(&file.file_path).await {
        warn!(file_id = %file_id, key = %file.file_path, error = %err, "storage delete failed after metadata delete");
    }

    info!(request_id = %request_id, file_id = %file_id, actor_id = %user.user_id, "file deleted");
    Ok(StatusCode::NO_CONTENT)
}

fn resolve_content_type(declared: Option<&str>, file_name: &str) -> String {
    if let Some(value) = declared.map(str::trim).filter(|value| !value.is_empty()) {
        return value.to_lowercase();
    }
    mime_guess::from_path(file_name)
        .first_raw()
        .unwrap_or("application/octet-stream")
        .to_string()
}

/// Collision-resistant storage name: the display name stays in the
/// metadata row, the object key never reuses user input except the
/// extension.
fn sanitize_file_name(file_name: &str) -> String {
    let extension = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty() && ext.chars().all(|ch| ch.is_ascii_alphanumeric()))
        .map(|ext| format!(".{}", ext.to_lowercase()))
        .unwrap_or_default();

    let unique = Uuid::new_v4().simple().to_string();
    format!(
        "{}_{}{}",
        Utc::now().timestamp_millis(),
        &unique[..12],
        extension
    )
}

fn storage_key(request_id: Uuid, uploader_id: Uuid, safe_name: &str) -> String {
    format!("{request_id}/{uploader_id}/{safe_name}")
}
