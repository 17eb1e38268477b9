//! Knowledge-base files managed from the dashboard.

use std::sync::Arc;

use axum::{
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::app::AppState;
use crate::auth::require_operator;
use crate::error::{ApiError, ApiResult};
use crate::extract::{extract_text_content, guess_mime_type, mime_essence, OCTET_STREAM};
use crate::rag::{self, Entry, EntryMetadata, EntryStatus, NewEntry};
use crate::storage::content_hash;
use crate::subscriptions::load_subscription;
use crate::types::{Page, PageRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PublicFileStatus {
    Ready,
    Processing,
    Error,
}

impl From<EntryStatus> for PublicFileStatus {
    fn from(status: EntryStatus) -> Self {
        match status {
            EntryStatus::Ready => Self::Ready,
            EntryStatus::Pending => Self::Processing,
            EntryStatus::Error => Self::Error,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicFile {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub file_type: String,
    pub size: String,
    pub status: PublicFileStatus,
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFilesQuery {
    pub category: Option<String>,
    pub num_items: Option<i64>,
    pub cursor: Option<String>,
}

#[derive(Debug, Default)]
struct UploadForm {
    file_name: String,
    mime_type: String,
    part_content_type: String,
    category: Option<String>,
    bytes: Vec<u8>,
}

impl UploadForm {
    /// Explicit field, then the part's own type, then a guess from name and bytes.
    /// Parameters such as `charset` are dropped.
    fn resolved_mime_type(&self) -> String {
        let explicit = mime_essence(&self.mime_type);
        if !explicit.is_empty() {
            return explicit;
        }
        let part = mime_essence(&self.part_content_type);
        if !part.is_empty() && part != OCTET_STREAM {
            return part;
        }
        guess_mime_type(&self.file_name, &self.bytes)
    }
}

pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes == 0 {
        return "0 B".to_string();
    }
    let exponent = ((bytes as f64).ln() / 1024f64.ln()).floor() as usize;
    let exponent = exponent.min(UNITS.len() - 1);
    let value = bytes as f64 / 1024f64.powi(exponent as i32);
    let rounded = (value * 10.0).round() / 10.0;
    if rounded.fract() == 0.0 {
        format!("{} {}", rounded as u64, UNITS[exponent])
    } else {
        format!("{rounded:.1} {}", UNITS[exponent])
    }
}

pub fn file_extension(name: &str) -> String {
    name.rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
        .unwrap_or_else(|| "txt".to_string())
}

pub fn public_file(entry: &Entry, size_bytes: Option<i64>, url: Option<String>) -> PublicFile {
    let name = if entry.key.is_empty() {
        "unknown".to_string()
    } else {
        entry.key.clone()
    };
    PublicFile {
        id: entry.entry_id.clone(),
        file_type: file_extension(&name),
        name,
        size: size_bytes
            .filter(|s| *s > 0)
            .map(|s| format_file_size(s as u64))
            .unwrap_or_else(|| "unknown".to_string()),
        status: entry.status.into(),
        url,
        category: entry.metadata.category.clone().filter(|c| !c.is_empty()),
    }
}

async fn convert_entry_to_public_file(state: &AppState, entry: &Entry) -> PublicFile {
    let Some(storage_id) = entry.metadata.storage_id.as_deref() else {
        return public_file(entry, None, None);
    };
    let size = match state.storage.metadata(&state.db, storage_id).await {
        Ok(object) => object.map(|o| o.size),
        Err(err) => {
            warn!(entry_id = %entry.entry_id, error = %err, "failed to read storage metadata");
            None
        }
    };
    public_file(entry, size, Some(state.storage.url(storage_id)))
}

async fn read_upload(mut multipart: Multipart) -> ApiResult<UploadForm> {
    let mut form = UploadForm::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(format!("invalid multipart body: {err}")))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "file" => {
                if form.file_name.is_empty() {
                    form.file_name = field.file_name().unwrap_or("").to_string();
                }
                form.part_content_type = field.content_type().unwrap_or("").to_string();
                form.bytes = field
                    .bytes()
                    .await
                    .map_err(|err| ApiError::bad_request(format!("failed to read file: {err}")))?
                    .to_vec();
            }
            "fileName" | "mimeType" | "category" => {
                let value = field
                    .text()
                    .await
                    .map_err(|err| ApiError::bad_request(format!("invalid {name} field: {err}")))?
                    .trim()
                    .to_string();
                match name.as_str() {
                    "fileName" if !value.is_empty() => form.file_name = value,
                    "mimeType" => form.mime_type = value,
                    "category" if !value.is_empty() => form.category = Some(value),
                    _ => {}
                }
            }
            _ => {}
        }
    }
    if form.bytes.is_empty() {
        return Err(ApiError::bad_request("file is required"));
    }
    if form.file_name.is_empty() {
        return Err(ApiError::bad_request("fileName is required"));
    }
    Ok(form)
}

pub async fn add_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    multipart: Multipart,
) -> ApiResult<impl IntoResponse> {
    let (_, org_id) = require_operator(&state, &headers).await?;
    let active = load_subscription(&state.db, &org_id)
        .await?
        .is_some_and(|s| s.is_active());
    if !active {
        return Err(ApiError::bad_request(
            "Active subscription required to enhance responses.",
        ));
    }

    let form = read_upload(multipart).await?;
    let mime_type = form.resolved_mime_type();
    let object = state.storage.store(&state.db, &mime_type, &form.bytes).await?;

    let text = match extract_text_content(&state.ai, &form.file_name, &mime_type, &form.bytes).await {
        Ok(text) => text,
        Err(err) => {
            state.storage.discard(&state.db, &object.id).await;
            return Err(err);
        }
    };

    let added = match rag::add(
        &state,
        NewEntry {
            namespace: &org_id,
            key: &form.file_name,
            title: &form.file_name,
            text: &text,
            metadata: EntryMetadata {
                storage_id: Some(object.id.clone()),
                uploaded_by: org_id.clone(),
                file_name: form.file_name.clone(),
                category: form.category.clone(),
            },
            content_hash: &content_hash(&form.bytes),
        },
    )
    .await
    {
        Ok(added) => added,
        Err(err) => {
            state.storage.discard(&state.db, &object.id).await;
            return Err(err);
        }
    };

    let url = if added.created {
        Some(state.storage.url(&object.id))
    } else {
        debug!(entry_id = %added.entry_id, "entry already exists, dropping duplicate upload");
        state.storage.delete(&state.db, &object.id).await?;
        rag::get_entry(&state.db, &added.entry_id)
            .await?
            .and_then(|entry| entry.metadata.storage_id)
            .map(|id| state.storage.url(&id))
    };
    info!(organization_id = %org_id, entry_id = %added.entry_id, file_name = %form.file_name, "file added");
    Ok((
        StatusCode::CREATED,
        Json(json!({ "url": url, "entryId": added.entry_id })),
    ))
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListFilesQuery>,
) -> ApiResult<impl IntoResponse> {
    let (_, org_id) = require_operator(&state, &headers).await?;
    let Some(namespace) = rag::get_namespace(&state.db, &org_id).await? else {
        return Ok(Json(Page::<PublicFile>::empty()));
    };
    let request = PageRequest::new(query.num_items, query.cursor.as_deref());
    let entries = rag::list(&state.db, &namespace.namespace_id, &request).await?;

    let mut files = Vec::with_capacity(entries.page.len());
    for entry in &entries.page {
        files.push(convert_entry_to_public_file(&state, entry).await);
    }
    let category = query.category.as_deref().filter(|c| !c.is_empty());
    if let Some(category) = category {
        files.retain(|file| file.category.as_deref() == Some(category));
    }
    Ok(Json(Page {
        page: files,
        is_done: entries.is_done,
        continue_cursor: entries.continue_cursor,
    }))
}

pub async fn delete_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(entry_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let (_, org_id) = require_operator(&state, &headers).await?;
    let namespace = rag::get_namespace(&state.db, &org_id)
        .await?
        .ok_or_else(|| ApiError::unauthorized("Invalid Namespace"))?;
    let entry = rag::get_entry(&state.db, &entry_id)
        .await?
        .filter(|entry| entry.namespace_id == namespace.namespace_id)
        .ok_or_else(|| ApiError::not_found("Entry not found"))?;
    if entry.metadata.uploaded_by != org_id {
        return Err(ApiError::unauthorized(
            "You do not have permission to delete this file",
        ));
    }
    if let Some(storage_id) = entry.metadata.storage_id.as_deref() {
        state.storage.delete(&state.db, storage_id).await?;
    }
    rag::delete_entry(&state.db, &entry.entry_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, status: EntryStatus, category: Option<&str>) -> Entry {
        Entry {
            entry_id: "e1".into(),
            namespace_id: "ns".into(),
            key: key.into(),
            title: key.into(),
            content_hash: "h".into(),
            metadata: EntryMetadata {
                storage_id: Some("s1".into()),
                uploaded_by: "org_1".into(),
                file_name: key.into(),
                category: category.map(str::to_string),
            },
            status,
            created_at: String::new(),
        }
    }

    #[test]
    fn file_sizes_match_dashboard_format() {
        assert_eq!(format_file_size(0), "0 B");
        assert_eq!(format_file_size(512), "512 B");
        assert_eq!(format_file_size(1024), "1 KB");
        assert_eq!(format_file_size(1536), "1.5 KB");
        assert_eq!(format_file_size(2 * 1024 * 1024), "2 MB");
        assert_eq!(format_file_size(1_288_490_189), "1.2 GB");
    }

    #[test]
    fn extension_defaults_to_txt() {
        assert_eq!(file_extension("Guide.PDF"), "pdf");
        assert_eq!(file_extension("README"), "txt");
        assert_eq!(file_extension("archive.tar.gz"), "gz");
    }

    #[test]
    fn entries_convert_to_public_files() {
        let file = public_file(&entry("guide.pdf", EntryStatus::Pending, Some("Docs")), Some(1536), None);
        assert_eq!(file.name, "guide.pdf");
        assert_eq!(file.file_type, "pdf");
        assert_eq!(file.size, "1.5 KB");
        assert_eq!(file.status, PublicFileStatus::Processing);
        assert_eq!(file.category.as_deref(), Some("Docs"));

        let file = public_file(&entry("", EntryStatus::Error, None), None, None);
        assert_eq!(file.name, "unknown");
        assert_eq!(file.size, "unknown");
        assert_eq!(file.status, PublicFileStatus::Error);

        let value = serde_json::to_value(&file).unwrap();
        assert_eq!(value["type"], "txt");
        assert!(value.get("category").is_none());
        assert!(value["url"].is_null());
    }

    #[test]
    fn upload_mime_resolution_order() {
        let mut form = UploadForm {
            file_name: "notes.md".into(),
            part_content_type: OCTET_STREAM.into(),
            bytes: b"# hi".to_vec(),
            ..UploadForm::default()
        };
        assert_eq!(form.resolved_mime_type(), "text/markdown");
        form.part_content_type = "text/html".into();
        assert_eq!(form.resolved_mime_type(), "text/html");
        form.mime_type = "text/plain".into();
        assert_eq!(form.resolved_mime_type(), "text/plain");
    }

    #[test]
    fn upload_mime_drops_parameters() {
        let mut form = UploadForm {
            file_name: "notes".into(),
            part_content_type: "text/plain; charset=utf-8".into(),
            bytes: b"hello".to_vec(),
            ..UploadForm::default()
        };
        assert_eq!(form.resolved_mime_type(), "text/plain");
        form.mime_type = " Text/HTML;charset=UTF-8 ".into();
        assert_eq!(form.resolved_mime_type(), "text/html");
    }
}
