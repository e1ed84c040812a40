//! HTTP handlers for property image operations.
//! Streams image bodies chunk by chunk and delegates storage concerns to
//! `ImageStore`.

use crate::{
    errors::AppError,
    models::image::{EncodedImage, ImageFilter, StoredImage},
    services::image_store::ImageStore,
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, HeaderValue, header},
    response::Response,
};
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::io;
use tracing::warn;

/// Multipart part carrying the image bytes.
pub const UPLOAD_FIELD: &str = "image";

/// Room for multipart boundaries and part headers on top of the image itself.
pub const MULTIPART_OVERHEAD: usize = 64 * 1024;

const CACHE_CONTROL: &str = "public, max-age=31536000";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub message: String,
    pub file_id: String,
    pub filename: String,
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResponse {
    pub message: String,
    pub file_id: String,
}

/// Query params accepted by the listing endpoint.
#[derive(Debug, Deserialize)]
pub struct ListImagesQuery {
    pub prefix: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListImagesResponse {
    pub files: Vec<ImageSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSummary {
    pub id: String,
    pub filename: String,
    pub length: i64,
    pub uploaded_at: DateTime<Utc>,
    pub metadata: ImageMetadata,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMetadata {
    pub original_name: String,
    pub mime_type: String,
    pub upload_date: DateTime<Utc>,
}

impl From<StoredImage> for ImageSummary {
    fn from(image: StoredImage) -> Self {
        Self {
            id: image.id.to_string(),
            filename: image.filename,
            length: image.length,
            uploaded_at: image.uploaded_at,
            metadata: ImageMetadata {
                original_name: image.original_name,
                mime_type: image.content_type,
                upload_date: image.uploaded_at,
            },
        }
    }
}

/// Address under which a stored image can be fetched.
pub fn image_url(id: &str) -> String {
    format!("/api/images/{}", id)
}

/// Payload size implied by the request's `Content-Length`, allowing for
/// the multipart framing around the image part.
fn declared_image_size(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(|length| length.saturating_sub(MULTIPART_OVERHEAD as u64))
}

/// `POST /api/images/upload` — multipart upload, part named `image`.
pub async fn upload_image(
    State(store): State<ImageStore>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let size_hint = declared_image_size(&headers);
    if let Some(declared) = size_hint {
        store.admit_declared_size(declared)?;
    }

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(err.body_text()))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }

        let original_name = field
            .file_name()
            .filter(|name| !name.is_empty())
            .unwrap_or("upload")
            .to_string();
        let content_type = field.content_type().map(str::to_string);
        tracing::debug!(
            "receiving upload `{}` declared as {:?}",
            original_name,
            content_type
        );

        let stream = field.map(|chunk| chunk.map_err(io::Error::other));
        let image = store
            .store(stream, &original_name, content_type.as_deref(), size_hint)
            .await?;

        let file_id = image.id.to_string();
        return Ok(Json(UploadResponse {
            message: "File uploaded successfully".into(),
            url: image_url(&file_id),
            file_id,
            filename: image.filename,
        }));
    }

    Err(AppError::bad_request("No file uploaded"))
}

/// `GET /api/images/{id}` — stream the raw image bytes.
pub async fn get_image(
    State(store): State<ImageStore>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let id = ImageStore::parse_id(&id)?;
    let (meta, chunks) = store.open(id).await?;
    let chunks = chunks.inspect_err(move |err| warn!("aborting transfer of {}: {}", id, err));

    let mut response = Response::new(Body::from_stream(chunks));
    set_image_headers(response.headers_mut(), &meta);
    Ok(response)
}

/// `HEAD /api/images/{id}` — same headers as GET but no body.
pub async fn head_image(
    State(store): State<ImageStore>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let id = ImageStore::parse_id(&id)?;
    let meta = store.get(id).await?;
    let mut response = Response::new(Body::empty());
    set_image_headers(response.headers_mut(), &meta);
    Ok(response)
}

/// `GET /api/images/base64/{id}` — whole image as a data URI.
pub async fn get_image_base64(
    State(store): State<ImageStore>,
    Path(id): Path<String>,
) -> Result<Json<EncodedImage>, AppError> {
    let id = ImageStore::parse_id(&id)?;
    let encoded = store.fetch_encoded(id).await?;
    Ok(Json(encoded))
}

/// `DELETE /api/images/{id}`
pub async fn delete_image(
    State(store): State<ImageStore>,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>, AppError> {
    let id = ImageStore::parse_id(&id)?;
    store.delete(id).await?;
    Ok(Json(DeleteResponse {
        message: "File deleted successfully".into(),
        file_id: id.to_string(),
    }))
}

/// `GET /api/images` — enumerate committed images, supports ?prefix=&limit=
pub async fn list_images(
    State(store): State<ImageStore>,
    Query(q): Query<ListImagesQuery>,
) -> Result<Json<ListImagesResponse>, AppError> {
    let filter = ImageFilter {
        filename_prefix: q.prefix.filter(|p| !p.is_empty()),
        limit: q.limit,
    };
    let files = store
        .list(&filter)
        .await?
        .into_iter()
        .map(ImageSummary::from)
        .collect();
    Ok(Json(ListImagesResponse { files }))
}

fn set_image_headers(headers: &mut HeaderMap, meta: &StoredImage) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(meta.served_content_type())
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.length.max(0)));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(CACHE_CONTROL));

    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", meta.md5)) {
        headers.insert(header::ETAG, value);
    }
    if let Ok(value) = HeaderValue::from_str(
        &meta
            .uploaded_at
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string(),
    ) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}
