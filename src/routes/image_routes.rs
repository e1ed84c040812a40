//! Defines routes for the property image API.
//!
//! ## Structure
//! - `POST   /api/images/upload`      — multipart upload (part `image`)
//! - `GET    /api/images`             — list images (supports prefix, limit)
//! - `GET    /api/images/{id}`        — stream raw image bytes
//! - `HEAD   /api/images/{id}`        — headers only
//! - `GET    /api/images/base64/{id}` — image as a base64 data URI
//! - `DELETE /api/images/{id}`        — delete image and all its chunks
//! - `GET    /healthz`, `GET /readyz`  — probes

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        image_handlers::{
            MULTIPART_OVERHEAD, delete_image, get_image, get_image_base64, head_image,
            list_images, upload_image,
        },
    },
    services::{image_store::ImageStore, ingestion::IngestionGate},
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

/// Request body limit for uploads. Slightly above the admitted object size so
/// that oversize uploads are rejected by the ingestion gate with a
/// `SizeExceeded` error rather than by the framework.
pub fn upload_body_limit(gate: &IngestionGate) -> usize {
    usize::try_from(gate.max_object_bytes())
        .unwrap_or(usize::MAX)
        .saturating_add(MULTIPART_OVERHEAD)
}

/// Build the router for all image routes.
///
/// The router carries shared state (`ImageStore`) to all handlers.
pub fn routes(body_limit: usize) -> Router<ImageStore> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .max_age(Duration::from_secs(86400));

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/api/images", get(list_images))
        .route(
            "/api/images/upload",
            post(upload_image).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/api/images/base64/{id}", get(get_image_base64))
        .route(
            "/api/images/{id}",
            get(get_image).head(head_image).delete(delete_image),
        )
        .layer(cors)
}
