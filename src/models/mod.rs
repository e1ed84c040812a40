//! Core data models for the property image store.
//!
//! These entities map to the `image_objects` / `image_chunks` tables via
//! `sqlx::FromRow` and serialize as camelCase JSON via `serde`.

pub mod image;
