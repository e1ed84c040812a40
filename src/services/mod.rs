pub mod image_store;
pub mod ingestion;
pub mod record_store;
