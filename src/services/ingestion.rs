//! Admission policy applied to an upload before any byte is persisted.
//!
//! The policy only filters on declared shape (media type, filename, size).
//! A missing media type is accepted, so it must not be treated as an
//! access-control or content-sniffing boundary.

use thiserror::Error;

/// Default maximum admitted object size: 5 MiB.
pub const DEFAULT_MAX_OBJECT_BYTES: u64 = 5 * 1024 * 1024;

/// Filename extensions accepted regardless of the declared media type.
pub const IMAGE_EXTENSIONS: [&str; 6] = [".jpg", ".jpeg", ".png", ".gif", ".webp", ".bmp"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("object exceeds the {limit} byte limit")]
    SizeExceeded { limit: u64 },
    #[error("only image files are allowed, received `{media_type}` for `{filename}`")]
    UnsupportedMediaType { media_type: String, filename: String },
}

#[derive(Debug, Clone)]
pub struct IngestionGate {
    max_object_bytes: u64,
}

impl Default for IngestionGate {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_OBJECT_BYTES)
    }
}

impl IngestionGate {
    pub fn new(max_object_bytes: u64) -> Self {
        Self { max_object_bytes }
    }

    pub fn max_object_bytes(&self) -> u64 {
        self.max_object_bytes
    }

    /// Decide whether an upload may start.
    ///
    /// `size_hint` is the declared size when the caller knows it up front;
    /// the streamed size is re-checked with [`IngestionGate::check_observed`].
    pub fn admit(
        &self,
        media_type: Option<&str>,
        filename: &str,
        size_hint: Option<u64>,
    ) -> Result<(), Rejection> {
        if let Some(size) = size_hint {
            self.check_observed(size)?;
        }

        let media_type = media_type.map(str::trim).unwrap_or("");
        if media_type.is_empty()
            || media_type.starts_with("image/")
            || has_image_extension(filename)
        {
            return Ok(());
        }

        Err(Rejection::UnsupportedMediaType {
            media_type: media_type.to_string(),
            filename: filename.to_string(),
        })
    }

    /// Enforce the size limit against the number of bytes seen so far.
    pub fn check_observed(&self, observed: u64) -> Result<(), Rejection> {
        if observed > self.max_object_bytes {
            Err(Rejection::SizeExceeded {
                limit: self.max_object_bytes,
            })
        } else {
            Ok(())
        }
    }
}

fn has_image_extension(filename: &str) -> bool {
    let lower = filename.to_ascii_lowercase();
    IMAGE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}
