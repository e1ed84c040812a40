//! Represents an uploaded property image and the chunks holding its bytes.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Default chunk size for new images: 255 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 255 * 1024;

/// Metadata record for a committed image.
///
/// The record is the authoritative existence marker: it is written only after
/// every chunk it references has been persisted, and it never changes once
/// committed. The payload itself lives in [`ImageChunk`] rows.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoredImage {
    /// Store-generated identifier.
    pub id: Uuid,

    /// Stored filename, `{unix_millis}-{original_name}`.
    pub filename: String,

    /// Filename as supplied by the uploader.
    pub original_name: String,

    /// Declared MIME type, empty when the uploader sent none.
    pub content_type: String,

    /// Total size in bytes.
    pub length: i64,

    /// Size of every chunk except possibly the last.
    pub chunk_size: i64,

    /// Number of chunks, `ceil(length / chunk_size)`.
    pub chunk_count: i64,

    /// Hex MD5 of the full payload.
    pub md5: String,

    /// When the upload was committed.
    pub uploaded_at: DateTime<Utc>,
}

impl StoredImage {
    /// Expected byte length of chunk `index`, or `None` when out of range.
    pub fn chunk_len(&self, index: i64) -> Option<usize> {
        if index < 0 || index >= self.chunk_count {
            return None;
        }
        let start = index * self.chunk_size;
        Some((self.length - start).min(self.chunk_size) as usize)
    }

    /// Content type to advertise to clients; images without a declared type
    /// are served as PNG.
    pub fn served_content_type(&self) -> &str {
        if self.content_type.is_empty() {
            "image/png"
        } else {
            &self.content_type
        }
    }
}

/// Number of chunks needed to hold `length` bytes.
pub fn chunk_count_for(length: u64, chunk_size: usize) -> u64 {
    length.div_ceil(chunk_size as u64)
}

/// One slice of an image payload.
#[derive(Clone, Debug)]
pub struct ImageChunk {
    pub object_id: Uuid,
    pub chunk_index: i64,
    pub data: Vec<u8>,
}

impl ImageChunk {
    pub fn new(object_id: Uuid, chunk_index: i64, data: Bytes) -> Self {
        Self {
            object_id,
            chunk_index,
            data: data.to_vec(),
        }
    }
}

/// Base64 projection of a whole image.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EncodedImage {
    /// `data:{mime};base64,{payload}`
    pub data_uri: String,
    pub filename: String,
    pub size: i64,
    pub content_type: String,
}

/// Filter for administrative enumeration of committed images.
#[derive(Clone, Debug, Default)]
pub struct ImageFilter {
    /// Only images whose stored filename starts with this prefix.
    pub filename_prefix: Option<String>,
    /// Maximum number of records to return.
    pub limit: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(length: i64, chunk_size: i64) -> StoredImage {
        StoredImage {
            id: Uuid::new_v4(),
            filename: "1-a.png".into(),
            original_name: "a.png".into(),
            content_type: String::new(),
            length,
            chunk_size,
            chunk_count: chunk_count_for(length as u64, chunk_size as usize) as i64,
            md5: String::new(),
            uploaded_at: Utc::now(),
        }
    }

    #[test]
    fn chunk_count_rounds_up() {
        assert_eq!(chunk_count_for(0, 10), 0);
        assert_eq!(chunk_count_for(1, 10), 1);
        assert_eq!(chunk_count_for(10, 10), 1);
        assert_eq!(chunk_count_for(11, 10), 2);
        assert_eq!(chunk_count_for(600 * 1024, DEFAULT_CHUNK_SIZE), 3);
    }

    #[test]
    fn last_chunk_holds_remainder() {
        let img = image(25, 10);
        assert_eq!(img.chunk_len(0), Some(10));
        assert_eq!(img.chunk_len(1), Some(10));
        assert_eq!(img.chunk_len(2), Some(5));
        assert_eq!(img.chunk_len(3), None);

        let exact = image(20, 10);
        assert_eq!(exact.chunk_len(1), Some(10));
    }

    #[test]
    fn empty_content_type_is_served_as_png() {
        let mut img = image(1, 10);
        assert_eq!(img.served_content_type(), "image/png");
        img.content_type = "image/webp".into();
        assert_eq!(img.served_content_type(), "image/webp");
    }
}
