//! src/services/image_store.rs
//!
//! ImageStore: chunked storage of property images on top of a
//! [`RecordStore`]. Uploads are split into fixed-size chunks that are each
//! written as an individual record; the metadata record is written last, so
//! an image becomes visible only once every one of its chunks exists.
//!
//! Write and delete ordering:
//! - upload: chunks `0..n` in index order, then the metadata record
//! - delete: all chunks, then the metadata record
//!
//! A failed or cancelled upload removes whatever chunks it already wrote.

use crate::{
    models::image::{EncodedImage, ImageChunk, ImageFilter, StoredImage, chunk_count_for},
    services::{
        ingestion::{IngestionGate, Rejection},
        record_store::{RecordStore, RecordStoreError},
    },
};
use base64::{Engine as _, engine::general_purpose};
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::{
    Stream, StreamExt,
    stream::{self, BoxStream},
    pin_mut,
};
use std::{io, sync::Arc};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid image identifier `{0}`")]
    InvalidIdentifier(String),
    #[error(transparent)]
    Rejected(#[from] Rejection),
    #[error("image `{0}` not found")]
    NotFound(Uuid),
    #[error("image `{0}` already exists")]
    AlreadyExists(Uuid),
    #[error("upload stream failed: {0}")]
    UpstreamReadFailure(#[source] io::Error),
    #[error("upload failed: {0}")]
    UploadFailed(#[source] RecordStoreError),
    #[error("delete failed: {0}")]
    DeleteFailed(#[source] RecordStoreError),
    #[error("record store read failed: {0}")]
    StorageReadFailure(#[source] RecordStoreError),
    #[error("upload of `{id}` wrote {found} chunks, expected {expected}")]
    IncompleteUpload { id: Uuid, expected: i64, found: i64 },
    #[error("streaming read of image `{id}` failed at chunk {index}: {reason}")]
    StreamingReadFailure { id: Uuid, index: i64, reason: String },
}

/// Coarse classification used by callers that only care about who is at fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad input; nothing was changed.
    Validation,
    /// The upload source failed or went away.
    Upstream,
    /// The record store failed.
    Storage,
    /// The image does not exist.
    NotFound,
}

impl StorageError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StorageError::InvalidIdentifier(_)
            | StorageError::Rejected(_)
            | StorageError::AlreadyExists(_) => ErrorClass::Validation,
            StorageError::UpstreamReadFailure(_) => ErrorClass::Upstream,
            StorageError::NotFound(_) => ErrorClass::NotFound,
            StorageError::UploadFailed(_)
            | StorageError::IncompleteUpload { .. }
            | StorageError::DeleteFailed(_)
            | StorageError::StorageReadFailure(_)
            | StorageError::StreamingReadFailure { .. } => ErrorClass::Storage,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Lazy, forward-only stream of an image's chunks in index order.
pub type ChunkStream = BoxStream<'static, StorageResult<Bytes>>;

#[derive(Clone)]
pub struct ImageStore {
    records: Arc<dyn RecordStore>,
    gate: IngestionGate,
    chunk_size: usize,
}

impl ImageStore {
    pub fn new(records: Arc<dyn RecordStore>, gate: IngestionGate, chunk_size: usize) -> Self {
        Self {
            records,
            gate,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Parse a client-supplied identifier without touching the store.
    pub fn parse_id(raw: &str) -> StorageResult<Uuid> {
        Uuid::parse_str(raw.trim()).map_err(|_| StorageError::InvalidIdentifier(raw.to_string()))
    }

    /// Readiness check for the underlying record store.
    pub async fn ping(&self) -> StorageResult<()> {
        self.records
            .ping()
            .await
            .map_err(StorageError::StorageReadFailure)
    }

    /// Refuse an upload whose declared size is already over the limit,
    /// before any of its body has been read.
    pub fn admit_declared_size(&self, declared: u64) -> StorageResult<()> {
        self.gate.check_observed(declared)?;
        Ok(())
    }

    /// Admit, chunk and commit an upload under a fresh identifier.
    ///
    /// `size_hint` is the declared payload size, if known. The returned
    /// record is already visible to readers. On any error no record exists
    /// and the chunks written so far have been removed.
    pub async fn store<S>(
        &self,
        stream: S,
        original_name: &str,
        content_type: Option<&str>,
        size_hint: Option<u64>,
    ) -> StorageResult<StoredImage>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        self.store_as(Uuid::new_v4(), stream, original_name, content_type, size_hint)
            .await
    }

    async fn store_as<S>(
        &self,
        id: Uuid,
        stream: S,
        original_name: &str,
        content_type: Option<&str>,
        size_hint: Option<u64>,
    ) -> StorageResult<StoredImage>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        self.gate.admit(content_type, original_name, size_hint)?;

        // Committed images are immutable; never write chunks under their id.
        if self.exists(id).await? {
            return Err(StorageError::AlreadyExists(id));
        }

        let mut pending = PendingUpload::new(self.records.clone(), id);
        let written = match self.write_chunks(id, stream).await {
            Ok(written) => written,
            Err(err) => {
                warn!("upload of {} aborted: {}", id, err);
                pending.discard().await;
                return Err(err);
            }
        };

        if let Err(err) = self.verify_chunks(id, written.chunk_count).await {
            warn!("refusing to commit {}: {}", id, err);
            pending.discard().await;
            return Err(err);
        }

        let uploaded_at = Utc::now();
        let object = StoredImage {
            id,
            filename: format!("{}-{}", uploaded_at.timestamp_millis(), original_name),
            original_name: original_name.to_string(),
            content_type: content_type.map(str::trim).unwrap_or("").to_string(),
            length: written.length as i64,
            chunk_size: self.chunk_size as i64,
            chunk_count: written.chunk_count,
            md5: written.md5,
            uploaded_at,
        };

        pending.begin_commit();
        if let Err(err) = self.records.put_object(&object).await {
            warn!("committing metadata for {} failed: {}", id, err);
            pending.discard().await;
            return Err(StorageError::UploadFailed(err));
        }
        pending.commit();

        info!(
            "stored image {} ({} bytes in {} chunks)",
            object.id, object.length, object.chunk_count
        );
        Ok(object)
    }

    /// Re-window the input into `chunk_size` slices and persist them in order.
    async fn write_chunks<S>(&self, id: Uuid, stream: S) -> StorageResult<WrittenChunks>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        pin_mut!(stream);
        let mut buffer = BytesMut::with_capacity(self.chunk_size);
        let mut length: u64 = 0;
        let mut next_index: i64 = 0;
        let mut digest = md5::Context::new();

        while let Some(frame) = stream.next().await {
            let frame = frame.map_err(StorageError::UpstreamReadFailure)?;
            length += frame.len() as u64;
            self.gate.check_observed(length)?;
            digest.consume(&frame);
            buffer.extend_from_slice(&frame);

            while buffer.len() >= self.chunk_size {
                let data = buffer.split_to(self.chunk_size).freeze();
                self.write_chunk(id, next_index, data).await?;
                next_index += 1;
            }
        }

        if !buffer.is_empty() {
            self.write_chunk(id, next_index, buffer.freeze()).await?;
            next_index += 1;
        }

        debug_assert_eq!(
            next_index as u64,
            chunk_count_for(length, self.chunk_size),
            "chunk count must match ceil(length / chunk_size)"
        );

        Ok(WrittenChunks {
            length,
            chunk_count: next_index,
            md5: format!("{:x}", digest.compute()),
        })
    }

    /// Confirm the store holds exactly `expected` chunks for `id` before the
    /// metadata record is allowed to reference them.
    async fn verify_chunks(&self, id: Uuid, expected: i64) -> StorageResult<()> {
        let found = self
            .records
            .count_chunks(id)
            .await
            .map_err(StorageError::UploadFailed)?;
        if found != expected {
            return Err(StorageError::IncompleteUpload {
                id,
                expected,
                found,
            });
        }
        Ok(())
    }

    async fn write_chunk(&self, id: Uuid, index: i64, data: Bytes) -> StorageResult<()> {
        debug!("writing chunk {} of {} ({} bytes)", index, id, data.len());
        self.records
            .put_chunk(&ImageChunk::new(id, index, data))
            .await
            .map_err(StorageError::UploadFailed)
    }

    /// Fetch a committed metadata record.
    pub async fn get(&self, id: Uuid) -> StorageResult<StoredImage> {
        self.records
            .get_object(id)
            .await
            .map_err(StorageError::StorageReadFailure)?
            .ok_or(StorageError::NotFound(id))
    }

    pub async fn exists(&self, id: Uuid) -> StorageResult<bool> {
        match self.get(id).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Enumerate committed images.
    pub async fn list(&self, filter: &ImageFilter) -> StorageResult<Vec<StoredImage>> {
        self.records
            .list_objects(filter)
            .await
            .map_err(StorageError::StorageReadFailure)
    }

    /// Open an image for streaming.
    ///
    /// The stream fetches chunk `i + 1` only after chunk `i` has been taken,
    /// so at most one chunk is resident per reader. It cannot be rewound; call
    /// `open` again to re-read. A missing or malformed chunk ends the stream
    /// with [`StorageError::StreamingReadFailure`] after the bytes already
    /// yielded.
    pub async fn open(&self, id: Uuid) -> StorageResult<(StoredImage, ChunkStream)> {
        let object = self.get(id).await?;
        let chunks = assemble(self.records.clone(), object.clone());
        Ok((object, chunks))
    }

    /// Read a whole image into memory and return it as a data URI.
    pub async fn fetch_encoded(&self, id: Uuid) -> StorageResult<EncodedImage> {
        let (object, mut chunks) = self.open(id).await?;
        let mut payload = Vec::with_capacity(object.length.max(0) as usize);
        while let Some(chunk) = chunks.next().await {
            payload.extend_from_slice(&chunk?);
        }

        let content_type = object.served_content_type().to_string();
        Ok(EncodedImage {
            data_uri: format!(
                "data:{};base64,{}",
                content_type,
                general_purpose::STANDARD.encode(&payload)
            ),
            filename: object.filename,
            size: object.length,
            content_type,
        })
    }

    /// Delete an image: chunks first, then the metadata record.
    ///
    /// Readers already streaming the image may fail on chunks they have not
    /// fetched yet.
    pub async fn delete(&self, id: Uuid) -> StorageResult<StoredImage> {
        let object = self.get(id).await?;

        let removed = self
            .records
            .delete_chunks(id)
            .await
            .map_err(StorageError::DeleteFailed)?;
        if removed != object.chunk_count as u64 {
            warn!(
                "image {} declared {} chunks but {} were removed",
                id, object.chunk_count, removed
            );
        }

        let deleted = self
            .records
            .delete_object(id)
            .await
            .map_err(StorageError::DeleteFailed)?;
        if !deleted {
            return Err(StorageError::NotFound(id));
        }

        info!("deleted image {} ({} chunks)", id, removed);
        Ok(object)
    }
}

struct WrittenChunks {
    length: u64,
    chunk_count: i64,
    md5: String,
}

/// Removes an upload's chunks unless the upload was committed.
///
/// Explicit failures call [`PendingUpload::discard`]. If the upload future is
/// dropped instead, `Drop` hands the removal to the runtime. Once the
/// metadata insert has been issued its outcome is unknown, so cleanup
/// retracts the record before removing the chunks.
struct PendingUpload {
    records: Arc<dyn RecordStore>,
    id: Uuid,
    armed: bool,
    committing: bool,
}

impl PendingUpload {
    fn new(records: Arc<dyn RecordStore>, id: Uuid) -> Self {
        Self {
            records,
            id,
            armed: true,
            committing: false,
        }
    }

    fn begin_commit(&mut self) {
        self.committing = true;
    }

    fn commit(mut self) {
        self.armed = false;
    }

    async fn discard(mut self) {
        abandon(self.records.as_ref(), self.id, self.committing).await;
        self.armed = false;
    }
}

impl Drop for PendingUpload {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let records = self.records.clone();
        let id = self.id;
        let committing = self.committing;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("upload of {} cancelled, discarding written chunks", id);
                handle.spawn(async move { abandon(records.as_ref(), id, committing).await });
            }
            Err(_) => warn!("upload of {} cancelled outside a runtime, chunks left behind", id),
        }
    }
}

/// Undo a partial upload. A record that may have landed goes first so that
/// readers see `NotFound` rather than a record with missing chunks.
async fn abandon(records: &dyn RecordStore, id: Uuid, committing: bool) {
    if committing {
        match records.delete_object(id).await {
            Ok(true) => warn!("retracted metadata of abandoned upload {}", id),
            Ok(false) => {}
            Err(err) => {
                warn!("failed to retract metadata of {}, keeping its chunks: {}", id, err);
                return;
            }
        }
    }
    match records.delete_chunks(id).await {
        Ok(removed) => debug!("removed {} partial chunks of {}", removed, id),
        Err(err) => warn!("failed to remove partial chunks of {}: {}", id, err),
    }
}

type ChunkCursor = (Arc<dyn RecordStore>, StoredImage, i64);

fn assemble(records: Arc<dyn RecordStore>, object: StoredImage) -> ChunkStream {
    stream::try_unfold((records, object, 0i64), next_chunk).boxed()
}

/// Fetch the chunk under the cursor and advance it.
async fn next_chunk(
    (records, object, index): ChunkCursor,
) -> StorageResult<Option<(Bytes, ChunkCursor)>> {
    let Some(expected) = object.chunk_len(index) else {
        return Ok(None);
    };
    let id = object.id;
    let failure = |reason: String| StorageError::StreamingReadFailure { id, index, reason };

    let data = records
        .get_chunk(id, index)
        .await
        .map_err(|err| failure(err.to_string()))?
        .ok_or_else(|| failure("chunk missing".into()))?;
    if data.len() != expected {
        return Err(failure(format!(
            "expected {} bytes, found {}",
            expected,
            data.len()
        )));
    }

    Ok(Some((data, (records, object, index + 1))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::image::DEFAULT_CHUNK_SIZE,
        services::{
            ingestion::DEFAULT_MAX_OBJECT_BYTES,
            record_store::{RecordResult, SqliteRecordStore},
        },
    };
    use async_trait::async_trait;
    use futures::channel::mpsc;
    use std::{
        sync::atomic::{AtomicBool, AtomicI64, Ordering},
        time::Duration,
    };

    /// Wraps the SQLite store, fails selected writes and can stall the
    /// acknowledgement of a metadata insert that has already landed.
    struct FlakyStore {
        inner: SqliteRecordStore,
        fail_chunk_at: Option<i64>,
        fail_commit: bool,
        commit_stall: Option<Duration>,
        commit_landed: AtomicBool,
        chunk_writes: AtomicI64,
    }

    impl FlakyStore {
        fn new(inner: SqliteRecordStore) -> Self {
            Self {
                inner,
                fail_chunk_at: None,
                fail_commit: false,
                commit_stall: None,
                commit_landed: AtomicBool::new(false),
                chunk_writes: AtomicI64::new(0),
            }
        }
    }

    #[async_trait]
    impl RecordStore for FlakyStore {
        async fn put_chunk(&self, chunk: &ImageChunk) -> RecordResult<()> {
            if self.fail_chunk_at == Some(chunk.chunk_index) {
                return Err(RecordStoreError::Unavailable("disk full".into()));
            }
            self.chunk_writes.fetch_add(1, Ordering::SeqCst);
            self.inner.put_chunk(chunk).await
        }

        async fn get_chunk(
            &self,
            object_id: Uuid,
            chunk_index: i64,
        ) -> RecordResult<Option<Bytes>> {
            self.inner.get_chunk(object_id, chunk_index).await
        }

        async fn count_chunks(&self, object_id: Uuid) -> RecordResult<i64> {
            self.inner.count_chunks(object_id).await
        }

        async fn delete_chunks(&self, object_id: Uuid) -> RecordResult<u64> {
            self.inner.delete_chunks(object_id).await
        }

        async fn put_object(&self, object: &StoredImage) -> RecordResult<()> {
            if self.fail_commit {
                return Err(RecordStoreError::Unavailable("commit rejected".into()));
            }
            self.inner.put_object(object).await?;
            self.commit_landed.store(true, Ordering::SeqCst);
            if let Some(stall) = self.commit_stall {
                tokio::time::sleep(stall).await;
            }
            Ok(())
        }

        async fn get_object(&self, id: Uuid) -> RecordResult<Option<StoredImage>> {
            self.inner.get_object(id).await
        }

        async fn list_objects(
            &self,
            filter: &ImageFilter,
        ) -> RecordResult<Vec<StoredImage>> {
            self.inner.list_objects(filter).await
        }

        async fn delete_object(&self, id: Uuid) -> RecordResult<bool> {
            self.inner.delete_object(id).await
        }

        async fn ping(&self) -> RecordResult<()> {
            self.inner.ping().await
        }
    }

    async fn setup(chunk_size: usize) -> (ImageStore, Arc<SqliteRecordStore>) {
        let records = Arc::new(SqliteRecordStore::in_memory().await);
        let store = ImageStore::new(records.clone(), IngestionGate::default(), chunk_size);
        (store, records)
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    /// Split `data` into frames of `frame` bytes, as a network body would.
    fn frames(data: &[u8], frame: usize) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
        let frames: Vec<io::Result<Bytes>> = data
            .chunks(frame.max(1))
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        stream::iter(frames)
    }

    async fn read_all(mut chunks: ChunkStream) -> StorageResult<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = chunks.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    async fn wait_for_chunks(records: &SqliteRecordStore, id: Uuid, expected: i64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while records.count_chunks(id).await.unwrap() != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("chunk count never reached expected value");
    }

    #[tokio::test]
    async fn round_trips_across_chunk_boundaries() {
        let (store, records) = setup(4).await;
        for len in [0usize, 1, 3, 4, 5, 8, 9, 37] {
            let data = payload(len);
            let image = store
                .store(frames(&data, 3), "photo.png", Some("image/png"), None)
                .await
                .unwrap();

            assert_eq!(image.length, len as i64);
            assert_eq!(image.chunk_count, len.div_ceil(4) as i64);
            assert_eq!(records.count_chunks(image.id).await.unwrap(), image.chunk_count);
            for index in 0..image.chunk_count {
                let chunk = records.get_chunk(image.id, index).await.unwrap().unwrap();
                assert_eq!(Some(chunk.len()), image.chunk_len(index));
            }

            let (meta, chunks) = store.open(image.id).await.unwrap();
            assert_eq!(meta, image);
            assert_eq!(read_all(chunks).await.unwrap(), data);
        }
    }

    #[tokio::test]
    async fn six_hundred_kib_upload_uses_three_chunks() {
        let (store, records) = setup(DEFAULT_CHUNK_SIZE).await;
        let data = payload(600 * 1024);
        let image = store
            .store(frames(&data, 64 * 1024), "house.jpg", Some("image/jpeg"), None)
            .await
            .unwrap();

        assert_eq!(image.chunk_count, 3);
        assert_eq!(image.chunk_size, 255 * 1024);
        assert_eq!(image.md5, format!("{:x}", md5::compute(&data)));
        let last = records.get_chunk(image.id, 2).await.unwrap().unwrap();
        assert_eq!(last.len(), 600 * 1024 - 2 * 255 * 1024);

        let (_, chunks) = store.open(image.id).await.unwrap();
        assert_eq!(read_all(chunks).await.unwrap(), data);
    }

    #[tokio::test]
    async fn upload_at_size_limit_round_trips() {
        let (store, _) = setup(DEFAULT_CHUNK_SIZE).await;
        let data = payload(DEFAULT_MAX_OBJECT_BYTES as usize);
        let image = store
            .store(frames(&data, 1024 * 1024), "big.webp", None, None)
            .await
            .unwrap();
        let (_, chunks) = store.open(image.id).await.unwrap();
        assert_eq!(read_all(chunks).await.unwrap(), data);
    }

    #[tokio::test]
    async fn filename_is_prefixed_and_type_recorded() {
        let (store, _) = setup(4).await;
        let image = store
            .store(frames(b"abc", 3), "porch.png", None, None)
            .await
            .unwrap();
        assert!(image.filename.ends_with("-porch.png"));
        assert_eq!(image.original_name, "porch.png");
        assert_eq!(image.content_type, "");
    }

    #[tokio::test]
    async fn rejected_media_type_writes_nothing() {
        let (store, _) = setup(4).await;
        let err = store
            .store(frames(b"%PDF", 4), "doc.pdf", Some("application/pdf"), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::Rejected(Rejection::UnsupportedMediaType { .. })
        ));
        assert_eq!(err.class(), ErrorClass::Validation);
        assert!(store.list(&ImageFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn oversized_stream_is_rejected_and_cleaned_up() {
        let records = Arc::new(SqliteRecordStore::in_memory().await);
        let store = ImageStore::new(records.clone(), IngestionGate::new(10), 4);
        let id = Uuid::new_v4();

        let err = store
            .store_as(id, frames(&payload(12), 4), "big.png", Some("image/png"), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::Rejected(Rejection::SizeExceeded { limit: 10 })
        ));
        assert_eq!(records.count_chunks(id).await.unwrap(), 0);
        assert!(!store.exists(id).await.unwrap());
    }

    #[tokio::test]
    async fn aborted_source_leaves_no_trace() {
        let flaky = Arc::new(FlakyStore::new(SqliteRecordStore::in_memory().await));
        let store = ImageStore::new(flaky.clone(), IngestionGate::default(), 4);
        let id = Uuid::new_v4();

        let source = stream::iter(vec![
            Ok(Bytes::from_static(b"abcd")),
            Err(io::Error::new(io::ErrorKind::ConnectionAborted, "client went away")),
        ]);
        let err = store
            .store_as(id, source, "photo.png", Some("image/png"), None)
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::UpstreamReadFailure(_)));
        assert_eq!(err.class(), ErrorClass::Upstream);
        assert_eq!(flaky.chunk_writes.load(Ordering::SeqCst), 1);
        assert!(matches!(store.get(id).await, Err(StorageError::NotFound(_))));
        assert_eq!(flaky.count_chunks(id).await.unwrap(), 0);
        assert_eq!(flaky.get_chunk(id, 0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn failed_chunk_write_surfaces_upload_failed() {
        let mut flaky = FlakyStore::new(SqliteRecordStore::in_memory().await);
        flaky.fail_chunk_at = Some(2);
        let flaky = Arc::new(flaky);
        let store = ImageStore::new(flaky.clone(), IngestionGate::default(), 4);
        let id = Uuid::new_v4();

        let err = store
            .store_as(id, frames(&payload(20), 5), "photo.png", None, None)
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::UploadFailed(_)));
        assert_eq!(err.class(), ErrorClass::Storage);
        assert_eq!(flaky.chunk_writes.load(Ordering::SeqCst), 2);
        assert_eq!(flaky.count_chunks(id).await.unwrap(), 0);
        assert!(!store.exists(id).await.unwrap());
    }

    #[tokio::test]
    async fn failed_commit_removes_all_chunks() {
        let mut flaky = FlakyStore::new(SqliteRecordStore::in_memory().await);
        flaky.fail_commit = true;
        let flaky = Arc::new(flaky);
        let store = ImageStore::new(flaky.clone(), IngestionGate::default(), 4);
        let id = Uuid::new_v4();

        let err = store
            .store_as(id, frames(&payload(9), 9), "photo.png", None, None)
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::UploadFailed(_)));
        assert_eq!(flaky.chunk_writes.load(Ordering::SeqCst), 3);
        assert_eq!(flaky.count_chunks(id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn in_progress_upload_is_invisible_until_commit() {
        let (store, records) = setup(4).await;
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded::<io::Result<Bytes>>();

        let uploader = store.clone();
        let upload = tokio::spawn(async move {
            uploader
                .store_as(id, rx, "photo.png", Some("image/png"), None)
                .await
        });

        tx.unbounded_send(Ok(Bytes::from_static(b"abcd"))).unwrap();
        wait_for_chunks(&records, id, 1).await;
        assert!(matches!(store.get(id).await, Err(StorageError::NotFound(_))));
        assert!(store.list(&ImageFilter::default()).await.unwrap().is_empty());

        tx.unbounded_send(Ok(Bytes::from_static(b"ef"))).unwrap();
        drop(tx);
        let image = upload.await.unwrap().unwrap();
        assert_eq!(image.chunk_count, 2);
        assert_eq!(store.get(id).await.unwrap(), image);
    }

    #[tokio::test]
    async fn cancelled_upload_discards_written_chunks() {
        let (store, records) = setup(4).await;
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded::<io::Result<Bytes>>();

        let uploader = store.clone();
        let upload = tokio::spawn(async move {
            uploader
                .store_as(id, rx, "photo.png", Some("image/png"), None)
                .await
        });

        tx.unbounded_send(Ok(Bytes::from_static(b"abcdefgh"))).unwrap();
        wait_for_chunks(&records, id, 2).await;

        upload.abort();
        assert!(upload.await.unwrap_err().is_cancelled());

        wait_for_chunks(&records, id, 0).await;
        assert!(matches!(store.get(id).await, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn cancellation_during_commit_retracts_the_record() {
        let mut flaky = FlakyStore::new(SqliteRecordStore::in_memory().await);
        flaky.commit_stall = Some(Duration::from_secs(30));
        let flaky = Arc::new(flaky);
        let store = ImageStore::new(flaky.clone(), IngestionGate::default(), 4);
        let id = Uuid::new_v4();

        let uploader = store.clone();
        let upload = tokio::spawn(async move {
            uploader
                .store_as(id, frames(&payload(12), 5), "photo.png", None, None)
                .await
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            while !flaky.commit_landed.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("metadata insert never landed");

        upload.abort();
        assert!(upload.await.unwrap_err().is_cancelled());

        tokio::time::timeout(Duration::from_secs(5), async {
            while flaky.get_object(id).await.unwrap().is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("committed record was never retracted");
        wait_for_chunks(&flaky.inner, id, 0).await;

        assert!(matches!(store.open(id).await, Err(StorageError::NotFound(_))));
        assert!(store.list(&ImageFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn declared_oversize_writes_nothing() {
        let flaky = Arc::new(FlakyStore::new(SqliteRecordStore::in_memory().await));
        let store = ImageStore::new(flaky.clone(), IngestionGate::new(10), 4);

        let err = store
            .store(frames(&payload(8), 4), "photo.png", Some("image/png"), Some(11))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::Rejected(Rejection::SizeExceeded { limit: 10 })
        ));
        assert_eq!(flaky.chunk_writes.load(Ordering::SeqCst), 0);

        assert!(store.admit_declared_size(10).is_ok());
        assert!(matches!(
            store.admit_declared_size(11),
            Err(StorageError::Rejected(Rejection::SizeExceeded { .. }))
        ));
    }

    #[tokio::test]
    async fn committed_image_is_never_overwritten() {
        let (store, records) = setup(4).await;
        let data = payload(6);
        let image = store.store(frames(&data, 6), "a.png", None, None).await.unwrap();

        let err = store
            .store_as(image.id, frames(&payload(9), 9), "b.png", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(id) if id == image.id));
        assert_eq!(records.count_chunks(image.id).await.unwrap(), 2);

        let (meta, chunks) = store.open(image.id).await.unwrap();
        assert_eq!(meta, image);
        assert_eq!(read_all(chunks).await.unwrap(), data);
    }

    #[tokio::test]
    async fn repeated_open_yields_identical_bytes() {
        let (store, _) = setup(4).await;
        let data = payload(18);
        let image = store.store(frames(&data, 7), "a.png", None, None).await.unwrap();

        let (_, first) = store.open(image.id).await.unwrap();
        let (_, second) = store.open(image.id).await.unwrap();
        let first = read_all(first).await.unwrap();
        let second = read_all(second).await.unwrap();
        assert_eq!(first, data);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn missing_chunk_truncates_stream_with_error() {
        let (store, records) = setup(4).await;
        let id = Uuid::new_v4();
        records
            .put_chunk(&ImageChunk::new(id, 0, Bytes::from_static(b"abcd")))
            .await
            .unwrap();
        records
            .put_object(&StoredImage {
                id,
                filename: "1-a.png".into(),
                original_name: "a.png".into(),
                content_type: String::new(),
                length: 10,
                chunk_size: 4,
                chunk_count: 3,
                md5: String::new(),
                uploaded_at: Utc::now(),
            })
            .await
            .unwrap();

        let (_, mut chunks) = store.open(id).await.unwrap();
        assert_eq!(chunks.next().await.unwrap().unwrap().len(), 4);

        let err = chunks.next().await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            StorageError::StreamingReadFailure { index: 1, .. }
        ));
        assert!(chunks.next().await.is_none());
    }

    #[tokio::test]
    async fn short_chunk_fails_the_stream() {
        let (store, records) = setup(4).await;
        let id = Uuid::new_v4();
        for (index, data) in [(0, &b"ab"[..]), (1, &b"cdef"[..])] {
            records
                .put_chunk(&ImageChunk::new(id, index, Bytes::copy_from_slice(data)))
                .await
                .unwrap();
        }
        records
            .put_object(&StoredImage {
                id,
                filename: "1-a.png".into(),
                original_name: "a.png".into(),
                content_type: String::new(),
                length: 8,
                chunk_size: 4,
                chunk_count: 2,
                md5: String::new(),
                uploaded_at: Utc::now(),
            })
            .await
            .unwrap();

        let (_, mut chunks) = store.open(id).await.unwrap();
        let err = chunks.next().await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            StorageError::StreamingReadFailure { index: 0, .. }
        ));
        assert!(chunks.next().await.is_none());
    }

    #[tokio::test]
    async fn delete_while_streaming_fails_the_reader() {
        let (store, _) = setup(4).await;
        let image = store
            .store(frames(&payload(12), 12), "a.png", None, None)
            .await
            .unwrap();

        let (_, mut chunks) = store.open(image.id).await.unwrap();
        assert!(chunks.next().await.unwrap().is_ok());

        store.delete(image.id).await.unwrap();
        let err = chunks.next().await.unwrap().unwrap_err();
        assert!(matches!(err, StorageError::StreamingReadFailure { .. }));
    }

    #[tokio::test]
    async fn delete_removes_record_and_chunks() {
        let (store, records) = setup(4).await;
        let image = store
            .store(frames(&payload(9), 2), "a.png", None, None)
            .await
            .unwrap();

        let deleted = store.delete(image.id).await.unwrap();
        assert_eq!(deleted.id, image.id);
        assert!(matches!(
            store.get(image.id).await,
            Err(StorageError::NotFound(_))
        ));
        assert_eq!(records.count_chunks(image.id).await.unwrap(), 0);
        for index in 0..image.chunk_count {
            assert_eq!(records.get_chunk(image.id, index).await.unwrap(), None);
        }

        let again = store.delete(image.id).await.unwrap_err();
        assert_eq!(again.class(), ErrorClass::NotFound);
    }

    #[tokio::test]
    async fn fetch_encoded_builds_data_uri() {
        let (store, _) = setup(2).await;
        let image = store
            .store(frames(b"hello", 2), "porch.png", None, None)
            .await
            .unwrap();

        let encoded = store.fetch_encoded(image.id).await.unwrap();
        assert_eq!(encoded.data_uri, "data:image/png;base64,aGVsbG8=");
        assert_eq!(encoded.size, 5);
        assert_eq!(encoded.content_type, "image/png");
        assert_eq!(encoded.filename, image.filename);

        let jpeg = store
            .store(frames(b"", 1), "empty.jpg", Some("image/jpeg"), None)
            .await
            .unwrap();
        let encoded = store.fetch_encoded(jpeg.id).await.unwrap();
        assert_eq!(encoded.data_uri, "data:image/jpeg;base64,");
        assert_eq!(encoded.size, 0);
    }

    #[tokio::test]
    async fn unknown_ids_report_not_found() {
        let (store, _) = setup(4).await;
        let id = Uuid::new_v4();
        assert!(matches!(store.open(id).await, Err(StorageError::NotFound(_))));
        assert!(matches!(
            store.fetch_encoded(id).await,
            Err(StorageError::NotFound(_))
        ));
        assert!(!store.exists(id).await.unwrap());
    }

    #[test]
    fn parse_id_rejects_malformed_identifiers() {
        assert!(matches!(
            ImageStore::parse_id("not-an-id"),
            Err(StorageError::InvalidIdentifier(_))
        ));
        assert!(matches!(
            ImageStore::parse_id("507f1f77bcf86cd799439011"),
            Err(StorageError::InvalidIdentifier(_))
        ));
        let id = Uuid::new_v4();
        assert_eq!(ImageStore::parse_id(&id.to_string()).unwrap(), id);
    }
}
