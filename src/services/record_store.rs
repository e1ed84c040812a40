//! Persistent record store for image metadata and chunks.
//!
//! The store only promises atomicity of a single record write or delete.
//! Nothing here spans records in a transaction; `ImageStore` gets its
//! visibility guarantees from the order in which it issues writes.

use crate::models::image::{ImageChunk, ImageFilter, StoredImage};
use async_trait::async_trait;
use bytes::Bytes;
use sqlx::{
    QueryBuilder, SqlitePool,
    sqlite::{Sqlite, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::{str::FromStr, time::Duration};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

const INIT_SQL: &str = include_str!("../../migrations/0001_init.sql");

#[derive(Debug, Error)]
pub enum RecordStoreError {
    #[error("record store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type RecordResult<T> = Result<T, RecordStoreError>;

/// Record-level CRUD over the two collections the image store needs.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a single chunk. Fails if `(object_id, chunk_index)` already exists.
    async fn put_chunk(&self, chunk: &ImageChunk) -> RecordResult<()>;

    async fn get_chunk(&self, object_id: Uuid, chunk_index: i64) -> RecordResult<Option<Bytes>>;

    async fn count_chunks(&self, object_id: Uuid) -> RecordResult<i64>;

    /// Remove every chunk owned by `object_id`, returning how many were removed.
    async fn delete_chunks(&self, object_id: Uuid) -> RecordResult<u64>;

    async fn put_object(&self, object: &StoredImage) -> RecordResult<()>;

    async fn get_object(&self, id: Uuid) -> RecordResult<Option<StoredImage>>;

    async fn list_objects(&self, filter: &ImageFilter) -> RecordResult<Vec<StoredImage>>;

    /// Remove a metadata record. Returns false when nothing was removed.
    async fn delete_object(&self, id: Uuid) -> RecordResult<bool>;

    /// Cheap connectivity check for readiness probes.
    async fn ping(&self) -> RecordResult<()>;
}

/// SQLite-backed [`RecordStore`].
#[derive(Clone, Debug)]
pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open a pool against `database_url`, creating the database file if needed.
    pub async fn connect(database_url: &str, max_connections: u32) -> RecordResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;
        info!("connected to record store at {}", database_url);
        Ok(Self::new(pool))
    }

    /// Single-connection in-memory store. The database lives as long as the
    /// connection, so the pool never recycles it.
    #[cfg(test)]
    pub async fn in_memory() -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .expect("open in-memory sqlite");
        let store = Self::new(pool);
        store.migrate().await.expect("apply schema");
        store
    }

    /// Apply the embedded schema. Every statement is idempotent.
    pub async fn migrate(&self) -> RecordResult<()> {
        let statements = INIT_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        info!("running {} migration statements", statements.len());
        for stmt in statements {
            debug!("executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn put_chunk(&self, chunk: &ImageChunk) -> RecordResult<()> {
        sqlx::query("INSERT INTO image_chunks (object_id, chunk_index, data) VALUES (?, ?, ?)")
            .bind(chunk.object_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.data)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_chunk(&self, object_id: Uuid, chunk_index: i64) -> RecordResult<Option<Bytes>> {
        let data = sqlx::query_scalar::<_, Vec<u8>>(
            "SELECT data FROM image_chunks WHERE object_id = ? AND chunk_index = ?",
        )
        .bind(object_id)
        .bind(chunk_index)
        .fetch_optional(&self.pool)
        .await?;
        Ok(data.map(Bytes::from))
    }

    async fn count_chunks(&self, object_id: Uuid) -> RecordResult<i64> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM image_chunks WHERE object_id = ?")
                .bind(object_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn delete_chunks(&self, object_id: Uuid) -> RecordResult<u64> {
        let result = sqlx::query("DELETE FROM image_chunks WHERE object_id = ?")
            .bind(object_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn put_object(&self, object: &StoredImage) -> RecordResult<()> {
        sqlx::query(
            "INSERT INTO image_objects (
                id, filename, original_name, content_type, length,
                chunk_size, chunk_count, md5, uploaded_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(object.id)
        .bind(&object.filename)
        .bind(&object.original_name)
        .bind(&object.content_type)
        .bind(object.length)
        .bind(object.chunk_size)
        .bind(object.chunk_count)
        .bind(&object.md5)
        .bind(object.uploaded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_object(&self, id: Uuid) -> RecordResult<Option<StoredImage>> {
        let object = sqlx::query_as::<_, StoredImage>(
            "SELECT id, filename, original_name, content_type, length,
                    chunk_size, chunk_count, md5, uploaded_at
             FROM image_objects WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(object)
    }

    async fn list_objects(&self, filter: &ImageFilter) -> RecordResult<Vec<StoredImage>> {
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT id, filename, original_name, content_type, length, \
             chunk_size, chunk_count, md5, uploaded_at \
             FROM image_objects WHERE 1 = 1",
        );

        if let Some(prefix) = &filter.filename_prefix {
            builder.push(" AND filename LIKE ");
            builder.push_bind(format!("{}%", escape_like(prefix)));
            builder.push(" ESCAPE '\\'");
        }

        builder.push(" ORDER BY uploaded_at ASC, id ASC");

        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ");
            builder.push_bind(limit as i64);
        }

        let rows: Vec<StoredImage> = builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows)
    }

    async fn delete_object(&self, id: Uuid) -> RecordResult<bool> {
        let result = sqlx::query("DELETE FROM image_objects WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn ping(&self) -> RecordResult<()> {
        match sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await?
        {
            1 => Ok(()),
            other => Err(RecordStoreError::Unavailable(format!(
                "unexpected probe result: {}",
                other
            ))),
        }
    }
}

/// Escape `%`, `_` and the escape character itself for a LIKE pattern.
fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
