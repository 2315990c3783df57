use anyhow::{anyhow, Result};
use bytes::Bytes;
use futures::Stream;
use sqlx::Row;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::app::thumbnail;
use crate::domain::media::{MediaRecord, OrderType};
use crate::infra::{blob::BlobStore, db::Db};

type LockMap = Arc<std::sync::Mutex<HashMap<i64, Arc<Mutex<()>>>>>;

/// Serializes mutating operations per media id, held only for the
/// blobs-then-metadata sequence. Entries are pruned when the last
/// holder releases its guard, so the map does not grow with id churn.
#[derive(Clone, Default)]
pub struct IdLocks {
    inner: LockMap,
}

impl IdLocks {
    pub async fn acquire(&self, id: i64) -> IdLockGuard {
        let lock = {
            let mut map = lock_map(&self.inner);
            map.entry(id).or_default().clone()
        };
        let guard = lock.lock_owned().await;
        IdLockGuard {
            guard: Some(guard),
            id,
            map: self.inner.clone(),
        }
    }
}

pub struct IdLockGuard {
    guard: Option<OwnedMutexGuard<()>>,
    id: i64,
    map: LockMap,
}

impl Drop for IdLockGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut map = lock_map(&self.map);
        // Strong count 1 means only the map itself still refers to the
        // lock; any waiter holds its own clone until it acquires.
        if map
            .get(&self.id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            map.remove(&self.id);
        }
    }
}

fn lock_map(map: &LockMap) -> std::sync::MutexGuard<'_, HashMap<i64, Arc<Mutex<()>>>> {
    map.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Upload failures split into the client's fault and ours.
#[derive(Debug)]
pub enum UploadError {
    /// The payload could not be decoded as the declared content type.
    Unsupported,
    Storage(anyhow::Error),
}

impl From<anyhow::Error> for UploadError {
    fn from(err: anyhow::Error) -> Self {
        Self::Storage(err)
    }
}

/// Stored blob names are derived from one store-assigned uuid so the primary
/// and thumbnail names are always recoverable from each other.
struct StoredNames {
    primary: String,
    thumb: String,
}

impl StoredNames {
    fn generate() -> Self {
        let id = Uuid::new_v4().simple().to_string();
        Self {
            thumb: format!("{id}.thumb"),
            primary: id,
        }
    }
}

#[derive(Clone)]
pub struct MediaService {
    db: Db,
    blobs: BlobStore,
    locks: IdLocks,
}

impl MediaService {
    pub fn new(db: Db, blobs: BlobStore, locks: IdLocks) -> Self {
        Self { db, blobs, locks }
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<MediaRecord>> {
        let row = sqlx::query(
            "SELECT id, stored_name, original_name, thumb_name, content_type, \
                    encrypted_size, logical_size, created_at \
             FROM media WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;

        row.map(row_to_record).transpose()
    }

    pub async fn get_all(&self) -> Result<Vec<MediaRecord>> {
        let rows = sqlx::query(
            "SELECT id, stored_name, original_name, thumb_name, content_type, \
                    encrypted_size, logical_size, created_at \
             FROM media ORDER BY id ASC",
        )
        .fetch_all(self.db.pool())
        .await?;

        rows.into_iter().map(row_to_record).collect()
    }

    /// Page of records ordered by creation time. Identical timestamps fall
    /// back to insertion order (id ascending) so pagination stays stable.
    pub async fn get_page(
        &self,
        limit: i64,
        offset: i64,
        order: OrderType,
    ) -> Result<Vec<MediaRecord>> {
        let query = match order {
            OrderType::RecentLast => {
                "SELECT id, stored_name, original_name, thumb_name, content_type, \
                        encrypted_size, logical_size, created_at \
                 FROM media ORDER BY created_at ASC, id ASC LIMIT ? OFFSET ?"
            }
            OrderType::RecentFirst => {
                "SELECT id, stored_name, original_name, thumb_name, content_type, \
                        encrypted_size, logical_size, created_at \
                 FROM media ORDER BY created_at DESC, id ASC LIMIT ? OFFSET ?"
            }
        };

        let rows = sqlx::query(query)
            .bind(limit)
            .bind(offset)
            .fetch_all(self.db.pool())
            .await?;

        rows.into_iter().map(row_to_record).collect()
    }

    /// Buffered upload path for images: derive the preview first so an
    /// undecodable payload aborts before anything touches the blob store.
    pub async fn upload_image(
        &self,
        original_name: &str,
        content_type: &str,
        bytes: Bytes,
        declared_size: i64,
        thumb_max_dim: u32,
    ) -> Result<MediaRecord, UploadError> {
        let thumb = thumbnail::derive_image(&bytes, content_type, thumb_max_dim)
            .map_err(|_| UploadError::Unsupported)?;

        let names = StoredNames::generate();
        let encrypted_size = self.blobs.write(&names.primary, bytes).await?;

        if let Err(err) = self.blobs.write(&names.thumb, Bytes::from(thumb)).await {
            self.cleanup(&names, "image thumbnail write failed").await;
            return Err(UploadError::Storage(err));
        }

        self.commit(names, original_name, content_type, encrypted_size, declared_size)
            .await
    }

    /// Streaming upload path for videos. The payload goes straight into the
    /// encrypted store; the preview frame is then derived from a fresh
    /// decrypting read, so the plaintext is never buffered or written out.
    pub async fn upload_video<S>(
        &self,
        original_name: &str,
        content_type: &str,
        source: S,
        declared_size: i64,
        ffmpeg_bin: &str,
        thumb_max_dim: u32,
    ) -> Result<MediaRecord, UploadError>
    where
        S: Stream<Item = io::Result<Bytes>> + Unpin,
    {
        let names = StoredNames::generate();
        let encrypted_size = self.blobs.write_stream(&names.primary, source).await?;

        let plaintext = match self.blobs.open_read(&names.primary).await {
            Ok(stream) => stream,
            Err(err) => {
                self.cleanup(&names, "reopen of stored video failed").await;
                return Err(UploadError::Storage(err.into()));
            }
        };

        let thumb = match thumbnail::derive_video_frame(ffmpeg_bin, plaintext, thumb_max_dim).await
        {
            Ok(thumb) => thumb,
            Err(err) => {
                tracing::debug!(error = ?err, "video frame extraction failed");
                self.cleanup(&names, "video payload rejected").await;
                return Err(UploadError::Unsupported);
            }
        };

        if let Err(err) = self.blobs.write(&names.thumb, Bytes::from(thumb)).await {
            self.cleanup(&names, "video thumbnail write failed").await;
            return Err(UploadError::Storage(err));
        }

        self.commit(names, original_name, content_type, encrypted_size, declared_size)
            .await
    }

    /// Insert the metadata row once both blobs are durable. A failed insert
    /// removes the blobs again so no orphan survives the attempt.
    async fn commit(
        &self,
        names: StoredNames,
        original_name: &str,
        content_type: &str,
        encrypted_size: u64,
        declared_size: i64,
    ) -> Result<MediaRecord, UploadError> {
        let created_at = OffsetDateTime::now_utc();
        let result = sqlx::query(
            "INSERT INTO media (stored_name, original_name, thumb_name, content_type, \
                                encrypted_size, logical_size, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             RETURNING id",
        )
        .bind(&names.primary)
        .bind(original_name)
        .bind(&names.thumb)
        .bind(content_type)
        .bind(encrypted_size as i64)
        .bind(declared_size)
        .bind(created_at.unix_timestamp_nanos() as i64)
        .fetch_one(self.db.pool())
        .await;

        let row = match result {
            Ok(row) => row,
            Err(err) => {
                self.cleanup(&names, "metadata insert failed").await;
                return Err(UploadError::Storage(err.into()));
            }
        };

        Ok(MediaRecord {
            id: row.get("id"),
            stored_name: names.primary,
            original_name: original_name.to_string(),
            thumb_name: names.thumb,
            content_type: content_type.to_string(),
            encrypted_size: encrypted_size as i64,
            logical_size: declared_size,
            created_at,
        })
    }

    async fn cleanup(&self, names: &StoredNames, reason: &str) {
        tracing::warn!(stored_name = %names.primary, reason, "cleaning up aborted upload");
        if let Err(err) = self.blobs.delete(&names.primary).await {
            tracing::error!(error = ?err, stored_name = %names.primary, "orphan blob left behind");
        }
        if let Err(err) = self.blobs.delete(&names.thumb).await {
            tracing::error!(error = ?err, stored_name = %names.thumb, "orphan blob left behind");
        }
    }

    /// Fail-closed delete: both blobs must be gone before the metadata row
    /// is removed, so a failure leaves the record intact and retryable.
    pub async fn delete(&self, id: i64) -> Result<bool> {
        let _guard = self.locks.acquire(id).await;

        let record = match self.get_by_id(id).await? {
            Some(record) => record,
            None => return Ok(false),
        };

        self.blobs.delete(&record.stored_name).await?;
        self.blobs.delete(&record.thumb_name).await?;

        let result = sqlx::query("DELETE FROM media WHERE id = ?")
            .bind(id)
            .execute(self.db.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

fn row_to_record(row: sqlx::sqlite::SqliteRow) -> Result<MediaRecord> {
    let created_at =
        OffsetDateTime::from_unix_timestamp_nanos(row.get::<i64, _>("created_at") as i128)
            .map_err(|err| anyhow!("corrupt created_at: {}", err))?;
    Ok(MediaRecord {
        id: row.get("id"),
        stored_name: row.get("stored_name"),
        original_name: row.get("original_name"),
        thumb_name: row.get("thumb_name"),
        content_type: row.get("content_type"),
        encrypted_size: row.get("encrypted_size"),
        logical_size: row.get("logical_size"),
        created_at,
    })
}
