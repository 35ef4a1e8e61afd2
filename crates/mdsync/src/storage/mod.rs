//! Storage seams consumed by document actors.
//!
//! - [`DocumentStorage`]: the per-document Update Log plus the durable
//!   debounce alarm.
//! - [`BlobStore`]: uploaded images and exported markdown, by string key.
//! - [`MetadataStore`]: editor and image rows.
//!
//! In-memory implementations back tests and single-process setups; the
//! `persistence` feature adds filesystem backends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::SyncResult;

pub mod memory;

#[cfg(feature = "persistence")]
pub mod fs;

pub use memory::{MemoryBlobStore, MemoryDocumentStorage, MemoryMetadataStore};

#[cfg(feature = "persistence")]
pub use fs::{FileStorage, FsBlobStore};

/// Default upper bound on keys per bulk blob delete
pub const DEFAULT_MAX_DELETE_BATCH: usize = 1000;

/// Append-only update log and durable alarm for each document
#[async_trait]
pub trait DocumentStorage: Send + Sync {
    /// Append one delta to the document's log
    async fn append_update(&self, document_id: &str, update: &[u8]) -> SyncResult<()>;

    /// Every delta of the document's log, in append order
    async fn load_updates(&self, document_id: &str) -> SyncResult<Vec<Vec<u8>>>;

    /// Delete the document's whole log; succeeds when there is none
    async fn delete_all(&self, document_id: &str) -> SyncResult<()>;

    /// Record the time the document's debounced export is due
    async fn set_alarm(&self, document_id: &str, at: DateTime<Utc>) -> SyncResult<()>;

    async fn alarm(&self, document_id: &str) -> SyncResult<Option<DateTime<Utc>>>;

    async fn clear_alarm(&self, document_id: &str) -> SyncResult<()>;

    /// Ids of every document with a stored alarm
    async fn pending_alarms(&self) -> SyncResult<Vec<String>>;
}

/// Key-addressed blob storage
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str) -> SyncResult<()>;

    async fn get(&self, key: &str) -> SyncResult<Option<Vec<u8>>>;

    /// Delete a batch of keys; missing keys are ignored.
    ///
    /// Callers never pass more than [`BlobStore::max_delete_batch`] keys.
    async fn delete_many(&self, keys: &[String]) -> SyncResult<()>;

    fn max_delete_batch(&self) -> usize {
        DEFAULT_MAX_DELETE_BATCH
    }
}

/// Relational rows for editors and their images
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn editor_exists(&self, editor_id: &str) -> SyncResult<bool>;

    async fn create_editor(&self, editor_id: &str) -> SyncResult<EditorRecord>;

    /// Returns false when no such editor existed
    async fn delete_editor(&self, editor_id: &str) -> SyncResult<bool>;

    async fn find_images_by_document(&self, editor_id: &str) -> SyncResult<Vec<ImageRecord>>;

    async fn delete_images(&self, image_ids: &[String]) -> SyncResult<()>;
}

/// An editor (document) row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditorRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

impl EditorRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at: Utc::now(),
        }
    }
}

/// An uploaded image row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: String,
    pub editor_id: String,
    pub storage_key: String,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

impl ImageRecord {
    /// Build a record whose blob lives at `images/{editor_id}/{id}.{ext}`
    pub fn new(
        editor_id: impl Into<String>,
        id: impl Into<String>,
        filename: impl Into<String>,
        mime_type: impl Into<String>,
        size: u64,
    ) -> Self {
        let editor_id = editor_id.into();
        let id = id.into();
        let filename = filename.into();
        let mime_type = mime_type.into();
        let storage_key = image_storage_key(&editor_id, &id, image_extension(&filename, &mime_type));

        Self {
            id,
            editor_id,
            storage_key,
            filename,
            mime_type,
            size,
            created_at: Utc::now(),
        }
    }
}

/// Blob key of an uploaded image
pub fn image_storage_key(editor_id: &str, image_id: &str, extension: &str) -> String {
    format!("images/{}/{}.{}", editor_id, image_id, extension)
}

fn image_extension<'a>(filename: &'a str, mime_type: &'a str) -> &'a str {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty())
        .or_else(|| mime_type.strip_prefix("image/"))
        .unwrap_or("bin")
}
