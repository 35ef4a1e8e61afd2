use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{BlobStore, DocumentStorage, EditorRecord, ImageRecord, MetadataStore, DEFAULT_MAX_DELETE_BATCH};
use crate::SyncResult;

/// Update logs and alarms held in memory
#[derive(Default)]
pub struct MemoryDocumentStorage {
    logs: DashMap<String, Vec<Vec<u8>>>,
    alarms: DashMap<String, DateTime<Utc>>,
}

impl MemoryDocumentStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of deltas logged for a document
    pub fn log_len(&self, document_id: &str) -> usize {
        self.logs.get(document_id).map_or(0, |log| log.len())
    }
}

#[async_trait]
impl DocumentStorage for MemoryDocumentStorage {
    async fn append_update(&self, document_id: &str, update: &[u8]) -> SyncResult<()> {
        self.logs
            .entry(document_id.to_string())
            .or_default()
            .push(update.to_vec());
        Ok(())
    }

    async fn load_updates(&self, document_id: &str) -> SyncResult<Vec<Vec<u8>>> {
        Ok(self
            .logs
            .get(document_id)
            .map(|log| log.clone())
            .unwrap_or_default())
    }

    async fn delete_all(&self, document_id: &str) -> SyncResult<()> {
        self.logs.remove(document_id);
        Ok(())
    }

    async fn set_alarm(&self, document_id: &str, at: DateTime<Utc>) -> SyncResult<()> {
        self.alarms.insert(document_id.to_string(), at);
        Ok(())
    }

    async fn alarm(&self, document_id: &str) -> SyncResult<Option<DateTime<Utc>>> {
        Ok(self.alarms.get(document_id).map(|at| *at))
    }

    async fn clear_alarm(&self, document_id: &str) -> SyncResult<()> {
        self.alarms.remove(document_id);
        Ok(())
    }

    async fn pending_alarms(&self) -> SyncResult<Vec<String>> {
        Ok(self.alarms.iter().map(|entry| entry.key().clone()).collect())
    }
}

/// Blobs held in memory, with call counters for inspection
pub struct MemoryBlobStore {
    blobs: DashMap<String, (Vec<u8>, String)>,
    max_delete_batch: usize,
    puts: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::with_max_delete_batch(DEFAULT_MAX_DELETE_BATCH)
    }

    pub fn with_max_delete_batch(max_delete_batch: usize) -> Self {
        Self {
            blobs: DashMap::new(),
            max_delete_batch: max_delete_batch.max(1),
            puts: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.blobs.contains_key(key)
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.blobs.get(key).map(|entry| entry.1.clone())
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Number of `put` calls so far
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Number of `delete_many` calls so far
    pub fn delete_call_count(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str) -> SyncResult<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.blobs
            .insert(key.to_string(), (data, content_type.to_string()));
        Ok(())
    }

    async fn get(&self, key: &str) -> SyncResult<Option<Vec<u8>>> {
        Ok(self.blobs.get(key).map(|entry| entry.0.clone()))
    }

    async fn delete_many(&self, keys: &[String]) -> SyncResult<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        for key in keys {
            self.blobs.remove(key);
        }
        Ok(())
    }

    fn max_delete_batch(&self) -> usize {
        self.max_delete_batch
    }
}

/// Editor and image rows held in memory
#[derive(Default)]
pub struct MemoryMetadataStore {
    editors: DashMap<String, EditorRecord>,
    images: DashMap<String, ImageRecord>,
    image_deletes: AtomicUsize,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an accepted upload
    pub fn insert_image(&self, record: ImageRecord) {
        self.images.insert(record.id.clone(), record);
    }

    pub fn image(&self, image_id: &str) -> Option<ImageRecord> {
        self.images.get(image_id).map(|entry| entry.value().clone())
    }

    /// Sorted ids of every stored image
    pub fn image_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.images.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Number of `delete_images` calls so far
    pub fn image_delete_count(&self) -> usize {
        self.image_deletes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn editor_exists(&self, editor_id: &str) -> SyncResult<bool> {
        Ok(self.editors.contains_key(editor_id))
    }

    async fn create_editor(&self, editor_id: &str) -> SyncResult<EditorRecord> {
        let record = self
            .editors
            .entry(editor_id.to_string())
            .or_insert_with(|| EditorRecord::new(editor_id))
            .clone();
        Ok(record)
    }

    async fn delete_editor(&self, editor_id: &str) -> SyncResult<bool> {
        Ok(self.editors.remove(editor_id).is_some())
    }

    async fn find_images_by_document(&self, editor_id: &str) -> SyncResult<Vec<ImageRecord>> {
        Ok(self
            .images
            .iter()
            .filter(|entry| entry.editor_id == editor_id)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn delete_images(&self, image_ids: &[String]) -> SyncResult<()> {
        self.image_deletes.fetch_add(1, Ordering::SeqCst);
        for id in image_ids {
            self.images.remove(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_preserves_append_order() {
        let storage = MemoryDocumentStorage::new();
        storage.append_update("doc", &[1]).await.unwrap();
        storage.append_update("doc", &[2]).await.unwrap();
        storage.append_update("other", &[9]).await.unwrap();

        assert_eq!(storage.load_updates("doc").await.unwrap(), vec![vec![1], vec![2]]);
        assert_eq!(storage.log_len("other"), 1);

        storage.delete_all("doc").await.unwrap();
        storage.delete_all("doc").await.unwrap();
        assert!(storage.load_updates("doc").await.unwrap().is_empty());
        assert_eq!(storage.log_len("other"), 1);
    }

    #[tokio::test]
    async fn test_alarm_roundtrip() {
        let storage = MemoryDocumentStorage::new();
        let at = Utc::now();

        storage.set_alarm("doc", at).await.unwrap();
        assert_eq!(storage.alarm("doc").await.unwrap(), Some(at));
        assert_eq!(storage.pending_alarms().await.unwrap(), vec!["doc".to_string()]);

        storage.clear_alarm("doc").await.unwrap();
        assert_eq!(storage.alarm("doc").await.unwrap(), None);
        assert!(storage.pending_alarms().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_images_scoped_by_document() {
        let metadata = MemoryMetadataStore::new();
        metadata.insert_image(ImageRecord::new("a", "img-1", "x.png", "image/png", 1));
        metadata.insert_image(ImageRecord::new("b", "img-2", "y.png", "image/png", 1));

        let images = metadata.find_images_by_document("a").await.unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].id, "img-1");

        metadata.delete_images(&["img-1".to_string()]).await.unwrap();
        assert_eq!(metadata.image_ids(), vec!["img-2".to_string()]);
    }
}
