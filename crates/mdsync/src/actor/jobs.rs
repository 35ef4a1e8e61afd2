//! Maintenance jobs a document actor runs against its replica: the
//! markdown export and the image-reference garbage collector.

use std::collections::HashSet;
use tracing::{debug, info};

use crate::config::ActorConfig;
use crate::replica::Replica;
use crate::storage::{BlobStore, MetadataStore};
use crate::SyncResult;

pub const MARKDOWN_CONTENT_TYPE: &str = "text/markdown; charset=utf-8";

/// Outcome of one garbage-collection pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub referenced: usize,
    pub stored: usize,
    /// Ids of the image records deleted
    pub deleted: Vec<String>,
}

/// Render the replica to markdown and store it under the document's export key
pub async fn run_export(
    document_id: &str,
    replica: &Replica,
    config: &ActorConfig,
    blobs: &dyn BlobStore,
) -> SyncResult<String> {
    let key = config.export_key(document_id);
    let markdown = replica.render_markdown();
    let size = markdown.len();

    blobs
        .put(&key, markdown.into_bytes(), MARKDOWN_CONTENT_TYPE)
        .await?;

    debug!("Exported document '{}' to '{}' ({} bytes)", document_id, key, size);
    Ok(key)
}

/// Delete every image record of the document not in `referenced`, blobs first
pub async fn collect_garbage(
    document_id: &str,
    referenced: &HashSet<String>,
    config: &ActorConfig,
    metadata: &dyn MetadataStore,
    blobs: &dyn BlobStore,
) -> SyncResult<GcReport> {
    let stored = metadata.find_images_by_document(document_id).await?;
    let stale: Vec<_> = stored
        .iter()
        .filter(|record| !referenced.contains(&record.id))
        .collect();

    let mut report = GcReport {
        referenced: referenced.len(),
        stored: stored.len(),
        deleted: Vec::new(),
    };

    if stale.is_empty() {
        debug!(
            "No stale images for document '{}' ({} stored)",
            document_id,
            stored.len()
        );
        return Ok(report);
    }

    let keys: Vec<String> = stale.iter().map(|record| record.storage_key.clone()).collect();
    let batch_size = config
        .delete_batch_size
        .min(blobs.max_delete_batch())
        .max(1);
    for batch in keys.chunks(batch_size) {
        blobs.delete_many(batch).await?;
    }

    let ids: Vec<String> = stale.iter().map(|record| record.id.clone()).collect();
    metadata.delete_images(&ids).await?;

    info!(
        "Deleted {} stale images for document '{}'",
        ids.len(),
        document_id
    );
    report.deleted = ids;
    Ok(report)
}

/// Garbage-collect the images the replica no longer references
pub async fn run_gc(
    document_id: &str,
    replica: &Replica,
    config: &ActorConfig,
    metadata: &dyn MetadataStore,
    blobs: &dyn BlobStore,
) -> SyncResult<GcReport> {
    let referenced = crate::content::collect_referenced_image_ids(&replica.content_tree());
    collect_garbage(document_id, &referenced, config, metadata, blobs).await
}
