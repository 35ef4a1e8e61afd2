use dashmap::DashMap;
use std::collections::HashSet;
use tracing::{debug, error, info};

use crate::actor::{jobs, DocumentActor, DocumentHandle, DocumentStatus, GcReport, Services};
use crate::config::ActorConfig;
use crate::session::{Channel, SessionId};
use crate::{SyncError, SyncResult};

/// Addressing layer: at most one live actor per document id.
///
/// Actors are spawned on first use and respawned when their task has
/// ended. The registry itself holds no document state.
pub struct DocumentRegistry {
    actors: DashMap<String, DocumentHandle>,
    services: Services,
    config: ActorConfig,
}

impl DocumentRegistry {
    /// Create a registry with the default actor configuration
    pub fn new(services: Services) -> Self {
        Self::with_config(services, ActorConfig::default())
    }

    pub fn with_config(services: Services, config: ActorConfig) -> Self {
        Self {
            actors: DashMap::new(),
            services,
            config,
        }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn config(&self) -> &ActorConfig {
        &self.config
    }

    /// Handle of the actor for `document_id`, spawning it if needed
    pub fn handle(&self, document_id: &str) -> DocumentHandle {
        let mut entry = self
            .actors
            .entry(document_id.to_string())
            .or_insert_with(|| self.spawn(document_id));

        if entry.is_closed() {
            debug!("Respawning stopped actor for document '{}'", document_id);
            *entry = self.spawn(document_id);
        }
        entry.clone()
    }

    /// Handle of a live actor, without spawning one
    pub fn get(&self, document_id: &str) -> Option<DocumentHandle> {
        self.actors
            .get(document_id)
            .map(|entry| entry.value().clone())
            .filter(|handle| !handle.is_closed())
    }

    fn spawn(&self, document_id: &str) -> DocumentHandle {
        info!("Spawning actor for document '{}'", document_id);
        DocumentActor::spawn(document_id, self.config.clone(), self.services.clone())
    }

    /// Attach a channel to the actor of the document it was opened for
    pub async fn attach(&self, channel: Channel) -> SyncResult<(DocumentHandle, SessionId)> {
        let handle = self.handle(channel.document_id());
        match handle.attach(channel.clone()).await {
            Err(SyncError::ActorStopped { .. }) => {
                let handle = self.handle(channel.document_id());
                let session = handle.attach(channel).await?;
                Ok((handle, session))
            }
            result => Ok((handle, result?)),
        }
    }

    /// Full replica state of a document as a single update
    pub async fn snapshot(&self, document_id: &str) -> SyncResult<Vec<u8>> {
        match self.handle(document_id).snapshot().await {
            Err(SyncError::ActorStopped { .. }) => self.handle(document_id).snapshot().await,
            result => result,
        }
    }

    /// Close every session of a document and wipe its state
    pub async fn reset(&self, document_id: &str) -> SyncResult<()> {
        match self.handle(document_id).reset().await {
            Err(SyncError::ActorStopped { .. }) => self.handle(document_id).reset().await,
            result => result,
        }
    }

    /// Run the export and image cleanup of a document now
    pub async fn flush(&self, document_id: &str) -> SyncResult<()> {
        self.handle(document_id).flush().await
    }

    /// Status of a live actor
    pub async fn status(&self, document_id: &str) -> Option<DocumentStatus> {
        self.get(document_id)?.status().await.ok()
    }

    /// Reset a deleted document and drop everything it left in storage:
    /// its images and its exported markdown
    pub async fn purge(&self, document_id: &str) -> SyncResult<GcReport> {
        self.reset(document_id).await?;

        let blobs = self.services.blobs.as_ref();
        let report = jobs::collect_garbage(
            document_id,
            &HashSet::new(),
            &self.config,
            self.services.metadata.as_ref(),
            blobs,
        )
        .await?;
        blobs
            .delete_many(&[self.config.export_key(document_id)])
            .await?;

        info!(
            "Purged document '{}' ({} images removed)",
            document_id,
            report.deleted.len()
        );
        Ok(report)
    }

    /// Wake every document with a stored export alarm.
    ///
    /// Call once at startup so debounced exports interrupted by a restart
    /// still run.
    pub async fn resume_alarms(&self) -> SyncResult<usize> {
        let document_ids = self.services.storage.pending_alarms().await?;

        for document_id in &document_ids {
            if let Err(e) = self.handle(document_id).wake().await {
                error!("Failed to resume alarm of document '{}': {}", document_id, e);
            }
        }

        if !document_ids.is_empty() {
            info!("Resumed {} pending export alarms", document_ids.len());
        }
        Ok(document_ids.len())
    }

    /// Stop actors with no sessions and no pending work.
    ///
    /// Returns the number of actors stopped.
    pub async fn evict_idle(&self) -> usize {
        let handles: Vec<DocumentHandle> = self
            .actors
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut evicted = 0;
        for handle in handles {
            let retired = handle.is_closed() || matches!(handle.retire().await, Ok(true));
            if !retired {
                continue;
            }
            let removed = self
                .actors
                .remove_if(handle.document_id(), |_, current| current.same_actor(&handle));
            if removed.is_some() {
                debug!("Evicted idle actor for document '{}'", handle.document_id());
                evicted += 1;
            }
        }
        evicted
    }

    /// List the ids of every document with an actor
    pub fn list_documents(&self) -> Vec<String> {
        self.actors
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Get the number of documents with an actor
    pub fn document_count(&self) -> usize {
        self.actors.len()
    }
}
