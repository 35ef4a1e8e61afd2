//! The per-document actor.
//!
//! One task per document id owns the [`Replica`], the [`SessionRegistry`]
//! and the export schedule. Every operation on the document arrives as a
//! command on the actor's mailbox and is processed to completion before the
//! next one, so the replica and the session bookkeeping need no locks.
//! Different documents run on different tasks and never share state.

use chrono::Utc;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::config::ActorConfig;
use crate::protocol::{Message, SyncMessage};
use crate::replica::{AwarenessChange, Replica};
use crate::session::{
    Channel, SessionId, SessionRegistry, CLOSE_NORMAL, CLOSE_PERSISTENCE_FAILURE,
};
use crate::storage::{BlobStore, DocumentStorage, MetadataStore};
use crate::{SyncError, SyncResult};

pub mod jobs;

pub use jobs::GcReport;

const APPEND_RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Shared collaborators handed to every actor
#[derive(Clone)]
pub struct Services {
    pub storage: Arc<dyn DocumentStorage>,
    pub blobs: Arc<dyn BlobStore>,
    pub metadata: Arc<dyn MetadataStore>,
}

impl Services {
    pub fn new(
        storage: Arc<dyn DocumentStorage>,
        blobs: Arc<dyn BlobStore>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        Self {
            storage,
            blobs,
            metadata,
        }
    }
}

/// Point-in-time view of an actor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentStatus {
    pub document_id: String,
    /// Whether a replica is in memory
    pub loaded: bool,
    pub sessions: usize,
    pub awareness_clients: usize,
    pub export_pending: bool,
    /// Deltas applied but not yet in the update log
    pub pending_appends: usize,
}

enum Command {
    Attach {
        channel: Channel,
        reply: oneshot::Sender<SyncResult<SessionId>>,
    },
    Receive {
        session: SessionId,
        data: Vec<u8>,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    Detach {
        session: SessionId,
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<SyncResult<Vec<u8>>>,
    },
    Reset {
        reply: oneshot::Sender<SyncResult<()>>,
    },
    Flush {
        reply: oneshot::Sender<SyncResult<()>>,
    },
    Wake,
    Status {
        reply: oneshot::Sender<DocumentStatus>,
    },
    Retire {
        reply: oneshot::Sender<bool>,
    },
}

/// Address of a running document actor
#[derive(Debug, Clone)]
pub struct DocumentHandle {
    document_id: Arc<str>,
    tx: mpsc::Sender<Command>,
}

impl DocumentHandle {
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Whether the actor behind this handle has stopped
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub(crate) fn same_actor(&self, other: &DocumentHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }

    /// Register a channel; it starts receiving sync traffic right away
    pub async fn attach(&self, channel: Channel) -> SyncResult<SessionId> {
        self.request(|reply| Command::Attach { channel, reply })
            .await?
    }

    /// Hand a binary frame received on a session's channel to the actor
    pub async fn receive(&self, session: SessionId, data: Vec<u8>) -> SyncResult<()> {
        self.request(|reply| Command::Receive {
            session,
            data,
            reply,
        })
        .await?
    }

    pub async fn detach(&self, session: SessionId) -> SyncResult<()> {
        self.request(|reply| Command::Detach { session, reply })
            .await
    }

    /// Full replica state as a single update
    pub async fn snapshot(&self) -> SyncResult<Vec<u8>> {
        self.request(|reply| Command::Snapshot { reply }).await?
    }

    /// Close every session and wipe all state, log and alarm included
    pub async fn reset(&self) -> SyncResult<()> {
        self.request(|reply| Command::Reset { reply }).await?
    }

    /// Cancel the pending export and run export and cleanup now
    pub async fn flush(&self) -> SyncResult<()> {
        self.request(|reply| Command::Flush { reply }).await?
    }

    /// Load the document if cold, re-arming any stored alarm
    pub async fn wake(&self) -> SyncResult<()> {
        self.tx
            .send(Command::Wake)
            .await
            .map_err(|_| self.stopped())
    }

    pub async fn status(&self) -> SyncResult<DocumentStatus> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Stop the actor if it has no sessions and no pending work
    pub(crate) async fn retire(&self) -> SyncResult<bool> {
        self.request(|reply| Command::Retire { reply }).await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> SyncResult<T> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| self.stopped())?;
        response.await.map_err(|_| self.stopped())
    }

    fn stopped(&self) -> SyncError {
        SyncError::ActorStopped {
            id: self.document_id.to_string(),
        }
    }
}

struct PendingAppend {
    origin: Option<SessionId>,
    delta: Vec<u8>,
}

/// State owned by one document's task
pub struct DocumentActor {
    document_id: String,
    config: ActorConfig,
    services: Services,
    replica: Option<Replica>,
    sessions: SessionRegistry,
    active_clients: HashSet<u64>,
    export_deadline: Option<Instant>,
    pending_appends: VecDeque<PendingAppend>,
    commands: mpsc::Receiver<Command>,
}

impl DocumentActor {
    /// Spawn the actor for `document_id` on the current runtime
    pub fn spawn(
        document_id: impl Into<String>,
        config: ActorConfig,
        services: Services,
    ) -> DocumentHandle {
        let document_id = document_id.into();
        let (tx, commands) = mpsc::channel(config.mailbox_capacity.max(1));

        let actor = Self {
            document_id: document_id.clone(),
            config,
            services,
            replica: None,
            sessions: SessionRegistry::new(),
            active_clients: HashSet::new(),
            export_deadline: None,
            pending_appends: VecDeque::new(),
            commands,
        };
        tokio::spawn(actor.run());

        DocumentHandle {
            document_id: document_id.into(),
            tx,
        }
    }

    async fn run(mut self) {
        debug!("Document actor started for '{}'", self.document_id);

        loop {
            let command = match self.export_deadline {
                Some(deadline) => tokio::select! {
                    biased;
                    _ = sleep_until(deadline) => {
                        self.on_debounce_fire().await;
                        continue;
                    }
                    command = self.commands.recv() => command,
                },
                None => self.commands.recv().await,
            };

            let Some(command) = command else {
                break;
            };
            if !self.handle(command).await {
                break;
            }
        }

        if self.export_deadline.is_some() {
            info!(
                "Document actor for '{}' stopped with an export pending; the stored alarm will resume it",
                self.document_id
            );
        }
        debug!("Document actor stopped for '{}'", self.document_id);
    }

    /// Returns false when the actor should stop
    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Attach { channel, reply } => {
                let _ = reply.send(self.attach(channel).await);
            }
            Command::Receive {
                session,
                data,
                reply,
            } => {
                let result = self.receive(session, &data).await;
                if let Err(e) = &result {
                    if e.is_persistence() {
                        warn!(
                            "Closing session {} of document '{}': {}",
                            session, self.document_id, e
                        );
                        self.remove_session(
                            session,
                            CLOSE_PERSISTENCE_FAILURE,
                            "Update could not be persisted",
                        )
                        .await;
                    }
                }
                let _ = reply.send(result);
            }
            Command::Detach { session, reply } => {
                self.remove_session(session, CLOSE_NORMAL, "Session detached")
                    .await;
                let _ = reply.send(());
            }
            Command::Snapshot { reply } => {
                let result = self
                    .ensure_loaded()
                    .await
                    .map(|replica| replica.encode_state_as_update());
                let _ = reply.send(result);
            }
            Command::Reset { reply } => {
                let _ = reply.send(self.reset().await);
            }
            Command::Flush { reply } => {
                let _ = reply.send(self.flush().await);
            }
            Command::Wake => {
                if let Err(e) = self.ensure_loaded().await {
                    error!("Failed to load document '{}': {}", self.document_id, e);
                }
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Retire { reply } => {
                let idle = self.is_idle();
                if idle {
                    self.commands.close();
                }
                let _ = reply.send(idle);
                return !idle;
            }
        }
        true
    }

    async fn attach(&mut self, channel: Channel) -> SyncResult<SessionId> {
        if channel.document_id() != self.document_id {
            return Err(SyncError::protocol(format!(
                "Channel opened for '{}' cannot attach to document '{}'",
                channel.document_id(),
                self.document_id
            )));
        }

        let (step1, awareness) = {
            let replica = self.ensure_loaded().await?;
            let awareness = (!replica.awareness().is_empty())
                .then(|| Message::Awareness(replica.awareness().encode_full()).encode());
            let step1 = Message::Sync(SyncMessage::Step1(replica.state_vector())).encode();
            (step1, awareness)
        };

        let session = self.sessions.register(channel);
        self.sessions.send_to(session, step1);
        if let Some(frame) = awareness {
            self.sessions.send_to(session, frame);
        }

        info!(
            "Attached session {} to document '{}' ({} connected)",
            session,
            self.document_id,
            self.sessions.len()
        );
        Ok(session)
    }

    async fn receive(&mut self, session: SessionId, data: &[u8]) -> SyncResult<()> {
        if !self.sessions.contains(session) {
            return Err(SyncError::ChannelClosed);
        }

        match Message::decode(data)? {
            Message::Sync(SyncMessage::Step1(state_vector)) => {
                let diff = self.ensure_loaded().await?.encode_diff(&state_vector)?;
                self.sessions
                    .send_to(session, Message::Sync(SyncMessage::Step2(diff)).encode());
            }
            Message::Sync(SyncMessage::Step2(update) | SyncMessage::Update(update)) => {
                self.apply_update(session, &update).await?;
            }
            Message::Awareness(update) => {
                self.apply_awareness(session, &update).await?;
            }
            Message::QueryAwareness => {
                let full = self.ensure_loaded().await?.awareness().encode_full();
                self.sessions
                    .send_to(session, Message::Awareness(full).encode());
            }
        }
        Ok(())
    }

    async fn apply_update(&mut self, session: SessionId, update: &[u8]) -> SyncResult<()> {
        let Some(delta) = self.ensure_loaded().await?.apply_update(update)? else {
            debug!(
                "Redundant update from session {} on document '{}'",
                session, self.document_id
            );
            return Ok(());
        };

        self.pending_appends.push_back(PendingAppend {
            origin: Some(session),
            delta,
        });
        self.flush_appends().await?;
        self.schedule_export().await;
        Ok(())
    }

    /// Append queued deltas in order, relaying each once it is durable
    async fn flush_appends(&mut self) -> SyncResult<()> {
        while let Some(pending) = self.pending_appends.front() {
            self.append_with_retry(&pending.delta).await?;

            if let Some(PendingAppend { origin, delta }) = self.pending_appends.pop_front() {
                let frame = Message::Sync(SyncMessage::Update(delta)).encode();
                self.sessions.broadcast(&frame, origin);
            }
        }
        Ok(())
    }

    async fn append_with_retry(&self, delta: &[u8]) -> SyncResult<()> {
        let attempts = self.config.append_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self
                .services
                .storage
                .append_update(&self.document_id, delta)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    warn!(
                        "Update log append {}/{} failed for document '{}': {}",
                        attempt, attempts, self.document_id, e
                    );
                    sleep(APPEND_RETRY_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        "Update log append failed for document '{}' after {} attempts: {}",
                        self.document_id, attempts, e
                    );
                    return Err(SyncError::Persistence(e.to_string()));
                }
            }
        }
    }

    async fn apply_awareness(&mut self, session: SessionId, update: &[u8]) -> SyncResult<()> {
        let (change, frame) = {
            let awareness = self.ensure_loaded().await?.awareness_mut();
            let change = awareness.apply_update(update)?;
            if change.is_empty() {
                return Ok(());
            }
            let frame = Message::Awareness(awareness.encode_update(&change.changed())).encode();
            (change, frame)
        };

        if let Some(entry) = self.sessions.get_mut(session) {
            entry
                .controlled
                .extend(change.added.iter().chain(&change.updated).copied());
            for client_id in &change.removed {
                entry.controlled.remove(client_id);
            }
        }
        self.track_awareness(&change);
        self.sessions.broadcast(&frame, Some(session));
        Ok(())
    }

    fn track_awareness(&mut self, change: &AwarenessChange) {
        self.active_clients
            .extend(change.added.iter().chain(&change.updated).copied());
        for client_id in &change.removed {
            self.active_clients.remove(client_id);
        }
    }

    async fn remove_session(&mut self, session: SessionId, code: u16, reason: &str) {
        let Some(entry) = self.sessions.remove(session) else {
            debug!(
                "Session {} already left document '{}'",
                session, self.document_id
            );
            return;
        };
        if !entry.channel.is_closed() {
            entry.channel.close(code, reason);
        }

        let controlled: Vec<u64> = entry.controlled.into_iter().collect();
        if let Some(replica) = self.replica.as_mut() {
            let change = replica.awareness_mut().remove_states(&controlled);
            if !change.is_empty() {
                let frame =
                    Message::Awareness(replica.awareness().encode_update(&change.removed)).encode();
                self.track_awareness(&change);
                self.sessions.broadcast(&frame, None);
            }
        }

        info!(
            "Detached session {} from document '{}' ({} connected)",
            session,
            self.document_id,
            self.sessions.len()
        );

        if self.sessions.is_empty() {
            info!(
                "Last session left document '{}', running export and cleanup now",
                self.document_id
            );
            self.cancel_export().await;
            self.run_maintenance().await;
        }
    }

    async fn reset(&mut self) -> SyncResult<()> {
        let closed = self.sessions.len();
        for (_, session) in self.sessions.drain() {
            session.channel.close(CLOSE_NORMAL, "Document reset");
        }
        self.active_clients.clear();
        self.export_deadline = None;
        self.pending_appends.clear();
        self.replica = None;

        let storage = &self.services.storage;
        storage
            .delete_all(&self.document_id)
            .await
            .map_err(|e| SyncError::Persistence(e.to_string()))?;
        storage
            .clear_alarm(&self.document_id)
            .await
            .map_err(|e| SyncError::Persistence(e.to_string()))?;

        self.replica = Some(Replica::new());
        info!(
            "Reset document '{}' ({} sessions closed)",
            self.document_id, closed
        );
        Ok(())
    }

    async fn flush(&mut self) -> SyncResult<()> {
        self.ensure_loaded().await?;
        self.cancel_export().await;
        self.run_maintenance().await;
        Ok(())
    }

    async fn on_debounce_fire(&mut self) {
        debug!("Debounce window elapsed for document '{}'", self.document_id);
        self.cancel_export().await;
        self.run_maintenance().await;
    }

    /// Export then garbage-collect; failures are logged, never returned
    async fn run_maintenance(&mut self) {
        if !self.pending_appends.is_empty() {
            if let Err(e) = self.flush_appends().await {
                warn!(
                    "{} updates of document '{}' are still waiting for the update log: {}",
                    self.pending_appends.len(),
                    self.document_id,
                    e
                );
            }
        }

        if let Err(e) = self.ensure_loaded().await {
            error!(
                "Skipping export and cleanup, document '{}' failed to load: {}",
                self.document_id, e
            );
            return;
        }
        let Some(replica) = self.replica.as_ref() else {
            return;
        };

        let document_id = &self.document_id;
        let blobs = self.services.blobs.as_ref();
        let metadata = self.services.metadata.as_ref();

        if let Err(e) = jobs::run_export(document_id, replica, &self.config, blobs).await {
            error!("Markdown export failed for document '{}': {}", document_id, e);
        }

        match jobs::run_gc(document_id, replica, &self.config, metadata, blobs).await {
            Ok(report) => debug!(
                "Image cleanup for document '{}': {} referenced, {} stored, {} deleted",
                document_id,
                report.referenced,
                report.stored,
                report.deleted.len()
            ),
            Err(e) => error!(
                "Image garbage collection failed for document '{}': {}",
                document_id, e
            ),
        }
    }

    /// (Re)start the debounce window from now
    async fn schedule_export(&mut self) {
        let window = self.config.debounce_window();
        self.export_deadline = Some(Instant::now() + window);

        let due = Utc::now()
            + chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
        if let Err(e) = self.services.storage.set_alarm(&self.document_id, due).await {
            warn!(
                "Failed to store export alarm for document '{}': {}",
                self.document_id, e
            );
        }
    }

    async fn cancel_export(&mut self) {
        self.export_deadline = None;
        if let Err(e) = self.services.storage.clear_alarm(&self.document_id).await {
            warn!(
                "Failed to clear export alarm for document '{}': {}",
                self.document_id, e
            );
        }
    }

    async fn ensure_loaded(&mut self) -> SyncResult<&mut Replica> {
        if self.replica.is_none() {
            let updates = self
                .services
                .storage
                .load_updates(&self.document_id)
                .await
                .map_err(|e| SyncError::Persistence(e.to_string()))?;
            let replica = Replica::from_updates(&updates)?;
            info!(
                "Loaded document '{}' from {} logged updates",
                self.document_id,
                updates.len()
            );
            self.replica = Some(replica);
            self.rearm_alarm().await;
        }
        Ok(self.replica.get_or_insert_with(Replica::new))
    }

    /// Pick up an export alarm stored before the last shutdown
    async fn rearm_alarm(&mut self) {
        match self.services.storage.alarm(&self.document_id).await {
            Ok(Some(due)) => {
                let remaining = (due - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                debug!(
                    "Re-armed export alarm for document '{}' in {:?}",
                    self.document_id, remaining
                );
                self.export_deadline = Some(Instant::now() + remaining);
            }
            Ok(None) => {}
            Err(e) => warn!(
                "Failed to read export alarm for document '{}': {}",
                self.document_id, e
            ),
        }
    }

    fn is_idle(&self) -> bool {
        self.sessions.is_empty()
            && self.export_deadline.is_none()
            && self.pending_appends.is_empty()
    }

    fn status(&self) -> DocumentStatus {
        DocumentStatus {
            document_id: self.document_id.clone(),
            loaded: self.replica.is_some(),
            sessions: self.sessions.len(),
            awareness_clients: self.active_clients.len(),
            export_pending: self.export_deadline.is_some(),
            pending_appends: self.pending_appends.len(),
        }
    }
}
