//! # mdsync - collaborative markdown document actors
//!
//! Each document id is served by one actor that owns a live Yjs replica,
//! the awareness state of its connected sessions, and the document's
//! maintenance: every update is appended to a durable log, a debounced
//! markdown export runs after edits settle, and images the document no
//! longer references are garbage-collected.
//!
//! The [`DocumentRegistry`] addresses actors by document id; the optional
//! `axum` feature exposes them over HTTP and WebSocket.

pub mod actor;
pub mod config;
pub mod content;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod replica;
pub mod session;
pub mod storage;

#[cfg(feature = "axum")]
pub mod axum;

// Re-exports for convenience
pub use actor::{DocumentActor, DocumentHandle, DocumentStatus, GcReport, Services};
pub use config::ActorConfig;
pub use content::ContentNode;
pub use error::{SyncError, SyncResult};
pub use registry::DocumentRegistry;
pub use replica::Replica;
pub use session::{Channel, ChannelFrame, SessionId};
pub use storage::{
    BlobStore, DocumentStorage, EditorRecord, ImageRecord, MemoryBlobStore,
    MemoryDocumentStorage, MemoryMetadataStore, MetadataStore,
};

#[cfg(feature = "persistence")]
pub use storage::{FileStorage, FsBlobStore};

#[cfg(feature = "axum")]
pub use axum::{router, router_with_state, EditorState, WebSocketHandler};
