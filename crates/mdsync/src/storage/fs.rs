use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lib0::decoding::{Cursor, Read};
use std::io::{self, ErrorKind};
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::{BlobStore, DocumentStorage};
use crate::{SyncError, SyncResult};

const UPDATES_EXTENSION: &str = "updates";
const ALARM_EXTENSION: &str = "alarm";

/// Update logs and alarms as files under one directory.
///
/// Each document has `{id}.updates`, a sequence of length-prefixed deltas,
/// and optionally `{id}.alarm` holding an RFC 3339 timestamp.
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Open a storage directory, creating it if needed
    pub async fn open(root: impl Into<PathBuf>) -> SyncResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        debug!("Opened update log storage at {:?}", root);
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, document_id: &str, extension: &str) -> SyncResult<PathBuf> {
        validate_document_id(document_id)?;
        Ok(self.root.join(format!("{}.{}", document_id, extension)))
    }
}

#[async_trait]
impl DocumentStorage for FileStorage {
    async fn append_update(&self, document_id: &str, update: &[u8]) -> SyncResult<()> {
        let path = self.path(document_id, UPDATES_EXTENSION)?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        append_frame(&mut file, &encode_frame(update)).await?;
        Ok(())
    }

    async fn load_updates(&self, document_id: &str) -> SyncResult<Vec<Vec<u8>>> {
        let path = self.path(document_id, UPDATES_EXTENSION)?;
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut updates = Vec::new();
        let mut decoder = Cursor::new(&data);
        while decoder.has_content() {
            match decoder.read_buf() {
                Ok(update) => updates.push(update.to_vec()),
                Err(e) => {
                    // A crash mid-append leaves a partial frame at the tail
                    warn!(
                        "Ignoring truncated tail of update log for document '{}' after {} entries: {}",
                        document_id,
                        updates.len(),
                        e
                    );
                    break;
                }
            }
        }
        Ok(updates)
    }

    async fn delete_all(&self, document_id: &str) -> SyncResult<()> {
        remove_if_exists(&self.path(document_id, UPDATES_EXTENSION)?).await
    }

    async fn set_alarm(&self, document_id: &str, at: DateTime<Utc>) -> SyncResult<()> {
        let path = self.path(document_id, ALARM_EXTENSION)?;
        write_atomic(&path, at.to_rfc3339().as_bytes()).await
    }

    async fn alarm(&self, document_id: &str) -> SyncResult<Option<DateTime<Utc>>> {
        let path = self.path(document_id, ALARM_EXTENSION)?;
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let at = DateTime::parse_from_rfc3339(text.trim())
            .map_err(|e| SyncError::Storage(format!("Invalid alarm for '{}': {}", document_id, e)))?;
        Ok(Some(at.with_timezone(&Utc)))
    }

    async fn clear_alarm(&self, document_id: &str) -> SyncResult<()> {
        remove_if_exists(&self.path(document_id, ALARM_EXTENSION)?).await
    }

    async fn pending_alarms(&self) -> SyncResult<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) == Some(ALARM_EXTENSION) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        Ok(ids)
    }
}

/// Blobs as files under one directory, keyed by relative path
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub async fn open(root: impl Into<PathBuf>) -> SyncResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        debug!("Opened blob storage at {:?}", root);
        Ok(Self { root })
    }

    fn path(&self, key: &str) -> SyncResult<PathBuf> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !safe {
            return Err(SyncError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, data: Vec<u8>, _content_type: &str) -> SyncResult<()> {
        let path = self.path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        write_atomic(&path, &data).await
    }

    async fn get(&self, key: &str) -> SyncResult<Option<Vec<u8>>> {
        match tokio::fs::read(self.path(key)?).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_many(&self, keys: &[String]) -> SyncResult<()> {
        for key in keys {
            remove_if_exists(&self.path(key)?).await?;
        }
        Ok(())
    }
}

/// Update log file operations, split out so a torn write can be rolled back
#[async_trait]
trait LogFile: Send {
    async fn current_len(&mut self) -> io::Result<u64>;
    async fn write_synced(&mut self, frame: &[u8]) -> io::Result<()>;
    async fn truncate(&mut self, len: u64) -> io::Result<()>;
}

#[async_trait]
impl LogFile for tokio::fs::File {
    async fn current_len(&mut self) -> io::Result<u64> {
        Ok(self.metadata().await?.len())
    }

    async fn write_synced(&mut self, frame: &[u8]) -> io::Result<()> {
        self.write_all(frame).await?;
        self.sync_data().await
    }

    async fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len).await?;
        self.sync_data().await
    }
}

fn encode_frame(update: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(update.len() + 5);
    lib0::encoding::Write::write_buf(&mut frame, update);
    frame
}

/// Append one frame; on failure the file is cut back to its previous length
/// so a retried append never lands behind a partial frame
async fn append_frame<F: LogFile + ?Sized>(file: &mut F, frame: &[u8]) -> io::Result<()> {
    let original_len = file.current_len().await?;
    if let Err(e) = file.write_synced(frame).await {
        if let Err(rollback) = file.truncate(original_len).await {
            warn!(
                "Failed to cut update log back to {} bytes after a failed append: {}",
                original_len, rollback
            );
        }
        return Err(e);
    }
    Ok(())
}

fn validate_document_id(document_id: &str) -> SyncResult<()> {
    let valid = !document_id.is_empty()
        && document_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SyncError::InvalidKey(document_id.to_string()))
    }
}

async fn write_atomic(path: &Path, data: &[u8]) -> SyncResult<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> SyncResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
