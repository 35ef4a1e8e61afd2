//! Binary framing spoken over a document channel.
//!
//! Frames follow the y-websocket layout so stock Yjs providers can connect:
//!
//! ```text
//! [msg_type: varuint] [payload]
//! msg_type: 0 = sync (sub-type varuint + varbuf)
//! msg_type: 1 = awareness (varbuf holding an awareness update)
//! msg_type: 3 = query awareness (no payload)
//! ```

use lib0::decoding::{Cursor, Read};
use lib0::encoding::Write;

use crate::error::decode_error;
use crate::{SyncError, SyncResult};

pub mod awareness;

pub use awareness::{AwarenessEntry, AwarenessUpdate};

pub const MESSAGE_SYNC: u32 = 0;
pub const MESSAGE_AWARENESS: u32 = 1;
pub const MESSAGE_QUERY_AWARENESS: u32 = 3;

pub const SYNC_STEP1: u32 = 0;
pub const SYNC_STEP2: u32 = 1;
pub const SYNC_UPDATE: u32 = 2;

/// A frame exchanged between a client replica and a document actor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Sync(SyncMessage),
    /// Encoded awareness update
    Awareness(Vec<u8>),
    QueryAwareness,
}

/// Sync sub-protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// Sender's state vector; the receiver answers with the missing delta
    Step1(Vec<u8>),
    /// Delta answering a step 1
    Step2(Vec<u8>),
    /// Incremental update pushed by either side
    Update(Vec<u8>),
}

impl Message {
    /// Encode the message into a binary frame
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Vec::new();
        match self {
            Message::Sync(sync) => {
                encoder.write_var(MESSAGE_SYNC);
                let (kind, payload) = match sync {
                    SyncMessage::Step1(sv) => (SYNC_STEP1, sv),
                    SyncMessage::Step2(update) => (SYNC_STEP2, update),
                    SyncMessage::Update(update) => (SYNC_UPDATE, update),
                };
                encoder.write_var(kind);
                encoder.write_buf(payload);
            }
            Message::Awareness(update) => {
                encoder.write_var(MESSAGE_AWARENESS);
                encoder.write_buf(update);
            }
            Message::QueryAwareness => {
                encoder.write_var(MESSAGE_QUERY_AWARENESS);
            }
        }
        encoder
    }

    /// Decode a binary frame
    pub fn decode(data: &[u8]) -> SyncResult<Self> {
        let mut decoder = Cursor::new(data);
        let msg_type: u32 = decoder.read_var().map_err(decode_error)?;

        match msg_type {
            MESSAGE_SYNC => {
                let kind: u32 = decoder.read_var().map_err(decode_error)?;
                let payload = decoder.read_buf().map_err(decode_error)?.to_vec();
                let sync = match kind {
                    SYNC_STEP1 => SyncMessage::Step1(payload),
                    SYNC_STEP2 => SyncMessage::Step2(payload),
                    SYNC_UPDATE => SyncMessage::Update(payload),
                    other => {
                        return Err(SyncError::protocol(format!(
                            "Unknown sync message type: {}",
                            other
                        )))
                    }
                };
                Ok(Message::Sync(sync))
            }
            MESSAGE_AWARENESS => {
                let payload = decoder.read_buf().map_err(decode_error)?;
                Ok(Message::Awareness(payload.to_vec()))
            }
            MESSAGE_QUERY_AWARENESS => Ok(Message::QueryAwareness),
            other => Err(SyncError::protocol(format!(
                "Unknown message type: {}",
                other
            ))),
        }
    }
}
