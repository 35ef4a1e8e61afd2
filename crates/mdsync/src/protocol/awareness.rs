use lib0::decoding::{Cursor, Read};
use lib0::encoding::Write;
use serde_json::Value as JsonValue;

use crate::error::decode_error;
use crate::SyncResult;

/// One client's presence entry inside an awareness update
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessEntry {
    pub client_id: u64,
    pub clock: u32,
    /// `None` marks the client as gone
    pub state: Option<JsonValue>,
}

/// A batch of presence entries, encoded as
/// `[count] ([client_id] [clock] [json state])*` with lib0 varints
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AwarenessUpdate {
    pub entries: Vec<AwarenessEntry>,
}

impl AwarenessUpdate {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Vec::new();
        encoder.write_var(self.entries.len() as u64);
        for entry in &self.entries {
            encoder.write_var(entry.client_id);
            encoder.write_var(entry.clock);
            let json = match &entry.state {
                Some(state) => state.to_string(),
                None => "null".to_string(),
            };
            encoder.write_string(&json);
        }
        encoder
    }

    pub fn decode(data: &[u8]) -> SyncResult<Self> {
        let mut decoder = Cursor::new(data);
        let count: u64 = decoder.read_var().map_err(decode_error)?;
        let mut entries = Vec::new();

        for _ in 0..count {
            let client_id: u64 = decoder.read_var().map_err(decode_error)?;
            let clock: u32 = decoder.read_var().map_err(decode_error)?;
            let json = decoder.read_string().map_err(decode_error)?;
            let state = match serde_json::from_str::<JsonValue>(json)? {
                JsonValue::Null => None,
                value => Some(value),
            };
            entries.push(AwarenessEntry {
                client_id,
                clock,
                state,
            });
        }

        Ok(Self { entries })
    }
}
