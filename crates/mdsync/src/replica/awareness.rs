use serde_json::Value as JsonValue;
use std::collections::HashMap;

use crate::protocol::{AwarenessEntry, AwarenessUpdate};
use crate::SyncResult;

/// Client ids touched by an awareness update
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<u64>,
    pub updated: Vec<u64>,
    pub removed: Vec<u64>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Every client id mentioned by the change
    pub fn changed(&self) -> Vec<u64> {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .copied()
            .collect()
    }
}

/// Ephemeral per-client presence (cursors, selections, user info).
///
/// The server holds no presence of its own; it only mirrors what clients
/// publish and retires entries when their connection goes away.
#[derive(Debug, Default)]
pub struct Awareness {
    states: HashMap<u64, JsonValue>,
    clocks: HashMap<u64, u32>,
}

impl Awareness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn state(&self, client_id: u64) -> Option<&JsonValue> {
        self.states.get(&client_id)
    }

    pub fn client_ids(&self) -> Vec<u64> {
        self.states.keys().copied().collect()
    }

    /// Apply an encoded awareness update.
    ///
    /// An entry wins when the client is unknown, its clock is newer, or the
    /// clock is equal and it retires a client we still hold.
    pub fn apply_update(&mut self, data: &[u8]) -> SyncResult<AwarenessChange> {
        let update = AwarenessUpdate::decode(data)?;
        let mut change = AwarenessChange::default();

        for AwarenessEntry {
            client_id,
            clock,
            state,
        } in update.entries
        {
            let known = self.clocks.get(&client_id).copied();
            let newer = known.map_or(true, |current| current < clock);
            let retires_known = known == Some(clock)
                && state.is_none()
                && self.states.contains_key(&client_id);
            if !newer && !retires_known {
                continue;
            }

            let previous = match &state {
                Some(value) => self.states.insert(client_id, value.clone()),
                None => self.states.remove(&client_id),
            };
            self.clocks.insert(client_id, clock);

            match (previous.is_some(), state.is_some()) {
                (false, true) => change.added.push(client_id),
                (true, true) => change.updated.push(client_id),
                (true, false) => change.removed.push(client_id),
                (false, false) => {}
            }
        }

        Ok(change)
    }

    /// Retire clients, bumping their clocks so peers accept the removal
    pub fn remove_states(&mut self, client_ids: &[u64]) -> AwarenessChange {
        let mut change = AwarenessChange::default();
        for &client_id in client_ids {
            if self.states.remove(&client_id).is_some() {
                let clock = self.clocks.entry(client_id).or_insert(0);
                *clock = clock.saturating_add(1);
                change.removed.push(client_id);
            }
        }
        change
    }

    /// Encode the current entries of the given clients; absent clients encode as removed
    pub fn encode_update(&self, client_ids: &[u64]) -> Vec<u8> {
        let entries = client_ids
            .iter()
            .map(|&client_id| AwarenessEntry {
                client_id,
                clock: self.clocks.get(&client_id).copied().unwrap_or(0),
                state: self.states.get(&client_id).cloned(),
            })
            .collect();
        AwarenessUpdate { entries }.encode()
    }

    /// Encode every live entry
    pub fn encode_full(&self) -> Vec<u8> {
        self.encode_update(&self.client_ids())
    }
}
