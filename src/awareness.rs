//! Ephemeral presence state shared alongside a document.
//!
//! Awareness is a map from a client-chosen 32-bit id to an opaque JSON state
//! blob with a per-entry logical clock. It rides the same WebSocket as
//! document updates but is never persisted: cursors, selections, and user
//! colors die with the session.
//!
//! The wire blob is `varuint entry-count` followed by, per entry,
//! `varuint client-id || varuint clock || varstring state-json`. The literal
//! string `"null"` encodes a removal; receivers keep a tombstone with the
//! bumped clock so a stale re-announcement cannot resurrect the entry.

use std::collections::HashMap;

use crate::protocol::{
    read_var_string, read_var_u64, write_var_string, write_var_u64, ProtocolError,
};

/// Outcome of applying an awareness update, split the way listeners care
/// about it: fresh ids, changed ids, withdrawn ids.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<u64>,
    pub updated: Vec<u64>,
    pub removed: Vec<u64>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Every id touched by the update, in added/updated/removed order.
    pub fn all_ids(&self) -> Vec<u64> {
        let mut ids =
            Vec::with_capacity(self.added.len() + self.updated.len() + self.removed.len());
        ids.extend_from_slice(&self.added);
        ids.extend_from_slice(&self.updated);
        ids.extend_from_slice(&self.removed);
        ids
    }
}

struct Entry {
    clock: u64,
    /// `None` is a removal tombstone.
    state: Option<String>,
}

/// Server-side awareness replica for one document.
#[derive(Default)]
pub struct Awareness {
    entries: HashMap<u64, Entry>,
}

impl Awareness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply an update blob received from a client.
    ///
    /// An entry wins over the stored one when its clock is strictly newer, or
    /// when it is a removal at the same clock as a live entry.
    pub fn apply_update(&mut self, blob: &[u8]) -> Result<AwarenessChange, ProtocolError> {
        let mut pos = 0;
        let count = read_var_u64(blob, &mut pos)?;
        let mut change = AwarenessChange::default();

        for _ in 0..count {
            let client_id = read_var_u64(blob, &mut pos)?;
            let clock = read_var_u64(blob, &mut pos)?;
            let state_json = read_var_string(blob, &mut pos)?;
            let state = if state_json == "null" {
                None
            } else {
                Some(state_json.to_string())
            };

            let accept = match self.entries.get(&client_id) {
                None => true,
                Some(prev) => {
                    clock > prev.clock
                        || (clock == prev.clock && state.is_none() && prev.state.is_some())
                }
            };
            if !accept {
                continue;
            }

            let was_live = self
                .entries
                .get(&client_id)
                .map(|e| e.state.is_some())
                .unwrap_or(false);

            match (&state, was_live) {
                (Some(_), false) => change.added.push(client_id),
                (Some(_), true) => change.updated.push(client_id),
                (None, true) => change.removed.push(client_id),
                // Removal for an id we never saw live: record the clock only.
                (None, false) => {}
            }

            self.entries.insert(client_id, Entry { clock, state });
        }

        Ok(change)
    }

    /// Encode an update blob carrying the current entries for `ids`.
    /// Ids this replica has never seen are skipped.
    pub fn encode_update(&self, ids: &[u64]) -> Vec<u8> {
        let known: Vec<(u64, &Entry)> = ids
            .iter()
            .filter_map(|id| self.entries.get(id).map(|e| (*id, e)))
            .collect();

        let mut buf = Vec::new();
        write_var_u64(&mut buf, known.len() as u64);
        for (id, entry) in known {
            write_var_u64(&mut buf, id);
            write_var_u64(&mut buf, entry.clock);
            match &entry.state {
                Some(json) => write_var_string(&mut buf, json),
                None => write_var_string(&mut buf, "null"),
            }
        }
        buf
    }

    /// Withdraw `ids`, bumping each clock so peers accept the removal.
    /// Returns the update blob announcing the withdrawals.
    pub fn remove(&mut self, ids: &[u64]) -> Vec<u8> {
        for id in ids {
            if let Some(entry) = self.entries.get_mut(id) {
                if entry.state.is_some() {
                    entry.clock += 1;
                    entry.state = None;
                }
            }
        }
        self.encode_update(ids)
    }

    /// Ids that currently have a live (non-tombstone) state.
    pub fn live_ids(&self) -> Vec<u64> {
        self.entries
            .iter()
            .filter(|(_, e)| e.state.is_some())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn live_len(&self) -> usize {
        self.entries.values().filter(|e| e.state.is_some()).count()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
