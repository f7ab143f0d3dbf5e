//! Durable ordered store for `AlarmEntry` rows, indexed on `expiry`.
//!
//! Backed by `sled` (the teacher workspace's embedded-store dependency). A
//! `sled::Tree`'s keys are kept in byte-lexicographic order, so encoding
//! `(expiry, id)` as fixed-width big-endian integers gives ascending-expiry
//! iteration for free — no secondary index needed for "earliest expiry".

use tracing::error;

use super::{AlarmEntry, EntryKey};
use crate::error::Result;

pub struct AlarmStore {
    db: sled::Db,
    entries: sled::Tree,
    by_triple: sled::Tree,
    by_id: sled::Tree,
}

fn primary_key(expiry: i64, id: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    // Offset by i64::MIN so byte-lexicographic order matches numeric order
    // even though expiry is signed (it is never negative per §3, but this
    // keeps the encoding correct regardless).
    let biased = (expiry as i128 - i64::MIN as i128) as u64;
    key[0..8].copy_from_slice(&biased.to_be_bytes());
    key[8..16].copy_from_slice(&id.to_be_bytes());
    key
}

fn triple_key(key: EntryKey<'_>) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.app_id.len() + key.key.len() + 2);
    out.extend_from_slice(key.app_id.as_bytes());
    out.push(0);
    out.extend_from_slice(key.key.as_bytes());
    out.push(if key.public_channel { 1 } else { 0 });
    out
}

impl AlarmStore {
    pub fn open(path: &str) -> Result<Self> {
        let db = match sled::open(path) {
            Ok(db) => db,
            Err(e) => {
                error!(target: "alarms", error = %e, path, "alarm store corrupt; truncating and recreating");
                let _ = std::fs::remove_dir_all(path);
                sled::open(path)?
            }
        };

        let entries = db.open_tree("entries")?;
        let by_triple = db.open_tree("by_triple")?;
        let by_id = db.open_tree("by_id")?;

        Ok(Self {
            db,
            entries,
            by_triple,
            by_id,
        })
    }

    fn next_id(&self) -> Result<u64> {
        let id = self.db.generate_id()?;
        Ok(id)
    }

    /// Inserts `entry`, deleting any prior row with the same
    /// `(app_id, key, public_channel)` triple first.
    pub fn upsert(&self, mut entry: AlarmEntry) -> Result<()> {
        let tk = triple_key(EntryKey {
            app_id: &entry.app_id,
            key: &entry.key,
            public_channel: entry.public_channel,
        });

        self.remove_triple_key(&tk)?;

        entry.id = self.next_id()?;
        let pk = primary_key(entry.expiry, entry.id);

        let serialized = serde_json::to_vec(&entry)?;
        self.entries.insert(pk, serialized)?;
        self.by_triple.insert(&tk, &pk[..])?;
        self.by_id.insert(entry.id.to_be_bytes(), &pk[..])?;
        self.db.flush()?;
        Ok(())
    }

    fn remove_triple_key(&self, tk: &[u8]) -> Result<bool> {
        let Some(pk_bytes) = self.by_triple.remove(tk)? else {
            return Ok(false);
        };
        self.entries.remove(&pk_bytes)?;
        if pk_bytes.len() >= 16 {
            let id = u64::from_be_bytes(pk_bytes[8..16].try_into().unwrap());
            self.by_id.remove(id.to_be_bytes())?;
        }
        Ok(true)
    }

    pub fn remove_by_triple(&self, key: EntryKey<'_>) -> Result<bool> {
        let tk = triple_key(key);
        let removed = self.remove_triple_key(&tk)?;
        if removed {
            self.db.flush()?;
        }
        Ok(removed)
    }

    pub fn find_by_triple(&self, key: EntryKey<'_>) -> Result<Option<AlarmEntry>> {
        let tk = triple_key(key);
        let Some(pk) = self.by_triple.get(&tk)? else {
            return Ok(None);
        };
        let Some(raw) = self.entries.get(&pk)? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    /// Returns every row with `expiry <= now`, ascending, and removes them.
    pub fn take_due(&self, now: i64) -> Result<Vec<AlarmEntry>> {
        let mut due = Vec::new();
        let mut keys_to_remove = Vec::new();

        for item in self.entries.iter() {
            let (pk, raw) = item?;
            let entry: AlarmEntry = serde_json::from_slice(&raw)?;
            if entry.expiry > now {
                break;
            }
            keys_to_remove.push((pk.to_vec(), entry.clone()));
            due.push(entry);
        }

        for (pk, entry) in keys_to_remove {
            self.entries.remove(&pk)?;
            let tk = triple_key(EntryKey {
                app_id: &entry.app_id,
                key: &entry.key,
                public_channel: entry.public_channel,
            });
            self.by_triple.remove(&tk)?;
            self.by_id.remove(entry.id.to_be_bytes())?;
        }
        if !due.is_empty() {
            self.db.flush()?;
        }

        Ok(due)
    }

    /// Scans for rows matching `app_id` (and `key`, if given), across both
    /// channels. Used by the legacy `alarmQuery` path, which has no triple
    /// to look up directly (§6 "flattened view across both stores").
    pub fn scan_by_app(&self, app_id: &str, key: Option<&str>) -> Result<Vec<AlarmEntry>> {
        let mut found = Vec::new();
        for item in self.entries.iter() {
            let (_, raw) = item?;
            let entry: AlarmEntry = serde_json::from_slice(&raw)?;
            if entry.app_id == app_id && key.map(|k| entry.key == k).unwrap_or(true) {
                found.push(entry);
            }
        }
        Ok(found)
    }

    pub fn earliest_expiry(&self) -> Result<Option<i64>> {
        Ok(self.first_entry()?.map(|e| e.expiry))
    }

    pub fn earliest_wake_capable_expiry(&self) -> Result<Option<i64>> {
        for item in self.entries.iter() {
            let (_, raw) = item?;
            let entry: AlarmEntry = serde_json::from_slice(&raw)?;
            if entry.wakeup {
                return Ok(Some(entry.expiry));
            }
        }
        Ok(None)
    }

    fn first_entry(&self) -> Result<Option<AlarmEntry>> {
        match self.entries.iter().next() {
            Some(item) => {
                let (_, raw) = item?;
                Ok(Some(serde_json::from_slice(&raw)?))
            }
            None => Ok(None),
        }
    }

    /// Shifts every non-calendar row's `expiry` by `delta`, re-keying it in
    /// the ordered index.
    pub fn shift_relative_entries(&self, delta: i64) -> Result<()> {
        let mut updates = Vec::new();
        for item in self.entries.iter() {
            let (pk, raw) = item?;
            let entry: AlarmEntry = serde_json::from_slice(&raw)?;
            if !entry.calendar {
                updates.push((pk.to_vec(), entry));
            }
        }

        for (old_pk, mut entry) in updates {
            self.entries.remove(&old_pk)?;
            entry.expiry += delta;
            let new_pk = primary_key(entry.expiry, entry.id);
            let serialized = serde_json::to_vec(&entry)?;
            self.entries.insert(new_pk, serialized)?;

            let tk = triple_key(EntryKey {
                app_id: &entry.app_id,
                key: &entry.key,
                public_channel: entry.public_channel,
            });
            self.by_triple.insert(&tk, &new_pk[..])?;
            self.by_id.insert(entry.id.to_be_bytes(), &new_pk[..])?;
        }
        self.db.flush()?;
        Ok(())
    }

    #[cfg(test)]
    pub fn count(&self) -> usize {
        self.entries.len()
    }
}
