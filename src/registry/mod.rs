//! Bounded-probe session registry
//!
//! An open-addressing, linear-probed table keyed by client and connection
//! identifiers. Probe chains are bounded: a lookup or insert examines at
//! most `MAX_CHAIN_LENGTH` consecutive slots. When a chain is exhausted,
//! or the table passes half capacity, the table doubles and every live
//! entry is reinserted.
//!
//! Deleted slots become tombstones rather than being compacted, so a probe
//! for a different key that passes through a freed slot keeps going; a
//! never-used slot still terminates the probe for the key being searched.
//! Values are owned by the table and dropped exactly once, on delete,
//! overwrite, or table drop.

use std::hash::Hasher;

use fnv::FnvHasher;

/// Initial slot count for a fresh table
const INITIAL_CAPACITY: usize = 4;

/// Upper bound on consecutive slots examined per operation
const MAX_CHAIN_LENGTH: usize = 8;

enum Slot<V> {
    /// Never held an entry; terminates a probe chain
    Vacant,
    /// Held an entry that was deleted; probes continue past it
    Tombstone,
    Occupied { key: String, value: V },
}

/// Open-addressing registry with case-insensitive string keys
pub struct Registry<V> {
    slots: Vec<Slot<V>>,
    len: usize,
}

/// Hash over the case-folded key bytes, so keys that compare equal under
/// the case-insensitive comparison always land on the same probe chain
fn hash_key(key: &str) -> u64 {
    let mut hasher = FnvHasher::default();
    for byte in key.bytes() {
        hasher.write_u8(byte.to_ascii_lowercase());
    }
    hasher.finish()
}

fn keys_equal(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// Probe-and-insert into a raw slot array. Returns `Ok(true)` when a new
/// entry was created, `Ok(false)` on overwrite, and gives the entry back
/// when the chain is exhausted.
fn raw_insert<V>(
    slots: &mut [Slot<V>],
    key: String,
    value: V,
) -> Result<bool, (String, V)> {
    let capacity = slots.len();
    let mut idx = (hash_key(&key) % capacity as u64) as usize;
    let mut reusable: Option<usize> = None;
    // (slot to write, whether it overwrites the same key)
    let mut target: Option<(usize, bool)> = None;

    for _ in 0..MAX_CHAIN_LENGTH {
        match &slots[idx] {
            Slot::Vacant => {
                // The key cannot live past a never-used slot; claim the
                // earliest reusable slot seen on the way here
                target = Some((reusable.unwrap_or(idx), false));
                break;
            }
            Slot::Tombstone => {
                if reusable.is_none() {
                    reusable = Some(idx);
                }
            }
            Slot::Occupied { key: existing, .. } => {
                if keys_equal(existing, &key) {
                    target = Some((idx, true));
                    break;
                }
            }
        }
        idx = (idx + 1) % capacity;
    }

    // A fully-probed chain can still insert into a tombstone it passed
    if target.is_none() {
        target = reusable.map(|slot| (slot, false));
    }

    match target {
        Some((slot, overwrite)) => {
            slots[slot] = Slot::Occupied { key, value };
            Ok(!overwrite)
        }
        None => Err((key, value)),
    }
}

impl<V> Registry<V> {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(INITIAL_CAPACITY);
        Self {
            slots: std::iter::repeat_with(|| Slot::Vacant).take(capacity).collect(),
            len: 0,
        }
    }

    /// Number of live (non-deleted) entries
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current slot count
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Insert or overwrite. Growth happens up front once the table passes
    /// half capacity, and again whenever the probe chain is exhausted, so
    /// the insert itself always lands.
    pub fn put(&mut self, key: impl Into<String>, value: V) {
        let mut key = key.into();
        let mut value = value;

        if self.len >= self.slots.len() / 2 {
            self.grow();
        }

        loop {
            match raw_insert(&mut self.slots, key, value) {
                Ok(inserted) => {
                    if inserted {
                        self.len += 1;
                    }
                    return;
                }
                Err((k, v)) => {
                    key = k;
                    value = v;
                    self.grow();
                }
            }
        }
    }

    /// Walk the probe chain for a key; `Some(slot)` only for a live match.
    /// Lookup, mutation and deletion all share this walk so the probe
    /// sequence can never diverge between them.
    fn find_index(&self, key: &str) -> Option<usize> {
        let capacity = self.slots.len();
        let mut idx = (hash_key(key) % capacity as u64) as usize;

        for _ in 0..MAX_CHAIN_LENGTH {
            match &self.slots[idx] {
                Slot::Vacant => return None,
                Slot::Tombstone => {}
                Slot::Occupied { key: existing, .. } => {
                    if keys_equal(existing, key) {
                        return Some(idx);
                    }
                }
            }
            idx = (idx + 1) % capacity;
        }
        None
    }

    /// Look up a key within its probe chain
    pub fn get(&self, key: &str) -> Option<&V> {
        let idx = self.find_index(key)?;
        match &self.slots[idx] {
            Slot::Occupied { value, .. } => Some(value),
            _ => unreachable!(),
        }
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut V> {
        let idx = self.find_index(key)?;
        match &mut self.slots[idx] {
            Slot::Occupied { value, .. } => Some(value),
            _ => unreachable!(),
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.find_index(key).is_some()
    }

    /// Remove a key, returning the owned value. The slot becomes a
    /// tombstone; later entries in the chain are left in place.
    pub fn delete(&mut self, key: &str) -> Option<V> {
        let idx = self.find_index(key)?;
        let taken = std::mem::replace(&mut self.slots[idx], Slot::Tombstone);
        self.len -= 1;
        match taken {
            Slot::Occupied { value, .. } => Some(value),
            _ => unreachable!(),
        }
    }

    /// Visit every occupied slot in table order (not insertion order)
    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Occupied { key, value } => Some((key.as_str(), value)),
            _ => None,
        })
    }

    /// Double the table and reinsert every live entry. Reinsertion retries
    /// with a larger table if the new capacity still exhausts a probe
    /// chain, so growth is safe to trigger from within growth.
    fn grow(&mut self) {
        let mut capacity = self.slots.len() * 2;
        let mut entries: Vec<(String, V)> = self
            .slots
            .drain(..)
            .filter_map(|slot| match slot {
                Slot::Occupied { key, value } => Some((key, value)),
                _ => None,
            })
            .collect();
        let live = entries.len();

        loop {
            let mut slots: Vec<Slot<V>> =
                std::iter::repeat_with(|| Slot::Vacant).take(capacity).collect();
            let mut overflow = Vec::new();

            while let Some((key, value)) = entries.pop() {
                if let Err(kv) = raw_insert(&mut slots, key, value) {
                    overflow.push(kv);
                }
            }

            if overflow.is_empty() {
                self.slots = slots;
                self.len = live;
                return;
            }

            // Reclaim what did fit and retry with a bigger table
            entries = overflow;
            for slot in slots {
                if let Slot::Occupied { key, value } = slot {
                    entries.push((key, value));
                }
            }
            capacity *= 2;
        }
    }
}

impl<V> Default for Registry<V> {
    fn default() -> Self {
        Self::new()
    }
}
