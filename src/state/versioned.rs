/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A key-value [`State`] that supports every capability required by the large-state checkpoint: it is
//! [`Versionable`], [`Streamable`], and reports itself as large.
//!
//! ## Copy-on-write
//!
//! Entries live in an `Arc`-shared base map. Entering dirty mode freezes the base: the streaming view
//! handed to the checkpoint thread is just another reference to it. While dirty, writes land in a delta
//! map (`Some(value)` for inserts, `None` for removals) and reads consult the delta before the base.
//! [`reconcile`](Versionable::reconcile) folds the delta into the base once the view is released.
//!
//! ## Streaming units
//!
//! The streaming unit is one entry. A chunk of `n` units is the borsh encoding of a `Vec<(String, V)>`
//! holding `n` consecutive entries in key order.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use borsh::{BorshDeserialize, BorshSerialize};

use super::{State, StateError, StateMeta, StreamSource, Streamable, Versionable};

pub struct VersionedMap<V> {
    meta: StateMeta,
    base: Arc<BTreeMap<String, V>>,
    delta: BTreeMap<String, Option<V>>,
    dirty: bool,
}

impl<V> VersionedMap<V>
where
    V: BorshSerialize + BorshDeserialize + Clone + Send + Sync + 'static,
{
    pub fn new(meta: StateMeta) -> Self {
        Self {
            meta,
            base: Arc::new(BTreeMap::new()),
            delta: BTreeMap::new(),
            dirty: false,
        }
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        match self.delta.get(key) {
            Some(entry) => entry.as_ref(),
            None => self.base.get(key),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: V) {
        let key = key.into();
        if self.dirty {
            self.delta.insert(key, Some(value));
        } else {
            Arc::make_mut(&mut self.base).insert(key, value);
        }
    }

    pub fn remove(&mut self, key: &str) {
        if self.dirty {
            self.delta.insert(key.to_string(), None);
        } else {
            Arc::make_mut(&mut self.base).remove(key);
        }
    }

    /// Number of live entries, as seen by the data path.
    pub fn len(&self) -> usize {
        let mut len = self.base.len();
        for (key, entry) in &self.delta {
            match (self.base.contains_key(key), entry.is_some()) {
                (false, true) => len += 1,
                (true, false) => len -= 1,
                _ => (),
            }
        }
        len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live entries in key order, as seen by the data path.
    pub fn entries(&self) -> BTreeMap<String, V> {
        let mut entries = (*self.base).clone();
        for (key, entry) in &self.delta {
            match entry {
                Some(value) => {
                    entries.insert(key.clone(), value.clone());
                }
                None => {
                    entries.remove(key);
                }
            }
        }
        entries
    }

    /// Number of mutations tracked since entering dirty mode.
    pub fn pending_mutations(&self) -> usize {
        self.delta.len()
    }

    /// Rebuild a map from a blob produced by [`State::serialize_state`].
    pub fn decode(blob: &[u8]) -> Result<Box<dyn State>, StateError> {
        let (meta, entries) = <(StateMeta, Vec<(String, V)>)>::try_from_slice(blob)?;
        let mut map = Self::new(meta);
        Arc::make_mut(&mut map.base).extend(entries);
        Ok(Box::new(map))
    }
}

impl<V> State for VersionedMap<V>
where
    V: BorshSerialize + BorshDeserialize + Clone + Send + Sync + 'static,
{
    fn meta(&self) -> &StateMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut StateMeta {
        &mut self.meta
    }

    fn deep_copy(&self) -> Box<dyn State> {
        Box::new(Self {
            meta: self.meta.clone(),
            base: Arc::new(self.entries()),
            delta: BTreeMap::new(),
            dirty: false,
        })
    }

    fn serialize_state(&self) -> Result<Vec<u8>, StateError> {
        let entries: Vec<(String, V)> = self.entries().into_iter().collect();
        Ok((self.meta.clone(), entries).try_to_vec()?)
    }

    fn is_large(&self) -> bool {
        true
    }

    fn as_versionable_mut(&mut self) -> Option<&mut dyn Versionable> {
        Some(self)
    }

    fn as_streamable(&self) -> Option<&dyn Streamable> {
        Some(self)
    }

    fn as_streamable_mut(&mut self) -> Option<&mut dyn Streamable> {
        Some(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl<V> Versionable for VersionedMap<V>
where
    V: BorshSerialize + BorshDeserialize + Clone + Send + Sync + 'static,
{
    fn set_dirty_mode(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn reconcile(&mut self) {
        let delta = std::mem::take(&mut self.delta);
        let base = Arc::make_mut(&mut self.base);
        for (key, entry) in delta {
            match entry {
                Some(value) => {
                    base.insert(key, value);
                }
                None => {
                    base.remove(&key);
                }
            }
        }
        self.dirty = false;
    }
}

impl<V> Streamable for VersionedMap<V>
where
    V: BorshSerialize + BorshDeserialize + Clone + Send + Sync + 'static,
{
    fn streaming_view(&self) -> Arc<dyn StreamSource> {
        Arc::new(FrozenEntries {
            entries: Arc::clone(&self.base),
            keys: OnceLock::new(),
        })
    }

    fn begin_transfer(&mut self) {
        self.base = Arc::new(BTreeMap::new());
        self.delta.clear();
        self.dirty = false;
    }

    fn append_chunk(&mut self, chunk: Option<&[u8]>) -> Result<(), StateError> {
        match chunk {
            Some(bytes) => {
                let entries = Vec::<(String, V)>::try_from_slice(bytes)?;
                for (key, value) in entries {
                    self.insert(key, value);
                }
            }
            None => {
                if self.dirty {
                    self.reconcile();
                }
                log::debug!(
                    "Finished rebuilding streamed state of {:?} with {} entries",
                    self.meta.owner_id(),
                    self.len()
                );
            }
        }
        Ok(())
    }
}

/// Read-only view over the base map of a [`VersionedMap`], frozen when dirty mode was entered.
struct FrozenEntries<V> {
    entries: Arc<BTreeMap<String, V>>,
    // Built lazily by the streaming thread so that freezing stays O(1).
    keys: OnceLock<Vec<String>>,
}

impl<V> StreamSource for FrozenEntries<V>
where
    V: BorshSerialize + Clone + Send + Sync,
{
    fn size(&self) -> usize {
        self.entries.len()
    }

    fn read(&self, offset: usize, len: usize) -> Vec<u8> {
        let keys = self
            .keys
            .get_or_init(|| self.entries.keys().cloned().collect());
        let start = offset.min(keys.len());
        let end = offset.saturating_add(len).min(keys.len());
        let chunk: Vec<(String, V)> = keys[start..end]
            .iter()
            .filter_map(|key| self.entries.get(key).map(|value| (key.clone(), value.clone())))
            .collect();
        // Serializing owned primitives into a Vec cannot fail.
        chunk.try_to_vec().unwrap_or_default()
    }
}
