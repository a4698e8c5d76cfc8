//! Content storage keyed by key, content type and owner.

use std::{
    collections::{BTreeMap, HashMap},
    fmt::Debug,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use bytes::Bytes;

use crate::{common::Id, identity::unix_millis};

/// Signature material of a signed [StorageEntry].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySignature {
    pub public_key: [u8; 32],
    pub content_hash: [u8; 20],
    pub signature: [u8; 64],
}

/// A piece of content stored under a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEntry {
    pub key: Id,
    pub content_type: String,
    pub value: Bytes,
    pub owner: String,
    /// Submission time in milliseconds since the unix epoch.
    pub timestamp: u64,
    /// Time to live in milliseconds.
    pub ttl: u64,
    /// None for entries stored through an unsigned batch.
    pub signature: Option<EntrySignature>,
}

impl StorageEntry {
    /// An unsigned entry submitted now.
    pub fn unsigned(key: Id, content_type: &str, value: Bytes, owner: &str, ttl: Duration) -> Self {
        StorageEntry {
            key,
            content_type: content_type.to_string(),
            value,
            owner: owner.to_string(),
            timestamp: unix_millis(),
            ttl: ttl.as_millis() as u64,
            signature: None,
        }
    }

    pub fn expires_at(&self) -> u64 {
        self.timestamp.saturating_add(self.ttl)
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at() < unix_millis()
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// Entries with the same key, type, owner, submission time and value are
    /// the same submission.
    pub fn same_submission(&self, other: &StorageEntry) -> bool {
        self.key == other.key
            && self.timestamp == other.timestamp
            && self.owner == other.owner
            && self.content_type == other.content_type
            && self.value == other.value
    }
}

/// Which entries of a key a read selects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentFilter {
    /// Only entries of this content type.
    pub content_type: Option<String>,
    /// Only entries of this owner.
    pub owner: Option<String>,
    /// Only the newest entry of each owner and type.
    pub recent: bool,
}

impl ContentFilter {
    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_string());
        self
    }

    pub fn owner(mut self, owner: &str) -> Self {
        self.owner = Some(owner.to_string());
        self
    }

    pub fn recent(mut self, recent: bool) -> Self {
        self.recent = recent;
        self
    }
}

/// One item of an unsigned batch store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItem {
    pub content_type: String,
    pub value: Bytes,
    pub ttl: Duration,
}

/// Storage engine of a node. Enforces no policy of its own.
pub trait Storage: Send + Sync + Debug {
    /// Stores an entry. A resubmission only refreshes its republish time.
    fn store(&self, entry: StorageEntry) -> bool;

    /// Live entries of `key` matching `filter`, newest first within each owner,
    /// or None if nothing is stored under `key`.
    fn get(&self, key: &Id, filter: &ContentFilter) -> Option<Vec<StorageEntry>>;

    /// Like [Storage::get], dropping the oldest entries until the values fit in `max_size` bytes.
    fn get_limited(
        &self,
        key: &Id,
        filter: &ContentFilter,
        max_size: usize,
    ) -> Option<Vec<StorageEntry>> {
        let mut entries = self.get(key, filter)?;
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let mut size: usize = entries.iter().map(|e| e.value.len()).sum();
        while size > max_size {
            match entries.pop() {
                Some(dropped) => size -= dropped.value.len(),
                None => break,
            }
        }

        Some(entries)
    }

    /// Entry counts of `key`, per owner when a content type is given, per type otherwise.
    fn get_count(&self, key: &Id, filter: &ContentFilter) -> Option<BTreeMap<String, u64>>;

    /// Removes everything stored under `key`.
    fn remove(&self, key: &Id) -> usize;

    /// Drops expired entries, returning how many were dropped.
    fn remove_expired(&self) -> usize;

    /// Signed entries not republished for `period`, marked as republished now.
    fn due_for_republish(&self, period: Duration) -> Vec<StorageEntry>;

    /// Every live entry.
    fn entries(&self) -> Vec<StorageEntry>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
struct Record {
    entry: StorageEntry,
    republished: Instant,
}

type OwnerLists = HashMap<String, Vec<Record>>;
type TypeBuckets = HashMap<String, OwnerLists>;

/// In-memory [Storage], key → type → owner → entries (newest first).
#[derive(Debug, Default)]
pub struct MemoryStorage {
    store: Mutex<HashMap<Id, TypeBuckets>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Id, TypeBuckets>> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owner lists of the matching types.
fn matching_types<'a>(
    types: &'a TypeBuckets,
    filter: &'a ContentFilter,
) -> impl Iterator<Item = (&'a String, &'a OwnerLists)> {
    types
        .iter()
        .filter(move |(content_type, _)| match &filter.content_type {
            Some(wanted) => *content_type == wanted,
            None => true,
        })
}

/// Live entries of an owner list, honouring the recency flag.
fn live(records: &[Record], recent: bool) -> impl Iterator<Item = &StorageEntry> {
    records
        .iter()
        .map(|record| &record.entry)
        .filter(|entry| !entry.is_expired())
        .take(if recent { 1 } else { usize::MAX })
}

impl Storage for MemoryStorage {
    fn store(&self, entry: StorageEntry) -> bool {
        let mut store = self.lock();

        let list = store
            .entry(entry.key)
            .or_default()
            .entry(entry.content_type.clone())
            .or_default()
            .entry(entry.owner.clone())
            .or_default();

        if let Some(existing) = list.iter_mut().find(|record| {
            record.entry.timestamp == entry.timestamp && record.entry.value == entry.value
        }) {
            existing.republished = Instant::now();
            return true;
        }

        // Newest first, even if submissions arrive out of order.
        let position = list
            .iter()
            .position(|record| record.entry.timestamp < entry.timestamp)
            .unwrap_or(list.len());

        list.insert(
            position,
            Record {
                entry,
                republished: Instant::now(),
            },
        );

        true
    }

    fn get(&self, key: &Id, filter: &ContentFilter) -> Option<Vec<StorageEntry>> {
        let store = self.lock();
        let types = store.get(key)?;

        let mut result = Vec::new();
        for (_, owners) in matching_types(types, filter) {
            for (owner, records) in owners {
                if filter.owner.as_ref().is_some_and(|wanted| wanted != owner) {
                    continue;
                }
                result.extend(live(records, filter.recent).cloned());
            }
        }

        Some(result)
    }

    fn get_count(&self, key: &Id, filter: &ContentFilter) -> Option<BTreeMap<String, u64>> {
        let store = self.lock();
        let types = store.get(key)?;

        let mut counters = BTreeMap::new();
        for (content_type, owners) in matching_types(types, filter) {
            for (owner, records) in owners {
                if filter.owner.as_ref().is_some_and(|wanted| wanted != owner) {
                    continue;
                }

                let count = live(records, filter.recent).count() as u64;
                if count == 0 {
                    continue;
                }

                let name = if filter.content_type.is_some() {
                    owner
                } else {
                    content_type
                };
                *counters.entry(name.clone()).or_insert(0) += count;
            }
        }

        Some(counters)
    }

    fn remove(&self, key: &Id) -> usize {
        self.lock()
            .remove(key)
            .map(|types| {
                types
                    .values()
                    .flat_map(|owners| owners.values())
                    .map(Vec::len)
                    .sum()
            })
            .unwrap_or(0)
    }

    fn remove_expired(&self) -> usize {
        let mut store = self.lock();
        let mut removed = 0;

        for types in store.values_mut() {
            for owners in types.values_mut() {
                for records in owners.values_mut() {
                    let before = records.len();
                    records.retain(|record| !record.entry.is_expired());
                    removed += before - records.len();
                }
                owners.retain(|_, records| !records.is_empty());
            }
            types.retain(|_, owners| !owners.is_empty());
        }
        store.retain(|_, types| !types.is_empty());

        removed
    }

    fn due_for_republish(&self, period: Duration) -> Vec<StorageEntry> {
        let mut store = self.lock();
        let mut due = Vec::new();

        for records in store
            .values_mut()
            .flat_map(|types| types.values_mut())
            .flat_map(|owners| owners.values_mut())
        {
            for record in records.iter_mut() {
                if record.entry.is_signed()
                    && !record.entry.is_expired()
                    && record.republished.elapsed() >= period
                {
                    record.republished = Instant::now();
                    due.push(record.entry.clone());
                }
            }
        }

        due
    }

    fn entries(&self) -> Vec<StorageEntry> {
        self.lock()
            .values()
            .flat_map(|types| types.values())
            .flat_map(|owners| owners.values())
            .flat_map(|records| live(records, false))
            .cloned()
            .collect()
    }

    fn len(&self) -> usize {
        self.entries().len()
    }
}
