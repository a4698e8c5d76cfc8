//! Content reads over the network.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::common::{FindValueRequest, Id};
use crate::rpc::Rpc;
use crate::storage::{ContentFilter, StorageEntry};

use super::lookup::{Found, IterativeQuery, QueryRequest};

/// Collected entries, deduplicated by submission.
///
/// With `recent` set, only the newest entry of each owner and content type
/// is kept, whichever node reported it.
#[derive(Debug, Default)]
struct Collected {
    entries: Vec<StorageEntry>,
    recent: bool,
}

impl Collected {
    fn new(filter: &ContentFilter) -> Self {
        Collected {
            entries: Vec::new(),
            recent: filter.recent,
        }
    }

    fn extend(&mut self, entries: Vec<StorageEntry>) {
        for entry in entries {
            if self.recent {
                self.keep_newest(entry);
            } else if !self
                .entries
                .iter()
                .any(|known| known.same_submission(&entry))
            {
                self.entries.push(entry);
            }
        }
    }

    fn keep_newest(&mut self, entry: StorageEntry) {
        match self
            .entries
            .iter_mut()
            .find(|known| known.owner == entry.owner && known.content_type == entry.content_type)
        {
            Some(known) if known.timestamp < entry.timestamp => *known = entry,
            Some(_) => {}
            None => self.entries.push(entry),
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    /// Newest first, at most `n`.
    fn finish(mut self, n: usize) -> Vec<StorageEntry> {
        self.entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        self.entries.truncate(n);
        self.entries
    }
}

/// Up to `n` validated entries of `key`, checking local storage first and
/// stopping as soon as `n` entries are collected.
pub(crate) fn get(rpc: Arc<Rpc>, key: Id, filter: ContentFilter, n: usize) -> Vec<StorageEntry> {
    let mut collected = Collected::new(&filter);

    if let Some(local) = rpc.storage().get(&key, &filter) {
        collected.extend(validate(&rpc, local));
    }

    if collected.len() >= n {
        return collected.finish(n);
    }

    let request = QueryRequest::FindValue(FindValueRequest {
        key,
        filter,
        counters_only: false,
    });
    let validator = rpc.clone();

    IterativeQuery::new(rpc, key, request).run(|from, found| {
        if let Found::Entries(entries) = found {
            let received = entries.len();
            let valid = validate(&validator, entries);

            if valid.len() < received {
                debug!(from = ?from.id(), dropped = received - valid.len(), "Dropped invalid entries");
            }
            collected.extend(valid);
        }

        collected.len() >= n
    });

    collected.finish(n)
}

/// Signed entries must verify. Unsigned ones were authenticated by the session
/// that stored them and carry no credentials to check.
fn validate(rpc: &Rpc, entries: Vec<StorageEntry>) -> Vec<StorageEntry> {
    entries
        .into_iter()
        .filter(|entry| !entry.is_signed() || rpc.security().check_entry(entry))
        .collect()
}

/// Content counters of `key`: per owner when the filter names a type, per type
/// otherwise. Replicas hold the same content, so each counter is the largest
/// value any single node reported.
pub(crate) fn get_counters(rpc: Arc<Rpc>, key: Id, filter: ContentFilter) -> BTreeMap<String, u64> {
    let mut counters = rpc.storage().get_count(&key, &filter).unwrap_or_default();

    let request = QueryRequest::FindValue(FindValueRequest {
        key,
        filter,
        counters_only: true,
    });

    IterativeQuery::new(rpc, key, request).run(|_, found| {
        if let Found::Counters(reported) = found {
            for (name, count) in reported {
                let counter = counters.entry(name).or_insert(0);
                *counter = (*counter).max(count);
            }
        }

        false
    });

    counters
}
