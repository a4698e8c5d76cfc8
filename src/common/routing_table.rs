//! Binary trie routing table

use std::collections::BTreeMap;
use std::time::Duration;

use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, trace};

use crate::common::{Bucket, Contact, Id, Liveness};
use crate::Config;

/// Liveness filter of [RoutingTable::select].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    /// Alive contacts, the local contact, and occasionally dead contacts.
    All,
    /// Alive remote contacts only.
    Alive,
    /// Alive remote contacts plus the local contact.
    AliveWithLocal,
}

/// What [RoutingTable::add] did with a contact.
#[derive(Debug, Clone, PartialEq)]
pub enum Insertion {
    /// The contact is the local node.
    Local,
    /// The contact was already known and is now marked as just seen.
    Refreshed,
    /// The contact took a free slot.
    Inserted,
    /// The contact replaced a dead one, which is returned.
    Replaced(Contact),
    /// The bucket is full, the contact went to its replacement cache.
    ///
    /// The caller should ping `probe`, the least recently seen contact of the bucket,
    /// so a dead node gets detected and replaced.
    Cached { probe: Option<Contact> },
}

/// What [RoutingTable::handle_failure] did with a failure.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Unknown or local id.
    Ignored,
    /// The failure was counted, the contact stays where it is.
    Recorded(Liveness),
    /// The dead contact was dropped, optionally replaced from the cache.
    Evicted { replacement: Option<Id> },
    /// Too many consecutive failures across the table; the node should stop.
    Disconnected,
}

/// Kademlia routing table organized as a binary trie of [Bucket]s.
///
/// Only the leaves are stored, keyed by their prefix. Leaves partition the id
/// space into contiguous ranges, so the bucket owning an id is the one with
/// the greatest prefix not above it.
#[derive(Debug)]
pub struct RoutingTable {
    local: Contact,
    buckets: BTreeMap<Id, Bucket>,
    /// Prefix of the bucket off the local node's path that may still split.
    designated: Option<Id>,
    b: usize,
    max_accept_node_failures: u32,
    max_consecutive_failures: u32,
    consecutive_failures: u32,
    rng: StdRng,
}

impl RoutingTable {
    /// Create a new [RoutingTable] holding only the local contact.
    pub fn new(local: Contact, config: &Config) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut root = Bucket::new(Id::MIN, 0, config.k, config.cache_capacity());
        root.insert(local.clone());

        let mut buckets = BTreeMap::new();
        buckets.insert(Id::MIN, root);

        RoutingTable {
            local,
            buckets,
            designated: None,
            b: config.b,
            max_accept_node_failures: config.max_accept_node_failures,
            max_consecutive_failures: config.max_consecutive_failures,
            consecutive_failures: 0,
            rng,
        }
    }

    // === Getters ===

    /// Returns the [Id] of this node.
    pub fn id(&self) -> &Id {
        self.local.id()
    }

    pub fn local(&self) -> &Contact {
        &self.local
    }

    /// Leaf buckets, in ascending prefix order.
    pub fn buckets(&self) -> impl Iterator<Item = &Bucket> {
        self.buckets.values()
    }

    /// Number of remote contacts in active buckets.
    pub fn size(&self) -> usize {
        self.buckets.values().map(Bucket::len).sum::<usize>() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Owned copies of all remote contacts in active buckets.
    pub fn contacts(&self) -> Vec<Contact> {
        self.buckets
            .values()
            .flat_map(|bucket| bucket.contacts().iter())
            .filter(|c| c.id() != self.local.id())
            .cloned()
            .collect()
    }

    pub fn contains(&self, id: &Id) -> bool {
        id != self.local.id() && self.bucket(id).contains(id)
    }

    pub fn get(&self, id: &Id) -> Option<Contact> {
        self.bucket(id).get(id).cloned()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Returns true if the bucket with this prefix may split although it is off
    /// the local node's path.
    pub fn is_designated(&self, prefix: &Id) -> bool {
        self.designated.as_ref() == Some(prefix)
    }

    // === Public Methods ===

    /// Adds or refreshes a contact that just proved to be alive.
    pub fn add(&mut self, mut contact: Contact) -> Insertion {
        if contact.id() == self.local.id() {
            return Insertion::Local;
        }

        self.consecutive_failures = 0;
        contact.refresh();

        let id = *contact.id();
        let max_depth = self.b;

        loop {
            let (prefix, can_split) = {
                let bucket = self.bucket_mut(&id);

                if bucket.refresh(&id, contact.address()) {
                    bucket.touch();
                    return Insertion::Refreshed;
                }
                if !bucket.is_full() {
                    bucket.insert(contact);
                    bucket.touch();
                    trace!(?id, "Inserted contact");
                    return Insertion::Inserted;
                }

                (*bucket.prefix(), bucket.depth() < max_depth)
            };

            let splittable = can_split
                && (self.bucket(&id).covers(self.local.id()) || self.is_designated(&prefix));

            if !splittable {
                break;
            }

            self.split(&prefix);
        }

        self.replace_contact_in_bucket(contact)
    }

    /// Up to `count` contacts ordered by ascending XOR distance to `target`.
    pub fn select(&mut self, target: &Id, count: usize, mode: SelectMode) -> Vec<Contact> {
        let mut buckets: Vec<&Bucket> = self.buckets.values().collect();

        // Disjoint leaves diverge before either depth, so their masked prefix
        // distance orders every id they hold.
        buckets.sort_by_key(|bucket| bucket.prefix().xor(&target.prefix(bucket.depth())));

        let local = *self.local.id();
        let threshold = self.max_accept_node_failures;
        let rng = &mut self.rng;

        let mut selected = Vec::with_capacity(count);

        for bucket in buckets {
            if selected.len() >= count {
                break;
            }

            let mut contacts: Vec<&Contact> = bucket
                .contacts()
                .iter()
                .filter(|contact| {
                    let is_local = contact.id() == &local;

                    match mode {
                        SelectMode::Alive => contact.is_alive() && !is_local,
                        SelectMode::AliveWithLocal => contact.is_alive() || is_local,
                        SelectMode::All => {
                            is_local
                                || contact.is_alive()
                                || rng.gen::<f64>() < retry_probability(contact, threshold)
                        }
                    }
                })
                .collect();

            contacts.sort_by_key(|contact| contact.id().xor(target));

            selected.extend(
                contacts
                    .into_iter()
                    .take(count - selected.len())
                    .cloned(),
            );
        }

        selected
    }

    /// Records a failed exchange with `id`.
    ///
    /// A contact reaching the failure threshold is replaced by the most recent
    /// cached contact of its bucket. With an empty cache it is not removed but
    /// kept as [Liveness::Dead]: selection in [SelectMode::Alive] skips it, and
    /// the next newcomer for that bucket takes its slot.
    pub fn handle_failure(&mut self, id: &Id) -> FailureOutcome {
        if id == self.local.id() {
            return FailureOutcome::Ignored;
        }

        let threshold = self.max_accept_node_failures;
        let bucket = self.bucket_mut(id);

        let outcome = if let Some(contact) = bucket.get_mut(id) {
            contact.handle_failure(threshold);

            if contact.is_alive() {
                FailureOutcome::Recorded(Liveness::Alive)
            } else if let Some(replacement) = bucket.take_most_recent_cached() {
                let replacement_id = *replacement.id();
                bucket.replace(id, replacement);
                debug!(?id, ?replacement_id, "Replaced dead contact");

                FailureOutcome::Evicted {
                    replacement: Some(replacement_id),
                }
            } else {
                // Nothing to promote, keep the dead contact until a newcomer
                // replaces it.
                FailureOutcome::Recorded(Liveness::Dead)
            }
        } else if let Some(contact) = bucket.cached_mut(id) {
            contact.handle_failure(threshold);

            if contact.is_alive() {
                FailureOutcome::Recorded(Liveness::Alive)
            } else {
                bucket.cache_remove(id);
                FailureOutcome::Evicted { replacement: None }
            }
        } else {
            return FailureOutcome::Ignored;
        };

        self.consecutive_failures += 1;

        if self.consecutive_failures >= self.max_consecutive_failures {
            return FailureOutcome::Disconnected;
        }

        outcome
    }

    /// Remove a remote contact from the active buckets.
    pub fn remove(&mut self, id: &Id) -> Option<Contact> {
        if id == self.local.id() {
            return None;
        }

        let bucket = self.bucket_mut(id);
        let removed = bucket.remove(id);

        if removed.is_some() {
            if let Some(replacement) = bucket.take_most_recent_cached() {
                bucket.insert(replacement);
            }
        }

        removed
    }

    /// Replaces dead contacts from the replacement caches, returning the dropped ids.
    pub fn purge(&mut self) -> Vec<Id> {
        self.buckets
            .values_mut()
            .flat_map(|bucket| bucket.purge())
            .collect()
    }

    /// Random lookup targets inside every bucket idle for at least `period`.
    ///
    /// Those buckets count as refreshed from now on.
    pub fn refresh_targets(&mut self, period: Duration) -> Vec<Id> {
        self.buckets
            .values_mut()
            .filter(|bucket| bucket.needs_refresh(period))
            .map(|bucket| {
                bucket.touch();
                bucket.random_id()
            })
            .collect()
    }

    /// Marks the bucket owning `id` as refreshed.
    pub fn touch(&mut self, id: &Id) {
        self.bucket_mut(id).touch();
    }

    // === Private Methods ===

    fn bucket(&self, id: &Id) -> &Bucket {
        match self.buckets.range(..=*id).next_back() {
            Some((_, bucket)) => bucket,
            // The root prefix is all zeros and leaves always cover the id space.
            None => unreachable!("routing table has no bucket at the minimum prefix"),
        }
    }

    fn bucket_mut(&mut self, id: &Id) -> &mut Bucket {
        match self.buckets.range_mut(..=*id).next_back() {
            Some((_, bucket)) => bucket,
            None => unreachable!("routing table has no bucket at the minimum prefix"),
        }
    }

    fn split(&mut self, prefix: &Id) {
        let Some(bucket) = self.buckets.remove(prefix) else {
            return;
        };

        let holds_local = bucket.covers(self.local.id());
        let was_designated = self.is_designated(prefix);

        let (left, right) = bucket.split();

        trace!(
            prefix = ?left.prefix(),
            depth = left.depth(),
            left = left.len(),
            right = right.len(),
            "Split bucket"
        );

        if holds_local {
            let sibling = if left.covers(self.local.id()) {
                *right.prefix()
            } else {
                *left.prefix()
            };
            self.designated = Some(sibling);
        } else if was_designated {
            self.designated = None;
        }

        self.buckets.insert(*left.prefix(), left);
        self.buckets.insert(*right.prefix(), right);
    }

    fn replace_contact_in_bucket(&mut self, contact: Contact) -> Insertion {
        let local = *self.local.id();
        let bucket = self.bucket_mut(contact.id());

        let lrs = bucket.least_recently_seen(&local).cloned();

        match lrs {
            Some(lrs) if !lrs.is_alive() => {
                bucket.replace(lrs.id(), contact);
                debug!(evicted = ?lrs.id(), "Replaced dead contact with newcomer");

                Insertion::Replaced(lrs)
            }
            probe => {
                bucket.cache_put(contact);

                Insertion::Cached { probe }
            }
        }
    }
}

/// Chance that a dead contact is handed out again by [SelectMode::All].
///
/// Starts at one half when the contact just crossed the threshold and decays
/// as failures keep piling up.
fn retry_probability(contact: &Contact, threshold: u32) -> f64 {
    let threshold = f64::from(threshold.max(1));
    threshold / (threshold + f64::from(contact.failures()))
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::*;

    fn config() -> Config {
        Config {
            k: 4,
            cache_size: 2,
            rng_seed: Some(7),
            ..Default::default()
        }
    }

    fn table(config: &Config) -> RoutingTable {
        RoutingTable::new(Contact::random(), config)
    }

    fn assert_invariants(table: &RoutingTable, config: &Config) {
        for bucket in table.buckets() {
            assert!(bucket.len() <= config.k);
            assert!(bucket.cache_len() <= config.cache_size);
            for contact in bucket.contacts() {
                assert!(bucket.covers(contact.id()));
            }
            for contact in bucket.cached() {
                assert!(bucket.covers(contact.id()));
            }
        }

        let designated = table
            .buckets()
            .filter(|b| table.is_designated(b.prefix()))
            .collect::<Vec<_>>();
        assert!(designated.len() <= 1);
        if table.buckets().count() == 1 {
            assert!(designated.is_empty());
        }

        // The designated bucket hangs right off the local node's path.
        for bucket in designated {
            let depth = bucket.depth();
            assert!(depth > 0);
            assert_eq!(table.id().shared_prefix_len(bucket.prefix()), depth - 1);
        }
    }

    #[test]
    fn local_contact_is_never_added_twice() {
        let config = config();
        let mut table = table(&config);
        let local = table.local().clone();

        assert_eq!(table.add(local), Insertion::Local);
        assert_eq!(table.size(), 0);
        assert!(table.is_empty());
    }

    #[test]
    fn add_refreshes_known_contacts() {
        let config = config();
        let mut table = table(&config);
        let contact = Contact::random();

        assert_eq!(table.add(contact.clone()), Insertion::Inserted);
        assert_eq!(table.add(contact.clone()), Insertion::Refreshed);
        assert_eq!(table.size(), 1);
        assert!(table.contains(contact.id()));
    }

    #[test]
    fn invariants_hold_under_many_adds() {
        let config = config();
        let mut table = table(&config);

        for _ in 0..500 {
            table.add(Contact::random());
            assert_invariants(&table, &config);
        }

        assert!(table.buckets().count() > 1);
        assert!(table.buckets().any(|b| b.covers(table.id())));
    }

    #[test]
    fn split_happens_on_local_path_only() {
        let config = Config {
            k: 2,
            ..config()
        };
        let local = Id::from_str("0000000000000000000000000000000000000000").unwrap();
        let mut table = RoutingTable::new(Contact::random().with_id(local), &config);

        // Three contacts in the far half: the root splits, the far half gets
        // designated and splits once, the resulting buckets stay put.
        for prefix in ["80", "c0", "e0", "f0", "f8"] {
            let id = Id::from_str(&format!("{prefix}00000000000000000000000000000000000001"))
                .unwrap();
            table.add(Contact::random().with_id(id));
            assert_invariants(&table, &config);
        }

        let depths: Vec<usize> = table.buckets().map(Bucket::depth).collect();
        assert!(depths.iter().all(|d| *d <= 2));
        assert_eq!(table.size() + table.buckets().map(Bucket::cache_len).sum::<usize>(), 5);
    }

    #[test]
    fn local_path_split_designates_the_sibling() {
        let config = Config {
            k: 2,
            ..config()
        };
        let local = Id::from_str("0000000000000000000000000000000000000000").unwrap();
        let mut table = RoutingTable::new(Contact::random().with_id(local), &config);
        let id = |hex: &str| Id::from_str(hex).unwrap();

        table.add(Contact::random().with_id(id("8000000000000000000000000000000000000001")));
        table.add(Contact::random().with_id(id("c000000000000000000000000000000000000001")));
        assert_eq!(table.buckets().count(), 1);

        // A near contact splits the full root: the far half becomes designated.
        table.add(Contact::random().with_id(id("4000000000000000000000000000000000000001")));
        assert_invariants(&table, &config);

        let designated: Vec<&Id> = table
            .buckets()
            .map(Bucket::prefix)
            .filter(|prefix| table.is_designated(prefix))
            .collect();
        assert_eq!(designated, vec![&id("8000000000000000000000000000000000000000")]);
        assert_eq!(table.size(), 3);

        // Splitting the local half again moves the designation down the path.
        table.add(Contact::random().with_id(id("2000000000000000000000000000000000000001")));
        table.add(Contact::random().with_id(id("1000000000000000000000000000000000000001")));
        assert_invariants(&table, &config);

        let designated: Vec<&Id> = table
            .buckets()
            .map(Bucket::prefix)
            .filter(|prefix| table.is_designated(prefix))
            .collect();
        assert_eq!(designated.len(), 1);
        assert_eq!(table.id().shared_prefix_len(designated[0]), 1);
    }

    #[test]
    fn select_is_sorted_and_bounded() {
        let config = config();
        let mut table = table(&config);

        for _ in 0..200 {
            table.add(Contact::random());
        }

        for _ in 0..20 {
            let target = Id::random();
            let selected = table.select(&target, 10, SelectMode::Alive);

            assert!(selected.len() <= 10);
            assert!(selected.iter().all(|c| c.is_alive() && c.id() != table.id()));

            let distances: Vec<Id> = selected.iter().map(|c| c.id().xor(&target)).collect();
            let mut sorted = distances.clone();
            sorted.sort();
            assert_eq!(distances, sorted);

            // Nothing closer was left out.
            let mut all: Vec<Id> = table
                .contacts()
                .iter()
                .map(|c| c.id().xor(&target))
                .collect();
            all.sort();
            assert_eq!(&all[..selected.len()], &distances[..]);
        }
    }

    #[test]
    fn select_modes_and_local() {
        let config = config();
        let mut table = table(&config);
        let local = *table.id();
        table.add(Contact::random());

        let with_local = table.select(&local, 5, SelectMode::AliveWithLocal);
        assert_eq!(with_local.len(), 2);
        assert_eq!(with_local[0].id(), &local);

        let without = table.select(&local, 5, SelectMode::Alive);
        assert_eq!(without.len(), 1);
    }

    #[test]
    fn dead_contacts_are_retried_only_in_all_mode() {
        let config = config();
        let mut table = table(&config);
        let contact = Contact::random();
        table.add(contact.clone());

        for _ in 0..config.max_accept_node_failures {
            table.handle_failure(contact.id());
        }

        assert_eq!(table.get(contact.id()).unwrap().liveness(), Liveness::Dead);
        assert!(table
            .select(contact.id(), 5, SelectMode::Alive)
            .iter()
            .all(|c| c.id() != contact.id()));

        let mut seen = 0;
        for _ in 0..64 {
            if table
                .select(contact.id(), 5, SelectMode::All)
                .iter()
                .any(|c| c.id() == contact.id())
            {
                seen += 1;
            }
        }
        assert!(seen > 0 && seen < 64);
    }

    #[test]
    fn failures_promote_cached_contacts() {
        let config = Config { k: 1, b: 1, ..config() };
        let local = Id::from_str("0000000000000000000000000000000000000000").unwrap();
        let mut table = RoutingTable::new(Contact::random().with_id(local), &config);

        let far = |byte: &str| {
            Contact::random().with_id(
                Id::from_str(&format!("{byte}00000000000000000000000000000000000000")).unwrap(),
            )
        };

        let first = far("80");
        let second = far("90");

        assert_eq!(table.add(first.clone()), Insertion::Inserted);
        assert!(matches!(
            table.add(second.clone()),
            Insertion::Cached { probe: Some(p) } if p.id() == first.id()
        ));

        for _ in 0..config.max_accept_node_failures - 1 {
            assert_eq!(
                table.handle_failure(first.id()),
                FailureOutcome::Recorded(Liveness::Alive)
            );
        }
        assert_eq!(
            table.handle_failure(first.id()),
            FailureOutcome::Evicted {
                replacement: Some(*second.id())
            }
        );
        assert!(table.contains(second.id()));
        assert!(!table.contains(first.id()));
    }

    #[test]
    fn dead_contact_is_replaced_by_newcomer() {
        let config = Config { k: 1, b: 1, ..config() };
        let local = Id::from_str("0000000000000000000000000000000000000000").unwrap();
        let mut table = RoutingTable::new(Contact::random().with_id(local), &config);

        let dead = Contact::random()
            .with_id(Id::from_str("8000000000000000000000000000000000000000").unwrap());
        let newcomer = Contact::random()
            .with_id(Id::from_str("a000000000000000000000000000000000000000").unwrap());

        table.add(dead.clone());
        for _ in 0..config.max_accept_node_failures - 1 {
            table.handle_failure(dead.id());
        }

        // Nothing cached to promote: the dead contact keeps its slot.
        assert_eq!(
            table.handle_failure(dead.id()),
            FailureOutcome::Recorded(Liveness::Dead)
        );
        assert!(table.contains(dead.id()));

        assert!(matches!(table.add(newcomer.clone()), Insertion::Replaced(c) if c.id() == dead.id()));
        assert!(table.contains(newcomer.id()));
    }

    #[test]
    fn consecutive_failures_disconnect() {
        let config = Config {
            max_consecutive_failures: 5,
            max_accept_node_failures: 100,
            ..config()
        };
        let mut table = table(&config);
        let contact = Contact::random();
        table.add(contact.clone());

        for _ in 0..4 {
            assert!(matches!(
                table.handle_failure(contact.id()),
                FailureOutcome::Recorded(_)
            ));
        }
        assert_eq!(
            table.handle_failure(contact.id()),
            FailureOutcome::Disconnected
        );

        table.add(contact);
        assert_eq!(table.consecutive_failures(), 0);
    }

    #[test]
    fn refresh_targets_fall_inside_stale_buckets() {
        let config = config();
        let mut table = table(&config);
        for _ in 0..100 {
            table.add(Contact::random());
        }

        let targets = table.refresh_targets(Duration::ZERO);
        assert_eq!(targets.len(), table.buckets().count());

        for target in targets {
            assert!(table.buckets().filter(|b| b.covers(&target)).count() == 1);
        }

        assert!(table.refresh_targets(Duration::from_secs(60)).is_empty());
    }
}
