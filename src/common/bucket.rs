//! Prefix-addressed k-bucket with a replacement cache.

use std::{
    net::SocketAddr,
    num::NonZeroUsize,
    time::{Duration, Instant},
};

use lru::LruCache;

use crate::common::{Contact, Id, ID_BITS};

/// A leaf of the routing trie.
///
/// Holds up to `capacity` active contacts sharing the first `depth` bits of `prefix`,
/// and a bounded cache of replacements ordered from most to least recently seen.
#[derive(Debug)]
pub struct Bucket {
    prefix: Id,
    depth: usize,
    capacity: usize,
    contacts: Vec<Contact>,
    cache: LruCache<Id, Contact>,
    last_refresh: Instant,
}

impl Bucket {
    pub fn new(prefix: Id, depth: usize, capacity: usize, cache_size: NonZeroUsize) -> Self {
        Bucket {
            prefix: prefix.prefix(depth),
            depth,
            capacity,
            contacts: Vec::with_capacity(capacity),
            cache: LruCache::new(cache_size),
            last_refresh: Instant::now(),
        }
    }

    // === Getters ===

    pub fn prefix(&self) -> &Id {
        &self.prefix
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    /// Cached replacements, most recently seen first.
    pub fn cached(&self) -> impl Iterator<Item = &Contact> {
        self.cache.iter().map(|(_, contact)| contact)
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn cache_limit(&self) -> usize {
        self.cache.cap().get()
    }

    pub fn is_full(&self) -> bool {
        self.contacts.len() >= self.capacity
    }

    /// Returns true if `id` falls inside this bucket's prefix.
    pub fn covers(&self, id: &Id) -> bool {
        id.shared_prefix_len(&self.prefix) >= self.depth
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.contacts.iter().any(|c| c.id() == id)
    }

    pub fn is_cached(&self, id: &Id) -> bool {
        self.cache.contains(id)
    }

    pub fn get(&self, id: &Id) -> Option<&Contact> {
        self.contacts.iter().find(|c| c.id() == id)
    }

    pub fn needs_refresh(&self, period: Duration) -> bool {
        self.last_refresh.elapsed() >= period
    }

    // === Public Methods ===

    /// Inserts a contact if there is room. Returns false if the bucket is full.
    pub fn insert(&mut self, contact: Contact) -> bool {
        debug_assert!(self.covers(contact.id()));

        if self.is_full() {
            return false;
        }

        self.cache.pop(contact.id());
        self.contacts.push(contact);
        true
    }

    /// Marks a known contact as just seen, possibly at a new address.
    pub fn refresh(&mut self, id: &Id, address: SocketAddr) -> bool {
        match self.contacts.iter_mut().find(|c| c.id() == id) {
            Some(contact) => {
                contact.refresh();
                contact.set_address(address);
                true
            }
            None => false,
        }
    }

    pub fn get_mut(&mut self, id: &Id) -> Option<&mut Contact> {
        self.contacts.iter_mut().find(|c| c.id() == id)
    }

    pub fn cached_mut(&mut self, id: &Id) -> Option<&mut Contact> {
        self.cache.peek_mut(id)
    }

    pub fn remove(&mut self, id: &Id) -> Option<Contact> {
        let index = self.contacts.iter().position(|c| c.id() == id)?;
        Some(self.contacts.remove(index))
    }

    /// Puts a contact in the replacement cache, evicting the least recently seen
    /// entry if the cache is full.
    pub fn cache_put(&mut self, contact: Contact) {
        debug_assert!(self.covers(contact.id()));
        self.cache.put(*contact.id(), contact);
    }

    pub fn cache_remove(&mut self, id: &Id) -> Option<Contact> {
        self.cache.pop(id)
    }

    /// Removes and returns the most recently seen cached contact.
    pub fn take_most_recent_cached(&mut self) -> Option<Contact> {
        let id = *self.cache.iter().next()?.0;
        self.cache.pop(&id)
    }

    /// The active contact seen the longest time ago, never `exclude`.
    pub fn least_recently_seen(&self, exclude: &Id) -> Option<&Contact> {
        self.contacts
            .iter()
            .filter(|c| c.id() != exclude)
            .min_by_key(|c| c.last_seen())
    }

    /// Swap an active contact for a new one.
    pub fn replace(&mut self, old: &Id, new: Contact) -> Option<Contact> {
        let removed = self.remove(old)?;
        self.insert(new);
        Some(removed)
    }

    /// Drops dead contacts for which the cache has a replacement.
    ///
    /// Returns the ids of the removed contacts.
    pub fn purge(&mut self) -> Vec<Id> {
        let mut purged = Vec::new();

        while self.cache_len() > 0 {
            let Some(dead) = self.contacts.iter().find(|c| !c.is_alive()).map(|c| *c.id())
            else {
                break;
            };

            if let Some(replacement) = self.take_most_recent_cached() {
                self.replace(&dead, replacement);
                purged.push(dead);
            }
        }

        purged
    }

    pub fn touch(&mut self) {
        self.last_refresh = Instant::now();
    }

    /// Random id inside this bucket's range.
    pub fn random_id(&self) -> Id {
        Id::random_with_prefix(&self.prefix, self.depth)
    }

    /// Splits into the two children at the next prefix bit.
    ///
    /// Active and cached contacts move to the child their bit at `depth` selects.
    /// The left child keeps the prefix, the right child has the bit set.
    pub fn split(self) -> (Bucket, Bucket) {
        debug_assert!(self.depth < ID_BITS);

        let depth = self.depth;
        let cache_size = self.cache.cap();

        let mut left = Bucket::new(self.prefix, depth + 1, self.capacity, cache_size);
        let mut right = Bucket::new(
            self.prefix.with_bit_set(depth),
            depth + 1,
            self.capacity,
            cache_size,
        );

        for contact in self.contacts {
            if contact.id().bit(depth) {
                right.contacts.push(contact);
            } else {
                left.contacts.push(contact);
            }
        }

        // Least recently seen first, so the most recent ends up most recent again.
        let mut cached: Vec<(Id, Contact)> = self
            .cache
            .iter()
            .map(|(id, contact)| (*id, contact.clone()))
            .collect();
        cached.reverse();

        for (id, contact) in cached {
            if id.bit(depth) {
                right.cache.put(id, contact);
            } else {
                left.cache.put(id, contact);
            }
        }

        left.last_refresh = self.last_refresh;
        right.last_refresh = self.last_refresh;

        (left, right)
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::*;

    fn bucket(capacity: usize, cache: usize) -> Bucket {
        Bucket::new(
            Id::MIN,
            0,
            capacity,
            NonZeroUsize::new(cache).unwrap(),
        )
    }

    #[test]
    fn insert_until_full() {
        let mut bucket = bucket(2, 2);

        assert!(bucket.insert(Contact::random()));
        assert!(bucket.insert(Contact::random()));
        assert!(bucket.is_full());
        assert!(!bucket.insert(Contact::random()));
        assert_eq!(bucket.len(), 2);
    }

    #[test]
    fn cache_is_bounded_and_keeps_most_recent() {
        let mut bucket = bucket(1, 2);

        let a = Contact::random();
        let b = Contact::random();
        let c = Contact::random();

        bucket.cache_put(a.clone());
        bucket.cache_put(b.clone());
        bucket.cache_put(c.clone());

        assert_eq!(bucket.cache_len(), 2);
        assert!(!bucket.is_cached(a.id()));
        assert_eq!(bucket.take_most_recent_cached().unwrap().id(), c.id());
        assert_eq!(bucket.take_most_recent_cached().unwrap().id(), b.id());
        assert!(bucket.take_most_recent_cached().is_none());
    }

    #[test]
    fn split_partitions_by_depth_bit() {
        let mut bucket = bucket(20, 5);

        let mut ids = Vec::new();
        for _ in 0..20 {
            let contact = Contact::random();
            ids.push(*contact.id());
            bucket.insert(contact);
        }
        for _ in 0..5 {
            bucket.cache_put(Contact::random());
        }

        let (left, right) = bucket.split();

        assert_eq!(left.len() + right.len(), 20);
        assert_eq!(left.cache_len() + right.cache_len(), 5);
        assert!(left.contacts().iter().all(|c| !c.id().bit(0)));
        assert!(right.contacts().iter().all(|c| c.id().bit(0)));
        assert!(left.cached().all(|c| left.covers(c.id())));
        assert!(right.cached().all(|c| right.covers(c.id())));

        for id in ids {
            assert!(left.contains(&id) ^ right.contains(&id));
        }

        assert_eq!(left.prefix(), &Id::MIN);
        assert_eq!(
            right.prefix(),
            &Id::from_str("8000000000000000000000000000000000000000").unwrap()
        );
        assert_eq!(left.depth(), 1);
    }

    #[test]
    fn least_recently_seen_skips_excluded() {
        let mut bucket = bucket(3, 1);

        let first = Contact::random();
        let second = Contact::random();
        bucket.insert(first.clone());
        std::thread::sleep(Duration::from_millis(2));
        bucket.insert(second.clone());

        assert_eq!(bucket.least_recently_seen(&Id::MIN).unwrap().id(), first.id());
        assert_eq!(
            bucket.least_recently_seen(first.id()).unwrap().id(),
            second.id()
        );

        bucket.refresh(first.id(), first.address());
        assert_eq!(bucket.least_recently_seen(&Id::MIN).unwrap().id(), second.id());
    }

    #[test]
    fn purge_replaces_dead_contacts_from_cache() {
        let mut bucket = bucket(2, 2);

        let dead = Contact::random();
        let alive = Contact::random();
        let spare = Contact::random();

        bucket.insert(dead.clone());
        bucket.insert(alive.clone());
        bucket.cache_put(spare.clone());
        bucket.get_mut(dead.id()).unwrap().handle_failure(1);

        assert_eq!(bucket.purge(), vec![*dead.id()]);
        assert!(bucket.contains(spare.id()));
        assert!(bucket.contains(alive.id()));
        assert!(!bucket.contains(dead.id()));
        assert_eq!(bucket.cache_len(), 0);
    }
}
