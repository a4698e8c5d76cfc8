use std::{num::NonZeroUsize, time::Duration};

use crate::{common::ID_BITS, Error, Result};

/// Default request timeout before abandoning a session with a non-responding node.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000);
/// Largest content payload carried by a single message.
pub const DEFAULT_MAX_CONTENT_SIZE: usize = 64000;
/// Largest UDP payload we will ever try to send or receive.
pub const MAX_DATAGRAM_SIZE: usize = 65507;

#[derive(Debug, Clone)]
/// Node configuration
pub struct Config {
    /// Bucket size and replication factor.
    ///
    /// Defaults to `20`
    pub k: usize,
    /// Parallel requests per lookup round.
    ///
    /// Defaults to `3`
    pub alpha: usize,
    /// Depth bound, in bits, of the routing trie.
    ///
    /// Buckets off the local node's path never split past this depth.
    ///
    /// Defaults to `160`
    pub b: usize,
    /// Capacity of each bucket's replacement cache.
    ///
    /// Defaults to `10`
    pub cache_size: usize,
    /// Timeout of each phase of a session.
    ///
    /// The longer this duration is, the longer lookups take when nodes are unresponsive.
    /// The shorter it is, the more replies from busy nodes are missed.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
    /// A bucket without activity for this long gets a refresh lookup.
    ///
    /// Defaults to `15` minutes
    pub bucket_refresh_period: Duration,
    /// How often the refresher looks for stale buckets.
    ///
    /// Defaults to `60` seconds
    pub refresher_interval: Duration,
    /// Failed exchanges after which a contact is considered dead.
    ///
    /// Defaults to `3`
    pub max_accept_node_failures: u32,
    /// Consecutive failures, across all contacts, after which the node
    /// considers itself disconnected and shuts down.
    ///
    /// Defaults to `20`
    pub max_consecutive_failures: u32,
    /// Largest content payload accepted for a single store.
    ///
    /// Defaults to [DEFAULT_MAX_CONTENT_SIZE]
    pub max_content_size: usize,
    /// Time to live of content stored without an explicit one.
    ///
    /// Defaults to `1` hour
    pub default_ttl: Duration,
    /// Upper bound of any requested time to live.
    ///
    /// Defaults to `7` days
    pub max_ttl: Duration,
    /// How often expired content is dropped and old content republished.
    ///
    /// Defaults to `60` seconds
    pub storage_cleaner_interval: Duration,
    /// Age after which locally stored signed content is stored again on the network.
    ///
    /// Defaults to `1` hour
    pub republish_period: Duration,
    /// Content type used when none is given.
    ///
    /// Defaults to `"text"`
    pub default_content_type: String,
    /// Seed for the routing table's random retries of dead contacts.
    ///
    /// Defaults to None, where the generator is seeded from entropy.
    pub rng_seed: Option<u64>,
}

impl Config {
    /// Checks that the values can drive a node.
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(Error::InvalidConfig("k must be at least 1"));
        }
        if self.alpha == 0 {
            return Err(Error::InvalidConfig("alpha must be at least 1"));
        }
        if self.cache_size == 0 {
            return Err(Error::InvalidConfig("cache_size must be at least 1"));
        }
        if self.b == 0 || self.b > ID_BITS {
            return Err(Error::InvalidConfig("b must be within 1..=160"));
        }
        if self.max_content_size > MAX_DATAGRAM_SIZE {
            return Err(Error::InvalidConfig(
                "max_content_size exceeds the datagram limit",
            ));
        }
        if self.max_accept_node_failures == 0 {
            return Err(Error::InvalidConfig(
                "max_accept_node_failures must be at least 1",
            ));
        }

        Ok(())
    }

    pub(crate) fn cache_capacity(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.cache_size).unwrap_or(NonZeroUsize::MIN)
    }

    /// Time to live clamped to [Config::max_ttl].
    pub(crate) fn clamp_ttl(&self, ttl: Option<Duration>) -> Duration {
        ttl.unwrap_or(self.default_ttl).min(self.max_ttl)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            k: 20,
            alpha: 3,
            b: ID_BITS,
            cache_size: 10,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            bucket_refresh_period: Duration::from_secs(15 * 60),
            refresher_interval: Duration::from_secs(60),
            max_accept_node_failures: 3,
            max_consecutive_failures: 20,
            max_content_size: DEFAULT_MAX_CONTENT_SIZE,
            default_ttl: Duration::from_secs(60 * 60),
            max_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            storage_cleaner_interval: Duration::from_secs(60),
            republish_period: Duration::from_secs(60 * 60),
            default_content_type: "text".to_string(),
            rng_seed: None,
        }
    }
}
