//! Periodic routing table refresh and storage cleanup.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::common::StoreRequest;
use crate::query::{lookup, put};
use crate::rpc::{Config, Rpc};

/// How often the maintenance thread wakes up to check timers and shutdown.
const TICK: Duration = Duration::from_millis(100);

/// Maintenance timers
#[derive(Debug)]
pub(crate) struct Maintenance {
    refresher_interval: Duration,
    storage_cleaner_interval: Duration,
    last_refresh: Instant,
    last_cleanup: Instant,
}

/// Decisions about what maintenance to run now
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct MaintenanceDecisions {
    /// Purge dead contacts and look up random ids in idle buckets.
    pub should_refresh: bool,
    /// Drop expired content and republish old signed content.
    pub should_clean: bool,
}

impl Maintenance {
    pub fn new(config: &Config) -> Self {
        let now = Instant::now();

        Maintenance {
            refresher_interval: config.refresher_interval,
            storage_cleaner_interval: config.storage_cleaner_interval,
            last_refresh: now,
            last_cleanup: now,
        }
    }

    /// Determine what maintenance operations should be performed.
    ///
    /// Resets the timers of the operations that are due.
    pub fn decisions(&mut self) -> MaintenanceDecisions {
        self.decisions_at(Instant::now())
    }

    fn decisions_at(&mut self, now: Instant) -> MaintenanceDecisions {
        let should_refresh = now.saturating_duration_since(self.last_refresh) >= self.refresher_interval;
        let should_clean =
            now.saturating_duration_since(self.last_cleanup) >= self.storage_cleaner_interval;

        if should_refresh {
            self.last_refresh = now;
        }
        if should_clean {
            self.last_cleanup = now;
        }

        MaintenanceDecisions {
            should_refresh,
            should_clean,
        }
    }
}

/// Maintenance loop, runs until the node shuts down.
pub(crate) fn run(rpc: Arc<Rpc>) {
    let mut maintenance = Maintenance::new(rpc.config());

    while !rpc.is_shutdown() {
        thread::sleep(TICK);

        let decisions = maintenance.decisions();

        if decisions.should_refresh {
            refresh_buckets(&rpc);
        }
        if decisions.should_clean {
            clean_storage(&rpc);
        }
    }

    debug!(id = ?rpc.id(), "Maintenance stopped");
}

/// Replaces dead contacts from the caches and looks up a random id in every
/// bucket idle for longer than the refresh period.
pub(crate) fn refresh_buckets(rpc: &Arc<Rpc>) {
    let (purged, targets) = {
        let mut table = rpc.routing_table();
        let purged = table.purge();
        (purged, table.refresh_targets(rpc.config().bucket_refresh_period))
    };

    trace!(purged = purged.len(), targets = targets.len(), "Refreshing buckets");

    for target in targets {
        if rpc.is_shutdown() {
            return;
        }
        lookup(rpc.clone(), target);
    }
}

/// Drops expired content and stores signed content due for republishing
/// again at the nodes closest to its key.
pub(crate) fn clean_storage(rpc: &Arc<Rpc>) {
    let removed = rpc.storage().remove_expired();
    let due = rpc
        .storage()
        .due_for_republish(rpc.config().republish_period);

    trace!(removed, republish = due.len(), "Cleaning storage");

    for entry in due {
        if rpc.is_shutdown() {
            return;
        }

        let key = entry.key;
        let request = StoreRequest {
            entries: vec![entry],
            signed: true,
        };
        let stored = put(rpc.clone(), key, request);
        trace!(?key, stored, "Republished entry");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            refresher_interval: Duration::from_secs(60),
            storage_cleaner_interval: Duration::from_secs(40),
            ..Default::default()
        }
    }

    #[test]
    fn nothing_due_right_away() {
        let mut maintenance = Maintenance::new(&config());

        assert_eq!(
            maintenance.decisions(),
            MaintenanceDecisions {
                should_refresh: false,
                should_clean: false,
            }
        );
    }

    #[test]
    fn due_jobs_reset_their_timers() {
        let mut maintenance = Maintenance::new(&config());
        let start = maintenance.last_refresh;

        // Add to Instant::now() instead of subtracting, Instant may be close
        // to its epoch on some platforms.
        let later = start + Duration::from_secs(41);
        let decisions = maintenance.decisions_at(later);

        assert!(!decisions.should_refresh);
        assert!(decisions.should_clean);
        assert_eq!(maintenance.last_cleanup, later);
        assert_eq!(maintenance.last_refresh, start);

        let much_later = start + Duration::from_secs(61);
        let decisions = maintenance.decisions_at(much_later);

        assert!(decisions.should_refresh);
        assert!(!decisions.should_clean);
        assert_eq!(maintenance.last_refresh, much_later);
    }
}
