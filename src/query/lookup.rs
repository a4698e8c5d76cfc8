//! Iterative parallel lookup shared by node lookups and content reads.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::common::{Contact, FindValueRequest, FindValueResponse, Id, SelectMode};
use crate::rpc::Rpc;
use crate::storage::StorageEntry;
use crate::TaskError;

use super::ClosestNodes;

/// Slack on top of the two session phases before a round stops waiting.
const ROUND_MARGIN: Duration = Duration::from_millis(50);

/// What each visited contact is asked.
#[derive(Debug, Clone)]
pub(crate) enum QueryRequest {
    FindNode,
    FindValue(FindValueRequest),
}

/// Content a visited contact returned instead of closer contacts.
#[derive(Debug, Clone)]
pub(crate) enum Found {
    Entries(Vec<StorageEntry>),
    Counters(BTreeMap<String, u64>),
}

/// An iterative process of concurrently sending a request to the closest known
/// contacts of the target, merging closer contacts from their replies, and
/// repeating until the closest known contact stops improving.
#[derive(Debug)]
pub(crate) struct IterativeQuery {
    rpc: Arc<Rpc>,
    request: QueryRequest,
    shortlist: ClosestNodes,
    responders: ClosestNodes,
    queried: HashSet<Id>,
    failed: HashSet<Id>,
}

impl IterativeQuery {
    pub fn new(rpc: Arc<Rpc>, target: Id, request: QueryRequest) -> Self {
        trace!(?target, ?request, "New query");

        Self {
            rpc,
            request,
            shortlist: ClosestNodes::new(target),
            responders: ClosestNodes::new(target),
            queried: HashSet::new(),
            failed: HashSet::new(),
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        self.shortlist.target()
    }

    // === Public Methods ===

    /// Runs the query to completion and returns the K closest contacts that replied.
    ///
    /// `on_found` sees every piece of content returned along the way and may
    /// stop the query early by returning true.
    pub fn run(mut self, mut on_found: impl FnMut(&Contact, Found) -> bool) -> Vec<Contact> {
        let k = self.rpc.config().k;
        let alpha = self.rpc.config().alpha;
        let target = self.target();

        let seeds = self
            .rpc
            .routing_table()
            .select(&target, k, SelectMode::Alive);
        for contact in seeds {
            self.add_candidate(contact);
        }

        if self.shortlist.is_empty() {
            debug!(?target, "No known contacts to query");
            return Vec::new();
        }

        let mut closest = self.shortlist.closest_distance();

        loop {
            let batch = self.next_batch(alpha);
            if batch.is_empty() {
                break;
            }

            if self.visit(batch, &mut on_found) {
                return self.finish();
            }

            let improved = match (self.shortlist.closest_distance(), closest) {
                (Some(now), Some(before)) => now < before,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if !improved {
                break;
            }
            closest = self.shortlist.closest_distance();
        }

        // One more round over the top K if too few of them were heard from.
        if self.responders.len() < k {
            let batch = self.next_batch(k);
            if !batch.is_empty() && self.visit(batch, &mut on_found) {
                return self.finish();
            }
        }

        self.finish()
    }

    // === Private Methods ===

    fn add_candidate(&mut self, contact: Contact) {
        if contact.id() == self.rpc.id() || self.failed.contains(contact.id()) {
            return;
        }

        self.shortlist.add(contact);
    }

    /// Up to `limit` unqueried contacts among the K closest candidates.
    fn next_batch(&self, limit: usize) -> Vec<Contact> {
        self.shortlist
            .contacts()
            .iter()
            .take(self.rpc.config().k)
            .filter(|contact| !self.queried.contains(contact.id()))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Queries `batch` in parallel and merges the replies arriving within the
    /// round's budget. Returns true if `on_found` asked to stop.
    fn visit(
        &mut self,
        batch: Vec<Contact>,
        on_found: &mut impl FnMut(&Contact, Found) -> bool,
    ) -> bool {
        let (sender, receiver) = flume::unbounded();
        let target = self.target();

        for contact in &batch {
            self.queried.insert(*contact.id());

            let rpc = self.rpc.clone();
            let request = self.request.clone();
            let to = contact.clone();
            let thread_sender = sender.clone();

            let spawned = thread::Builder::new()
                .name("authdht-query".to_string())
                .spawn(move || {
                    let outcome = match request {
                        QueryRequest::FindNode => rpc
                            .find_node(&to, target)
                            .map(FindValueResponse::Contacts),
                        QueryRequest::FindValue(request) => rpc.find_value(&to, request),
                    };
                    let _ = thread_sender.send((to, outcome));
                });

            if let Err(error) = spawned {
                let _ = sender.send((contact.clone(), Err(TaskError::Spawn(error.to_string()))));
            }
        }
        drop(sender);

        let deadline = Instant::now() + self.rpc.config().request_timeout * 2 + ROUND_MARGIN;
        let mut silent: HashSet<Id> = batch.iter().map(|contact| *contact.id()).collect();
        let mut stop = false;

        while !silent.is_empty() && !stop {
            let Ok((contact, outcome)) = receiver.recv_deadline(deadline) else {
                break;
            };
            silent.remove(contact.id());

            match outcome {
                Ok(FindValueResponse::Contacts(contacts)) => {
                    self.responders.add(contact);
                    for candidate in contacts {
                        self.add_candidate(candidate);
                    }
                }
                Ok(FindValueResponse::Entries(entries)) => {
                    stop = on_found(&contact, Found::Entries(entries));
                    self.responders.add(contact);
                }
                Ok(FindValueResponse::Counters(counters)) => {
                    stop = on_found(&contact, Found::Counters(counters));
                    self.responders.add(contact);
                }
                Err(error) => {
                    trace!(id = ?contact.id(), ?error, "Dropping unresponsive contact");
                    self.failed.insert(*contact.id());
                    self.shortlist.remove(contact.id());
                }
            }
        }

        // Contacts still silent when the budget ran out are not queried again.
        for id in silent {
            self.failed.insert(id);
            self.shortlist.remove(&id);
        }

        stop
    }

    fn finish(mut self) -> Vec<Contact> {
        debug!(
            target = ?self.target(),
            queried = self.queried.len(),
            responders = self.responders.len(),
            "Done query"
        );

        self.responders.truncate(self.rpc.config().k);
        self.responders.into_iter().collect()
    }
}

/// Node lookup: the K closest live contacts of `target`.
pub(crate) fn lookup(rpc: Arc<Rpc>, target: Id) -> Vec<Contact> {
    IterativeQuery::new(rpc, target, QueryRequest::FindNode).run(|_, _| false)
}
