//! Content writes to the K nodes closest to a key.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::common::{encode_batch, unpack_batch, Id, RequestPayload, RpcBody, StoreRequest};
use crate::rpc::Rpc;
use crate::storage::{BatchItem, StorageEntry};
use crate::{Error, Result};

use super::lookup::lookup;

const STORE_MARGIN: Duration = Duration::from_millis(50);

/// Rejects requests whose content exceeds the configured maximum, or whose
/// encoding would not fit in one datagram.
pub(crate) fn check_size(rpc: &Rpc, request: &StoreRequest) -> Result<()> {
    let size = request.content_size();
    let max = rpc.config().max_content_size;

    if size > max {
        return Err(Error::ContentTooLarge { size, max });
    }

    let encoded = RpcBody::Request(RequestPayload::Store(request.clone()))
        .encode()?
        .len();
    let budget = rpc.payload_budget();

    if encoded > budget {
        return Err(Error::ContentTooLarge {
            size: encoded,
            max: budget,
        });
    }

    Ok(())
}

/// The store request carrying `items` as one unsigned envelope.
pub(crate) fn unsigned_request(rpc: &Rpc, key: Id, items: &[BatchItem]) -> Result<StoreRequest> {
    let envelope = StorageEntry::unsigned(
        key,
        &rpc.config().default_content_type,
        encode_batch(items)?,
        &rpc.security().identity().user_id,
        Duration::ZERO,
    );

    Ok(StoreRequest {
        entries: vec![envelope],
        signed: false,
    })
}

/// Looks up `key` and stores `request` at every contact found, returning how
/// many stores were acknowledged within the per call timeout.
///
/// The local node keeps a copy too when it is among the K closest.
pub(crate) fn put(rpc: Arc<Rpc>, key: Id, request: StoreRequest) -> usize {
    let closest = lookup(rpc.clone(), key);
    let k = rpc.config().k;

    let (sender, receiver) = flume::unbounded();

    for contact in &closest {
        let rpc = rpc.clone();
        let to = contact.clone();
        let request = request.clone();
        let sender = sender.clone();

        let spawned = thread::Builder::new()
            .name("authdht-store".to_string())
            .spawn(move || {
                let _ = sender.send(rpc.store(&to, request).unwrap_or(false));
            });

        if let Err(error) = spawned {
            debug!(?error, "Failed to spawn store");
        }
    }
    drop(sender);

    let deadline = Instant::now() + rpc.config().request_timeout * 2 + STORE_MARGIN;
    let mut acknowledged = 0;

    while let Ok(stored) = receiver.recv_deadline(deadline) {
        if stored {
            acknowledged += 1;
        }
    }

    let local_is_close = closest.len() < k
        || closest
            .last()
            .is_some_and(|farthest| rpc.id().xor(&key) < farthest.id().xor(&key));

    if local_is_close && store_locally(&rpc, request) {
        acknowledged += 1;
    }

    trace!(?key, contacts = closest.len(), acknowledged, "Put done");

    acknowledged
}

fn store_locally(rpc: &Rpc, request: StoreRequest) -> bool {
    let entries = if request.signed {
        rpc.security().clean(request.entries)
    } else {
        let owner = &rpc.security().identity().user_id;

        request
            .entries
            .iter()
            .filter_map(|envelope| unpack_batch(envelope, owner, rpc.config()).ok())
            .flatten()
            .collect()
    };

    !entries.is_empty()
        && entries
            .into_iter()
            .fold(true, |stored, entry| rpc.storage().store(entry) && stored)
}
