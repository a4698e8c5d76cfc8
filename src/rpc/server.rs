//! Answers authenticated requests from other nodes.

use tracing::{debug, trace};

use crate::common::{
    unpack_batch, FindValueRequest, FindValueResponse, RequestPayload, ResponsePayload, RpcBody,
    SelectMode, StoreRequest,
};
use crate::identity::IdentityToken;
use crate::storage::StorageEntry;

use super::Rpc;

/// Builds the response to a verified request.
pub(crate) fn handle_request(
    rpc: &Rpc,
    requester: &IdentityToken,
    request: RequestPayload,
) -> ResponsePayload {
    trace!(context = "server_request", ?request, user_id = %requester.user_id);

    match request {
        RequestPayload::Ping => ResponsePayload::Ping,
        RequestPayload::FindNode { target } => ResponsePayload::FindNode {
            contacts: rpc
                .routing_table()
                .select(&target, rpc.config().k, SelectMode::AliveWithLocal),
        },
        RequestPayload::FindValue(request) => {
            ResponsePayload::FindValue(handle_find_value(rpc, request))
        }
        RequestPayload::Store(request) => ResponsePayload::Store {
            stored: handle_store(rpc, requester, request),
        },
    }
}

fn handle_find_value(rpc: &Rpc, request: FindValueRequest) -> FindValueResponse {
    let storage = rpc.storage();

    if request.counters_only {
        if let Some(counters) = storage
            .get_count(&request.key, &request.filter)
            .filter(|counters| !counters.is_empty())
        {
            return FindValueResponse::Counters(counters);
        }
    } else if let Some(entries) = storage
        .get_limited(&request.key, &request.filter, rpc.config().max_content_size)
        .map(|entries| fit_entries(rpc, entries))
        .filter(|entries| !entries.is_empty())
    {
        return FindValueResponse::Entries(entries);
    }

    FindValueResponse::Contacts(rpc.routing_table().select(
        &request.key,
        rpc.config().k,
        SelectMode::Alive,
    ))
}

/// The longest prefix of `entries` (newest first) whose response still fits
/// in one datagram.
fn fit_entries(rpc: &Rpc, mut entries: Vec<StorageEntry>) -> Vec<StorageEntry> {
    let fits = |prefix: &[StorageEntry]| {
        RpcBody::Response(ResponsePayload::FindValue(FindValueResponse::Entries(
            prefix.to_vec(),
        )))
        .encode()
        .is_ok_and(|encoded| encoded.len() <= rpc.payload_budget())
    };

    if fits(&entries) {
        return entries;
    }

    // fits(low) holds and fits(high) does not.
    let (mut low, mut high) = (0, entries.len());
    while high - low > 1 {
        let middle = low + (high - low) / 2;

        if fits(&entries[..middle]) {
            low = middle;
        } else {
            high = middle;
        }
    }

    debug!(kept = low, dropped = entries.len() - low, "Trimmed find value response");
    entries.truncate(low);
    entries
}

/// Stores signed entries as they are, and unpacks unsigned batches under the
/// requester's user id.
fn handle_store(rpc: &Rpc, requester: &IdentityToken, request: StoreRequest) -> bool {
    let config = rpc.config();

    if request.content_size() > config.max_content_size {
        debug!(size = request.content_size(), "Rejected oversize store");
        return false;
    }

    if request.signed {
        let max_ttl = config.max_ttl.as_millis() as u64;

        if !request
            .entries
            .iter()
            .all(|entry| entry.ttl <= max_ttl && rpc.security().check_entry(entry))
        {
            debug!(user_id = %requester.user_id, "Rejected store with invalid signature");
            return false;
        }

        return request
            .entries
            .into_iter()
            .fold(true, |stored, entry| rpc.storage().store(entry) && stored);
    }

    let mut entries = Vec::new();

    for envelope in &request.entries {
        match unpack_batch(envelope, &requester.user_id, config) {
            Ok(unpacked) => entries.extend(unpacked),
            Err(error) => {
                debug!(?error, "Rejected malformed unsigned batch");
                return false;
            }
        }
    }

    entries
        .into_iter()
        .fold(true, |stored, entry| rpc.storage().store(entry) && stored)
}
