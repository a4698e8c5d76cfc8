use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use super::{
    fixed, FindValueRequest, FindValueResponse, RequestPayload, ResponsePayload, RpcBody,
    StoreRequest,
};
use crate::common::{Contact, Id};
use crate::security::Authenticator;
use crate::storage::{BatchItem, ContentFilter, StorageEntry};
use crate::{Error, Result};

const PING_REQUEST: i64 = 1;
const PING_RESPONSE: i64 = 2;
const STORE_REQUEST: i64 = 3;
const STORE_RESPONSE: i64 = 4;
const FIND_NODE_REQUEST: i64 = 5;
const FIND_NODE_RESPONSE: i64 = 6;
const FIND_VALUE_REQUEST: i64 = 7;
const FIND_VALUE_RESPONSE: i64 = 8;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireMessage {
    #[serde(rename = "o")]
    pub opcode: i64,

    #[serde(rename = "s")]
    pub session_id: i64,

    #[serde(default, rename = "f", skip_serializing_if = "Option::is_none")]
    pub sender: Option<ByteBuf>,

    #[serde(default, rename = "n", skip_serializing_if = "Option::is_none")]
    pub nonce: Option<ByteBuf>,

    #[serde(default, rename = "t", skip_serializing_if = "Option::is_none")]
    pub token: Option<WireToken>,

    #[serde(default, rename = "a", skip_serializing_if = "Option::is_none")]
    pub authenticator: Option<WireAuthenticator>,

    /// Bencoded [WirePayload], kept as bytes so it can be hashed as received.
    #[serde(default, rename = "p", skip_serializing_if = "Option::is_none")]
    pub payload: Option<ByteBuf>,
}

impl WireMessage {
    pub fn from_bytes(bytes: &[u8]) -> Result<WireMessage, serde_bencode::Error> {
        serde_bencode::from_bytes(bytes)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WireToken {
    #[serde(rename = "i")]
    pub node_id: ByteBuf,

    #[serde(rename = "k")]
    pub public_key: ByteBuf,

    #[serde(rename = "u")]
    pub user_id: String,

    #[serde(rename = "e")]
    pub expires_at: i64,

    #[serde(rename = "s")]
    pub signature: ByteBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WireAuthenticator {
    #[serde(rename = "a")]
    pub addressee: ByteBuf,

    #[serde(rename = "n")]
    pub nonce: ByteBuf,

    #[serde(rename = "h")]
    pub payload_hash: ByteBuf,

    #[serde(rename = "s")]
    pub signature: ByteBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WireContact {
    #[serde(rename = "i")]
    pub id: ByteBuf,

    /// Compact address, 6 bytes for IPv4 and 18 for IPv6.
    #[serde(rename = "a")]
    pub address: ByteBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WireEntry {
    #[serde(rename = "k")]
    pub key: ByteBuf,

    #[serde(rename = "c")]
    pub content_type: String,

    #[serde(rename = "v")]
    pub value: ByteBuf,

    #[serde(rename = "o")]
    pub owner: String,

    #[serde(rename = "ts")]
    pub timestamp: i64,

    #[serde(rename = "tl")]
    pub ttl: i64,

    #[serde(default, rename = "pk", skip_serializing_if = "Option::is_none")]
    pub public_key: Option<ByteBuf>,

    #[serde(default, rename = "h", skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<ByteBuf>,

    #[serde(default, rename = "sig", skip_serializing_if = "Option::is_none")]
    pub signature: Option<ByteBuf>,
}

/// Every RPC payload in one dictionary, discriminated by `y`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct WirePayload {
    #[serde(rename = "y")]
    pub kind: i64,

    /// FIND_NODE target or FIND_VALUE key.
    #[serde(default, rename = "t", skip_serializing_if = "Option::is_none")]
    pub target: Option<ByteBuf>,

    #[serde(default, rename = "ct", skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    #[serde(default, rename = "ow", skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    #[serde(default, rename = "r", skip_serializing_if = "Option::is_none")]
    pub recent: Option<i64>,

    #[serde(default, rename = "c", skip_serializing_if = "Option::is_none")]
    pub counters_only: Option<i64>,

    #[serde(default, rename = "e", skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<WireEntry>>,

    #[serde(default, rename = "sg", skip_serializing_if = "Option::is_none")]
    pub signed: Option<i64>,

    #[serde(default, rename = "n", skip_serializing_if = "Option::is_none")]
    pub contacts: Option<Vec<WireContact>>,

    #[serde(default, rename = "cn", skip_serializing_if = "Option::is_none")]
    pub counters: Option<BTreeMap<String, i64>>,

    #[serde(default, rename = "ok", skip_serializing_if = "Option::is_none")]
    pub stored: Option<i64>,
}

impl WirePayload {
    pub fn from_bytes(bytes: &[u8]) -> Result<WirePayload, serde_bencode::Error> {
        serde_bencode::from_bytes(bytes)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }

    pub fn into_request(self) -> Result<RequestPayload> {
        Ok(match self.kind {
            PING_REQUEST => RequestPayload::Ping,
            FIND_NODE_REQUEST => RequestPayload::FindNode {
                target: required_id(self.target)?,
            },
            FIND_VALUE_REQUEST => RequestPayload::FindValue(FindValueRequest {
                key: required_id(self.target)?,
                filter: ContentFilter {
                    content_type: self.content_type,
                    owner: self.owner,
                    recent: flag(self.recent),
                },
                counters_only: flag(self.counters_only),
            }),
            STORE_REQUEST => RequestPayload::Store(StoreRequest {
                entries: decode_entries(
                    self.entries
                        .ok_or(Error::InvalidMessage("store without entries"))?,
                )?,
                signed: flag(self.signed),
            }),
            _ => return Err(Error::InvalidMessage("unknown request payload")),
        })
    }

    pub fn into_response(self) -> Result<ResponsePayload> {
        Ok(match self.kind {
            PING_RESPONSE => ResponsePayload::Ping,
            FIND_NODE_RESPONSE => ResponsePayload::FindNode {
                contacts: decode_contacts(self.contacts.unwrap_or_default())?,
            },
            FIND_VALUE_RESPONSE => ResponsePayload::FindValue(
                match (self.entries, self.counters, self.contacts) {
                    (Some(entries), _, _) => FindValueResponse::Entries(decode_entries(entries)?),
                    (None, Some(counters), _) => FindValueResponse::Counters(
                        counters
                            .into_iter()
                            .map(|(name, count)| (name, count.max(0) as u64))
                            .collect(),
                    ),
                    (None, None, contacts) => FindValueResponse::Contacts(decode_contacts(
                        contacts.unwrap_or_default(),
                    )?),
                },
            ),
            STORE_RESPONSE => ResponsePayload::Store {
                stored: flag(self.stored),
            },
            _ => return Err(Error::InvalidMessage("unknown response payload")),
        })
    }
}

impl From<&RpcBody> for WirePayload {
    fn from(rpc: &RpcBody) -> Self {
        match rpc {
            RpcBody::Request(RequestPayload::Ping) => WirePayload {
                kind: PING_REQUEST,
                ..Default::default()
            },
            RpcBody::Request(RequestPayload::FindNode { target }) => WirePayload {
                kind: FIND_NODE_REQUEST,
                target: Some(ByteBuf::from(target.to_vec())),
                ..Default::default()
            },
            RpcBody::Request(RequestPayload::FindValue(request)) => WirePayload {
                kind: FIND_VALUE_REQUEST,
                target: Some(ByteBuf::from(request.key.to_vec())),
                content_type: request.filter.content_type.clone(),
                owner: request.filter.owner.clone(),
                recent: request.filter.recent.then_some(1),
                counters_only: request.counters_only.then_some(1),
                ..Default::default()
            },
            RpcBody::Request(RequestPayload::Store(request)) => WirePayload {
                kind: STORE_REQUEST,
                entries: Some(request.entries.iter().map(WireEntry::from).collect()),
                signed: Some(request.signed as i64),
                ..Default::default()
            },
            RpcBody::Response(ResponsePayload::Ping) => WirePayload {
                kind: PING_RESPONSE,
                ..Default::default()
            },
            RpcBody::Response(ResponsePayload::FindNode { contacts }) => WirePayload {
                kind: FIND_NODE_RESPONSE,
                contacts: Some(contacts.iter().map(WireContact::from).collect()),
                ..Default::default()
            },
            RpcBody::Response(ResponsePayload::FindValue(response)) => {
                let mut wire = WirePayload {
                    kind: FIND_VALUE_RESPONSE,
                    ..Default::default()
                };

                match response {
                    FindValueResponse::Entries(entries) => {
                        wire.entries = Some(entries.iter().map(WireEntry::from).collect())
                    }
                    FindValueResponse::Counters(counters) => {
                        wire.counters = Some(
                            counters
                                .iter()
                                .map(|(name, count)| (name.clone(), *count as i64))
                                .collect(),
                        )
                    }
                    FindValueResponse::Contacts(contacts) => {
                        wire.contacts = Some(contacts.iter().map(WireContact::from).collect())
                    }
                }

                wire
            }
            RpcBody::Response(ResponsePayload::Store { stored }) => WirePayload {
                kind: STORE_RESPONSE,
                stored: Some(*stored as i64),
                ..Default::default()
            },
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WireBatch {
    #[serde(rename = "i")]
    pub items: Vec<WireBatchItem>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WireBatchItem {
    #[serde(rename = "c")]
    pub content_type: String,

    #[serde(rename = "v")]
    pub value: ByteBuf,

    /// Milliseconds.
    #[serde(rename = "t")]
    pub ttl: i64,
}

impl From<&BatchItem> for WireBatchItem {
    fn from(item: &BatchItem) -> Self {
        WireBatchItem {
            content_type: item.content_type.clone(),
            value: ByteBuf::from(item.value.to_vec()),
            ttl: item.ttl.as_millis() as i64,
        }
    }
}

impl TryFrom<WireBatchItem> for BatchItem {
    type Error = Error;

    fn try_from(wire: WireBatchItem) -> Result<Self> {
        Ok(BatchItem {
            content_type: wire.content_type,
            value: Bytes::from(wire.value.into_vec()),
            ttl: Duration::from_millis(
                u64::try_from(wire.ttl).map_err(|_| Error::InvalidMessage("negative ttl"))?,
            ),
        })
    }
}

impl From<&Authenticator> for WireAuthenticator {
    fn from(authenticator: &Authenticator) -> Self {
        WireAuthenticator {
            addressee: ByteBuf::from(authenticator.addressee.to_vec()),
            nonce: ByteBuf::from(authenticator.nonce.to_vec()),
            payload_hash: ByteBuf::from(authenticator.payload_hash.to_vec()),
            signature: ByteBuf::from(authenticator.signature.to_vec()),
        }
    }
}

impl TryFrom<WireAuthenticator> for Authenticator {
    type Error = Error;

    fn try_from(wire: WireAuthenticator) -> Result<Self> {
        Ok(Authenticator {
            addressee: Id::from_bytes(&wire.addressee)?,
            nonce: fixed(&wire.nonce)?,
            payload_hash: fixed(&wire.payload_hash)?,
            signature: fixed(&wire.signature)?,
        })
    }
}

fn flag(value: Option<i64>) -> bool {
    value.unwrap_or(0) != 0
}

fn required_id(bytes: Option<ByteBuf>) -> Result<Id> {
    Id::from_bytes(bytes.ok_or(Error::InvalidMessage("missing target"))?)
}

fn decode_entries(entries: Vec<WireEntry>) -> Result<Vec<StorageEntry>> {
    entries.into_iter().map(StorageEntry::try_from).collect()
}

fn decode_contacts(contacts: Vec<WireContact>) -> Result<Vec<Contact>> {
    contacts.into_iter().map(Contact::try_from).collect()
}
