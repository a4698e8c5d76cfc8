//! Session protocol messages.
//!
//! Every exchange is two round trips: a nonce handshake, then one RPC.
//! The RPC payload travels as its own bencoded byte string, so the receiver can
//! hash exactly the bytes the sender signed.

mod internal;

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::Bytes;
use rand::Rng;
use serde_bytes::ByteBuf;

use crate::common::{Contact, Id};
use crate::identity::IdentityToken;
use crate::security::Authenticator;
use crate::storage::{BatchItem, ContentFilter, EntrySignature, StorageEntry};
use crate::{Config, Error, Result};

pub(crate) use internal::{WireContact, WireEntry, WireToken};

/// Size of a session nonce in bytes.
pub const NONCE_SIZE: usize = 16;

/// Fresh random value proving a message belongs to the current session.
pub type Nonce = [u8; NONCE_SIZE];

pub fn random_nonce() -> Nonce {
    rand::thread_rng().gen()
}

/// Message type tag on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    NonceRequest = 1,
    NonceResponse = 2,
    RpcRequest = 3,
    RpcResponse = 4,
}

impl Opcode {
    fn from_wire(opcode: i64) -> Result<Opcode> {
        Ok(match opcode {
            1 => Opcode::NonceRequest,
            2 => Opcode::NonceResponse,
            3 => Opcode::RpcRequest,
            4 => Opcode::RpcResponse,
            _ => return Err(Error::InvalidMessage("unknown opcode")),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Nonce(NonceMessage),
    Rpc(RpcMessage),
}

/// First half of every session, carrying one side's fresh nonce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonceMessage {
    pub is_response: bool,
    pub session_id: i64,
    pub sender: Id,
    pub nonce: Nonce,
}

/// Signed second half of every session.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcMessage {
    pub session_id: i64,
    pub identity: IdentityToken,
    pub authenticator: Authenticator,
    pub rpc: RpcBody,
    /// The bencoded [RpcBody], as hashed into the authenticator.
    pub encoded_rpc: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RpcBody {
    Request(RequestPayload),
    Response(ResponsePayload),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestPayload {
    Ping,
    FindNode { target: Id },
    FindValue(FindValueRequest),
    Store(StoreRequest),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FindValueRequest {
    pub key: Id,
    pub filter: ContentFilter,
    /// Ask for counters instead of the entries themselves.
    pub counters_only: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreRequest {
    pub entries: Vec<StorageEntry>,
    /// False if each entry's value is an unsigned batch to unpack.
    pub signed: bool,
}

impl StoreRequest {
    /// Bytes of content carried by this request.
    pub fn content_size(&self) -> usize {
        self.entries.iter().map(|e| e.value.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    Ping,
    FindNode { contacts: Vec<Contact> },
    FindValue(FindValueResponse),
    Store { stored: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub enum FindValueResponse {
    /// Nothing stored, closer contacts instead.
    Contacts(Vec<Contact>),
    Entries(Vec<StorageEntry>),
    Counters(BTreeMap<String, u64>),
}

impl Message {
    pub fn opcode(&self) -> Opcode {
        match self {
            Message::Nonce(nonce) if nonce.is_response => Opcode::NonceResponse,
            Message::Nonce(_) => Opcode::NonceRequest,
            Message::Rpc(rpc) => rpc.opcode(),
        }
    }

    pub fn session_id(&self) -> i64 {
        match self {
            Message::Nonce(nonce) => nonce.session_id,
            Message::Rpc(rpc) => rpc.session_id,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Message> {
        let wire = internal::WireMessage::from_bytes(bytes)?;
        let opcode = Opcode::from_wire(wire.opcode)?;

        match opcode {
            Opcode::NonceRequest | Opcode::NonceResponse => Ok(Message::Nonce(NonceMessage {
                is_response: opcode == Opcode::NonceResponse,
                session_id: wire.session_id,
                sender: Id::from_bytes(wire.sender.ok_or(Error::InvalidMessage("missing sender"))?)?,
                nonce: fixed(&wire.nonce.ok_or(Error::InvalidMessage("missing nonce"))?)?,
            })),
            Opcode::RpcRequest | Opcode::RpcResponse => {
                let encoded_rpc = wire.payload.ok_or(Error::InvalidMessage("missing payload"))?;
                let rpc = RpcBody::decode(&encoded_rpc, opcode == Opcode::RpcResponse)?;

                Ok(Message::Rpc(RpcMessage {
                    session_id: wire.session_id,
                    identity: wire
                        .token
                        .ok_or(Error::InvalidMessage("missing identity token"))?
                        .try_into()?,
                    authenticator: wire
                        .authenticator
                        .ok_or(Error::InvalidMessage("missing authenticator"))?
                        .try_into()?,
                    rpc,
                    encoded_rpc: Bytes::from(encoded_rpc.into_vec()),
                }))
            }
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let wire = match self {
            Message::Nonce(nonce) => internal::WireMessage {
                opcode: self.opcode() as i64,
                session_id: nonce.session_id,
                sender: Some(ByteBuf::from(nonce.sender.to_vec())),
                nonce: Some(ByteBuf::from(nonce.nonce.to_vec())),
                token: None,
                authenticator: None,
                payload: None,
            },
            Message::Rpc(rpc) => internal::WireMessage {
                opcode: self.opcode() as i64,
                session_id: rpc.session_id,
                sender: None,
                nonce: None,
                token: Some((&rpc.identity).into()),
                authenticator: Some((&rpc.authenticator).into()),
                payload: Some(ByteBuf::from(rpc.encoded_rpc.to_vec())),
            },
        };

        Ok(wire.to_bytes()?)
    }
}

impl RpcMessage {
    pub fn opcode(&self) -> Opcode {
        match self.rpc {
            RpcBody::Request(_) => Opcode::RpcRequest,
            RpcBody::Response(_) => Opcode::RpcResponse,
        }
    }
}

impl RpcBody {
    /// Bencoded payload, the bytes an [Authenticator] hashes.
    pub fn encode(&self) -> Result<Bytes> {
        let wire = internal::WirePayload::from(self);
        Ok(Bytes::from(wire.to_bytes()?))
    }

    fn decode(bytes: &[u8], is_response: bool) -> Result<RpcBody> {
        let wire = internal::WirePayload::from_bytes(bytes)?;

        if is_response {
            Ok(RpcBody::Response(wire.into_response()?))
        } else {
            Ok(RpcBody::Request(wire.into_request()?))
        }
    }
}

/// Encode the items of an unsigned batch into one value.
pub fn encode_batch(items: &[BatchItem]) -> Result<Bytes> {
    let wire = internal::WireBatch {
        items: items.iter().map(internal::WireBatchItem::from).collect(),
    };

    Ok(Bytes::from(serde_bencode::to_bytes(&wire)?))
}

/// Decode an unsigned batch value.
pub fn decode_batch(bytes: &[u8]) -> Result<Vec<BatchItem>> {
    let wire: internal::WireBatch = serde_bencode::from_bytes(bytes)?;

    wire.items.into_iter().map(BatchItem::try_from).collect()
}

/// The entries packed in an unsigned batch `envelope`, owned by `owner`.
pub(crate) fn unpack_batch(
    envelope: &StorageEntry,
    owner: &str,
    config: &Config,
) -> Result<Vec<StorageEntry>> {
    let items = decode_batch(&envelope.value)?;

    // Items share the envelope's submission time; offset them so none is
    // mistaken for a resubmission of another.
    Ok(items
        .into_iter()
        .enumerate()
        .map(|(index, item)| StorageEntry {
            key: envelope.key,
            content_type: item.content_type,
            value: item.value,
            owner: owner.to_string(),
            timestamp: envelope.timestamp + index as u64,
            ttl: config.clamp_ttl(Some(item.ttl)).as_millis() as u64,
            signature: None,
        })
        .collect())
}

// === Compact encodings ===

pub(crate) fn fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N]> {
    bytes
        .try_into()
        .map_err(|_| Error::InvalidMessage("field has the wrong length"))
}

pub(crate) fn encode_address(address: &SocketAddr) -> Vec<u8> {
    let mut bytes = match address.ip() {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    };
    bytes.extend_from_slice(&address.port().to_be_bytes());
    bytes
}

pub(crate) fn decode_address(bytes: &[u8]) -> Result<SocketAddr> {
    let (ip, port) = match bytes.len() {
        6 => (
            IpAddr::V4(Ipv4Addr::from(fixed::<4>(&bytes[..4])?)),
            &bytes[4..],
        ),
        18 => (
            IpAddr::V6(Ipv6Addr::from(fixed::<16>(&bytes[..16])?)),
            &bytes[16..],
        ),
        _ => return Err(Error::InvalidMessage("invalid compact address")),
    };

    Ok(SocketAddr::new(ip, u16::from_be_bytes(fixed(port)?)))
}

impl From<&StorageEntry> for WireEntry {
    fn from(entry: &StorageEntry) -> Self {
        WireEntry {
            key: ByteBuf::from(entry.key.to_vec()),
            content_type: entry.content_type.clone(),
            value: ByteBuf::from(entry.value.to_vec()),
            owner: entry.owner.clone(),
            timestamp: entry.timestamp as i64,
            ttl: entry.ttl as i64,
            public_key: entry
                .signature
                .as_ref()
                .map(|s| ByteBuf::from(s.public_key.to_vec())),
            content_hash: entry
                .signature
                .as_ref()
                .map(|s| ByteBuf::from(s.content_hash.to_vec())),
            signature: entry
                .signature
                .as_ref()
                .map(|s| ByteBuf::from(s.signature.to_vec())),
        }
    }
}

impl TryFrom<WireEntry> for StorageEntry {
    type Error = Error;

    fn try_from(wire: WireEntry) -> Result<Self> {
        let signature = match (wire.public_key, wire.content_hash, wire.signature) {
            (Some(public_key), Some(content_hash), Some(signature)) => Some(EntrySignature {
                public_key: fixed(&public_key)?,
                content_hash: fixed(&content_hash)?,
                signature: fixed(&signature)?,
            }),
            (None, None, None) => None,
            _ => return Err(Error::InvalidMessage("incomplete entry signature")),
        };

        Ok(StorageEntry {
            key: Id::from_bytes(&wire.key)?,
            content_type: wire.content_type,
            value: Bytes::from(wire.value.into_vec()),
            owner: wire.owner,
            timestamp: u64::try_from(wire.timestamp)
                .map_err(|_| Error::InvalidMessage("negative timestamp"))?,
            ttl: u64::try_from(wire.ttl).map_err(|_| Error::InvalidMessage("negative ttl"))?,
            signature,
        })
    }
}

impl From<&Contact> for WireContact {
    fn from(contact: &Contact) -> Self {
        WireContact {
            id: ByteBuf::from(contact.id().to_vec()),
            address: ByteBuf::from(encode_address(&contact.address())),
        }
    }
}

impl TryFrom<WireContact> for Contact {
    type Error = Error;

    fn try_from(wire: WireContact) -> Result<Self> {
        Ok(Contact::new(
            Id::from_bytes(&wire.id)?,
            decode_address(&wire.address)?,
        ))
    }
}

impl From<&IdentityToken> for WireToken {
    fn from(token: &IdentityToken) -> Self {
        WireToken {
            node_id: ByteBuf::from(token.node_id.to_vec()),
            public_key: ByteBuf::from(token.public_key.to_vec()),
            user_id: token.user_id.clone(),
            expires_at: token.expires_at as i64,
            signature: ByteBuf::from(token.signature.to_vec()),
        }
    }
}

impl TryFrom<WireToken> for IdentityToken {
    type Error = Error;

    fn try_from(wire: WireToken) -> Result<Self> {
        Ok(IdentityToken {
            node_id: Id::from_bytes(&wire.node_id)?,
            public_key: fixed(&wire.public_key)?,
            user_id: wire.user_id,
            expires_at: u64::try_from(wire.expires_at)
                .map_err(|_| Error::InvalidMessage("negative expiry"))?,
            signature: fixed(&wire.signature)?,
        })
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::identity::Issuer;

    fn rpc_message(rpc: RpcBody) -> Message {
        let issuer = Issuer::random();
        let identity = issuer.issue("alice", [9; 32], Duration::from_secs(60));
        let encoded_rpc = rpc.encode().unwrap();

        Message::Rpc(RpcMessage {
            session_id: -42,
            identity,
            authenticator: Authenticator {
                addressee: Id::random(),
                nonce: random_nonce(),
                payload_hash: [1; 20],
                signature: [2; 64],
            },
            rpc,
            encoded_rpc,
        })
    }

    fn assert_decodes_to_itself(message: Message) {
        let bytes = message.to_bytes().unwrap();
        assert_eq!(Message::from_bytes(&bytes).unwrap(), message);
    }

    #[test]
    fn nonce_messages() {
        let message = Message::Nonce(NonceMessage {
            is_response: true,
            session_id: i64::MAX,
            sender: Id::random(),
            nonce: random_nonce(),
        });

        assert_eq!(message.opcode(), Opcode::NonceResponse);
        assert_decodes_to_itself(message);
    }

    #[test]
    fn find_value_request_keeps_filter() {
        let message = rpc_message(RpcBody::Request(RequestPayload::FindValue(FindValueRequest {
            key: Id::digest("topic"),
            filter: ContentFilter::default().owner("bob").recent(true),
            counters_only: true,
        })));

        assert_eq!(message.opcode(), Opcode::RpcRequest);
        assert_decodes_to_itself(message);
    }

    #[test]
    fn find_node_response_with_mixed_addresses() {
        let v4 = Contact::new(Id::random(), "127.0.0.1:6881".parse().unwrap());
        let v6 = Contact::new(Id::random(), "[::1]:7000".parse().unwrap());

        let message = rpc_message(RpcBody::Response(ResponsePayload::FindNode {
            contacts: vec![v4, v6],
        }));

        assert_decodes_to_itself(message);
    }

    #[test]
    fn store_request_with_signed_entry() {
        let mut entry = StorageEntry::unsigned(
            Id::random(),
            "text",
            Bytes::from_static(b"hello"),
            "alice",
            Duration::from_secs(60),
        );
        entry.signature = Some(EntrySignature {
            public_key: [4; 32],
            content_hash: [5; 20],
            signature: [6; 64],
        });

        let message = rpc_message(RpcBody::Request(RequestPayload::Store(StoreRequest {
            entries: vec![entry],
            signed: true,
        })));

        assert_decodes_to_itself(message);
    }

    #[test]
    fn counters_response() {
        let mut counters = BTreeMap::new();
        counters.insert("alice".to_string(), 3);

        let message = rpc_message(RpcBody::Response(ResponsePayload::FindValue(
            FindValueResponse::Counters(counters),
        )));

        assert_decodes_to_itself(message);
    }

    #[test]
    fn rejects_unknown_opcode_and_garbage() {
        let message = Message::Nonce(NonceMessage {
            is_response: false,
            session_id: 1,
            sender: Id::random(),
            nonce: random_nonce(),
        });
        let mut tampered = message.to_bytes().unwrap();
        let opcode = tampered
            .windows(6)
            .position(|window| window == b"1:oi1e")
            .unwrap();
        tampered[opcode..opcode + 6].copy_from_slice(b"1:oi9e");

        assert!(matches!(
            Message::from_bytes(&tampered),
            Err(Error::InvalidMessage("unknown opcode"))
        ));
        assert!(Message::from_bytes(b"not bencode").is_err());
    }

    #[test]
    fn batch_envelope() {
        let items = vec![
            BatchItem {
                content_type: "text".to_string(),
                value: Bytes::from_static(b"one"),
                ttl: Duration::from_secs(10),
            },
            BatchItem {
                content_type: "counter".to_string(),
                value: Bytes::from_static(b"two"),
                ttl: Duration::from_secs(20),
            },
        ];

        assert_eq!(decode_batch(&encode_batch(&items).unwrap()).unwrap(), items);
    }
}
