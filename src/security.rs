//! Message and content authentication.

use std::fmt::{self, Debug, Formatter};
use std::time::Duration;

use bytes::Bytes;
use ed25519_dalek::{Signer, SigningKey};

use crate::common::{Id, Nonce, NonceMessage, RpcMessage};
use crate::identity::{unix_millis, verify_signature, IdentityToken};
use crate::storage::{EntrySignature, StorageEntry};
use crate::{Error, Result};

/// Proof that an RPC payload was produced by the token holder for this session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticator {
    /// Node the message is meant for.
    pub addressee: Id,
    /// The addressee's nonce for this session.
    pub nonce: Nonce,
    pub payload_hash: [u8; 20],
    pub signature: [u8; 64],
}

/// The authenticator check an inbound [RpcMessage] failed.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("Message is addressed to another node")]
    WrongAddressee,

    #[error("Nonce does not belong to this session")]
    WrongNonce,

    #[error("Sender identity token expired")]
    ExpiredToken,

    #[error("Sender identity token does not match the handshake sender")]
    SenderMismatch,

    #[error("Payload hash mismatch")]
    PayloadHashMismatch,

    #[error("Authenticator signature does not verify")]
    InvalidSignature,

    #[error("Sender identity token is not signed by the issuer")]
    UntrustedToken,
}

/// Signing, hashing and verification on behalf of one node.
pub trait Security: Send + Sync + Debug {
    fn hash(&self, bytes: &[u8]) -> [u8; 20];

    fn sign(&self, bytes: &[u8]) -> [u8; 64];

    fn verify(&self, bytes: &[u8], signature: &[u8; 64], public_key: &[u8; 32]) -> bool;

    /// The local node's issuer signed identity.
    fn identity(&self) -> &IdentityToken;

    /// Public key every identity token must be signed with.
    fn issuer_key(&self) -> &[u8; 32];

    /// Signs `payload` for `addressee`, binding both session nonces.
    fn build_authenticator(
        &self,
        addressee: Id,
        addressee_nonce: Nonce,
        own_nonce: Nonce,
        payload: &[u8],
    ) -> Authenticator {
        let payload_hash = self.hash(payload);
        let signature = self.sign(&authenticator_signable(
            &addressee,
            &addressee_nonce,
            &own_nonce,
            &payload_hash,
        ));

        Authenticator {
            addressee,
            nonce: addressee_nonce,
            payload_hash,
            signature,
        }
    }

    /// Verifies an inbound RPC against the nonce this side sent and the
    /// nonce message received from the peer in the same session.
    fn check(
        &self,
        message: &RpcMessage,
        sent_nonce: &Nonce,
        received: &NonceMessage,
    ) -> Result<(), AuthError> {
        let authenticator = &message.authenticator;
        let token = &message.identity;

        if authenticator.addressee != self.identity().node_id {
            return Err(AuthError::WrongAddressee);
        }
        if authenticator.nonce != *sent_nonce {
            return Err(AuthError::WrongNonce);
        }
        if token.is_expired() {
            return Err(AuthError::ExpiredToken);
        }
        if token.node_id != received.sender {
            return Err(AuthError::SenderMismatch);
        }
        if self.hash(&message.encoded_rpc) != authenticator.payload_hash {
            return Err(AuthError::PayloadHashMismatch);
        }

        let signable = authenticator_signable(
            &authenticator.addressee,
            &authenticator.nonce,
            &received.nonce,
            &authenticator.payload_hash,
        );
        if !self.verify(&signable, &authenticator.signature, &token.public_key) {
            return Err(AuthError::InvalidSignature);
        }
        if !self.verify(&token.signable(), &token.signature, self.issuer_key()) {
            return Err(AuthError::UntrustedToken);
        }

        Ok(())
    }

    /// A signed entry owned by the local user, submitted now.
    fn build_entry(&self, key: Id, content_type: &str, value: Bytes, ttl: Duration) -> StorageEntry {
        let mut entry = StorageEntry {
            key,
            content_type: content_type.to_string(),
            value,
            owner: self.identity().user_id.clone(),
            timestamp: unix_millis(),
            ttl: ttl.as_millis() as u64,
            signature: None,
        };

        let content_hash = self.hash(&entry.value);
        let public_key = self.identity().public_key;
        let signature = self.sign(&entry_signable(&entry, &public_key, &content_hash));

        entry.signature = Some(EntrySignature {
            public_key,
            content_hash,
            signature,
        });

        entry
    }

    /// True if the entry is signed and both its content hash and signature verify.
    fn check_entry(&self, entry: &StorageEntry) -> bool {
        let Some(credentials) = &entry.signature else {
            return false;
        };

        self.hash(&entry.value) == credentials.content_hash
            && self.verify(
                &entry_signable(entry, &credentials.public_key, &credentials.content_hash),
                &credentials.signature,
                &credentials.public_key,
            )
    }

    /// Keeps the entries passing [Security::check_entry].
    fn clean(&self, entries: Vec<StorageEntry>) -> Vec<StorageEntry> {
        entries
            .into_iter()
            .filter(|entry| self.check_entry(entry))
            .collect()
    }
}

fn authenticator_signable(
    addressee: &Id,
    addressee_nonce: &Nonce,
    signer_nonce: &Nonce,
    payload_hash: &[u8; 20],
) -> Vec<u8> {
    let mut signable = Vec::with_capacity(20 + 16 + 16 + 20);

    signable.extend(addressee.as_bytes());
    signable.extend(addressee_nonce);
    signable.extend(signer_nonce);
    signable.extend(payload_hash);

    signable
}

fn entry_signable(entry: &StorageEntry, public_key: &[u8; 32], content_hash: &[u8; 20]) -> Vec<u8> {
    let mut signable = vec![];

    signable.extend(b"1:k20:");
    signable.extend(entry.key.as_bytes());
    signable.extend(format!("1:c{}:{}", entry.content_type.len(), entry.content_type).into_bytes());
    signable.extend(format!("1:o{}:{}", entry.owner.len(), entry.owner).into_bytes());
    signable.extend(b"2:pk32:");
    signable.extend(public_key);
    signable.extend(format!("2:tsi{}e2:tli{}e", entry.timestamp, entry.ttl).into_bytes());
    signable.extend(b"1:h20:");
    signable.extend(content_hash);

    signable
}

/// Default [Security] with ed25519 signatures and SHA-1 digests.
pub struct Ed25519Security {
    signing_key: SigningKey,
    identity: IdentityToken,
    issuer_key: [u8; 32],
}

impl Ed25519Security {
    /// Fails if `identity` does not bind the public half of `signing_key`.
    pub fn new(signing_key: SigningKey, identity: IdentityToken, issuer_key: [u8; 32]) -> Result<Self> {
        if signing_key.verifying_key().to_bytes() != identity.public_key {
            return Err(Error::InvalidKey(
                "signing key does not match the identity token",
            ));
        }

        Ok(Ed25519Security {
            signing_key,
            identity,
            issuer_key,
        })
    }
}

impl Debug for Ed25519Security {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519Security")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl Security for Ed25519Security {
    fn hash(&self, bytes: &[u8]) -> [u8; 20] {
        sha1_smol::Sha1::from(bytes).digest().bytes()
    }

    fn sign(&self, bytes: &[u8]) -> [u8; 64] {
        self.signing_key.sign(bytes).to_bytes()
    }

    fn verify(&self, bytes: &[u8], signature: &[u8; 64], public_key: &[u8; 32]) -> bool {
        verify_signature(bytes, signature, public_key)
    }

    fn identity(&self) -> &IdentityToken {
        &self.identity
    }

    fn issuer_key(&self) -> &[u8; 32] {
        &self.issuer_key
    }
}
