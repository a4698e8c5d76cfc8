//! Identity tokens and bootstrap lists signed by an identity issuer.

use std::{
    net::SocketAddr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::Rng;

use crate::common::{Contact, Id};

/// Milliseconds since the unix epoch.
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Verify an ed25519 signature over `message` with raw key and signature bytes.
pub(crate) fn verify_signature(message: &[u8], signature: &[u8; 64], public_key: &[u8; 32]) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };

    key.verify(message, &Signature::from_bytes(signature)).is_ok()
}

/// Issuer signed binding of a node [Id] to a public key and a user id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityToken {
    pub node_id: Id,
    pub public_key: [u8; 32],
    pub user_id: String,
    /// Expiry in milliseconds since the unix epoch.
    pub expires_at: u64,
    pub signature: [u8; 64],
}

impl IdentityToken {
    pub fn is_expired(&self) -> bool {
        self.expires_at < unix_millis()
    }

    /// Returns true if the issuer with `issuer_key` signed this token.
    pub fn verify(&self, issuer_key: &[u8; 32]) -> bool {
        verify_signature(&self.signable(), &self.signature, issuer_key)
    }

    pub fn signable(&self) -> Vec<u8> {
        encode_token_signable(&self.node_id, &self.public_key, &self.user_id, self.expires_at)
    }
}

fn encode_token_signable(node_id: &Id, public_key: &[u8; 32], user_id: &str, expires_at: u64) -> Vec<u8> {
    let mut signable = vec![];

    signable.extend(b"2:id20:");
    signable.extend(node_id.as_bytes());
    signable.extend(b"1:k32:");
    signable.extend(public_key);
    signable.extend(format!("1:u{}:", user_id.len()).into_bytes());
    signable.extend(user_id.as_bytes());
    signable.extend(format!("1:ei{}e", expires_at).into_bytes());

    signable
}

/// Issuer signed list of peers to bootstrap from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapList {
    pub peers: Vec<(Id, SocketAddr)>,
    pub signature: [u8; 64],
}

impl BootstrapList {
    /// Returns true if the issuer with `issuer_key` signed this list.
    pub fn verify(&self, issuer_key: &[u8; 32]) -> bool {
        verify_signature(&encode_list_signable(&self.peers), &self.signature, issuer_key)
    }

    pub fn contacts(&self) -> Vec<Contact> {
        self.peers
            .iter()
            .map(|(id, address)| Contact::new(*id, *address))
            .collect()
    }
}

fn encode_list_signable(peers: &[(Id, SocketAddr)]) -> Vec<u8> {
    let mut signable = vec![];

    for (id, address) in peers {
        signable.extend(id.as_bytes());
        let address = address.to_string();
        signable.extend(format!("{}:", address.len()).into_bytes());
        signable.extend(address.into_bytes());
    }

    signable
}

/// In-process identity issuer.
///
/// Assigns node ids, signs identity tokens and bootstrap lists. Nodes only
/// ever need its public key.
#[derive(Debug, Clone)]
pub struct Issuer {
    signing_key: SigningKey,
}

impl Issuer {
    pub fn new(signing_key: SigningKey) -> Self {
        Issuer { signing_key }
    }

    /// An issuer with a freshly generated key.
    pub fn random() -> Self {
        Issuer::new(random_signing_key())
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Issue a token for `user_id` under a random node id.
    pub fn issue(&self, user_id: &str, public_key: [u8; 32], validity: Duration) -> IdentityToken {
        self.issue_with_id(Id::random(), user_id, public_key, validity)
    }

    pub fn issue_with_id(
        &self,
        node_id: Id,
        user_id: &str,
        public_key: [u8; 32],
        validity: Duration,
    ) -> IdentityToken {
        let expires_at = unix_millis().saturating_add(validity.as_millis() as u64);
        let signable = encode_token_signable(&node_id, &public_key, user_id, expires_at);

        IdentityToken {
            node_id,
            public_key,
            user_id: user_id.to_string(),
            expires_at,
            signature: self.signing_key.sign(&signable).to_bytes(),
        }
    }

    pub fn sign_bootstrap(&self, peers: Vec<(Id, SocketAddr)>) -> BootstrapList {
        let signature = self.signing_key.sign(&encode_list_signable(&peers)).to_bytes();

        BootstrapList { peers, signature }
    }
}

/// Generate an ed25519 key from the thread rng.
pub fn random_signing_key() -> SigningKey {
    let secret: [u8; 32] = rand::thread_rng().gen();
    SigningKey::from_bytes(&secret)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn token_verifies_against_issuer_only() {
        let issuer = Issuer::random();
        let key = random_signing_key();

        let token = issuer.issue("alice", key.verifying_key().to_bytes(), Duration::from_secs(60));

        assert!(token.verify(&issuer.public_key()));
        assert!(!token.verify(&Issuer::random().public_key()));
        assert!(!token.is_expired());

        let mut forged = token.clone();
        forged.user_id = "mallory".to_string();
        assert!(!forged.verify(&issuer.public_key()));
    }

    #[test]
    fn expired_token() {
        let issuer = Issuer::random();
        let mut token = issuer.issue("bob", [3; 32], Duration::ZERO);
        token.expires_at -= 1;

        assert!(token.is_expired());
    }

    #[test]
    fn bootstrap_list_signature() {
        let issuer = Issuer::random();
        let peers = vec![
            (Id::random(), SocketAddr::from(([127, 0, 0, 1], 4000))),
            (Id::random(), SocketAddr::from(([10, 0, 0, 2], 4001))),
        ];

        let list = issuer.sign_bootstrap(peers);
        assert!(list.verify(&issuer.public_key()));
        assert_eq!(list.contacts().len(), 2);

        let mut tampered = list.clone();
        tampered.peers.pop();
        assert!(!tampered.verify(&issuer.public_key()));
    }
}
