//! Node facade: builder, single RPCs and iterative operations.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use tracing::{debug, info};

use crate::async_result::AsyncResult;
use crate::common::{Contact, FindValueRequest, FindValueResponse, Id, SelectMode, StoreRequest};
use crate::identity::{random_signing_key, BootstrapList, IdentityToken, Issuer};
use crate::maintenance;
use crate::query::{self, check_size, unsigned_request};
use crate::rpc::{Config, Info, Rpc};
use crate::security::Ed25519Security;
use crate::snapshot::Snapshot;
use crate::storage::{BatchItem, ContentFilter, MemoryStorage, Storage, StorageEntry};
use crate::{Error, Result, TaskError};

/// Validity of tokens issued through [NodeBuilder::issued_by].
pub const DEFAULT_TOKEN_VALIDITY: Duration = Duration::from_secs(24 * 60 * 60);

/// Remote side of a single RPC, either a known [Contact] or an [Id] resolved
/// through the routing table when the call runs.
#[derive(Debug, Clone, PartialEq)]
pub enum Addressee {
    Contact(Contact),
    Id(Id),
}

impl Addressee {
    fn resolve(&self, rpc: &Rpc) -> Result<Contact, TaskError> {
        match self {
            Addressee::Contact(contact) => Ok(contact.clone()),
            Addressee::Id(id) => rpc.resolve(id),
        }
    }
}

impl From<Contact> for Addressee {
    fn from(contact: Contact) -> Self {
        Addressee::Contact(contact)
    }
}

impl From<&Contact> for Addressee {
    fn from(contact: &Contact) -> Self {
        Addressee::Contact(contact.clone())
    }
}

impl From<Id> for Addressee {
    fn from(id: Id) -> Self {
        Addressee::Id(id)
    }
}

#[derive(Debug, Default)]
/// Builder for a [Node].
pub struct NodeBuilder {
    config: Config,
    signing_key: Option<SigningKey>,
    identity: Option<IdentityToken>,
    issuer_key: Option<[u8; 32]>,
    address: Option<SocketAddr>,
    bootstrap: Option<BootstrapList>,
    storage: Option<Arc<dyn Storage>>,
    snapshot: Option<Snapshot>,
}

impl NodeBuilder {
    /// Replace the whole [Config].
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Key signing every authenticator and entry of this node.
    pub fn signing_key(mut self, signing_key: SigningKey) -> Self {
        self.signing_key = Some(signing_key);
        self
    }

    /// Issuer signed token binding this node's id to [Self::signing_key].
    pub fn identity(mut self, token: IdentityToken) -> Self {
        self.identity = Some(token);
        self
    }

    /// Public key of the issuer every peer token must be signed by.
    pub fn issuer_key(mut self, issuer_key: [u8; 32]) -> Self {
        self.issuer_key = Some(issuer_key);
        self
    }

    /// Generate a signing key and have `issuer` bind it to `user_id`.
    pub fn issued_by(self, issuer: &Issuer, user_id: &str) -> Self {
        let signing_key = random_signing_key();
        let token = issuer.issue(
            user_id,
            signing_key.verifying_key().to_bytes(),
            DEFAULT_TOKEN_VALIDITY,
        );

        self.signing_key(signing_key)
            .identity(token)
            .issuer_key(issuer.public_key())
    }

    /// Address to bind the UDP socket to.
    ///
    /// Defaults to `0.0.0.0:0`.
    pub fn bind(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }

    /// Issuer signed list of peers used by [Node::bootstrap].
    pub fn bootstrap(mut self, list: BootstrapList) -> Self {
        self.bootstrap = Some(list);
        self
    }

    /// Storage engine, defaults to [MemoryStorage].
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Restore contacts and content, and the identity token unless one is set.
    pub fn restore(mut self, snapshot: Snapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    /// Bind the socket, start the listener and maintenance threads.
    pub fn build(self) -> Result<Node> {
        let issuer_key = self
            .issuer_key
            .ok_or(Error::InvalidConfig("issuer key is required"))?;
        let signing_key = self
            .signing_key
            .ok_or(Error::InvalidConfig("signing key is required"))?;
        let identity = self
            .identity
            .or_else(|| self.snapshot.as_ref().map(|s| s.identity.clone()))
            .ok_or(Error::InvalidConfig("identity token is required"))?;

        let bootstrap = match self.bootstrap {
            Some(list) if !list.verify(&issuer_key) => return Err(Error::UntrustedBootstrapList),
            Some(list) => list.contacts(),
            None => Vec::new(),
        };

        let security = Ed25519Security::new(signing_key, identity, issuer_key)?;
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));
        let address = self
            .address
            .unwrap_or(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));

        let rpc = Rpc::new(self.config, Box::new(security), storage, address)?;

        if let Some(snapshot) = self.snapshot {
            restore(&rpc, snapshot);
        }

        rpc.start()?;

        let maintained = rpc.clone();
        thread::Builder::new()
            .name("authdht-maintenance".to_string())
            .spawn(move || maintenance::run(maintained))?;

        info!(id = ?rpc.id(), address = ?rpc.local_addr(), "authdht node listening");

        let bootstrap = bootstrap
            .into_iter()
            .filter(|contact| contact.id() != rpc.id())
            .collect();

        Ok(Node {
            inner: Arc::new(Inner { rpc, bootstrap }),
        })
    }
}

#[derive(Debug)]
struct Inner {
    rpc: Arc<Rpc>,
    bootstrap: Vec<Contact>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.rpc.shutdown();
    }
}

#[derive(Debug, Clone)]
/// A DHT node. Cloning is cheap, the node shuts down once every clone is dropped.
pub struct Node {
    inner: Arc<Inner>,
}

impl Node {
    /// Returns a builder to configure a [Node].
    pub fn builder() -> NodeBuilder {
        NodeBuilder::default()
    }

    // === Getters ===

    pub fn id(&self) -> Id {
        *self.rpc().id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.rpc().local_addr()
    }

    /// This node as a contact, with the address its socket is bound to.
    pub fn contact(&self) -> Contact {
        self.rpc().local_contact()
    }

    pub fn identity(&self) -> IdentityToken {
        self.rpc().security().identity().clone()
    }

    pub fn config(&self) -> &Config {
        self.rpc().config()
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        self.rpc().storage()
    }

    /// Every active contact of the routing table.
    pub fn contacts(&self) -> Vec<Contact> {
        self.rpc().routing_table().contacts()
    }

    /// Up to `count` contacts closest to `target`.
    pub fn select(&self, target: &Id, count: usize, mode: SelectMode) -> Vec<Contact> {
        self.rpc().routing_table().select(target, count, mode)
    }

    pub fn info(&self) -> Info {
        self.rpc().info()
    }

    pub fn is_shutdown(&self) -> bool {
        self.rpc().is_shutdown()
    }

    // === Single RPCs ===

    pub fn ping<A: Into<Addressee>>(&self, to: A) -> AsyncResult<()> {
        let to = to.into();

        self.spawn("authdht-ping", move |rpc| rpc.ping(&to.resolve(&rpc)?))
    }

    pub fn find_node<A: Into<Addressee>>(&self, to: A, target: Id) -> AsyncResult<Vec<Contact>> {
        let to = to.into();

        self.spawn("authdht-find-node", move |rpc| {
            rpc.find_node(&to.resolve(&rpc)?, target)
        })
    }

    /// Entries of `key` stored at `to`, or the contacts it knows closest to `key`.
    pub fn find_value<A: Into<Addressee>>(
        &self,
        to: A,
        key: Id,
        filter: ContentFilter,
    ) -> AsyncResult<FindValueResponse> {
        let to = to.into();
        let request = FindValueRequest {
            key,
            filter,
            counters_only: false,
        };

        self.spawn("authdht-find-value", move |rpc| {
            rpc.find_value(&to.resolve(&rpc)?, request)
        })
    }

    /// Sign `items` and store them at `to` only.
    ///
    /// Fails right away, before anything is sent, if the content is too large.
    pub fn store<A: Into<Addressee>>(
        &self,
        to: A,
        key: Id,
        items: Vec<BatchItem>,
    ) -> Result<AsyncResult<bool>> {
        let request = self.signed_request(key, items);
        check_size(self.rpc(), &request)?;

        let to = to.into();

        Ok(self.spawn("authdht-store", move |rpc| {
            rpc.store(&to.resolve(&rpc)?, request)
        }))
    }

    // === Iterative operations ===

    /// The K contacts closest to `target` that answered.
    pub fn lookup(&self, target: Id) -> AsyncResult<Vec<Contact>> {
        self.spawn("authdht-lookup", move |rpc| Ok(query::lookup(rpc, target)))
    }

    /// Up to `n` entries of `key` matching `filter`, newest first.
    pub fn get(&self, key: Id, filter: ContentFilter, n: usize) -> AsyncResult<Vec<StorageEntry>> {
        self.spawn("authdht-get", move |rpc| Ok(query::get(rpc, key, filter, n)))
    }

    /// Counters of the content stored under `key`: per owner if `filter` names
    /// a content type, per content type otherwise.
    pub fn get_counters(
        &self,
        key: Id,
        filter: ContentFilter,
    ) -> AsyncResult<BTreeMap<String, u64>> {
        self.spawn("authdht-get-counters", move |rpc| {
            Ok(query::get_counters(rpc, key, filter))
        })
    }

    /// Sign `items` and store them at the K nodes closest to `key`.
    ///
    /// Resolves to the number of acknowledged stores. Fails right away, before
    /// anything is sent, if the content is too large.
    pub fn put(&self, key: Id, items: Vec<BatchItem>) -> Result<AsyncResult<usize>> {
        let request = self.signed_request(key, items);
        check_size(self.rpc(), &request)?;

        Ok(self.spawn("authdht-put", move |rpc| Ok(query::put(rpc, key, request))))
    }

    /// Store `items` as one unsigned envelope at the K nodes closest to `key`.
    ///
    /// Receiving nodes own the items to the authenticated sender.
    pub fn unsigned_put(&self, key: Id, items: &[BatchItem]) -> Result<AsyncResult<usize>> {
        let request = unsigned_request(self.rpc(), key, items)?;
        check_size(self.rpc(), &request)?;

        Ok(self.spawn("authdht-put", move |rpc| Ok(query::put(rpc, key, request))))
    }

    // === Public Methods ===

    /// Join the network through the bootstrap list.
    ///
    /// Resolves to true once a bootstrap contact led to a non-empty lookup of
    /// this node's own id, after which every bucket is refreshed.
    pub fn bootstrap(&self) -> AsyncResult<bool> {
        let contacts = self.inner.bootstrap.clone();

        self.spawn("authdht-bootstrap", move |rpc| Ok(bootstrap(&rpc, contacts)))
    }

    /// Drop every message whose sender token names `user_id`.
    pub fn blacklist(&self, user_id: &str) {
        self.rpc().blacklist(user_id);
    }

    /// Returns false if `user_id` was not blacklisted.
    pub fn unblacklist(&self, user_id: &str) -> bool {
        self.rpc().unblacklist(user_id)
    }

    /// Contacts, identity token and stored content of this node.
    pub fn snapshot(&self) -> Snapshot {
        let rpc = self.rpc();

        Snapshot {
            identity: rpc.security().identity().clone(),
            contacts: rpc.routing_table().contacts(),
            entries: rpc.storage().entries(),
        }
    }

    /// Stop the listener and maintenance threads.
    ///
    /// Running sessions end with their timeouts.
    pub fn shutdown(&self) {
        self.rpc().shutdown();
    }

    // === Private Methods ===

    fn rpc(&self) -> &Arc<Rpc> {
        &self.inner.rpc
    }

    fn signed_request(&self, key: Id, items: Vec<BatchItem>) -> StoreRequest {
        let rpc = self.rpc();

        let entries = items
            .into_iter()
            .map(|item| {
                let ttl = rpc.config().clamp_ttl(Some(item.ttl));
                rpc.security()
                    .build_entry(key, &item.content_type, item.value, ttl)
            })
            .collect();

        StoreRequest {
            entries,
            signed: true,
        }
    }

    fn spawn<T, F>(&self, name: &str, task: F) -> AsyncResult<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce(Arc<Rpc>) -> Result<T, TaskError> + Send + 'static,
    {
        if self.is_shutdown() {
            return AsyncResult::failed(TaskError::Shutdown);
        }

        let rpc = self.rpc().clone();
        AsyncResult::spawn(name, move || task(rpc))
    }
}

fn restore(rpc: &Rpc, snapshot: Snapshot) {
    let contacts = snapshot.contacts.len();
    {
        let mut table = rpc.routing_table();
        for contact in snapshot.contacts {
            table.add(contact);
        }
    }

    let mut entries = 0;
    for entry in snapshot.entries.into_iter().filter(|e| !e.is_expired()) {
        if rpc.storage().store(entry) {
            entries += 1;
        }
    }

    debug!(contacts, entries, "Restored snapshot");
}

fn bootstrap(rpc: &Arc<Rpc>, contacts: Vec<Contact>) -> bool {
    for contact in contacts {
        if rpc.is_shutdown() {
            return false;
        }

        let address = contact.address();
        rpc.routing_table().add(contact);

        if query::lookup(rpc.clone(), *rpc.id()).is_empty() {
            debug!(?address, "Bootstrap contact led nowhere");
            continue;
        }

        let targets = rpc.routing_table().refresh_targets(Duration::ZERO);
        for target in targets {
            query::lookup(rpc.clone(), target);
        }

        info!(
            id = ?rpc.id(),
            contacts = rpc.routing_table().size(),
            "Bootstrapped"
        );
        return true;
    }

    false
}

#[cfg(test)]
mod test {
    use bytes::Bytes;

    use super::*;
    use crate::rpc::MAX_DATAGRAM_SIZE;

    fn localhost() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
    }

    fn item(size: usize) -> BatchItem {
        BatchItem {
            content_type: "text".to_string(),
            value: Bytes::from(vec![0; size]),
            ttl: Duration::from_secs(60),
        }
    }

    #[test]
    fn identity_is_required() {
        let result = Node::builder()
            .issuer_key(Issuer::random().public_key())
            .bind(localhost())
            .build();

        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn foreign_bootstrap_list_is_rejected() {
        let issuer = Issuer::random();
        let list = Issuer::random().sign_bootstrap(vec![(Id::random(), localhost())]);

        let result = Node::builder()
            .issued_by(&issuer, "alice")
            .bind(localhost())
            .bootstrap(list)
            .build();

        assert!(matches!(result, Err(Error::UntrustedBootstrapList)));
    }

    #[test]
    fn token_must_bind_the_signing_key() {
        let issuer = Issuer::random();
        let token = issuer.issue("alice", [1; 32], Duration::from_secs(60));

        let result = Node::builder()
            .signing_key(random_signing_key())
            .identity(token)
            .issuer_key(issuer.public_key())
            .bind(localhost())
            .build();

        assert!(matches!(result, Err(Error::InvalidKey(_))));
    }

    #[test]
    fn unknown_id_fails_without_network() {
        let node = Node::builder()
            .issued_by(&Issuer::random(), "alice")
            .bind(localhost())
            .build()
            .unwrap();

        let missing = Id::random();

        assert_eq!(
            node.ping(missing).wait(),
            Err(TaskError::UnknownContact(missing))
        );
        assert_eq!(node.info().datagrams_sent(), 0);
    }

    #[test]
    fn operations_fail_after_shutdown() {
        let node = Node::builder()
            .issued_by(&Issuer::random(), "alice")
            .bind(localhost())
            .build()
            .unwrap();

        node.shutdown();

        assert!(node.is_shutdown());
        assert_eq!(node.lookup(Id::random()).wait(), Err(TaskError::Shutdown));
    }

    #[test]
    fn oversized_store_is_rejected_synchronously() {
        let node = Node::builder()
            .issued_by(&Issuer::random(), "alice")
            .bind(localhost())
            .build()
            .unwrap();

        let to = Contact::new(Id::random(), localhost());
        let result = node.store(to, Id::digest("topic"), vec![item(70_000)]);

        assert!(matches!(
            result,
            Err(Error::ContentTooLarge {
                size: 70_000,
                max: 64_000
            })
        ));
        assert!(matches!(
            node.unsigned_put(Id::digest("topic"), &[item(40_000), item(30_000)]),
            Err(Error::ContentTooLarge { .. })
        ));
        assert_eq!(node.info().datagrams_sent(), 0);
    }

    #[test]
    fn store_must_fit_one_datagram() {
        let node = Node::builder()
            .issued_by(&Issuer::random(), "alice")
            .bind(localhost())
            .build()
            .unwrap();

        // Well below the content limit, but every signed entry carries its
        // own signature and metadata.
        let items: Vec<_> = (0..1000).map(|_| item(1)).collect();

        let Err(Error::ContentTooLarge { size, max }) =
            node.put(Id::digest("topic"), items.clone())
        else {
            panic!("expected the put to be rejected");
        };
        assert!(size > max);
        assert!(max < MAX_DATAGRAM_SIZE);

        let to = Contact::new(Id::random(), localhost());
        assert!(matches!(
            node.store(to, Id::digest("topic"), items),
            Err(Error::ContentTooLarge { .. })
        ));
        assert_eq!(node.info().datagrams_sent(), 0);
    }
}
