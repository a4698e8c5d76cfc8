//! Versioned snapshot of a node's persistent state.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::common::{Contact, WireContact, WireEntry, WireToken};
use crate::identity::IdentityToken;
use crate::storage::StorageEntry;
use crate::{Error, Result};

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: i64 = 1;

/// Contacts, identity token and stored content of a node, independent of the
/// live node so it can be written to disk and used to restore a node later.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub identity: IdentityToken,
    pub contacts: Vec<Contact>,
    pub entries: Vec<StorageEntry>,
}

#[derive(Serialize, Deserialize, Debug)]
struct WireSnapshot {
    #[serde(rename = "v")]
    version: i64,

    #[serde(rename = "t")]
    identity: WireToken,

    #[serde(rename = "c")]
    contacts: Vec<WireContact>,

    #[serde(rename = "e")]
    entries: Vec<WireEntry>,
}

impl Snapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let wire = WireSnapshot {
            version: SNAPSHOT_VERSION,
            identity: (&self.identity).into(),
            contacts: self.contacts.iter().map(WireContact::from).collect(),
            entries: self.entries.iter().map(WireEntry::from).collect(),
        };

        Ok(serde_bencode::to_bytes(&wire)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Snapshot> {
        let wire: WireSnapshot = serde_bencode::from_bytes(bytes)?;

        if wire.version != SNAPSHOT_VERSION {
            return Err(Error::UnsupportedSnapshotVersion(wire.version));
        }

        Ok(Snapshot {
            identity: wire.identity.try_into()?,
            contacts: wire
                .contacts
                .into_iter()
                .map(Contact::try_from)
                .collect::<Result<_>>()?,
            entries: wire
                .entries
                .into_iter()
                .map(StorageEntry::try_from)
                .collect::<Result<_>>()?,
        })
    }

    /// Writes the snapshot to `path`, replacing any existing file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Snapshot> {
        Snapshot::from_bytes(&fs::read(path)?)
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::common::Id;
    use crate::identity::Issuer;

    fn snapshot() -> Snapshot {
        let issuer = Issuer::random();

        Snapshot {
            identity: issuer.issue("alice", [7; 32], Duration::from_secs(60)),
            contacts: vec![
                Contact::new(Id::random(), "127.0.0.1:4000".parse().unwrap()),
                Contact::new(Id::random(), "[::1]:4001".parse().unwrap()),
            ],
            entries: vec![StorageEntry::unsigned(
                Id::digest("topic"),
                "text",
                Bytes::from_static(b"hello"),
                "alice",
                Duration::from_secs(3600),
            )],
        }
    }

    #[test]
    fn save_and_load() {
        let snapshot = snapshot();
        let path = std::env::temp_dir().join(format!("authdht-snapshot-{}", Id::random()));

        snapshot.save(&path).unwrap();
        let loaded = Snapshot::load(&path).unwrap();
        let _ = fs::remove_file(&path);

        assert_eq!(loaded, snapshot);
    }

    #[test]
    fn rejects_unknown_version() {
        let mut bumped = snapshot().to_bytes().unwrap();
        let version = bumped
            .windows(6)
            .position(|window| window == b"1:vi1e")
            .unwrap();
        bumped[version..version + 6].copy_from_slice(b"1:vi2e");

        assert!(matches!(
            Snapshot::from_bytes(&bumped),
            Err(Error::UnsupportedSnapshotVersion(2))
        ));
    }
}
