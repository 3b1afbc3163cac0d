//! Prekey directory boundary: publishing the local bundle and fetching peers'.
//!
//! The directory is remote, so this is the only layer (besides the relay)
//! that awaits. Everything it hands back is plain data for the synchronous
//! core.

use crate::error::{Error, Result};
use crate::keys::PublicKey;
use crate::keystore::KeyStore;
use crate::logging::Fingerprint;
use crate::session::SessionAddress;
use crate::x3dh::{PreKeyBundle, PublishedBundle};
use crate::xeddsa::Signature;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Published one-time prekey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePreKeyEntry {
    pub id: u32,
    /// Base64 public key
    pub public_key: String,
}

/// Directory document for one device, with keys in base64 so it can live
/// in any JSON-style document store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRecord {
    pub registration_id: u32,
    pub device_id: u32,
    pub identity_key: String,
    pub signed_prekey_id: u32,
    pub signed_prekey: String,
    pub signed_prekey_signature: String,
    pub one_time_prekeys: Vec<OneTimePreKeyEntry>,
}

fn encode_key(key: &PublicKey) -> String {
    STANDARD.encode(key.as_bytes())
}

fn decode_key(encoded: &str) -> Result<PublicKey> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|_| Error::InvalidPublicKey)?;
    PublicKey::try_from(bytes.as_slice())
}

impl From<&PublishedBundle> for DirectoryRecord {
    fn from(bundle: &PublishedBundle) -> Self {
        Self {
            registration_id: bundle.registration_id,
            device_id: bundle.device_id,
            identity_key: encode_key(&bundle.identity_key),
            signed_prekey_id: bundle.signed_prekey_id,
            signed_prekey: encode_key(&bundle.signed_prekey),
            signed_prekey_signature: STANDARD.encode(bundle.signed_prekey_signature.as_bytes()),
            one_time_prekeys: bundle
                .one_time_prekeys
                .iter()
                .map(|(id, key)| OneTimePreKeyEntry {
                    id: *id,
                    public_key: encode_key(key),
                })
                .collect(),
        }
    }
}

impl TryFrom<&DirectoryRecord> for PublishedBundle {
    type Error = Error;

    fn try_from(record: &DirectoryRecord) -> Result<Self> {
        let signature = STANDARD
            .decode(&record.signed_prekey_signature)
            .map_err(|_| Error::InvalidSignature)?;

        Ok(Self {
            registration_id: record.registration_id,
            device_id: record.device_id,
            identity_key: decode_key(&record.identity_key)?,
            signed_prekey_id: record.signed_prekey_id,
            signed_prekey: decode_key(&record.signed_prekey)?,
            signed_prekey_signature: Signature::try_from(signature.as_slice())?,
            one_time_prekeys: record
                .one_time_prekeys
                .iter()
                .map(|entry| Ok((entry.id, decode_key(&entry.public_key)?)))
                .collect::<Result<_>>()?,
        })
    }
}

/// Remote directory of published prekey bundles.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Stores the document for `address`.
    ///
    /// One-time prekeys are appended to those still on offer. Ids the
    /// directory already holds or has handed out are ignored, so a prekey is
    /// never issued twice. A document with a different identity key replaces
    /// the previous one outright.
    async fn publish(&self, address: &SessionAddress, record: DirectoryRecord) -> Result<()>;

    /// Returns a single-use bundle for `address`, removing the one-time
    /// prekey it hands out.
    ///
    /// # Errors
    /// `Unavailable` if nothing is published or the directory is unreachable.
    async fn fetch(&self, address: &SessionAddress) -> Result<PreKeyBundle>;

    /// Deletes the document for `address`.
    async fn remove(&self, address: &SessionAddress) -> Result<()>;
}

struct DirectoryEntry {
    record: DirectoryRecord,
    issued: HashSet<u32>,
}

impl DirectoryEntry {
    fn new(record: DirectoryRecord) -> Self {
        Self {
            record,
            issued: HashSet::new(),
        }
    }

    fn merge(&mut self, record: DirectoryRecord) {
        let mut offered = std::mem::take(&mut self.record.one_time_prekeys);
        for entry in &record.one_time_prekeys {
            let known =
                self.issued.contains(&entry.id) || offered.iter().any(|held| held.id == entry.id);
            if !known {
                offered.push(entry.clone());
            }
        }
        self.record = DirectoryRecord {
            one_time_prekeys: offered,
            ..record
        };
    }
}

/// In-process directory with switchable reachability and latency.
#[derive(Default)]
pub struct InMemoryDirectory {
    records: Mutex<HashMap<SessionAddress, DirectoryEntry>>,
    offline: AtomicBool,
    latency: Mutex<Duration>,
}

impl InMemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_online(&self, online: bool) {
        self.offline.store(!online, Ordering::SeqCst);
    }

    /// Delay applied to every fetch.
    pub fn set_latency(&self, latency: Duration) -> Result<()> {
        *self.latency.lock().map_err(|_| Error::Unavailable)? = latency;
        Ok(())
    }

    /// Stored document for `address`.
    pub fn record(&self, address: &SessionAddress) -> Result<Option<DirectoryRecord>> {
        Ok(self
            .records
            .lock()
            .map_err(|_| Error::Unavailable)?
            .get(address)
            .map(|entry| entry.record.clone()))
    }

    fn ensure_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Unavailable);
        }
        Ok(())
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn publish(&self, address: &SessionAddress, record: DirectoryRecord) -> Result<()> {
        self.ensure_online()?;
        let mut records = self.records.lock().map_err(|_| Error::Unavailable)?;
        match records.entry(address.clone()) {
            Entry::Occupied(mut occupied)
                if occupied.get().record.identity_key == record.identity_key =>
            {
                occupied.get_mut().merge(record);
            }
            Entry::Occupied(mut occupied) => {
                occupied.insert(DirectoryEntry::new(record));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(DirectoryEntry::new(record));
            }
        }
        Ok(())
    }

    async fn fetch(&self, address: &SessionAddress) -> Result<PreKeyBundle> {
        let latency = *self.latency.lock().map_err(|_| Error::Unavailable)?;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.ensure_online()?;

        let mut records = self.records.lock().map_err(|_| Error::Unavailable)?;
        let entry = records.get_mut(address).ok_or(Error::Unavailable)?;
        let mut published = PublishedBundle::try_from(&entry.record)?;
        let bundle = published.take_bundle();
        if !entry.record.one_time_prekeys.is_empty() {
            let issued = entry.record.one_time_prekeys.remove(0);
            entry.issued.insert(issued.id);
        }
        Ok(bundle)
    }

    async fn remove(&self, address: &SessionAddress) -> Result<()> {
        self.ensure_online()?;
        self.records
            .lock()
            .map_err(|_| Error::Unavailable)?
            .remove(address);
        Ok(())
    }
}

/// Pushes the local public bundle to the directory.
pub struct BundlePublisher {
    key_store: Arc<KeyStore>,
    directory: Arc<dyn Directory>,
    address: SessionAddress,
    target: usize,
}

impl BundlePublisher {
    /// `target` is the one-time prekey pool size kept on replenishment.
    pub fn new(
        key_store: Arc<KeyStore>,
        directory: Arc<dyn Directory>,
        address: SessionAddress,
        target: usize,
    ) -> Self {
        Self {
            key_store,
            directory,
            address,
            target,
        }
    }

    /// Publishes the signed prekey and any one-time prekeys not uploaded yet.
    pub async fn publish(&self) -> Result<()> {
        let bundle = self.key_store.unpublished_bundle()?;
        self.publish_bundle(&bundle).await?;
        let uploaded: Vec<u32> = bundle.one_time_prekeys.iter().map(|(id, _)| *id).collect();
        self.key_store.mark_published(&uploaded)
    }

    /// Tops up the one-time prekey pool and publishes the result.
    pub async fn replenish_and_publish<R: CryptoRngCore + Send>(&self, rng: &mut R) -> Result<()> {
        self.key_store.replenish_one_time_prekeys(rng, self.target)?;
        self.publish().await
    }

    /// Rotates the signed prekey and publishes the result.
    pub async fn rotate_and_publish<R: CryptoRngCore + Send>(&self, rng: &mut R) -> Result<()> {
        self.key_store.rotate_signed_prekey(rng)?;
        self.publish().await
    }

    async fn publish_bundle(&self, bundle: &PublishedBundle) -> Result<()> {
        let record = DirectoryRecord::from(bundle);
        match self.directory.publish(&self.address, record).await {
            Ok(()) => {
                tracing::info!(
                    address = %self.address,
                    identity = %Fingerprint(&bundle.identity_key),
                    signed_prekey_id = bundle.signed_prekey_id,
                    one_time_prekeys = bundle.one_time_prekeys.len(),
                    "published prekey bundle"
                );
                Ok(())
            }
            Err(err) => {
                tracing::warn!(address = %self.address, error = %err, "bundle publish failed");
                Err(err)
            }
        }
    }
}

/// Marks the newest fetch for an address. Dropping it clears the mark
/// unless a newer fetch has taken it over, including when the fetching
/// future is cancelled.
struct LatestFetch<'a> {
    latest: &'a Mutex<HashMap<SessionAddress, u64>>,
    address: &'a SessionAddress,
    generation: u64,
}

impl LatestFetch<'_> {
    fn is_current(&self) -> Result<bool> {
        let latest = self.latest.lock().map_err(|_| Error::Unavailable)?;
        Ok(latest.get(self.address) == Some(&self.generation))
    }
}

impl Drop for LatestFetch<'_> {
    fn drop(&mut self) {
        if let Ok(mut latest) = self.latest.lock() {
            if latest.get(self.address) == Some(&self.generation) {
                latest.remove(self.address);
            }
        }
    }
}

/// Fetches peers' bundles with a timeout, letting a newer fetch for the same
/// address supersede an older one.
pub struct BundleFetcher {
    directory: Arc<dyn Directory>,
    timeout: Duration,
    generation: AtomicU64,
    latest: Mutex<HashMap<SessionAddress, u64>>,
}

impl BundleFetcher {
    pub fn new(directory: Arc<dyn Directory>, timeout: Duration) -> Self {
        Self {
            directory,
            timeout,
            generation: AtomicU64::new(0),
            latest: Mutex::new(HashMap::new()),
        }
    }

    /// Fetches a bundle for `address`.
    ///
    /// # Errors
    /// - `Unavailable` if the peer has no bundle, the directory is down, or
    ///   the timeout expires
    /// - `Superseded` if another fetch for `address` started meanwhile
    pub async fn fetch(&self, address: &SessionAddress) -> Result<PreKeyBundle> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.latest
            .lock()
            .map_err(|_| Error::Unavailable)?
            .insert(address.clone(), generation);
        let registration = LatestFetch {
            latest: &self.latest,
            address,
            generation,
        };

        let outcome = tokio::time::timeout(self.timeout, self.directory.fetch(address)).await;

        if !registration.is_current()? {
            tracing::debug!(peer = %address, "bundle fetch superseded");
            return Err(Error::Superseded);
        }

        match outcome {
            Ok(Ok(bundle)) => {
                tracing::info!(
                    peer = %address,
                    identity = %Fingerprint(&bundle.identity_key),
                    signed_prekey_id = bundle.signed_prekey_id,
                    one_time_prekey = ?bundle.one_time_prekey.map(|(id, _)| id),
                    "fetched prekey bundle"
                );
                Ok(bundle)
            }
            Ok(Err(err)) => {
                tracing::info!(peer = %address, error = %err, "bundle fetch failed");
                Err(err)
            }
            Err(_) => {
                tracing::warn!(peer = %address, timeout = ?self.timeout, "bundle fetch timed out");
                Err(Error::Unavailable)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::storage::InMemoryStorage;
    use rand_core::OsRng;

    fn key_store(one_time_prekeys: usize) -> Arc<KeyStore> {
        let store = KeyStore::open(Arc::new(InMemoryStorage::new()), 1, SessionConfig::default()).unwrap();
        store.generate_identity(&mut OsRng).unwrap();
        store.rotate_signed_prekey(&mut OsRng).unwrap();
        store
            .replenish_one_time_prekeys(&mut OsRng, one_time_prekeys)
            .unwrap();
        Arc::new(store)
    }

    #[test]
    fn test_record_document_format() {
        let bundle = key_store(2).public_bundle().unwrap();
        let record = DirectoryRecord::from(&bundle);

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["one_time_prekeys"].as_array().unwrap().len(), 2);
        assert_eq!(json["identity_key"].as_str().unwrap().len(), 44);

        let parsed: DirectoryRecord = serde_json::from_value(json).unwrap();
        assert_eq!(PublishedBundle::try_from(&parsed).unwrap(), bundle);
    }

    #[test]
    fn test_record_rejects_bad_keys() {
        let mut record = DirectoryRecord::from(&key_store(1).public_bundle().unwrap());
        record.signed_prekey = STANDARD.encode([1u8; 31]);
        assert_eq!(
            PublishedBundle::try_from(&record).unwrap_err(),
            Error::InvalidPublicKey
        );

        let mut record = DirectoryRecord::from(&key_store(1).public_bundle().unwrap());
        record.signed_prekey_signature = "***".into();
        assert_eq!(
            PublishedBundle::try_from(&record).unwrap_err(),
            Error::InvalidSignature
        );
    }

    #[tokio::test]
    async fn test_fetch_hands_out_each_one_time_prekey_once() {
        let directory = Arc::new(InMemoryDirectory::new());
        let address = SessionAddress::new("bob", 1);
        let publisher = BundlePublisher::new(key_store(2), directory.clone(), address.clone(), 2);
        publisher.publish().await.unwrap();

        let first = directory.fetch(&address).await.unwrap();
        let second = directory.fetch(&address).await.unwrap();
        let third = directory.fetch(&address).await.unwrap();

        assert!(first.one_time_prekey.is_some());
        assert!(second.one_time_prekey.is_some());
        assert_ne!(first.one_time_prekey, second.one_time_prekey);
        assert_eq!(third.one_time_prekey, None);
        third.verify_signature().unwrap();
    }

    #[tokio::test]
    async fn test_fetch_unpublished_or_offline() {
        let directory = Arc::new(InMemoryDirectory::new());
        let address = SessionAddress::new("bob", 1);
        assert_eq!(directory.fetch(&address).await.unwrap_err(), Error::Unavailable);

        BundlePublisher::new(key_store(1), directory.clone(), address.clone(), 1)
            .publish()
            .await
            .unwrap();
        directory.set_online(false);
        assert_eq!(directory.fetch(&address).await.unwrap_err(), Error::Unavailable);
        directory.set_online(true);
        assert!(directory.fetch(&address).await.is_ok());
    }

    #[tokio::test]
    async fn test_replenish_and_publish() {
        let directory = Arc::new(InMemoryDirectory::new());
        let address = SessionAddress::new("bob", 1);
        let store = key_store(0);
        let publisher = BundlePublisher::new(Arc::clone(&store), directory.clone(), address.clone(), 5);

        publisher.replenish_and_publish(&mut OsRng).await.unwrap();
        assert_eq!(store.one_time_prekey_count().unwrap(), 5);
        let record = directory.record(&address).unwrap().unwrap();
        assert_eq!(record.one_time_prekeys.len(), 5);

        let before = record.signed_prekey_id;
        publisher.rotate_and_publish(&mut OsRng).await.unwrap();
        let record = directory.record(&address).unwrap().unwrap();
        assert_eq!(record.signed_prekey_id, before + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_timeout_is_unavailable() {
        let directory = Arc::new(InMemoryDirectory::new());
        let address = SessionAddress::new("bob", 1);
        BundlePublisher::new(key_store(1), directory.clone(), address.clone(), 1)
            .publish()
            .await
            .unwrap();
        directory.set_latency(Duration::from_secs(60)).unwrap();

        let fetcher = BundleFetcher::new(directory, Duration::from_secs(10));
        assert_eq!(fetcher.fetch(&address).await.unwrap_err(), Error::Unavailable);
    }

    #[tokio::test]
    async fn test_republish_never_reissues_handed_out_keys() {
        let directory = Arc::new(InMemoryDirectory::new());
        let address = SessionAddress::new("bob", 1);
        let store = key_store(2);
        let publisher = BundlePublisher::new(Arc::clone(&store), directory.clone(), address.clone(), 2);
        publisher.publish().await.unwrap();

        let handed_out = directory.fetch(&address).await.unwrap().one_time_prekey.unwrap().0;
        publisher.publish().await.unwrap();
        // a client that still uploads its whole pool
        directory
            .publish(&address, DirectoryRecord::from(&store.public_bundle().unwrap()))
            .await
            .unwrap();

        let record = directory.record(&address).unwrap().unwrap();
        assert_eq!(record.one_time_prekeys.len(), 1);
        assert!(record.one_time_prekeys.iter().all(|entry| entry.id != handed_out));

        store.consume_one_time_prekey(handed_out).unwrap();
        publisher.replenish_and_publish(&mut OsRng).await.unwrap();
        let ids: Vec<u32> = directory
            .record(&address)
            .unwrap()
            .unwrap()
            .one_time_prekeys
            .iter()
            .map(|entry| entry.id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(!ids.contains(&handed_out));
    }

    #[tokio::test]
    async fn test_new_identity_replaces_document() {
        let directory = Arc::new(InMemoryDirectory::new());
        let address = SessionAddress::new("bob", 1);
        BundlePublisher::new(key_store(2), directory.clone(), address.clone(), 2)
            .publish()
            .await
            .unwrap();
        directory.fetch(&address).await.unwrap();
        directory.fetch(&address).await.unwrap();

        let reinstalled = key_store(2);
        BundlePublisher::new(Arc::clone(&reinstalled), directory.clone(), address.clone(), 2)
            .publish()
            .await
            .unwrap();

        let record = directory.record(&address).unwrap().unwrap();
        assert_eq!(record.one_time_prekeys.len(), 2);
        assert_eq!(
            decode_key(&record.identity_key).unwrap(),
            *reinstalled.identity().unwrap().public_key()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_fetch_clears_its_registration() {
        let directory = Arc::new(InMemoryDirectory::new());
        let address = SessionAddress::new("bob", 1);
        BundlePublisher::new(key_store(1), directory.clone(), address.clone(), 1)
            .publish()
            .await
            .unwrap();
        directory.set_latency(Duration::from_secs(5)).unwrap();

        let fetcher = BundleFetcher::new(directory, Duration::from_secs(10));
        let cancelled = tokio::time::timeout(Duration::from_secs(1), fetcher.fetch(&address)).await;

        assert!(cancelled.is_err());
        assert!(fetcher.latest.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_fetch_supersedes_older() {
        let directory = Arc::new(InMemoryDirectory::new());
        let address = SessionAddress::new("bob", 1);
        BundlePublisher::new(key_store(2), directory.clone(), address.clone(), 2)
            .publish()
            .await
            .unwrap();
        directory.set_latency(Duration::from_secs(1)).unwrap();

        let fetcher = BundleFetcher::new(directory, Duration::from_secs(10));
        let (older, newer) = tokio::join!(fetcher.fetch(&address), fetcher.fetch(&address));

        assert_eq!(older.unwrap_err(), Error::Superseded);
        assert!(newer.is_ok());
    }
}
