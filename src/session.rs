//! Session records and the per-session locking store that owns them.
//!
//! Every peer device has at most one [`SessionRecord`]. Access goes through
//! [`SessionStore::transact`], which holds that address's lock for the
//! duration of one closure and persists the result before releasing it.
//! Different addresses never contend on the same lock.

use crate::error::{Error, Result};
use crate::keys::PublicKey;
use crate::ratchet::RatchetState;
use crate::storage::{decode_versioned, encode_versioned, Namespace, Storage};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// Storage format version of a [`SessionRecord`].
pub const SESSION_RECORD_VERSION: u8 = 1;

/// Ratchet algorithm carried by records written by this build.
pub const RATCHET_VERSION: u8 = 1;

/// Handshake base keys remembered after a session is replaced.
const MAX_RETIRED_BASE_KEYS: usize = 16;

/// A peer device, as supplied by the authentication layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionAddress {
    pub user_id: String,
    pub device_id: u32,
}

impl SessionAddress {
    pub fn new(user_id: impl Into<String>, device_id: u32) -> Self {
        Self {
            user_id: user_id.into(),
            device_id,
        }
    }

    pub(crate) fn storage_key(&self) -> String {
        format!("{}.{}", self.user_id, self.device_id)
    }

    pub(crate) fn from_storage_key(key: &str) -> Option<Self> {
        let (user_id, device_id) = key.rsplit_once('.')?;
        Some(Self::new(user_id, device_id.parse().ok()?))
    }
}

impl fmt::Display for SessionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.user_id, self.device_id)
    }
}

/// Handshake details the initiator repeats on every message until the
/// responder answers, so any of them can bootstrap the responder session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPreKey {
    /// Local registration id, echoed to the responder
    pub registration_id: u32,
    pub signed_prekey_id: u32,
    pub one_time_prekey_id: Option<u32>,
    pub base_key: PublicKey,
}

/// Coarse lifecycle of a peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    NoSession,
    /// Bundle fetch or handshake in flight
    Establishing,
    Active,
}

/// Durable per-peer-device session state.
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    ratchet_version: u8,
    pub(crate) ratchet: RatchetState,
    local_identity: PublicKey,
    remote_identity: PublicKey,
    associated_data: Vec<u8>,
    remote_registration_id: u32,
    base_key: PublicKey,
    retired_base_keys: Vec<PublicKey>,
    pub(crate) pending_prekey: Option<PendingPreKey>,
    created_at: u64,
}

impl SessionRecord {
    pub(crate) fn new(
        ratchet: RatchetState,
        local_identity: PublicKey,
        remote_identity: PublicKey,
        associated_data: Vec<u8>,
        remote_registration_id: u32,
        base_key: PublicKey,
        pending_prekey: Option<PendingPreKey>,
    ) -> Self {
        Self {
            ratchet_version: RATCHET_VERSION,
            ratchet,
            local_identity,
            remote_identity,
            associated_data,
            remote_registration_id,
            base_key,
            retired_base_keys: Vec::new(),
            pending_prekey,
            created_at: unix_now(),
        }
    }

    /// Carries handshake history over from the session this one replaces.
    pub(crate) fn inherit_history(&mut self, previous: &SessionRecord) {
        self.retired_base_keys = previous.retired_base_keys.clone();
        self.retired_base_keys.push(previous.base_key);
        let excess = self.retired_base_keys.len().saturating_sub(MAX_RETIRED_BASE_KEYS);
        self.retired_base_keys.drain(..excess);
    }

    /// Whether `base_key` belongs to this or an earlier handshake with the peer.
    #[must_use]
    pub fn has_seen_base_key(&self, base_key: &PublicKey) -> bool {
        self.base_key == *base_key || self.retired_base_keys.contains(base_key)
    }

    #[must_use]
    pub fn ratchet_version(&self) -> u8 {
        self.ratchet_version
    }

    #[must_use]
    pub fn ratchet(&self) -> &RatchetState {
        &self.ratchet
    }

    #[must_use]
    pub fn local_identity(&self) -> &PublicKey {
        &self.local_identity
    }

    #[must_use]
    pub fn remote_identity(&self) -> &PublicKey {
        &self.remote_identity
    }

    /// `IK_initiator || IK_responder`, bound into every message.
    #[must_use]
    pub fn associated_data(&self) -> &[u8] {
        &self.associated_data
    }

    #[must_use]
    pub fn remote_registration_id(&self) -> u32 {
        self.remote_registration_id
    }

    /// Initiator ephemeral key of the handshake that created this session.
    #[must_use]
    pub fn base_key(&self) -> &PublicKey {
        &self.base_key
    }

    #[must_use]
    pub fn pending_prekey(&self) -> Option<&PendingPreKey> {
        self.pending_prekey.as_ref()
    }

    /// Unix seconds at which the session was established.
    #[must_use]
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        encode_versioned(SESSION_RECORD_VERSION, self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let record: Self = decode_versioned(SESSION_RECORD_VERSION, bytes)?;
        if record.ratchet_version != RATCHET_VERSION {
            return Err(Error::UnsupportedVersion(record.ratchet_version));
        }
        Ok(record)
    }
}

impl fmt::Debug for SessionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRecord")
            .field("ratchet_version", &self.ratchet_version)
            .field("ratchet", &self.ratchet)
            .field("remote_identity", &self.remote_identity)
            .field("pending_prekey", &self.pending_prekey.is_some())
            .finish_non_exhaustive()
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

#[derive(Default)]
struct Slot {
    loaded: bool,
    record: Option<SessionRecord>,
}

/// Session store with one lock per peer device.
///
/// The outer map lock is only held long enough to find, create or evict a
/// slot. Slots without a record are evicted once nobody else holds them.
pub struct SessionStore {
    storage: Arc<dyn Storage>,
    slots: Mutex<HashMap<SessionAddress, Arc<Mutex<Slot>>>>,
}

impl SessionStore {
    pub fn open(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, address: &SessionAddress) -> Result<Arc<Mutex<Slot>>> {
        let mut slots = self.slots.lock().map_err(|_| Error::StorageError)?;
        Ok(Arc::clone(slots.entry(address.clone()).or_default()))
    }

    /// Evicts the slot for `address` if it is empty and `slot` is the only
    /// handle outside the map.
    fn release(&self, address: &SessionAddress, slot: &Arc<Mutex<Slot>>) {
        let Ok(mut slots) = self.slots.lock() else {
            return;
        };
        // the map's handle plus ours
        if Arc::strong_count(slot) > 2 {
            return;
        }
        let empty = slot
            .lock()
            .map_or(false, |slot| slot.loaded && slot.record.is_none());
        if empty {
            slots.remove(address);
        }
    }

    #[cfg(test)]
    pub(crate) fn cached_slots(&self) -> usize {
        self.slots.lock().map_or(0, |slots| slots.len())
    }

    fn ensure_loaded(&self, address: &SessionAddress, slot: &mut Slot) -> Result<()> {
        if !slot.loaded {
            slot.record = self
                .storage
                .load(Namespace::Session, &address.storage_key())?
                .map(|bytes| SessionRecord::from_bytes(&bytes))
                .transpose()?;
            slot.loaded = true;
        }
        Ok(())
    }

    /// Runs `f` with exclusive access to the session for `address`.
    ///
    /// `f` works on a copy. If it returns `Ok`, the copy is persisted and
    /// then becomes the current record; if it returns `Err` or persisting
    /// fails, the current record is left exactly as it was.
    pub fn transact<T, F>(&self, address: &SessionAddress, f: F) -> Result<T>
    where
        F: FnOnce(&mut Option<SessionRecord>) -> Result<T>,
    {
        let slot = self.slot(address)?;
        let result = self.transact_slot(address, &slot, f);
        self.release(address, &slot);
        result
    }

    fn transact_slot<T, F>(&self, address: &SessionAddress, slot: &Mutex<Slot>, f: F) -> Result<T>
    where
        F: FnOnce(&mut Option<SessionRecord>) -> Result<T>,
    {
        let mut slot = slot.lock().map_err(|_| Error::StorageError)?;
        self.ensure_loaded(address, &mut slot)?;

        let mut working = slot.record.clone();
        let output = f(&mut working)?;

        let key = address.storage_key();
        match &working {
            Some(record) => self
                .storage
                .store(Namespace::Session, &key, &record.to_bytes()?)?,
            None if slot.record.is_some() => self.storage.remove(Namespace::Session, &key)?,
            None => {}
        }
        slot.record = working;
        Ok(output)
    }

    /// Snapshot of the current record.
    pub fn load(&self, address: &SessionAddress) -> Result<Option<SessionRecord>> {
        let slot = self.slot(address)?;
        let record = slot.lock().map_err(|_| Error::StorageError).and_then(|mut guard| {
            self.ensure_loaded(address, &mut guard)?;
            Ok(guard.record.clone())
        });
        self.release(address, &slot);
        record
    }

    pub fn contains(&self, address: &SessionAddress) -> Result<bool> {
        Ok(self.load(address)?.is_some())
    }

    /// Removes the session, returning whether one existed.
    pub fn delete(&self, address: &SessionAddress) -> Result<bool> {
        self.transact(address, |record| Ok(record.take().is_some()))
    }

    /// Addresses with a persisted session.
    pub fn addresses(&self) -> Result<Vec<SessionAddress>> {
        let mut addresses: Vec<_> = self
            .storage
            .keys(Namespace::Session)?
            .iter()
            .filter_map(|key| SessionAddress::from_storage_key(key))
            .collect();
        addresses.sort();
        Ok(addresses)
    }

    /// Serialized form of the current record, for byte-level comparisons.
    pub fn encoded(&self, address: &SessionAddress) -> Result<Option<Vec<u8>>> {
        self.load(address)?
            .map(|record| record.to_bytes())
            .transpose()
    }
}
