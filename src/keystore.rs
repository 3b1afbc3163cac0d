//! Local key custody: identity, signed prekeys and one-time prekeys.
//!
//! All state lives in one record under [`Namespace::KeyStore`]. Mutations
//! are applied to a copy, persisted, and only then swapped in, so a failed
//! write leaves both the database and memory on the previous state. The
//! store has its own lock, independent of any session lock.

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::keys::{IdentityKeyPair, PublicKey, SecretKey};
use crate::logging::Fingerprint;
use crate::session::unix_now;
use crate::storage::{decode_versioned, encode_versioned, Namespace, Storage};
use crate::x3dh::{signed_prekey_message, PublishedBundle};
use crate::xeddsa::Signature;
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

const KEYSTORE_RECORD_VERSION: u8 = 1;
const STATE_KEY: &str = "state";

/// Registration ids are drawn from `1..=MAX_REGISTRATION_ID`.
pub const MAX_REGISTRATION_ID: u32 = 16380;

#[derive(Clone, Serialize, Deserialize)]
struct SignedPreKeyRecord {
    id: u32,
    secret: SecretKey,
    public: PublicKey,
    signature: Signature,
    created_at: u64,
}

#[derive(Clone, Serialize, Deserialize)]
struct RetiredSignedPreKey {
    record: SignedPreKeyRecord,
    retired_at: u64,
}

#[derive(Clone, Default, Serialize, Deserialize)]
struct KeyStoreState {
    identity: Option<IdentityKeyPair>,
    registration_id: u32,
    signed_prekey: Option<SignedPreKeyRecord>,
    retired_signed_prekeys: Vec<RetiredSignedPreKey>,
    one_time_prekeys: BTreeMap<u32, SecretKey>,
    // ids already uploaded; the directory owns them from then on
    published_one_time_prekeys: BTreeSet<u32>,
    next_signed_prekey_id: u32,
    next_one_time_prekey_id: u32,
}

impl KeyStoreState {
    fn identity(&self) -> Result<&IdentityKeyPair> {
        self.identity.as_ref().ok_or(Error::KeyNotFound)
    }

    fn purge_retired(&mut self, now: u64, grace_secs: u64) -> usize {
        let before = self.retired_signed_prekeys.len();
        self.retired_signed_prekeys
            .retain(|retired| now.saturating_sub(retired.retired_at) < grace_secs);
        before - self.retired_signed_prekeys.len()
    }
}

/// Owner of the device's private key material.
pub struct KeyStore {
    storage: Arc<dyn Storage>,
    device_id: u32,
    config: SessionConfig,
    state: Mutex<KeyStoreState>,
}

impl KeyStore {
    /// Opens the key store, loading any persisted state.
    pub fn open(storage: Arc<dyn Storage>, device_id: u32, config: SessionConfig) -> Result<Self> {
        let state = match storage.load(Namespace::KeyStore, STATE_KEY)? {
            Some(bytes) => decode_versioned(KEYSTORE_RECORD_VERSION, &bytes)?,
            None => KeyStoreState::default(),
        };

        Ok(Self {
            storage,
            device_id,
            config,
            state: Mutex::new(state),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, KeyStoreState>> {
        self.state.lock().map_err(|_| Error::StorageError)
    }

    fn persist(&self, state: &KeyStoreState) -> Result<()> {
        let bytes = encode_versioned(KEYSTORE_RECORD_VERSION, state)?;
        self.storage.store(Namespace::KeyStore, STATE_KEY, &bytes)
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut KeyStoreState) -> Result<T>) -> Result<T> {
        let mut state = self.lock()?;
        let mut working = state.clone();
        let output = f(&mut working)?;
        self.persist(&working)?;
        *state = working;
        Ok(output)
    }

    #[must_use]
    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    /// Creates the identity keypair and registration id.
    ///
    /// # Errors
    /// `AlreadyExists` if an identity is present.
    pub fn generate_identity<R: CryptoRngCore>(&self, rng: &mut R) -> Result<PublicKey> {
        let public = self.mutate(|state| {
            if state.identity.is_some() {
                return Err(Error::AlreadyExists);
            }
            let identity = IdentityKeyPair::generate(rng);
            let public = *identity.public_key();
            state.identity = Some(identity);
            state.registration_id = rng.next_u32() % MAX_REGISTRATION_ID + 1;
            Ok(public)
        })?;

        tracing::info!(identity = %Fingerprint(&public), "generated identity key");
        Ok(public)
    }

    /// Whether an identity exists.
    pub fn has_identity(&self) -> Result<bool> {
        Ok(self.lock()?.identity.is_some())
    }

    pub fn identity(&self) -> Result<IdentityKeyPair> {
        self.lock()?.identity().cloned()
    }

    pub fn registration_id(&self) -> Result<u32> {
        let state = self.lock()?;
        state.identity()?;
        Ok(state.registration_id)
    }

    /// Rotates the signed prekey using the current wall clock.
    pub fn rotate_signed_prekey<R: CryptoRngCore>(&self, rng: &mut R) -> Result<u32> {
        self.rotate_signed_prekey_at(rng, unix_now())
    }

    /// Generates and signs a new signed prekey as of `now` (unix seconds).
    ///
    /// The previous key is retained for the grace period so handshakes
    /// started against it still complete; expired retired keys are purged.
    pub fn rotate_signed_prekey_at<R: CryptoRngCore>(&self, rng: &mut R, now: u64) -> Result<u32> {
        let grace = self.config.signed_prekey_grace_secs;
        let (id, purged) = self.mutate(|state| {
            let identity = state.identity()?;
            let secret = SecretKey::generate(rng);
            let public = secret.public_key();
            let signature = identity.sign(rng, &signed_prekey_message(identity.public_key(), &public))?;

            let id = state.next_signed_prekey_id;
            state.next_signed_prekey_id = id.wrapping_add(1);
            let previous = state.signed_prekey.replace(SignedPreKeyRecord {
                id,
                secret,
                public,
                signature,
                created_at: now,
            });
            if let Some(record) = previous {
                state.retired_signed_prekeys.push(RetiredSignedPreKey {
                    record,
                    retired_at: now,
                });
            }
            let purged = state.purge_retired(now, grace);
            Ok((id, purged))
        })?;

        tracing::info!(signed_prekey_id = id, purged, "rotated signed prekey");
        Ok(id)
    }

    /// Whether the current signed prekey is missing or older than the rotation interval.
    pub fn signed_prekey_due(&self, now: u64) -> Result<bool> {
        let state = self.lock()?;
        Ok(state.signed_prekey.as_ref().map_or(true, |current| {
            now.saturating_sub(current.created_at) >= self.config.signed_prekey_rotation_secs
        }))
    }

    /// Drops superseded signed prekeys whose grace period has ended.
    pub fn purge_retired_signed_prekeys(&self, now: u64) -> Result<usize> {
        let grace = self.config.signed_prekey_grace_secs;
        let purged = self.mutate(|state| Ok(state.purge_retired(now, grace)))?;
        if purged > 0 {
            tracing::info!(purged, "purged retired signed prekeys");
        }
        Ok(purged)
    }

    /// Secret half of the current or a retired signed prekey.
    pub fn signed_prekey(&self, id: u32) -> Result<SecretKey> {
        let state = self.lock()?;
        state
            .signed_prekey
            .iter()
            .chain(state.retired_signed_prekeys.iter().map(|retired| &retired.record))
            .find(|record| record.id == id)
            .map(|record| record.secret.clone())
            .ok_or(Error::KeyNotFound)
    }

    /// Tops the one-time prekey pool up to `target` and returns the public
    /// bundle to publish.
    pub fn replenish_one_time_prekeys<R: CryptoRngCore>(
        &self,
        rng: &mut R,
        target: usize,
    ) -> Result<PublishedBundle> {
        let added = self.mutate(|state| {
            state.identity()?;
            let missing = target.saturating_sub(state.one_time_prekeys.len());
            for _ in 0..missing {
                let id = state.next_one_time_prekey_id;
                state.next_one_time_prekey_id = id.wrapping_add(1);
                state.one_time_prekeys.insert(id, SecretKey::generate(rng));
            }
            Ok(missing)
        })?;

        tracing::info!(added, target, "replenished one-time prekeys");
        self.public_bundle()
    }

    /// Whether the pool has fallen below the configured low-water mark.
    pub fn needs_replenish(&self) -> Result<bool> {
        Ok(self.one_time_prekey_count()? < self.config.prekey_low_water)
    }

    /// Secret half of a one-time prekey, without consuming it.
    pub fn one_time_prekey(&self, id: u32) -> Result<SecretKey> {
        self.lock()?
            .one_time_prekeys
            .get(&id)
            .cloned()
            .ok_or(Error::KeyNotFound)
    }

    /// Atomically removes a one-time prekey.
    ///
    /// # Errors
    /// `KeyNotFound` if the key is unknown or was already consumed.
    pub fn consume_one_time_prekey(&self, id: u32) -> Result<SecretKey> {
        let secret = self.mutate(|state| {
            state.published_one_time_prekeys.remove(&id);
            state.one_time_prekeys.remove(&id).ok_or(Error::KeyNotFound)
        })?;
        tracing::debug!(one_time_prekey_id = id, "consumed one-time prekey");
        Ok(secret)
    }

    pub fn one_time_prekey_count(&self) -> Result<usize> {
        Ok(self.lock()?.one_time_prekeys.len())
    }

    /// Public material with the whole unconsumed one-time prekey pool.
    ///
    /// # Errors
    /// `KeyNotFound` until an identity and a signed prekey exist.
    pub fn public_bundle(&self) -> Result<PublishedBundle> {
        let state = self.lock()?;
        self.bundle_from(&state, |_| true)
    }

    /// Public material carrying only one-time prekeys never uploaded before.
    ///
    /// Uploaded keys may already have been handed to an initiator, so they
    /// must not reach the directory a second time.
    pub fn unpublished_bundle(&self) -> Result<PublishedBundle> {
        let state = self.lock()?;
        self.bundle_from(&state, |id| !state.published_one_time_prekeys.contains(&id))
    }

    /// Records that the directory accepted the one-time prekeys `ids`.
    pub fn mark_published(&self, ids: &[u32]) -> Result<()> {
        self.mutate(|state| {
            for id in ids {
                if state.one_time_prekeys.contains_key(id) {
                    state.published_one_time_prekeys.insert(*id);
                }
            }
            Ok(())
        })
    }

    fn bundle_from(
        &self,
        state: &KeyStoreState,
        include: impl Fn(u32) -> bool,
    ) -> Result<PublishedBundle> {
        let identity = state.identity()?;
        let signed = state.signed_prekey.as_ref().ok_or(Error::KeyNotFound)?;

        Ok(PublishedBundle {
            registration_id: state.registration_id,
            device_id: self.device_id,
            identity_key: *identity.public_key(),
            signed_prekey_id: signed.id,
            signed_prekey: signed.public,
            signed_prekey_signature: signed.signature,
            one_time_prekeys: state
                .one_time_prekeys
                .iter()
                .filter(|(id, _)| include(**id))
                .map(|(id, secret)| (*id, secret.public_key()))
                .collect(),
        })
    }

    /// Writes the in-memory state to storage.
    pub fn flush(&self) -> Result<()> {
        let state = self.lock()?;
        self.persist(&state)
    }

    /// Destroys all local key material.
    pub fn wipe(&self) -> Result<()> {
        let mut state = self.lock()?;
        self.storage.remove(Namespace::KeyStore, STATE_KEY)?;
        *state = KeyStoreState::default();
        tracing::warn!("key store wiped");
        Ok(())
    }
}
