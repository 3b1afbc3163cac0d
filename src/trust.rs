//! Trust-on-first-use record of peer identity keys.

use crate::error::{Error, Result};
use crate::keys::PublicKey;
use crate::logging::Fingerprint;
use crate::session::SessionAddress;
use crate::storage::{decode_versioned, encode_versioned, Namespace, Storage};
use std::sync::{Arc, Mutex};

const IDENTITY_RECORD_VERSION: u8 = 1;

/// Remembers the first identity key seen for each peer device and rejects
/// later handshakes that present a different one.
pub struct IdentityStore {
    storage: Arc<dyn Storage>,
    // serializes check-then-save
    lock: Mutex<()>,
}

impl IdentityStore {
    pub fn open(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            lock: Mutex::new(()),
        }
    }

    /// Saved identity for `address`, if any.
    pub fn identity(&self, address: &SessionAddress) -> Result<Option<PublicKey>> {
        self.storage
            .load(Namespace::Identity, &address.storage_key())?
            .map(|bytes| decode_versioned(IDENTITY_RECORD_VERSION, &bytes))
            .transpose()
    }

    /// Whether `key` is acceptable for `address` without saving anything.
    pub fn is_trusted(&self, address: &SessionAddress, key: &PublicKey) -> Result<bool> {
        Ok(self.identity(address)?.map_or(true, |saved| saved == *key))
    }

    /// Accepts `key` if it matches the saved identity, saving it when none exists.
    ///
    /// # Errors
    /// `UntrustedIdentity` if a different key was saved earlier.
    pub fn check_or_save(&self, address: &SessionAddress, key: &PublicKey) -> Result<()> {
        let _guard = self.lock.lock().map_err(|_| Error::StorageError)?;
        match self.identity(address)? {
            Some(saved) if saved == *key => Ok(()),
            Some(saved) => {
                tracing::warn!(
                    peer = %address,
                    saved = %Fingerprint(&saved),
                    presented = %Fingerprint(key),
                    "identity key changed"
                );
                Err(Error::UntrustedIdentity(address.to_string()))
            }
            None => {
                self.save(address, key)?;
                tracing::info!(peer = %address, identity = %Fingerprint(key), "trusted new identity");
                Ok(())
            }
        }
    }

    /// Replaces the saved identity after the user accepted a key change.
    pub fn trust_identity(&self, address: &SessionAddress, key: &PublicKey) -> Result<()> {
        let _guard = self.lock.lock().map_err(|_| Error::StorageError)?;
        self.save(address, key)?;
        tracing::info!(peer = %address, identity = %Fingerprint(key), "identity explicitly trusted");
        Ok(())
    }

    pub fn remove(&self, address: &SessionAddress) -> Result<()> {
        self.storage.remove(Namespace::Identity, &address.storage_key())
    }

    fn save(&self, address: &SessionAddress, key: &PublicKey) -> Result<()> {
        let bytes = encode_versioned(IDENTITY_RECORD_VERSION, key)?;
        self.storage
            .store(Namespace::Identity, &address.storage_key(), &bytes)
    }
}
