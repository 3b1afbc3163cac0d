//! Session establishment on both sides of the handshake.
//!
//! The initiator path runs after the bundle fetch has completed; nothing in
//! here performs I/O other than the local stores, and the session lock is
//! taken only for the final write.

use crate::config::SessionConfig;
use crate::envelope::PreKeyMessage;
use crate::error::{Error, Result};
use crate::keys::SecretKey;
use crate::keystore::KeyStore;
use crate::logging::Fingerprint;
use crate::ratchet::RatchetState;
use crate::session::{PendingPreKey, SessionAddress, SessionRecord, SessionStore};
use crate::trust::IdentityStore;
use crate::x3dh::{self, PreKeyBundle};
use rand_core::CryptoRngCore;
use std::sync::Arc;

fn establishment_failed(err: Error) -> Error {
    match err {
        Error::EstablishmentFailed(_) | Error::UntrustedIdentity(_) => err,
        other => Error::EstablishmentFailed(Box::new(other)),
    }
}

/// Creates sessions from prekey bundles (initiator) and prekey messages (responder).
pub struct SessionEstablisher {
    key_store: Arc<KeyStore>,
    sessions: Arc<SessionStore>,
    trust: Arc<IdentityStore>,
    config: SessionConfig,
}

impl SessionEstablisher {
    pub fn new(
        key_store: Arc<KeyStore>,
        sessions: Arc<SessionStore>,
        trust: Arc<IdentityStore>,
        config: SessionConfig,
    ) -> Self {
        Self {
            key_store,
            sessions,
            trust,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Initiator path: verifies `bundle`, runs the agreement and writes an
    /// Active session for `address`, replacing any existing one.
    ///
    /// # Errors
    /// - `InvalidSignature` if the signed prekey signature does not verify
    /// - `UntrustedIdentity` if the bundle's identity differs from the saved one
    pub fn initiate<R: CryptoRngCore>(
        &self,
        rng: &mut R,
        address: &SessionAddress,
        bundle: &PreKeyBundle,
    ) -> Result<()> {
        let identity = self.key_store.identity()?;
        let registration_id = self.key_store.registration_id()?;

        let agreement = x3dh::initiate(rng, &identity, bundle).map_err(|err| {
            if err == Error::InvalidSignature {
                tracing::warn!(peer = %address, "prekey bundle signature rejected");
            }
            err
        })?;
        self.trust.check_or_save(address, &bundle.identity_key)?;

        let ratchet = RatchetState::init_sender(rng, &agreement.shared_secret, bundle.signed_prekey)?;
        let mut record = SessionRecord::new(
            ratchet,
            *identity.public_key(),
            bundle.identity_key,
            agreement.associated_data,
            bundle.registration_id,
            agreement.base_key,
            Some(PendingPreKey {
                registration_id,
                signed_prekey_id: agreement.signed_prekey_id,
                one_time_prekey_id: agreement.one_time_prekey_id,
                base_key: agreement.base_key,
            }),
        );

        self.sessions.transact(address, |slot| {
            if let Some(previous) = slot.as_ref() {
                record.inherit_history(previous);
            }
            *slot = Some(record);
            Ok(())
        })?;

        tracing::info!(
            peer = %address,
            base_key = %Fingerprint(&agreement.base_key),
            one_time_prekey = ?agreement.one_time_prekey_id,
            "session initiated"
        );
        Ok(())
    }

    /// Responder path: derives the session a prekey message describes.
    ///
    /// Key material is only looked up here. The caller checks the peer
    /// identity and consumes the returned one-time prekey id once the
    /// embedded message has authenticated.
    ///
    /// # Errors
    /// `EstablishmentFailed` wrapping `KeyNotFound` when the referenced
    /// prekeys are gone.
    pub fn derive_responder(
        &self,
        address: &SessionAddress,
        message: &PreKeyMessage,
    ) -> Result<(SessionRecord, Option<u32>)> {
        let identity = self.key_store.identity().map_err(establishment_failed)?;
        let signed_prekey = self
            .key_store
            .signed_prekey(message.signed_prekey_id)
            .map_err(establishment_failed)?;
        let one_time_prekey: Option<SecretKey> = message
            .one_time_prekey_id
            .map(|id| self.key_store.one_time_prekey(id))
            .transpose()
            .map_err(|err| {
                tracing::warn!(
                    peer = %address,
                    one_time_prekey = ?message.one_time_prekey_id,
                    "handshake references unknown one-time prekey"
                );
                establishment_failed(err)
            })?;

        let agreement = x3dh::respond(
            &identity,
            &signed_prekey,
            one_time_prekey.as_ref(),
            &message.identity_key,
            &message.base_key,
        )
        .map_err(establishment_failed)?;

        let ratchet = RatchetState::init_receiver(agreement.shared_secret, signed_prekey);
        let record = SessionRecord::new(
            ratchet,
            *identity.public_key(),
            message.identity_key,
            agreement.associated_data,
            message.registration_id,
            message.base_key,
            None,
        );

        Ok((record, message.one_time_prekey_id))
    }
}
