//! Per-message encryption and decryption over established sessions.

use crate::config::RatchetLimits;
use crate::envelope::{Envelope, EnvelopeContent, EnvelopeKind, PreKeyMessage};
use crate::error::{Error, Result};
use crate::establish::SessionEstablisher;
use crate::keystore::KeyStore;
use crate::logging::{Fingerprint, RedactedBytes};
use crate::ratchet::RatchetMessage;
use crate::session::{SessionAddress, SessionRecord, SessionStore};
use crate::trust::IdentityStore;
use rand_core::CryptoRngCore;
use std::sync::Arc;

/// Result of decrypting an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decrypted {
    pub plaintext: Vec<u8>,
    /// One-time prekey consumed by a handshake carried in the envelope
    pub consumed_one_time_prekey: Option<u32>,
}

/// Encrypts outbound plaintext and decrypts inbound envelopes.
///
/// Both directions run inside [`SessionStore::transact`], so the advanced
/// ratchet is persisted before an envelope or plaintext is returned and a
/// failed decryption leaves the stored session untouched.
pub struct MessageCipher {
    local: SessionAddress,
    key_store: Arc<KeyStore>,
    sessions: Arc<SessionStore>,
    trust: Arc<IdentityStore>,
    establisher: Arc<SessionEstablisher>,
    limits: RatchetLimits,
}

fn decrypt_record<R: CryptoRngCore>(
    rng: &mut R,
    record: &mut SessionRecord,
    message: &RatchetMessage,
    limits: RatchetLimits,
) -> Result<Vec<u8>> {
    let associated_data = record.associated_data().to_vec();
    let plaintext = record.ratchet.decrypt(rng, message, &associated_data, limits)?;
    // the peer has a session with us, so stop repeating the handshake
    record.pending_prekey = None;
    Ok(plaintext)
}

impl MessageCipher {
    pub fn new(
        local: SessionAddress,
        key_store: Arc<KeyStore>,
        sessions: Arc<SessionStore>,
        trust: Arc<IdentityStore>,
        establisher: Arc<SessionEstablisher>,
    ) -> Self {
        let limits = establisher.config().ratchet_limits();
        Self {
            local,
            key_store,
            sessions,
            trust,
            establisher,
            limits,
        }
    }

    /// Encrypts `plaintext` for `address`.
    ///
    /// While the peer has not answered yet the envelope is a PreKey envelope
    /// carrying the handshake.
    ///
    /// # Errors
    /// `NoSession` if no session exists; establish one first.
    pub fn encrypt(&self, address: &SessionAddress, plaintext: &[u8]) -> Result<Envelope> {
        let (envelope, counter) = self.sessions.transact(address, |slot| {
            let record = slot.as_mut().ok_or(Error::NoSession)?;
            let associated_data = record.associated_data().to_vec();
            let message = record.ratchet.encrypt(plaintext, &associated_data)?;
            let counter = message.header.counter;

            let envelope = match record.pending_prekey() {
                Some(pending) => Envelope::new(
                    EnvelopeKind::PreKey,
                    self.local.clone(),
                    PreKeyMessage {
                        registration_id: pending.registration_id,
                        signed_prekey_id: pending.signed_prekey_id,
                        one_time_prekey_id: pending.one_time_prekey_id,
                        base_key: pending.base_key,
                        identity_key: *record.local_identity(),
                        message,
                    }
                    .to_bytes(),
                ),
                None => Envelope::new(EnvelopeKind::Message, self.local.clone(), message.to_bytes()),
            };
            Ok((envelope, counter))
        })?;

        tracing::debug!(
            peer = %address,
            counter,
            kind = ?envelope.kind(),
            plaintext = %RedactedBytes(plaintext),
            "encrypted message"
        );
        Ok(envelope)
    }

    /// Decrypts an inbound envelope from its sender's session.
    ///
    /// # Errors
    /// - `NoSession` for a plain message without a session
    /// - `DuplicateOrExpired` for replays and keys outside the skip window
    /// - `AuthenticationFailed` for tampered content (state is unchanged)
    /// - `EstablishmentFailed` when a handshake references missing prekeys
    /// - `UntrustedIdentity` for a handshake from a changed identity (no
    ///   prekey is consumed)
    pub fn decrypt<R: CryptoRngCore>(&self, rng: &mut R, envelope: &Envelope) -> Result<Decrypted> {
        let address = envelope.sender();
        let result = match envelope.decode()? {
            EnvelopeContent::Message(message) => self
                .sessions
                .transact(address, |slot| {
                    let record = slot.as_mut().ok_or(Error::NoSession)?;
                    decrypt_record(rng, record, &message, self.limits)
                })
                .map(|plaintext| Decrypted {
                    plaintext,
                    consumed_one_time_prekey: None,
                }),
            EnvelopeContent::PreKey(message) => self.decrypt_prekey(rng, address, &message),
            // carries no ciphertext
            EnvelopeContent::Rehandshake(_) => Err(Error::InvalidMessageFormat),
        };

        match &result {
            Ok(decrypted) => tracing::debug!(
                peer = %address,
                plaintext = %RedactedBytes(&decrypted.plaintext),
                "decrypted message"
            ),
            Err(Error::DuplicateOrExpired) => {
                tracing::debug!(peer = %address, "dropped duplicate or expired message");
            }
            Err(Error::AuthenticationFailed) => {
                tracing::warn!(peer = %address, "message failed authentication");
            }
            Err(err) => tracing::warn!(peer = %address, error = %err, "decryption failed"),
        }
        result
    }

    fn decrypt_prekey<R: CryptoRngCore>(
        &self,
        rng: &mut R,
        address: &SessionAddress,
        message: &PreKeyMessage,
    ) -> Result<Decrypted> {
        self.sessions.transact(address, |slot| {
            if let Some(record) = slot.as_mut() {
                if record.base_key() == &message.base_key {
                    let plaintext = decrypt_record(rng, record, &message.message, self.limits)?;
                    return Ok(Decrypted {
                        plaintext,
                        consumed_one_time_prekey: None,
                    });
                }
                if record.has_seen_base_key(&message.base_key) {
                    return Err(Error::DuplicateOrExpired);
                }
            }

            let (mut fresh, one_time_prekey_id) = self.establisher.derive_responder(address, message)?;
            let plaintext = decrypt_record(rng, &mut fresh, &message.message, self.limits)?;
            self.trust.check_or_save(address, &message.identity_key)?;

            if let Some(id) = one_time_prekey_id {
                self.key_store
                    .consume_one_time_prekey(id)
                    .map_err(|err| Error::EstablishmentFailed(Box::new(err)))?;
            }

            if let Some(previous) = slot.as_ref() {
                fresh.inherit_history(previous);
            }
            *slot = Some(fresh);

            tracing::info!(
                peer = %address,
                base_key = %Fingerprint(&message.base_key),
                one_time_prekey = ?one_time_prekey_id,
                "session established as responder"
            );
            Ok(Decrypted {
                plaintext,
                consumed_one_time_prekey: one_time_prekey_id,
            })
        })
    }
}
