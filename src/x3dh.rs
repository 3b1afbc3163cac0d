//! X3DH (Extended Triple Diffie-Hellman) key agreement.
//!
//! Asynchronous key agreement following
//! <https://signal.org/docs/specifications/x3dh/>. This module holds the pure
//! math and the public bundle types; key custody lives in
//! [`KeyStore`](crate::keystore::KeyStore) and session bookkeeping in
//! [`SessionEstablisher`](crate::establish::SessionEstablisher).
//!
//! ## Protocol Flow
//!
//! 1. **Responder (Bob)** publishes identity key, signed prekey with its
//!    XEdDSA signature, and a pool of one-time prekeys.
//!
//! 2. **Initiator (Alice)** fetches a bundle carrying at most one one-time
//!    prekey and computes:
//!    - DH1 = `DH(IK_A, SPK_B)`
//!    - DH2 = `DH(EK_A, IK_B)`
//!    - DH3 = `DH(EK_A, SPK_B)`
//!    - DH4 = `DH(EK_A, OPK_B)` [if OPK available]
//!    - SK = KDF(DH1 || DH2 || DH3 || DH4)
//!
//! 3. **Responder (Bob)** receives the base key `EK_A` with the first message
//!    and computes the same SK.
//!
//! The signature covers `IK || SPK`, so swapping either key in a bundle
//! invalidates it.

use crate::crypto::{derive_agreement_secret, SymmetricKey};
use crate::error::Result;
use crate::keys::{IdentityKeyPair, PublicKey, SecretKey};
use crate::xeddsa::{self, Signature};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};

/// Builds the byte string signed by the identity key for a signed prekey.
#[must_use]
pub fn signed_prekey_message(identity_key: &PublicKey, signed_prekey: &PublicKey) -> [u8; 64] {
    let mut message = [0u8; 64];
    message[..32].copy_from_slice(identity_key.as_bytes());
    message[32..].copy_from_slice(signed_prekey.as_bytes());
    message
}

/// Prekey bundle for one handshake, holding at most one one-time prekey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundle {
    /// Registration id of the publishing install
    pub registration_id: u32,

    /// Device the bundle belongs to
    pub device_id: u32,

    /// Long-term identity key (X25519 public key)
    pub identity_key: PublicKey,

    /// Id the responder uses to locate the signed prekey secret
    pub signed_prekey_id: u32,

    /// Medium-term signed prekey (X25519 public key)
    pub signed_prekey: PublicKey,

    /// XEdDSA signature over (identity_key || signed_prekey)
    pub signed_prekey_signature: Signature,

    /// One-time prekey id and public key. Absent when the pool is exhausted,
    /// in which case the handshake falls back to three DH operations.
    pub one_time_prekey: Option<(u32, PublicKey)>,
}

impl PreKeyBundle {
    /// Verifies the XEdDSA signature on the signed prekey.
    ///
    /// # Errors
    /// `InvalidSignature` if the bundle was not signed by its identity key.
    pub fn verify_signature(&self) -> Result<()> {
        let message = signed_prekey_message(&self.identity_key, &self.signed_prekey);
        xeddsa::verify(&self.identity_key, &message, &self.signed_prekey_signature)
    }
}

/// Everything a device publishes to the directory: its signed prekey and the
/// whole pool of available one-time prekeys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedBundle {
    pub registration_id: u32,
    pub device_id: u32,
    pub identity_key: PublicKey,
    pub signed_prekey_id: u32,
    pub signed_prekey: PublicKey,
    pub signed_prekey_signature: Signature,
    pub one_time_prekeys: Vec<(u32, PublicKey)>,
}

impl PublishedBundle {
    /// Hands out a bundle for a single handshake, removing the one-time prekey
    /// it carries so the same key is never given to two initiators.
    pub fn take_bundle(&mut self) -> PreKeyBundle {
        let one_time_prekey = if self.one_time_prekeys.is_empty() {
            None
        } else {
            Some(self.one_time_prekeys.remove(0))
        };

        PreKeyBundle {
            registration_id: self.registration_id,
            device_id: self.device_id,
            identity_key: self.identity_key,
            signed_prekey_id: self.signed_prekey_id,
            signed_prekey: self.signed_prekey,
            signed_prekey_signature: self.signed_prekey_signature,
            one_time_prekey,
        }
    }
}

/// Result of X3DH initiation.
#[derive(Debug)]
pub struct InitiatorResult {
    /// Shared secret derived from DH operations
    pub shared_secret: SymmetricKey,

    /// Public half of the ephemeral key, sent to the responder
    pub base_key: PublicKey,

    /// `IK_A || IK_B`
    pub associated_data: Vec<u8>,

    pub signed_prekey_id: u32,

    /// One-time prekey used, if the bundle carried one
    pub one_time_prekey_id: Option<u32>,
}

/// Result of X3DH response.
#[derive(Debug)]
pub struct ResponderResult {
    pub shared_secret: SymmetricKey,

    /// `IK_A || IK_B`
    pub associated_data: Vec<u8>,
}

fn associated_data(initiator: &PublicKey, responder: &PublicKey) -> Vec<u8> {
    let mut ad = Vec::with_capacity(64);
    ad.extend_from_slice(initiator.as_bytes());
    ad.extend_from_slice(responder.as_bytes());
    ad
}

/// Initiator side of the agreement.
///
/// Verifies the bundle signature, then performs 3 or 4 DH operations
/// depending on whether a one-time prekey is present.
pub fn initiate<R: CryptoRngCore>(
    rng: &mut R,
    local_identity: &IdentityKeyPair,
    bundle: &PreKeyBundle,
) -> Result<InitiatorResult> {
    bundle.verify_signature()?;

    let ephemeral = SecretKey::generate(rng);

    let dh1 = local_identity.secret_key().agree(&bundle.signed_prekey)?;
    let dh2 = ephemeral.agree(&bundle.identity_key)?;
    let dh3 = ephemeral.agree(&bundle.signed_prekey)?;
    let dh4 = match bundle.one_time_prekey {
        Some((_, opk)) => Some(ephemeral.agree(&opk)?),
        None => None,
    };

    let shared_secret = derive_agreement_secret(&dh1, &dh2, &dh3, dh4.as_ref())?;

    Ok(InitiatorResult {
        shared_secret,
        base_key: ephemeral.public_key(),
        associated_data: associated_data(local_identity.public_key(), &bundle.identity_key),
        signed_prekey_id: bundle.signed_prekey_id,
        one_time_prekey_id: bundle.one_time_prekey.map(|(id, _)| id),
    })
}

/// Responder side of the agreement.
///
/// The caller locates the signed and one-time prekey secrets named by the
/// initiator's message; nothing here consumes key material.
pub fn respond(
    local_identity: &IdentityKeyPair,
    signed_prekey: &SecretKey,
    one_time_prekey: Option<&SecretKey>,
    remote_identity: &PublicKey,
    base_key: &PublicKey,
) -> Result<ResponderResult> {
    let dh1 = signed_prekey.agree(remote_identity)?;
    let dh2 = local_identity.secret_key().agree(base_key)?;
    let dh3 = signed_prekey.agree(base_key)?;
    let dh4 = match one_time_prekey {
        Some(opk) => Some(opk.agree(base_key)?),
        None => None,
    };

    let shared_secret = derive_agreement_secret(&dh1, &dh2, &dh3, dh4.as_ref())?;

    Ok(ResponderResult {
        shared_secret,
        associated_data: associated_data(remote_identity, local_identity.public_key()),
    })
}
