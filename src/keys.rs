//! X25519 key types. Secret material is zeroized on drop and redacted in
//! `Debug` output.

use crate::{
    crypto::KEY_SIZE_32,
    error::{Error, Result},
    xeddsa::{self, Signature},
};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// X25519 public key.
///
/// Stored as raw bytes; no point validation happens until the key is used
/// in [`SecretKey::agree`] or XEdDSA verification.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey([u8; KEY_SIZE_32]);

impl PublicKey {
    pub const SIZE: usize = KEY_SIZE_32;

    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE_32]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE_32] {
        &self.0
    }

    pub(crate) fn to_x25519(self) -> X25519PublicKey {
        X25519PublicKey::from(self.0)
    }
}

impl TryFrom<&[u8]> for PublicKey {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_SIZE_32] = bytes.try_into().map_err(|_| Error::InvalidPublicKey)?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", crate::logging::Fingerprint(self))
    }
}

impl From<X25519PublicKey> for PublicKey {
    fn from(pk: X25519PublicKey) -> Self {
        Self(*pk.as_bytes())
    }
}

impl From<&StaticSecret> for PublicKey {
    fn from(secret: &StaticSecret) -> Self {
        PublicKey::from(X25519PublicKey::from(secret))
    }
}

/// X25519 secret key, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey(StaticSecret);

impl SecretKey {
    pub fn generate<R: CryptoRngCore>(rng: &mut R) -> Self {
        Self(StaticSecret::random_from_rng(rng))
    }

    /// Clamping is applied when the scalar is used, not here.
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE_32]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    /// Raw scalar bytes. Callers must not copy these into long-lived buffers.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE_32] {
        self.0.as_bytes()
    }

    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey::from(&self.0)
    }

    /// Raw X25519. Prefer [`SecretKey::agree`] for peer-supplied keys.
    #[must_use]
    pub fn diffie_hellman(&self, public: &PublicKey) -> DhOutput {
        let shared = self.0.diffie_hellman(&public.to_x25519());
        DhOutput(*shared.as_bytes())
    }

    /// Diffie-Hellman that rejects all-zero (low-order peer key) outputs.
    pub fn agree(&self, public: &PublicKey) -> Result<DhOutput> {
        let output = self.diffie_hellman(public);
        if bool::from(output.0.ct_eq(&[0u8; KEY_SIZE_32])) {
            return Err(Error::KeyAgreementFailed);
        }
        Ok(output)
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretKey([REDACTED])")
    }
}

impl Serialize for SecretKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.0.as_bytes().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SecretKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let mut bytes = <[u8; KEY_SIZE_32]>::deserialize(deserializer)?;
        let key = Self::from_bytes(bytes);
        bytes.zeroize();
        Ok(key)
    }
}

/// Shared X25519 output, zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DhOutput([u8; KEY_SIZE_32]);

impl DhOutput {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE_32] {
        &self.0
    }

    #[cfg(test)]
    pub(crate) fn from_bytes(bytes: [u8; KEY_SIZE_32]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for DhOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DhOutput([REDACTED])")
    }
}

/// Long-term device identity.
///
/// A single X25519 key is used both for key agreement and, through XEdDSA,
/// for signing prekeys. The identity is created once per install and only
/// destroyed on account wipe.
#[derive(Clone, Serialize, Deserialize)]
pub struct IdentityKeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl IdentityKeyPair {
    pub fn generate<R: CryptoRngCore>(rng: &mut R) -> Self {
        let secret = SecretKey::generate(rng);
        let public = secret.public_key();
        Self { secret, public }
    }

    #[must_use]
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    #[must_use]
    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }

    /// Signs `message` with XEdDSA over the identity key.
    pub fn sign<R: CryptoRngCore>(&self, rng: &mut R, message: &[u8]) -> Result<Signature> {
        xeddsa::sign(rng, &self.secret, message)
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}
