//! XEdDSA signatures over X25519 keys.
//!
//! Lets the device identity key (an X25519 key used for key agreement) also
//! sign signed prekeys, so a bundle carries a single identity key. Follows
//! "The XEdDSA and VXEdDSA Signature Schemes" (Perrin, rev. 1).

use crate::error::{Error, Result};
use crate::keys::{PublicKey, SecretKey};
use curve25519_dalek::{
    constants::ED25519_BASEPOINT_TABLE,
    edwards::{CompressedEdwardsY, EdwardsPoint},
    montgomery::MontgomeryPoint,
    scalar::Scalar,
};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// XEdDSA signature: 64 bytes (R point + s scalar)
pub const SIGNATURE_LENGTH: usize = 64;

/// Detached XEdDSA signature (`R || s`).
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "serde_arrays")] [u8; SIGNATURE_LENGTH]);

impl Signature {
    #[must_use]
    pub fn from_bytes(bytes: [u8; SIGNATURE_LENGTH]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LENGTH] {
        &self.0
    }
}

impl TryFrom<&[u8]> for Signature {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; SIGNATURE_LENGTH] =
            bytes.try_into().map_err(|_| Error::InvalidSignature)?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({:02x}{:02x}{:02x}{:02x}..)", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

/// Signs `message` with the X25519 secret `key`.
///
/// The Edwards private scalar is chosen so that its public point has a zero
/// sign bit, which is what verifiers reconstruct from the Montgomery key.
pub fn sign<R: CryptoRngCore>(rng: &mut R, key: &SecretKey, message: &[u8]) -> Result<Signature> {
    let mut clamped = *key.as_bytes();
    clamped[0] &= 248;
    clamped[31] &= 127;
    clamped[31] |= 64;
    let k = Scalar::from_bytes_mod_order(clamped);
    clamped.zeroize();

    let public_point = (&k * ED25519_BASEPOINT_TABLE).compress();
    let negate = (public_point.as_bytes()[31] >> 7) & 1 == 1;
    let mut a = if negate { -k } else { k };
    let mut a_public = *public_point.as_bytes();
    a_public[31] &= 0x7F;

    let mut random = [0u8; 64];
    rng.fill_bytes(&mut random);

    // r = hash1(a || M || Z)
    let mut hasher = Sha512::new();
    hasher.update([0xFE]);
    hasher.update([0xFF; 31]);
    hasher.update(a.as_bytes());
    hasher.update(message);
    hasher.update(random);
    let mut r = wide_scalar(hasher);
    random.zeroize();

    let r_point = (&r * ED25519_BASEPOINT_TABLE).compress();
    let h = challenge(&r_point, &a_public, message);
    let s = r + h * a;

    a.zeroize();
    r.zeroize();

    let mut signature = [0u8; SIGNATURE_LENGTH];
    signature[..32].copy_from_slice(r_point.as_bytes());
    signature[32..].copy_from_slice(s.as_bytes());
    Ok(Signature(signature))
}

/// Verifies `signature` over `message` against the X25519 public `key`.
pub fn verify(key: &PublicKey, message: &[u8], signature: &Signature) -> Result<()> {
    let a_compressed = edwards_public(key)?;
    let a_point = a_compressed
        .decompress()
        .ok_or(Error::InvalidSignature)?;
    if !a_point.is_torsion_free() {
        return Err(Error::InvalidSignature);
    }

    let mut r_bytes = [0u8; 32];
    let mut s_bytes = [0u8; 32];
    r_bytes.copy_from_slice(&signature.0[..32]);
    s_bytes.copy_from_slice(&signature.0[32..]);

    // s must be below 2^253
    if s_bytes[31] & 0xE0 != 0 {
        return Err(Error::InvalidSignature);
    }
    let r_compressed = CompressedEdwardsY(r_bytes);
    if r_compressed.decompress().is_none() {
        return Err(Error::InvalidSignature);
    }
    let s: Option<Scalar> = Scalar::from_canonical_bytes(s_bytes).into();
    let s = s.ok_or(Error::InvalidSignature)?;

    let h = challenge(&r_compressed, a_compressed.as_bytes(), message);
    let r_check = EdwardsPoint::vartime_double_scalar_mul_basepoint(&h, &-a_point, &s);

    if bool::from(r_check.compress().as_bytes().ct_eq(&r_bytes)) {
        Ok(())
    } else {
        Err(Error::InvalidSignature)
    }
}

/// Birational map from the Montgomery u-coordinate to an Edwards point with sign bit 0.
fn edwards_public(key: &PublicKey) -> Result<CompressedEdwardsY> {
    let mut u = *key.as_bytes();
    u[31] &= 0x7F;
    let edwards = MontgomeryPoint(u)
        .to_edwards(0)
        .ok_or(Error::InvalidPublicKey)?;
    let mut bytes = *edwards.compress().as_bytes();
    bytes[31] &= 0x7F;
    Ok(CompressedEdwardsY(bytes))
}

fn challenge(r_point: &CompressedEdwardsY, a_public: &[u8; 32], message: &[u8]) -> Scalar {
    let mut hasher = Sha512::new();
    hasher.update(r_point.as_bytes());
    hasher.update(a_public);
    hasher.update(message);
    wide_scalar(hasher)
}

fn wide_scalar(hasher: Sha512) -> Scalar {
    let digest = hasher.finalize();
    let mut wide = [0u8; 64];
    wide.copy_from_slice(&digest);
    let scalar = Scalar::from_bytes_mod_order_wide(&wide);
    wide.zeroize();
    scalar
}
