//! Cryptographic primitives for session establishment and the message ratchet.
//!
//! HKDF-SHA256 derives the agreement secret and root steps, HMAC-SHA256
//! advances chain keys, and ChaCha20-Poly1305 seals each message.

use crate::error::{Error, Result};
use crate::keys::DhOutput;

use chacha20poly1305::{
    aead::{Aead, Payload},
    ChaCha20Poly1305, Key, KeyInit, Nonce,
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

const AGREEMENT_INFO: &[u8] = b"SecureSession_X3DH_v1";
const ROOT_INFO: &[u8] = b"SecureSession_Ratchet_Root";

const MESSAGE_KEY_SEED: u8 = 0x01;
const CHAIN_KEY_SEED: u8 = 0x02;

pub const KEY_SIZE_32: usize = 32;
pub const KEY_SIZE_64: usize = 64;
pub const TAG_SIZE: usize = 16;
pub const NONCE_SIZE: usize = 12;

type HmacSha256 = Hmac<Sha256>;

/// Root, chain or message key.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
pub struct SymmetricKey([u8; KEY_SIZE_32]);

impl SymmetricKey {
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE_32]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE_32] {
        &self.0
    }

    fn split(output: &[u8; KEY_SIZE_64]) -> (Self, Self) {
        let mut first = [0u8; KEY_SIZE_32];
        let mut second = [0u8; KEY_SIZE_32];
        first.copy_from_slice(&output[..KEY_SIZE_32]);
        second.copy_from_slice(&output[KEY_SIZE_32..]);
        (Self(first), Self(second))
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SymmetricKey([REDACTED])")
    }
}

/// Session agreement KDF.
///
/// Computes `SK = HKDF(F || DH1 || DH2 || DH3 || [DH4])` with `F = 0xFF^32`,
/// a 32-byte zero salt and a fixed info string. The fourth output is present
/// only when the bundle carried a one-time prekey.
pub fn derive_agreement_secret(
    dh1: &DhOutput,
    dh2: &DhOutput,
    dh3: &DhOutput,
    dh4: Option<&DhOutput>,
) -> Result<SymmetricKey> {
    let mut ikm = [0u8; KEY_SIZE_32 * 5];
    ikm[..KEY_SIZE_32].copy_from_slice(&[0xFF; KEY_SIZE_32]);
    let mut len = KEY_SIZE_32;
    for dh in [Some(dh1), Some(dh2), Some(dh3), dh4].into_iter().flatten() {
        ikm[len..len + KEY_SIZE_32].copy_from_slice(dh.as_bytes());
        len += KEY_SIZE_32;
    }

    let salt = [0u8; KEY_SIZE_32];
    let hkdf = Hkdf::<Sha256>::new(Some(&salt), &ikm[..len]);
    let mut output = [0u8; KEY_SIZE_32];
    let expanded = hkdf.expand(AGREEMENT_INFO, &mut output);
    ikm.zeroize();
    expanded.map_err(|_| Error::CryptoError)?;

    Ok(SymmetricKey(output))
}

/// Root KDF for the DH ratchet step.
///
/// `(RK', CK) = HKDF(salt = RK, ikm = DH_out)`, first half root, second half chain.
pub fn kdf_root(root_key: &SymmetricKey, dh_output: &DhOutput) -> Result<(SymmetricKey, SymmetricKey)> {
    let hkdf = Hkdf::<Sha256>::new(Some(root_key.as_bytes()), dh_output.as_bytes());

    let mut output = [0u8; KEY_SIZE_64];
    hkdf.expand(ROOT_INFO, &mut output)
        .map_err(|_| Error::CryptoError)?;

    let keys = SymmetricKey::split(&output);
    output.zeroize();
    Ok(keys)
}

/// Chain KDF for the symmetric ratchet step.
///
/// Returns `(CK', MK)` where `MK = HMAC(CK, 0x01)` and `CK' = HMAC(CK, 0x02)`.
pub fn kdf_chain(chain_key: &SymmetricKey) -> Result<(SymmetricKey, SymmetricKey)> {
    let message_key = chain_hmac(chain_key, MESSAGE_KEY_SEED)?;
    let next_chain_key = chain_hmac(chain_key, CHAIN_KEY_SEED)?;
    Ok((next_chain_key, message_key))
}

fn chain_hmac(chain_key: &SymmetricKey, seed: u8) -> Result<SymmetricKey> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(chain_key.as_bytes())
        .map_err(|_| Error::CryptoError)?;
    mac.update(&[seed]);
    let mut bytes = [0u8; KEY_SIZE_32];
    bytes.copy_from_slice(&mac.finalize().into_bytes());
    Ok(SymmetricKey(bytes))
}

/// Encrypts with ChaCha20-Poly1305, appending the 16-byte tag.
///
/// Every message key is used for exactly one message, so the deterministic
/// nonce from [`message_nonce`] never repeats under a key.
pub fn encrypt(
    key: &SymmetricKey,
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad: associated_data,
            },
        )
        .map_err(|_| Error::CryptoError)
}

/// Decrypts and authenticates a ChaCha20-Poly1305 ciphertext.
///
/// # Errors
/// `AuthenticationFailed` on a wrong key, altered ciphertext or tag, or
/// mismatched associated data.
pub fn decrypt(
    key: &SymmetricKey,
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>> {
    if ciphertext.len() < TAG_SIZE {
        return Err(Error::AuthenticationFailed);
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: associated_data,
            },
        )
        .map_err(|_| Error::AuthenticationFailed)
}

/// Nonce layout: `counter (4 bytes, LE) || ratchet_key[0..8]`.
#[must_use]
pub fn message_nonce(counter: u32, ratchet_key: &[u8; KEY_SIZE_32]) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..4].copy_from_slice(&counter.to_le_bytes());
    nonce[4..].copy_from_slice(&ratchet_key[..8]);
    nonce
}
