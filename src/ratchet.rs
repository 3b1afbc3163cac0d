//! Double Ratchet for forward-secure message encryption
//!
//! Implements the Double Ratchet algorithm providing:
//! - Forward secrecy: past messages stay secure if current keys leak
//! - Post-compromise security: a DH step heals a compromised chain
//! - Out-of-order delivery within a bounded skip window
//!
//! ## State
//!
//! Each party maintains:
//! - Root key (RK): updated on every DH ratchet step
//! - Sending chain key (`CK_s`): advanced on each sent message
//! - Receiving chain key (`CK_r`): advanced on each received message
//! - DH ratchet key pair: rotated on every DH ratchet step
//!
//! Decryption derives everything it needs into locals first and only
//! commits them to the state once the AEAD tag verifies, so a rejected
//! message never moves a counter or a chain key.

use crate::config::RatchetLimits;
use crate::crypto::{self, kdf_chain, kdf_root, SymmetricKey, TAG_SIZE};
use crate::error::{Error, Result};
use crate::keys::{PublicKey, SecretKey};
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Encoded header size: ratchet key (32) + previous chain length (4) + counter (4).
pub const HEADER_SIZE: usize = 40;

/// Message header, sent in the clear and authenticated as associated data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Sender's current DH ratchet public key
    pub ratchet_key: PublicKey,

    /// Number of messages in the sender's previous sending chain
    pub previous_chain_length: u32,

    /// Message number in the current sending chain
    pub counter: u32,
}

impl Header {
    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[..32].copy_from_slice(self.ratchet_key.as_bytes());
        bytes[32..36].copy_from_slice(&self.previous_chain_length.to_le_bytes());
        bytes[36..40].copy_from_slice(&self.counter.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HEADER_SIZE {
            return Err(Error::InvalidHeader);
        }
        let ratchet_key = PublicKey::try_from(&bytes[..32]).map_err(|_| Error::InvalidHeader)?;
        let previous_chain_length =
            u32::from_le_bytes(bytes[32..36].try_into().map_err(|_| Error::InvalidHeader)?);
        let counter =
            u32::from_le_bytes(bytes[36..40].try_into().map_err(|_| Error::InvalidHeader)?);

        Ok(Self {
            ratchet_key,
            previous_chain_length,
            counter,
        })
    }
}

/// Encrypted message: header followed by AEAD ciphertext and tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatchetMessage {
    pub header: Header,
    pub ciphertext: Vec<u8>,
}

impl RatchetMessage {
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + self.ciphertext.len());
        bytes.extend_from_slice(&self.header.to_bytes());
        bytes.extend_from_slice(&self.ciphertext);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE + TAG_SIZE {
            return Err(Error::InvalidMessageFormat);
        }
        let header = Header::from_bytes(&bytes[..HEADER_SIZE])?;
        Ok(Self {
            header,
            ciphertext: bytes[HEADER_SIZE..].to_vec(),
        })
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct SkippedKey {
    ratchet_key: PublicKey,
    counter: u32,
    message_key: SymmetricKey,
}

/// Skipped message keys in insertion order; the front is the oldest.
#[derive(Clone, Default, Serialize, Deserialize)]
struct SkippedKeys {
    entries: VecDeque<SkippedKey>,
}

impl SkippedKeys {
    fn position(&self, ratchet_key: &PublicKey, counter: u32) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.counter == counter && entry.ratchet_key == *ratchet_key)
    }

    fn extend(&mut self, keys: Vec<SkippedKey>, capacity: usize) {
        self.entries.extend(keys);
        while self.entries.len() > capacity {
            self.entries.pop_front();
        }
    }
}

/// Receiving-chain keys derived ahead of a commit.
struct ChainAdvance {
    skipped: Vec<SkippedKey>,
    message_key: SymmetricKey,
    next_chain_key: SymmetricKey,
}

/// Walks `chain_key` from `from` to `counter`, collecting intervening keys.
fn advance_chain(
    chain_key: &SymmetricKey,
    ratchet_key: PublicKey,
    from: u32,
    counter: u32,
    max_skip: u32,
) -> Result<ChainAdvance> {
    if counter - from > max_skip {
        return Err(Error::TooManySkippedMessages);
    }

    let mut skipped = Vec::with_capacity((counter - from) as usize);
    let mut current = chain_key.clone();
    for index in from..counter {
        let (next, message_key) = kdf_chain(&current)?;
        skipped.push(SkippedKey {
            ratchet_key,
            counter: index,
            message_key,
        });
        current = next;
    }
    let (next_chain_key, message_key) = kdf_chain(&current)?;

    Ok(ChainAdvance {
        skipped,
        message_key,
        next_chain_key,
    })
}

/// Collects the unread keys at the tail of a finished receiving chain.
fn drain_chain(
    chain_key: &SymmetricKey,
    ratchet_key: PublicKey,
    from: u32,
    until: u32,
    max_skip: u32,
) -> Result<Vec<SkippedKey>> {
    if until <= from {
        return Ok(Vec::new());
    }
    if until - from > max_skip {
        return Err(Error::TooManySkippedMessages);
    }

    let mut skipped = Vec::with_capacity((until - from) as usize);
    let mut current = chain_key.clone();
    for index in from..until {
        let (next, message_key) = kdf_chain(&current)?;
        skipped.push(SkippedKey {
            ratchet_key,
            counter: index,
            message_key,
        });
        current = next;
    }
    Ok(skipped)
}

fn open(message: &RatchetMessage, message_key: &SymmetricKey, associated_data: &[u8]) -> Result<Vec<u8>> {
    let header_bytes = message.header.to_bytes();
    let mut ad = Vec::with_capacity(associated_data.len() + HEADER_SIZE);
    ad.extend_from_slice(associated_data);
    ad.extend_from_slice(&header_bytes);

    let nonce = crypto::message_nonce(message.header.counter, message.header.ratchet_key.as_bytes());
    crypto::decrypt(message_key, &nonce, &message.ciphertext, &ad)
}

/// Double Ratchet state for one session.
#[derive(Clone, Serialize, Deserialize)]
pub struct RatchetState {
    root_key: SymmetricKey,
    send_chain: Option<SymmetricKey>,
    recv_chain: Option<SymmetricKey>,
    dh_send: SecretKey,
    dh_recv: Option<PublicKey>,
    send_count: u32,
    recv_count: u32,
    prev_chain_length: u32,
    skipped: SkippedKeys,
    retired_remote_keys: VecDeque<PublicKey>,
}

impl RatchetState {
    /// Initializes the initiator, ratcheting once against the responder's
    /// initial ratchet key so it can send immediately.
    pub fn init_sender<R: CryptoRngCore>(
        rng: &mut R,
        shared_secret: &SymmetricKey,
        remote_ratchet_key: PublicKey,
    ) -> Result<Self> {
        let dh_send = SecretKey::generate(rng);
        let dh_output = dh_send.agree(&remote_ratchet_key)?;
        let (root_key, send_chain) = kdf_root(shared_secret, &dh_output)?;

        Ok(Self {
            root_key,
            send_chain: Some(send_chain),
            recv_chain: None,
            dh_send,
            dh_recv: Some(remote_ratchet_key),
            send_count: 0,
            recv_count: 0,
            prev_chain_length: 0,
            skipped: SkippedKeys::default(),
            retired_remote_keys: VecDeque::new(),
        })
    }

    /// Initializes the responder with the key pair whose public half the
    /// initiator ratcheted against.
    #[must_use]
    pub fn init_receiver(shared_secret: SymmetricKey, local_ratchet_key: SecretKey) -> Self {
        Self {
            root_key: shared_secret,
            send_chain: None,
            recv_chain: None,
            dh_send: local_ratchet_key,
            dh_recv: None,
            send_count: 0,
            recv_count: 0,
            prev_chain_length: 0,
            skipped: SkippedKeys::default(),
            retired_remote_keys: VecDeque::new(),
        }
    }

    /// Encrypts `plaintext`, advancing the sending chain.
    ///
    /// # Errors
    /// `InvalidSessionState` if no sending chain exists yet (a responder
    /// that has not received its first message).
    pub fn encrypt(&mut self, plaintext: &[u8], associated_data: &[u8]) -> Result<RatchetMessage> {
        let chain_key = self.send_chain.as_ref().ok_or(Error::InvalidSessionState)?;
        let next_count = self
            .send_count
            .checked_add(1)
            .ok_or(Error::InvalidSessionState)?;
        let (next_chain, message_key) = kdf_chain(chain_key)?;

        let header = Header {
            ratchet_key: self.dh_send.public_key(),
            previous_chain_length: self.prev_chain_length,
            counter: self.send_count,
        };

        let mut ad = Vec::with_capacity(associated_data.len() + HEADER_SIZE);
        ad.extend_from_slice(associated_data);
        ad.extend_from_slice(&header.to_bytes());
        let nonce = crypto::message_nonce(header.counter, header.ratchet_key.as_bytes());
        let ciphertext = crypto::encrypt(&message_key, &nonce, plaintext, &ad)?;

        self.send_chain = Some(next_chain);
        self.send_count = next_count;

        Ok(RatchetMessage { header, ciphertext })
    }

    /// Decrypts `message`, advancing the receiving side on success only.
    ///
    /// # Errors
    /// - `DuplicateOrExpired` for a counter behind its chain with no cached key,
    ///   or for a chain whose ratchet key has been retired
    /// - `TooManySkippedMessages` if a gap exceeds `limits.max_skip`
    /// - `AuthenticationFailed` if the tag does not verify
    pub fn decrypt<R: CryptoRngCore>(
        &mut self,
        rng: &mut R,
        message: &RatchetMessage,
        associated_data: &[u8],
        limits: RatchetLimits,
    ) -> Result<Vec<u8>> {
        let header = &message.header;

        if let Some(index) = self.skipped.position(&header.ratchet_key, header.counter) {
            let plaintext = open(message, &self.skipped.entries[index].message_key, associated_data)?;
            self.skipped.entries.remove(index);
            return Ok(plaintext);
        }

        if Some(header.ratchet_key) == self.dh_recv {
            let chain_key = self.recv_chain.as_ref().ok_or(Error::InvalidSessionState)?;
            if header.counter < self.recv_count {
                return Err(Error::DuplicateOrExpired);
            }
            let advance = advance_chain(
                chain_key,
                header.ratchet_key,
                self.recv_count,
                header.counter,
                limits.max_skip,
            )?;
            let plaintext = open(message, &advance.message_key, associated_data)?;

            self.skipped.extend(advance.skipped, limits.max_skipped_keys);
            self.recv_chain = Some(advance.next_chain_key);
            self.recv_count = header.counter + 1;
            return Ok(plaintext);
        }

        if self.retired_remote_keys.contains(&header.ratchet_key) {
            return Err(Error::DuplicateOrExpired);
        }

        self.decrypt_with_new_ratchet_key(rng, message, associated_data, limits)
    }

    fn decrypt_with_new_ratchet_key<R: CryptoRngCore>(
        &mut self,
        rng: &mut R,
        message: &RatchetMessage,
        associated_data: &[u8],
        limits: RatchetLimits,
    ) -> Result<Vec<u8>> {
        let header = &message.header;

        let tail = match (&self.recv_chain, self.dh_recv) {
            (Some(chain_key), Some(old_key)) => drain_chain(
                chain_key,
                old_key,
                self.recv_count,
                header.previous_chain_length,
                limits.max_skip,
            )?,
            _ => Vec::new(),
        };

        let (root_key, recv_chain) = kdf_root(&self.root_key, &self.dh_send.agree(&header.ratchet_key)?)?;
        let dh_send = SecretKey::generate(rng);
        let (root_key, send_chain) = kdf_root(&root_key, &dh_send.agree(&header.ratchet_key)?)?;

        let advance = advance_chain(
            &recv_chain,
            header.ratchet_key,
            0,
            header.counter,
            limits.max_skip,
        )?;
        let plaintext = open(message, &advance.message_key, associated_data)?;

        tracing::trace!(
            previous_chain_length = header.previous_chain_length,
            skipped = tail.len() + advance.skipped.len(),
            "dh ratchet step"
        );

        self.skipped.extend(tail, limits.max_skipped_keys);
        self.skipped.extend(advance.skipped, limits.max_skipped_keys);
        if let Some(old_key) = self.dh_recv.replace(header.ratchet_key) {
            self.retired_remote_keys.push_back(old_key);
            while self.retired_remote_keys.len() > limits.max_retired_ratchet_keys {
                self.retired_remote_keys.pop_front();
            }
        }
        self.root_key = root_key;
        self.recv_chain = Some(advance.next_chain_key);
        self.recv_count = header.counter + 1;
        self.prev_chain_length = self.send_count;
        self.send_count = 0;
        self.send_chain = Some(send_chain);
        self.dh_send = dh_send;

        Ok(plaintext)
    }

    /// Whether a sending chain exists.
    #[must_use]
    pub fn can_send(&self) -> bool {
        self.send_chain.is_some()
    }

    #[must_use]
    pub fn send_count(&self) -> u32 {
        self.send_count
    }

    #[must_use]
    pub fn recv_count(&self) -> u32 {
        self.recv_count
    }

    #[must_use]
    pub fn previous_chain_length(&self) -> u32 {
        self.prev_chain_length
    }

    /// Number of cached skipped message keys.
    #[must_use]
    pub fn skipped_len(&self) -> usize {
        self.skipped.entries.len()
    }

    #[must_use]
    pub fn local_ratchet_key(&self) -> PublicKey {
        self.dh_send.public_key()
    }

    #[must_use]
    pub fn remote_ratchet_key(&self) -> Option<PublicKey> {
        self.dh_recv
    }
}

impl std::fmt::Debug for RatchetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatchetState")
            .field("send_count", &self.send_count)
            .field("recv_count", &self.recv_count)
            .field("prev_chain_length", &self.prev_chain_length)
            .field("skipped_keys", &self.skipped.entries.len())
            .finish_non_exhaustive()
    }
}
