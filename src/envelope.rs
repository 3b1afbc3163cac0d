//! Wire unit exchanged through the relay.
//!
//! ```text
//! envelope   = version:u8 | kind:u8 | device_id:u32le | user_len:u16le | user_id | content
//! message    = header(40) | ciphertext
//! prekey msg = registration_id:u32le | signed_prekey_id:u32le | has_opk:u8 | opk_id:u32le
//!              | base_key(32) | identity_key(32) | message
//! rehandshake = base_key(32)
//! ```

use crate::error::{Error, Result};
use crate::keys::PublicKey;
use crate::ratchet::RatchetMessage;
use crate::session::SessionAddress;
use base64::{engine::general_purpose::STANDARD, Engine as _};

/// Envelope format version written by this build.
pub const ENVELOPE_VERSION: u8 = 1;

const FIXED_HEADER: usize = 1 + 1 + 4 + 2;
const PREKEY_FIXED: usize = 4 + 4 + 1 + 4 + 32 + 32;

/// Content type carried by an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EnvelopeKind {
    /// Ratchet message on an established session
    Message = 2,
    /// Ratchet message prefixed with the handshake that creates the session
    PreKey = 3,
    /// Unauthenticated request from a responder that could not complete the
    /// handshake identified by the carried base key
    Rehandshake = 4,
}

impl TryFrom<u8> for EnvelopeKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            2 => Ok(EnvelopeKind::Message),
            3 => Ok(EnvelopeKind::PreKey),
            4 => Ok(EnvelopeKind::Rehandshake),
            _ => Err(Error::InvalidMessageFormat),
        }
    }
}

/// First message(s) from an initiator: handshake material plus ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKeyMessage {
    pub registration_id: u32,
    pub signed_prekey_id: u32,
    pub one_time_prekey_id: Option<u32>,
    /// Initiator's ephemeral key
    pub base_key: PublicKey,
    pub identity_key: PublicKey,
    pub message: RatchetMessage,
}

impl PreKeyMessage {
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let message = self.message.to_bytes();
        let mut bytes = Vec::with_capacity(PREKEY_FIXED + message.len());
        bytes.extend_from_slice(&self.registration_id.to_le_bytes());
        bytes.extend_from_slice(&self.signed_prekey_id.to_le_bytes());
        bytes.push(u8::from(self.one_time_prekey_id.is_some()));
        bytes.extend_from_slice(&self.one_time_prekey_id.unwrap_or(0).to_le_bytes());
        bytes.extend_from_slice(self.base_key.as_bytes());
        bytes.extend_from_slice(self.identity_key.as_bytes());
        bytes.extend_from_slice(&message);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PREKEY_FIXED {
            return Err(Error::InvalidMessageFormat);
        }
        let registration_id = read_u32(&bytes[0..4])?;
        let signed_prekey_id = read_u32(&bytes[4..8])?;
        let one_time_prekey_id = match bytes[8] {
            0 => None,
            1 => Some(read_u32(&bytes[9..13])?),
            _ => return Err(Error::InvalidMessageFormat),
        };
        let base_key = PublicKey::try_from(&bytes[13..45])?;
        let identity_key = PublicKey::try_from(&bytes[45..77])?;
        let message = RatchetMessage::from_bytes(&bytes[PREKEY_FIXED..])?;

        Ok(Self {
            registration_id,
            signed_prekey_id,
            one_time_prekey_id,
            base_key,
            identity_key,
            message,
        })
    }
}

fn read_u32(bytes: &[u8]) -> Result<u32> {
    Ok(u32::from_le_bytes(
        bytes.try_into().map_err(|_| Error::InvalidMessageFormat)?,
    ))
}

/// Parsed envelope content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeContent {
    Message(RatchetMessage),
    PreKey(PreKeyMessage),
    /// Base key of the handshake the sender rejected
    Rehandshake(PublicKey),
}

/// Immutable wire unit: sender, protocol version and kind, ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    version: u8,
    kind: EnvelopeKind,
    sender: SessionAddress,
    content: Vec<u8>,
}

impl Envelope {
    pub(crate) fn new(kind: EnvelopeKind, sender: SessionAddress, content: Vec<u8>) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            kind,
            sender,
            content,
        }
    }

    /// Asks `recipient`'s side to drop the handshake with `base_key` and
    /// start over from a fresh bundle.
    #[must_use]
    pub fn rehandshake(sender: SessionAddress, base_key: &PublicKey) -> Self {
        Self::new(EnvelopeKind::Rehandshake, sender, base_key.as_bytes().to_vec())
    }

    #[must_use]
    pub fn version(&self) -> u8 {
        self.version
    }

    #[must_use]
    pub fn kind(&self) -> EnvelopeKind {
        self.kind
    }

    #[must_use]
    pub fn sender(&self) -> &SessionAddress {
        &self.sender
    }

    /// Encoded ratchet or prekey message.
    #[must_use]
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Parses the content according to the envelope kind.
    pub fn decode(&self) -> Result<EnvelopeContent> {
        match self.kind {
            EnvelopeKind::Message => Ok(EnvelopeContent::Message(RatchetMessage::from_bytes(
                &self.content,
            )?)),
            EnvelopeKind::PreKey => Ok(EnvelopeContent::PreKey(PreKeyMessage::from_bytes(
                &self.content,
            )?)),
            EnvelopeKind::Rehandshake => Ok(EnvelopeContent::Rehandshake(
                PublicKey::try_from(self.content.as_slice())
                    .map_err(|_| Error::InvalidMessageFormat)?,
            )),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let user = self.sender.user_id.as_bytes();
        let user_len = u16::try_from(user.len()).map_err(|_| Error::SerializationError)?;

        let mut bytes = Vec::with_capacity(FIXED_HEADER + user.len() + self.content.len());
        bytes.push(self.version);
        bytes.push(self.kind as u8);
        bytes.extend_from_slice(&self.sender.device_id.to_le_bytes());
        bytes.extend_from_slice(&user_len.to_le_bytes());
        bytes.extend_from_slice(user);
        bytes.extend_from_slice(&self.content);
        Ok(bytes)
    }

    /// Parses an envelope, rejecting unknown versions and kinds.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FIXED_HEADER {
            return Err(Error::InvalidMessageFormat);
        }
        let version = bytes[0];
        if version != ENVELOPE_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let kind = EnvelopeKind::try_from(bytes[1])?;
        let device_id = read_u32(&bytes[2..6])?;
        let user_len = usize::from(u16::from_le_bytes([bytes[6], bytes[7]]));

        let rest = &bytes[FIXED_HEADER..];
        if rest.len() < user_len {
            return Err(Error::InvalidMessageFormat);
        }
        let user_id = std::str::from_utf8(&rest[..user_len])
            .map_err(|_| Error::InvalidMessageFormat)?
            .to_owned();

        Ok(Self {
            version,
            kind,
            sender: SessionAddress::new(user_id, device_id),
            content: rest[user_len..].to_vec(),
        })
    }

    pub fn to_base64(&self) -> Result<String> {
        Ok(STANDARD.encode(self.to_bytes()?))
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|_| Error::InvalidMessageFormat)?;
        Self::from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratchet::Header;

    fn ratchet_message() -> RatchetMessage {
        RatchetMessage {
            header: Header {
                ratchet_key: PublicKey::from_bytes([4u8; 32]),
                previous_chain_length: 1,
                counter: 2,
            },
            ciphertext: vec![0xAA; 24],
        }
    }

    #[test]
    fn test_envelope_bytes() {
        let envelope = Envelope::new(
            EnvelopeKind::Message,
            SessionAddress::new("alice", 3),
            ratchet_message().to_bytes(),
        );
        let bytes = envelope.to_bytes().unwrap();
        assert_eq!(&bytes[..2], &[ENVELOPE_VERSION, 2]);

        let parsed = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, envelope);
        assert_eq!(parsed.sender(), &SessionAddress::new("alice", 3));
        assert_eq!(parsed.decode().unwrap(), EnvelopeContent::Message(ratchet_message()));
    }

    #[test]
    fn test_prekey_message_with_and_without_opk() {
        for one_time_prekey_id in [Some(11), None] {
            let message = PreKeyMessage {
                registration_id: 900,
                signed_prekey_id: 4,
                one_time_prekey_id,
                base_key: PublicKey::from_bytes([5u8; 32]),
                identity_key: PublicKey::from_bytes([6u8; 32]),
                message: ratchet_message(),
            };
            let envelope = Envelope::new(
                EnvelopeKind::PreKey,
                SessionAddress::new("alice", 1),
                message.to_bytes(),
            );
            let decoded = Envelope::from_base64(&envelope.to_base64().unwrap())
                .unwrap()
                .decode()
                .unwrap();
            assert_eq!(decoded, EnvelopeContent::PreKey(message));
        }
    }

    #[test]
    fn test_rehandshake_request() {
        let base_key = PublicKey::from_bytes([7u8; 32]);
        let envelope = Envelope::rehandshake(SessionAddress::new("bob", 2), &base_key);
        let bytes = envelope.to_bytes().unwrap();
        assert_eq!(bytes[1], 4);

        let parsed = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.kind(), EnvelopeKind::Rehandshake);
        assert_eq!(parsed.decode().unwrap(), EnvelopeContent::Rehandshake(base_key));

        let truncated = Envelope::new(EnvelopeKind::Rehandshake, SessionAddress::new("bob", 2), vec![7u8; 31]);
        assert_eq!(truncated.decode().unwrap_err(), Error::InvalidMessageFormat);
    }

    #[test]
    fn test_rejects_malformed_input() {
        assert_eq!(Envelope::from_bytes(&[1, 2]).unwrap_err(), Error::InvalidMessageFormat);
        assert_eq!(
            Envelope::from_bytes(&[9, 2, 0, 0, 0, 0, 0, 0]).unwrap_err(),
            Error::UnsupportedVersion(9)
        );
        assert_eq!(
            Envelope::from_bytes(&[1, 7, 0, 0, 0, 0, 0, 0]).unwrap_err(),
            Error::InvalidMessageFormat
        );
        assert_eq!(
            Envelope::from_bytes(&[1, 2, 0, 0, 0, 0, 5, 0, b'a']).unwrap_err(),
            Error::InvalidMessageFormat
        );
        assert_eq!(
            Envelope::from_base64("not base64!").unwrap_err(),
            Error::InvalidMessageFormat
        );

        let mut prekey = vec![0u8; PREKEY_FIXED];
        prekey[8] = 2;
        assert_eq!(
            PreKeyMessage::from_bytes(&prekey).unwrap_err(),
            Error::InvalidMessageFormat
        );
    }
}
