//! Error types for the secure session layer.
//!
//! The first seven variants form the caller-facing taxonomy; the rest are
//! supporting failures that the session components raise internally and that
//! callers usually only need to classify via [`Error::class`].

use thiserror::Error;

/// Result type alias for session layer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during key management, session establishment
/// and message encryption/decryption.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// An identity keypair already exists in the key store
    #[error("identity already exists")]
    AlreadyExists,

    /// Requested key (prekey, signed prekey, identity) is unknown or already consumed
    #[error("key not found")]
    KeyNotFound,

    /// Signed prekey signature does not verify against the bundle identity key
    #[error("invalid signature")]
    InvalidSignature,

    /// No active session for the requested peer device
    #[error("no session")]
    NoSession,

    /// Message counter is behind the receiving chain and no skipped key matches
    #[error("duplicate or expired message")]
    DuplicateOrExpired,

    /// AEAD tag did not verify
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Peer has no published bundle, or the directory/relay could not be reached
    #[error("peer unavailable")]
    Unavailable,

    /// Peer presented an identity key different from the one previously trusted
    #[error("untrusted identity for {0}")]
    UntrustedIdentity(String),

    /// Responder side of a handshake failed; the peer must re-handshake
    #[error("session establishment failed: {0}")]
    EstablishmentFailed(Box<Error>),

    /// A newer bundle fetch for the same peer device replaced this one
    #[error("fetch superseded")]
    Superseded,

    /// Invalid public key encoding
    #[error("invalid public key")]
    InvalidPublicKey,

    /// DH key agreement produced a non-contributory output
    #[error("key agreement failed")]
    KeyAgreementFailed,

    /// Invalid message format
    #[error("invalid message format")]
    InvalidMessageFormat,

    /// Invalid header in ratchet message
    #[error("invalid message header")]
    InvalidHeader,

    /// Gap in a receiving chain exceeds the configured skip limit
    #[error("too many skipped messages")]
    TooManySkippedMessages,

    /// Ratchet state cannot perform the requested operation
    #[error("invalid session state")]
    InvalidSessionState,

    /// Record or envelope carries a version this build does not understand
    #[error("unsupported version {0}")]
    UnsupportedVersion(u8),

    /// Configuration rejected by validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Serialization failed
    #[error("serialization error")]
    SerializationError,

    /// Deserialization failed
    #[error("deserialization error")]
    DeserializationError,

    /// Internal cryptographic error
    #[error("cryptographic error")]
    CryptoError,

    /// Storage operation failed
    #[error("storage error")]
    StorageError,
}

/// How a caller is expected to react to an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry later or drop silently (duplicate delivery, peer offline)
    Recoverable,
    /// Never retried with the same material; surface a trust warning
    SecurityCritical,
    /// Re-run the handshake, bounded by the retry limit
    Rehandshake,
    /// Local failure (storage, encoding, configuration)
    Fatal,
}

impl Error {
    /// Classifies the error for propagation decisions.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Unavailable | Error::DuplicateOrExpired | Error::Superseded => {
                ErrorClass::Recoverable
            }
            Error::InvalidSignature | Error::AuthenticationFailed | Error::UntrustedIdentity(_) => {
                ErrorClass::SecurityCritical
            }
            Error::NoSession | Error::KeyNotFound | Error::EstablishmentFailed(_) => {
                ErrorClass::Rehandshake
            }
            _ => ErrorClass::Fatal,
        }
    }

    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        self.class() == ErrorClass::Recoverable
    }

    #[must_use]
    pub fn is_security_critical(&self) -> bool {
        self.class() == ErrorClass::SecurityCritical
    }
}

impl From<bincode::error::EncodeError> for Error {
    fn from(_: bincode::error::EncodeError) -> Self {
        Error::SerializationError
    }
}

impl From<bincode::error::DecodeError> for Error {
    fn from(_: bincode::error::DecodeError) -> Self {
        Error::DeserializationError
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        tracing::error!(error = %err, "sqlite operation failed");
        Error::StorageError
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::InvalidConfig(err.message().to_owned())
    }
}
