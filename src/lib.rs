//! End-to-end encrypted session layer for a cloud-relayed messaging client.
//!
//! Devices publish X3DH prekey bundles to a directory. A sender fetches the
//! peer device's bundle, derives a shared secret and starts a Double Ratchet
//! session; every message then advances the ratchet, so each message key is
//! used once and discarded.
//!
//! # Security Properties
//!
//! ## Forward Secrecy
//! Message keys are derived from chain keys that are replaced on every step,
//! and one-time prekeys are deleted once a handshake consumes them. Each
//! one-time prekey is uploaded once and the directory hands it out at most
//! once.
//!
//! ## Post-Compromise Security
//! Each reply carries a fresh ratchet key, so a leaked session state stops
//! being useful after one round trip.
//!
//! ## Replay Resistance
//! Relays deliver at least once. Replayed or expired messages fail with
//! [`Error::DuplicateOrExpired`] and leave the stored session unchanged;
//! tampered messages fail with [`Error::AuthenticationFailed`] and are
//! equally inert.
//!
//! ## Trust on First Use
//! The first identity key seen for a peer device is remembered. A bundle or
//! handshake presenting a different key is rejected with
//! [`Error::UntrustedIdentity`] until the application accepts it.
//!
//! # Layers
//!
//! The cryptographic core is synchronous. Only the directory and the relay
//! are async:
//!
//! - [`keystore`]: identity, signed and one-time prekeys
//! - [`session`]: per-peer session records behind per-session locks
//! - [`establish`]: X3DH on both sides of the handshake
//! - [`cipher`]: per-message encryption and decryption
//! - [`directory`], [`transport`]: async boundaries
//! - [`manager`]: retry, queueing and lifecycle on top of all of the above
//!
//! # Example
//!
//! ```no_run
//! use secure_session::{
//!     InMemoryDirectory, InMemoryStorage, LoopbackNetwork, SessionAddress, SessionConfig,
//!     SessionManager,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> secure_session::Result<()> {
//! let directory = Arc::new(InMemoryDirectory::new());
//! let network = Arc::new(LoopbackNetwork::new());
//!
//! let alice_address = SessionAddress::new("alice", 1);
//! let bob_address = SessionAddress::new("bob", 1);
//! let mut bob_inbox = network.register(&bob_address)?;
//!
//! let alice = SessionManager::open(
//!     alice_address,
//!     Arc::new(InMemoryStorage::new()),
//!     SessionConfig::default(),
//!     directory.clone(),
//!     network.clone(),
//! )?;
//! let bob = SessionManager::open(
//!     bob_address.clone(),
//!     Arc::new(InMemoryStorage::new()),
//!     SessionConfig::default(),
//!     directory.clone(),
//!     network.clone(),
//! )?;
//! alice.start().await?;
//! bob.start().await?;
//!
//! alice.send(&bob_address, b"Hello Bob!").await?;
//! if let Some(Ok(envelope)) = bob_inbox.recv().await {
//!     let plaintext = bob.receive(&envelope).await?;
//!     assert_eq!(plaintext.as_deref(), Some(&b"Hello Bob!"[..]));
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unreachable_pub)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![warn(clippy::all, clippy::pedantic, clippy::cargo)]
#![allow(
    missing_docs,
    clippy::missing_errors_doc,
    clippy::missing_fields_in_debug,
    clippy::module_name_repetitions
)]

pub mod cipher;
pub mod config;
pub mod crypto;
pub mod directory;
pub mod envelope;
pub mod error;
pub mod establish;
pub mod keys;
pub mod keystore;
pub mod logging;
pub mod manager;
pub mod ratchet;
pub mod session;
pub mod storage;
pub mod transport;
pub mod trust;
pub mod x3dh;
pub mod xeddsa;

// Re-export main types
pub use cipher::{Decrypted, MessageCipher};
pub use config::SessionConfig;
pub use directory::{BundleFetcher, BundlePublisher, Directory, DirectoryRecord, InMemoryDirectory};
pub use envelope::{Envelope, EnvelopeContent, EnvelopeKind, PreKeyMessage};
pub use error::{Error, ErrorClass, Result};
pub use establish::SessionEstablisher;
pub use keys::{IdentityKeyPair, PublicKey, SecretKey};
pub use keystore::KeyStore;
pub use manager::{FlushReport, SendOutcome, SessionManager};
pub use session::{SessionAddress, SessionRecord, SessionStatus, SessionStore};
pub use storage::{InMemoryStorage, SqliteStorage, Storage};
pub use transport::{Inbox, LoopbackNetwork, TransportAdapter};
pub use trust::IdentityStore;
pub use x3dh::{PreKeyBundle, PublishedBundle};
