//! Application-facing session layer.
//!
//! [`SessionManager`] wires the key store, session store, establisher and
//! cipher to a [`Directory`] and a [`TransportAdapter`], and owns the retry
//! policy: sends without a session trigger a bounded number of handshakes,
//! sends that hit an unreachable directory or relay are queued, duplicate
//! deliveries are dropped, and repeated authentication failures reset the
//! session. A handshake the peer could not complete is reported back with a
//! rehandshake request, which makes the initiator start over from a fresh
//! bundle.
//!
//! Only bundle fetches, publishes and relay sends await. No lock is held
//! across those awaits.

use crate::cipher::MessageCipher;
use crate::config::SessionConfig;
use crate::directory::{BundleFetcher, BundlePublisher, Directory};
use crate::envelope::{Envelope, EnvelopeContent, EnvelopeKind};
use crate::error::{Error, ErrorClass, Result};
use crate::establish::SessionEstablisher;
use crate::keys::PublicKey;
use crate::keystore::KeyStore;
use crate::logging::Fingerprint;
use crate::session::{unix_now, SessionAddress, SessionStatus, SessionStore};
use crate::storage::Storage;
use crate::transport::TransportAdapter;
use crate::trust::IdentityStore;
use rand_core::OsRng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use zeroize::Zeroizing;

/// What happened to a message handed to [`SessionManager::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Encrypted and accepted by the relay
    Sent,
    /// Held for [`SessionManager::flush_pending`]
    Queued,
}

/// Result of a [`SessionManager::flush_pending`] pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub delivered: usize,
    pub requeued: usize,
    /// Messages dropped from the queue because of a non-recoverable error
    pub failed: Vec<(SessionAddress, Error)>,
}

enum Outbound {
    // no session yet, encrypted once one exists
    Plaintext(Zeroizing<Vec<u8>>),
    // already encrypted, relay was unavailable
    Envelope(Envelope),
}

struct Pending {
    peer: SessionAddress,
    outbound: Outbound,
}

fn guard<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| Error::InvalidSessionState)
}

/// Keeps `peer` in the establishing set until dropped, so a cancelled
/// send does not leave it there.
struct Establishing<'a> {
    set: &'a Mutex<HashSet<SessionAddress>>,
    peer: &'a SessionAddress,
}

impl<'a> Establishing<'a> {
    fn enter(set: &'a Mutex<HashSet<SessionAddress>>, peer: &'a SessionAddress) -> Result<Self> {
        guard(set)?.insert(peer.clone());
        Ok(Self { set, peer })
    }
}

impl Drop for Establishing<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(self.peer);
        }
    }
}

/// Orchestrates sessions for one local device.
pub struct SessionManager {
    local: SessionAddress,
    config: SessionConfig,
    key_store: Arc<KeyStore>,
    sessions: Arc<SessionStore>,
    trust: Arc<IdentityStore>,
    establisher: Arc<SessionEstablisher>,
    cipher: MessageCipher,
    publisher: BundlePublisher,
    fetcher: BundleFetcher,
    directory: Arc<dyn Directory>,
    transport: Arc<dyn TransportAdapter>,
    outbox: Mutex<VecDeque<Pending>>,
    failures: Mutex<HashMap<SessionAddress, u32>>,
    rehandshakes: Mutex<HashMap<SessionAddress, u32>>,
    establishing: Mutex<HashSet<SessionAddress>>,
}

impl SessionManager {
    /// Opens the stores on `storage` for the local device `local`.
    ///
    /// # Errors
    /// `InvalidConfig` for an inconsistent `config`, storage errors while
    /// loading the key store.
    pub fn open(
        local: SessionAddress,
        storage: Arc<dyn Storage>,
        config: SessionConfig,
        directory: Arc<dyn Directory>,
        transport: Arc<dyn TransportAdapter>,
    ) -> Result<Self> {
        config.validate()?;

        let key_store = Arc::new(KeyStore::open(
            Arc::clone(&storage),
            local.device_id,
            config.clone(),
        )?);
        let sessions = Arc::new(SessionStore::open(Arc::clone(&storage)));
        let trust = Arc::new(IdentityStore::open(storage));
        let establisher = Arc::new(SessionEstablisher::new(
            Arc::clone(&key_store),
            Arc::clone(&sessions),
            Arc::clone(&trust),
            config.clone(),
        ));
        let cipher = MessageCipher::new(
            local.clone(),
            Arc::clone(&key_store),
            Arc::clone(&sessions),
            Arc::clone(&trust),
            Arc::clone(&establisher),
        );
        let publisher = BundlePublisher::new(
            Arc::clone(&key_store),
            Arc::clone(&directory),
            local.clone(),
            config.prekey_target,
        );
        let fetcher = BundleFetcher::new(Arc::clone(&directory), config.fetch_timeout());

        tracing::debug!(address = %local, "session manager opened");
        Ok(Self {
            local,
            config,
            key_store,
            sessions,
            trust,
            establisher,
            cipher,
            publisher,
            fetcher,
            directory,
            transport,
            outbox: Mutex::new(VecDeque::new()),
            failures: Mutex::new(HashMap::new()),
            rehandshakes: Mutex::new(HashMap::new()),
            establishing: Mutex::new(HashSet::new()),
        })
    }

    #[must_use]
    pub fn local_address(&self) -> &SessionAddress {
        &self.local
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    #[must_use]
    pub fn key_store(&self) -> &Arc<KeyStore> {
        &self.key_store
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Creates missing key material and publishes the bundle.
    ///
    /// Safe to call on every start: an existing identity is kept and the
    /// signed prekey is only rotated when due.
    pub async fn start(&self) -> Result<()> {
        let mut rng = OsRng;
        if !self.key_store.has_identity()? {
            self.key_store.generate_identity(&mut rng)?;
        }
        let now = unix_now();
        if self.key_store.signed_prekey_due(now)? {
            self.key_store.rotate_signed_prekey_at(&mut rng, now)?;
        }
        self.publisher.replenish_and_publish(&mut rng).await
    }

    /// Encrypts `plaintext` for `peer` and relays it, establishing a session
    /// first if needed.
    ///
    /// # Errors
    /// Security-critical errors (`InvalidSignature`, `UntrustedIdentity`)
    /// block the send. Rehandshake errors surface once
    /// `max_handshake_attempts` is exhausted.
    pub async fn send(&self, peer: &SessionAddress, plaintext: &[u8]) -> Result<SendOutcome> {
        let outbound = Outbound::Plaintext(Zeroizing::new(plaintext.to_vec()));
        match self.attempt(peer, outbound).await {
            Ok(()) => Ok(SendOutcome::Sent),
            Err((outbound, err)) if err.is_recoverable() => {
                guard(&self.outbox)?.push_back(Pending {
                    peer: peer.clone(),
                    outbound,
                });
                tracing::info!(peer = %peer, reason = %err, "message queued");
                Ok(SendOutcome::Queued)
            }
            Err((_, err)) => {
                if err.is_security_critical() {
                    tracing::warn!(peer = %peer, error = %err, "send blocked");
                }
                Err(err)
            }
        }
    }

    /// Moves `outbound` one step closer to the relay. On failure hands back
    /// what is left to send: the plaintext, or the envelope once encrypted.
    async fn attempt(
        &self,
        peer: &SessionAddress,
        outbound: Outbound,
    ) -> std::result::Result<(), (Outbound, Error)> {
        let envelope = match outbound {
            Outbound::Envelope(envelope) => envelope,
            Outbound::Plaintext(plaintext) => match self.encrypt_or_establish(peer, &plaintext).await {
                Ok(envelope) => envelope,
                Err(err) => return Err((Outbound::Plaintext(plaintext), err)),
            },
        };
        self.transport
            .send(peer, &envelope)
            .await
            .map_err(|err| (Outbound::Envelope(envelope), err))
    }

    async fn encrypt_or_establish(&self, peer: &SessionAddress, plaintext: &[u8]) -> Result<Envelope> {
        let mut attempts = 0;
        loop {
            match self.cipher.encrypt(peer, plaintext) {
                Ok(envelope) => return Ok(envelope),
                Err(err)
                    if err.class() == ErrorClass::Rehandshake
                        && attempts < self.config.max_handshake_attempts =>
                {
                    attempts += 1;
                    tracing::debug!(peer = %peer, attempt = attempts, "establishing session");
                    self.establish(peer).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn establish(&self, peer: &SessionAddress) -> Result<()> {
        let _establishing = Establishing::enter(&self.establishing, peer)?;
        let bundle = self.fetcher.fetch(peer).await?;
        self.establisher.initiate(&mut OsRng, peer, &bundle)
    }

    /// Decrypts an inbound envelope.
    ///
    /// Returns `Ok(None)` for duplicates, messages whose keys have expired
    /// and rehandshake requests. After `reset_after_failures` consecutive
    /// authentication failures from one peer its session is reset. A
    /// handshake that cannot be completed is answered with a rehandshake
    /// request before the error is returned.
    pub async fn receive(&self, envelope: &Envelope) -> Result<Option<Vec<u8>>> {
        let peer = envelope.sender().clone();
        if envelope.kind() == EnvelopeKind::Rehandshake {
            self.handle_rehandshake(envelope).await?;
            return Ok(None);
        }

        let decrypted = match self.cipher.decrypt(&mut OsRng, envelope) {
            Ok(decrypted) => decrypted,
            Err(Error::DuplicateOrExpired) => return Ok(None),
            Err(Error::AuthenticationFailed) => {
                self.record_failure(&peer)?;
                return Err(Error::AuthenticationFailed);
            }
            Err(err @ Error::EstablishmentFailed(_)) => {
                self.request_rehandshake(envelope).await;
                return Err(err);
            }
            Err(err) => return Err(err),
        };
        guard(&self.failures)?.remove(&peer);
        guard(&self.rehandshakes)?.remove(&peer);

        if decrypted.consumed_one_time_prekey.is_some() && self.key_store.needs_replenish()? {
            if let Err(err) = self.publisher.replenish_and_publish(&mut OsRng).await {
                tracing::warn!(error = %err, "replenishment after handshake failed");
            }
        }
        Ok(Some(decrypted.plaintext))
    }

    async fn request_rehandshake(&self, envelope: &Envelope) {
        let Ok(EnvelopeContent::PreKey(handshake)) = envelope.decode() else {
            return;
        };
        let peer = envelope.sender();
        let request = Envelope::rehandshake(self.local.clone(), &handshake.base_key);
        match self.transport.send(peer, &request).await {
            Ok(()) => tracing::info!(
                peer = %peer,
                base_key = %Fingerprint(&handshake.base_key),
                "requested rehandshake"
            ),
            Err(err) => tracing::warn!(peer = %peer, error = %err, "rehandshake request not relayed"),
        }
    }

    /// Drops our unanswered handshake named by the request and establishes
    /// again, at most `max_handshake_attempts` times until the peer answers.
    async fn handle_rehandshake(&self, envelope: &Envelope) -> Result<()> {
        let peer = envelope.sender();
        let EnvelopeContent::Rehandshake(base_key) = envelope.decode()? else {
            return Err(Error::InvalidMessageFormat);
        };

        // the request is unauthenticated: it may only abandon a handshake
        // the peer never answered
        let abandoned = self.sessions.transact(peer, |slot| {
            let unanswered = slot.as_ref().map_or(false, |record| {
                record.pending_prekey().is_some() && record.base_key() == &base_key
            });
            if unanswered {
                *slot = None;
            }
            Ok(unanswered)
        })?;
        if !abandoned {
            tracing::debug!(peer = %peer, "ignored rehandshake request");
            return Ok(());
        }

        let attempts = {
            let mut counts = guard(&self.rehandshakes)?;
            let count = counts.entry(peer.clone()).or_insert(0);
            *count += 1;
            *count
        };
        if attempts > self.config.max_handshake_attempts {
            tracing::warn!(peer = %peer, attempts, "rehandshake limit reached, session dropped");
            return Ok(());
        }

        tracing::warn!(peer = %peer, attempts, "peer rejected handshake, establishing again");
        if let Err(err) = self.establish(peer).await {
            tracing::warn!(peer = %peer, error = %err, "rehandshake failed");
        }
        Ok(())
    }

    fn record_failure(&self, peer: &SessionAddress) -> Result<()> {
        // senders without a session are not tracked
        if !self.sessions.contains(peer)? {
            return Ok(());
        }
        let failures = {
            let mut counts = guard(&self.failures)?;
            let count = counts.entry(peer.clone()).or_insert(0);
            *count += 1;
            *count
        };
        if failures >= self.config.reset_after_failures {
            tracing::warn!(peer = %peer, failures, "too many authentication failures");
            self.reset_session(peer)?;
        }
        Ok(())
    }

    /// Retries queued messages in order.
    ///
    /// Once a message for a peer is requeued, later messages for that peer
    /// are requeued behind it.
    pub async fn flush_pending(&self) -> Result<FlushReport> {
        let queued: Vec<Pending> = guard(&self.outbox)?.drain(..).collect();
        let mut report = FlushReport::default();
        let mut blocked = HashSet::new();
        let mut requeue = Vec::new();

        for Pending { peer, outbound } in queued {
            if blocked.contains(&peer) {
                requeue.push(Pending { peer, outbound });
                continue;
            }
            match self.attempt(&peer, outbound).await {
                Ok(()) => report.delivered += 1,
                Err((outbound, err)) if err.is_recoverable() => {
                    blocked.insert(peer.clone());
                    requeue.push(Pending { peer, outbound });
                }
                Err((_, err)) => {
                    tracing::warn!(peer = %peer, error = %err, "queued message dropped");
                    report.failed.push((peer, err));
                }
            }
        }

        report.requeued = requeue.len();
        let mut outbox = guard(&self.outbox)?;
        for pending in requeue.into_iter().rev() {
            outbox.push_front(pending);
        }
        tracing::debug!(delivered = report.delivered, requeued = report.requeued, "flushed outbox");
        Ok(report)
    }

    /// Number of queued messages.
    pub fn pending_count(&self) -> Result<usize> {
        Ok(guard(&self.outbox)?.len())
    }

    pub fn status(&self, peer: &SessionAddress) -> Result<SessionStatus> {
        if guard(&self.establishing)?.contains(peer) {
            return Ok(SessionStatus::Establishing);
        }
        Ok(if self.sessions.contains(peer)? {
            SessionStatus::Active
        } else {
            SessionStatus::NoSession
        })
    }

    /// Discards the session with `peer`; the next send re-handshakes.
    pub fn reset_session(&self, peer: &SessionAddress) -> Result<bool> {
        guard(&self.failures)?.remove(peer);
        guard(&self.rehandshakes)?.remove(peer);
        let existed = self.sessions.delete(peer)?;
        if existed {
            tracing::warn!(peer = %peer, "session reset");
        }
        Ok(existed)
    }

    /// Accepts a changed identity key for `peer`.
    pub fn trust_identity(&self, peer: &SessionAddress, key: &PublicKey) -> Result<()> {
        self.trust.trust_identity(peer, key)
    }

    /// Periodic upkeep: rotates a due signed prekey, purges expired ones and
    /// tops up one-time prekeys, publishing if anything changed.
    pub async fn maintain(&self) -> Result<()> {
        let mut rng = OsRng;
        let now = unix_now();
        let mut changed = false;

        if self.key_store.signed_prekey_due(now)? {
            self.key_store.rotate_signed_prekey_at(&mut rng, now)?;
            changed = true;
        }
        self.key_store.purge_retired_signed_prekeys(now)?;
        if self.key_store.needs_replenish()? {
            self.key_store
                .replenish_one_time_prekeys(&mut rng, self.config.prekey_target)?;
            changed = true;
        }
        // an earlier upload may have failed
        changed |= !self.key_store.unpublished_bundle()?.one_time_prekeys.is_empty();

        if changed {
            self.publisher.publish().await?;
        }
        Ok(())
    }

    /// Flushes key material to storage.
    pub fn close(&self) -> Result<()> {
        let queued = self.pending_count()?;
        if queued > 0 {
            tracing::warn!(queued, "closing with undelivered messages");
        }
        self.key_store.flush()?;
        tracing::info!(address = %self.local, "session manager closed");
        Ok(())
    }

    /// Destroys local keys and sessions, then removes the published bundle.
    pub async fn wipe_account(&self) -> Result<()> {
        for peer in self.sessions.addresses()? {
            self.sessions.delete(&peer)?;
        }
        self.key_store.wipe()?;
        guard(&self.outbox)?.clear();
        guard(&self.failures)?.clear();
        guard(&self.rehandshakes)?.clear();
        self.directory.remove(&self.local).await?;
        tracing::warn!(address = %self.local, "account wiped");
        Ok(())
    }
}
