//! Property-based tests for session invariants
//!
//! Uses proptest to check round trips, arbitrary delivery orders and tamper
//! inertness, plus thread-level checks of the per-session locking.

use proptest::prelude::*;
use rand_core::OsRng;
use secure_session::config::RatchetLimits;
use secure_session::crypto::SymmetricKey;
use secure_session::envelope::EnvelopeContent;
use secure_session::ratchet::RatchetState;
use secure_session::{
    Envelope, Error, IdentityStore, InMemoryStorage, KeyStore, MessageCipher, SecretKey,
    SessionAddress, SessionConfig, SessionEstablisher, SessionStore, Storage,
};
use std::collections::HashSet;
use std::sync::{mpsc, Arc};
use std::time::Duration;

struct Device {
    address: SessionAddress,
    key_store: Arc<KeyStore>,
    sessions: Arc<SessionStore>,
    establisher: Arc<SessionEstablisher>,
    cipher: MessageCipher,
}

fn device(user: &str) -> Device {
    let address = SessionAddress::new(user, 1);
    let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
    let config = SessionConfig::default();
    let key_store = Arc::new(KeyStore::open(Arc::clone(&storage), 1, config.clone()).unwrap());
    key_store.generate_identity(&mut OsRng).unwrap();
    key_store.rotate_signed_prekey(&mut OsRng).unwrap();
    key_store.replenish_one_time_prekeys(&mut OsRng, 4).unwrap();

    let sessions = Arc::new(SessionStore::open(Arc::clone(&storage)));
    let trust = Arc::new(IdentityStore::open(storage));
    let establisher = Arc::new(SessionEstablisher::new(
        Arc::clone(&key_store),
        Arc::clone(&sessions),
        Arc::clone(&trust),
        config,
    ));
    let cipher = MessageCipher::new(
        address.clone(),
        Arc::clone(&key_store),
        Arc::clone(&sessions),
        trust,
        Arc::clone(&establisher),
    );
    Device {
        address,
        key_store,
        sessions,
        establisher,
        cipher,
    }
}

/// Alice and Bob with an answered session, so Alice sends plain messages.
fn connected() -> (Device, Device) {
    let alice = device("alice");
    let bob = device("bob");
    let bundle = bob.key_store.public_bundle().unwrap().take_bundle();
    alice
        .establisher
        .initiate(&mut OsRng, &bob.address, &bundle)
        .unwrap();

    let hello = alice.cipher.encrypt(&bob.address, b"hello").unwrap();
    bob.cipher.decrypt(&mut OsRng, &hello).unwrap();
    let ack = bob.cipher.encrypt(&alice.address, b"ack").unwrap();
    alice.cipher.decrypt(&mut OsRng, &ack).unwrap();
    (alice, bob)
}

fn counter(envelope: &Envelope) -> u32 {
    match envelope.decode().unwrap() {
        EnvelopeContent::Message(message) => message.header.counter,
        EnvelopeContent::PreKey(prekey) => prekey.message.header.counter,
        EnvelopeContent::Rehandshake(_) => panic!("rehandshake request carries no counter"),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_session_roundtrip(
        messages in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..512), 1..8)
    ) {
        let (alice, bob) = connected();
        for message in &messages {
            let envelope = alice.cipher.encrypt(&bob.address, message).unwrap();
            let decrypted = bob.cipher.decrypt(&mut OsRng, &envelope).unwrap();
            prop_assert_eq!(&decrypted.plaintext, message);

            let envelope = bob.cipher.encrypt(&alice.address, message).unwrap();
            let decrypted = alice.cipher.decrypt(&mut OsRng, &envelope).unwrap();
            prop_assert_eq!(&decrypted.plaintext, message);
        }
    }

    #[test]
    fn test_out_of_order_delivery_any_order(
        order in Just((0..12usize).collect::<Vec<_>>()).prop_shuffle()
    ) {
        let (alice, bob) = connected();
        let envelopes: Vec<_> = (0..12)
            .map(|n| alice.cipher.encrypt(&bob.address, format!("m{n}").as_bytes()).unwrap())
            .collect();

        for &index in &order {
            let decrypted = bob.cipher.decrypt(&mut OsRng, &envelopes[index]).unwrap();
            prop_assert_eq!(decrypted.plaintext, format!("m{index}").into_bytes());
        }
        for envelope in &envelopes {
            prop_assert_eq!(
                bob.cipher.decrypt(&mut OsRng, envelope).unwrap_err(),
                Error::DuplicateOrExpired
            );
        }
    }

    #[test]
    fn test_single_bit_tamper_is_inert(bit in 0usize..(23 * 8)) {
        let (alice, bob) = connected();
        let envelope = alice.cipher.encrypt(&bob.address, b"payload").unwrap();
        let before = bob.sessions.encoded(&alice.address).unwrap();

        // "payload" is 7 bytes, so the last 23 bytes are ciphertext and tag
        let mut bytes = envelope.to_bytes().unwrap();
        let start = bytes.len() - 23;
        bytes[start + bit / 8] ^= 1 << (bit % 8);
        let tampered = Envelope::from_bytes(&bytes).unwrap();

        prop_assert_eq!(
            bob.cipher.decrypt(&mut OsRng, &tampered).unwrap_err(),
            Error::AuthenticationFailed
        );
        prop_assert_eq!(bob.sessions.encoded(&alice.address).unwrap(), before);
        prop_assert_eq!(bob.cipher.decrypt(&mut OsRng, &envelope).unwrap().plaintext, b"payload".to_vec());
    }

    #[test]
    fn test_ratchet_gap_within_window(gap in 0u32..64) {
        let bob_ratchet_key = SecretKey::generate(&mut OsRng);
        let shared = SymmetricKey::from_bytes([7u8; 32]);
        let mut sender = RatchetState::init_sender(&mut OsRng, &shared, bob_ratchet_key.public_key()).unwrap();
        let mut receiver = RatchetState::init_receiver(shared, bob_ratchet_key);

        let mut last = None;
        for _ in 0..=gap {
            last = Some(sender.encrypt(b"step", b"ad").unwrap());
        }
        let last = last.unwrap();
        receiver.decrypt(&mut OsRng, &last, b"ad", RatchetLimits::default()).unwrap();

        prop_assert_eq!(receiver.recv_count(), gap + 1);
        prop_assert_eq!(receiver.skipped_len(), gap as usize);
    }
}

#[test]
fn test_gap_beyond_window_fails_without_state_change() {
    let bob_ratchet_key = SecretKey::generate(&mut OsRng);
    let shared = SymmetricKey::from_bytes([3u8; 32]);
    let mut sender = RatchetState::init_sender(&mut OsRng, &shared, bob_ratchet_key.public_key()).unwrap();
    let mut receiver = RatchetState::init_receiver(shared, bob_ratchet_key);
    let limits = RatchetLimits {
        max_skip: 8,
        max_skipped_keys: 16,
        max_retired_ratchet_keys: 4,
    };

    let messages: Vec<_> = (0..10).map(|_| sender.encrypt(b"x", b"").unwrap()).collect();
    assert_eq!(
        receiver.decrypt(&mut OsRng, &messages[9], b"", limits).unwrap_err(),
        Error::TooManySkippedMessages
    );
    assert_eq!(receiver.recv_count(), 0);
    assert_eq!(receiver.decrypt(&mut OsRng, &messages[0], b"", limits).unwrap(), b"x");
}

#[test]
fn test_concurrent_encrypt_same_session_serializes() {
    let (alice, bob) = connected();
    let threads = 8;
    let per_thread = 25;

    let per_thread_counters: Vec<Vec<u32>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                scope.spawn(|| {
                    (0..per_thread)
                        .map(|_| counter(&alice.cipher.encrypt(&bob.address, b"race").unwrap()))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    let mut seen = HashSet::new();
    for counters in &per_thread_counters {
        assert!(counters.windows(2).all(|pair| pair[0] < pair[1]));
        for value in counters {
            assert!(seen.insert(*value), "counter {value} reused");
        }
    }
    let expected: HashSet<u32> = (0..threads * per_thread).collect();
    assert_eq!(seen, expected);
}

#[test]
fn test_sessions_do_not_block_each_other() {
    let alice = device("alice");
    let bob = device("bob");
    let carol = device("carol");
    for peer in [&bob, &carol] {
        let bundle = peer.key_store.public_bundle().unwrap().take_bundle();
        alice
            .establisher
            .initiate(&mut OsRng, &peer.address, &bundle)
            .unwrap();
    }

    let (locked_tx, locked_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel();

    std::thread::scope(|scope| {
        let sessions = &alice.sessions;
        let bob_address = &bob.address;
        let holder = scope.spawn(move || {
            sessions.transact(bob_address, |_| {
                locked_tx.send(()).unwrap();
                // carol's session must stay usable while bob's is held
                done_rx
                    .recv_timeout(Duration::from_secs(5))
                    .map_err(|_| Error::InvalidSessionState)
            })
        });

        locked_rx.recv().unwrap();
        alice.cipher.encrypt(&carol.address, b"not blocked").unwrap();
        done_tx.send(()).unwrap();

        assert_eq!(holder.join().unwrap(), Ok(()));
    });
}
