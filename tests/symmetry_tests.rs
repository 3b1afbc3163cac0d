use rand_core::OsRng;
use secure_session::{
    x3dh::{initiate, respond},
    Error, IdentityKeyPair, InMemoryStorage, KeyStore, PreKeyBundle, SecretKey, SessionConfig,
    SessionRecord,
};
use std::sync::Arc;

fn responder() -> KeyStore {
    let store = KeyStore::open(Arc::new(InMemoryStorage::new()), 1, SessionConfig::default()).unwrap();
    store.generate_identity(&mut OsRng).unwrap();
    store.rotate_signed_prekey(&mut OsRng).unwrap();
    store.replenish_one_time_prekeys(&mut OsRng, 3).unwrap();
    store
}

fn bundle(store: &KeyStore) -> PreKeyBundle {
    store.public_bundle().unwrap().take_bundle()
}

#[test]
fn test_x3dh_formal_symmetry_multiple_runs() {
    for _ in 0..50 {
        let alice_identity = IdentityKeyPair::generate(&mut OsRng);
        let bob = responder();
        let bundle = bundle(&bob);

        let alice_x3dh = initiate(&mut OsRng, &alice_identity, &bundle).unwrap();

        let (opk_id, _) = bundle.one_time_prekey.unwrap();
        let bob_x3dh = respond(
            &bob.identity().unwrap(),
            &bob.signed_prekey(bundle.signed_prekey_id).unwrap(),
            Some(&bob.one_time_prekey(opk_id).unwrap()),
            alice_identity.public_key(),
            &alice_x3dh.base_key,
        )
        .unwrap();

        assert_eq!(
            alice_x3dh.shared_secret.as_bytes(),
            bob_x3dh.shared_secret.as_bytes(),
            "X3DH symmetry violated"
        );
        assert_eq!(alice_x3dh.associated_data, bob_x3dh.associated_data);
    }
}

#[test]
fn test_missing_one_time_prekey_breaks_agreement() {
    let alice_identity = IdentityKeyPair::generate(&mut OsRng);
    let bob = responder();
    let bundle = bundle(&bob);
    let alice_x3dh = initiate(&mut OsRng, &alice_identity, &bundle).unwrap();

    let bob_x3dh = respond(
        &bob.identity().unwrap(),
        &bob.signed_prekey(bundle.signed_prekey_id).unwrap(),
        None,
        alice_identity.public_key(),
        &alice_x3dh.base_key,
    )
    .unwrap();

    assert_ne!(
        alice_x3dh.shared_secret.as_bytes(),
        bob_x3dh.shared_secret.as_bytes()
    );
}

#[test]
fn test_dh_input_sensitivity() {
    let alice_identity = IdentityKeyPair::generate(&mut OsRng);
    let bob = responder();
    let first = bundle(&bob);

    bob.rotate_signed_prekey(&mut OsRng).unwrap();
    let second = bundle(&bob);

    let alice_x3dh_1 = initiate(&mut OsRng, &alice_identity, &first).unwrap();
    let alice_x3dh_2 = initiate(&mut OsRng, &alice_identity, &second).unwrap();

    assert_ne!(
        alice_x3dh_1.shared_secret.as_bytes(),
        alice_x3dh_2.shared_secret.as_bytes(),
        "Changing DH inputs must change shared secret"
    );
}

#[test]
fn test_identity_substitution_attempts() {
    let bob = responder();
    let attempter_identity = IdentityKeyPair::generate(&mut OsRng);
    let original = bundle(&bob);
    assert!(original.verify_signature().is_ok());

    let mut attempt = original.clone();
    attempt.identity_key = *attempter_identity.public_key();
    assert_eq!(attempt.verify_signature(), Err(Error::InvalidSignature));

    let attempter_spk = SecretKey::generate(&mut OsRng);
    let mut attempt = original.clone();
    attempt.signed_prekey = attempter_spk.public_key();
    assert_eq!(attempt.verify_signature(), Err(Error::InvalidSignature));

    let mut attempt = original.clone();
    attempt.identity_key = *attempter_identity.public_key();
    attempt.signed_prekey = attempter_spk.public_key();
    assert_eq!(attempt.verify_signature(), Err(Error::InvalidSignature));

    let mut attempt = original;
    let mut signature = *attempt.signed_prekey_signature.as_bytes();
    signature[0] ^= 0xFF;
    attempt.signed_prekey_signature = secure_session::xeddsa::Signature::from_bytes(signature);
    assert_eq!(attempt.verify_signature(), Err(Error::InvalidSignature));
}

#[test]
fn test_mitm_full_attempt_scenario() {
    let alice_identity = IdentityKeyPair::generate(&mut OsRng);
    let attempter_identity = IdentityKeyPair::generate(&mut OsRng);
    let mut bundle = bundle(&responder());

    bundle.identity_key = *attempter_identity.public_key();

    assert_eq!(
        initiate(&mut OsRng, &alice_identity, &bundle).unwrap_err(),
        Error::InvalidSignature
    );
}

#[test]
fn test_xeddsa_signature_uniqueness() {
    let bob = responder();
    let first = bundle(&bob);
    bob.rotate_signed_prekey(&mut OsRng).unwrap();
    let second = bundle(&bob);

    assert_eq!(first.identity_key, second.identity_key);
    assert_ne!(first.signed_prekey, second.signed_prekey);
    assert_ne!(
        first.signed_prekey_signature, second.signed_prekey_signature,
        "XEdDSA signatures should be randomized"
    );
    assert!(first.verify_signature().is_ok());
    assert!(second.verify_signature().is_ok());

    let identity = bob.identity().unwrap();
    let message = b"same message";
    let sig1 = identity.sign(&mut OsRng, message).unwrap();
    let sig2 = identity.sign(&mut OsRng, message).unwrap();
    assert_ne!(sig1, sig2);
    secure_session::xeddsa::verify(identity.public_key(), message, &sig1).unwrap();
    secure_session::xeddsa::verify(identity.public_key(), message, &sig2).unwrap();
}

#[test]
fn test_xeddsa_cross_bundle_signature_reuse_fails() {
    let bob_bundle = bundle(&responder());
    let mut eve_bundle = bundle(&responder());

    eve_bundle.signed_prekey_signature = bob_bundle.signed_prekey_signature;

    assert!(
        eve_bundle.verify_signature().is_err(),
        "Signature from different identity should not verify"
    );
}

#[test]
fn test_ratchet_serialization_determinism() {
    use secure_session::crypto::SymmetricKey;
    use secure_session::ratchet::RatchetState;
    use secure_session::session::SESSION_RECORD_VERSION;

    let bob_ratchet = SecretKey::generate(&mut OsRng);
    let state = RatchetState::init_sender(
        &mut OsRng,
        &SymmetricKey::from_bytes([9u8; 32]),
        bob_ratchet.public_key(),
    )
    .unwrap();
    let json1 = serde_json::to_vec(&state).unwrap();
    let json2 = serde_json::to_vec(&state.clone()).unwrap();
    assert_eq!(json1, json2, "Serialization must be deterministic");

    let mut bytes = vec![SESSION_RECORD_VERSION + 1];
    bytes.extend_from_slice(&json1);
    assert_eq!(
        SessionRecord::from_bytes(&bytes).unwrap_err(),
        Error::UnsupportedVersion(SESSION_RECORD_VERSION + 1)
    );
}
