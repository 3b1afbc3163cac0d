//! Fuzz target for the AEAD layer with corrupted inputs
//!
//! Ensures decryption failures don't cause panics

#![no_main]

use libfuzzer_sys::fuzz_target;
use secure_session::crypto::{decrypt, encrypt, message_nonce, SymmetricKey};

fuzz_target!(|data: &[u8]| {
    if data.len() < 32 + 4 {
        return;
    }

    let key = SymmetricKey::from_bytes(data[..32].try_into().unwrap());
    let counter = u32::from_le_bytes(data[32..36].try_into().unwrap());
    let nonce = message_nonce(counter, key.as_bytes());
    let plaintext = &data[36..];

    let ciphertext = encrypt(&key, &nonce, plaintext, b"ad").expect("encryption should succeed");
    let decrypted = decrypt(&key, &nonce, &ciphertext, b"ad").expect("decryption should succeed");
    assert_eq!(decrypted, plaintext);

    let mut corrupted = ciphertext.clone();
    corrupted[0] ^= 1;
    assert!(decrypt(&key, &nonce, &corrupted, b"ad").is_err());
    assert!(decrypt(&key, &nonce, &ciphertext, b"other").is_err());
    assert!(decrypt(&key, &nonce, plaintext, b"ad").is_err());
});
