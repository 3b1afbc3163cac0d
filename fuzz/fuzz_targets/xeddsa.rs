#![no_main]

use libfuzzer_sys::fuzz_target;
use secure_session::keys::PublicKey;
use secure_session::xeddsa::{verify, Signature, SIGNATURE_LENGTH};
use secure_session::x3dh::PreKeyBundle;

fuzz_target!(|data: &[u8]| {
    if data.len() < 32 + SIGNATURE_LENGTH {
        return;
    }

    let public = PublicKey::from_bytes(data[..32].try_into().unwrap());
    let signature = Signature::from_bytes(data[32..32 + SIGNATURE_LENGTH].try_into().unwrap());
    let message = &data[32 + SIGNATURE_LENGTH..];

    // arbitrary points and signatures must be rejected, never panic
    let _ = verify(&public, message, &signature);

    if message.len() >= 32 {
        let bundle = PreKeyBundle {
            registration_id: 0,
            device_id: 0,
            identity_key: public,
            signed_prekey: PublicKey::from_bytes(message[..32].try_into().unwrap()),
            signed_prekey_id: 0,
            signed_prekey_signature: signature,
            one_time_prekey: None,
        };
        let _ = bundle.verify_signature();
    }
});
