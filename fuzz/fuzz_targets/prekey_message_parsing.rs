//! Fuzz target for handshake message parsing

#![no_main]

use libfuzzer_sys::fuzz_target;
use secure_session::envelope::PreKeyMessage;
use secure_session::ratchet::RatchetMessage;

fuzz_target!(|data: &[u8]| {
    if let Ok(message) = PreKeyMessage::from_bytes(data) {
        let roundtrip =
            PreKeyMessage::from_bytes(&message.to_bytes()).expect("roundtrip should succeed");
        assert_eq!(message, roundtrip);
    }

    if let Ok(message) = RatchetMessage::from_bytes(data) {
        assert_eq!(message.to_bytes(), data);
    }
});
