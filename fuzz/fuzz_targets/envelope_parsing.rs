//! Fuzz target for envelope decoding
//!
//! Arbitrary relay bytes must never panic, and anything that decodes must
//! re-encode to an equal envelope.

#![no_main]

use libfuzzer_sys::fuzz_target;
use secure_session::Envelope;

fuzz_target!(|data: &[u8]| {
    let Ok(envelope) = Envelope::from_bytes(data) else {
        return;
    };

    let _ = envelope.decode();

    if let Ok(bytes) = envelope.to_bytes() {
        let roundtrip = Envelope::from_bytes(&bytes).expect("re-encoded envelope should parse");
        assert_eq!(envelope, roundtrip);
    }

    if let Ok(text) = std::str::from_utf8(data) {
        let _ = Envelope::from_base64(text);
    }
});
