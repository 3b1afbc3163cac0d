//! Fuzz target for message header parsing

#![no_main]

use libfuzzer_sys::fuzz_target;
use secure_session::ratchet::Header;

fuzz_target!(|data: &[u8]| {
    if let Ok(header) = Header::from_bytes(data) {
        let serialized = header.to_bytes();
        let roundtrip = Header::from_bytes(&serialized).expect("roundtrip should succeed");

        assert_eq!(header.counter, roundtrip.counter);
        assert_eq!(header.previous_chain_length, roundtrip.previous_chain_length);
        assert_eq!(header.ratchet_key, roundtrip.ratchet_key);
    }
});
