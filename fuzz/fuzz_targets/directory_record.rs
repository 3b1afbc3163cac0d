//! Fuzz target for directory documents
//!
//! Records come from an untrusted server; conversion must fail cleanly and
//! any accepted bundle must carry a valid signature.

#![no_main]

use libfuzzer_sys::fuzz_target;
use secure_session::{DirectoryRecord, PublishedBundle};

fuzz_target!(|data: &[u8]| {
    let Ok(record) = serde_json::from_slice::<DirectoryRecord>(data) else {
        return;
    };

    if let Ok(mut published) = PublishedBundle::try_from(&record) {
        let bundle = published.take_bundle();
        assert!(bundle.verify_signature().is_ok());
    }
});
