//! Diameter Message Fuzzer
//!
//! Feeds arbitrary bytes through the message decoder, the typed AVP
//! accessors and the hello dictionary's validation. None of them may panic.
//!
//! Run with: cargo +nightly fuzz run fuzz_diameter_message

#![no_main]

use std::sync::OnceLock;

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use ogs_diameter_peer::{DiameterMessage, Dictionary, HELLO_DICTIONARY};

fn dictionary() -> Option<&'static Dictionary> {
    static DICTIONARY: OnceLock<Option<Dictionary>> = OnceLock::new();
    DICTIONARY
        .get_or_init(|| Dictionary::from_yaml_str(HELLO_DICTIONARY).ok())
        .as_ref()
}

fuzz_target!(|data: &[u8]| {
    let mut buf = Bytes::copy_from_slice(data);
    if let Ok(msg) = DiameterMessage::decode(&mut buf) {
        if let Some(dict) = dictionary() {
            let _ = dict.validate(&msg);
        }
        let _ = msg.session_id();
        let _ = msg.result_code();
        for avp in &msg.avps {
            let _ = avp.grouped();
            let _ = avp.as_address();
            let _ = avp.as_u64();
            let _ = avp.as_octet_string();
        }
        // Re-encoding a decoded message must decode again
        let mut encoded = msg.encode().freeze();
        assert!(DiameterMessage::decode(&mut encoded).is_ok());
    }
});
