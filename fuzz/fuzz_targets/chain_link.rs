#![no_main]
use libfuzzer_sys::fuzz_target;
use sigchain::chain::{ChainLink, ServerLink};

fuzz_target!(|data: &[u8]| {
    if let Ok(server) = serde_json::from_slice::<ServerLink>(data) {
        if let Ok(mut link) = ChainLink::import(server) {
            let _ = link.verify_link();
        }
    }
});
