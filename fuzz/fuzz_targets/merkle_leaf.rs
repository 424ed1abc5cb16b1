#![no_main]
use libfuzzer_sys::fuzz_target;
use sigchain::ids::Uid;
use sigchain::merkle::path::parse_user_leaf;

fuzz_target!(|data: &[u8]| {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) {
        let _ = parse_user_leaf(Uid::from_username("fuzz"), &value);
    }
});
