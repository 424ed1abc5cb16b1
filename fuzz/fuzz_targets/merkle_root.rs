#![no_main]
use libfuzzer_sys::fuzz_target;
use sigchain::merkle::MerkleRoot;

fuzz_target!(|data: &[u8]| {
    if let Ok(root) = MerkleRoot::from_json(data) {
        let _ = root.payload_hash();
        let _ = root.signatures().count();
    }
});
