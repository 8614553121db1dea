#![no_main]
use libfuzzer_sys::fuzz_target;
use ktrust::entry::objecthash::hash_json;

fuzz_target!(|data: &[u8]| {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) {
        let _ = hash_json(&value);
    }
});
