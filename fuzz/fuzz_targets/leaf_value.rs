#![no_main]
use libfuzzer_sys::fuzz_target;
use ktrust::Entry;

fuzz_target!(|data: &[u8]| {
    if let Ok(Some(entry)) = Entry::from_leaf_value(Some(data)) {
        let _ = entry.canonical_hash();
        let _ = entry.signing_digest();
    }
});
