#![no_main]

use flowstat::{NoPolicies, StatConfig};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        let _ = StatConfig::parse_str(text, "fuzz.cfg", &mut NoPolicies);
    }
});
