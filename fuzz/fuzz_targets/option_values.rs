//! Fuzz target for `key=value` option inference and locale normalization.

#![no_main]

use libfuzzer_sys::fuzz_target;
use rhsm_register::config::normalize_locale;
use rhsm_register::OptionValue;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Some((_, value)) = s.split_once('=') {
            if let OptionValue::Str(kept) = OptionValue::infer(value) {
                assert_eq!(kept, value);
            }
        }
        if let Some(locale) = normalize_locale(s) {
            assert!(!locale.contains('.') && !locale.contains('@'));
        }
    }
});
