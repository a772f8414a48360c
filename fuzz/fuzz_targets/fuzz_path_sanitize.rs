// Copyright (c) 2026 Dignode
// Licensed under the Apache-2.0 License.

#![no_main]
#![forbid(unsafe_code)]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(clean) = dignode::core::types::sanitize_resource_path(s) {
            assert!(!clean.contains(".."));
            assert!(!clean.starts_with('/'));
            assert!(!clean.contains('\\'));
        }
    }
});
