// Copyright (c) 2026 Dignode
// Licensed under the Apache-2.0 License.

#![no_main]
#![forbid(unsafe_code)]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(urn) = dignode::core::types::DigUrn::parse(s) {
            // A parsed URN must re-parse to itself.
            let again = dignode::core::types::DigUrn::parse(&urn.format())
                .expect("formatted URN must parse");
            assert_eq!(urn, again);
        }
    }
});
