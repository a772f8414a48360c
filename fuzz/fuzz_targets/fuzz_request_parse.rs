// Copyright (c) 2026 Dignode
// Licensed under the Apache-2.0 License.

#![no_main]
#![forbid(unsafe_code)]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // The request envelope parser must never panic on attacker bytes;
    // classification (malformed / unknown type / missing fields) is
    // covered by unit tests.
    let _ = dignode::networking::protocol::parse_request(data);
});
