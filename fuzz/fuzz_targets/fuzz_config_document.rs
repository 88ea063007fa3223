//! Fuzz target for configuration document parsing.

#![no_main]

use caravel::vbucket::VbucketConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(config) = VbucketConfig::from_json(data) {
        // Any accepted document must support resolution.
        let _ = config.resolve(b"probe", None);
        let _ = config.resolve(b"probe", Some(b"hashkey"));
    }
});
