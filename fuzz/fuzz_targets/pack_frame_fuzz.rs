// Pack frame decoding must never panic on arbitrary input.

#![no_main]

use libfuzzer_sys::fuzz_target;
use oxipack::bucket::{Bucket, READ_ALL, SimpleBucket};
use oxipack::git::{GitOidKind, PackFrameBucket};

fuzz_target!(|data: &[u8]| {
    let mut frame = PackFrameBucket::new(SimpleBucket::copied(data), GitOidKind::Sha1);
    // Decode errors are expected; panics are not. Bound the output so a
    // decodable frame cannot blow up the fuzzer's memory.
    let mut produced = 0usize;
    while produced < 1 << 22 {
        match frame.read(READ_ALL) {
            Ok(chunk) => produced += chunk.len(),
            Err(_) => break,
        }
    }
});
