// Delta application must never panic on arbitrary instruction streams.

#![no_main]

use libfuzzer_sys::fuzz_target;
use oxipack::bucket::{Bucket, READ_ALL, SimpleBucket};
use oxipack::git::DeltaBucket;

fuzz_target!(|data: &[u8]| {
    let (base, script) = data.split_at(data.len() / 2);
    let mut delta = DeltaBucket::new(
        SimpleBucket::copied(script),
        Box::new(SimpleBucket::copied(base)),
    );
    let mut produced = 0usize;
    while produced < 1 << 22 {
        match delta.read(READ_ALL) {
            Ok(chunk) => produced += chunk.len(),
            Err(_) => break,
        }
    }
});
