#![no_main]

use libfuzzer_sys::fuzz_target;
use weft_ces::header::ShardHeader;

fuzz_target!(|data: &[u8]| {
    if let Ok(header) = ShardHeader::decode(data) {
        assert_eq!(ShardHeader::decode(&header.encode()).unwrap(), header);
    }
});
