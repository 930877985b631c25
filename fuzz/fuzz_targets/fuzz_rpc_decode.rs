#![no_main]

use libfuzzer_sys::fuzz_target;
use weft_p2p::rpc::RpcRequest;

fuzz_target!(|data: &[u8]| {
    // Decode must never panic; a successful decode must re-encode to the
    // same frame.
    if let Ok(request) = RpcRequest::decode(data) {
        let encoded = request.encode().expect("decoded frame re-encodes");
        assert_eq!(encoded, data);
    }
});
