mod stream_request_extractor;

pub use stream_request_extractor::*;
