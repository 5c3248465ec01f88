pub mod caching_stream;
pub mod m3u8_utils;
pub mod range_utils;
pub mod referer_utils;
