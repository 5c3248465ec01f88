/// inclusive byte range inside a cached payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: usize,
    pub end: usize,
}

impl ByteRange {
    pub fn content_range(&self, total_len: usize) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total_len)
    }
}

/// parse a single `bytes=start-end`, `bytes=start-` or `bytes=-suffix` against a payload of
/// `total_len` bytes. anything we can't satisfy comes back as None and the caller serves the
/// whole thing
pub fn parse_range(header: &str, total_len: usize) -> Option<ByteRange> {
    if total_len == 0 {
        return None;
    }

    let ranges = header.trim().strip_prefix("bytes=")?;
    // multipart ranges aren't worth it for segments
    if ranges.contains(',') {
        return None;
    }

    let (start, end) = ranges.split_once('-')?;
    let last = total_len - 1;

    let range = match (start.trim(), end.trim()) {
        ("", "") => return None,
        ("", suffix) => {
            let suffix: usize = suffix.parse().ok()?;
            if suffix == 0 {
                return None;
            }
            ByteRange {
                start: total_len.saturating_sub(suffix),
                end: last,
            }
        }
        (start, "") => ByteRange {
            start: start.parse().ok()?,
            end: last,
        },
        (start, end) => ByteRange {
            start: start.parse().ok()?,
            end: end.parse::<usize>().ok()?.min(last),
        },
    };

    if range.start > range.end || range.start >= total_len {
        return None;
    }

    Some(range)
}
