use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

// <stream id>_<sequence>.ts, what the origin names the segments of a live channel
static LIVE_SEGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/(\d+)_\d+\.ts$").expect("Static regex should compile"));

/// the Referer a real player would send. for a live segment that's the channel manifest it came
/// from, `<origin>/live/<user>/<pass>/<stream id>.m3u8`, built from the path segments in front
/// of the file name (or the configured fallback credentials when the path doesn't have them).
/// anything else gets `<origin>/`
pub fn synthesize_referer(
    target: &Url,
    fallback_username: Option<&str>,
    fallback_password: Option<&str>,
) -> String {
    let origin = target.origin().ascii_serialization();

    let Some(stream_id) = LIVE_SEGMENT
        .captures(target.path())
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
    else {
        return format!("{}/", origin);
    };

    let segments: Vec<&str> = target
        .path_segments()
        .map(|s| s.collect())
        .unwrap_or_default();

    let credentials = match segments.len() {
        n if n >= 3 => Some((segments[n - 3], segments[n - 2])),
        _ => fallback_username.zip(fallback_password),
    };

    match credentials {
        Some((user, pass)) => live_manifest_url(&origin, user, pass, stream_id),
        None => format!("{}/", origin),
    }
}

/// `{base}/live/{username}/{password}/{stream id}.m3u8`, the xtream convention for a live channel
pub fn live_manifest_url(base: &str, username: &str, password: &str, stream_id: &str) -> String {
    format!(
        "{}/live/{}/{}/{}.m3u8",
        base.trim_end_matches('/'),
        username,
        password,
        stream_id
    )
}
