use thiserror::Error;
use tracing::error;
use url::Url;

pub const M3U8_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RewriteError {
    /// the origin swaps in an "offline" placeholder when a channel isn't broadcasting
    #[error("stream offline")]
    Offline,
}

/// one line of a playlist. tags and blanks are kept as they are, uris get proxied
#[derive(Debug, PartialEq, Eq)]
pub enum ManifestLine<'a> {
    Directive(&'a str),
    Uri(&'a str),
}

impl<'a> ManifestLine<'a> {
    pub fn parse(line: &'a str) -> Self {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            Self::Directive(line)
        } else {
            Self::Uri(line.trim_start())
        }
    }
}

/// `<proxy base>?url=<absolute url>`, everything but unreserved characters gets escaped so
/// query strings inside the upstream url survive the trip
pub fn proxied_url(proxy_base: &str, absolute_url: &str) -> String {
    format!("{}?url={}", proxy_base, urlencoding::encode(absolute_url))
}

pub fn mentions_offline(value: &str) -> bool {
    value.to_ascii_lowercase().contains("offline")
}

pub fn is_manifest(target: &Url, content_type: &str) -> bool {
    let content_type = content_type.to_ascii_lowercase();
    content_type.contains("mpegurl")
        || content_type.contains("m3u8")
        || target.path().ends_with(".m3u8")
}

/// absolute form of a playlist uri. full urls stay, `/x` hangs off the origin, everything else
/// is relative to the playlist's directory
pub fn resolve_uri(target: &Url, uri: &str) -> Option<String> {
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return Some(uri.to_string());
    }

    if uri.starts_with("//") {
        return Some(format!("{}:{}", target.scheme(), uri));
    }

    if uri.starts_with('/') {
        return Some(format!("{}{}", target.origin().ascii_serialization(), uri));
    }

    match target.join(uri) {
        Ok(resolved) => Some(resolved.to_string()),
        Err(e) => {
            error!("Failed to resolve: {} - {}", uri, e);
            None
        }
    }
}

/// rewrite every uri in `text` to go through the proxy. same input, same output, tags untouched
/// and in order
pub fn rewrite_manifest(text: &str, target: &Url, proxy_base: &str) -> Result<String, RewriteError> {
    if mentions_offline(target.as_str()) {
        return Err(RewriteError::Offline);
    }

    let mut lines: Vec<String> = Vec::new();

    for raw in text.lines() {
        match ManifestLine::parse(raw) {
            ManifestLine::Directive(line) => lines.push(line.to_string()),
            ManifestLine::Uri(uri) => {
                if mentions_offline(uri) {
                    return Err(RewriteError::Offline);
                }

                match resolve_uri(target, uri) {
                    Some(resolved) => {
                        if mentions_offline(&resolved) {
                            return Err(RewriteError::Offline);
                        }
                        lines.push(proxied_url(proxy_base, &resolved));
                    }
                    None => lines.push(uri.to_string()),
                }
            }
        }
    }

    let mut rewritten = lines.join("\n");
    if text.ends_with('\n') {
        rewritten.push('\n');
    }

    Ok(rewritten)
}
