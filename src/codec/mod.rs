pub mod key;
pub mod response;

use std::collections::HashSet;

use http::header::{HeaderName, CONNECTION};
use http::HeaderMap;

pub use key::{CacheKey, KeyCodec, ProxyRequest};
pub use response::CachedResponse;

/// Header slots needed to parse `raw`: one per line of its head.
///
/// Encoders emit any number of headers, so decoders size the parse buffer
/// from the blob instead of a fixed limit.
pub(crate) fn header_slots(raw: &[u8]) -> usize {
    let head_end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 2)
        .unwrap_or(raw.len());
    raw[..head_end].iter().filter(|&&b| b == b'\n').count()
}

pub fn is_hop_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Header names listed in `Connection`, which are hop-by-hop for this message only.
pub fn connection_tokens(headers: &HeaderMap) -> HashSet<HeaderName> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect()
}

pub fn strip_hop_headers(headers: &HeaderMap) -> HeaderMap {
    let dropped = connection_tokens(headers);
    let mut out = HeaderMap::with_capacity(headers.len());
    for (k, v) in headers.iter() {
        if is_hop_header(k.as_str()) || dropped.contains(k) {
            continue;
        }
        out.append(k, v.clone());
    }
    out
}
