//! Canonical cache keys.
//!
//! A key is the request rendered as HTTP/1.1 text with a fixed header order,
//! so it doubles as the routing hash input and as everything needed to replay
//! the request against the origin.

use std::collections::HashSet;
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, HOST};
use http::{HeaderMap, Method, Uri};

use crate::codec::{connection_tokens, header_slots, is_hop_header};
use crate::error::{Error, Result};

pub const DEFAULT_IGNORED_HEADERS: &[&str] = &["x-request-id", "x-forwarded-for", "x-real-ip", "via"];

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(Bytes);

impl CacheKey {
    pub fn from_bytes(raw: impl Into<Bytes>) -> Self {
        Self(raw.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First line of the key, for log lines.
    pub fn request_line(&self) -> String {
        let end = self
            .0
            .iter()
            .position(|b| *b == b'\r' || *b == b'\n')
            .unwrap_or(self.0.len());
        String::from_utf8_lossy(&self.0[..end]).into_owned()
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({:?}, {} bytes)", self.request_line(), self.0.len())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.request_line())
    }
}

/// A request as the cache sees it: enough to key it and to replay it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyRequest {
    pub method: Method,
    /// Origin-form target, path plus optional query.
    pub target: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxyRequest {
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn from_parts(parts: &http::request::Parts, body: Bytes) -> Self {
        let mut headers = parts.headers.clone();
        if !headers.contains_key(HOST) {
            if let Some(authority) = parts.uri.authority() {
                if let Ok(val) = HeaderValue::from_str(authority.as_str()) {
                    headers.insert(HOST, val);
                }
            }
        }
        Self {
            method: parts.method.clone(),
            target: origin_form(&parts.uri),
            headers,
            body,
        }
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(val) = HeaderValue::from_str(value) {
            self.headers.append(name, val);
        }
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn host(&self) -> Option<&str> {
        self.headers.get(HOST).and_then(|v| v.to_str().ok())
    }
}

pub fn origin_form(uri: &Uri) -> String {
    let raw = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("");
    if raw.is_empty() {
        "/".to_string()
    } else if raw.starts_with('/') || raw == "*" {
        raw.to_string()
    } else {
        format!("/{raw}")
    }
}

#[derive(Clone, Debug)]
pub struct KeyCodec {
    ignored: HashSet<HeaderName>,
}

impl Default for KeyCodec {
    fn default() -> Self {
        Self::new(DEFAULT_IGNORED_HEADERS)
    }
}

impl KeyCodec {
    pub fn new<I, S>(ignored: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ignored = ignored
            .into_iter()
            .filter_map(|name| HeaderName::from_bytes(name.as_ref().trim().to_ascii_lowercase().as_bytes()).ok())
            .collect();
        Self { ignored }
    }

    pub fn encode(&self, req: &ProxyRequest) -> CacheKey {
        let dropped = connection_tokens(&req.headers);
        let keep = |name: &HeaderName| {
            *name != HOST
                && *name != CONTENT_LENGTH
                && !is_hop_header(name.as_str())
                && !dropped.contains(name)
                && !self.ignored.contains(name)
        };

        let mut out = BytesMut::with_capacity(256 + req.body.len());
        out.put_slice(req.method.as_str().as_bytes());
        out.put_u8(b' ');
        out.put_slice(req.target.as_bytes());
        out.put_slice(b" HTTP/1.1\r\n");

        if !self.ignored.contains(&HOST) {
            if let Some(host) = req.headers.get(HOST) {
                put_header(&mut out, HOST.as_str(), host);
            }
        }

        // HeaderMap::keys yields each name once; values keep arrival order.
        let mut names: Vec<&HeaderName> = req.headers.keys().filter(|name| keep(name)).collect();
        names.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        for name in names {
            for value in req.headers.get_all(name) {
                put_header(&mut out, name.as_str(), value);
            }
        }

        if !req.body.is_empty() {
            out.put_slice(b"content-length: ");
            out.put_slice(req.body.len().to_string().as_bytes());
            out.put_slice(b"\r\n");
        }
        out.put_slice(b"\r\n");
        out.put_slice(&req.body);
        CacheKey(out.freeze())
    }

    pub fn decode(key: &CacheKey) -> Result<ProxyRequest> {
        let raw = key.as_bytes();
        let mut storage = vec![httparse::EMPTY_HEADER; header_slots(raw)];
        let mut parsed = httparse::Request::new(&mut storage);
        let header_len = match parsed.parse(raw) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => {
                return Err(Error::KeyDecode("truncated header block".to_string()))
            }
            Err(err) => return Err(Error::KeyDecode(err.to_string())),
        };

        let method = parsed
            .method
            .ok_or_else(|| Error::KeyDecode("missing method".to_string()))
            .and_then(|m| {
                Method::from_bytes(m.as_bytes()).map_err(|err| Error::KeyDecode(err.to_string()))
            })?;
        let target = parsed
            .path
            .ok_or_else(|| Error::KeyDecode("missing request target".to_string()))?
            .to_string();

        let mut headers = HeaderMap::with_capacity(parsed.headers.len());
        let mut declared = 0usize;
        for h in parsed.headers.iter() {
            let name = HeaderName::from_bytes(h.name.as_bytes())
                .map_err(|err| Error::KeyDecode(format!("header name {:?}: {err}", h.name)))?;
            if name == CONTENT_LENGTH {
                declared = std::str::from_utf8(h.value)
                    .ok()
                    .and_then(|v| v.trim().parse().ok())
                    .ok_or_else(|| Error::KeyDecode("invalid content-length".to_string()))?;
                continue;
            }
            let value = HeaderValue::from_bytes(h.value)
                .map_err(|err| Error::KeyDecode(format!("header {name}: {err}")))?;
            headers.append(name, value);
        }

        let body = key.0.slice(header_len..);
        if body.len() != declared {
            return Err(Error::KeyDecode(format!(
                "body is {} bytes, content-length says {declared}",
                body.len()
            )));
        }

        Ok(ProxyRequest {
            method,
            target,
            headers,
            body,
        })
    }
}

fn put_header(out: &mut BytesMut, name: &str, value: &HeaderValue) {
    out.put_slice(name.as_bytes());
    out.put_slice(b": ");
    out.put_slice(value.as_bytes());
    out.put_slice(b"\r\n");
}
