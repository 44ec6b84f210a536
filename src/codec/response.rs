//! Response blobs: status line, end-to-end headers, blank line, body.
//!
//! The body is whatever follows the header block; `Content-Length` is kept
//! only as the origin sent it so HEAD and 304 responses survive unchanged.

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, StatusCode};

use crate::codec::{header_slots, strip_hop_headers};
use crate::error::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl CachedResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self { status, headers, body }
    }

    /// Declared length, or `None` when the origin streamed without one.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }
}

pub fn encode(resp: &CachedResponse) -> Bytes {
    let headers = strip_hop_headers(&resp.headers);
    let mut out = BytesMut::with_capacity(128 + resp.body.len());
    out.put_slice(b"HTTP/1.1 ");
    out.put_slice(resp.status.as_str().as_bytes());
    out.put_u8(b' ');
    out.put_slice(resp.status.canonical_reason().unwrap_or("Unknown").as_bytes());
    out.put_slice(b"\r\n");
    for (name, value) in headers.iter() {
        out.put_slice(name.as_str().as_bytes());
        out.put_slice(b": ");
        out.put_slice(value.as_bytes());
        out.put_slice(b"\r\n");
    }
    out.put_slice(b"\r\n");
    out.put_slice(&resp.body);
    out.freeze()
}

pub fn decode(blob: &Bytes) -> Result<CachedResponse> {
    let mut storage = vec![httparse::EMPTY_HEADER; header_slots(blob)];
    let mut parsed = httparse::Response::new(&mut storage);
    let header_len = match parsed.parse(blob) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => {
            return Err(Error::ResponseDecode("truncated header block".to_string()))
        }
        Err(err) => return Err(Error::ResponseDecode(err.to_string())),
    };
    let code = parsed
        .code
        .ok_or_else(|| Error::ResponseDecode("missing status".to_string()))?;
    let status = StatusCode::from_u16(code).map_err(|err| Error::ResponseDecode(err.to_string()))?;

    let mut headers = HeaderMap::with_capacity(parsed.headers.len());
    for h in parsed.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|err| Error::ResponseDecode(format!("header name {:?}: {err}", h.name)))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|err| Error::ResponseDecode(format!("header {name}: {err}")))?;
        headers.append(name, value);
    }

    Ok(CachedResponse {
        status,
        headers,
        body: blob.slice(header_len..),
    })
}
