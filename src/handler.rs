use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Body;

use crate::codec::{response, strip_hop_headers, CacheKey, CachedResponse, KeyCodec, ProxyRequest};
use crate::constants::{PEER_PATH_PREFIX, PROTOCOL_CACHE_STATUS_KEY};
use crate::error::Error;
use crate::group::{CacheGroup, CacheStatus};
use crate::metrics;
use crate::stream::{channel_body, FlushPolicy, FlushTarget, StreamWriter};
use crate::{empty_body, full_body, ProxyBody};

const COPY_CHUNK_SIZE: usize = 32 * 1024;
const BODY_CHANNEL_CAPACITY: usize = 8;
// Keys carry the request head on top of the body.
const KEY_OVERHEAD_BYTES: usize = 64 * 1024;

pub struct ProxyState {
    pub group: CacheGroup,
    pub codec: KeyCodec,
    pub flush_interval: Duration,
    pub max_body_bytes: usize,
}

/// Proxies one client request through the cache group.
pub async fn serve<B>(req: Request<B>, state: &ProxyState) -> Response<ProxyBody>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (parts, body) = req.into_parts();
    let body = match read_body(body, state.max_body_bytes).await {
        Ok(body) => body,
        Err(resp) => return resp,
    };
    let head_only = parts.method == Method::HEAD;
    let key = state.codec.encode(&ProxyRequest::from_parts(&parts, body));

    let found = match state.group.lookup(&key).await {
        Ok(found) => found,
        Err(err) => return error_response(&err),
    };
    let cached = match response::decode(&found.value) {
        Ok(cached) => cached,
        Err(err) => return error_response(&err),
    };
    metrics::record_cache_status(found.status.as_str());
    log::debug!("{} -> {} {}", key, cached.status, found.status);
    stream_response(cached, found.status, head_only, state.flush_interval)
}

/// `POST /_cache/{group}`: resolves a key this process owns for a peer.
pub async fn serve_peer<B>(req: Request<B>, state: &ProxyState) -> Response<ProxyBody>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    if req.method() != Method::POST {
        return text_response(StatusCode::METHOD_NOT_ALLOWED, "peer requests must be POST");
    }
    let group = req.uri().path().strip_prefix(PEER_PATH_PREFIX).unwrap_or("");
    if group != state.group.name() {
        return text_response(StatusCode::NOT_FOUND, &format!("no such group: {group}"));
    }
    let key = match read_body(req.into_body(), state.max_body_bytes + KEY_OVERHEAD_BYTES).await {
        Ok(body) => CacheKey::from_bytes(body),
        Err(resp) => return resp,
    };

    match state.group.get_owned(&key).await {
        Ok(found) => {
            let mut headers = HeaderMap::new();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
            let marker = if found.status == CacheStatus::Hit { "HIT" } else { "MISS" };
            headers.insert(PROTOCOL_CACHE_STATUS_KEY, HeaderValue::from_static(marker));
            response_with_headers(StatusCode::OK, headers, full_body(found.value))
        }
        Err(err @ Error::KeyDecode(_)) => text_response(StatusCode::BAD_REQUEST, &err.to_string()),
        Err(err) => error_response(&err),
    }
}

async fn read_body<B>(body: B, limit: usize) -> Result<Bytes, Response<ProxyBody>>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(err) if err.downcast_ref::<LengthLimitError>().is_some() => Err(text_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            &format!("request body exceeds {limit} bytes"),
        )),
        Err(err) => Err(text_response(StatusCode::BAD_REQUEST, &format!("read request body: {err}"))),
    }
}

fn stream_response(
    cached: CachedResponse,
    status: CacheStatus,
    head_only: bool,
    flush_interval: Duration,
) -> Response<ProxyBody> {
    let mut headers = strip_hop_headers(&cached.headers);
    headers.insert(PROTOCOL_CACHE_STATUS_KEY, HeaderValue::from_static(status.as_str()));
    if head_only || cached.body.is_empty() {
        return response_with_headers(cached.status, headers, empty_body());
    }

    let policy = FlushPolicy::for_response(&cached.headers, flush_interval);
    let (target, body) = channel_body(BODY_CHANNEL_CAPACITY);
    let payload = cached.body;
    tokio::spawn(async move {
        let writer = StreamWriter::new(target, policy);
        if let Err(err) = copy_chunks(&writer, payload).await {
            log::debug!("response stream ended early: {err}");
            return;
        }
        if let Err(err) = writer.finish().await {
            log::debug!("response stream ended early: {err}");
        }
    });
    response_with_headers(cached.status, headers, body)
}

async fn copy_chunks<T: FlushTarget>(writer: &StreamWriter<T>, payload: Bytes) -> crate::Result<()> {
    let mut offset = 0;
    while offset < payload.len() {
        let end = (offset + COPY_CHUNK_SIZE).min(payload.len());
        writer.write(payload.slice(offset..end)).await?;
        offset = end;
    }
    Ok(())
}

pub fn error_response(err: &Error) -> Response<ProxyBody> {
    let status = match err {
        Error::OriginUnavailable(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    log::warn!("request failed with {}: {}", status.as_u16(), err);
    text_response(status, &format!("proxy error: {err}"))
}

pub fn response_with_headers(status: StatusCode, headers: HeaderMap, body: ProxyBody) -> Response<ProxyBody> {
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    *resp.headers_mut() = headers;
    resp
}

pub fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response_with_headers(status, headers, full_body(body.to_string()))
}

pub fn json_response<T: serde::Serialize>(payload: &T) -> Response<ProxyBody> {
    match serde_json::to_vec(payload) {
        Ok(bytes) => {
            let mut headers = HeaderMap::new();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json; charset=utf-8"));
            response_with_headers(StatusCode::OK, headers, full_body(bytes))
        }
        Err(err) => text_response(StatusCode::INTERNAL_SERVER_ERROR, &format!("encode json: {err}")),
    }
}
