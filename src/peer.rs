use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Method, Request, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;

use crate::codec::CacheKey;
use crate::constants::{PEER_PATH_PREFIX, PROTOCOL_CACHE_STATUS_KEY, PROTOCOL_REQUEST_ID_KEY};
use crate::error::{Error, Result};
use crate::logging;
use crate::ring::Peer;
use crate::BoxFuture;

pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(5);

/// What the owning peer answered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerFetch {
    pub value: Bytes,
    /// The owner served it from memory rather than loading it.
    pub hit: bool,
}

pub trait PeerClient: Send + Sync {
    fn fetch(&self, peer: &Peer, group: &str, key: &CacheKey) -> BoxFuture<Result<PeerFetch>>;
}

#[derive(Clone)]
pub struct HttpPeerClient {
    timeout: Duration,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl HttpPeerClient {
    pub fn new(timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        Self {
            timeout,
            client: Client::builder(TokioExecutor::new()).build(connector),
        }
    }

    async fn round_trip(&self, peer: Peer, group: String, key: CacheKey) -> Result<PeerFetch> {
        let unavailable = |reason: String| Error::PeerUnavailable {
            peer: peer.to_string(),
            reason,
        };
        let request = build_request(&peer, &group, key).map_err(|err| unavailable(err.to_string()))?;

        let exchange = async {
            let resp = self
                .client
                .request(request)
                .await
                .map_err(|err| unavailable(err.to_string()))?;
            let status = resp.status();
            match status {
                StatusCode::OK => {}
                StatusCode::NOT_FOUND => {
                    return Err(Error::PeerNotFound {
                        peer: peer.to_string(),
                        group: group.clone(),
                    })
                }
                other => return Err(unavailable(format!("status {other}"))),
            }
            let hit = resp
                .headers()
                .get(PROTOCOL_CACHE_STATUS_KEY)
                .map(|v| v.as_bytes().eq_ignore_ascii_case(b"HIT"))
                .unwrap_or(false);
            let value = resp
                .into_body()
                .collect()
                .await
                .map_err(|err| unavailable(format!("read body: {err}")))?
                .to_bytes();
            Ok(PeerFetch { value, hit })
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| unavailable(format!("timed out after {:?}", self.timeout)))?
    }
}

impl PeerClient for HttpPeerClient {
    fn fetch(&self, peer: &Peer, group: &str, key: &CacheKey) -> BoxFuture<Result<PeerFetch>> {
        let this = self.clone();
        let (peer, group, key) = (peer.clone(), group.to_string(), key.clone());
        Box::pin(async move { this.round_trip(peer, group, key).await })
    }
}

pub fn peer_uri(peer: &Peer, group: &str) -> std::result::Result<Uri, http::uri::InvalidUri> {
    format!("http://{}{}{}", peer.address(), PEER_PATH_PREFIX, group).parse()
}

fn build_request(peer: &Peer, group: &str, key: CacheKey) -> std::result::Result<Request<Full<Bytes>>, http::Error> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(peer_uri(peer, group)?)
        .header(CONTENT_TYPE, "application/octet-stream");
    if let Some(id) = logging::current_trace_id() {
        if let Ok(val) = HeaderValue::from_str(&id) {
            builder = builder.header(PROTOCOL_REQUEST_ID_KEY, val);
        }
    }
    builder.body(Full::new(key.into_bytes()))
}
