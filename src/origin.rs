use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderValue, HOST};
use http::{Request, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::codec::{strip_hop_headers, CachedResponse, ProxyRequest};
use crate::error::{Error, Result};
use crate::BoxFuture;

pub const DEFAULT_ORIGIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Whatever the origin answered, hop-by-hop headers already dropped.
pub type OriginResponse = CachedResponse;

/// Replays a decoded request against the backend.
///
/// Any status the backend answers with is a response; only transport
/// failures and timeouts are errors.
pub trait Origin: Send + Sync {
    fn fetch(&self, req: ProxyRequest) -> BoxFuture<Result<OriginResponse>>;
}

#[derive(Clone, Debug)]
pub struct OriginOptions {
    pub host: String,
    pub timeout: Duration,
    pub max_idle_conns_per_host: usize,
    pub max_connections: usize,
}

impl OriginOptions {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            timeout: DEFAULT_ORIGIN_TIMEOUT,
            max_idle_conns_per_host: 0,
            max_connections: 0,
        }
    }
}

#[derive(Clone)]
pub struct HttpOrigin {
    host: String,
    timeout: Duration,
    client: Client<HttpConnector, Full<Bytes>>,
    conn_limit: Option<Arc<Semaphore>>,
}

impl HttpOrigin {
    pub fn new(opts: &OriginOptions) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        let mut builder = Client::builder(TokioExecutor::new());
        if opts.max_idle_conns_per_host > 0 {
            builder.pool_max_idle_per_host(opts.max_idle_conns_per_host);
        }
        let conn_limit = if opts.max_connections > 0 {
            Some(Arc::new(Semaphore::new(opts.max_connections)))
        } else {
            None
        };
        Self {
            host: normalize_host(&opts.host),
            timeout: opts.timeout,
            client: builder.build(connector),
            conn_limit,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn build_request(&self, req: ProxyRequest) -> Result<Request<Full<Bytes>>> {
        let uri: Uri = format!("http://{}{}", self.host, req.target)
            .parse()
            .map_err(|err| Error::InvalidRequest(format!("target {:?}: {err}", req.target)))?;
        let host = HeaderValue::from_str(&self.host)
            .map_err(|err| Error::InvalidRequest(format!("origin host {:?}: {err}", self.host)))?;

        let mut builder = Request::builder().method(req.method).uri(uri);
        for (k, v) in strip_hop_headers(&req.headers).iter() {
            if k == HOST {
                continue;
            }
            builder = builder.header(k, v);
        }
        builder
            .header(HOST, host)
            .body(Full::new(req.body))
            .map_err(|err| Error::InvalidRequest(err.to_string()))
    }

    async fn round_trip(&self, req: ProxyRequest) -> Result<OriginResponse> {
        let request = self.build_request(req)?;
        let method = request.method().clone();
        let uri = request.uri().clone();

        // Queueing for a connection slot counts against the timeout too.
        let exchange = async {
            let _permit = self.acquire_conn_limit().await;
            let resp = self
                .client
                .request(request)
                .await
                .map_err(|err| Error::OriginUnavailable(format!("{method} {uri}: {err}")))?;
            let (parts, body) = resp.into_parts();
            let body = body
                .collect()
                .await
                .map_err(|err| Error::OriginUnavailable(format!("read body of {uri}: {err}")))?
                .to_bytes();
            Ok::<_, Error>(CachedResponse::new(parts.status, strip_hop_headers(&parts.headers), body))
        };

        let resp = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| Error::OriginUnavailable(format!("{method} {uri}: timed out after {:?}", self.timeout)))??;
        log::debug!("origin {} {} -> {} ({} bytes)", method, uri, resp.status, resp.body.len());
        Ok(resp)
    }

    async fn acquire_conn_limit(&self) -> Option<OwnedSemaphorePermit> {
        let sem = self.conn_limit.as_ref()?.clone();
        sem.acquire_owned().await.ok()
    }
}

impl Origin for HttpOrigin {
    fn fetch(&self, req: ProxyRequest) -> BoxFuture<Result<OriginResponse>> {
        let this = self.clone();
        Box::pin(async move { this.round_trip(req).await })
    }
}

/// `http://backend:8000/` and `backend:8000` name the same origin.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    host.strip_prefix("http://")
        .unwrap_or(host)
        .trim_end_matches('/')
        .to_string()
}
