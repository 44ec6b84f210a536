#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tokio::sync::watch;

use hoard::config::Bootstrap;

pub const TEST_HOST: &str = "example.com";

#[derive(Clone, Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn cache_status(&self) -> Option<&str> {
        self.header(hoard::constants::PROTOCOL_CACHE_STATUS_KEY)
    }
}

/// Raw HTTP/1.1 client: one connection per request, origin-form targets.
#[derive(Clone)]
pub struct TestClient {
    addr: SocketAddr,
}

impl TestClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    pub async fn get(&self, path: &str) -> TestResponse {
        self.send(Method::GET, path, HeaderMap::new(), Bytes::new()).await
    }

    pub async fn send(&self, method: Method, path: &str, headers: HeaderMap, body: Bytes) -> TestResponse {
        let stream = tokio::net::TcpStream::connect(self.addr).await.expect("connect proxy");
        let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await.expect("handshake");
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut builder = Request::builder().method(method).uri(path);
        if !headers.contains_key(http::header::HOST) {
            builder = builder.header(http::header::HOST, TEST_HOST);
        }
        for (k, v) in headers.iter() {
            builder = builder.header(k, v);
        }
        let req = builder.body(Full::new(body)).expect("request");

        let resp = sender.send_request(req).await.expect("send request");
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.into_body().collect().await.expect("body").to_bytes();
        TestResponse { status, headers, body }
    }
}

pub struct MockServer {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MockServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown, mut rx) = tokio::sync::oneshot::channel();
        let handler = Arc::new(handler);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    res = listener.accept() => {
                        let (stream, _) = match res { Ok(v) => v, Err(_) => break };
                        let io = TokioIo::new(stream);
                        let handler = Arc::clone(&handler);
                        let counter = Arc::clone(&counter);
                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                counter.fetch_add(1, Ordering::SeqCst);
                                let resp = handler(req);
                                async move { Ok::<_, hyper::Error>(resp) }
                            });
                            let builder = ConnBuilder::new(TokioExecutor::new());
                            let _ = builder.serve_connection(io, service).await;
                        });
                    }
                }
            }
        });

        Self {
            addr,
            hits,
            shutdown: Some(shutdown),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Requests the origin has answered so far.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// A running proxy bound to an ephemeral port.
pub struct Proxy {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
}

impl Proxy {
    pub async fn start(origin: SocketAddr) -> Self {
        Self::start_with(origin, |_| {}).await
    }

    pub async fn start_with<F>(origin: SocketAddr, edit: F) -> Self
    where
        F: FnOnce(&mut Bootstrap),
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind proxy");
        let mut cfg = test_config(origin);
        edit(&mut cfg);
        Self::serve(listener, cfg)
    }

    /// Starts `n` proxies configured as one peer group over `origin`.
    pub async fn cluster(origin: SocketAddr, n: usize) -> Vec<Self> {
        let mut listeners = Vec::with_capacity(n);
        for _ in 0..n {
            listeners.push(TcpListener::bind("127.0.0.1:0").await.expect("bind proxy"));
        }
        let addresses: Vec<String> = listeners
            .iter()
            .map(|l| l.local_addr().expect("local addr").to_string())
            .collect();
        listeners
            .into_iter()
            .zip(addresses.iter())
            .map(|(listener, self_addr)| {
                let mut cfg = test_config(origin);
                cfg.peers.self_addr = self_addr.clone();
                cfg.peers.addresses = addresses.clone();
                Self::serve(listener, cfg)
            })
            .collect()
    }

    fn serve(listener: TcpListener, mut cfg: Bootstrap) -> Self {
        let addr = listener.local_addr().expect("local addr");
        cfg.server.addr = addr.to_string();
        cfg.validate().expect("valid test config");
        let (shutdown, rx) = watch::channel(false);
        tokio::spawn(async move {
            if let Err(err) = hoard::server::serve(listener, Arc::new(cfg), rx).await {
                eprintln!("proxy stopped: {err:#}");
            }
        });
        Self { addr, shutdown }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn client(&self) -> TestClient {
        TestClient::new(self.addr)
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

pub fn test_config(origin: SocketAddr) -> Bootstrap {
    let mut cfg = Bootstrap::default();
    cfg.origin.host = origin.to_string();
    cfg.origin.timeout = Duration::from_secs(5);
    cfg.peers.timeout = Duration::from_secs(2);
    cfg.server.flush_interval = Duration::from_millis(20);
    cfg
}

/// An address nothing listens on.
pub async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    addr
}

pub fn text(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let body = body.into();
    Response::builder()
        .status(status)
        .header("content-type", content_type)
        .header("content-length", body.len().to_string())
        .body(Full::new(body))
        .expect("response")
}

/// Origin answering `path:{path}` for every request.
pub fn echo_path() -> impl Fn(Request<Incoming>) -> Response<Full<Bytes>> + Send + Sync + 'static {
    |req: Request<Incoming>| text(StatusCode::OK, "text/plain", format!("path:{}", req.uri().path()))
}
