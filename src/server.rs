use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use http::header::CONTENT_LENGTH;
use http::{Method, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::access_log::{AccessLogger, AccessRecord};
use crate::codec::KeyCodec;
use crate::config::Bootstrap;
use crate::constants::{PEER_PATH_PREFIX, PROTOCOL_CACHE_STATUS_KEY, PROTOCOL_REQUEST_ID_KEY, STATUS_PATH_PREFIX};
use crate::group::CacheGroup;
use crate::handler::{self, json_response, text_response, ProxyState};
use crate::logging;
use crate::metrics;
use crate::origin::HttpOrigin;
use crate::peer::HttpPeerClient;
use crate::runtime::{self, StatusReport};
use crate::ProxyBody;

pub async fn run(cfg: Arc<Bootstrap>) -> Result<()> {
    let listener = bind(&cfg.server.addr).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handlers(shutdown_tx);
    serve(listener, cfg, shutdown_rx).await
}

/// Serves on an already bound listener until `shutdown` flips to true.
pub async fn serve(listener: TcpListener, cfg: Arc<Bootstrap>, shutdown: watch::Receiver<bool>) -> Result<()> {
    let state = Arc::new(AppState::new(cfg)?);
    log::info!(
        "listening on {} for group {:?}, origin {}",
        listener.local_addr().context("listener address")?,
        state.proxy.group.name(),
        state.cfg.origin.host
    );
    run_tcp(listener, shutdown, state).await
}

struct AppState {
    cfg: Arc<Bootstrap>,
    proxy: ProxyState,
    access_logger: Option<AccessLogger>,
}

impl AppState {
    fn new(cfg: Arc<Bootstrap>) -> Result<Self> {
        let origin = Arc::new(HttpOrigin::new(&cfg.origin_options()));
        let peer_client = Arc::new(HttpPeerClient::new(cfg.peers.timeout));
        let group = CacheGroup::new(cfg.group_options(), cfg.peer_set(), origin, peer_client);
        let proxy = ProxyState {
            group,
            codec: KeyCodec::new(&cfg.cache.ignore_headers),
            flush_interval: cfg.server.flush_interval,
            max_body_bytes: cfg.server.max_body_bytes,
        };
        let access_logger = match cfg.server.access_log.as_ref().filter(|a| a.enabled) {
            Some(access) => Some(AccessLogger::new(&access.path).context("init access log")?),
            None => None,
        };
        Ok(Self {
            cfg,
            proxy,
            access_logger,
        })
    }
}

pub async fn bind(addr: &str) -> Result<TcpListener> {
    let bind_addr = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    let socket_addr: SocketAddr = bind_addr.parse().with_context(|| format!("parse server.addr {addr:?}"))?;
    TcpListener::bind(socket_addr)
        .await
        .with_context(|| format!("bind {socket_addr}"))
}

fn spawn_signal_handlers(shutdown: watch::Sender<bool>) {
    tokio::spawn(async move {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();
        tokio::select! {
            _ = async {
                match sigterm.as_mut() {
                    Some(sig) => { let _ = sig.recv().await; }
                    None => std::future::pending::<()>().await,
                }
            } => log::info!("received SIGTERM, shutting down"),
            _ = async {
                match sigint.as_mut() {
                    Some(sig) => { let _ = sig.recv().await; }
                    None => std::future::pending::<()>().await,
                }
            } => log::info!("received SIGINT, shutting down"),
        }
        let _ = shutdown.send(true);
    });
}

async fn run_tcp(listener: TcpListener, mut shutdown: watch::Receiver<bool>, state: Arc<AppState>) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            res = listener.accept() => {
                let (stream, remote) = match res {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        log::warn!("accept failed: {err}");
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let state = Arc::clone(&state);

                tokio::spawn(async move {
                    let service = service_fn(move |req| handle(req, Arc::clone(&state), remote));
                    let builder = ConnBuilder::new(TokioExecutor::new());
                    if let Err(err) = builder.serve_connection(io, service).await {
                        log::debug!("connection from {remote} closed: {err}");
                    }
                });
            }
        }
    }
    log::info!("listener closed");
    Ok(())
}

async fn handle(
    req: Request<Incoming>,
    state: Arc<AppState>,
    remote: SocketAddr,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let started = Instant::now();
    let request_id = metrics::request_id_from_headers(req.headers());
    let method = req.method().clone();
    let target = req.uri().to_string();

    let mut resp = logging::with_trace_id(request_id.clone(), route(req, &state)).await;

    if let Ok(val) = request_id.parse() {
        resp.headers_mut().insert(PROTOCOL_REQUEST_ID_KEY, val);
    }
    metrics::record(resp.status());
    if let Some(logger) = &state.access_logger {
        let client = remote.to_string();
        let bytes = response_bytes(&resp);
        logger.log(&AccessRecord {
            client: &client,
            method: method.as_str(),
            target: &target,
            status: resp.status().as_u16(),
            bytes,
            duration_ms: started.elapsed().as_millis(),
            cache_status: resp
                .headers()
                .get(PROTOCOL_CACHE_STATUS_KEY)
                .and_then(|v| v.to_str().ok()),
            request_id: &request_id,
        });
    }
    Ok(resp)
}

/// Body size for the access log. Streamed bodies have no exact size hint,
/// so the declared length stands in.
fn response_bytes(resp: &Response<ProxyBody>) -> Option<u64> {
    hyper::body::Body::size_hint(resp.body()).exact().or_else(|| {
        resp.headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    })
}

async fn route(req: Request<Incoming>, state: &AppState) -> Response<ProxyBody> {
    let path = req.uri().path();
    if path.starts_with(PEER_PATH_PREFIX) {
        return handler::serve_peer(req, &state.proxy).await;
    }
    if let Some(name) = path.strip_prefix(STATUS_PATH_PREFIX) {
        return handle_status(name, req.method(), state);
    }
    handler::serve(req, &state.proxy).await
}

fn handle_status(name: &str, method: &Method, state: &AppState) -> Response<ProxyBody> {
    if method != Method::GET && method != Method::HEAD {
        return text_response(StatusCode::METHOD_NOT_ALLOWED, "status endpoints are read-only");
    }
    match name {
        "healthz" => text_response(StatusCode::OK, "ok"),
        "version" => json_response(&runtime::build_info()),
        "metrics" => {
            metrics::set_store_bytes(state.proxy.group.store().size());
            text_response(StatusCode::OK, &metrics::render())
        }
        "stats" => json_response(&StatusReport::collect(&state.proxy.group)),
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::channel_body;
    use crate::{empty_body, full_body};

    #[test]
    fn logged_bytes_prefer_exact_size_then_content_length() {
        let full = Response::new(full_body("hello"));
        assert_eq!(response_bytes(&full), Some(5));

        let head = Response::new(empty_body());
        assert_eq!(response_bytes(&head), Some(0));

        let (_target, body) = channel_body(1);
        let mut streamed = Response::new(body);
        assert_eq!(response_bytes(&streamed), None);
        streamed.headers_mut().insert(CONTENT_LENGTH, "200000".parse().unwrap());
        assert_eq!(response_bytes(&streamed), Some(200000));
    }
}
