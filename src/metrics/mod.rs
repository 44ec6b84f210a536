use std::sync::OnceLock;

use http::{HeaderMap, StatusCode};
use prometheus::core::Collector;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::constants;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::new)
}

fn register<C: Collector + Clone + 'static>(collector: C) -> C {
    if let Err(err) = registry().register(Box::new(collector.clone())) {
        log::warn!("register metric: {err}");
    }
    collector
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    register(IntCounterVec::new(Opts::new(name, help), labels).expect("metric definition"))
}

fn requests_status_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| counter_vec("hoard_requests_status_total", "Requests by response status", &["code"]))
}

fn cache_lookups_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| counter_vec("hoard_cache_lookups_total", "Proxied requests by cache status", &["status"]))
}

fn origin_fetches_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| counter_vec("hoard_origin_fetches_total", "Origin fetches by result", &["result"]))
}

fn peer_fetches_total() -> &'static IntCounterVec {
    static METRIC: OnceLock<IntCounterVec> = OnceLock::new();
    METRIC.get_or_init(|| counter_vec("hoard_peer_fetches_total", "Peer fetches by result", &["result"]))
}

fn store_bytes() -> &'static IntGauge {
    static METRIC: OnceLock<IntGauge> = OnceLock::new();
    METRIC.get_or_init(|| {
        register(IntGauge::new("hoard_store_bytes", "Bytes held by the local store").expect("metric definition"))
    })
}

fn init_metrics() {
    for code in ["200", "404", "413", "500", "502"] {
        requests_status_total().with_label_values(&[code]).inc_by(0);
    }
    for status in ["HIT", "MISS", "REMOTE_HIT", "REMOTE_MISS", "FALLBACK"] {
        cache_lookups_total().with_label_values(&[status]).inc_by(0);
    }
    origin_fetches_total().with_label_values(&["ok"]).inc_by(0);
    peer_fetches_total().with_label_values(&["ok"]).inc_by(0);
    let _ = store_bytes();
}

pub fn record(status: StatusCode) {
    requests_status_total()
        .with_label_values(&[status.as_str()])
        .inc();
}

pub fn record_cache_status(status: &str) {
    cache_lookups_total().with_label_values(&[status]).inc();
}

pub fn record_origin_fetch(result: &str) {
    origin_fetches_total().with_label_values(&[result]).inc();
}

pub fn record_peer_fetch(result: &str) {
    peer_fetches_total().with_label_values(&[result]).inc();
}

pub fn set_store_bytes(bytes: u64) {
    store_bytes().set(i64::try_from(bytes).unwrap_or(i64::MAX));
}

pub fn render() -> String {
    init_metrics();
    let families = registry().gather();
    let mut buf = Vec::new();
    if let Err(err) = TextEncoder::new().encode(&families, &mut buf) {
        log::warn!("encode metrics: {err}");
    }
    String::from_utf8(buf).unwrap_or_default()
}

pub fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get(constants::PROTOCOL_REQUEST_ID_KEY)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .unwrap_or_else(generate_request_id)
}

pub fn generate_request_id() -> String {
    let mut buf = [0u8; 16];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}
