use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};

pub mod access_log;
pub mod codec;
pub mod config;
pub mod constants;
pub mod error;
pub mod group;
pub mod handler;
pub mod logging;
pub mod metrics;
pub mod origin;
pub mod peer;
pub mod ring;
pub mod runtime;
pub mod server;
pub mod singleflight;
pub mod store;
pub mod stream;

pub use error::{Error, Result};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Body type of every response the proxy produces.
pub type ProxyBody = UnsyncBoxBody<Bytes, Infallible>;

pub fn full_body(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into()).boxed_unsync()
}

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().boxed_unsync()
}
