//! Response body streaming with bounded flush latency.
//!
//! Event streams and bodies of unknown length are flushed on every write.
//! Bounded bodies are coalesced: the first write after a flush arms a timer
//! and everything written before it fires goes out as one chunk.

use std::convert::Infallible;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::HeaderMap;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::{BoxFuture, ProxyBody};

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushPolicy {
    Immediate,
    Interval(Duration),
}

impl FlushPolicy {
    pub fn for_response(headers: &HeaderMap, max_latency: Duration) -> Self {
        if max_latency.is_zero() || is_event_stream(headers) || declared_length(headers).is_none() {
            FlushPolicy::Immediate
        } else {
            FlushPolicy::Interval(max_latency)
        }
    }
}

pub fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|media| media.trim().eq_ignore_ascii_case("text/event-stream"))
        .unwrap_or(false)
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Where flushed bytes go.
pub trait FlushTarget: Send + 'static {
    fn flush(&mut self, chunk: Bytes) -> BoxFuture<Result<()>>;
}

pub type BodyFrame = std::result::Result<Frame<Bytes>, Infallible>;

/// Feeds a hyper response body through a bounded channel.
pub struct ChannelTarget {
    tx: mpsc::Sender<BodyFrame>,
}

impl FlushTarget for ChannelTarget {
    fn flush(&mut self, chunk: Bytes) -> BoxFuture<Result<()>> {
        let tx = self.tx.clone();
        Box::pin(async move {
            if chunk.is_empty() {
                return if tx.is_closed() { Err(Error::StreamClosed) } else { Ok(()) };
            }
            tx.send(Ok(Frame::data(chunk))).await.map_err(|_| Error::StreamClosed)
        })
    }
}

/// A channel-backed body: bytes flushed into the target become data frames
/// of the body, which ends once the target is dropped.
pub fn channel_body(capacity: usize) -> (ChannelTarget, ProxyBody) {
    let (tx, rx) = mpsc::channel::<BodyFrame>(capacity.max(1));
    let frames = futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|frame| (frame, rx)) });
    (ChannelTarget { tx }, StreamBody::new(frames).boxed_unsync())
}

struct StreamState<T> {
    target: Option<T>,
    buf: BytesMut,
    flush_pending: bool,
    timer: Option<JoinHandle<()>>,
    // A timer flush has nobody to report to; the next write returns it.
    error: Option<Error>,
    flushes: u64,
}

impl<T: FlushTarget> StreamState<T> {
    async fn flush(&mut self) -> Result<()> {
        let target = self.target.as_mut().ok_or(Error::StreamClosed)?;
        let chunk = self.buf.split().freeze();
        self.flushes += 1;
        target.flush(chunk).await
    }

    async fn delayed_flush(&mut self) {
        if !self.flush_pending {
            return;
        }
        self.flush_pending = false;
        self.timer = None;
        if let Err(err) = self.flush().await {
            self.error = Some(err);
        }
    }
}

pub struct StreamWriter<T: FlushTarget> {
    policy: FlushPolicy,
    state: Arc<Mutex<StreamState<T>>>,
}

impl<T: FlushTarget> StreamWriter<T> {
    pub fn new(target: T, policy: FlushPolicy) -> Self {
        Self {
            policy,
            state: Arc::new(Mutex::new(StreamState {
                target: Some(target),
                buf: BytesMut::new(),
                flush_pending: false,
                timer: None,
                error: None,
                flushes: 0,
            })),
        }
    }

    pub fn policy(&self) -> FlushPolicy {
        self.policy
    }

    pub async fn write(&self, chunk: Bytes) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.error.take() {
            return Err(err);
        }
        if state.target.is_none() {
            return Err(Error::StreamClosed);
        }
        state.buf.extend_from_slice(&chunk);

        match self.policy {
            FlushPolicy::Immediate => state.flush().await,
            FlushPolicy::Interval(latency) => {
                if !state.flush_pending {
                    state.flush_pending = true;
                    state.timer = Some(tokio::spawn(flush_after(Arc::downgrade(&self.state), latency)));
                }
                Ok(())
            }
        }
    }

    /// Cancels any pending timer, flushes what is buffered and releases the
    /// target. Returns the number of flushes issued over the stream's life.
    pub async fn finish(self) -> Result<u64> {
        let mut state = self.state.lock().await;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.flush_pending = false;
        let pending = state.error.take();
        let result = state.flush().await;
        state.target = None;
        match pending {
            Some(err) => Err(err),
            None => result.map(|_| state.flushes),
        }
    }
}

impl<T: FlushTarget> Drop for StreamWriter<T> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.try_lock() {
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
        }
    }
}

async fn flush_after<T: FlushTarget>(state: Weak<Mutex<StreamState<T>>>, latency: Duration) {
    tokio::time::sleep(latency).await;
    if let Some(state) = state.upgrade() {
        state.lock().await.delayed_flush().await;
    }
}
