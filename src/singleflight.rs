use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

/// The computation of an in-flight call panicked or was cancelled before it
/// produced a value. Every waiter of that call receives this.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("in-flight call aborted: {0}")]
pub struct CallAborted(pub String);

type Outcome<T> = std::result::Result<T, CallAborted>;

/// Collapses concurrent calls for the same key into one execution.
///
/// The computation runs on its own task, so dropping a waiter (a client that
/// disconnected) never cancels it for the others. The pending record is
/// removed as soon as the result is published; nothing is memoized.
pub struct Group<K, T> {
    inner: Arc<Mutex<HashMap<K, Arc<Call<T>>>>>,
}

impl<K, T> Default for Group<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> Group<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn do_call<F, Fut>(&self, key: K, f: F) -> Outcome<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        self.do_call_shared(key, f).await.0
    }

    /// Like [`Group::do_call`], also reporting whether this caller joined a
    /// call that was already in flight.
    pub async fn do_call_shared<F, Fut>(&self, key: K, f: F) -> (Outcome<T>, bool)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (call, shared) = {
            let mut map = self.inner.lock().await;
            if let Some(call) = map.get(&key) {
                (call.clone(), true)
            } else {
                let call = Arc::new(Call::new());
                map.insert(key.clone(), call.clone());
                tokio::spawn(run_call(self.inner.clone(), key, call.clone(), f));
                (call, false)
            }
        };

        (call.wait().await, shared)
    }

    pub async fn in_flight(&self) -> usize {
        self.inner.lock().await.len()
    }
}

struct Call<T> {
    notify: Notify,
    result: Mutex<Option<Outcome<T>>>,
}

impl<T: Clone + Send + Sync + 'static> Call<T> {
    fn new() -> Self {
        Self {
            notify: Notify::new(),
            result: Mutex::new(None),
        }
    }

    async fn wait(&self) -> Outcome<T> {
        loop {
            // Register before checking so a publish in between is not lost.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(val) = self.result.lock().await.clone() {
                return val;
            }
            notified.await;
        }
    }

    async fn set(&self, val: Outcome<T>) {
        let mut slot = self.result.lock().await;
        *slot = Some(val);
        self.notify.notify_waiters();
    }
}

async fn run_call<K, T, F, Fut>(
    map: Arc<Mutex<HashMap<K, Arc<Call<T>>>>>,
    key: K,
    call: Arc<Call<T>>,
    f: F,
) where
    K: Eq + Hash,
    T: Clone + Send + Sync + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = T> + Send + 'static,
{
    // A panic inside `f` ends its own task; waiters still get released.
    let result = tokio::spawn(f()).await.map_err(|err| {
        log::error!("single-flighted call aborted: {err}");
        CallAborted(err.to_string())
    });
    // Unpublish first: callers arriving from now on start a fresh call.
    map.lock().await.remove(&key);
    call.set(result).await;
}
