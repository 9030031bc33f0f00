//! Deduplication of concurrent renders of the same cache key.
//!
//! The first caller for a key computes; callers arriving while that
//! computation is in flight await it and share the result.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

pub struct Singleflight<V> {
    inflight: Mutex<HashMap<String, Arc<OnceCell<V>>>>,
}

impl<V: Clone> Singleflight<V> {
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` for `key`, or await a computation already in flight.
    ///
    /// When the leading computation fails, its error propagates to the
    /// leader and the key is released so a later request may retry.
    pub async fn run<F, Fut, E>(&self, key: &str, f: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let cell = {
            let mut inflight = self.inflight.lock().unwrap();
            Arc::clone(
                inflight
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(OnceCell::new())),
            )
        };
        let result = cell.get_or_try_init(f).await.cloned();
        let mut inflight = self.inflight.lock().unwrap();
        if let Some(current) = inflight.get(key) {
            if Arc::ptr_eq(current, &cell) {
                inflight.remove(key);
            }
        }
        result
    }
}

impl<V: Clone> Default for Singleflight<V> {
    fn default() -> Self {
        Self::new()
    }
}
