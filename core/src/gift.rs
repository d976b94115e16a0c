//! Gift metadata cache boundary.
//!
//! Fetching and retrying the gift table is somebody else's job; the pipeline
//! only needs the latest snapshot and a signal when it changes.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Latest gift lookup table, keyed by gift id.
#[derive(Clone)]
pub struct GiftCache {
    tx: Arc<watch::Sender<Value>>,
}

impl GiftCache {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Value::Object(Default::default()));
        Self { tx: Arc::new(tx) }
    }

    pub fn snapshot(&self) -> Value {
        self.tx.borrow().clone()
    }

    /// Install a freshly fetched table and notify subscribers
    pub fn replace(&self, table: Value) {
        let entries = table.as_object().map(|m| m.len()).unwrap_or(0);
        debug!("Gift cache replaced ({} entries)", entries);
        self.tx.send_replace(table);
    }

    pub fn subscribe(&self) -> watch::Receiver<Value> {
        self.tx.subscribe()
    }
}

impl Default for GiftCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_starts_empty() {
        assert_eq!(GiftCache::new().snapshot(), json!({}));
    }

    #[test]
    fn test_replace_notifies() {
        let cache = GiftCache::new();
        let mut rx = cache.subscribe();

        cache.replace(json!({"31036": {"name": "小花花", "price": 100}}));

        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update()["31036"]["price"], 100);
        assert_eq!(cache.snapshot()["31036"]["name"], "小花花");
    }
}
