//! Backlog of URLs whose CDN purge has not been acknowledged yet.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::infra::transient::TransientStore;

use super::PurgeError;

pub const PENDING_PURGE_KEY: &str = "lx_pending_purge";
pub const PENDING_PURGE_TTL: Duration = Duration::from_secs(14 * 24 * 60 * 60);

/// Deduplicated, insertion-ordered URL list kept in a transient.
///
/// Every change is a single `TransientStore::update`, so concurrent
/// purges merge instead of overwriting each other.
#[derive(Clone)]
pub struct PendingPurgeList {
    store: Arc<dyn TransientStore>,
}

impl PendingPurgeList {
    pub fn new(store: Arc<dyn TransientStore>) -> Self {
        Self { store }
    }

    pub fn load(&self) -> Result<Vec<String>, PurgeError> {
        let value = self
            .store
            .get(PENDING_PURGE_KEY)
            .map_err(PurgeError::Transient)?;
        Ok(decode(value))
    }

    /// Add `urls` to the backlog and return the full merged list.
    pub fn merge(&self, urls: &[String]) -> Result<Vec<String>, PurgeError> {
        let merged = self
            .store
            .update(PENDING_PURGE_KEY, PENDING_PURGE_TTL, &mut |current: Option<Value>| {
                let mut list = decode(current);
                let mut seen: BTreeSet<String> = list.iter().cloned().collect();
                for url in urls {
                    if seen.insert(url.clone()) {
                        list.push(url.clone());
                    }
                }
                encode(list)
            })
            .map_err(PurgeError::Transient)?;
        Ok(decode(merged))
    }

    /// Drop acknowledged URLs, keeping anything added since they were sent.
    pub fn remove(&self, sent: &[String]) -> Result<Vec<String>, PurgeError> {
        let sent: BTreeSet<&str> = sent.iter().map(String::as_str).collect();
        let remaining = self
            .store
            .update(PENDING_PURGE_KEY, PENDING_PURGE_TTL, &mut |current: Option<Value>| {
                let list = decode(current)
                    .into_iter()
                    .filter(|url| !sent.contains(url.as_str()))
                    .collect();
                encode(list)
            })
            .map_err(PurgeError::Transient)?;
        Ok(decode(remaining))
    }
}

fn decode(value: Option<Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(url) => Some(url),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn encode(list: Vec<String>) -> Option<Value> {
    (!list.is_empty()).then(|| Value::Array(list.into_iter().map(Value::String).collect()))
}

#[cfg(test)]
mod tests {
    use crate::infra::transient::MemoryTransientStore;

    use super::*;

    fn urls(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[test]
    fn merge_is_a_deduplicated_union() {
        let pending = PendingPurgeList::new(Arc::new(MemoryTransientStore::new()));
        pending.merge(&urls(&["a", "b"])).expect("merge");
        let merged = pending.merge(&urls(&["b", "c"])).expect("merge");
        assert_eq!(merged, urls(&["a", "b", "c"]));
        assert_eq!(pending.load().expect("load"), urls(&["a", "b", "c"]));
    }

    #[test]
    fn remove_keeps_urls_added_later() {
        let pending = PendingPurgeList::new(Arc::new(MemoryTransientStore::new()));
        let sent = pending.merge(&urls(&["a", "b"])).expect("merge");
        pending.merge(&urls(&["c"])).expect("late merge");

        let remaining = pending.remove(&sent).expect("remove");
        assert_eq!(remaining, urls(&["c"]));

        pending.remove(&remaining).expect("remove rest");
        assert!(pending.load().expect("load").is_empty());
    }
}
