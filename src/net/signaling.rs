//! Signaling directory abstraction
//!
//! Peers bootstrap a direct connection by reading and writing a shared,
//! addressable key-value store, the signaling directory. The directory is
//! only used during connection setup: once the data channel opens, no
//! application data ever touches it.
//!
//! The concrete backend (a realtime database, a websocket relay, ...) is a
//! deployment choice, so the core depends only on the [`SignalingDirectory`]
//! trait. [`MemoryDirectory`] is the in-process implementation used by the
//! demo binary and the test suite.
//!
//! # Record shape
//!
//! One room occupies the subtree under `rooms/{code}`:
//!
//! ```text
//! rooms/{code}:            { offer: { type, sdp } }   # written by the offerer
//! rooms/{code}/answer:     { type, sdp }              # written once by the joiner
//! rooms/{code}/callerCandidates: [candidate, ...]     # appended by the offerer
//! rooms/{code}/calleeCandidates: [candidate, ...]     # appended by the joiner
//! ```
//!
//! Deleting `rooms/{code}` removes the whole subtree and notifies every
//! watcher beneath it; that deletion is how peers learn the session is over.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

/// Errors surfaced by a signaling directory backend
#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    /// The directory is unreachable or rejected a request.
    ///
    /// Propagated to the caller as-is; the protocol never retries
    /// internally.
    #[error("signaling transport failure: {0}")]
    Transport(Arc<str>),
}

impl SignalingError {
    /// Creates a transport error from any displayable cause.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(Arc::from(msg.into()))
    }
}

/// A change observed under a watched path
#[derive(Debug, Clone)]
pub enum DirectoryEvent {
    /// A scalar value was written at the watched path
    Put(Value),
    /// A child was appended to the ordered collection at the watched path
    Appended(Value),
    /// The watched path (or an ancestor) was deleted
    Removed,
}

/// Stream of [`DirectoryEvent`]s for one watched path.
///
/// The stream ends (yields `None`) once the watched subtree is deleted.
pub type DirectoryWatch = mpsc::UnboundedReceiver<DirectoryEvent>;

/// The capability both peers use to exchange connection-setup messages.
///
/// Writes are fire-and-forget from the protocol's perspective: no
/// acknowledgement is required before the caller proceeds. Ordered
/// collections must preserve append order and notify watchers in that order;
/// no ordering is promised *across* two different collections.
#[async_trait]
pub trait SignalingDirectory: Send + Sync + 'static {
    /// Writes a scalar value at `path`, replacing any previous value.
    async fn put(&self, path: &str, value: Value) -> Result<(), SignalingError>;

    /// Appends a value to the ordered collection at `path`.
    async fn push(&self, path: &str, value: Value) -> Result<(), SignalingError>;

    /// Reads the scalar value at `path`, if any.
    async fn get(&self, path: &str) -> Result<Option<Value>, SignalingError>;

    /// Watches `path` for changes.
    ///
    /// The returned stream first replays the current state (the scalar value,
    /// or every existing collection child in insertion order), then delivers
    /// live updates. Replay is what lets a joiner see candidates that were
    /// pushed before it subscribed.
    async fn watch(&self, path: &str) -> Result<DirectoryWatch, SignalingError>;

    /// Deletes the subtree rooted at `path`.
    async fn delete(&self, path: &str) -> Result<(), SignalingError>;
}

/// In-process signaling directory.
///
/// Backs the demo binary and the test suite; every peer in the process shares
/// one instance. Scalars and ordered collections live in concurrent maps,
/// watchers are plain unbounded channels pruned when their receiver goes
/// away.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    values: DashMap<String, Value>,
    lists: DashMap<String, Vec<Value>>,
    watchers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<DirectoryEvent>>>>,
}

impl MemoryDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers `event` to every live watcher of exactly `path`.
    fn notify(&self, path: &str, event: &DirectoryEvent) {
        let mut watchers = self.watchers.lock();
        if let Some(senders) = watchers.get_mut(path) {
            senders.retain(|tx| tx.send(event.clone()).is_ok());
            if senders.is_empty() {
                watchers.remove(path);
            }
        }
    }
}

#[async_trait]
impl SignalingDirectory for MemoryDirectory {
    async fn put(&self, path: &str, value: Value) -> Result<(), SignalingError> {
        trace!(path, "directory put");
        self.values.insert(path.to_owned(), value.clone());
        self.notify(path, &DirectoryEvent::Put(value));
        Ok(())
    }

    async fn push(&self, path: &str, value: Value) -> Result<(), SignalingError> {
        trace!(path, "directory push");
        self.lists
            .entry(path.to_owned())
            .or_default()
            .push(value.clone());
        self.notify(path, &DirectoryEvent::Appended(value));
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Value>, SignalingError> {
        Ok(self.values.get(path).map(|entry| entry.value().clone()))
    }

    async fn watch(&self, path: &str) -> Result<DirectoryWatch, SignalingError> {
        let (tx, rx) = mpsc::unbounded_channel();

        // Register before replaying so a concurrent write cannot fall in the
        // gap; a write racing the replay may be delivered twice, which the
        // protocol tolerates (duplicate answers and candidates are ignored).
        let mut watchers = self.watchers.lock();
        if let Some(value) = self.values.get(path) {
            let _ = tx.send(DirectoryEvent::Put(value.value().clone()));
        }
        if let Some(list) = self.lists.get(path) {
            for value in list.value() {
                let _ = tx.send(DirectoryEvent::Appended(value.clone()));
            }
        }
        watchers.entry(path.to_owned()).or_default().push(tx);
        Ok(rx)
    }

    async fn delete(&self, path: &str) -> Result<(), SignalingError> {
        trace!(path, "directory delete");
        let prefix = format!("{path}/");
        let covers = |key: &str| key == path || key.starts_with(&prefix);

        self.values.retain(|key, _| !covers(key));
        self.lists.retain(|key, _| !covers(key));

        // Notify and drop every watcher under the deleted subtree; their
        // streams end after the Removed event.
        let mut watchers = self.watchers.lock();
        watchers.retain(|key, senders| {
            if covers(key) {
                for tx in senders.iter() {
                    let _ = tx.send(DirectoryEvent::Removed);
                }
                false
            } else {
                true
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ==================== Scalar Tests ====================

    #[tokio::test]
    async fn test_put_then_get() {
        let dir = MemoryDirectory::new();
        dir.put("rooms/111111", json!({"offer": "x"})).await.unwrap();
        assert_eq!(
            dir.get("rooms/111111").await.unwrap(),
            Some(json!({"offer": "x"}))
        );
    }

    #[tokio::test]
    async fn test_get_missing_path() {
        let dir = MemoryDirectory::new();
        assert_eq!(dir.get("rooms/999999").await.unwrap(), None);
    }

    // ==================== Watch Tests ====================

    #[tokio::test]
    async fn test_watch_replays_existing_value() {
        let dir = MemoryDirectory::new();
        dir.put("rooms/1/answer", json!("a")).await.unwrap();

        let mut watch = dir.watch("rooms/1/answer").await.unwrap();
        assert!(matches!(
            watch.recv().await,
            Some(DirectoryEvent::Put(v)) if v == json!("a")
        ));
    }

    #[tokio::test]
    async fn test_watch_replays_list_in_insertion_order() {
        let dir = MemoryDirectory::new();
        for i in 0..3 {
            dir.push("rooms/1/callerCandidates", json!(i)).await.unwrap();
        }

        let mut watch = dir.watch("rooms/1/callerCandidates").await.unwrap();
        for i in 0..3 {
            assert!(matches!(
                watch.recv().await,
                Some(DirectoryEvent::Appended(v)) if v == json!(i)
            ));
        }
    }

    #[tokio::test]
    async fn test_watch_streams_live_appends_in_order() {
        let dir = MemoryDirectory::new();
        let mut watch = dir.watch("rooms/1/calleeCandidates").await.unwrap();

        for i in 0..5 {
            dir.push("rooms/1/calleeCandidates", json!(i)).await.unwrap();
        }
        for i in 0..5 {
            assert!(matches!(
                watch.recv().await,
                Some(DirectoryEvent::Appended(v)) if v == json!(i)
            ));
        }
    }

    #[tokio::test]
    async fn test_watch_mixes_replay_then_live() {
        let dir = MemoryDirectory::new();
        dir.push("rooms/1/callerCandidates", json!("early")).await.unwrap();

        let mut watch = dir.watch("rooms/1/callerCandidates").await.unwrap();
        dir.push("rooms/1/callerCandidates", json!("late")).await.unwrap();

        assert!(matches!(
            watch.recv().await,
            Some(DirectoryEvent::Appended(v)) if v == json!("early")
        ));
        assert!(matches!(
            watch.recv().await,
            Some(DirectoryEvent::Appended(v)) if v == json!("late")
        ));
    }

    // ==================== Delete Tests ====================

    #[tokio::test]
    async fn test_delete_removes_subtree() {
        let dir = MemoryDirectory::new();
        dir.put("rooms/1", json!({"offer": "x"})).await.unwrap();
        dir.put("rooms/1/answer", json!("a")).await.unwrap();
        dir.push("rooms/1/callerCandidates", json!("c")).await.unwrap();
        dir.put("rooms/2", json!({"offer": "y"})).await.unwrap();

        dir.delete("rooms/1").await.unwrap();

        assert_eq!(dir.get("rooms/1").await.unwrap(), None);
        assert_eq!(dir.get("rooms/1/answer").await.unwrap(), None);
        // Sibling room untouched.
        assert!(dir.get("rooms/2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_notifies_watchers_then_ends_stream() {
        let dir = MemoryDirectory::new();
        dir.put("rooms/1", json!({"offer": "x"})).await.unwrap();

        let mut root_watch = dir.watch("rooms/1").await.unwrap();
        let mut child_watch = dir.watch("rooms/1/answer").await.unwrap();

        // Drain the replayed root value.
        assert!(matches!(root_watch.recv().await, Some(DirectoryEvent::Put(_))));

        dir.delete("rooms/1").await.unwrap();

        assert!(matches!(root_watch.recv().await, Some(DirectoryEvent::Removed)));
        assert!(root_watch.recv().await.is_none());
        assert!(matches!(child_watch.recv().await, Some(DirectoryEvent::Removed)));
        assert!(child_watch.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_delete_does_not_touch_prefix_siblings() {
        // "rooms/12" must not be treated as a child of "rooms/1".
        let dir = MemoryDirectory::new();
        dir.put("rooms/12", json!("sibling")).await.unwrap();
        dir.delete("rooms/1").await.unwrap();
        assert!(dir.get("rooms/12").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_dropped_watcher_is_pruned() {
        let dir = MemoryDirectory::new();
        let watch = dir.watch("rooms/1").await.unwrap();
        drop(watch);

        // The next notification attempt prunes the dead sender.
        dir.put("rooms/1", json!("v")).await.unwrap();
        assert!(dir.watchers.lock().get("rooms/1").is_none());
    }
}
