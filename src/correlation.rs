//! In-flight `input_request` → waiting reader.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use kernel_protocol::content::InputReply;
use thiserror::Error;
use tokio::sync::oneshot;

/// Where a correlated reply ends up.
pub type ReplyTarget = oneshot::Sender<InputReply>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("request `{0}` already has a pending reply target")]
    AlreadyPending(String),

    #[error("no pending request `{0}`")]
    Unknown(String),

    #[error("reader for request `{0}` went away before the reply arrived")]
    TargetDropped(String),

    #[error("request `{0}` issued after the kernel stopped taking replies")]
    Closed(String),
}

/// Owns every correlation entry. Clones share the same table.
#[derive(Clone, Debug, Default)]
pub struct CorrelationTable {
    pending: Arc<DashMap<String, ReplyTarget>>,
    closed: Arc<AtomicBool>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `request_id` expects a reply delivered to `target`.
    pub fn insert(&self, request_id: &str, target: ReplyTarget) -> Result<(), CorrelationError> {
        if self.is_closed() {
            return Err(CorrelationError::Closed(request_id.to_string()));
        }
        match self.pending.entry(request_id.to_string()) {
            Entry::Occupied(_) => {
                return Err(CorrelationError::AlreadyPending(request_id.to_string()));
            }
            Entry::Vacant(slot) => {
                slot.insert(target);
            }
        }
        // a close that raced the insert above must not leave the entry behind
        if self.is_closed() {
            self.abandon(request_id);
            return Err(CorrelationError::Closed(request_id.to_string()));
        }
        Ok(())
    }

    /// Lookup-and-remove in one step; a second call for the same id yields `None`.
    pub fn take(&self, request_id: &str) -> Option<ReplyTarget> {
        self.pending.remove(request_id).map(|(_, target)| target)
    }

    /// Remove and deliver. Unknown ids are stale replies.
    pub fn resolve(&self, request_id: &str, reply: InputReply) -> Result<(), CorrelationError> {
        let target = self
            .take(request_id)
            .ok_or_else(|| CorrelationError::Unknown(request_id.to_string()))?;
        target
            .send(reply)
            .map_err(|_| CorrelationError::TargetDropped(request_id.to_string()))
    }

    /// Drop the entry without delivering anything. Returns whether it existed.
    pub fn abandon(&self, request_id: &str) -> bool {
        self.pending.remove(request_id).is_some()
    }

    /// Refuse new entries and drop the existing ones; waiting readers see
    /// their request abandoned. Returns how many were pending.
    pub fn close(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let count = self.pending.len();
        self.pending.clear();
        count
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_pending(&self, request_id: &str) -> bool {
        self.pending.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(value: &str) -> InputReply {
        InputReply {
            value: value.to_string(),
        }
    }

    #[tokio::test]
    async fn test_reply_delivered_once() {
        let table = CorrelationTable::new();
        let (tx, rx) = oneshot::channel();
        table.insert("r1", tx).unwrap();
        assert!(table.is_pending("r1"));

        table.resolve("r1", reply("42")).unwrap();
        assert_eq!(rx.await.unwrap().value, "42");
        assert!(table.is_empty());

        assert_eq!(
            table.resolve("r1", reply("again")),
            Err(CorrelationError::Unknown("r1".into()))
        );
    }

    #[test]
    fn test_at_most_one_entry_per_id() {
        let table = CorrelationTable::new();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        table.insert("r1", tx1).unwrap();
        assert_eq!(
            table.insert("r1", tx2),
            Err(CorrelationError::AlreadyPending("r1".into()))
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_abandon_removes_entry() {
        let table = CorrelationTable::new();
        let (tx, _rx) = oneshot::channel();
        table.insert("r1", tx).unwrap();
        assert!(table.abandon("r1"));
        assert!(!table.abandon("r1"));
        assert!(table.take("r1").is_none());
    }

    #[tokio::test]
    async fn test_close_releases_readers_and_refuses_new_ones() {
        let table = CorrelationTable::new();
        let (tx, rx) = oneshot::channel();
        table.insert("r1", tx).unwrap();
        assert_eq!(table.close(), 1);
        assert!(rx.await.is_err());

        let (tx, _rx) = oneshot::channel();
        assert_eq!(
            table.insert("r2", tx),
            Err(CorrelationError::Closed("r2".into()))
        );
        assert!(table.is_empty());
    }

    #[test]
    fn test_dropped_reader_is_reported() {
        let table = CorrelationTable::new();
        let (tx, rx) = oneshot::channel();
        table.insert("r1", tx).unwrap();
        drop(rx);
        assert_eq!(
            table.resolve("r1", reply("late")),
            Err(CorrelationError::TargetDropped("r1".into()))
        );
        assert!(table.is_empty());
    }
}
