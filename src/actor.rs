//! Mailbox plumbing shared by every worker in the topology.
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("worker `{0}` is no longer running")]
pub struct WorkerGone(pub String);

/// Sending side of a worker's mailbox. Cheap to clone.
#[derive(Debug)]
pub struct WorkerHandle<T> {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Clone for WorkerHandle<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            tx: self.tx.clone(),
        }
    }
}

impl<T> WorkerHandle<T> {
    pub fn new(name: &str, tx: mpsc::UnboundedSender<T>) -> Self {
        Self {
            name: Arc::from(name),
            tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue `item`; never blocks. Fails only once the worker has stopped.
    pub fn send(&self, item: T) -> Result<(), WorkerGone> {
        self.tx
            .send(item)
            .map_err(|_| WorkerGone(self.name.to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A mailbox whose receiving end is handed to the worker at spawn time.
pub struct Mailbox<T> {
    pub handle: WorkerHandle<T>,
    pub rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Mailbox<T> {
    pub fn new(name: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            handle: WorkerHandle::new(name, tx),
            rx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mailbox_preserves_order() {
        let Mailbox { handle, mut rx } = Mailbox::new("probe");
        for i in 0..5 {
            handle.send(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(rx.recv().await, Some(i));
        }
        assert_eq!(handle.name(), "probe");
    }

    #[tokio::test]
    async fn test_send_after_worker_stops() {
        let Mailbox { handle, rx } = Mailbox::<u8>::new("gone");
        drop(rx);
        assert!(handle.is_closed());
        assert_eq!(handle.send(1), Err(WorkerGone("gone".into())));
    }
}
