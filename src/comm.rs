//! Comm side-channels: the shared registry of open comms and the targets
//! frontends can open them against.
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommState {
    Open,
    Closed,
}

/// A live comm. Closed comms are removed, so every stored channel is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommChannel {
    pub comm_id: String,
    pub target_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    Opened,
    /// The id was already open; its previous state was replaced.
    Reopened,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommError {
    #[error("comm `{0}` is not open")]
    NotOpen(String),

    #[error("comm `{comm_id}` names unknown target `{target_name}`")]
    UnknownTarget { comm_id: String, target_name: String },
}

/// Kernel-side handler for one `target_name`. Returned data is sent back to
/// the frontend as a `comm_msg`.
pub trait CommTarget: Send + Sync {
    fn on_open(&self, comm_id: &str, data: &Value) -> Option<Value> {
        let _ = (comm_id, data);
        None
    }

    fn on_msg(&self, comm_id: &str, data: &Value) -> Option<Value>;

    fn on_close(&self, comm_id: &str, data: &Value) {
        let _ = (comm_id, data);
    }
}

/// Shared by the three comm workers. Clones share state.
#[derive(Clone, Default)]
pub struct CommRegistry {
    targets: Arc<DashMap<String, Arc<dyn CommTarget>>>,
    comms: Arc<DashMap<String, CommChannel>>,
}

impl CommRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later registrations under the same name replace earlier ones.
    pub fn register_target(&self, target_name: &str, target: Arc<dyn CommTarget>) {
        self.targets.insert(target_name.to_string(), target);
    }

    fn target(&self, target_name: &str) -> Option<Arc<dyn CommTarget>> {
        self.targets.get(target_name).map(|t| Arc::clone(t.value()))
    }

    pub fn open(
        &self,
        comm_id: &str,
        target_name: &str,
        data: &Value,
    ) -> Result<(OpenOutcome, Option<Value>), CommError> {
        let target = self
            .target(target_name)
            .ok_or_else(|| CommError::UnknownTarget {
                comm_id: comm_id.to_string(),
                target_name: target_name.to_string(),
            })?;
        let channel = CommChannel {
            comm_id: comm_id.to_string(),
            target_name: target_name.to_string(),
        };
        let outcome = match self.comms.insert(comm_id.to_string(), channel) {
            Some(_) => OpenOutcome::Reopened,
            None => OpenOutcome::Opened,
        };
        Ok((outcome, target.on_open(comm_id, data)))
    }

    pub fn message(&self, comm_id: &str, data: &Value) -> Result<Option<Value>, CommError> {
        let target = self.ensure_open(comm_id)?;
        Ok(target.on_msg(comm_id, data))
    }

    pub fn close(&self, comm_id: &str, data: &Value) -> Result<(), CommError> {
        let (_, channel) = self
            .comms
            .remove(comm_id)
            .ok_or_else(|| CommError::NotOpen(comm_id.to_string()))?;
        if let Some(target) = self.target(&channel.target_name) {
            target.on_close(comm_id, data);
        }
        Ok(())
    }

    /// The target behind an open comm.
    pub fn ensure_open(&self, comm_id: &str) -> Result<Arc<dyn CommTarget>, CommError> {
        let target_name = self
            .comms
            .get(comm_id)
            .map(|c| c.target_name.clone())
            .ok_or_else(|| CommError::NotOpen(comm_id.to_string()))?;
        self.target(&target_name)
            .ok_or_else(|| CommError::NotOpen(comm_id.to_string()))
    }

    pub fn state(&self, comm_id: &str) -> CommState {
        if self.comms.contains_key(comm_id) {
            CommState::Open
        } else {
            CommState::Closed
        }
    }

    pub fn channel(&self, comm_id: &str) -> Option<CommChannel> {
        self.comms.get(comm_id).map(|c| c.value().clone())
    }

    pub fn open_count(&self) -> usize {
        self.comms.len()
    }
}

impl std::fmt::Debug for CommRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommRegistry")
            .field("targets", &self.targets.iter().map(|t| t.key().clone()).collect::<Vec<_>>())
            .field("open", &self.comms.len())
            .finish()
    }
}

/// Sends every message straight back.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoTarget;

impl CommTarget for EchoTarget {
    fn on_msg(&self, _comm_id: &str, data: &Value) -> Option<Value> {
        Some(data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> CommRegistry {
        let registry = CommRegistry::new();
        registry.register_target("echo", Arc::new(EchoTarget));
        registry
    }

    #[test]
    fn test_open_msg_close_then_msg_rejected() {
        let registry = registry();
        let (outcome, _) = registry.open("abc", "echo", &json!({})).unwrap();
        assert_eq!(outcome, OpenOutcome::Opened);
        assert_eq!(
            registry.message("abc", &json!({"x": 1})).unwrap(),
            Some(json!({"x": 1}))
        );
        registry.close("abc", &json!({})).unwrap();
        assert_eq!(registry.state("abc"), CommState::Closed);
        assert_eq!(
            registry.message("abc", &json!({})),
            Err(CommError::NotOpen("abc".into()))
        );
        assert_eq!(
            registry.close("abc", &json!({})),
            Err(CommError::NotOpen("abc".into()))
        );
    }

    #[test]
    fn test_reopen_overwrites() {
        let registry = registry();
        registry.register_target("other", Arc::new(EchoTarget));
        registry.open("abc", "echo", &json!({})).unwrap();
        let (outcome, _) = registry.open("abc", "other", &json!({})).unwrap();
        assert_eq!(outcome, OpenOutcome::Reopened);
        assert_eq!(registry.channel("abc").unwrap().target_name, "other");
        assert_eq!(registry.open_count(), 1);
    }

    #[test]
    fn test_unknown_target_rejected_and_nothing_opened() {
        let registry = registry();
        assert_eq!(
            registry.open("abc", "missing", &json!({})),
            Err(CommError::UnknownTarget {
                comm_id: "abc".into(),
                target_name: "missing".into()
            })
        );
        assert_eq!(registry.state("abc"), CommState::Closed);
    }

    #[test]
    fn test_failures_leave_other_comms_alone() {
        let registry = registry();
        registry.open("keep", "echo", &json!({})).unwrap();
        assert!(registry.message("ghost", &json!({})).is_err());
        assert_eq!(registry.state("keep"), CommState::Open);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_opens_all_land() {
        let registry = registry();
        let tasks: Vec<_> = (0..64)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move {
                    registry
                        .open(&format!("comm-{i}"), "echo", &json!({}))
                        .map(|(outcome, _)| outcome)
                })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap(), Ok(OpenOutcome::Opened));
        }
        assert_eq!(registry.open_count(), 64);
        assert!((0..64).all(|i| registry.state(&format!("comm-{i}")) == CommState::Open));
    }
}
