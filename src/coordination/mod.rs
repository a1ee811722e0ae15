//! Coordination Service Client
//!
//! The primitives the registration and election protocol needs from a
//! hierarchical, session-based coordination service. Connection and
//! session-renewal logic live behind this trait; the protocol only sees
//! session notifications.

pub mod memory;
mod watcher;

pub use memory::{MemoryCoordinator, MemorySession};
pub use watcher::{ChildWatcher, ChildrenHandler};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, oneshot};

use crate::acl::AccessList;
use crate::error::{Error, Result};

/// Session lifecycle notification from the connection layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Connected; either the same session resumed or a fresh one began
    Connected,
    /// Connection lost; the session may still be alive server-side
    Disconnected,
    /// Session expired; all of its ephemeral nodes are gone
    Expired,
    /// The client gave up on the session for good
    Closed,
}

impl std::fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEvent::Connected => write!(f, "CONNECTED"),
            SessionEvent::Disconnected => write!(f, "DISCONNECTED"),
            SessionEvent::Expired => write!(f, "EXPIRED"),
            SessionEvent::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Notification delivered by a one-shot watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchedEvent {
    /// A child of the watched path was created or deleted
    ChildrenChanged { path: String },
}

/// A one-shot child watch. Dropped by the service when the owning
/// session expires, which the receiver observes as a closed channel.
pub type WatchReceiver = oneshot::Receiver<WatchedEvent>;

/// Result of listing a path's children
#[derive(Debug)]
pub struct ChildListing {
    /// Child names (not full paths)
    pub children: Vec<String>,
    /// Armed watch, when one was requested
    pub watch: Option<WatchReceiver>,
}

/// Coordination service primitives
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Create any missing persistent nodes along `path`
    async fn ensure_path(&self, path: &str, acl: &AccessList) -> Result<()>;

    /// Create an ephemeral node named `path_prefix` plus a sequence suffix.
    /// Returns the full path of the created node.
    async fn create_ephemeral_sequential(
        &self,
        path_prefix: &str,
        data: &[u8],
        acl: &AccessList,
    ) -> Result<String>;

    /// List children of `path`, optionally arming a one-shot child watch
    async fn get_children(&self, path: &str, watch: bool) -> Result<ChildListing>;

    /// Read a node's data; `NoNode` if it does not exist
    async fn get_data(&self, path: &str) -> Result<Vec<u8>>;

    /// Delete a node; `NoNode` if it does not exist
    async fn delete(&self, path: &str) -> Result<()>;

    /// Subscribe to session lifecycle notifications
    fn session_events(&self) -> broadcast::Receiver<SessionEvent>;
}

/// A coordination client shared by every server set and elector built on it
pub type SharedClient = Arc<dyn CoordinationClient>;

/// Bound a coordination call; an elapsed deadline counts as unavailability
pub async fn with_timeout<T, F>(timeout: Duration, operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::CoordinationUnavailable(format!(
            "{} timed out after {:?}",
            operation, timeout
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_maps_elapsed() {
        let err = with_timeout(Duration::from_millis(10), "get_data", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, Error>(())
        })
        .await
        .unwrap_err();

        assert!(matches!(err, Error::CoordinationUnavailable(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_with_timeout_passes_result() {
        let value = with_timeout(Duration::from_secs(1), "get_data", async { Ok::<_, Error>(5) })
            .await
            .unwrap();
        assert_eq!(value, 5);
    }
}
