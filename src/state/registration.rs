//! Ephemeral Registration
//!
//! Owns one ephemeral, sequence-numbered node and keeps it alive across
//! session loss: when a session expires the node is gone server-side, so
//! it is recreated once the connection layer reports a new session.
//! Both server set membership and election candidacy are built on this.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::acl::AccessList;
use crate::coordination::{with_timeout, SessionEvent, SharedClient};
use crate::error::{Error, Result};
use crate::path::{basename, parse_sequence, GroupPath};
use crate::retry::RetryPolicy;

/// Lifecycle of an owned ephemeral node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationState {
    /// Node is live
    Registered {
        /// Full path of the node
        node: String,
        /// Sequence number assigned by the coordination service
        sequence: u64,
        /// When this incarnation of the node was created
        since: DateTime<Utc>,
    },
    /// Session expired; waiting for a new session to recreate the node
    Lost,
    /// Re-registration exhausted its retry budget
    Failed,
    /// Closed by the owner
    Closed,
}

impl RegistrationState {
    /// Full path of the live node, if registered
    pub fn node(&self) -> Option<&str> {
        match self {
            RegistrationState::Registered { node, .. } => Some(node),
            _ => None,
        }
    }

    /// Sequence number of the live node, if registered
    pub fn sequence(&self) -> Option<u64> {
        match self {
            RegistrationState::Registered { sequence, .. } => Some(*sequence),
            _ => None,
        }
    }

    /// Check if no further registration will be attempted
    pub fn is_terminal(&self) -> bool {
        matches!(self, RegistrationState::Failed | RegistrationState::Closed)
    }
}

impl std::fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistrationState::Registered { node, .. } => write!(f, "REGISTERED({})", node),
            RegistrationState::Lost => write!(f, "LOST"),
            RegistrationState::Failed => write!(f, "FAILED"),
            RegistrationState::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Everything needed to (re)create the node
struct NodeSpec {
    client: SharedClient,
    path: GroupPath,
    prefix: String,
    data: Vec<u8>,
    acl: AccessList,
    retry: RetryPolicy,
    operation_timeout: Duration,
}

impl NodeSpec {
    /// Create the node once, provisioning the parent path first
    async fn create_once(&self) -> Result<(String, u64)> {
        with_timeout(
            self.operation_timeout,
            "ensure_path",
            self.client.ensure_path(self.path.as_str(), &self.acl),
        )
        .await?;

        let node = with_timeout(
            self.operation_timeout,
            "create",
            self.client.create_ephemeral_sequential(
                &self.path.child(&self.prefix),
                &self.data,
                &self.acl,
            ),
        )
        .await?;

        let sequence = parse_sequence(basename(&node), &self.prefix).ok_or_else(|| {
            Error::MalformedRecord {
                path: node.clone(),
                reason: "created node has no sequence suffix".into(),
            }
        })?;
        Ok((node, sequence))
    }

    /// Create the node within the retry budget
    async fn create(&self) -> Result<RegistrationState> {
        let (node, sequence) = self
            .retry
            .run("register", || self.create_once())
            .await?;
        Ok(RegistrationState::Registered {
            node,
            sequence,
            since: Utc::now(),
        })
    }

    /// Check whether `node` still exists
    async fn exists(&self, node: &str) -> Result<bool> {
        match with_timeout(self.operation_timeout, "get_data", self.client.get_data(node)).await {
            Ok(_) => Ok(true),
            Err(Error::NoNode(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// A live ephemeral node owned by this process
pub struct Registration {
    spec: Arc<NodeSpec>,
    state: Arc<watch::Sender<RegistrationState>>,
    recheck: Arc<Notify>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Registration {
    /// Create the node and start supervising it.
    ///
    /// Fails with `CoordinationUnavailable` when the retry budget runs out.
    pub async fn register(
        client: SharedClient,
        path: GroupPath,
        prefix: impl Into<String>,
        data: Vec<u8>,
        acl: AccessList,
        retry: RetryPolicy,
        operation_timeout: Duration,
    ) -> Result<Self> {
        let spec = Arc::new(NodeSpec {
            client,
            path,
            prefix: prefix.into(),
            data,
            acl,
            retry,
            operation_timeout,
        });

        // Subscribe first so an expiry right after creation is not missed
        let events = spec.client.session_events();
        let initial = spec.create().await?;
        if let Some(node) = initial.node() {
            tracing::info!("Registered {}", node);
        }

        let state = Arc::new(watch::channel(initial).0);
        let recheck = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervise(
            spec.clone(),
            state.clone(),
            recheck.clone(),
            events,
            cancel.clone(),
        ));

        Ok(Self {
            spec,
            state,
            recheck,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    /// Current state
    pub fn state(&self) -> RegistrationState {
        self.state.borrow().clone()
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> watch::Receiver<RegistrationState> {
        self.state.subscribe()
    }

    /// Full path of the live node, if registered
    pub fn node(&self) -> Option<String> {
        self.state.borrow().node().map(str::to_string)
    }

    /// Group path the node lives under
    pub fn path(&self) -> &GroupPath {
        &self.spec.path
    }

    /// Ask the supervisor to verify the node and recreate it if missing
    pub fn request_recheck(&self) {
        self.recheck.notify_one();
    }

    /// Stop supervising and delete the node. Idempotent.
    ///
    /// Deletion is best effort and bounded by the operation timeout; the
    /// service removes the node with the session regardless.
    pub async fn close(&self) {
        self.cancel.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            let abort = task.abort_handle();
            if tokio::time::timeout(self.spec.operation_timeout, task).await.is_err() {
                abort.abort();
            }
        }

        let previous = self.state.send_replace(RegistrationState::Closed);
        let Some(node) = previous.node() else {
            return;
        };

        let deleted = with_timeout(
            self.spec.operation_timeout,
            "delete",
            self.spec.client.delete(node),
        )
        .await;
        match deleted {
            Ok(()) => tracing::info!("Removed {}", node),
            Err(Error::NoNode(_)) => tracing::debug!("{} was already gone", node),
            Err(e) => tracing::warn!(
                "Failed to remove {} ({}); it will vanish with the session",
                node,
                e
            ),
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Watch session events and keep the node registered
async fn supervise(
    spec: Arc<NodeSpec>,
    state: Arc<watch::Sender<RegistrationState>>,
    recheck: Arc<Notify>,
    mut events: broadcast::Receiver<SessionEvent>,
    cancel: CancellationToken,
) {
    loop {
        let needs_check = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Ok(SessionEvent::Expired) => {
                    tracing::warn!(
                        "Session expired; registration under {} is lost until reconnect",
                        spec.path
                    );
                    state.send_replace(RegistrationState::Lost);
                    false
                }
                Ok(SessionEvent::Connected) => true,
                Ok(SessionEvent::Disconnected) => {
                    tracing::debug!("Disconnected; registration under {} pending", spec.path);
                    false
                }
                Ok(SessionEvent::Closed) | Err(broadcast::error::RecvError::Closed) => {
                    tracing::error!("Session closed; registration under {} failed", spec.path);
                    state.send_replace(RegistrationState::Failed);
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => true,
            },
            _ = recheck.notified() => true,
        };

        if !needs_check {
            continue;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = ensure_registered(&spec, &state) => {
                if let Err(e) = result {
                    tracing::error!(
                        "Giving up on registration under {}: {}",
                        spec.path,
                        e
                    );
                    state.send_replace(RegistrationState::Failed);
                    break;
                }
            }
        }
    }
}

/// Recreate the node if it no longer exists
async fn ensure_registered(
    spec: &NodeSpec,
    state: &watch::Sender<RegistrationState>,
) -> Result<()> {
    let current = state.borrow().clone();
    if current.is_terminal() {
        return Ok(());
    }

    if let Some(node) = current.node() {
        let still_there = spec
            .retry
            .run("verify registration", || spec.exists(node))
            .await?;
        if still_there {
            return Ok(());
        }
        tracing::warn!("{} is gone; re-registering", node);
    }

    let registered = spec.create().await?;
    if let Some(node) = registered.node() {
        tracing::info!("Re-registered as {}", node);
    }
    state.send_replace(registered);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{CoordinationClient, MemoryCoordinator};

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(2),
            max_backoff: Duration::from_millis(10),
            max_attempts,
        }
    }

    async fn register(session: SharedClient) -> Result<Registration> {
        Registration::register(
            session,
            GroupPath::new("/svc/group").unwrap(),
            "member_",
            b"data".to_vec(),
            AccessList::open_unsafe(),
            fast_retry(3),
            Duration::from_secs(1),
        )
        .await
    }

    async fn wait_for(
        rx: &mut watch::Receiver<RegistrationState>,
        f: impl FnMut(&RegistrationState) -> bool,
    ) -> RegistrationState {
        let state = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(f))
            .await
            .expect("state within timeout")
            .expect("registration alive")
            .clone();
        state
    }

    #[tokio::test]
    async fn test_register_creates_path_and_node() {
        let server = MemoryCoordinator::new();
        let session = std::sync::Arc::new(server.connect());
        let registration = register(session.clone()).await.unwrap();

        let node = registration.node().unwrap();
        assert_eq!(node, "/svc/group/member_0000000000");
        assert_eq!(registration.state().sequence(), Some(0));
        assert_eq!(session.get_data(&node).await.unwrap(), b"data");

        registration.close().await;
        assert!(!server.exists(&node));
        assert_eq!(registration.state(), RegistrationState::Closed);

        // Idempotent
        registration.close().await;
    }

    #[tokio::test]
    async fn test_register_fails_when_unavailable() {
        let server = MemoryCoordinator::new();
        let session = std::sync::Arc::new(server.connect());
        server.set_available(false);

        let err = register(session).await.err().unwrap();
        assert!(matches!(err, Error::CoordinationUnavailable(_)));
    }

    #[tokio::test]
    async fn test_reregisters_after_expiry() {
        let server = MemoryCoordinator::new();
        let session = std::sync::Arc::new(server.connect());
        let registration = register(session.clone()).await.unwrap();
        let first = registration.node().unwrap();
        let mut rx = registration.subscribe();

        session.expire();
        wait_for(&mut rx, |s| *s == RegistrationState::Lost).await;
        assert!(!server.exists(&first));

        session.renew();
        let state = wait_for(&mut rx, |s| s.node().is_some()).await;
        let second = state.node().unwrap().to_string();
        assert_ne!(first, second);
        assert!(server.exists(&second));
        assert!(state.sequence().unwrap() > 0);

        registration.close().await;
    }

    #[tokio::test]
    async fn test_reconnect_without_expiry_keeps_node() {
        let server = MemoryCoordinator::new();
        let session = std::sync::Arc::new(server.connect());
        let registration = register(session.clone()).await.unwrap();
        let node = registration.node().unwrap();

        session.disconnect();
        session.reconnect();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(registration.node(), Some(node.clone()));
        assert_eq!(server.children("/svc/group"), vec!["member_0000000000"]);

        registration.close().await;
    }

    #[tokio::test]
    async fn test_recheck_recreates_deleted_node() {
        let server = MemoryCoordinator::new();
        let session = std::sync::Arc::new(server.connect());
        let registration = register(session.clone()).await.unwrap();
        let node = registration.node().unwrap();
        let mut rx = registration.subscribe();

        server.remove(&node).unwrap();
        registration.request_recheck();

        let state = wait_for(&mut rx, |s| s.node().is_some_and(|n| n != node)).await;
        assert!(server.exists(state.node().unwrap()));

        registration.close().await;
    }

    #[tokio::test]
    async fn test_session_close_fails_registration() {
        let server = MemoryCoordinator::new();
        let session = std::sync::Arc::new(server.connect());
        let registration = register(session.clone()).await.unwrap();
        let mut rx = registration.subscribe();

        session.close();
        wait_for(&mut rx, |s| *s == RegistrationState::Failed).await;
        registration.close().await;
    }
}
