//! Server Set Membership
//!
//! Registers this process as a member of a server set and exposes a live
//! view of every current member to discovery consumers.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use super::registration::{Registration, RegistrationState};
use crate::acl::AccessList;
use crate::coordination::{with_timeout, ChildWatcher, ChildrenHandler, SessionEvent, SharedClient};
use crate::error::{Error, Result};
use crate::instance::{Endpoint, ServiceInstance};
use crate::path::{parse_sequence, GroupPath};
use crate::retry::RetryPolicy;

/// How far a snapshot can be trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipStatus {
    /// No listing has completed yet
    Pending,
    /// Reflects the most recent listing
    Live,
    /// Session trouble; members are the last known set and may be stale
    Unknown,
}

impl std::fmt::Display for MembershipStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MembershipStatus::Pending => write!(f, "PENDING"),
            MembershipStatus::Live => write!(f, "LIVE"),
            MembershipStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// One live member record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Child node name
    pub node: String,
    /// Sequence number assigned at join
    pub sequence: u64,
    /// Advertised instance
    pub instance: ServiceInstance,
}

/// Members of a server set, ordered by join sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipSnapshot {
    pub status: MembershipStatus,
    pub members: Vec<Member>,
}

impl MembershipSnapshot {
    fn pending() -> Self {
        Self {
            status: MembershipStatus::Pending,
            members: Vec::new(),
        }
    }

    /// Advertised instances, in join order
    pub fn instances(&self) -> Vec<ServiceInstance> {
        self.members.iter().map(|m| m.instance.clone()).collect()
    }

    /// Primary endpoints, in join order
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.members
            .iter()
            .map(|m| m.instance.service_endpoint.clone())
            .collect()
    }

    /// Check if some member advertises `endpoint` as its primary endpoint
    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.members
            .iter()
            .any(|m| &m.instance.service_endpoint == endpoint)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn is_live(&self) -> bool {
        self.status == MembershipStatus::Live
    }
}

/// A server set rooted at one group path
pub struct ServerSet {
    client: SharedClient,
    acl: AccessList,
    path: GroupPath,
    member_prefix: String,
    retry: RetryPolicy,
    operation_timeout: Duration,
}

impl ServerSet {
    pub fn new(
        client: SharedClient,
        acl: AccessList,
        path: GroupPath,
        member_prefix: impl Into<String>,
        retry: RetryPolicy,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            client,
            acl,
            path,
            member_prefix: member_prefix.into(),
            retry,
            operation_timeout,
        }
    }

    /// Group path members register under
    pub fn path(&self) -> &GroupPath {
        &self.path
    }

    /// Access list applied to member nodes
    pub fn acl(&self) -> &AccessList {
        &self.acl
    }

    /// Retry budget of a single join
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Register `instance` as a member.
    ///
    /// The member node is recreated automatically after session expiry
    /// until the returned handle is closed.
    pub async fn join(&self, instance: &ServiceInstance) -> Result<MembershipHandle> {
        let registration = Registration::register(
            self.client.clone(),
            self.path.clone(),
            self.member_prefix.clone(),
            instance.encode()?,
            self.acl.clone(),
            self.retry.clone(),
            self.operation_timeout,
        )
        .await?;

        tracing::info!(
            "Joined server set {} as {} ({})",
            self.path,
            registration.node().unwrap_or_default(),
            instance
        );

        Ok(MembershipHandle {
            registration,
            instance: instance.clone(),
        })
    }

    /// Start watching the set's members
    pub fn watch(&self) -> HostSetWatch {
        let (tx, rx) = watch::channel(MembershipSnapshot::pending());
        let refresher = SnapshotRefresher {
            client: self.client.clone(),
            path: self.path.clone(),
            member_prefix: self.member_prefix.clone(),
            operation_timeout: self.operation_timeout,
            snapshot: tx,
        };
        let watcher = ChildWatcher::spawn(
            self.client.clone(),
            self.path.clone(),
            self.retry.clone(),
            refresher,
        );

        HostSetWatch {
            watcher,
            snapshot: rx,
            operation_timeout: self.operation_timeout,
        }
    }
}

/// This process's membership in a server set
pub struct MembershipHandle {
    registration: Registration,
    instance: ServiceInstance,
}

impl MembershipHandle {
    /// Full path of the member node, if currently registered
    pub fn node(&self) -> Option<String> {
        self.registration.node()
    }

    pub fn state(&self) -> RegistrationState {
        self.registration.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<RegistrationState> {
        self.registration.subscribe()
    }

    /// Instance advertised by this member
    pub fn instance(&self) -> &ServiceInstance {
        &self.instance
    }

    /// Leave the server set. Idempotent.
    pub async fn close(&self) {
        tracing::info!(
            "Leaving server set {} ({})",
            self.registration.path(),
            self.instance
        );
        self.registration.close().await;
    }
}

/// Live view of a server set's members
pub struct HostSetWatch {
    watcher: ChildWatcher,
    snapshot: watch::Receiver<MembershipSnapshot>,
    operation_timeout: Duration,
}

impl HostSetWatch {
    /// Most recent snapshot
    pub fn snapshot(&self) -> MembershipSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that observes every snapshot change
    pub fn subscribe(&self) -> watch::Receiver<MembershipSnapshot> {
        self.snapshot.clone()
    }

    /// Stream of snapshots, starting with the current one
    pub fn updates(&self) -> WatchStream<MembershipSnapshot> {
        WatchStream::new(self.snapshot.clone())
    }

    /// Wait until a snapshot satisfies `predicate`
    pub async fn wait_for(
        &self,
        timeout: Duration,
        predicate: impl FnMut(&MembershipSnapshot) -> bool,
    ) -> Result<MembershipSnapshot> {
        let mut rx = self.snapshot.clone();
        let result = match tokio::time::timeout(timeout, rx.wait_for(predicate)).await {
            Ok(Ok(snapshot)) => Ok(snapshot.clone()),
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => Err(Error::CoordinationUnavailable(format!(
                "membership of {} did not converge within {:?}",
                self.watcher.path(),
                timeout
            ))),
        };
        result
    }

    /// Stop watching. Idempotent.
    pub async fn close(&self) {
        self.watcher.shutdown(self.operation_timeout).await;
    }
}

/// Rebuilds the snapshot from each full listing
struct SnapshotRefresher {
    client: SharedClient,
    path: GroupPath,
    member_prefix: String,
    operation_timeout: Duration,
    snapshot: watch::Sender<MembershipSnapshot>,
}

impl SnapshotRefresher {
    /// Read one member record; `None` when it vanished or is unreadable
    async fn read_member(&self, node: String, sequence: u64) -> Result<Option<Member>> {
        let full_path = self.path.child(&node);
        let data = match with_timeout(
            self.operation_timeout,
            "get_data",
            self.client.get_data(&full_path),
        )
        .await
        {
            Ok(data) => data,
            Err(Error::NoNode(_)) => {
                tracing::debug!("Member {} left before it could be read", full_path);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        match ServiceInstance::decode(&full_path, &data) {
            Ok(instance) => Ok(Some(Member {
                node,
                sequence,
                instance,
            })),
            Err(e) => {
                tracing::warn!("Skipping member record: {}", e);
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl ChildrenHandler for SnapshotRefresher {
    async fn on_children(&mut self, children: Vec<String>) -> Result<()> {
        let mut ranked: Vec<(u64, String)> = children
            .into_iter()
            .filter_map(|name| parse_sequence(&name, &self.member_prefix).map(|seq| (seq, name)))
            .collect();
        ranked.sort();

        let this = &*self;
        let reads = ranked
            .into_iter()
            .map(|(sequence, node)| this.read_member(node, sequence));
        let members = futures::future::try_join_all(reads)
            .await?
            .into_iter()
            .flatten()
            .collect::<Vec<_>>();

        let next = MembershipSnapshot {
            status: MembershipStatus::Live,
            members,
        };
        let changed = self.snapshot.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next.clone();
            true
        });
        if changed {
            tracing::debug!("Server set {} now has {} members", self.path, next.len());
        }
        Ok(())
    }

    async fn on_session_event(&mut self, event: SessionEvent) {
        if matches!(
            event,
            SessionEvent::Disconnected | SessionEvent::Expired | SessionEvent::Closed
        ) {
            self.snapshot.send_if_modified(|current| {
                if current.status == MembershipStatus::Unknown {
                    return false;
                }
                tracing::warn!("Membership of {} unknown after {}", self.path, event);
                current.status = MembershipStatus::Unknown;
                true
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{CoordinationClient, MemoryCoordinator};
    use futures::StreamExt;
    use std::sync::Arc;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(2),
            max_backoff: Duration::from_millis(20),
            max_attempts: 3,
        }
    }

    fn server_set(client: SharedClient) -> ServerSet {
        ServerSet::new(
            client,
            AccessList::open_unsafe(),
            GroupPath::new("/aurora/scheduler").unwrap(),
            "member_",
            fast_retry(),
            Duration::from_secs(1),
        )
    }

    fn instance(port: u16) -> ServiceInstance {
        ServiceInstance::new(Endpoint::new("10.0.0.1", port))
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_join_and_watch() {
        let server = MemoryCoordinator::new();
        let session = Arc::new(server.connect());
        let set = server_set(session.clone());

        let a = set.join(&instance(8081)).await.unwrap();
        let b = set.join(&instance(8082)).await.unwrap();
        assert_eq!(a.node().unwrap(), "/aurora/scheduler/member_0000000000");

        let watch = set.watch();
        let snapshot = watch.wait_for(WAIT, |s| s.len() == 2).await.unwrap();
        assert!(snapshot.is_live());
        assert_eq!(
            snapshot.endpoints(),
            vec![Endpoint::new("10.0.0.1", 8081), Endpoint::new("10.0.0.1", 8082)]
        );

        a.close().await;
        let snapshot = watch.wait_for(WAIT, |s| s.len() == 1).await.unwrap();
        assert!(snapshot.contains(&Endpoint::new("10.0.0.1", 8082)));
        assert!(!snapshot.contains(&Endpoint::new("10.0.0.1", 8081)));

        b.close().await;
        watch.wait_for(WAIT, |s| s.is_empty()).await.unwrap();
        watch.close().await;
    }

    #[tokio::test]
    async fn test_malformed_and_foreign_children_are_skipped() {
        let server = MemoryCoordinator::new();
        let session = Arc::new(server.connect());
        let set = server_set(session.clone());
        let member = set.join(&instance(9000)).await.unwrap();

        server
            .create_persistent_sequential("/aurora/scheduler/member_", b"{not json")
            .unwrap();
        session
            .create_ephemeral_sequential(
                "/aurora/scheduler/singleton_candidate_",
                &instance(9001).encode().unwrap(),
                &AccessList::open_unsafe(),
            )
            .await
            .unwrap();

        let watch = set.watch();
        let snapshot = watch.wait_for(WAIT, |s| s.is_live()).await.unwrap();
        assert_eq!(snapshot.endpoints(), vec![Endpoint::new("10.0.0.1", 9000)]);

        member.close().await;
        watch.close().await;
    }

    #[tokio::test]
    async fn test_member_rejoins_after_expiry() {
        let server = MemoryCoordinator::new();
        let owner = Arc::new(server.connect());
        let observer = Arc::new(server.connect());

        let member = server_set(owner.clone()).join(&instance(7000)).await.unwrap();
        let watch = server_set(observer.clone()).watch();
        watch.wait_for(WAIT, |s| s.len() == 1).await.unwrap();

        owner.expire();
        watch.wait_for(WAIT, |s| s.is_empty()).await.unwrap();

        owner.renew();
        let snapshot = watch.wait_for(WAIT, |s| s.len() == 1).await.unwrap();
        assert_eq!(snapshot.members[0].node, "member_0000000001");
        assert_eq!(member.node().unwrap(), "/aurora/scheduler/member_0000000001");

        member.close().await;
        watch.close().await;
    }

    #[tokio::test]
    async fn test_watch_reports_unknown_during_outage() {
        let server = MemoryCoordinator::new();
        let session = Arc::new(server.connect());
        let set = server_set(session.clone());
        let member = set.join(&instance(6000)).await.unwrap();

        let watch = set.watch();
        watch.wait_for(WAIT, |s| s.is_live()).await.unwrap();

        session.disconnect();
        let snapshot = watch
            .wait_for(WAIT, |s| s.status == MembershipStatus::Unknown)
            .await
            .unwrap();
        // Last known members are kept while status is unknown
        assert_eq!(snapshot.len(), 1);

        session.reconnect();
        watch.wait_for(WAIT, |s| s.is_live()).await.unwrap();

        member.close().await;
        watch.close().await;
    }

    #[tokio::test]
    async fn test_updates_stream() {
        let server = MemoryCoordinator::new();
        let session = Arc::new(server.connect());
        let set = server_set(session.clone());
        session
            .ensure_path("/aurora/scheduler", &AccessList::open_unsafe())
            .await
            .unwrap();

        let watch = set.watch();
        let mut updates = watch.updates();
        assert_eq!(updates.next().await.unwrap().status, MembershipStatus::Pending);

        let member = set.join(&instance(5000)).await.unwrap();
        let snapshot = tokio::time::timeout(WAIT, async {
            loop {
                let snapshot = updates.next().await.unwrap();
                if snapshot.len() == 1 {
                    return snapshot;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(snapshot.members[0].instance, instance(5000));

        member.close().await;
        watch.close().await;
    }
}
