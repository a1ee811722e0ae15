//! Leader Election
//!
//! Lowest-sequence election over ephemeral candidate nodes. Each elector
//! registers one candidate under the group path, watches the candidate
//! list and recomputes leadership from a full listing on every change.
//! The contender holding the lowest live sequence number leads.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::registration::{Registration, RegistrationState};
use crate::acl::AccessList;
use crate::coordination::{with_timeout, ChildWatcher, ChildrenHandler, SessionEvent, SharedClient};
use crate::error::{Error, Result};
use crate::instance::ServiceInstance;
use crate::path::{parse_sequence, GroupPath};
use crate::retry::RetryPolicy;

/// Why an elector stopped for good
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefunctReason {
    /// Closed while leading
    Resigned,
    /// Closed while not leading
    Closed,
    /// Session could not be recovered within the retry budget
    SessionLost,
}

impl std::fmt::Display for DefunctReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DefunctReason::Resigned => write!(f, "RESIGNED"),
            DefunctReason::Closed => write!(f, "CLOSED"),
            DefunctReason::SessionLost => write!(f, "SESSION_LOST"),
        }
    }
}

/// Leadership as seen by one elector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadershipState {
    /// Candidate not yet ranked
    Pending,
    /// Own candidate holds the lowest sequence number
    Leader,
    /// Another candidate leads; `None` while the leader is unknown
    Follower { leader: Option<ServiceInstance> },
    /// Terminal
    Defunct(DefunctReason),
}

impl LeadershipState {
    pub fn is_leader(&self) -> bool {
        matches!(self, LeadershipState::Leader)
    }

    pub fn is_defunct(&self) -> bool {
        matches!(self, LeadershipState::Defunct(_))
    }

    /// Leader endpoint when following a known leader
    pub fn leader(&self) -> Option<&ServiceInstance> {
        match self {
            LeadershipState::Follower { leader } => leader.as_ref(),
            _ => None,
        }
    }
}

impl std::fmt::Display for LeadershipState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeadershipState::Pending => write!(f, "PENDING"),
            LeadershipState::Leader => write!(f, "LEADER"),
            LeadershipState::Follower { leader: Some(leader) } => {
                write!(f, "FOLLOWER({})", leader.service_endpoint)
            }
            LeadershipState::Follower { leader: None } => write!(f, "FOLLOWER(unknown)"),
            LeadershipState::Defunct(reason) => write!(f, "DEFUNCT({})", reason),
        }
    }
}

/// A contender's candidate node, ordered by sequence number
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ElectionCandidate {
    pub sequence: u64,
    pub name: String,
}

impl ElectionCandidate {
    /// Parse a child name carrying `prefix`
    pub fn parse(name: &str, prefix: &str) -> Option<Self> {
        parse_sequence(name, prefix).map(|sequence| Self {
            sequence,
            name: name.to_string(),
        })
    }

    /// Candidates among `children`, lowest sequence first
    pub fn rank(children: &[String], prefix: &str) -> Vec<Self> {
        let mut candidates: Vec<Self> = children
            .iter()
            .filter_map(|name| Self::parse(name, prefix))
            .collect();
        candidates.sort();
        candidates
    }
}

/// Receives leadership transitions.
///
/// Calls are never concurrent with each other and never follow a
/// `Defunct` state. A panic is caught and logged.
pub trait LeadershipListener: Send + Sync + 'static {
    fn on_leadership_change(&self, state: &LeadershipState);
}

impl<F> LeadershipListener for F
where
    F: Fn(&LeadershipState) + Send + Sync + 'static,
{
    fn on_leadership_change(&self, state: &LeadershipState) {
        self(state)
    }
}

/// Serializes transitions and their callbacks
struct Delivery {
    current: LeadershipState,
    listener: Box<dyn LeadershipListener>,
}

struct Shared {
    path: GroupPath,
    delivery: tokio::sync::Mutex<Delivery>,
    state: watch::Sender<LeadershipState>,
}

impl Shared {
    /// Move to `next`, notifying the listener. Returns false for duplicate
    /// states and for anything after `Defunct`.
    async fn transition(&self, next: LeadershipState) -> bool {
        let mut delivery = self.delivery.lock().await;
        self.apply(&mut delivery, next)
    }

    fn apply(&self, delivery: &mut Delivery, next: LeadershipState) -> bool {
        if delivery.current.is_defunct() || delivery.current == next {
            return false;
        }

        tracing::info!(
            "Leadership under {}: {} -> {}",
            self.path,
            delivery.current,
            next
        );
        delivery.current = next.clone();
        self.state.send_replace(next.clone());

        let listener = &delivery.listener;
        if catch_unwind(AssertUnwindSafe(|| listener.on_leadership_change(&next))).is_err() {
            tracing::error!("Leadership listener panicked handling {}", next);
        }
        true
    }
}

/// Runs elections under one group path
pub struct LeaderElector {
    client: SharedClient,
    acl: AccessList,
    path: GroupPath,
    candidate_prefix: String,
    retry: RetryPolicy,
    operation_timeout: Duration,
}

impl LeaderElector {
    pub fn new(
        client: SharedClient,
        acl: AccessList,
        path: GroupPath,
        candidate_prefix: impl Into<String>,
        retry: RetryPolicy,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            client,
            acl,
            path,
            candidate_prefix: candidate_prefix.into(),
            retry,
            operation_timeout,
        }
    }

    /// Group path candidates register under
    pub fn path(&self) -> &GroupPath {
        &self.path
    }

    /// Current candidates, lowest sequence first
    pub async fn candidates(&self) -> Result<Vec<ElectionCandidate>> {
        let listing = with_timeout(
            self.operation_timeout,
            "get_children",
            self.client.get_children(self.path.as_str(), false),
        )
        .await?;
        Ok(ElectionCandidate::rank(&listing.children, &self.candidate_prefix))
    }

    /// Publish a candidate for `instance` and start contending.
    ///
    /// `listener` is called on every transition until the returned
    /// handle is closed or the session is lost for good.
    pub async fn advertise(
        &self,
        instance: &ServiceInstance,
        listener: impl LeadershipListener,
    ) -> Result<Leadership> {
        let registration = Arc::new(
            Registration::register(
                self.client.clone(),
                self.path.clone(),
                self.candidate_prefix.clone(),
                instance.encode()?,
                self.acl.clone(),
                self.retry.clone(),
                self.operation_timeout,
            )
            .await?,
        );

        tracing::info!(
            "Advertised candidate {} for {}",
            registration.node().unwrap_or_default(),
            instance
        );

        let shared = Arc::new(Shared {
            path: self.path.clone(),
            delivery: tokio::sync::Mutex::new(Delivery {
                current: LeadershipState::Pending,
                listener: Box::new(listener),
            }),
            state: watch::channel(LeadershipState::Pending).0,
        });

        let handler = ElectionHandler {
            client: self.client.clone(),
            path: self.path.clone(),
            candidate_prefix: self.candidate_prefix.clone(),
            operation_timeout: self.operation_timeout,
            registration: registration.clone(),
            shared: shared.clone(),
        };
        let watcher = Arc::new(ChildWatcher::spawn(
            self.client.clone(),
            self.path.clone(),
            self.retry.clone(),
            handler,
        ));

        let cancel = CancellationToken::new();
        let supervisor = tokio::spawn(supervise(
            registration.subscribe(),
            shared.clone(),
            watcher.clone(),
            cancel.clone(),
        ));

        Ok(Leadership {
            shared,
            registration,
            watcher,
            cancel,
            supervisor: Mutex::new(Some(supervisor)),
            operation_timeout: self.operation_timeout,
        })
    }
}

/// Handle to one advertised candidate
pub struct Leadership {
    shared: Arc<Shared>,
    registration: Arc<Registration>,
    watcher: Arc<ChildWatcher>,
    cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    operation_timeout: Duration,
}

impl Leadership {
    /// Current state
    pub fn state(&self) -> LeadershipState {
        self.shared.state.borrow().clone()
    }

    /// Receiver that observes every transition
    pub fn subscribe(&self) -> watch::Receiver<LeadershipState> {
        self.shared.state.subscribe()
    }

    pub fn is_leader(&self) -> bool {
        self.state().is_leader()
    }

    /// Full path of the candidate node, if currently registered
    pub fn node(&self) -> Option<String> {
        self.registration.node()
    }

    /// Wait until the state satisfies `predicate`
    pub async fn wait_for(
        &self,
        timeout: Duration,
        predicate: impl FnMut(&LeadershipState) -> bool,
    ) -> Result<LeadershipState> {
        let mut rx = self.shared.state.subscribe();
        let result = match tokio::time::timeout(timeout, rx.wait_for(predicate)).await {
            Ok(Ok(state)) => Ok(state.clone()),
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => Err(Error::CoordinationUnavailable(format!(
                "election under {} did not reach the expected state within {:?}",
                self.shared.path, timeout
            ))),
        };
        result
    }

    /// Withdraw the candidate. Idempotent.
    ///
    /// Delivers a final `Defunct` state before returning; no callback
    /// follows it. Cleanup is bounded by the operation timeout.
    pub async fn close(&self) {
        {
            let mut delivery = self.shared.delivery.lock().await;
            let reason = if delivery.current.is_leader() {
                DefunctReason::Resigned
            } else {
                DefunctReason::Closed
            };
            self.shared
                .apply(&mut delivery, LeadershipState::Defunct(reason));
        }

        self.cancel.cancel();
        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(supervisor) = supervisor {
            let abort = supervisor.abort_handle();
            if tokio::time::timeout(self.operation_timeout, supervisor).await.is_err() {
                abort.abort();
            }
        }

        self.watcher.shutdown(self.operation_timeout).await;
        self.registration.close().await;
    }
}

impl Drop for Leadership {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.watcher.stop();
    }
}

/// Follow the candidate registration: rank again once it is recreated,
/// and go defunct when it cannot be
async fn supervise(
    mut registration: watch::Receiver<RegistrationState>,
    shared: Arc<Shared>,
    watcher: Arc<ChildWatcher>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            changed = registration.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = registration.borrow_and_update().clone();
                match state {
                    RegistrationState::Registered { .. } => watcher.request_resync(),
                    RegistrationState::Lost => {
                        shared
                            .transition(LeadershipState::Follower { leader: None })
                            .await;
                    }
                    RegistrationState::Failed => {
                        tracing::error!(
                            "Candidate under {} could not be re-registered; leaving election",
                            shared.path
                        );
                        shared
                            .transition(LeadershipState::Defunct(DefunctReason::SessionLost))
                            .await;
                        watcher.stop();
                        break;
                    }
                    RegistrationState::Closed => break,
                }
            }
        }
    }
}

/// Recomputes leadership from each full listing
struct ElectionHandler {
    client: SharedClient,
    path: GroupPath,
    candidate_prefix: String,
    operation_timeout: Duration,
    registration: Arc<Registration>,
    shared: Arc<Shared>,
}

impl ElectionHandler {
    /// Read the leader's advertised instance; `None` if it is gone or unreadable
    async fn read_leader(&self, leader: &ElectionCandidate) -> Result<Option<ServiceInstance>> {
        let full_path = self.path.child(&leader.name);
        let data = match with_timeout(
            self.operation_timeout,
            "get_data",
            self.client.get_data(&full_path),
        )
        .await
        {
            Ok(data) => data,
            // Its deletion fires the watch again
            Err(Error::NoNode(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        match ServiceInstance::decode(&full_path, &data) {
            Ok(instance) => Ok(Some(instance)),
            Err(e) => {
                tracing::warn!("Leader record unreadable: {}", e);
                Ok(None)
            }
        }
    }

    async fn recompute(&self, children: &[String]) -> Result<Option<LeadershipState>> {
        let own = match self.registration.state() {
            RegistrationState::Registered { sequence, .. } => sequence,
            RegistrationState::Lost => {
                return Ok(Some(LeadershipState::Follower { leader: None }));
            }
            // The supervisor owns terminal transitions
            RegistrationState::Failed | RegistrationState::Closed => return Ok(None),
        };

        let candidates = ElectionCandidate::rank(children, &self.candidate_prefix);
        if !candidates.iter().any(|c| c.sequence == own) {
            tracing::warn!(
                "Own candidate missing from {}; stepping down and re-registering",
                self.path
            );
            self.registration.request_recheck();
            return Ok(Some(LeadershipState::Follower { leader: None }));
        }

        // Non-empty: own candidate is present
        let leader = &candidates[0];
        if leader.sequence == own {
            return Ok(Some(LeadershipState::Leader));
        }
        let leader = self.read_leader(leader).await?;
        Ok(Some(LeadershipState::Follower { leader }))
    }
}

#[async_trait]
impl ChildrenHandler for ElectionHandler {
    async fn on_children(&mut self, children: Vec<String>) -> Result<()> {
        if let Some(next) = self.recompute(&children).await? {
            self.shared.transition(next).await;
        }
        Ok(())
    }

    async fn on_session_event(&mut self, event: SessionEvent) {
        match event {
            // Ownership of the lowest node cannot be confirmed until reconnected
            SessionEvent::Disconnected | SessionEvent::Expired => {
                self.shared
                    .transition(LeadershipState::Follower { leader: None })
                    .await;
            }
            SessionEvent::Closed => {
                self.shared
                    .transition(LeadershipState::Defunct(DefunctReason::SessionLost))
                    .await;
            }
            SessionEvent::Connected => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryCoordinator;
    use crate::instance::Endpoint;
    use std::sync::Mutex as StdMutex;

    const WAIT: Duration = Duration::from_secs(5);

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(2),
            max_backoff: Duration::from_millis(20),
            max_attempts: 3,
        }
    }

    fn elector(client: SharedClient) -> LeaderElector {
        LeaderElector::new(
            client,
            AccessList::open_unsafe(),
            GroupPath::new("/election").unwrap(),
            "singleton_candidate_",
            fast_retry(),
            Duration::from_secs(1),
        )
    }

    fn instance(port: u16) -> ServiceInstance {
        ServiceInstance::new(Endpoint::new("host", port))
    }

    fn recorder() -> (Arc<StdMutex<Vec<LeadershipState>>>, impl LeadershipListener) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |state: &LeadershipState| {
            sink.lock().unwrap().push(state.clone())
        })
    }

    #[test]
    fn test_rank_orders_by_sequence_and_filters_prefix() {
        let children = vec![
            "singleton_candidate_0000000012".to_string(),
            "member_0000000001".to_string(),
            "singleton_candidate_0000000003".to_string(),
            "singleton_candidate_bogus".to_string(),
        ];
        let ranked = ElectionCandidate::rank(&children, "singleton_candidate_");
        assert_eq!(
            ranked.iter().map(|c| c.sequence).collect::<Vec<_>>(),
            vec![3, 12]
        );
    }

    #[test]
    fn test_state_display() {
        assert_eq!(LeadershipState::Leader.to_string(), "LEADER");
        assert_eq!(
            LeadershipState::Follower {
                leader: Some(instance(80))
            }
            .to_string(),
            "FOLLOWER(host:80)"
        );
        assert_eq!(
            LeadershipState::Defunct(DefunctReason::Resigned).to_string(),
            "DEFUNCT(RESIGNED)"
        );
    }

    #[tokio::test]
    async fn test_single_candidate_leads_and_resigns() {
        let server = MemoryCoordinator::new();
        let session = Arc::new(server.connect());
        let (seen, listener) = recorder();

        let leadership = elector(session).advertise(&instance(1), listener).await.unwrap();
        leadership.wait_for(WAIT, |s| s.is_leader()).await.unwrap();
        let node = leadership.node().unwrap();

        leadership.close().await;
        leadership.close().await;
        assert!(!server.exists(&node));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                LeadershipState::Leader,
                LeadershipState::Defunct(DefunctReason::Resigned)
            ]
        );
    }

    #[tokio::test]
    async fn test_follower_sees_leader_endpoint() {
        let server = MemoryCoordinator::new();
        let a = elector(Arc::new(server.connect()))
            .advertise(&instance(1), |_: &LeadershipState| {})
            .await
            .unwrap();
        a.wait_for(WAIT, |s| s.is_leader()).await.unwrap();

        let b = elector(Arc::new(server.connect()))
            .advertise(&instance(2), |_: &LeadershipState| {})
            .await
            .unwrap();
        let state = b.wait_for(WAIT, |s| s.leader().is_some()).await.unwrap();
        assert_eq!(state.leader(), Some(&instance(1)));
        assert!(a.is_leader());

        b.close().await;
        assert_eq!(b.state(), LeadershipState::Defunct(DefunctReason::Closed));
        a.close().await;
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_stop_election() {
        let server = MemoryCoordinator::new();
        let leadership = elector(Arc::new(server.connect()))
            .advertise(&instance(1), |_: &LeadershipState| panic!("listener bug"))
            .await
            .unwrap();

        leadership.wait_for(WAIT, |s| s.is_leader()).await.unwrap();
        leadership.close().await;
        assert!(leadership.state().is_defunct());
    }

    #[tokio::test]
    async fn test_missing_own_candidate_steps_down_and_reregisters() {
        let server = MemoryCoordinator::new();
        let (seen, listener) = recorder();
        let leadership = elector(Arc::new(server.connect()))
            .advertise(&instance(1), listener)
            .await
            .unwrap();
        leadership.wait_for(WAIT, |s| s.is_leader()).await.unwrap();

        let first = leadership.node().unwrap();
        server.remove(&first).unwrap();

        tokio::time::timeout(WAIT, async {
            loop {
                let recreated = leadership.node().is_some_and(|node| node != first);
                let regained = seen.lock().unwrap().len() >= 3 && leadership.is_leader();
                if recreated && regained {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                LeadershipState::Leader,
                LeadershipState::Follower { leader: None },
                LeadershipState::Leader,
            ]
        );
        leadership.close().await;
    }

    #[tokio::test]
    async fn test_session_close_makes_elector_defunct() {
        let server = MemoryCoordinator::new();
        let session = Arc::new(server.connect());
        let (seen, listener) = recorder();
        let leadership = elector(session.clone())
            .advertise(&instance(1), listener)
            .await
            .unwrap();
        leadership.wait_for(WAIT, |s| s.is_leader()).await.unwrap();

        session.close();
        leadership
            .wait_for(WAIT, |s| {
                *s == LeadershipState::Defunct(DefunctReason::SessionLost)
            })
            .await
            .unwrap();

        leadership.close().await;
        let seen = seen.lock().unwrap();
        assert_eq!(
            seen.last(),
            Some(&LeadershipState::Defunct(DefunctReason::SessionLost))
        );
        assert_eq!(seen.iter().filter(|s| s.is_defunct()).count(), 1);
    }
}
