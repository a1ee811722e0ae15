//! In-Memory Coordination Service
//!
//! A single-process stand-in for a hierarchical coordination service:
//! persistent and ephemeral nodes, per-parent sequence counters, one-shot
//! child watches and client sessions that can be disconnected, expired,
//! renewed and closed on demand. Used by the test suite and the
//! `simulate` command.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{broadcast, oneshot};

use super::{ChildListing, CoordinationClient, SessionEvent, WatchedEvent};
use crate::acl::AccessList;
use crate::error::{Error, Result};
use crate::path::sequential_name;

/// Capacity of each client's session event channel
const SESSION_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionStatus {
    Connected,
    Disconnected,
    Expired,
    Closed,
}

struct Node {
    data: Vec<u8>,
    acl: AccessList,
    /// Session that owns this node, for ephemeral nodes
    ephemeral_owner: Option<u64>,
    /// Next sequence number handed to a sequential child
    child_sequence: u64,
}

impl Node {
    fn new(data: Vec<u8>, acl: AccessList, ephemeral_owner: Option<u64>) -> Self {
        Self {
            data,
            acl,
            ephemeral_owner,
            child_sequence: 0,
        }
    }
}

struct ChildWatchEntry {
    client: u64,
    tx: oneshot::Sender<WatchedEvent>,
}

struct ClientRecord {
    session: u64,
    status: SessionStatus,
    events: broadcast::Sender<SessionEvent>,
}

struct Tree {
    nodes: BTreeMap<String, Node>,
    child_watches: HashMap<String, Vec<ChildWatchEntry>>,
    clients: HashMap<u64, ClientRecord>,
    next_client: u64,
    next_session: u64,
    available: bool,
}

fn parent_of(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    }
}

impl Tree {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::new(Vec::new(), AccessList::open_unsafe(), None));
        Self {
            nodes,
            child_watches: HashMap::new(),
            clients: HashMap::new(),
            next_client: 1,
            next_session: 1,
            available: true,
        }
    }

    /// Validate that `client` may issue a request, returning its session id
    fn check(&self, client: u64) -> Result<u64> {
        if !self.available {
            return Err(Error::CoordinationUnavailable(
                "coordination service unreachable".into(),
            ));
        }
        let record = self.clients.get(&client).ok_or(Error::Closed)?;
        match record.status {
            SessionStatus::Connected => Ok(record.session),
            SessionStatus::Disconnected => {
                Err(Error::CoordinationUnavailable("connection lost".into()))
            }
            SessionStatus::Expired => Err(Error::SessionExpired),
            SessionStatus::Closed => Err(Error::Closed),
        }
    }

    fn children_of(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn fire_child_watches(&mut self, parent: &str) {
        if let Some(watches) = self.child_watches.remove(parent) {
            for watch in watches {
                let _ = watch.tx.send(WatchedEvent::ChildrenChanged {
                    path: parent.to_string(),
                });
            }
        }
    }

    fn insert(&mut self, path: String, node: Node) {
        let parent = parent_of(&path).to_string();
        self.nodes.insert(path, node);
        self.fire_child_watches(&parent);
    }

    fn remove(&mut self, path: &str) -> Option<Node> {
        let node = self.nodes.remove(path)?;
        self.fire_child_watches(parent_of(path));
        Some(node)
    }

    fn create_sequential(
        &mut self,
        path_prefix: &str,
        data: &[u8],
        acl: &AccessList,
        ephemeral_owner: Option<u64>,
    ) -> Result<String> {
        let parent_path = parent_of(path_prefix);
        let parent = self
            .nodes
            .get_mut(parent_path)
            .ok_or_else(|| Error::NoNode(parent_path.to_string()))?;
        let sequence = parent.child_sequence;
        parent.child_sequence += 1;

        let path = sequential_name(path_prefix, sequence);
        self.insert(path.clone(), Node::new(data.to_vec(), acl.clone(), ephemeral_owner));
        Ok(path)
    }

    /// Drop every ephemeral node owned by `session`
    fn remove_ephemerals(&mut self, session: u64) {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned {
            self.remove(&path);
        }
    }

    /// Drop every watch armed by `client`, closing its receivers
    fn remove_watches(&mut self, client: u64) {
        for watches in self.child_watches.values_mut() {
            watches.retain(|watch| watch.client != client);
        }
        self.child_watches.retain(|_, watches| !watches.is_empty());
    }

    fn set_status(&mut self, client: u64, status: SessionStatus, event: SessionEvent) {
        if let Some(record) = self.clients.get_mut(&client) {
            record.status = status;
            let _ = record.events.send(event);
        }
    }
}

/// Shared in-memory coordination service
#[derive(Clone)]
pub struct MemoryCoordinator {
    inner: Arc<Mutex<Tree>>,
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordinator {
    /// Create an empty service containing only the root node
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Tree::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tree> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open a new client with a fresh, connected session
    pub fn connect(&self) -> MemorySession {
        let mut tree = self.lock();
        let client = tree.next_client;
        tree.next_client += 1;
        let session = tree.next_session;
        tree.next_session += 1;

        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        tree.clients.insert(
            client,
            ClientRecord {
                session,
                status: SessionStatus::Connected,
                events,
            },
        );

        MemorySession {
            server: self.clone(),
            client,
        }
    }

    /// Make every request fail as if the service could not be reached
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// Check if a node exists
    pub fn exists(&self, path: &str) -> bool {
        self.lock().nodes.contains_key(path)
    }

    /// Child names of `path`, sorted
    pub fn children(&self, path: &str) -> Vec<String> {
        self.lock().children_of(path)
    }

    /// Data stored at a node
    pub fn data(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().nodes.get(path).map(|node| node.data.clone())
    }

    /// Access list a node was created with
    pub fn acl(&self, path: &str) -> Option<AccessList> {
        self.lock().nodes.get(path).map(|node| node.acl.clone())
    }

    /// Number of child watches currently armed on `path`
    pub fn armed_watches(&self, path: &str) -> usize {
        self.lock().child_watches.get(path).map_or(0, |watches| {
            watches.iter().filter(|entry| !entry.tx.is_closed()).count()
        })
    }

    /// Create a persistent sequential node outside any session
    pub fn create_persistent_sequential(&self, path_prefix: &str, data: &[u8]) -> Result<String> {
        self.lock()
            .create_sequential(path_prefix, data, &AccessList::open_unsafe(), None)
    }

    /// Delete a node outside any session
    pub fn remove(&self, path: &str) -> Result<()> {
        self.lock()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| Error::NoNode(path.to_string()))
    }
}

/// One client's connection to a [`MemoryCoordinator`]
pub struct MemorySession {
    server: MemoryCoordinator,
    client: u64,
}

impl MemorySession {
    /// Current session id
    pub fn session_id(&self) -> Option<u64> {
        self.server
            .lock()
            .clients
            .get(&self.client)
            .map(|record| record.session)
    }

    /// Lose the connection without losing the session
    pub fn disconnect(&self) {
        let mut tree = self.server.lock();
        tree.set_status(self.client, SessionStatus::Disconnected, SessionEvent::Disconnected);
    }

    /// Resume the existing session after a disconnect
    pub fn reconnect(&self) {
        let mut tree = self.server.lock();
        tree.set_status(self.client, SessionStatus::Connected, SessionEvent::Connected);
    }

    /// Expire the session: its ephemeral nodes and watches are discarded
    pub fn expire(&self) {
        let mut tree = self.server.lock();
        let Some(session) = tree.clients.get(&self.client).map(|record| record.session) else {
            return;
        };
        tree.remove_watches(self.client);
        tree.remove_ephemerals(session);
        tree.set_status(self.client, SessionStatus::Expired, SessionEvent::Expired);
    }

    /// Establish a fresh session after expiry
    pub fn renew(&self) {
        let mut tree = self.server.lock();
        let session = tree.next_session;
        tree.next_session += 1;
        if let Some(record) = tree.clients.get_mut(&self.client) {
            record.session = session;
        }
        tree.set_status(self.client, SessionStatus::Connected, SessionEvent::Connected);
    }

    /// Expire the session and immediately start a new one
    pub fn expire_and_renew(&self) {
        self.expire();
        self.renew();
    }

    /// Close the session for good
    pub fn close(&self) {
        let mut tree = self.server.lock();
        let Some(session) = tree.clients.get(&self.client).map(|record| record.session) else {
            return;
        };
        tree.remove_watches(self.client);
        tree.remove_ephemerals(session);
        tree.set_status(self.client, SessionStatus::Closed, SessionEvent::Closed);
    }
}

#[async_trait]
impl CoordinationClient for MemorySession {
    async fn ensure_path(&self, path: &str, acl: &AccessList) -> Result<()> {
        let mut tree = self.server.lock();
        tree.check(self.client)?;

        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            if !tree.nodes.contains_key(&current) {
                tree.insert(current.clone(), Node::new(Vec::new(), acl.clone(), None));
            }
        }
        Ok(())
    }

    async fn create_ephemeral_sequential(
        &self,
        path_prefix: &str,
        data: &[u8],
        acl: &AccessList,
    ) -> Result<String> {
        let mut tree = self.server.lock();
        let session = tree.check(self.client)?;
        tree.create_sequential(path_prefix, data, acl, Some(session))
    }

    async fn get_children(&self, path: &str, watch: bool) -> Result<ChildListing> {
        let mut tree = self.server.lock();
        tree.check(self.client)?;
        if !tree.nodes.contains_key(path) {
            return Err(Error::NoNode(path.to_string()));
        }

        let children = tree.children_of(path);
        let watch = watch.then(|| {
            let (tx, rx) = oneshot::channel();
            let watches = tree.child_watches.entry(path.to_string()).or_default();
            // Re-listing supersedes this client's abandoned watches
            watches.retain(|entry| entry.client != self.client || !entry.tx.is_closed());
            watches.push(ChildWatchEntry {
                client: self.client,
                tx,
            });
            rx
        });

        Ok(ChildListing { children, watch })
    }

    async fn get_data(&self, path: &str) -> Result<Vec<u8>> {
        let tree = self.server.lock();
        tree.check(self.client)?;
        tree.nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or_else(|| Error::NoNode(path.to_string()))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let mut tree = self.server.lock();
        tree.check(self.client)?;
        tree.remove(path)
            .map(|_| ())
            .ok_or_else(|| Error::NoNode(path.to_string()))
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        let tree = self.server.lock();
        match tree.clients.get(&self.client) {
            Some(record) => record.events.subscribe(),
            None => broadcast::channel(1).1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_relisting_replaces_abandoned_watches() {
        let server = MemoryCoordinator::new();
        let session = server.connect();
        session
            .ensure_path("/group", &AccessList::open_unsafe())
            .await
            .unwrap();

        for _ in 0..10 {
            let listing = session.get_children("/group", true).await.unwrap();
            drop(listing.watch);
        }
        let held = session.get_children("/group", true).await.unwrap();
        assert_eq!(server.lock().child_watches["/group"].len(), 1);

        // Live watches of other clients and of this one are kept
        let other = server.connect();
        let other_listing = other.get_children("/group", true).await.unwrap();
        let second = session.get_children("/group", true).await.unwrap();
        assert_eq!(server.lock().child_watches["/group"].len(), 3);
        assert_eq!(server.armed_watches("/group"), 3);

        drop((held, other_listing, second));
        assert_eq!(server.armed_watches("/group"), 0);
    }

    #[tokio::test]
    async fn test_sequential_names_increase_per_parent() {
        let server = MemoryCoordinator::new();
        let session = server.connect();
        let acl = AccessList::open_unsafe();

        session.ensure_path("/aurora/scheduler", &acl).await.unwrap();
        let a = session
            .create_ephemeral_sequential("/aurora/scheduler/member_", b"a", &acl)
            .await
            .unwrap();
        let b = session
            .create_ephemeral_sequential("/aurora/scheduler/singleton_candidate_", b"b", &acl)
            .await
            .unwrap();

        assert_eq!(a, "/aurora/scheduler/member_0000000000");
        assert_eq!(b, "/aurora/scheduler/singleton_candidate_0000000001");
        assert_eq!(
            server.children("/aurora/scheduler"),
            vec!["member_0000000000", "singleton_candidate_0000000001"]
        );
        assert_eq!(server.children("/"), vec!["aurora"]);
    }

    #[tokio::test]
    async fn test_create_requires_parent() {
        let server = MemoryCoordinator::new();
        let session = server.connect();
        let err = session
            .create_ephemeral_sequential("/missing/member_", b"", &AccessList::open_unsafe())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoNode(path) if path == "/missing"));
    }

    #[tokio::test]
    async fn test_child_watch_is_one_shot() {
        let server = MemoryCoordinator::new();
        let session = server.connect();
        let acl = AccessList::open_unsafe();
        session.ensure_path("/group", &acl).await.unwrap();

        let listing = session.get_children("/group", true).await.unwrap();
        assert!(listing.children.is_empty());
        assert_eq!(server.armed_watches("/group"), 1);

        session
            .create_ephemeral_sequential("/group/member_", b"", &acl)
            .await
            .unwrap();
        let event = listing.watch.unwrap().await.unwrap();
        assert_eq!(event, WatchedEvent::ChildrenChanged { path: "/group".into() });

        // Fired watches are gone until re-armed
        assert_eq!(server.armed_watches("/group"), 0);
    }

    #[tokio::test]
    async fn test_expiry_removes_ephemerals_and_watches() {
        let server = MemoryCoordinator::new();
        let owner = server.connect();
        let observer = server.connect();
        let acl = AccessList::open_unsafe();
        owner.ensure_path("/group", &acl).await.unwrap();

        let node = owner
            .create_ephemeral_sequential("/group/member_", b"", &acl)
            .await
            .unwrap();
        let owner_watch = owner.get_children("/group", true).await.unwrap().watch.unwrap();
        let observer_watch = observer.get_children("/group", true).await.unwrap().watch.unwrap();

        let mut events = owner.session_events();
        let old_session = owner.session_id();
        owner.expire();

        assert!(!server.exists(&node));
        assert!(server.exists("/group"));
        assert!(owner_watch.await.is_err());
        assert!(observer_watch.await.is_ok());
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Expired);
        assert!(matches!(
            owner.get_data("/group").await,
            Err(Error::SessionExpired)
        ));

        owner.renew();
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Connected);
        assert_ne!(owner.session_id(), old_session);
        assert!(owner.get_data("/group").await.is_ok());
    }

    #[tokio::test]
    async fn test_disconnect_keeps_session() {
        let server = MemoryCoordinator::new();
        let session = server.connect();
        let acl = AccessList::open_unsafe();
        session.ensure_path("/group", &acl).await.unwrap();
        let node = session
            .create_ephemeral_sequential("/group/member_", b"", &acl)
            .await
            .unwrap();

        session.disconnect();
        assert!(matches!(
            session.get_data(&node).await,
            Err(Error::CoordinationUnavailable(_))
        ));
        assert!(server.exists(&node));

        session.reconnect();
        assert!(session.get_data(&node).await.is_ok());
    }

    #[tokio::test]
    async fn test_unavailable_service() {
        let server = MemoryCoordinator::new();
        let session = server.connect();
        server.set_available(false);
        let err = session
            .ensure_path("/group", &AccessList::open_unsafe())
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        server.set_available(true);
        assert!(session.ensure_path("/group", &AccessList::open_unsafe()).await.is_ok());
    }

    #[tokio::test]
    async fn test_acl_stored_verbatim() {
        let server = MemoryCoordinator::new();
        let session = server.connect();
        let acl = AccessList::everyone_read_creator_all();
        session.ensure_path("/secure", &acl).await.unwrap();
        let node = session
            .create_ephemeral_sequential("/secure/member_", b"", &acl)
            .await
            .unwrap();
        assert_eq!(server.acl(&node), Some(acl.clone()));
        assert_eq!(server.acl("/secure"), Some(acl));
    }
}
