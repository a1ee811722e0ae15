//! Service Group Monitor
//!
//! Start/close lifecycle over a server set watch, for consumers that only
//! want the current list of instances.

use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::instance::ServiceInstance;
use crate::state::{HostSetWatch, MembershipSnapshot, ServerSet};

enum Lifecycle {
    Idle,
    Running(Arc<HostSetWatch>),
    Closed,
}

/// Monitors the members of one server set
pub struct GroupMonitor {
    server_set: Arc<ServerSet>,
    lifecycle: Mutex<Lifecycle>,
}

impl GroupMonitor {
    pub fn new(server_set: Arc<ServerSet>) -> Self {
        Self {
            server_set,
            lifecycle: Mutex::new(Lifecycle::Idle),
        }
    }

    fn running(&self) -> Option<Arc<HostSetWatch>> {
        match &*self.lifecycle.lock().unwrap_or_else(|p| p.into_inner()) {
            Lifecycle::Running(watch) => Some(watch.clone()),
            _ => None,
        }
    }

    /// Start watching. Starting twice is a no-op; starting after close fails.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|p| p.into_inner());
        match *lifecycle {
            Lifecycle::Idle => {}
            Lifecycle::Running(_) => return Ok(()),
            Lifecycle::Closed => return Err(Error::Closed),
        }

        tracing::info!("Monitoring server set {}", self.server_set.path());
        *lifecycle = Lifecycle::Running(Arc::new(self.server_set.watch()));
        Ok(())
    }

    /// Current service instances; empty until started
    pub fn get(&self) -> Vec<ServiceInstance> {
        self.snapshot()
            .map(|snapshot| snapshot.instances())
            .unwrap_or_default()
    }

    /// Current snapshot, if started
    pub fn snapshot(&self) -> Option<MembershipSnapshot> {
        self.running().map(|watch| watch.snapshot())
    }

    /// Receiver observing every snapshot change, if started
    pub fn subscribe(&self) -> Option<watch::Receiver<MembershipSnapshot>> {
        self.running().map(|watch| watch.subscribe())
    }

    /// Stop monitoring. Idempotent.
    pub async fn close(&self) {
        let previous = std::mem::replace(
            &mut *self.lifecycle.lock().unwrap_or_else(|p| p.into_inner()),
            Lifecycle::Closed,
        );
        if let Lifecycle::Running(watch) = previous {
            watch.close().await;
            tracing::info!("Stopped monitoring server set {}", self.server_set.path());
        }
    }
}
