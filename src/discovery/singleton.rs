//! Singleton Service
//!
//! Leader election combined with server set membership: whichever process
//! leads also joins the server set, so discovery consumers see exactly
//! the current leader. Leadership transitions are applied by one task, in
//! order; the listener hears about leadership only after membership
//! has been adjusted to match it.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::instance::ServiceInstance;
use crate::retry::Backoff;
use crate::state::{
    LeaderElector, Leadership, LeadershipListener, LeadershipState, MembershipHandle, ServerSet,
};

/// Elects one leader and publishes it in the server set
pub struct SingletonService {
    elector: LeaderElector,
    server_set: Arc<ServerSet>,
    operation_timeout: Duration,
}

impl SingletonService {
    pub fn new(elector: LeaderElector, server_set: Arc<ServerSet>, operation_timeout: Duration) -> Self {
        Self {
            elector,
            server_set,
            operation_timeout,
        }
    }

    /// Contend for leadership on behalf of `instance`
    pub async fn lead(
        &self,
        instance: &ServiceInstance,
        listener: impl LeadershipListener,
    ) -> Result<SingletonHandle> {
        let (tx, rx) = mpsc::unbounded_channel();
        let forward = move |state: &LeadershipState| {
            let _ = tx.send(state.clone());
        };
        let leadership = self.elector.advertise(instance, forward).await?;

        let task = tokio::spawn(apply_transitions(
            rx,
            self.server_set.clone(),
            instance.clone(),
            Box::new(listener),
        ));

        Ok(SingletonHandle {
            leadership,
            task: Mutex::new(Some(task)),
            operation_timeout: self.operation_timeout,
        })
    }
}

/// Handle to one contender of a singleton service
pub struct SingletonHandle {
    leadership: Leadership,
    task: Mutex<Option<JoinHandle<()>>>,
    operation_timeout: Duration,
}

impl SingletonHandle {
    pub fn state(&self) -> LeadershipState {
        self.leadership.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<LeadershipState> {
        self.leadership.subscribe()
    }

    pub fn is_leader(&self) -> bool {
        self.leadership.is_leader()
    }

    /// Underlying election handle
    pub fn leadership(&self) -> &Leadership {
        &self.leadership
    }

    /// Resign, leave the server set and stop. Idempotent.
    pub async fn close(&self) {
        self.leadership.close().await;

        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            let abort = task.abort_handle();
            // Leaving the set is itself bounded by the operation timeout
            if tokio::time::timeout(self.operation_timeout * 2, task)
                .await
                .is_err()
            {
                tracing::warn!("Singleton shutdown timed out; abandoning membership cleanup");
                abort.abort();
            }
        }
    }
}

/// Outcome of publishing a freshly elected leader
enum Publish {
    Joined(MembershipHandle),
    /// Leadership changed before a join succeeded
    Superseded(Option<LeadershipState>),
}

async fn apply_transitions(
    mut transitions: mpsc::UnboundedReceiver<LeadershipState>,
    server_set: Arc<ServerSet>,
    instance: ServiceInstance,
    listener: Box<dyn LeadershipListener>,
) {
    let mut membership: Option<MembershipHandle> = None;
    let mut pending: Option<LeadershipState> = None;

    loop {
        let state = match pending.take() {
            Some(state) => state,
            None => match transitions.recv().await {
                Some(state) => state,
                None => break,
            },
        };

        match &state {
            LeadershipState::Leader if membership.is_none() => {
                match publish(&server_set, &instance, &mut transitions).await {
                    Publish::Joined(handle) => membership = Some(handle),
                    // Still report the leadership the elector saw, then
                    // apply whatever replaced it
                    Publish::Superseded(next) => pending = next,
                }
            }
            LeadershipState::Leader => {}
            _ => {
                if let Some(handle) = membership.take() {
                    handle.close().await;
                }
            }
        }

        notify(listener.as_ref(), &state);

        if state.is_defunct() {
            break;
        }
    }

    if let Some(handle) = membership.take() {
        handle.close().await;
    }
}

/// Join the server set, retrying for as long as leadership holds
async fn publish(
    server_set: &ServerSet,
    instance: &ServiceInstance,
    transitions: &mut mpsc::UnboundedReceiver<LeadershipState>,
) -> Publish {
    let mut backoff = Backoff::new(server_set.retry_policy().clone());

    loop {
        let error = match server_set.join(instance).await {
            Ok(handle) => return Publish::Joined(handle),
            Err(e) if e.is_retryable() => e,
            Err(e) => {
                tracing::error!(
                    "Leading {} but cannot join the server set: {}",
                    server_set.path(),
                    e
                );
                return Publish::Superseded(transitions.recv().await);
            }
        };

        let delay = backoff.next_delay();
        tracing::warn!(
            "Leading {} but failed to join the server set: {}; retrying in {:?}",
            server_set.path(),
            error,
            delay
        );
        tokio::select! {
            next = transitions.recv() => return Publish::Superseded(next),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

fn notify(listener: &dyn LeadershipListener, state: &LeadershipState) {
    if catch_unwind(AssertUnwindSafe(|| listener.on_leadership_change(state))).is_err() {
        tracing::error!("Singleton listener panicked handling {}", state);
    }
}
