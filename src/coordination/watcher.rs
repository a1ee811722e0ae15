//! Persistent Child Watch
//!
//! Turns the coordination service's one-shot child watches into a
//! subscription that stays armed for as long as it runs. Each pass
//! re-lists the path with a fresh watch before handing the full listing
//! to the handler, so a watch is never left unarmed between firings.
//! Passes run one at a time on a single task; changes that land while a
//! pass is in flight fire the freshly armed watch once, which triggers
//! exactly one more pass.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{SessionEvent, SharedClient, WatchReceiver, WatchedEvent};
use crate::error::Result;
use crate::path::GroupPath;
use crate::retry::{Backoff, RetryPolicy};

/// Receives listings and session changes from a [`ChildWatcher`]
#[async_trait]
pub trait ChildrenHandler: Send + 'static {
    /// Handle a full child listing. A transient error makes the watcher
    /// back off and list again.
    async fn on_children(&mut self, children: Vec<String>) -> Result<()>;

    /// Handle a session lifecycle change
    async fn on_session_event(&mut self, event: SessionEvent);
}

/// Placeholder deadline for the disabled fallback branch
const IDLE_RESYNC: Duration = Duration::from_secs(3600);

/// What the watch loop does after waiting
enum Next {
    Resync,
    Stop,
}

/// A self re-arming watch on one path's children
pub struct ChildWatcher {
    path: GroupPath,
    cancel: CancellationToken,
    resync: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ChildWatcher {
    /// Start watching `path`, delivering every listing to `handler`
    pub fn spawn<H: ChildrenHandler>(
        client: SharedClient,
        path: GroupPath,
        retry: RetryPolicy,
        handler: H,
    ) -> Self {
        let cancel = CancellationToken::new();
        let resync = Arc::new(Notify::new());
        // Subscribe before the first listing so no session change is missed
        let events = client.session_events();
        let task = tokio::spawn(watch_loop(
            client,
            path.clone(),
            retry,
            handler,
            events,
            resync.clone(),
            cancel.clone(),
        ));

        Self {
            path,
            cancel,
            resync,
            task: Mutex::new(Some(task)),
        }
    }

    /// Path being watched
    pub fn path(&self) -> &GroupPath {
        &self.path
    }

    /// Ask for one more full pass. Requests made while a pass is in
    /// flight coalesce into a single extra pass.
    pub fn request_resync(&self) {
        self.resync.notify_one();
    }

    /// Ask the watch loop to stop
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Check if the watch loop has been asked to stop
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop the watch loop and wait up to `timeout` for it to finish
    pub async fn shutdown(&self, timeout: Duration) {
        self.stop();
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            let abort = task.abort_handle();
            if tokio::time::timeout(timeout, task).await.is_err() {
                tracing::warn!("Watch on {} did not stop within {:?}; aborting", self.path, timeout);
                abort.abort();
            }
        }
    }
}

impl Drop for ChildWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn fired(watch: &mut Option<WatchReceiver>) -> Option<WatchedEvent> {
    match watch.as_mut() {
        Some(rx) => rx.await.ok(),
        None => std::future::pending().await,
    }
}

async fn watch_loop<H: ChildrenHandler>(
    client: SharedClient,
    path: GroupPath,
    retry: RetryPolicy,
    mut handler: H,
    mut events: tokio::sync::broadcast::Receiver<SessionEvent>,
    resync: Arc<Notify>,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::new(retry);
    let mut passes: u64 = 0;

    tracing::debug!("Watching children of {}", path);

    loop {
        if cancel.is_cancelled() {
            break;
        }

        // Arm the next watch before reading anything
        let outcome = match client.get_children(path.as_str(), true).await {
            Ok(listing) => {
                let watch = listing.watch;
                match handler.on_children(listing.children).await {
                    Ok(()) => {
                        backoff.reset();
                        passes += 1;
                        tracing::trace!("Refreshed {} (pass {})", path, passes);
                        Ok(watch)
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        };

        let next = match outcome {
            Ok(watch) => {
                let signals = Signals {
                    events: &mut events,
                    resync: &resync,
                    cancel: &cancel,
                };
                wait_for_change(&path, watch, &mut handler, signals, &mut backoff).await
            }
            Err(e) => {
                let delay = backoff.next_delay();
                tracing::debug!("Refreshing {} failed: {}; retrying in {:?}", path, e, delay);
                let signals = Signals {
                    events: &mut events,
                    resync: &resync,
                    cancel: &cancel,
                };
                wait_for_retry(delay, &mut handler, signals).await
            }
        };

        if let Next::Stop = next {
            break;
        }
    }

    tracing::debug!("Stopped watching children of {}", path);
}

/// Everything besides the watch itself that can end a wait
struct Signals<'a> {
    events: &'a mut tokio::sync::broadcast::Receiver<SessionEvent>,
    resync: &'a Notify,
    cancel: &'a CancellationToken,
}

/// Wait for the armed watch to fire or for a session change that
/// requires a full resync
async fn wait_for_change<H: ChildrenHandler>(
    path: &GroupPath,
    mut watch: Option<WatchReceiver>,
    handler: &mut H,
    signals: Signals<'_>,
    backoff: &mut Backoff,
) -> Next {
    let Signals {
        events,
        resync,
        cancel,
    } = signals;
    let mut fallback: Option<Duration> = None;

    loop {
        let lost = fallback.unwrap_or(IDLE_RESYNC);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Next::Stop,
            event = events.recv() => {
                match session_change(event, handler).await {
                    Some(next) => return next,
                    None => continue,
                }
            }
            event = fired(&mut watch) => {
                match event {
                    Some(WatchedEvent::ChildrenChanged { .. }) => return Next::Resync,
                    None => {
                        // The service dropped the watch with the session;
                        // resync on reconnect, or after a backoff at the latest
                        tracing::debug!("Watch on {} was discarded", path);
                        watch = None;
                        fallback = Some(backoff.next_delay());
                    }
                }
            }
            _ = resync.notified() => return Next::Resync,
            _ = tokio::time::sleep(lost), if fallback.is_some() => return Next::Resync,
        }
    }
}

/// Sleep before the next attempt, cutting the wait short on reconnection
async fn wait_for_retry<H: ChildrenHandler>(
    delay: Duration,
    handler: &mut H,
    signals: Signals<'_>,
) -> Next {
    let Signals {
        events,
        resync,
        cancel,
    } = signals;
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Next::Stop,
            event = events.recv() => {
                if let Some(next) = session_change(event, handler).await {
                    return next;
                }
            }
            _ = resync.notified() => return Next::Resync,
            _ = &mut sleep => return Next::Resync,
        }
    }
}

/// Forward a session change to the handler and decide whether to resync
async fn session_change<H: ChildrenHandler>(
    event: std::result::Result<SessionEvent, RecvError>,
    handler: &mut H,
) -> Option<Next> {
    match event {
        Ok(event) => {
            handler.on_session_event(event).await;
            match event {
                // Changes during the outage are unrecoverable; list from scratch
                SessionEvent::Connected => Some(Next::Resync),
                SessionEvent::Disconnected | SessionEvent::Expired => None,
                SessionEvent::Closed => Some(Next::Stop),
            }
        }
        Err(RecvError::Lagged(missed)) => {
            tracing::debug!("Missed {} session events; resyncing", missed);
            Some(Next::Resync)
        }
        Err(RecvError::Closed) => {
            handler.on_session_event(SessionEvent::Closed).await;
            Some(Next::Stop)
        }
    }
}
