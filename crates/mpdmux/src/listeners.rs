//! Subsystem change listeners
//!
//! Both watcher loops push changed subsystem names into one dispatch queue.
//! A single dispatcher task drains that queue and fans each name out to the
//! registered listeners whose filter matches, so slow listeners never hold
//! up a watch loop and notifications keep their wire order.
//!
//! When the idle watcher dies, or the client closes, the registry is
//! terminated: every sender is dropped, so each listener's `recv` ends with
//! the watcher's `LoopTerminated` error (or `Closed`), and listeners
//! registered afterwards end immediately.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{ClientError, ConnectionRole, LoopFailure};

/// Per-listener channel capacity
pub const DEFAULT_CHANNEL_BUFFER: usize = 64;

#[derive(Debug)]
struct Entry {
    sender: mpsc::Sender<String>,
    filter: HashSet<String>,
    active: Arc<AtomicBool>,
}

impl Entry {
    fn wants(&self, subsystem: &str) -> bool {
        self.filter.is_empty() || self.filter.contains(subsystem)
    }

    fn is_live(&self) -> bool {
        self.active.load(Ordering::Acquire) && !self.sender.is_closed()
    }
}

#[derive(Debug, Default)]
struct Entries {
    list: Vec<Entry>,
    terminated: bool,
}

/// Lock-guarded set of listeners shared by the client and the dispatcher
#[derive(Debug, Clone)]
pub(crate) struct ListenerRegistry {
    entries: Arc<Mutex<Entries>>,
    failure: LoopFailure,
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new(LoopFailure::new(ConnectionRole::IdleWatch))
    }
}

impl ListenerRegistry {
    /// A registry whose listeners report `failure` once it is terminated
    pub(crate) fn new(failure: LoopFailure) -> Self {
        Self {
            entries: Arc::default(),
            failure,
        }
    }

    /// Register interest in `subsystems`; an empty set means every subsystem
    pub(crate) fn register<I, S>(&self, subsystems: I) -> IdleListener
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let filter: HashSet<String> = subsystems.into_iter().map(Into::into).collect();
        let (sender, receiver) = mpsc::channel(DEFAULT_CHANNEL_BUFFER);
        let active = Arc::new(AtomicBool::new(true));

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.terminated {
            // The sender is dropped here, so `recv` ends straight away
            debug!(?filter, "Registered idle listener after termination");
        } else {
            entries.list.push(Entry {
                sender,
                filter: filter.clone(),
                active: Arc::clone(&active),
            });
            debug!(listeners = entries.list.len(), ?filter, "Registered idle listener");
        }

        IdleListener {
            receiver,
            active,
            filter,
            failure: self.failure.clone(),
        }
    }

    /// Drop every sender and refuse new ones. Idempotent.
    ///
    /// Buffered notifications stay readable; after them each listener gets
    /// its terminal error.
    pub(crate) fn terminate(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.terminated = true;
        let dropped = std::mem::take(&mut entries.list).len();
        debug!(listeners = dropped, "Listener registry terminated");
    }

    /// Senders of every live listener interested in `subsystem`.
    ///
    /// Closed listeners are pruned while the lock is held.
    fn matching(&self, subsystem: &str) -> Vec<(mpsc::Sender<String>, Arc<AtomicBool>)> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.list.retain(Entry::is_live);
        entries
            .list
            .iter()
            .filter(|entry| entry.wants(subsystem))
            .map(|entry| (entry.sender.clone(), Arc::clone(&entry.active)))
            .collect()
    }

    /// Deliver `subsystem` to every matching listener.
    ///
    /// Each send waits for room in that listener's buffer.
    pub(crate) async fn dispatch(&self, subsystem: &str) {
        let targets = self.matching(subsystem);
        trace!(subsystem, targets = targets.len(), "Dispatching change");

        for (sender, active) in targets {
            if !active.load(Ordering::Acquire) {
                continue;
            }
            // A listener closed mid-dispatch just drops the name
            let _ = sender.send(subsystem.to_string()).await;
        }
    }

    /// Number of listeners that have not been closed
    pub(crate) fn active_count(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.list.iter().filter(|entry| entry.is_live()).count()
    }
}

/// Drain `events` into the registry until every watcher has hung up
pub(crate) async fn run_dispatcher(
    registry: ListenerRegistry,
    mut events: mpsc::UnboundedReceiver<String>,
) {
    while let Some(subsystem) = events.recv().await {
        registry.dispatch(&subsystem).await;
    }
    debug!("Dispatcher stopped");
}

/// A registered interest in subsystem changes.
///
/// Notifications are delivered by one dispatcher shared by every listener:
/// a holder that stops reading without closing the handle stalls delivery
/// to all the others once its buffer fills. Keep draining it, or close it.
///
/// Dropping the handle closes it.
#[derive(Debug)]
pub struct IdleListener {
    receiver: mpsc::Receiver<String>,
    active: Arc<AtomicBool>,
    filter: HashSet<String>,
    failure: LoopFailure,
}

impl IdleListener {
    /// Wait for the next changed subsystem.
    ///
    /// # Errors
    ///
    /// `ClientError::Closed` once this listener or the client is closed, and
    /// `ClientError::LoopTerminated` once the idle watcher has died.
    pub async fn recv(&mut self) -> Result<String, ClientError> {
        if !self.is_active() {
            return Err(ClientError::Closed);
        }
        match self.receiver.recv().await {
            Some(subsystem) => Ok(subsystem),
            None => Err(self.terminal_error()),
        }
    }

    fn terminal_error(&self) -> ClientError {
        if self.is_active() {
            self.failure.error_or_closed()
        } else {
            ClientError::Closed
        }
    }

    /// Take a pending notification without waiting
    pub fn try_recv(&mut self) -> Option<String> {
        if !self.is_active() {
            return None;
        }
        self.receiver.try_recv().ok()
    }

    /// Stop receiving notifications. Idempotent.
    ///
    /// Anything already buffered is discarded, so nothing is observed after
    /// this returns.
    pub fn close(&mut self) {
        self.active.store(false, Ordering::Release);
        self.receiver.close();
        while self.receiver.try_recv().is_ok() {}
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// The subsystems this listener filters on; empty means all
    pub fn subsystems(&self) -> &HashSet<String> {
        &self.filter
    }
}

impl Drop for IdleListener {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
    }
}
