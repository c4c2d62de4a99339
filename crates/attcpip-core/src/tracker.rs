//! Correlation of issued commands with their replies.
//!
//! Each issued command gets a pending entry keyed by correlation id. The
//! entry owns a oneshot sender for the terminal result, a watch sender for
//! intermediate status and a deadline timer. Whoever removes the entry from
//! the map is the only party allowed to complete it, which is what makes
//! resolution, timeout, cancellation and disconnect mutually exclusive.
//! Expiry belongs to the tracker, so an entry whose handle was dropped or
//! never awaited still goes away at its deadline.

use crate::error::{CommandError, CoreError, CoreResult};
use attcpip_protocol::{CommandOutcome, CommandStatus, CorrelationId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

type Completion = Result<CommandOutcome, CommandError>;

struct PendingEntry {
    name: String,
    issued_at: Instant,
    timeout: Duration,
    status: watch::Sender<Option<CommandStatus>>,
    completion: oneshot::Sender<Completion>,
    timer: AbortHandle,
}

impl PendingEntry {
    fn complete(self, id: CorrelationId, result: Completion) {
        self.timer.abort();
        if let Ok(outcome) = &result {
            self.status.send_replace(Some(outcome.status));
        }
        if self.completion.send(result).is_err() {
            debug!(correlation_id = %id, command = %self.name, "Nobody waiting for command result");
        }
    }
}

/// What [`CommandTracker::resolve`] did with a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// No pending command has this id.
    Unmatched,
    /// ACK or NOACK recorded; the command is still pending.
    Updated { name: String },
    /// Terminal reply delivered; the entry is gone.
    Resolved { name: String },
}

struct TrackerInner {
    pending: Mutex<HashMap<CorrelationId, PendingEntry>>,
    next_id: AtomicU64,
}

impl Drop for TrackerInner {
    fn drop(&mut self) {
        for entry in self.pending.get_mut().values() {
            entry.timer.abort();
        }
    }
}

/// Registry of in-flight commands. Cheap to clone.
#[derive(Clone)]
pub struct CommandTracker {
    inner: Arc<TrackerInner>,
}

impl Default for CommandTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a command under the next correlation id.
    pub fn issue(&self, name: &str, timeout: Duration) -> CoreResult<PendingCommandHandle> {
        let id = CorrelationId::new(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        self.register(id, name, timeout)
    }

    /// Register a command under a caller-chosen id.
    ///
    /// Starts the deadline timer, so it must run inside a Tokio runtime.
    pub fn register(
        &self,
        id: CorrelationId,
        name: &str,
        timeout: Duration,
    ) -> CoreResult<PendingCommandHandle> {
        let (completion_tx, completion_rx) = oneshot::channel();
        let (status_tx, status_rx) = watch::channel(None);
        let issued_at = Instant::now();

        {
            let mut pending = self.inner.pending.lock();
            if pending.contains_key(&id) {
                return Err(CoreError::DuplicateCorrelation(id));
            }
            // Spawned under the lock: the timer cannot look for the entry
            // before it is inserted.
            let timer = tokio::spawn(expire_at(
                Arc::downgrade(&self.inner),
                id,
                issued_at + timeout,
            ));
            pending.insert(
                id,
                PendingEntry {
                    name: name.to_string(),
                    issued_at,
                    timeout,
                    status: status_tx,
                    completion: completion_tx,
                    timer: timer.abort_handle(),
                },
            );
        }

        debug!(correlation_id = %id, command = name, ?timeout, "Registered pending command");

        Ok(PendingCommandHandle {
            id,
            name: name.to_string(),
            timeout,
            status: status_rx,
            completion: completion_rx,
        })
    }

    /// Apply a reply to its pending command.
    pub fn resolve(&self, id: CorrelationId, outcome: CommandOutcome) -> Resolution {
        self.resolve_then(id, outcome, |_| {})
    }

    /// Like [`resolve`](Self::resolve), but a matched terminal reply first
    /// runs `before_wake` with the command name, after the entry is removed
    /// and before the waiter is woken. `before_wake` runs under the map lock
    /// and must not touch the tracker.
    pub fn resolve_then(
        &self,
        id: CorrelationId,
        outcome: CommandOutcome,
        before_wake: impl FnOnce(&str),
    ) -> Resolution {
        let mut pending = self.inner.pending.lock();

        if !outcome.status.is_terminal() {
            let Some(entry) = pending.get(&id) else {
                drop(pending);
                warn!(correlation_id = %id, status = %outcome.status, "Reply for unknown command, dropping");
                return Resolution::Unmatched;
            };
            entry.status.send_replace(Some(outcome.status));
            if outcome.status == CommandStatus::Noack {
                warn!(
                    correlation_id = %id,
                    command = %entry.name,
                    reason = outcome.message.as_deref().unwrap_or(""),
                    "Command not acknowledged"
                );
            }
            return Resolution::Updated {
                name: entry.name.clone(),
            };
        }

        let Some(entry) = pending.remove(&id) else {
            drop(pending);
            warn!(correlation_id = %id, status = %outcome.status, "Terminal reply for unknown command, dropping");
            return Resolution::Unmatched;
        };
        let name = entry.name.clone();
        debug!(
            correlation_id = %id,
            command = %name,
            status = %outcome.status,
            elapsed_ms = entry.issued_at.elapsed().as_millis() as u64,
            "Command resolved"
        );
        before_wake(&name);
        // Completed under the lock so a racing timeout sees either the entry
        // or the sent result.
        entry.complete(id, Ok(outcome));
        Resolution::Resolved { name }
    }

    /// Remove a pending command; its waiter receives `Cancelled`.
    pub fn cancel(&self, id: CorrelationId) -> bool {
        let mut pending = self.inner.pending.lock();
        match pending.remove(&id) {
            Some(entry) => {
                debug!(correlation_id = %id, command = %entry.name, "Command cancelled");
                entry.complete(id, Err(CommandError::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Fail every pending command with `Disconnected`. Returns how many.
    pub fn fail_all(&self, reason: &str) -> usize {
        let mut pending = self.inner.pending.lock();
        let count = pending.len();
        for (id, entry) in pending.drain() {
            entry.complete(
                id,
                Err(CommandError::Disconnected {
                    reason: reason.to_string(),
                }),
            );
        }
        count
    }

    /// Resolve matching pending commands as FAILED with `message`.
    pub fn fail_where(
        &self,
        predicate: impl Fn(CorrelationId, &str) -> bool,
        message: &str,
    ) -> usize {
        let mut pending = self.inner.pending.lock();
        let ids: Vec<CorrelationId> = pending
            .iter()
            .filter(|(id, entry)| predicate(**id, &entry.name))
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(entry) = pending.remove(id) {
                entry.complete(*id, Ok(CommandOutcome::failed(message)));
            }
        }
        ids.len()
    }

    /// Whether `id` is still awaiting a terminal reply.
    pub fn is_pending(&self, id: CorrelationId) -> bool {
        self.inner.pending.lock().contains_key(&id)
    }

    /// Number of commands awaiting a terminal reply.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Wait for a command to finish. Same as [`PendingCommandHandle::wait`].
    pub async fn wait(&self, handle: PendingCommandHandle) -> Result<CommandOutcome, CommandError> {
        handle.wait().await
    }
}

/// Deadline timer of one pending entry.
async fn expire_at(inner: Weak<TrackerInner>, id: CorrelationId, deadline: Instant) {
    tokio::time::sleep_until(deadline).await;
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let Some(entry) = inner.pending.lock().remove(&id) else {
        return;
    };
    warn!(
        correlation_id = %id,
        command = %entry.name,
        timeout = ?entry.timeout,
        "Command timed out"
    );
    let timeout = entry.timeout;
    entry.complete(id, Err(CommandError::Timeout { timeout }));
}

/// Caller's view of one pending command.
pub struct PendingCommandHandle {
    id: CorrelationId,
    name: String,
    timeout: Duration,
    status: watch::Receiver<Option<CommandStatus>>,
    completion: oneshot::Receiver<Completion>,
}

impl PendingCommandHandle {
    pub fn correlation_id(&self) -> CorrelationId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Latest status reported by the remote, `None` before the first reply.
    pub fn status(&self) -> Option<CommandStatus> {
        *self.status.borrow()
    }

    /// Watch intermediate status changes.
    pub fn watch_status(&self) -> watch::Receiver<Option<CommandStatus>> {
        self.status.clone()
    }

    /// Wait for the terminal reply or the timeout, whichever comes first.
    ///
    /// The timeout runs from issue time and is enforced by the tracker
    /// whether or not anyone waits. After expiry a late reply is unmatched.
    pub async fn wait(self) -> Result<CommandOutcome, CommandError> {
        self.completion.await.unwrap_or(Err(CommandError::Cancelled))
    }
}

impl std::fmt::Debug for PendingCommandHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCommandHandle")
            .field("correlation_id", &self.id)
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack() -> CommandOutcome {
        CommandOutcome::new(CommandStatus::Ack, None)
    }

    #[tokio::test]
    async fn test_ids_start_at_one_and_increase() {
        let tracker = CommandTracker::new();
        let first = tracker.issue("start", Duration::from_secs(1)).unwrap();
        let second = tracker.issue("enable", Duration::from_secs(1)).unwrap();
        assert_eq!(first.correlation_id(), CorrelationId::new(1));
        assert_eq!(second.correlation_id(), CorrelationId::new(2));
        assert_eq!(tracker.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_registration_fails() {
        let tracker = CommandTracker::new();
        let _handle = tracker
            .register(CorrelationId::new(7), "status", Duration::from_secs(1))
            .unwrap();
        let err = tracker
            .register(CorrelationId::new(7), "status", Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, CoreError::DuplicateCorrelation(id) if id == CorrelationId::new(7)));
    }

    #[tokio::test]
    async fn test_ack_updates_status_without_resolving() {
        let tracker = CommandTracker::new();
        let handle = tracker.issue("start", Duration::from_secs(1)).unwrap();
        let id = handle.correlation_id();

        assert_eq!(handle.status(), None);
        let resolution = tracker.resolve(id, ack());
        assert_eq!(resolution, Resolution::Updated { name: "start".to_string() });
        assert_eq!(handle.status(), Some(CommandStatus::Ack));
        assert!(tracker.is_pending(id));

        tracker.resolve(id, CommandOutcome::complete());
        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome.status, CommandStatus::Complete);
        assert!(!tracker.is_pending(id));
    }

    #[tokio::test]
    async fn test_noack_is_not_terminal() {
        let tracker = CommandTracker::new();
        let handle = tracker.issue("start", Duration::from_secs(1)).unwrap();
        let id = handle.correlation_id();

        tracker.resolve(id, CommandOutcome::new(CommandStatus::Noack, Some("busy".into())));
        assert_eq!(handle.status(), Some(CommandStatus::Noack));
        assert!(tracker.is_pending(id));
    }

    #[tokio::test]
    async fn test_second_terminal_reply_is_unmatched() {
        let tracker = CommandTracker::new();
        let handle = tracker.issue("enable", Duration::from_secs(1)).unwrap();
        let id = handle.correlation_id();

        assert!(matches!(
            tracker.resolve(id, CommandOutcome::complete()),
            Resolution::Resolved { .. }
        ));
        assert_eq!(
            tracker.resolve(id, CommandOutcome::failed("late")),
            Resolution::Unmatched
        );
        let outcome = handle.wait().await.unwrap();
        assert!(outcome.is_success(), "first terminal reply wins");
    }

    #[tokio::test]
    async fn test_timeout_removes_entry() {
        let tracker = CommandTracker::new();
        let timeout = Duration::from_millis(50);
        let handle = tracker.issue("status", timeout).unwrap();
        let id = handle.correlation_id();

        let started = std::time::Instant::now();
        let err = handle.wait().await.unwrap_err();
        assert!(started.elapsed() >= timeout, "must not time out early");
        assert_eq!(err, CommandError::Timeout { timeout });
        assert!(!tracker.is_pending(id));
        assert_eq!(tracker.resolve(id, CommandOutcome::complete()), Resolution::Unmatched);
    }

    #[tokio::test]
    async fn test_dropped_handle_still_expires() {
        let tracker = CommandTracker::new();
        let handle = tracker.issue("start", Duration::from_millis(30)).unwrap();
        let id = handle.correlation_id();
        drop(handle);

        assert!(tracker.is_pending(id), "still on the wire until the deadline");
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!tracker.is_pending(id));
        assert_eq!(tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unawaited_handle_expires_and_reports_timeout() {
        let tracker = CommandTracker::new();
        let timeout = Duration::from_millis(30);
        let handle = tracker.issue("status", timeout).unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(tracker.pending_count(), 0);
        assert_eq!(handle.wait().await.unwrap_err(), CommandError::Timeout { timeout });
    }

    #[tokio::test]
    async fn test_before_wake_runs_only_for_terminal_match() {
        let tracker = CommandTracker::new();
        let handle = tracker.issue("enable", Duration::from_secs(1)).unwrap();
        let id = handle.correlation_id();
        let status = handle.watch_status();
        let mut seen = Vec::new();

        tracker.resolve_then(id, ack(), |name| seen.push(name.to_string()));
        tracker.resolve_then(CorrelationId::new(99), CommandOutcome::complete(), |name| {
            seen.push(name.to_string())
        });
        assert!(seen.is_empty());

        tracker.resolve_then(id, CommandOutcome::complete(), |name| {
            assert_eq!(*status.borrow(), Some(CommandStatus::Ack), "waiter not woken yet");
            seen.push(name.to_string());
        });
        assert_eq!(seen, vec!["enable".to_string()]);
        assert!(handle.wait().await.unwrap().is_success());
    }

    #[tokio::test]
    async fn test_resolution_before_wait_is_kept() {
        let tracker = CommandTracker::new();
        let handle = tracker.issue("status", Duration::from_millis(20)).unwrap();
        tracker.resolve(handle.correlation_id(), CommandOutcome::complete());
        tokio::time::sleep(Duration::from_millis(40)).await;

        let outcome = handle.wait().await.unwrap();
        assert!(outcome.is_success(), "resolved result survives past the deadline");
    }

    #[tokio::test]
    async fn test_cancel() {
        let tracker = CommandTracker::new();
        let handle = tracker.issue("status", Duration::from_secs(1)).unwrap();
        assert!(tracker.cancel(handle.correlation_id()));
        assert!(!tracker.cancel(handle.correlation_id()));
        assert_eq!(handle.wait().await.unwrap_err(), CommandError::Cancelled);
    }

    #[tokio::test]
    async fn test_fail_all() {
        let tracker = CommandTracker::new();
        let a = tracker.issue("start", Duration::from_secs(1)).unwrap();
        let b = tracker.issue("status", Duration::from_secs(1)).unwrap();

        assert_eq!(tracker.fail_all("peer closed"), 2);
        assert_eq!(tracker.pending_count(), 0);
        for handle in [a, b] {
            assert_eq!(
                handle.wait().await.unwrap_err(),
                CommandError::Disconnected {
                    reason: "peer closed".to_string()
                }
            );
        }
    }

    #[tokio::test]
    async fn test_fail_where_only_touches_matches() {
        let tracker = CommandTracker::new();
        let start = tracker.issue("start", Duration::from_secs(1)).unwrap();
        let status = tracker.issue("status", Duration::from_secs(1)).unwrap();

        let failed = tracker.fail_where(|_, name| name == "start", "remote went to FAULT");
        assert_eq!(failed, 1);
        assert!(tracker.is_pending(status.correlation_id()));

        let outcome = start.wait().await.unwrap();
        assert_eq!(outcome.status, CommandStatus::Failed);
        assert_eq!(outcome.message.as_deref(), Some("remote went to FAULT"));
    }
}
