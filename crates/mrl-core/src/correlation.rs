//! Correlation of blocking calls with their replies.
//!
//! Replies (`msgType = "R"`) are parked in a [`CorrelationTable`] keyed by
//! `msgId`. A blocking caller polls the table on a timer until its reply shows
//! up or the poll budget runs out. The wait never touches the transport, so
//! the connection driver keeps dispatching while calls are outstanding.

use crate::envelope::Envelope;
use crate::error::{MrlError, Result};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Replies waiting to be claimed, keyed by `msgId`.
///
/// Ids with a blocking caller still polling are never swept.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    entries: Mutex<HashMap<u64, (Envelope, Instant)>>,
    awaited: Mutex<HashSet<u64>>,
}

/// Marks a `msgId` as awaited until dropped.
struct AwaitGuard<'a> {
    table: &'a CorrelationTable,
    msg_id: u64,
}

impl Drop for AwaitGuard<'_> {
    fn drop(&mut self) {
        self.table
            .awaited
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.msg_id);
    }
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a reply. A later reply for the same id replaces the earlier one.
    pub fn insert(&self, reply: Envelope) {
        let msg_id = reply.msg_id;
        let previous = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(msg_id, (reply, Instant::now()));
        if previous.is_some() {
            warn!("Duplicate reply for msgId {}, keeping the latest", msg_id);
        }
    }

    /// Claim a reply. Each reply is handed out at most once.
    pub fn take(&self, msg_id: u64) -> Option<Envelope> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&msg_id)
            .map(|(reply, _)| reply)
    }

    pub fn contains(&self, msg_id: u64) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&msg_id)
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true while a blocking caller polls for `msg_id`.
    pub fn is_awaited(&self, msg_id: u64) -> bool {
        self.awaited
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&msg_id)
    }

    fn mark_awaited(&self, msg_id: u64) -> AwaitGuard<'_> {
        self.awaited
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(msg_id);
        AwaitGuard {
            table: self,
            msg_id,
        }
    }

    /// Drop unclaimed replies older than `max_age`. Replies a caller is still
    /// polling for are kept. Returns how many were dropped.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let awaited = self.awaited.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|msg_id, (_, inserted)| {
            awaited.contains(msg_id) || now.duration_since(*inserted) < max_age
        });
        let dropped = before - entries.len();
        if dropped > 0 {
            debug!("Swept {} unclaimed replies", dropped);
        }
        dropped
    }
}

/// Poll schedule of a blocking call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_polls: u32,
}

impl PollPolicy {
    pub fn new(interval: Duration, max_polls: u32) -> Self {
        Self {
            interval,
            max_polls,
        }
    }

    /// Longest time a call waits before timing out.
    pub fn window(&self) -> Duration {
        self.interval * self.max_polls
    }
}

/// Wait for the reply to `request`.
///
/// The id is marked as awaited as soon as this is called, so the future can
/// be created before the request goes out. Sleeps one interval before every
/// poll. Fails with [`MrlError::CorrelationTimeout`] after `max_polls`
/// misses; a reply that arrives later stays in the table until claimed or
/// swept.
pub fn wait_for_reply<'a>(
    table: &'a CorrelationTable,
    request: &'a Envelope,
    policy: PollPolicy,
) -> impl Future<Output = Result<Envelope>> + 'a {
    let awaited = table.mark_awaited(request.msg_id);
    async move {
        let _awaited = awaited;
        let started = Instant::now();
        for attempt in 1..=policy.max_polls {
            sleep(policy.interval).await;
            if let Some(reply) = table.take(request.msg_id) {
                debug!(
                    "Reply for {} {}.{} after {} polls",
                    request.msg_id, request.name, request.method, attempt
                );
                return Ok(reply);
            }
        }

        Err(MrlError::CorrelationTimeout {
            msg_id: request.msg_id,
            target: format!("{}.{}", request.name, request.method),
            attempts: policy.max_polls,
            elapsed: started.elapsed(),
            envelope: Box::new(request.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn request(msg_id: u64) -> Envelope {
        Envelope::new(msg_id, "python@R9", "runtime@E1", "exec")
    }

    fn reply(msg_id: u64) -> Envelope {
        request(msg_id).reply(vec![serde_json::json!("\"ok\"")])
    }

    #[test]
    fn test_take_is_at_most_once() {
        let table = CorrelationTable::new();
        table.insert(reply(42));

        assert!(table.contains(42));
        assert_eq!(table.take(42).unwrap().msg_id, 42);
        assert!(table.take(42).is_none());
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_at_third_poll_resolves_and_is_removed() {
        let table = Arc::new(CorrelationTable::new());
        let policy = PollPolicy::new(Duration::from_millis(1000), 20);

        let late = Arc::clone(&table);
        tokio::spawn(async move {
            sleep(Duration::from_millis(2500)).await;
            late.insert(reply(42));
        });

        let started = Instant::now();
        let response = wait_for_reply(&table, &request(42), policy).await.unwrap();

        assert_eq!(response.msg_id, 42);
        assert!(response.is_reply());
        assert_eq!(started.elapsed(), Duration::from_millis(3000));
        assert!(!table.contains(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_reply_times_out_after_full_budget() {
        let table = CorrelationTable::new();
        let policy = PollPolicy::new(Duration::from_millis(1000), 20);

        let started = Instant::now();
        let err = wait_for_reply(&table, &request(7), policy).await.unwrap_err();

        assert_eq!(started.elapsed(), policy.window());
        match err {
            MrlError::CorrelationTimeout {
                msg_id,
                attempts,
                envelope,
                ..
            } => {
                assert_eq!(msg_id, 7);
                assert_eq!(attempts, 20);
                assert_eq!(envelope.method, "exec");
            }
            other => panic!("Expected CorrelationTimeout, got: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_waits_do_not_interfere() {
        let table = Arc::new(CorrelationTable::new());
        let policy = PollPolicy::new(Duration::from_millis(100), 5);

        table.insert(reply(2));
        let first = request(1);
        let second = request(2);
        let (a, b) = tokio::join!(
            wait_for_reply(&table, &first, policy),
            wait_for_reply(&table, &second, policy)
        );
        assert!(a.is_err());
        assert_eq!(b.unwrap().msg_id, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_drops_stale_replies() {
        let table = CorrelationTable::new();
        table.insert(reply(1));
        tokio::time::advance(Duration::from_secs(30)).await;
        table.insert(reply(2));

        assert_eq!(table.sweep(Duration::from_secs(20)), 1);
        assert!(!table.contains(1));
        assert!(table.contains(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_keeps_replies_of_waiting_callers() {
        let table = Arc::new(CorrelationTable::new());
        let policy = PollPolicy::new(Duration::from_millis(200), 5);

        let sweeper = Arc::clone(&table);
        tokio::spawn(async move {
            sweeper.insert(reply(9));
            for _ in 0..10 {
                sleep(Duration::from_millis(20)).await;
                sweeper.sweep(Duration::from_millis(1));
            }
        });

        let first = request(9);
        let response = wait_for_reply(&table, &first, policy).await.unwrap();
        assert_eq!(response.msg_id, 9);
        assert!(!table.is_awaited(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_awaited_mark_cleared_after_timeout() {
        let table = CorrelationTable::new();
        let policy = PollPolicy::new(Duration::from_millis(100), 2);

        let first = request(5);
        assert!(wait_for_reply(&table, &first, policy).await.is_err());
        assert!(!table.is_awaited(5));

        table.insert(reply(5));
        tokio::time::advance(Duration::from_millis(50)).await;
        assert_eq!(table.sweep(Duration::from_millis(10)), 1);
    }
}
