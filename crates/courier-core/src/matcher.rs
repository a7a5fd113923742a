//! Rendezvous matcher: pairs two anonymous callers waiting for a random
//! peer.
//!
//! The waiting set is a map from user id to a one-shot notify channel,
//! guarded by one lock held only for constant-time operations. A join
//! either claims an existing waiter (and becomes the initiator of the
//! subsequent handshake) or parks itself until notified, timed out, or
//! cancelled - exactly one of the three fires per attempt.
//!
//! Cancellation is drop-based: dropping the `join` future (the client
//! hung up) removes the waiter, so nothing waits forever for a partner
//! that will never come.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

/// Default wait before giving up on finding a partner.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Which side of the pairing this caller landed on. The party that was
/// already waiting becomes the peer; the party that arrived and found a
/// match becomes the initiator and starts the connection-setup
/// handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchRole {
    Initiator,
    Peer,
}

impl MatchRole {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchRole::Initiator => "initiator",
            MatchRole::Peer => "peer",
        }
    }
}

/// Result of a join attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    Matched { partner: String, role: MatchRole },
    TimedOut,
}

struct Waiter {
    seq: u64,
    notify: oneshot::Sender<String>,
}

/// The rendezvous waiting set.
pub struct RendezvousMatcher {
    waiting: Mutex<HashMap<String, Waiter>>,
    timeout: Duration,
    seq: AtomicU64,
}

impl RendezvousMatcher {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            waiting: Mutex::new(HashMap::new()),
            timeout,
            seq: AtomicU64::new(1),
        }
    }

    /// Join the rendezvous queue.
    ///
    /// If someone else is already waiting, claims them and returns
    /// immediately as the initiator; the waiter's blocked call returns as
    /// the peer. Otherwise parks until notified or until the timeout.
    /// A second join for a user already waiting replaces the stale
    /// waiter; the replaced call returns `TimedOut`.
    pub async fn join(&self, user_id: &str) -> MatchOutcome {
        enum Entry {
            Claimed(String, Waiter),
            Parked(oneshot::Receiver<String>, u64),
        }

        // Claim-or-register is atomic: under one lock acquisition we
        // either take a waiting partner out of the set or become the
        // waiter ourselves. Two concurrent joins can never both scan an
        // empty set and both park.
        let entry = {
            let mut waiting = self.waiting.lock().unwrap();
            let claimed = waiting
                .keys()
                .find(|id| id.as_str() != user_id)
                .cloned()
                .and_then(|partner_id| {
                    waiting
                        .remove(&partner_id)
                        .map(|waiter| (partner_id, waiter))
                });
            match claimed {
                Some((partner_id, waiter)) => Entry::Claimed(partner_id, waiter),
                None => {
                    let (tx, rx) = oneshot::channel();
                    let seq = self.seq.fetch_add(1, Ordering::Relaxed);
                    if waiting
                        .insert(user_id.to_string(), Waiter { seq, notify: tx })
                        .is_some()
                    {
                        debug!(user = %user_id, "replaced stale waiter");
                    }
                    Entry::Parked(rx, seq)
                }
            }
        };

        let (rx, seq) = match entry {
            Entry::Claimed(partner_id, waiter) => {
                // The waiter may have given up between our claim and this
                // notify; the dropped notify is a benign no-op.
                if waiter.notify.send(user_id.to_string()).is_err() {
                    debug!(partner = %partner_id, "waiter gone before notify");
                }
                return MatchOutcome::Matched {
                    partner: partner_id,
                    role: MatchRole::Initiator,
                };
            }
            Entry::Parked(rx, seq) => (rx, seq),
        };

        // Removes the entry on timeout or future drop; a no-op if we were
        // matched (the initiator removed us) or replaced (seq differs).
        let _guard = WaitGuard {
            matcher: self,
            user_id,
            seq,
        };

        tokio::select! {
            notified = rx => match notified {
                Ok(partner) => MatchOutcome::Matched {
                    partner,
                    role: MatchRole::Peer,
                },
                // Our waiter entry was replaced by a newer join for the
                // same user; this attempt is over.
                Err(_) => MatchOutcome::TimedOut,
            },
            () = tokio::time::sleep(self.timeout) => {
                debug!(user = %user_id, "rendezvous wait timed out");
                MatchOutcome::TimedOut
            }
        }
    }

    /// Whether `user_id` is currently parked in the waiting set.
    #[must_use]
    pub fn is_waiting(&self, user_id: &str) -> bool {
        self.waiting.lock().unwrap().contains_key(user_id)
    }

    #[must_use]
    pub fn waiting_count(&self) -> usize {
        self.waiting.lock().unwrap().len()
    }

    fn remove_if_current(&self, user_id: &str, seq: u64) {
        let mut waiting = self.waiting.lock().unwrap();
        if waiting.get(user_id).is_some_and(|w| w.seq == seq) {
            waiting.remove(user_id);
        }
    }
}

impl Default for RendezvousMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_WAIT_TIMEOUT)
    }
}

struct WaitGuard<'a> {
    matcher: &'a RendezvousMatcher,
    user_id: &'a str,
    seq: u64,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.matcher.remove_if_current(self.user_id, self.seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_lone_waiter_times_out() {
        let matcher = RendezvousMatcher::new(Duration::from_secs(30));
        // Nobody else joins; time auto-advances past the timeout.
        assert_eq!(matcher.join("carol").await, MatchOutcome::TimedOut);
        assert!(!matcher.is_waiting("carol"));
        assert_eq!(matcher.waiting_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pairing_roles() {
        let matcher = Arc::new(RendezvousMatcher::default());

        let dave_matcher = Arc::clone(&matcher);
        let dave = tokio::spawn(async move { dave_matcher.join("dave").await });
        tokio::task::yield_now().await;
        assert!(matcher.is_waiting("dave"));

        let erin = matcher.join("erin").await;
        assert_eq!(
            erin,
            MatchOutcome::Matched {
                partner: "dave".into(),
                role: MatchRole::Initiator,
            }
        );

        let dave = dave.await.unwrap();
        assert_eq!(
            dave,
            MatchOutcome::Matched {
                partner: "erin".into(),
                role: MatchRole::Peer,
            }
        );
        assert_eq!(matcher.waiting_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_joins_pair_without_ordering() {
        // No yields between the two joins: whichever acquires the lock
        // second must claim the first, regardless of interleaving.
        let matcher = Arc::new(RendezvousMatcher::default());

        let ann_matcher = Arc::clone(&matcher);
        let ann = tokio::spawn(async move { ann_matcher.join("ann").await });
        let ben_matcher = Arc::clone(&matcher);
        let ben = tokio::spawn(async move { ben_matcher.join("ben").await });

        let (ann, ben) = (ann.await.unwrap(), ben.await.unwrap());
        match (&ann, &ben) {
            (
                MatchOutcome::Matched {
                    partner: ann_partner,
                    role: ann_role,
                },
                MatchOutcome::Matched {
                    partner: ben_partner,
                    role: ben_role,
                },
            ) => {
                assert_eq!(ann_partner, "ben");
                assert_eq!(ben_partner, "ann");
                assert_ne!(ann_role, ben_role, "exactly one side initiates");
            }
            other => panic!("both joins must match, got {other:?}"),
        }
        assert_eq!(matcher.waiting_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_never_matches_itself() {
        let matcher = Arc::new(RendezvousMatcher::default());

        let first_matcher = Arc::clone(&matcher);
        let first = tokio::spawn(async move { first_matcher.join("x").await });
        tokio::task::yield_now().await;

        // The same user joining again must not pair with itself; the
        // stale waiter is replaced and the set keeps a single entry.
        let second_matcher = Arc::clone(&matcher);
        let second = tokio::spawn(async move { second_matcher.join("x").await });
        tokio::task::yield_now().await;

        assert_eq!(matcher.waiting_count(), 1);
        assert_eq!(first.await.unwrap(), MatchOutcome::TimedOut);
        assert_eq!(second.await.unwrap(), MatchOutcome::TimedOut);
        assert_eq!(matcher.waiting_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_removes_waiter() {
        let matcher = Arc::new(RendezvousMatcher::default());

        let task_matcher = Arc::clone(&matcher);
        let task = tokio::spawn(async move { task_matcher.join("gone").await });
        tokio::task::yield_now().await;
        assert!(matcher.is_waiting("gone"));

        // Client hung up: dropping the join future cleans up the set.
        task.abort();
        let _ = task.await;
        assert!(!matcher.is_waiting("gone"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_after_abandon_is_benign() {
        let matcher = Arc::new(RendezvousMatcher::new(Duration::from_secs(1)));

        let waiter_matcher = Arc::clone(&matcher);
        let waiter = tokio::spawn(async move { waiter_matcher.join("w").await });
        tokio::task::yield_now().await;
        waiter.abort();
        let _ = waiter.await;

        // The abandoned waiter must not be claimable anymore.
        tokio::task::yield_now().await;
        assert_eq!(matcher.join("late").await, MatchOutcome::TimedOut);
    }
}
