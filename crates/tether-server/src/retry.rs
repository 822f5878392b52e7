//! Redelivery of unacknowledged messages.
//!
//! Entries are keyed by recipient and message id, so two identities may be
//! sent the same id without disturbing each other. An entry is registered
//! with [`RetryEngine::track`] before its first write and its timer is started
//! with [`RetryEngine::arm`] once that write succeeds. The timer task wakes at
//! `next_fire_at`, re-reads the entry and either redelivers, dead-letters or
//! exits. Acknowledgment, disconnect cleanup and replacement all cancel the
//! task; a generation number guards against a stale wake racing a replacement.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::{counter, gauge};
use tether_core::{DeadLetter, DeadLetterSink, Identity, Message, MessageId, SinkError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::DeliveryConfig;
use crate::metrics::{ACKS_TOTAL, DEAD_LETTERS_TOTAL, PENDING_DELIVERIES, REDELIVERIES_TOTAL};

type DeliveryKey = (Identity, MessageId);

/// Result of one redelivery attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RedeliveryOutcome {
    /// The frame was written.
    Delivered,
    /// The entry was settled while waiting for the writer; nothing was written.
    Skipped,
    /// No live connection for the target.
    Offline,
    /// The write failed; the connection has been torn down.
    Failed,
}

/// Performs redelivery writes on behalf of the engine.
#[async_trait]
pub trait Redeliver: Send + Sync + 'static {
    /// Write `message` to the current connection of `target`.
    ///
    /// `still_pending` must be checked once the connection's writer is held;
    /// when it returns `false` the write is skipped.
    async fn redeliver(
        &self,
        target: &Identity,
        message: &Message,
        still_pending: &(dyn Fn() -> bool + Send + Sync),
    ) -> RedeliveryOutcome;
}

/// A message awaiting acknowledgment.
#[derive(Clone, Debug)]
pub struct PendingDelivery {
    /// The message, including its id.
    pub message: Message,
    /// Recipient.
    pub target_identity: Identity,
    /// Writes performed so far, including the first.
    pub attempt_count: u32,
    /// Next timer expiry.
    pub next_fire_at: Instant,
    /// When tracking began.
    pub first_enqueued_at: DateTime<Utc>,
    generation: u64,
    cancel: CancellationToken,
}

/// Handle to an entry registered by [`RetryEngine::track`].
#[derive(Debug)]
pub struct Tracking {
    key: DeliveryKey,
    generation: u64,
}

impl Tracking {
    /// Recipient of the tracked message.
    pub fn target(&self) -> &Identity {
        &self.key.0
    }

    /// Id of the tracked message.
    pub fn message_id(&self) -> &MessageId {
        &self.key.1
    }
}

struct RetryState {
    entries: DashMap<DeliveryKey, PendingDelivery>,
    config: DeliveryConfig,
    dead_letters: Arc<dyn DeadLetterSink>,
    generation: AtomicU64,
}

impl RetryState {
    fn fire_at(&self, key: &DeliveryKey, generation: u64) -> Option<Instant> {
        self.entries
            .get(key)
            .filter(|p| p.generation == generation)
            .map(|p| p.next_fire_at)
    }

    fn current(&self, key: &DeliveryKey, generation: u64) -> Option<(Message, u32)> {
        self.entries
            .get(key)
            .filter(|p| p.generation == generation)
            .map(|p| (p.message.clone(), p.attempt_count))
    }

    fn is_current(&self, key: &DeliveryKey, generation: u64) -> bool {
        self.entries
            .get(key)
            .is_some_and(|p| p.generation == generation)
    }

    fn record_attempt(&self, key: &DeliveryKey, generation: u64) -> Option<u32> {
        let mut entry = self.entries.get_mut(key)?;
        if entry.generation != generation {
            return None;
        }
        entry.attempt_count += 1;
        entry.next_fire_at = Instant::now() + self.config.retry_delay;
        Some(entry.attempt_count)
    }

    fn remove(&self, key: &DeliveryKey, generation: u64) -> Option<PendingDelivery> {
        let removed = self
            .entries
            .remove_if(key, |_, p| p.generation == generation)
            .map(|(_, p)| p);
        if let Some(pending) = &removed {
            pending.cancel.cancel();
        }
        self.update_gauge();
        removed
    }

    async fn dead_letter(&self, key: &DeliveryKey, generation: u64) {
        let Some(pending) = self.remove(key, generation) else {
            return;
        };
        counter!(DEAD_LETTERS_TOTAL).increment(1);
        warn!(
            message_id = %key.1,
            identity = %pending.target_identity,
            attempts = pending.attempt_count,
            "delivery exhausted, dead-lettering"
        );
        let letter = DeadLetter {
            target_identity: pending.target_identity,
            message: pending.message,
            attempts: pending.attempt_count,
            first_enqueued_at: pending.first_enqueued_at,
            dead_lettered_at: Utc::now(),
        };
        if let Err(e) = self.dead_letters.dead_letter(letter).await {
            warn!(message_id = %key.1, error = %e, "failed to record dead letter");
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn update_gauge(&self) {
        gauge!(PENDING_DELIVERIES).set(self.entries.len() as f64);
    }
}

/// Tracks outstanding messages and drives their redelivery timers.
pub struct RetryEngine {
    state: Arc<RetryState>,
    redeliver: Weak<dyn Redeliver>,
}

impl RetryEngine {
    /// Build an engine. `redeliver` is weak so the engine never keeps its owner alive.
    pub fn new(
        config: DeliveryConfig,
        redeliver: Weak<dyn Redeliver>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            state: Arc::new(RetryState {
                entries: DashMap::new(),
                config,
                dead_letters,
                generation: AtomicU64::new(0),
            }),
            redeliver,
        }
    }

    /// Register a message that is about to be written for the first time.
    ///
    /// The entry is visible to [`confirm`](Self::confirm) immediately, so an
    /// ack racing the first write is not lost. No timer runs until
    /// [`arm`](Self::arm). Acks and messages without an id are not tracked.
    /// Tracking a key that is already pending replaces the entry and cancels
    /// its timer.
    pub fn track(&self, target: Identity, message: Message) -> Option<Tracking> {
        if message.is_ack() {
            return None;
        }
        let Some(message_id) = message.message_id.clone() else {
            warn!(identity = %target, "refusing to track message without an id");
            return None;
        };
        let generation = self.state.generation.fetch_add(1, Ordering::Relaxed);
        let key = (target.clone(), message_id);
        let pending = PendingDelivery {
            message,
            target_identity: target,
            attempt_count: 1,
            next_fire_at: Instant::now() + self.state.config.retry_delay,
            first_enqueued_at: Utc::now(),
            generation,
            cancel: CancellationToken::new(),
        };
        if let Some(previous) = self.state.entries.insert(key.clone(), pending) {
            previous.cancel.cancel();
        }
        self.state.update_gauge();
        Some(Tracking { key, generation })
    }

    /// Start the redelivery timer after a successful first write. Does nothing
    /// if the entry was confirmed, dropped or replaced in the meantime.
    pub fn arm(&self, tracking: &Tracking) {
        let cancel = {
            let Some(mut entry) = self.state.entries.get_mut(&tracking.key) else {
                return;
            };
            if entry.generation != tracking.generation {
                return;
            }
            entry.next_fire_at = Instant::now() + self.state.config.retry_delay;
            entry.cancel.clone()
        };
        let _ = tokio::spawn(drive(
            Arc::clone(&self.state),
            self.redeliver.clone(),
            tracking.key.clone(),
            tracking.generation,
            cancel,
        ));
    }

    /// Forget an entry whose first write failed.
    pub fn abandon(&self, tracking: Tracking) {
        let _ = self.state.remove(&tracking.key, tracking.generation);
    }

    /// [`track`](Self::track) and [`arm`](Self::arm) in one step, for a message
    /// that was already written once.
    pub fn enqueue(&self, target: Identity, message: Message) -> Option<MessageId> {
        let tracking = self.track(target, message)?;
        self.arm(&tracking);
        Some(tracking.key.1)
    }

    /// Stop tracking `message_id` for `identity`. Returns whether an entry was removed.
    pub fn confirm(&self, identity: &Identity, message_id: &MessageId) -> bool {
        let key = (identity.clone(), message_id.clone());
        let Some((_, pending)) = self.state.entries.remove(&key) else {
            return false;
        };
        pending.cancel.cancel();
        self.state.update_gauge();
        counter!(ACKS_TOTAL).increment(1);
        debug!(
            %message_id,
            %identity,
            attempts = pending.attempt_count,
            "delivery acknowledged"
        );
        true
    }

    /// Drop every entry targeting `identity`. Returns how many were dropped.
    pub fn forget_identity(&self, identity: &Identity) -> usize {
        let mut dropped = 0;
        self.state.entries.retain(|(target, _), pending| {
            if target == identity {
                pending.cancel.cancel();
                dropped += 1;
                false
            } else {
                true
            }
        });
        self.state.update_gauge();
        dropped
    }

    /// Snapshot of one pending entry.
    pub fn pending(&self, identity: &Identity, message_id: &MessageId) -> Option<PendingDelivery> {
        let key = (identity.clone(), message_id.clone());
        self.state.entries.get(&key).map(|p| p.value().clone())
    }

    /// Pending entries targeting `identity`.
    pub fn pending_for(&self, identity: &Identity) -> usize {
        self.state
            .entries
            .iter()
            .filter(|p| &p.key().0 == identity)
            .count()
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.state.entries.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.state.entries.is_empty()
    }
}

async fn drive(
    state: Arc<RetryState>,
    redeliver: Weak<dyn Redeliver>,
    key: DeliveryKey,
    generation: u64,
    cancel: CancellationToken,
) {
    let (target, message_id) = (&key.0, &key.1);
    loop {
        let Some(fire_at) = state.fire_at(&key, generation) else {
            return;
        };
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep_until(fire_at) => {}
        }

        let Some((message, attempts)) = state.current(&key, generation) else {
            return;
        };
        if attempts >= state.config.max_attempts {
            state.dead_letter(&key, generation).await;
            return;
        }

        let Some(redeliver) = redeliver.upgrade() else {
            return;
        };
        let still_pending = || state.is_current(&key, generation);
        let outcome = redeliver.redeliver(target, &message, &still_pending).await;
        drop(redeliver);

        match outcome {
            RedeliveryOutcome::Delivered => {
                let Some(attempt) = state.record_attempt(&key, generation) else {
                    return;
                };
                counter!(REDELIVERIES_TOTAL).increment(1);
                debug!(%message_id, identity = %target, attempt, "redelivered");
            }
            RedeliveryOutcome::Skipped => {
                debug!(%message_id, identity = %target, "settled before redelivery, skipped");
                return;
            }
            RedeliveryOutcome::Offline | RedeliveryOutcome::Failed => {
                if state.remove(&key, generation).is_some() {
                    debug!(%message_id, identity = %target, ?outcome, "recipient gone, dropping delivery");
                }
                return;
            }
        }
    }
}

/// Dead-letter sink that only logs.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogDeadLetters;

#[async_trait]
impl DeadLetterSink for LogDeadLetters {
    async fn dead_letter(&self, letter: DeadLetter) -> Result<(), SinkError> {
        warn!(
            identity = %letter.target_identity,
            message_id = ?letter.message.message_id,
            action = %letter.message.action,
            attempts = letter.attempts,
            "dead letter"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::testing::{self, RecordingDeadLetters};

    #[derive(Default)]
    struct ScriptedRedeliver {
        calls: Mutex<Vec<(Identity, MessageId, Instant)>>,
        offline: AtomicBool,
    }

    #[async_trait]
    impl Redeliver for ScriptedRedeliver {
        async fn redeliver(
            &self,
            target: &Identity,
            message: &Message,
            still_pending: &(dyn Fn() -> bool + Send + Sync),
        ) -> RedeliveryOutcome {
            if self.offline.load(Ordering::SeqCst) {
                return RedeliveryOutcome::Offline;
            }
            if !still_pending() {
                return RedeliveryOutcome::Skipped;
            }
            let id = message.message_id.clone().unwrap();
            self.calls.lock().push((target.clone(), id, Instant::now()));
            RedeliveryOutcome::Delivered
        }
    }

    struct Fixture {
        engine: RetryEngine,
        redeliver: Arc<ScriptedRedeliver>,
        dead_letters: Arc<RecordingDeadLetters>,
    }

    fn fixture(max_attempts: u32) -> Fixture {
        let config = DeliveryConfig {
            max_attempts,
            ..testing::config()
        };
        let redeliver = Arc::new(ScriptedRedeliver::default());
        let weak: Weak<dyn Redeliver> = Arc::downgrade(&redeliver) as Weak<dyn Redeliver>;
        let dead_letters = Arc::new(RecordingDeadLetters::default());
        let engine = RetryEngine::new(config, weak, dead_letters.clone());
        Fixture {
            engine,
            redeliver,
            dead_letters,
        }
    }

    fn identity(raw: &str) -> Identity {
        Identity::parse(raw).unwrap()
    }

    fn tracked(id: &str) -> Message {
        Message::new("notify", json!({"n": 1})).with_id(MessageId::from_raw(id))
    }

    #[tokio::test(start_paused = true)]
    async fn redelivers_every_delay_with_same_id() {
        let f = fixture(3);
        let delay = testing::config().retry_delay;
        let start = Instant::now();
        let _ = f.engine.enqueue(identity("u1"), tracked("m1"));

        tokio::time::sleep(delay * 2 + Duration::from_millis(1)).await;

        let calls = f.redeliver.calls.lock().clone();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|(who, id, _)| who.as_str() == "u1" && id.as_str() == "m1"));
        assert_eq!(calls[0].2 - start, delay);
        assert_eq!(calls[1].2 - start, delay * 2);
        let pending = f.engine.pending(&identity("u1"), &MessageId::from_raw("m1")).unwrap();
        assert_eq!(pending.attempt_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_letters_after_max_attempts() {
        let f = fixture(3);
        let delay = testing::config().retry_delay;
        let _ = f.engine.enqueue(identity("u1"), tracked("m1"));

        tokio::time::sleep(delay * 4).await;

        assert_eq!(f.redeliver.calls.lock().len(), 2);
        assert!(f.engine.is_empty());
        let letters = f.dead_letters.wait_for(1).await;
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].attempts, 3);
        assert_eq!(letters[0].target_identity.as_str(), "u1");
        assert_eq!(
            letters[0].message.message_id.as_ref().map(MessageId::as_str),
            Some("m1")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn single_attempt_dead_letters_without_redelivery() {
        let f = fixture(1);
        let delay = testing::config().retry_delay;
        let _ = f.engine.enqueue(identity("u1"), tracked("m1"));

        tokio::time::sleep(delay * 2).await;

        assert!(f.redeliver.calls.lock().is_empty());
        assert_eq!(f.dead_letters.wait_for(1).await[0].attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn confirm_stops_redelivery() {
        let f = fixture(5);
        let delay = testing::config().retry_delay;
        let _ = f.engine.enqueue(identity("u1"), tracked("m1"));

        tokio::time::sleep(delay + Duration::from_millis(1)).await;
        assert!(f.engine.confirm(&identity("u1"), &MessageId::from_raw("m1")));
        assert!(!f.engine.confirm(&identity("u1"), &MessageId::from_raw("m1")));

        tokio::time::sleep(delay * 10).await;
        assert_eq!(f.redeliver.calls.lock().len(), 1);
        assert!(f.dead_letters.letters().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn confirm_unknown_is_noop() {
        let f = fixture(5);
        assert!(!f.engine.confirm(&identity("u1"), &MessageId::from_raw("nope")));
    }

    #[tokio::test(start_paused = true)]
    async fn same_id_for_two_identities_is_tracked_separately() {
        let f = fixture(5);
        let delay = testing::config().retry_delay;
        assert!(f.engine.enqueue(identity("u1"), tracked("broadcast-1")).is_some());
        assert!(f.engine.enqueue(identity("u2"), tracked("broadcast-1")).is_some());

        assert_eq!(f.engine.len(), 2);
        assert_eq!(f.engine.pending_for(&identity("u1")), 1);
        assert_eq!(f.engine.pending_for(&identity("u2")), 1);

        tokio::time::sleep(delay + Duration::from_millis(1)).await;
        let mut targets: Vec<_> = f
            .redeliver
            .calls
            .lock()
            .iter()
            .map(|(who, _, _)| who.as_str().to_string())
            .collect();
        targets.sort();
        assert_eq!(targets, vec!["u1", "u2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn confirm_only_settles_the_acking_identity() {
        let f = fixture(5);
        let delay = testing::config().retry_delay;
        let _ = f.engine.enqueue(identity("u1"), tracked("m1"));
        let _ = f.engine.enqueue(identity("u2"), tracked("m1"));

        assert!(f.engine.confirm(&identity("u2"), &MessageId::from_raw("m1")));
        assert!(!f.engine.confirm(&identity("u3"), &MessageId::from_raw("m1")));
        assert_eq!(f.engine.pending_for(&identity("u1")), 1);

        tokio::time::sleep(delay + Duration::from_millis(1)).await;
        let calls = f.redeliver.calls.lock().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0.as_str(), "u1");
    }

    #[tokio::test(start_paused = true)]
    async fn tracked_entry_has_no_timer_until_armed() {
        let f = fixture(5);
        let delay = testing::config().retry_delay;
        let tracking = f.engine.track(identity("u1"), tracked("m1")).unwrap();
        assert_eq!(tracking.message_id().as_str(), "m1");
        assert_eq!(tracking.target().as_str(), "u1");

        tokio::time::sleep(delay * 3).await;
        assert!(f.redeliver.calls.lock().is_empty());
        assert_eq!(f.engine.len(), 1);

        f.engine.arm(&tracking);
        tokio::time::sleep(delay + Duration::from_millis(1)).await;
        assert_eq!(f.redeliver.calls.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn confirm_before_arm_leaves_nothing_to_redeliver() {
        let f = fixture(5);
        let delay = testing::config().retry_delay;
        let tracking = f.engine.track(identity("u1"), tracked("m1")).unwrap();

        assert!(f.engine.confirm(&identity("u1"), &MessageId::from_raw("m1")));
        f.engine.arm(&tracking);

        tokio::time::sleep(delay * 5).await;
        assert!(f.engine.is_empty());
        assert!(f.redeliver.calls.lock().is_empty());
        assert!(f.dead_letters.letters().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn abandon_removes_only_its_own_generation() {
        let f = fixture(5);
        let stale = f.engine.track(identity("u1"), tracked("m1")).unwrap();
        let fresh = f.engine.track(identity("u1"), tracked("m1")).unwrap();

        f.engine.abandon(stale);
        assert_eq!(f.engine.len(), 1);
        f.engine.abandon(fresh);
        assert!(f.engine.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn acks_are_never_tracked() {
        let f = fixture(5);
        let ack = Message::ack(MessageId::from_raw("m1"));
        assert!(f.engine.enqueue(identity("u1"), ack).is_none());
        assert!(f.engine.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn messages_without_id_are_not_tracked() {
        let f = fixture(5);
        let message = Message::new("notify", json!(null));
        assert!(f.engine.enqueue(identity("u1"), message).is_none());
        assert!(f.engine.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn offline_target_drops_entry_without_dead_letter() {
        let f = fixture(5);
        let delay = testing::config().retry_delay;
        f.redeliver.offline.store(true, Ordering::SeqCst);
        let _ = f.engine.enqueue(identity("u1"), tracked("m1"));

        tokio::time::sleep(delay * 3).await;
        assert!(f.engine.is_empty());
        assert!(f.dead_letters.letters().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn forget_identity_drops_only_matching_entries() {
        let f = fixture(5);
        let delay = testing::config().retry_delay;
        let _ = f.engine.enqueue(identity("u1"), tracked("a"));
        let _ = f.engine.enqueue(identity("u1"), tracked("b"));
        let _ = f.engine.enqueue(identity("u2"), tracked("c"));

        assert_eq!(f.engine.forget_identity(&identity("u1")), 2);
        assert_eq!(f.engine.len(), 1);
        assert_eq!(f.engine.pending_for(&identity("u2")), 1);

        tokio::time::sleep(delay + Duration::from_millis(1)).await;
        let calls = f.redeliver.calls.lock().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1.as_str(), "c");
    }

    #[tokio::test(start_paused = true)]
    async fn re_enqueue_restarts_the_timer() {
        let f = fixture(5);
        let delay = testing::config().retry_delay;
        let start = Instant::now();
        let _ = f.engine.enqueue(identity("u1"), tracked("m1"));

        tokio::time::sleep(delay / 2).await;
        let _ = f.engine.enqueue(identity("u1"), tracked("m1"));
        assert_eq!(f.engine.len(), 1);

        tokio::time::sleep(delay).await;
        let calls = f.redeliver.calls.lock().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].2 - start, delay / 2 + delay);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_owner_stops_timers() {
        let f = fixture(5);
        let delay = testing::config().retry_delay;
        let _ = f.engine.enqueue(identity("u1"), tracked("m1"));
        let Fixture {
            engine,
            redeliver,
            dead_letters,
        } = f;
        drop(redeliver);

        tokio::time::sleep(delay * 10).await;
        assert!(dead_letters.letters().is_empty());
        assert_eq!(engine.len(), 1);
    }

    #[tokio::test]
    async fn log_sink_accepts_letters() {
        let letter = DeadLetter {
            target_identity: identity("u1"),
            message: tracked("m1"),
            attempts: 5,
            first_enqueued_at: Utc::now(),
            dead_lettered_at: Utc::now(),
        };
        LogDeadLetters.dead_letter(letter).await.unwrap();
    }
}
