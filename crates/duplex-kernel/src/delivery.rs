//! Delivery guarantee tracking for the pub/sub channel.
//!
//! The tracker owns one [`DeliveryRecord`] per message id:
//!
//! ```text
//!             ack                        ack
//! Pending ─────────► Acknowledged ◄────────── Redelivered
//!    │                                          ▲   │
//!    └──── timeout (attempts < max) ────────────┘   │
//!    └──── timeout (attempts = max) ──► Abandoned ◄─┘
//! ```
//!
//! Records are settled by acknowledgment or abandonment and evicted once the
//! retention window has elapsed after settlement. In
//! [`DeliveryMode::ExactlyOnce`] a message id seen again while its record is
//! still retained is acknowledged without dispatch; after eviction it is a
//! new message, so exactly-once degrades to at-least-once outside the window.
//!
//! Every state change goes through the per-key lock of the record table, so
//! two workers racing to acknowledge the same message see exactly one
//! success.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Delivery contract of the pub/sub channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Redeliver until acknowledged or abandoned; duplicates are possible.
    #[default]
    AtLeastOnce,
    /// Additionally deduplicate by message id within the retention window.
    ExactlyOnce,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Acknowledged,
    Redelivered,
    Abandoned,
}

impl DeliveryState {
    pub fn is_settled(&self) -> bool {
        matches!(self, DeliveryState::Acknowledged | DeliveryState::Abandoned)
    }
}

/// Tracking state for one message id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRecord {
    pub message_id: String,
    pub state: DeliveryState,
    pub attempt_count: u32,
    pub first_seen_at: Instant,
    pub last_attempt_at: Instant,
    /// When the record reached `Acknowledged` or `Abandoned`.
    pub settled_at: Option<Instant>,
}

impl DeliveryRecord {
    fn new(message_id: &str, now: Instant) -> Self {
        Self {
            message_id: message_id.to_string(),
            state: DeliveryState::Pending,
            attempt_count: 1,
            first_seen_at: now,
            last_attempt_at: now,
            settled_at: None,
        }
    }

    fn retained_at(&self, now: Instant, window: Duration) -> bool {
        self.settled_at
            .is_some_and(|settled| now.saturating_duration_since(settled) < window)
    }
}

/// Tracker settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryConfig {
    pub mode: DeliveryMode,
    pub ack_timeout: Duration,
    pub max_attempts: u32,
    pub retention_window: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            mode: DeliveryMode::AtLeastOnce,
            ack_timeout: Duration::from_secs(30),
            max_attempts: 3,
            retention_window: Duration::from_secs(300),
        }
    }
}

/// What to do with a freshly received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Dispatch it; `attempt` is the attempt number being made.
    Dispatch { attempt: u32 },
    /// Already settled inside the retention window: acknowledge, do not
    /// dispatch.
    Duplicate,
    /// Currently being processed; the running attempt will settle it.
    InFlight,
}

/// Work produced by [`DeliveryTracker::sweep_overdue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepAction {
    Redeliver { message_id: String, attempt: u32 },
    Abandon { message_id: String, attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum DeliveryError {
    /// A second acknowledgment for an already acknowledged message.
    #[error("message {message_id} was already acknowledged")]
    Duplicate { message_id: String },
    #[error("message {0} was abandoned before it was acknowledged")]
    Abandoned(String),
    #[error("no delivery record for message {0}")]
    UnknownMessage(String),
}

/// Concurrent table of in-flight and recently settled messages.
#[derive(Debug)]
pub struct DeliveryTracker {
    records: DashMap<String, DeliveryRecord>,
    config: DeliveryConfig,
}

impl DeliveryTracker {
    pub fn new(config: DeliveryConfig) -> Self {
        Self {
            records: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Record receipt of `message_id` from the transport.
    pub fn on_receive(&self, message_id: &str, now: Instant) -> ReceiveOutcome {
        match self.records.entry(message_id.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(DeliveryRecord::new(message_id, now));
                ReceiveOutcome::Dispatch { attempt: 1 }
            }
            Entry::Occupied(mut slot) => {
                let record = slot.get_mut();
                match record.state {
                    DeliveryState::Pending | DeliveryState::Redelivered => ReceiveOutcome::InFlight,
                    DeliveryState::Acknowledged
                        if self.config.mode == DeliveryMode::ExactlyOnce
                            && record.retained_at(now, self.config.retention_window) =>
                    {
                        ReceiveOutcome::Duplicate
                    }
                    DeliveryState::Abandoned
                        if record.retained_at(now, self.config.retention_window) =>
                    {
                        ReceiveOutcome::Duplicate
                    }
                    _ => {
                        debug!(message_id, "settled record expired, treating as new");
                        *record = DeliveryRecord::new(message_id, now);
                        ReceiveOutcome::Dispatch { attempt: 1 }
                    }
                }
            }
        }
    }

    /// Settle `message_id` as acknowledged.
    ///
    /// Only the first acknowledgment of a pending or redelivered record
    /// succeeds; later ones return [`DeliveryError::Duplicate`].
    pub fn acknowledge(&self, message_id: &str, now: Instant) -> Result<(), DeliveryError> {
        let mut record = self
            .records
            .get_mut(message_id)
            .ok_or_else(|| DeliveryError::UnknownMessage(message_id.to_string()))?;
        match record.state {
            DeliveryState::Pending | DeliveryState::Redelivered => {
                record.state = DeliveryState::Acknowledged;
                record.settled_at = Some(now);
                Ok(())
            }
            DeliveryState::Acknowledged => Err(DeliveryError::Duplicate {
                message_id: message_id.to_string(),
            }),
            DeliveryState::Abandoned => Err(DeliveryError::Abandoned(message_id.to_string())),
        }
    }

    /// Find records whose acknowledgment is overdue and advance them.
    ///
    /// A record below `max_attempts` moves to `Redelivered` with its attempt
    /// count incremented; a record at `max_attempts` moves to `Abandoned`.
    /// Each record is abandoned at most once.
    pub fn sweep_overdue(&self, now: Instant) -> Vec<SweepAction> {
        let mut actions = Vec::new();
        for mut entry in self.records.iter_mut() {
            let record = entry.value_mut();
            if record.state.is_settled()
                || now.saturating_duration_since(record.last_attempt_at) < self.config.ack_timeout
            {
                continue;
            }
            if record.attempt_count >= self.config.max_attempts {
                record.state = DeliveryState::Abandoned;
                record.settled_at = Some(now);
                actions.push(SweepAction::Abandon {
                    message_id: record.message_id.clone(),
                    attempts: record.attempt_count,
                });
            } else {
                record.attempt_count += 1;
                record.state = DeliveryState::Redelivered;
                record.last_attempt_at = now;
                actions.push(SweepAction::Redeliver {
                    message_id: record.message_id.clone(),
                    attempt: record.attempt_count,
                });
            }
        }
        actions
    }

    /// Drop settled records whose retention window has passed. Returns the
    /// number removed.
    pub fn evict_expired(&self, now: Instant) -> usize {
        let before = self.records.len();
        let window = self.config.retention_window;
        self.records
            .retain(|_, record| !record.state.is_settled() || record.retained_at(now, window));
        before.saturating_sub(self.records.len())
    }

    pub fn get(&self, message_id: &str) -> Option<DeliveryRecord> {
        self.records.get(message_id).map(|r| r.value().clone())
    }

    /// Number of records not yet settled.
    pub fn in_flight(&self) -> usize {
        self.records
            .iter()
            .filter(|r| !r.value().state.is_settled())
            .count()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn tracker(mode: DeliveryMode) -> DeliveryTracker {
        DeliveryTracker::new(DeliveryConfig {
            mode,
            ack_timeout: Duration::from_secs(30),
            max_attempts: 3,
            retention_window: Duration::from_secs(60),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_message_is_redelivered_then_abandoned_once() {
        let tracker = tracker(DeliveryMode::AtLeastOnce);
        assert_eq!(
            tracker.on_receive("m1", Instant::now()),
            ReceiveOutcome::Dispatch { attempt: 1 }
        );

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(tracker.sweep_overdue(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(
            tracker.sweep_overdue(Instant::now()),
            vec![SweepAction::Redeliver {
                message_id: "m1".into(),
                attempt: 2
            }]
        );
        assert_eq!(tracker.get("m1").unwrap().attempt_count, 2);
        assert_eq!(tracker.get("m1").unwrap().state, DeliveryState::Redelivered);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(
            tracker.sweep_overdue(Instant::now()),
            vec![SweepAction::Redeliver {
                message_id: "m1".into(),
                attempt: 3
            }]
        );

        let mut abandoned = 0;
        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(30)).await;
            for action in tracker.sweep_overdue(Instant::now()) {
                assert_eq!(
                    action,
                    SweepAction::Abandon {
                        message_id: "m1".into(),
                        attempts: 3
                    }
                );
                abandoned += 1;
            }
        }
        assert_eq!(abandoned, 1);
        assert_eq!(tracker.get("m1").unwrap().state, DeliveryState::Abandoned);
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledged_message_is_never_redelivered() {
        let tracker = tracker(DeliveryMode::AtLeastOnce);
        tracker.on_receive("m1", Instant::now());
        tracker.acknowledge("m1", Instant::now()).unwrap();
        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(tracker.sweep_overdue(Instant::now()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn second_acknowledgment_is_a_duplicate() {
        let tracker = tracker(DeliveryMode::AtLeastOnce);
        tracker.on_receive("m1", Instant::now());
        assert!(tracker.acknowledge("m1", Instant::now()).is_ok());
        assert_eq!(
            tracker.acknowledge("m1", Instant::now()),
            Err(DeliveryError::Duplicate {
                message_id: "m1".into()
            })
        );
        assert!(matches!(
            tracker.acknowledge("zz", Instant::now()),
            Err(DeliveryError::UnknownMessage(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_acknowledgments_succeed_exactly_once() {
        let tracker = Arc::new(tracker(DeliveryMode::AtLeastOnce));
        tracker.on_receive("m1", Instant::now());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move {
                tracker.acknowledge("m1", Instant::now()).is_ok()
            }));
        }
        let mut successes = 0;
        for h in handles {
            if h.await.unwrap() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exactly_once_suppresses_duplicates_inside_window_only() {
        let tracker = tracker(DeliveryMode::ExactlyOnce);
        assert_eq!(
            tracker.on_receive("m1", Instant::now()),
            ReceiveOutcome::Dispatch { attempt: 1 }
        );
        assert_eq!(tracker.on_receive("m1", Instant::now()), ReceiveOutcome::InFlight);
        tracker.acknowledge("m1", Instant::now()).unwrap();

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(tracker.on_receive("m1", Instant::now()), ReceiveOutcome::Duplicate);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(
            tracker.on_receive("m1", Instant::now()),
            ReceiveOutcome::Dispatch { attempt: 1 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn at_least_once_redispatches_settled_messages() {
        let tracker = tracker(DeliveryMode::AtLeastOnce);
        tracker.on_receive("m1", Instant::now());
        tracker.acknowledge("m1", Instant::now()).unwrap();
        assert_eq!(
            tracker.on_receive("m1", Instant::now()),
            ReceiveOutcome::Dispatch { attempt: 1 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn settled_records_are_evicted_after_retention() {
        let tracker = tracker(DeliveryMode::ExactlyOnce);
        tracker.on_receive("acked", Instant::now());
        tracker.on_receive("open", Instant::now());
        tracker.acknowledge("acked", Instant::now()).unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(tracker.evict_expired(Instant::now()), 0);

        tokio::time::advance(Duration::from_secs(50)).await;
        assert_eq!(tracker.evict_expired(Instant::now()), 1);
        assert!(tracker.get("acked").is_none());
        assert_eq!(tracker.in_flight(), 1);
    }
}
