//! Operator-visible dead-letter store.
//!
//! A bounded ring: once `capacity` entries are held, recording a new one
//! evicts the oldest. Entries are logged at `warn` when recorded and listed
//! by `GET /v1/dead-letters`.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use tracing::warn;

/// Why a message ended up in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterKind {
    /// Delivery attempts exhausted without acknowledgment.
    Abandoned,
    /// Rejected during authentication or validation.
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadLetterEntry {
    pub message_id: String,
    pub topic: String,
    pub kind: DeadLetterKind,
    pub reason: String,
    pub attempt_count: u32,
    /// Payload as UTF-8 when possible, lossily converted otherwise.
    pub payload: String,
    pub recorded_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(
        message_id: impl Into<String>,
        topic: impl Into<String>,
        kind: DeadLetterKind,
        reason: impl Into<String>,
        attempt_count: u32,
        payload: &[u8],
    ) -> Self {
        Self {
            message_id: message_id.into(),
            topic: topic.into(),
            kind,
            reason: reason.into(),
            attempt_count,
            payload: String::from_utf8_lossy(payload).into_owned(),
            recorded_at: Utc::now(),
        }
    }
}

#[derive(Debug)]
pub struct DeadLetterStore {
    entries: Mutex<VecDeque<DeadLetterEntry>>,
    capacity: usize,
}

impl DeadLetterStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    /// Store `entry`, evicting the oldest entry when full. Returns the number
    /// of entries held afterwards.
    pub fn record(&self, entry: DeadLetterEntry) -> usize {
        warn!(
            message_id = %entry.message_id,
            topic = %entry.topic,
            kind = ?entry.kind,
            attempts = entry.attempt_count,
            reason = %entry.reason,
            "message dead-lettered"
        );
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
        entries.len()
    }

    /// Oldest first.
    pub fn entries(&self) -> Vec<DeadLetterEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
