//! Credential scoping.
//!
//! An authenticated [`CallerIdentity`] carries a set of [`ScopeGrant`]s, each
//! a channel plus a [`ScopePattern`]. [`ScopeAuthorizer::authorize`] checks a
//! requested [`Resource`] against those grants.
//!
//! # Pattern syntax
//!
//! Patterns are `/`-separated segment lists. A leading `/` is ignored so
//! REST paths and topic names use the same syntax.
//!
//! | Segment | Matches |
//! |---------|---------|
//! | literal | exactly that segment |
//! | `+` or `*` | any single segment |
//! | `#` | the rest of the resource (zero or more segments), last only |
//!
//! `tenant1/devices/#` matches `tenant1/devices/42/status` but never
//! `tenant2/devices/5`. Access is denied by default: an identity without a
//! matching grant is refused, and the refusal is written to the
//! [`AuditLog`].

use crate::artifact::{Channel, now_epoch_ms};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;

// ─────────────────────────────────────────────────────────────────────────────
// Patterns
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Segment {
    Literal(String),
    Single,
    Rest,
}

/// A compiled resource/topic pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ScopePattern {
    raw: String,
    segments: Vec<Segment>,
}

/// A pattern string that does not compile.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid scope pattern '{pattern}': {reason}")]
pub struct InvalidPattern {
    pub pattern: String,
    pub reason: &'static str,
}

fn split_segments(s: &str) -> impl Iterator<Item = &str> {
    s.trim_start_matches('/').split('/')
}

impl ScopePattern {
    pub fn parse(pattern: &str) -> Result<Self, InvalidPattern> {
        let invalid = |reason| InvalidPattern {
            pattern: pattern.to_string(),
            reason,
        };
        if pattern.trim_start_matches('/').is_empty() {
            return Err(invalid("pattern is empty"));
        }

        let parts: Vec<&str> = split_segments(pattern).collect();
        let mut segments = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let segment = match *part {
                "" => return Err(invalid("empty segment")),
                "#" if i + 1 != parts.len() => {
                    return Err(invalid("'#' is only allowed as the last segment"));
                }
                "#" => Segment::Rest,
                "+" | "*" => Segment::Single,
                p if p.contains(['#', '+', '*']) => {
                    return Err(invalid("wildcards must occupy a whole segment"));
                }
                p => Segment::Literal(p.to_string()),
            };
            segments.push(segment);
        }

        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether `resource` falls under this pattern.
    pub fn matches(&self, resource: &str) -> bool {
        let mut parts = split_segments(resource);
        for segment in &self.segments {
            match segment {
                Segment::Rest => return true,
                Segment::Single => match parts.next() {
                    Some(p) if !p.is_empty() => {}
                    _ => return false,
                },
                Segment::Literal(lit) => match parts.next() {
                    Some(p) if p == lit => {}
                    _ => return false,
                },
            }
        }
        parts.next().is_none()
    }

    /// Number of literal segments; higher is more specific.
    pub fn specificity(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Literal(_)))
            .count()
    }
}

impl FromStr for ScopePattern {
    type Err = InvalidPattern;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ScopePattern {
    type Error = InvalidPattern;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<ScopePattern> for String {
    fn from(p: ScopePattern) -> Self {
        p.raw
    }
}

impl fmt::Display for ScopePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Permission to touch resources matching `pattern` on `channel`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeGrant {
    pub channel: Channel,
    pub pattern: ScopePattern,
}

impl ScopeGrant {
    pub fn new(channel: Channel, pattern: ScopePattern) -> Self {
        Self { channel, pattern }
    }

    /// Parse a grant written as `rest:/v1/orders/#` or `pubsub:tenant1/#`.
    pub fn parse(spec: &str) -> Result<Self, InvalidPattern> {
        let invalid = |reason| InvalidPattern {
            pattern: spec.to_string(),
            reason,
        };
        let (channel, pattern) = spec
            .split_once(':')
            .ok_or_else(|| invalid("expected '<channel>:<pattern>'"))?;
        let channel = match channel {
            "rest" => Channel::Rest,
            "pubsub" => Channel::PubSub,
            _ => return Err(invalid("channel must be 'rest' or 'pubsub'")),
        };
        Ok(Self::new(channel, ScopePattern::parse(pattern)?))
    }

    pub fn permits(&self, resource: &Resource) -> bool {
        self.channel == resource.channel && self.pattern.matches(&resource.name)
    }
}

/// A resource being accessed: a REST path or a topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resource {
    pub channel: Channel,
    pub name: String,
}

impl Resource {
    pub fn new(channel: Channel, name: impl Into<String>) -> Self {
        Self {
            channel,
            name: name.into(),
        }
    }

    pub fn rest(path: impl Into<String>) -> Self {
        Self::new(Channel::Rest, path)
    }

    pub fn topic(topic: impl Into<String>) -> Self {
        Self::new(Channel::PubSub, topic)
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel, self.name)
    }
}

/// An authenticated principal and what it may touch.
///
/// Built once at authentication and never mutated afterwards; the pipeline
/// hands it around behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    principal: String,
    grants: Vec<ScopeGrant>,
}

impl CallerIdentity {
    pub fn new(principal: impl Into<String>, grants: impl IntoIterator<Item = ScopeGrant>) -> Self {
        Self {
            principal: principal.into(),
            grants: grants.into_iter().collect(),
        }
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn grants(&self) -> &[ScopeGrant] {
        &self.grants
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Audit
// ─────────────────────────────────────────────────────────────────────────────

/// One refused access attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenialRecord {
    pub principal: String,
    pub resource: Resource,
    pub recorded_at_ms: u64,
}

/// Sink for authorization denials.
pub trait AuditLog: Send + Sync {
    fn record_denial(&self, record: DenialRecord);
}

/// Denials kept by [`InMemoryAuditLog::new`].
pub const DEFAULT_AUDIT_CAPACITY: usize = 1024;

/// Bounded in-memory audit log. When full, the oldest denial is evicted.
#[derive(Debug)]
pub struct InMemoryAuditLog {
    capacity: usize,
    entries: Mutex<VecDeque<DenialRecord>>,
}

impl Default for InMemoryAuditLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_AUDIT_CAPACITY)
    }
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
        }
    }

    /// Retained denials, oldest first.
    pub fn entries(&self) -> Vec<DenialRecord> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl AuditLog for InMemoryAuditLog {
    fn record_denial(&self, record: DenialRecord) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(record);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Authorizer
// ─────────────────────────────────────────────────────────────────────────────

/// The identity has no grant covering the requested resource.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum AuthorizationError {
    #[error("no valid credentials presented")]
    Unauthenticated,
    #[error("principal '{principal}' is not permitted to access {resource}")]
    Forbidden { principal: String, resource: Resource },
}

/// Deny-by-default scope check.
#[derive(Clone)]
pub struct ScopeAuthorizer {
    audit: Arc<dyn AuditLog>,
}

impl fmt::Debug for ScopeAuthorizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeAuthorizer").finish_non_exhaustive()
    }
}

impl ScopeAuthorizer {
    pub fn new(audit: Arc<dyn AuditLog>) -> Self {
        Self { audit }
    }

    /// `true` when some grant of `identity` covers `resource`. A denial is
    /// written to the audit log; nothing else is touched.
    pub fn authorize(&self, identity: &CallerIdentity, resource: &Resource) -> bool {
        if identity.grants.iter().any(|g| g.permits(resource)) {
            return true;
        }
        warn!(
            principal = %identity.principal,
            resource = %resource,
            "authorization denied"
        );
        self.audit.record_denial(DenialRecord {
            principal: identity.principal.clone(),
            resource: resource.clone(),
            recorded_at_ms: now_epoch_ms(),
        });
        false
    }

    /// [`authorize`](Self::authorize) as a `Result`.
    pub fn check(
        &self,
        identity: &CallerIdentity,
        resource: &Resource,
    ) -> Result<(), AuthorizationError> {
        if self.authorize(identity, resource) {
            Ok(())
        } else {
            Err(AuthorizationError::Forbidden {
                principal: identity.principal.clone(),
                resource: resource.clone(),
            })
        }
    }
}
