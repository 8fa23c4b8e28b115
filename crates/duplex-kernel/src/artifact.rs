//! Inbound artifacts and their processing lifecycle.
//!
//! Both channels feed the same pipeline. An [`InboundArtifact`] is either a
//! synchronous [`RestRequest`] or an asynchronous [`PubSubMessage`]; each
//! carries the raw payload bytes, the declared contract version (if any) and
//! the credential the caller presented.
//!
//! ```text
//! Received ──► Authenticating ──► Validating ──► Accepted ──► Dispatched
//!                    │                 │
//!                    └──► Rejected ◄───┘
//! ```
//!
//! No transition skips `Authenticating` or `Validating`; `Dispatched` and
//! `Rejected` are terminal.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Header carrying the declared contract version on both channels.
pub const CONTRACT_VERSION_HEADER: &str = "x-contract-version";
/// Header carrying an API key.
pub const API_KEY_HEADER: &str = "x-api-key";

// ─────────────────────────────────────────────────────────────────────────────
// Channel
// ─────────────────────────────────────────────────────────────────────────────

/// The two transport channels served by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Rest,
    PubSub,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Rest => "rest",
            Channel::PubSub => "pubsub",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP primitives
// ─────────────────────────────────────────────────────────────────────────────

/// HTTP method, covering the verbs routed by the REST channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    /// Case-insensitive parse from a string slice.
    pub fn from_str_ci(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "GET" => Some(HttpMethod::Get),
            "POST" => Some(HttpMethod::Post),
            "PUT" => Some(HttpMethod::Put),
            "PATCH" => Some(HttpMethod::Patch),
            "DELETE" => Some(HttpMethod::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// REST request
// ─────────────────────────────────────────────────────────────────────────────

/// A synchronous request received on the REST channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestRequest {
    /// Correlation id for logs and traces.
    pub id: String,
    pub method: HttpMethod,
    /// Request path, e.g. `/v1/orders/42`.
    pub path: String,
    /// Header names are lowercased.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    /// Values captured by `{name}` segments of the matched route.
    #[serde(default)]
    pub path_params: HashMap<String, String>,
}

impl RestRequest {
    pub fn new(id: impl Into<String>, method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            method,
            path: path.into(),
            headers: HashMap::new(),
            body: Vec::new(),
            path_params: HashMap::new(),
        }
    }

    /// Builder helper: attach a header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into().to_lowercase(), value.into());
        self
    }

    /// Builder helper: set the body.
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_path_params(mut self, params: HashMap<String, String>) -> Self {
        self.path_params = params;
        self
    }

    /// Presented API key: `X-Api-Key` first, then `Authorization: Bearer`.
    pub fn credential(&self) -> Option<&str> {
        self.headers.get(API_KEY_HEADER).map(String::as_str).or_else(|| {
            self.headers
                .get("authorization")
                .and_then(|auth| auth.strip_prefix("Bearer "))
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pub/sub message
// ─────────────────────────────────────────────────────────────────────────────

/// A message received on the pub/sub channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PubSubMessage {
    /// Transport-assigned id; stable across redeliveries of the same message.
    pub message_id: String,
    pub topic: String,
    pub headers: HashMap<String, String>,
    pub payload: Vec<u8>,
    pub timestamp_ms: u64,
}

impl PubSubMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            topic: topic.into(),
            headers: HashMap::new(),
            payload: payload.into(),
            timestamp_ms: now_epoch_ms(),
        }
    }

    pub fn with_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into().to_lowercase(), value.into());
        self
    }

    pub fn credential(&self) -> Option<&str> {
        self.headers.get(API_KEY_HEADER).map(String::as_str)
    }
}

pub(crate) fn now_epoch_ms() -> u64 {
    u64::try_from(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis(),
    )
    .unwrap_or(u64::MAX)
}

// ─────────────────────────────────────────────────────────────────────────────
// Inbound artifact
// ─────────────────────────────────────────────────────────────────────────────

/// Tagged union of everything the gateway accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "channel", rename_all = "snake_case")]
pub enum InboundArtifact {
    Rest(RestRequest),
    PubSub(PubSubMessage),
}

impl InboundArtifact {
    pub fn channel(&self) -> Channel {
        match self {
            InboundArtifact::Rest(_) => Channel::Rest,
            InboundArtifact::PubSub(_) => Channel::PubSub,
        }
    }

    /// Request id or message id.
    pub fn id(&self) -> &str {
        match self {
            InboundArtifact::Rest(r) => &r.id,
            InboundArtifact::PubSub(m) => &m.message_id,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            InboundArtifact::Rest(r) => &r.body,
            InboundArtifact::PubSub(m) => &m.payload,
        }
    }

    /// Resource the caller is acting on: the request path or the topic.
    pub fn resource(&self) -> &str {
        match self {
            InboundArtifact::Rest(r) => &r.path,
            InboundArtifact::PubSub(m) => &m.topic,
        }
    }

    /// Route parameters; always empty for pub/sub messages.
    pub fn path_params(&self) -> HashMap<String, String> {
        match self {
            InboundArtifact::Rest(r) => r.path_params.clone(),
            InboundArtifact::PubSub(_) => HashMap::new(),
        }
    }

    pub fn credential(&self) -> Option<&str> {
        match self {
            InboundArtifact::Rest(r) => r.credential(),
            InboundArtifact::PubSub(m) => m.credential(),
        }
    }

    /// Raw declared contract version header, unparsed.
    pub fn declared_version(&self) -> Option<&str> {
        let headers = match self {
            InboundArtifact::Rest(r) => &r.headers,
            InboundArtifact::PubSub(m) => &m.headers,
        };
        headers
            .get(CONTRACT_VERSION_HEADER)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Lifecycle
// ─────────────────────────────────────────────────────────────────────────────

/// Processing state of one inbound artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactState {
    Received,
    Authenticating,
    Validating,
    Accepted,
    Rejected,
    Dispatched,
}

impl ArtifactState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ArtifactState::Rejected | ArtifactState::Dispatched)
    }

    /// Whether `self → next` is a legal step.
    pub fn can_transition_to(&self, next: ArtifactState) -> bool {
        use ArtifactState::*;
        matches!(
            (self, next),
            (Received, Authenticating)
                | (Authenticating, Validating)
                | (Authenticating, Rejected)
                | (Validating, Accepted)
                | (Validating, Rejected)
                | (Accepted, Dispatched)
        )
    }
}

/// Attempted an illegal lifecycle step.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal artifact transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: ArtifactState,
    pub to: ArtifactState,
}

/// State machine guard for one artifact. Records every state visited.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: ArtifactState,
    history: Vec<ArtifactState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: ArtifactState::Received,
            history: vec![ArtifactState::Received],
        }
    }

    pub fn state(&self) -> ArtifactState {
        self.state
    }

    pub fn history(&self) -> &[ArtifactState] {
        &self.history
    }

    pub fn advance(&mut self, next: ArtifactState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.history.push(next);
        Ok(())
    }
}
