//! Session identity for published telemetry
//!
//! A session groups the points a client produces inside one TTL window.
//! The id is embedded in every topic, so rotation changes where new points
//! land without touching points already queued.

use chrono::{DateTime, Duration, Utc};
use tracing::info;
use uuid::Uuid;

/// Prefix for generated session ids
const SESSION_PREFIX: &str = "sess";

/// Generate a random session id (`sess-<32 hex>`), backed by the OS CSPRNG
pub fn new_session_id() -> String {
    format!("{}-{}", SESSION_PREFIX, Uuid::new_v4().simple())
}

/// Current client session
#[derive(Debug, Clone)]
pub struct Session {
    client_id: String,
    session_id: String,
    started_at: DateTime<Utc>,
    ttl: Option<Duration>,
    /// Set when the id was supplied by the deployer; pinned ids never rotate
    pinned: bool,
}

impl Session {
    /// Create a session starting now
    ///
    /// A zero or negative `ttl` disables rotation. A non-empty
    /// `fixed_session_id` is used verbatim and pinned.
    pub fn new(client_id: &str, ttl: Option<Duration>, fixed_session_id: Option<&str>) -> Self {
        Self::started_at(client_id, ttl, fixed_session_id, Utc::now())
    }

    /// Create a session with an explicit window start
    pub fn started_at(
        client_id: &str,
        ttl: Option<Duration>,
        fixed_session_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Self {
        let fixed = fixed_session_id.filter(|id| !id.is_empty());
        Self {
            client_id: client_id.to_string(),
            session_id: fixed.map(str::to_string).unwrap_or_else(new_session_id),
            started_at: now,
            ttl: ttl.filter(|ttl| *ttl > Duration::zero()),
            pinned: fixed.is_some(),
        }
    }

    /// Rotate the session id if the TTL window has elapsed
    ///
    /// Checked on every publish attempt; there is no rotation timer.
    pub fn maybe_rotate(&mut self) -> bool {
        self.maybe_rotate_at(Utc::now())
    }

    /// Clock-injected form of [`Session::maybe_rotate`]
    pub fn maybe_rotate_at(&mut self, now: DateTime<Utc>) -> bool {
        let Some(ttl) = self.ttl else { return false };
        if self.pinned || now - self.started_at < ttl {
            return false;
        }

        let previous = std::mem::replace(&mut self.session_id, new_session_id());
        self.started_at = now;
        info!(
            client_id = %self.client_id,
            previous = %previous,
            session_id = %self.session_id,
            "session_rotated"
        );
        true
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn started(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }
}
