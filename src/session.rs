//! Per-connection session bookkeeping.
//!
//! [`ConnectionState`] holds the plain data of one relay session; the actor in
//! [`crate::websocket`] owns it together with its timers and upstream handle.

use crate::admission::SessionClaims;
use crate::config::LimitsConfig;
use serde::Serialize;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Why a session ended. Recorded once, logged at teardown and used as the
/// WebSocket close reason where the client did not close first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    ClientClosed,
    MaxDurationExceeded,
    MaxBytesExceeded,
    IdleTimeout,
    Ended,
    Canceled,
    UpstreamError,
    /// The transcription service finished without being asked to
    UpstreamEnded,
    ProtocolError,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::ClientClosed => "client_closed",
            DisconnectReason::MaxDurationExceeded => "max_duration_exceeded",
            DisconnectReason::MaxBytesExceeded => "max_bytes_exceeded",
            DisconnectReason::IdleTimeout => "idle_timeout",
            DisconnectReason::Ended => "ended",
            DisconnectReason::Canceled => "canceled",
            DisconnectReason::UpstreamError => "upstream_error",
            DisconnectReason::UpstreamEnded => "upstream_ended",
            DisconnectReason::ProtocolError => "protocol_error",
        }
    }

    /// Budget exhaustion is a normal close, never reported as an error.
    pub fn is_budget(&self) -> bool {
        matches!(
            self,
            DisconnectReason::MaxDurationExceeded | DisconnectReason::MaxBytesExceeded | DisconnectReason::IdleTimeout
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    pub max_session_duration: Duration,
    pub idle_timeout: Duration,
    pub max_bytes_per_session: u64,
}

impl From<&LimitsConfig> for SessionLimits {
    fn from(limits: &LimitsConfig) -> Self {
        Self {
            max_session_duration: limits.max_session_duration(),
            idle_timeout: limits.idle_timeout(),
            max_bytes_per_session: limits.max_bytes_per_session,
        }
    }
}

/// Returned when a chunk would push the session past its byte budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteBudgetExceeded {
    pub total: u64,
}

#[derive(Debug)]
pub struct ConnectionState {
    pub connection_id: Uuid,
    pub source_ip: String,
    pub claims: SessionClaims,
    pub started_at: Instant,
    /// True once the upstream stream has been opened
    pub started: bool,
    pub total_bytes_received: u64,
    /// Set exactly once, by the first exit path to run
    pub disconnect_reason: Option<DisconnectReason>,
}

impl ConnectionState {
    pub fn new(source_ip: String, claims: SessionClaims) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            source_ip,
            claims,
            started_at: Instant::now(),
            started: false,
            total_bytes_received: 0,
            disconnect_reason: None,
        }
    }

    /// Count an inbound audio chunk. The chunk that crosses `max_bytes` is
    /// counted but must not be forwarded.
    pub fn record_audio(&mut self, len: usize, max_bytes: u64) -> Result<(), ByteBudgetExceeded> {
        self.total_bytes_received = self.total_bytes_received.saturating_add(len as u64);
        if self.total_bytes_received > max_bytes {
            return Err(ByteBudgetExceeded { total: self.total_bytes_received });
        }
        Ok(())
    }

    pub fn mark_started(&mut self) {
        self.started = true;
    }

    /// Claim teardown for `reason`. Only the first caller gets `true`.
    pub fn begin_close(&mut self, reason: DisconnectReason) -> bool {
        if self.disconnect_reason.is_some() {
            return false;
        }
        self.disconnect_reason = Some(reason);
        true
    }

    pub fn is_closing(&self) -> bool {
        self.disconnect_reason.is_some()
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}
