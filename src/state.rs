//! # Application State
//!
//! Everything shared between request handlers and relay connections lives in
//! [`AppState`], cloned into each worker via `web::Data`.
//!
//! Only two pieces are shared and mutable:
//! - **metrics**: `Arc<RwLock<RelayMetrics>>`, updated by middleware and sessions
//! - **admission stores**: the rate-limit windows and nonce cache inside
//!   [`AdmissionPolicy`], each behind its own mutex
//!
//! Configuration is immutable after startup, so it is a plain `Arc`.

use crate::admission::{AdmissionPolicy, ConnectionThrottle, TokenVerifier};
use crate::config::AppConfig;
use crate::session::DisconnectReason;
use crate::transcription::TranscriptionBackend;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub metrics: Arc<RwLock<RelayMetrics>>,
    pub admission: Arc<AdmissionPolicy>,
    pub backend: Arc<dyn TranscriptionBackend>,
    pub start_time: Instant,
}

/// Counters exposed on `/api/v1/metrics`. Never holds user content.
#[derive(Debug, Default, Clone)]
pub struct RelayMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Requests answered with a 4xx or 5xx status
    pub error_count: u64,

    /// Relay sessions currently open
    pub active_sessions: u32,

    pub sessions_opened: u64,

    /// Audio bytes received from clients across all closed sessions
    pub audio_bytes_relayed: u64,

    /// Refused upgrades by error kind (`forbidden`, `rate_limited`, `unauthorized`)
    pub rejections: HashMap<String, u64>,

    /// Closed sessions by disconnect reason
    pub disconnects: HashMap<String, u64>,

    /// Key: "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        backend: Arc<dyn TranscriptionBackend>,
        throttle: Arc<dyn ConnectionThrottle>,
    ) -> anyhow::Result<Self> {
        let verifier = TokenVerifier::new(config.auth.session_secret.as_bytes())?;
        let admission = AdmissionPolicy::new(
            config.server.allowed_origins.clone(),
            throttle,
            verifier,
            config.auth.replay_protection,
        );

        Ok(Self {
            config: Arc::new(config),
            metrics: Arc::new(RwLock::new(RelayMetrics::default())),
            admission: Arc::new(admission),
            backend,
            start_time: Instant::now(),
        })
    }

    // Metrics are plain counters, so a poisoned lock still holds usable data.
    fn metrics_mut(&self) -> RwLockWriteGuard<'_, RelayMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn increment_request_count(&self) {
        self.metrics_mut().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics_mut().error_count += 1;
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_mut();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn record_rejection(&self, kind: &str) {
        *self.metrics_mut().rejections.entry(kind.to_string()).or_default() += 1;
    }

    pub fn session_opened(&self) {
        let mut metrics = self.metrics_mut();
        metrics.active_sessions += 1;
        metrics.sessions_opened += 1;
    }

    pub fn session_closed(&self, reason: DisconnectReason, bytes_received: u64) {
        let mut metrics = self.metrics_mut();
        metrics.active_sessions = metrics.active_sessions.saturating_sub(1);
        metrics.audio_bytes_relayed += bytes_received;
        *metrics.disconnects.entry(reason.as_str().to_string()).or_default() += 1;
    }

    /// Copy of the current counters, taken under the read lock.
    pub fn metrics_snapshot(&self) -> RelayMetrics {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of failed requests, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::FixedWindowLimiter;
    use crate::transcription::{upstream_channel, StreamingConfig, UpstreamStream};
    use std::time::Duration;

    struct NullBackend;

    impl TranscriptionBackend for NullBackend {
        fn open_stream(&self, _config: StreamingConfig) -> UpstreamStream {
            upstream_channel().0
        }
    }

    fn state() -> AppState {
        let mut config = AppConfig::default();
        config.auth.session_secret = "0123456789abcdef0123456789abcdef".to_string();
        AppState::new(
            config,
            Arc::new(NullBackend),
            Arc::new(FixedWindowLimiter::new(10, Duration::from_secs(60))),
        )
        .unwrap()
    }

    #[test]
    fn test_session_counters() {
        let state = state();
        state.session_opened();
        state.session_opened();
        state.session_closed(DisconnectReason::IdleTimeout, 1_000);

        let metrics = state.metrics_snapshot();
        assert_eq!(metrics.active_sessions, 1);
        assert_eq!(metrics.sessions_opened, 2);
        assert_eq!(metrics.audio_bytes_relayed, 1_000);
        assert_eq!(metrics.disconnects.get("idle_timeout"), Some(&1));
    }

    #[test]
    fn test_active_sessions_never_underflow() {
        let state = state();
        state.session_closed(DisconnectReason::ClientClosed, 0);
        assert_eq!(state.metrics_snapshot().active_sessions, 0);
    }

    #[test]
    fn test_endpoint_metrics() {
        let state = state();
        state.record_endpoint_request("GET /healthz", 10, false);
        state.record_endpoint_request("GET /healthz", 30, true);
        state.record_rejection("rate_limited");

        let metrics = state.metrics_snapshot();
        let endpoint = &metrics.endpoint_metrics["GET /healthz"];
        assert_eq!(endpoint.average_duration_ms(), 20.0);
        assert_eq!(endpoint.error_rate(), 0.5);
        assert_eq!(metrics.rejections.get("rate_limited"), Some(&1));
    }
}
