//! Upstream transcription stream abstraction.
//!
//! A backend turns one [`StreamingConfig`] into a duplex stream: the relay
//! pushes [`UpstreamRequest`]s in and reads [`UpstreamEvent`]s out. The stream
//! is finished when the backend drops its event sender, which happens after a
//! graceful finish, an abort, or an error (the error is sent first).

use serde::Serialize;
use std::fmt;
use tokio::sync::mpsc;

/// Recognition settings sent as the first upstream message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingConfig {
    pub encoding: String,
    pub sample_rate_hertz: u32,
    pub language_code: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub alternative_language_codes: Vec<String>,
    #[serde(skip)]
    pub interim_results: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamRequest {
    /// Raw audio bytes, wrapped by the backend in its own envelope
    Audio(Vec<u8>),
    /// No more audio: flush trailing results, then complete
    Finish,
    /// Stop immediately, results are no longer wanted
    Abort,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEvent {
    pub text: String,
    pub is_final: bool,
    pub language_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    Transcript(TranscriptEvent),
    Error(UpstreamError),
}

/// Failures reported by the transcription backend.
///
/// Quota exhaustion is kept apart so clients can back off instead of retrying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    QuotaExceeded(String),
    Stream(String),
}

impl UpstreamError {
    /// Code carried in the downstream `error` frame.
    pub fn code(&self) -> &'static str {
        match self {
            UpstreamError::QuotaExceeded(_) => "quota_exceeded",
            UpstreamError::Stream(_) => "upstream_error",
        }
    }
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamError::QuotaExceeded(msg) => write!(f, "Transcription quota exceeded: {}", msg),
            UpstreamError::Stream(msg) => write!(f, "Transcription stream failed: {}", msg),
        }
    }
}

impl std::error::Error for UpstreamError {}

/// Opens upstream streams. One instance is shared by every connection.
pub trait TranscriptionBackend: Send + Sync {
    /// Open a stream for `config`. Must not block: connection work happens in
    /// the background and failures arrive as [`UpstreamEvent::Error`].
    fn open_stream(&self, config: StreamingConfig) -> UpstreamStream;
}

/// Relay-side end of an upstream stream.
pub struct UpstreamStream {
    handle: UpstreamHandle,
    events: mpsc::UnboundedReceiver<UpstreamEvent>,
}

impl UpstreamStream {
    pub fn into_parts(self) -> (UpstreamHandle, mpsc::UnboundedReceiver<UpstreamEvent>) {
        (self.handle, self.events)
    }
}

/// Sending half kept by the connection for the stream's lifetime.
#[derive(Debug, Clone)]
pub struct UpstreamHandle {
    requests: mpsc::UnboundedSender<UpstreamRequest>,
}

impl UpstreamHandle {
    /// Returns false once the backend has gone away.
    pub fn send_audio(&self, chunk: Vec<u8>) -> bool {
        self.requests.send(UpstreamRequest::Audio(chunk)).is_ok()
    }

    pub fn finish(&self) {
        let _ = self.requests.send(UpstreamRequest::Finish);
    }

    pub fn abort(&self) {
        let _ = self.requests.send(UpstreamRequest::Abort);
    }
}

/// Backend-side end of an upstream stream.
pub struct BackendChannel {
    pub requests: mpsc::UnboundedReceiver<UpstreamRequest>,
    pub events: mpsc::UnboundedSender<UpstreamEvent>,
}

/// Create a connected relay/backend pair.
pub fn upstream_channel() -> (UpstreamStream, BackendChannel) {
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    (
        UpstreamStream {
            handle: UpstreamHandle { requests: request_tx },
            events: event_rx,
        },
        BackendChannel {
            requests: request_rx,
            events: event_tx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_pairs_both_directions() {
        let (stream, mut backend) = upstream_channel();
        let (handle, mut events) = stream.into_parts();

        assert!(handle.send_audio(vec![1, 2, 3]));
        handle.finish();
        assert_eq!(backend.requests.recv().await, Some(UpstreamRequest::Audio(vec![1, 2, 3])));
        assert_eq!(backend.requests.recv().await, Some(UpstreamRequest::Finish));

        backend
            .events
            .send(UpstreamEvent::Error(UpstreamError::QuotaExceeded("daily".into())))
            .unwrap();
        drop(backend);

        assert!(matches!(events.recv().await, Some(UpstreamEvent::Error(_))));
        assert!(events.recv().await.is_none());
        assert!(!handle.send_audio(vec![4]));
    }

    #[test]
    fn test_error_codes_distinguish_quota() {
        assert_eq!(UpstreamError::QuotaExceeded("x".into()).code(), "quota_exceeded");
        assert_eq!(UpstreamError::Stream("x".into()).code(), "upstream_error");
    }
}
