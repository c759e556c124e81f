//! # Cloud Streaming Backend
//!
//! Speaks to the cloud speech service over a WebSocket, one upstream socket
//! per relay session.
//!
//! ## Upstream Protocol:
//! 1. **Connect** with `Authorization: Bearer <api_key>`
//! 2. **Config**: `{"streamingConfig": {"config": {...}, "interimResults": true}}`
//! 3. **Audio**: `{"audioContent": "<base64 PCM>"}` per chunk
//! 4. **Finish**: `{"endOfAudio": true}`; the service flushes trailing results and closes
//!
//! Responses carry `{"results": [...]}` or `{"error": {...}}`. An error with
//! gRPC code 8 / `RESOURCE_EXHAUSTED`, or HTTP 429 on connect, is reported as
//! [`UpstreamError::QuotaExceeded`].

use super::backend::{
    upstream_channel, BackendChannel, StreamingConfig, TranscriptEvent, TranscriptionBackend,
    UpstreamError, UpstreamEvent, UpstreamRequest, UpstreamStream,
};
use crate::config::UpstreamConfig;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, warn};

const RESOURCE_EXHAUSTED_CODE: i32 = 8;

#[derive(Debug, Clone)]
pub struct CloudStreamingBackend {
    url: String,
    api_key: String,
    connect_timeout: Duration,
}

impl CloudStreamingBackend {
    pub fn new(config: &UpstreamConfig) -> Self {
        Self {
            url: config.url.clone(),
            api_key: config.api_key.clone(),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
        }
    }
}

impl TranscriptionBackend for CloudStreamingBackend {
    fn open_stream(&self, config: StreamingConfig) -> UpstreamStream {
        let (stream, channel) = upstream_channel();
        tokio::spawn(run_stream(self.clone(), config, channel));
        stream
    }
}

async fn run_stream(backend: CloudStreamingBackend, config: StreamingConfig, mut channel: BackendChannel) {
    match drive_stream(&backend, &config, &mut channel).await {
        Ok(()) => debug!("Upstream transcription stream completed"),
        Err(err) => {
            warn!(code = err.code(), "Upstream transcription stream failed: {}", err);
            let _ = channel.events.send(UpstreamEvent::Error(err));
        }
    }
    // Dropping the channel here completes the relay's event stream.
}

async fn drive_stream(
    backend: &CloudStreamingBackend,
    config: &StreamingConfig,
    channel: &mut BackendChannel,
) -> Result<(), UpstreamError> {
    let mut request = backend
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| UpstreamError::Stream(format!("invalid upstream url: {}", e)))?;

    if !backend.api_key.is_empty() {
        let value = HeaderValue::from_str(&format!("Bearer {}", backend.api_key))
            .map_err(|e| UpstreamError::Stream(format!("invalid upstream api key: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let (socket, _) = tokio::time::timeout(backend.connect_timeout, connect_async(request))
        .await
        .map_err(|_| UpstreamError::Stream("timed out connecting to transcription service".to_string()))?
        .map_err(classify_connect_error)?;

    let (mut sink, mut source) = socket.split();

    sink.send(Message::Text(encode(&ConfigEnvelope::new(config))?))
        .await
        .map_err(stream_error)?;

    let mut finishing = false;

    loop {
        tokio::select! {
            request = channel.requests.recv(), if !finishing => match request {
                Some(UpstreamRequest::Audio(chunk)) => {
                    let envelope = AudioEnvelope { audio_content: STANDARD.encode(&chunk) };
                    sink.send(Message::Text(encode(&envelope)?)).await.map_err(stream_error)?;
                }
                Some(UpstreamRequest::Finish) => {
                    finishing = true;
                    sink.send(Message::Text(encode(&EndOfAudio { end_of_audio: true })?))
                        .await
                        .map_err(stream_error)?;
                }
                Some(UpstreamRequest::Abort) | None => {
                    let _ = sink.close().await;
                    return Ok(());
                }
            },
            message = source.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    for event in parse_response(&text)? {
                        if channel.events.send(event).is_err() {
                            let _ = sink.close().await;
                            return Ok(());
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {}
                Some(Err(WsError::ConnectionClosed)) => return Ok(()),
                Some(Err(err)) => return Err(stream_error(err)),
            },
            // The relay dropped its end: nobody is listening any more.
            _ = channel.events.closed() => {
                let _ = sink.close().await;
                return Ok(());
            }
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfigEnvelope<'a> {
    streaming_config: StreamingConfigBody<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StreamingConfigBody<'a> {
    config: &'a StreamingConfig,
    interim_results: bool,
}

impl<'a> ConfigEnvelope<'a> {
    fn new(config: &'a StreamingConfig) -> Self {
        Self {
            streaming_config: StreamingConfigBody {
                config,
                interim_results: config.interim_results,
            },
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AudioEnvelope {
    audio_content: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EndOfAudio {
    end_of_audio: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamingResponse {
    #[serde(default)]
    results: Vec<StreamingResult>,
    error: Option<RpcStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamingResult {
    #[serde(default)]
    alternatives: Vec<Alternative>,
    #[serde(default)]
    is_final: bool,
    language_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    #[serde(default)]
    transcript: String,
}

#[derive(Debug, Deserialize)]
struct RpcStatus {
    code: Option<i32>,
    #[serde(default)]
    message: String,
    status: Option<String>,
}

impl RpcStatus {
    fn into_error(self) -> UpstreamError {
        let exhausted = self.code == Some(RESOURCE_EXHAUSTED_CODE)
            || self.status.as_deref() == Some("RESOURCE_EXHAUSTED");
        if exhausted {
            UpstreamError::QuotaExceeded(self.message)
        } else {
            UpstreamError::Stream(self.message)
        }
    }
}

/// Turn one upstream response frame into transcript events. Only the top
/// alternative of each result is relayed.
fn parse_response(text: &str) -> Result<Vec<UpstreamEvent>, UpstreamError> {
    let response: StreamingResponse = serde_json::from_str(text)
        .map_err(|e| UpstreamError::Stream(format!("unreadable transcription response: {}", e)))?;

    if let Some(status) = response.error {
        return Err(status.into_error());
    }

    Ok(response
        .results
        .into_iter()
        .filter_map(|result| {
            let top = result.alternatives.into_iter().next()?;
            Some(UpstreamEvent::Transcript(TranscriptEvent {
                text: top.transcript,
                is_final: result.is_final,
                language_code: result.language_code,
            }))
        })
        .collect())
}

fn classify_connect_error(err: WsError) -> UpstreamError {
    match &err {
        WsError::Http(response) if response.status().as_u16() == 429 => {
            UpstreamError::QuotaExceeded(format!("transcription service returned {}", response.status()))
        }
        _ => UpstreamError::Stream(err.to_string()),
    }
}

fn stream_error(err: WsError) -> UpstreamError {
    UpstreamError::Stream(err.to_string())
}

fn encode<T: Serialize>(value: &T) -> Result<String, UpstreamError> {
    serde_json::to_string(value).map_err(|e| UpstreamError::Stream(format!("failed to encode request: {}", e)))
}
