//! # WebSocket Relay Handler
//!
//! Bridges one client WebSocket on `/ws?session=<token>` to one upstream
//! transcription stream, under strict per-session budgets.
//!
//! ## WebSocket Protocol:
//! 1. **Admission**: origin, rate limit and session token are checked before the upgrade
//! 2. **Hello**: server sends `{"type":"hello","userId":...}`
//! 3. **Start**: the first client message (binary audio or a JSON config) opens
//!    the upstream stream; server sends `{"type":"ready"}`
//! 4. **Audio Streaming**: binary PCM chunks are forwarded upstream
//! 5. **Results**: `{"type":"transcript","isFinal":...,"text":...,"languageCode":...}`
//! 6. **Finish**: client sends `{"type":"end"}` (flush, then `ended`) or
//!    `{"type":"cancel"}` (drop everything, then `canceled`)
//!
//! ## Budgets:
//! - Session length: closed with `max_duration_exceeded`
//! - Total audio bytes: closed with `max_bytes_exceeded`
//! - Silence between audio chunks: closed with `idle_timeout`
//!
//! Budget closes are normal closes (1000) and never produce an `error` frame.

use crate::admission::AdmissionRequest;
use crate::config::UpstreamConfig;
use crate::session::{ConnectionState, DisconnectReason, SessionLimits};
use crate::state::AppState;
use crate::transcription::{StreamingConfig, TranscriptEvent, UpstreamError, UpstreamEvent, UpstreamHandle};

use actix::prelude::*;
use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

const MIN_SAMPLE_RATE_HERTZ: u32 = 8_000;
const MAX_SAMPLE_RATE_HERTZ: u32 = 48_000;
const MAX_ALTERNATIVE_LANGUAGES: usize = 3;

/// Frames sent from the relay to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Hello {
        user_id: String,
    },
    Ready,
    Transcript {
        is_final: bool,
        text: String,
        language_code: Option<String>,
    },
    Error {
        message: String,
        code: String,
    },
    Ended,
    Canceled,
}

impl From<TranscriptEvent> for ServerMessage {
    fn from(event: TranscriptEvent) -> Self {
        ServerMessage::Transcript {
            is_final: event.is_final,
            text: event.text,
            language_code: event.language_code,
        }
    }
}

impl From<&UpstreamError> for ServerMessage {
    fn from(err: &UpstreamError) -> Self {
        ServerMessage::Error {
            message: err.to_string(),
            code: err.code().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    End,
    Cancel,
}

/// Optional recognition overrides a client may send before any audio.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamConfigRequest {
    pub language_code: Option<String>,
    pub alternative_language_codes: Option<Vec<String>>,
    pub sample_rate_hertz: Option<u32>,
}

impl StreamConfigRequest {
    /// Merge the client's overrides into the configured defaults.
    ///
    /// Unusable values fall back to the default instead of failing the session.
    pub fn resolve(&self, defaults: &UpstreamConfig) -> StreamingConfig {
        let language_code = self
            .language_code
            .as_deref()
            .map(str::trim)
            .filter(|code| !code.is_empty())
            .unwrap_or(defaults.language_code.as_str())
            .to_string();

        let alternative_language_codes = self
            .alternative_language_codes
            .as_ref()
            .unwrap_or(&defaults.alternative_language_codes)
            .iter()
            .map(|code| code.trim())
            .filter(|code| !code.is_empty() && *code != language_code)
            .take(MAX_ALTERNATIVE_LANGUAGES)
            .map(str::to_string)
            .collect();

        let sample_rate_hertz = self
            .sample_rate_hertz
            .filter(|rate| (MIN_SAMPLE_RATE_HERTZ..=MAX_SAMPLE_RATE_HERTZ).contains(rate))
            .unwrap_or(defaults.sample_rate_hertz);

        StreamingConfig {
            encoding: defaults.encoding.clone(),
            sample_rate_hertz,
            language_code,
            alternative_language_codes,
            interim_results: defaults.interim_results,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientText {
    Control(ControlMessage),
    Config(StreamConfigRequest),
    Unrecognized,
}

/// Classify a client text frame. Anything that is neither a known control
/// message nor a config object is `Unrecognized` and gets ignored.
pub fn parse_client_text(text: &str) -> ClientText {
    if let Ok(control) = serde_json::from_str::<ControlMessage>(text) {
        return ClientText::Control(control);
    }

    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(value) if value.is_object() && value.get("type").is_none() => {
            match serde_json::from_value::<StreamConfigRequest>(value) {
                Ok(config) => ClientText::Config(config),
                Err(_) => ClientText::Unrecognized,
            }
        }
        _ => ClientText::Unrecognized,
    }
}

/// One actor per client connection.
pub struct RelaySocket {
    state: ConnectionState,
    limits: SessionLimits,
    app_state: AppState,
    upstream: Option<UpstreamHandle>,
    session_timer: Option<SpawnHandle>,
    idle_timer: Option<SpawnHandle>,
    /// `end` received; waiting for the upstream to flush and complete
    finishing: bool,
}

impl RelaySocket {
    pub fn new(state: ConnectionState, app_state: AppState) -> Self {
        let limits = SessionLimits::from(&app_state.config.limits);
        Self {
            state,
            limits,
            app_state,
            upstream: None,
            session_timer: None,
            idle_timer: None,
            finishing: false,
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(e) => warn!("Failed to serialize relay message: {}", e),
        }
    }

    /// Open the upstream stream. Called once, on the first client message.
    fn start_upstream(&mut self, config: StreamingConfig, ctx: &mut ws::WebsocketContext<Self>) {
        debug!(
            connection_id = %self.state.connection_id,
            language = %config.language_code,
            sample_rate = config.sample_rate_hertz,
            "Opening upstream stream"
        );

        let (handle, events) = self.app_state.backend.open_stream(config).into_parts();
        ctx.add_stream(UnboundedReceiverStream::new(events));
        self.upstream = Some(handle);
        self.state.mark_started();

        self.send(ctx, &ServerMessage::Ready);
        self.reset_idle_timer(ctx);
    }

    fn default_stream_config(&self) -> StreamingConfig {
        StreamConfigRequest::default().resolve(&self.app_state.config.upstream)
    }

    fn handle_audio(&mut self, chunk: &[u8], ctx: &mut ws::WebsocketContext<Self>) {
        if self.finishing {
            debug!(connection_id = %self.state.connection_id, "Dropping audio received after end");
            return;
        }

        if let Err(exceeded) = self.state.record_audio(chunk.len(), self.limits.max_bytes_per_session) {
            debug!(connection_id = %self.state.connection_id, total = exceeded.total, "Session byte budget exhausted");
            self.shutdown(DisconnectReason::MaxBytesExceeded, ctx);
            return;
        }

        self.reset_idle_timer(ctx);

        if let Some(upstream) = &self.upstream {
            if !upstream.send_audio(chunk.to_vec()) {
                debug!(connection_id = %self.state.connection_id, "Upstream gone, audio chunk dropped");
            }
        }
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        match parse_client_text(text) {
            ClientText::Control(ControlMessage::End) => self.handle_end(ctx),
            ClientText::Control(ControlMessage::Cancel) => {
                if let Some(upstream) = self.upstream.take() {
                    upstream.abort();
                }
                self.send(ctx, &ServerMessage::Canceled);
                self.shutdown(DisconnectReason::Canceled, ctx);
            }
            ClientText::Config(request) if !self.state.started => {
                let config = request.resolve(&self.app_state.config.upstream);
                self.start_upstream(config, ctx);
            }
            ClientText::Config(_) => {
                debug!(connection_id = %self.state.connection_id, "Ignoring config after stream start");
            }
            ClientText::Unrecognized => {
                debug!(connection_id = %self.state.connection_id, "Ignoring unrecognized text frame");
            }
        }
    }

    fn handle_end(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        if self.finishing {
            return;
        }

        if let Some(upstream) = &self.upstream {
            // Completion of the upstream event stream sends `ended`.
            upstream.finish();
            self.finishing = true;
            self.cancel_timer(TimerKind::Idle, ctx);
        } else {
            self.send(ctx, &ServerMessage::Ended);
            self.shutdown(DisconnectReason::Ended, ctx);
        }
    }

    fn fail_protocol(&mut self, message: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let error = ServerMessage::Error {
            message: message.to_string(),
            code: DisconnectReason::ProtocolError.as_str().to_string(),
        };
        self.send(ctx, &error);
        self.shutdown(DisconnectReason::ProtocolError, ctx);
    }

    fn reset_idle_timer(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        self.cancel_timer(TimerKind::Idle, ctx);
        self.idle_timer = Some(ctx.run_later(self.limits.idle_timeout, |act, ctx| {
            act.idle_timer = None;
            act.shutdown(DisconnectReason::IdleTimeout, ctx);
        }));
    }

    fn cancel_timer(&mut self, kind: TimerKind, ctx: &mut ws::WebsocketContext<Self>) {
        let handle = match kind {
            TimerKind::Session => self.session_timer.take(),
            TimerKind::Idle => self.idle_timer.take(),
        };
        if let Some(handle) = handle {
            ctx.cancel_future(handle);
        }
    }

    /// Close the session for `reason`. Only the first exit path gets here;
    /// later ones are no-ops.
    fn shutdown(&mut self, reason: DisconnectReason, ctx: &mut ws::WebsocketContext<Self>) {
        if !self.state.begin_close(reason) {
            return;
        }

        self.release(reason, ctx);

        ctx.close(Some(ws::CloseReason {
            code: close_code(reason),
            description: Some(reason.as_str().to_string()),
        }));
        ctx.stop();
    }

    /// Release everything the session holds and log it. Never sends to the client.
    fn release(&mut self, reason: DisconnectReason, ctx: &mut ws::WebsocketContext<Self>) {
        self.cancel_timer(TimerKind::Session, ctx);
        self.cancel_timer(TimerKind::Idle, ctx);

        if let Some(upstream) = self.upstream.take() {
            upstream.abort();
        }

        self.app_state.session_closed(reason, self.state.total_bytes_received);

        info!(
            connection_id = %self.state.connection_id,
            ip = %self.state.source_ip,
            user_id = %self.state.claims.user_id,
            duration_ms = self.state.elapsed().as_millis() as u64,
            bytes = self.state.total_bytes_received,
            reason = reason.as_str(),
            "Relay session closed"
        );
    }
}

#[derive(Debug, Clone, Copy)]
enum TimerKind {
    Session,
    Idle,
}

impl Actor for RelaySocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.app_state.session_opened();
        info!(
            connection_id = %self.state.connection_id,
            ip = %self.state.source_ip,
            user_id = %self.state.claims.user_id,
            "Relay session opened"
        );

        self.session_timer = Some(ctx.run_later(self.limits.max_session_duration, |act, ctx| {
            act.session_timer = None;
            act.shutdown(DisconnectReason::MaxDurationExceeded, ctx);
        }));

        let hello = ServerMessage::Hello {
            user_id: self.state.claims.user_id.clone(),
        };
        self.send(ctx, &hello);
    }

    fn stopped(&mut self, ctx: &mut Self::Context) {
        // Client went away without us closing first.
        if self.state.begin_close(DisconnectReason::ClientClosed) {
            self.release(DisconnectReason::ClientClosed, ctx);
        }
    }
}

/// Client frames.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RelaySocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        if self.state.is_closing() {
            return;
        }

        match msg {
            Ok(ws::Message::Binary(data)) => {
                if !self.state.started {
                    let config = self.default_stream_config();
                    self.start_upstream(config, ctx);
                }
                self.handle_audio(&data, ctx);
            }
            Ok(ws::Message::Text(text)) => self.handle_text(&text, ctx),
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Pong(_)) | Ok(ws::Message::Nop) => {}
            Ok(ws::Message::Close(reason)) => {
                debug!(connection_id = %self.state.connection_id, "Client closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(connection_id = %self.state.connection_id, "Fragmented frames are not supported");
                self.fail_protocol("fragmented frames are not supported", ctx);
            }
            Err(err) => {
                warn!(connection_id = %self.state.connection_id, "WebSocket protocol error: {}", err);
                self.fail_protocol(&err.to_string(), ctx);
            }
        }
    }
}

/// Upstream events.
impl StreamHandler<UpstreamEvent> for RelaySocket {
    fn handle(&mut self, event: UpstreamEvent, ctx: &mut Self::Context) {
        if self.state.is_closing() {
            return;
        }

        match event {
            UpstreamEvent::Transcript(transcript) => self.send(ctx, &ServerMessage::from(transcript)),
            UpstreamEvent::Error(err) => {
                warn!(
                    connection_id = %self.state.connection_id,
                    code = err.code(),
                    "Upstream stream failed: {}",
                    err
                );
                self.send(ctx, &ServerMessage::from(&err));
                self.shutdown(DisconnectReason::UpstreamError, ctx);
            }
        }
    }

    // The default would stop the actor without a close frame.
    fn finished(&mut self, ctx: &mut Self::Context) {
        if self.state.is_closing() {
            return;
        }

        let reason = if self.finishing {
            DisconnectReason::Ended
        } else {
            DisconnectReason::UpstreamEnded
        };
        self.send(ctx, &ServerMessage::Ended);
        self.shutdown(reason, ctx);
    }
}

/// Budgets end a session normally; only upstream and protocol failures get
/// an error close code.
fn close_code(reason: DisconnectReason) -> ws::CloseCode {
    match reason {
        _ if reason.is_budget() => ws::CloseCode::Normal,
        DisconnectReason::UpstreamError => ws::CloseCode::Error,
        DisconnectReason::ProtocolError => ws::CloseCode::Protocol,
        _ => ws::CloseCode::Normal,
    }
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    session: Option<String>,
}

/// Rate-limit key for clients whose address could not be determined.
const UNKNOWN_CLIENT_IP: &str = "unknown";

fn client_ip(req: &HttpRequest, trust_forwarded_for: bool) -> Option<String> {
    if trust_forwarded_for {
        req.connection_info().realip_remote_addr().map(str::to_string)
    } else {
        req.peer_addr().map(|addr| addr.ip().to_string())
    }
}

/// WebSocket endpoint handler.
///
/// Admission failures are answered with a plain HTTP status; the socket is
/// only upgraded once every check has passed.
pub async fn relay_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let trust_forwarded_for = app_state.config.server.trust_forwarded_for;
    let ip = client_ip(&req, trust_forwarded_for).unwrap_or_else(|| {
        // Every such client lands in the same rate-limit window.
        warn!(
            trust_forwarded_for,
            "Client address unavailable; counting connection as '{}'", UNKNOWN_CLIENT_IP
        );
        UNKNOWN_CLIENT_IP.to_string()
    });

    // An undecodable Origin is still an Origin; it just never matches.
    let origin = req
        .headers()
        .get(header::ORIGIN)
        .map(|value| value.to_str().unwrap_or("<invalid>"));

    let query = web::Query::<SessionQuery>::from_query(req.query_string()).ok();
    let token = query.as_ref().and_then(|q| q.session.as_deref());

    let request = AdmissionRequest { origin, ip: &ip, token };
    let now_ms = chrono::Utc::now().timestamp_millis();

    let claims = match app_state.admission.admit(&request, Instant::now(), now_ms) {
        Ok(claims) => claims,
        Err(err) => {
            app_state.record_rejection(err.kind());
            warn!(ip = %ip, kind = err.kind(), "Relay connection refused: {}", err);
            return Err(err.into());
        }
    };

    let max_frame_bytes = app_state.config.limits.max_frame_bytes;
    let socket = RelaySocket::new(
        ConnectionState::new(ip.clone(), claims.clone()),
        app_state.get_ref().clone(),
    );

    // The actor does not run until the response is polled, so dropping it
    // after a failed claim never opens a session.
    let response = ws::WsResponseBuilder::new(socket, &req, stream)
        .frame_size(max_frame_bytes)
        .start()?;

    if let Err(err) = app_state.admission.claim_nonce(&claims, now_ms) {
        app_state.record_rejection(err.kind());
        warn!(ip = %ip, kind = err.kind(), "Relay connection refused: {}", err);
        return Err(err.into());
    }

    Ok(response)
}
