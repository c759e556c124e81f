//! # Transcription Module
//!
//! The relay never transcribes anything itself. It opens one streaming
//! session per client against a [`TranscriptionBackend`] and shuttles audio
//! in and transcripts out.
//!
//! ## Key Components:
//! - **Backend seam**: [`TranscriptionBackend`] plus the channel pair that links a
//!   relay connection to its upstream stream
//! - **Cloud backend**: [`CloudStreamingBackend`], the WebSocket client for the
//!   cloud speech service

pub mod backend; // Stream abstraction shared by every backend
pub mod cloud; // Cloud speech service client

pub use backend::{
    upstream_channel, BackendChannel, StreamingConfig, TranscriptEvent, TranscriptionBackend,
    UpstreamError, UpstreamEvent, UpstreamHandle, UpstreamRequest, UpstreamStream,
};
pub use cloud::CloudStreamingBackend;
