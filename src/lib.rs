//! # voice-relay
//!
//! Two halves of a voice-activation pipeline:
//! - **trigger**: the singing trigger state machine (pure, no I/O)
//! - **relay**: a WebSocket bridge that admits short-lived sessions and streams
//!   their audio to a cloud speech service under strict budgets
//!
//! ## Module Layout:
//! - **config**: layered configuration (TOML file + environment variables)
//! - **admission**: origin allow-list, per-IP rate limit, session tokens
//! - **session** / **websocket**: per-connection state and the relay actor
//! - **transcription**: upstream stream abstraction and the cloud client
//! - **state**, **health**, **middleware**, **handlers**: the HTTP surface

pub mod admission;
pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod middleware;
pub mod session;
pub mod state;
pub mod transcription;
pub mod trigger;
pub mod websocket;

use actix_cors::Cors;
use actix_web::web;

/// Register every route. CORS only wraps the JSON API: `/ws` does its own
/// origin check so refused origins get a 403 instead of a CORS error.
pub fn routes(allowed_origins: Vec<String>) -> impl FnOnce(&mut web::ServiceConfig) {
    move |cfg: &mut web::ServiceConfig| {
        let cors = allowed_origins
            .iter()
            .fold(Cors::default(), |cors, origin| cors.allowed_origin(origin))
            .allowed_methods(vec!["GET"])
            .max_age(3600);

        cfg.route("/healthz", web::get().to(health::healthz))
            .route("/ws", web::get().to(websocket::relay_websocket))
            .service(
                web::scope("/api/v1")
                    .wrap(cors)
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_public_config)),
            );
    }
}
