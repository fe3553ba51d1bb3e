//! Servicio que convierte documentos en grafos de conocimiento y permite
//! compartirlos mediante enlaces.
//!
//! Flujo: subida → extracción de texto → chunks → grafo por chunk (LLM) →
//! caché indexada por fichero → consulta con contador de visitas.

pub mod api;
pub mod app_state;
pub mod cache;
pub mod config;
pub mod document;
pub mod error;
pub mod extraction;
pub mod llm;
pub mod models;
pub mod neo4j_client;
pub mod processor;
pub mod secrets;
pub mod storage;

use axum::{
    http::{header, HeaderName, Method},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::app_state::AppState;

/// Router completo con CORS y trazas HTTP.
pub fn build_app(app_state: AppState) -> Router {
    api::create_router(app_state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE, HeaderName::from_static("x-api-key")]),
        )
        .layer(TraceLayer::new_for_http())
}
