//! HTTP API: OpenAI-compatible inference plus model and backend management

pub mod handlers;
pub mod models;
pub mod routes;

pub use routes::{AppState, create_router};
