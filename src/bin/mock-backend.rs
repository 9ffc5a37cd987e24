//! Stand-in inference backend
//!
//! Speaks just enough of the llama.cpp / whisper.cpp / stable-diffusion
//! server protocols for the gateway to health-check it and forward requests
//! to it. Used by the integration tests and for local smoke runs without a
//! GPU.

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Multipart, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use clap::Parser;
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(name = "mock-backend", about = "Fake inference backend for gateway testing")]
struct Args {
    /// Port to listen on
    #[clap(long)]
    port: u16,

    /// Backend kind to impersonate (text, audio or image)
    #[clap(long, default_value = "text")]
    kind: String,

    /// Model file; only its file name is reported
    #[clap(long)]
    model: Option<String>,

    /// Delay before the server starts answering
    #[clap(long, default_value = "0")]
    startup_delay_ms: u64,

    /// Answer health checks with 503 forever
    #[clap(long)]
    never_ready: bool,
}

struct Backend {
    kind: String,
    model: String,
    never_ready: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt().with_env_filter("info").init();

    let model = args
        .model
        .as_deref()
        .and_then(|m| Path::new(m).file_name())
        .map(|m| m.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("mock-{}", args.kind));

    let backend = Arc::new(Backend {
        kind: args.kind,
        model,
        never_ready: args.never_ready,
    });

    let app = Router::new()
        .route("/v1/models", get(models))
        .route("/v1/chat/completions", post(chat))
        .route("/v1/completions", post(completion))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/responses", post(responses))
        .route("/inference", post(inference))
        .route("/v1/images/generations", post(images))
        .with_state(backend.clone());

    tokio::time::sleep(Duration::from_millis(args.startup_delay_ms)).await;

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", args.port))
        .await
        .with_context(|| format!("Failed to bind port {}", args.port))?;
    tracing::info!(
        port = args.port,
        kind = %backend.kind,
        model = %backend.model,
        "Mock backend listening"
    );

    axum::serve(listener, app).await.context("Mock backend server error")?;
    Ok(())
}

async fn models(State(backend): State<Arc<Backend>>) -> impl IntoResponse {
    if backend.never_ready {
        return (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": "loading model"})));
    }
    (
        StatusCode::OK,
        Json(json!({"object": "list", "data": [{"id": backend.model, "object": "model"}]})),
    )
}

fn last_user_message(body: &Value) -> String {
    body["messages"]
        .as_array()
        .and_then(|m| m.last())
        .and_then(|m| m["content"].as_str())
        .unwrap_or_default()
        .to_string()
}

async fn chat(State(backend): State<Arc<Backend>>, Json(body): Json<Value>) -> Json<Value> {
    let content = format!("[{}] {}", backend.model, last_user_message(&body));
    Json(json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": backend.model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}
    }))
}

async fn completion(State(backend): State<Arc<Backend>>, Json(body): Json<Value>) -> Json<Value> {
    let prompt = body["prompt"].as_str().unwrap_or_default();
    Json(json!({
        "id": "cmpl-mock",
        "object": "text_completion",
        "model": backend.model,
        "choices": [{
            "index": 0,
            "text": format!("[{}] {prompt}", backend.model),
            "finish_reason": "stop"
        }]
    }))
}

async fn embeddings(State(backend): State<Arc<Backend>>) -> Json<Value> {
    Json(json!({
        "object": "list",
        "model": backend.model,
        "data": [{"object": "embedding", "index": 0, "embedding": [0.0, 0.5, 1.0]}]
    }))
}

async fn responses(State(backend): State<Arc<Backend>>) -> Json<Value> {
    Json(json!({
        "id": "resp-mock",
        "object": "response",
        "model": backend.model,
        "output_text": "native response"
    }))
}

async fn inference(
    State(backend): State<Arc<Backend>>,
    mut multipart: Multipart,
) -> Result<Json<Value>, StatusCode> {
    let mut audio_bytes = 0;
    let mut translate = false;
    while let Some(field) = multipart.next_field().await.map_err(|_| StatusCode::BAD_REQUEST)? {
        match field.name() {
            Some("file") => {
                audio_bytes = field.bytes().await.map_err(|_| StatusCode::BAD_REQUEST)?.len();
            }
            Some("translate") => {
                translate = field.text().await.map_err(|_| StatusCode::BAD_REQUEST)? == "true";
            }
            _ => {}
        }
    }
    Ok(Json(json!({
        "text": format!("[{}] {audio_bytes} bytes", backend.model),
        "translate": translate
    })))
}

async fn images(State(backend): State<Arc<Backend>>, Json(body): Json<Value>) -> Json<Value> {
    let n = body["n"].as_u64().unwrap_or(1);
    let prompt = body["prompt"].as_str().unwrap_or_default();
    let data: Vec<Value> = (0..n)
        .map(|_| json!({"b64_json": "iVBORw0KGgo=", "revised_prompt": prompt}))
        .collect();
    Json(json!({
        "created": chrono::Utc::now().timestamp(),
        "model": backend.model,
        "data": data
    }))
}
