//! Request Router
//!
//! Classifies inference requests by the backend kind they need, makes that
//! backend resident through the coordinator, and relays the call. Backend
//! responses are streamed back as they arrive; the residency lease is held
//! only until the backend has sent its response headers.

use crate::backend::{BackendKind, BackendState};
use crate::config::{GatewayConfig, ModelsListMode, ResponsesMode};
use crate::coordinator::{Residency, SwitchCoordinator, SwitchRequest};
use crate::error::RouteError;
use crate::models::catalog::ModelCatalog;
use crate::translate;
use axum::{
    Json,
    body::{Body, Bytes},
    http::{HeaderMap, HeaderName, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

pub const CHAT_COMPLETIONS: &str = "/v1/chat/completions";
pub const COMPLETIONS: &str = "/v1/completions";
pub const EMBEDDINGS: &str = "/v1/embeddings";
pub const RESPONSES: &str = "/v1/responses";
pub const TRANSCRIPTIONS: &str = "/v1/audio/transcriptions";
pub const TRANSLATIONS: &str = "/v1/audio/translations";
pub const IMAGE_GENERATIONS: &str = "/v1/images/generations";

const IMAGE_FORMATS: [&str; 2] = ["b64_json", "url"];
const MAX_IMAGES: u64 = 10;

/// Backend kind an inference path needs
pub fn classify(path: &str) -> Option<BackendKind> {
    match path {
        CHAT_COMPLETIONS | COMPLETIONS | EMBEDDINGS | RESPONSES => Some(BackendKind::Text),
        TRANSCRIPTIONS | TRANSLATIONS => Some(BackendKind::Audio),
        IMAGE_GENERATIONS => Some(BackendKind::Image),
        _ => None,
    }
}

/// Pull the optional `model` field out of a JSON body
///
/// An empty body or a blank model means "any model".
pub fn extract_model(body: &[u8]) -> Result<Option<String>, RouteError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| RouteError::BadRequest(format!("invalid JSON body: {e}")))?;
    model_field(&value)
}

fn model_field(value: &Value) -> Result<Option<String>, RouteError> {
    match value.get("model") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(model)) => {
            let model = model.trim();
            Ok((!model.is_empty()).then(|| model.to_string()))
        }
        Some(_) => Err(RouteError::BadRequest("'model' must be a string".into())),
    }
}

/// Check an image generation body; returns a description of the first problem
pub fn validate_image_request(body: &Value) -> Result<(), String> {
    let request = body.as_object().ok_or("request body must be a JSON object")?;

    match request.get("prompt") {
        Some(Value::String(prompt)) if !prompt.trim().is_empty() => {}
        _ => return Err("'prompt' is required".into()),
    }

    if let Some(n) = request.get("n").filter(|v| !v.is_null()) {
        match n.as_u64() {
            Some(n) if (1..=MAX_IMAGES).contains(&n) => {}
            _ => return Err(format!("'n' must be an integer between 1 and {MAX_IMAGES}")),
        }
    }

    if let Some(size) = request.get("size").filter(|v| !v.is_null()) {
        let valid = size
            .as_str()
            .and_then(|s| s.split_once('x'))
            .is_some_and(|(w, h)| {
                matches!((w.parse::<u32>(), h.parse::<u32>()), (Ok(w), Ok(h)) if w > 0 && h > 0)
            });
        if !valid {
            return Err("'size' must look like WIDTHxHEIGHT, e.g. 512x512".into());
        }
    }

    if let Some(format) = request.get("response_format").filter(|v| !v.is_null()) {
        if !format.as_str().is_some_and(|f| IMAGE_FORMATS.contains(&f)) {
            return Err("'response_format' must be 'b64_json' or 'url'".into());
        }
    }
    Ok(())
}

/// Multipart upload for the audio endpoints, already read from the client
#[derive(Debug, Default)]
pub struct AudioUpload {
    pub file: Option<AudioFile>,
    /// Remaining text fields in arrival order
    pub fields: Vec<(String, String)>,
}

#[derive(Debug)]
pub struct AudioFile {
    pub name: String,
    pub content_type: Option<String>,
    pub data: Bytes,
}

/// Form fields passed through to the audio backend
const AUDIO_FIELDS: [&str; 5] = ["model", "language", "prompt", "response_format", "temperature"];

pub struct RequestRouter {
    coordinator: SwitchCoordinator,
    catalog: Arc<ModelCatalog>,
    client: reqwest::Client,
    responses_mode: ResponsesMode,
    models_list_mode: ModelsListMode,
}

impl RequestRouter {
    pub fn new(
        coordinator: SwitchCoordinator,
        catalog: Arc<ModelCatalog>,
        config: &GatewayConfig,
    ) -> anyhow::Result<Self> {
        // Inference may run for minutes; only bound the connect
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            coordinator,
            catalog,
            client,
            responses_mode: config.responses_mode,
            models_list_mode: config.models_list_mode,
        })
    }

    pub fn coordinator(&self) -> &SwitchCoordinator {
        &self.coordinator
    }

    /// Route a JSON inference request
    pub async fn route(
        &self,
        path: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response, RouteError> {
        let kind = classify(path)
            .ok_or_else(|| RouteError::NotFound(format!("no backend serves {path}")))?;

        match kind {
            BackendKind::Text if path == RESPONSES => self.route_responses(headers, body).await,
            BackendKind::Text => {
                let model = extract_model(&body)?;
                let residency = self.acquire(kind, model).await?;
                self.forward(kind, residency, path, headers, body).await
            }
            BackendKind::Image => self.route_image(headers, body).await,
            BackendKind::Audio => Err(RouteError::BadRequest(
                "audio endpoints expect multipart/form-data".into(),
            )),
        }
    }

    async fn route_responses(
        &self,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response, RouteError> {
        let kind = BackendKind::Text;
        if self.responses_mode == ResponsesMode::Proxy {
            let model = extract_model(&body)?;
            let residency = self.acquire(kind, model).await?;
            return self.forward(kind, residency, RESPONSES, headers, body).await;
        }

        let request: Value = serde_json::from_slice(&body)
            .map_err(|e| RouteError::BadRequest(format!("invalid JSON body: {e}")))?;
        let model = model_field(&request)?;
        let chat = translate::responses_to_chat(&request).map_err(RouteError::BadRequest)?;
        let streaming = chat.get("stream").and_then(Value::as_bool).unwrap_or(false);
        let chat_body = Bytes::from(serde_json::to_vec(&chat).map_err(anyhow::Error::from)?);

        let residency = self.acquire(kind, model).await?;
        let response = self
            .send(kind, residency, CHAT_COMPLETIONS, headers, chat_body)
            .await?;
        if streaming || !response.status().is_success() {
            return Ok(relay(kind, response));
        }

        let status = response.status().as_u16();
        crate::metrics::record_forward(kind, status);
        let bytes = response
            .bytes()
            .await
            .map_err(|e| RouteError::BadGateway(format!("text backend read failed: {e}")))?;
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(chat) => Ok(Json(translate::chat_to_response(&chat)).into_response()),
            Err(e) => {
                tracing::warn!(error = %e, "Text backend returned a non-JSON completion");
                Ok(bytes_response(status, bytes))
            }
        }
    }

    async fn route_image(&self, headers: &HeaderMap, body: Bytes) -> Result<Response, RouteError> {
        let kind = BackendKind::Image;
        let request: Value = serde_json::from_slice(&body)
            .map_err(|e| RouteError::BadRequest(format!("invalid JSON body: {e}")))?;
        validate_image_request(&request).map_err(RouteError::BadRequest)?;
        let model = model_field(&request)?;

        let residency = self.acquire(kind, model).await?;
        let path = self.native_path(kind, IMAGE_GENERATIONS);
        self.forward(kind, residency, &path, headers, body).await
    }

    /// Re-post an audio upload to the audio backend's native endpoint
    pub async fn route_audio(
        &self,
        translate: bool,
        upload: AudioUpload,
    ) -> Result<Response, RouteError> {
        let kind = BackendKind::Audio;
        let file = upload
            .file
            .ok_or_else(|| RouteError::BadRequest("'file' is required".into()))?;
        let model = upload
            .fields
            .iter()
            .find(|(name, _)| name == "model")
            .map(|(_, v)| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let mut part = reqwest::multipart::Part::bytes(file.data.to_vec()).file_name(file.name);
        if let Some(content_type) = &file.content_type {
            part = part
                .mime_str(content_type)
                .map_err(|e| RouteError::BadRequest(format!("invalid file content type: {e}")))?;
        }
        let mut form = reqwest::multipart::Form::new().part("file", part);
        for (name, value) in upload.fields {
            if AUDIO_FIELDS.contains(&name.as_str()) {
                form = form.text(name, value);
            }
        }
        if translate {
            form = form.text("translate", "true");
        }

        let residency = self.acquire(kind, model).await?;
        let url = residency_url(&self.coordinator, kind, &self.native_path(kind, TRANSCRIPTIONS));
        tracing::debug!(kind = %kind, url = %url, translate, "Forwarding audio request");

        let result = self.client.post(&url).multipart(form).send().await;
        drop(residency);
        let response = result.map_err(|e| unreachable_backend(kind, &e))?;
        Ok(relay(kind, response))
    }

    /// `/v1/models` according to the configured listing mode
    pub async fn list_models(&self) -> Result<Response, RouteError> {
        let status = self.coordinator.status().await;

        let resident = match (status.backend, status.model) {
            (Some(kind), model) => Some((kind, model.unwrap_or_else(|| kind.to_string()))),
            (None, _) => None,
        };

        let local: Vec<Value> = match self.models_list_mode {
            ModelsListMode::Active => Vec::new(),
            ModelsListMode::Local | ModelsListMode::Both => self
                .catalog
                .list()
                .await
                .into_iter()
                .map(|e| model_object(&e.name))
                .collect(),
        };

        let data = match self.models_list_mode {
            ModelsListMode::Local => local,
            ModelsListMode::Both => {
                let mut data = Vec::with_capacity(local.len() + 1);
                if let Some((_, model)) = &resident {
                    data.push(model_object(model));
                }
                data.extend(local.into_iter().filter(|m| {
                    resident.as_ref().is_none_or(|(_, loaded)| m["id"] != *loaded)
                }));
                data
            }
            ModelsListMode::Active => match resident {
                Some((BackendKind::Text, _)) => return self.proxy_text_models().await,
                Some((_, model)) => vec![model_object(&model)],
                None => Vec::new(),
            },
        };

        Ok(Json(json!({"object": "list", "data": data})).into_response())
    }

    async fn proxy_text_models(&self) -> Result<Response, RouteError> {
        let kind = BackendKind::Text;
        let url = residency_url(&self.coordinator, kind, "/v1/models");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| unreachable_backend(kind, &e))?;
        Ok(relay(kind, response))
    }

    /// Operator-driven activation, honoured even with auto-switch off
    pub async fn activate(
        &self,
        kind: BackendKind,
        model: Option<String>,
    ) -> Result<BackendState, RouteError> {
        let model = self.resolve_model(kind, model).await?;
        let request = SwitchRequest::new(kind, model, self.coordinator.switch_timeout());
        Ok(self.coordinator.activate(request).await?)
    }

    /// Resolve the requested model and make `kind` resident
    async fn acquire(
        &self,
        kind: BackendKind,
        model: Option<String>,
    ) -> Result<Residency, RouteError> {
        let model = self.resolve_model(kind, model).await?;
        let request = SwitchRequest::new(kind, model, self.coordinator.switch_timeout());
        let residency = self.coordinator.ensure(request).await.map_err(|e| {
            tracing::warn!(kind = %kind, error = %e, "Backend not available");
            RouteError::from(e)
        })?;
        Ok(residency)
    }

    async fn resolve_model(
        &self,
        kind: BackendKind,
        model: Option<String>,
    ) -> Result<Option<String>, RouteError> {
        let Some(model) = model else {
            return Ok(None);
        };
        let supervisor = self.coordinator.supervisor();
        if !supervisor.accepts_model_choice(kind) {
            return Ok(None);
        }
        if supervisor.current_state(kind).await.loaded_model.as_deref() == Some(model.as_str()) {
            return Ok(Some(model));
        }
        match self.catalog.resolve(&model).await {
            Some(entry) => Ok(Some(entry.name)),
            None => Err(RouteError::BadRequest(format!(
                "model '{model}' is not available locally"
            ))),
        }
    }

    fn native_path(&self, kind: BackendKind, public: &str) -> String {
        self.coordinator
            .supervisor()
            .config(kind)
            .inference_path
            .clone()
            .unwrap_or_else(|| public.to_string())
    }

    async fn send(
        &self,
        kind: BackendKind,
        residency: Residency,
        path: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<reqwest::Response, RouteError> {
        let url = residency_url(&self.coordinator, kind, path);
        tracing::debug!(kind = %kind, url = %url, bytes = body.len(), "Forwarding request");

        let mut request = self.client.post(&url).body(body);
        for (name, value) in headers {
            if !is_hop_by_hop(name) {
                request = request.header(name, value);
            }
        }
        if !headers.contains_key(header::CONTENT_TYPE) {
            request = request.header(header::CONTENT_TYPE, "application/json");
        }

        let result = request.send().await;
        drop(residency);
        result.map_err(|e| unreachable_backend(kind, &e))
    }

    async fn forward(
        &self,
        kind: BackendKind,
        residency: Residency,
        path: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response, RouteError> {
        let response = self.send(kind, residency, path, headers, body).await?;
        Ok(relay(kind, response))
    }
}

fn residency_url(coordinator: &SwitchCoordinator, kind: BackendKind, path: &str) -> String {
    coordinator.supervisor().config(kind).endpoint(path)
}

fn unreachable_backend(kind: BackendKind, error: &reqwest::Error) -> RouteError {
    tracing::error!(kind = %kind, error = %error, "Backend request failed");
    crate::metrics::record_forward(kind, StatusCode::BAD_GATEWAY.as_u16());
    RouteError::BadGateway(format!("{kind} backend unavailable: {error}"))
}

fn model_object(id: &str) -> Value {
    json!({"id": id, "object": "model"})
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-length"
    )
}

/// Stream a backend response back to the caller unchanged
fn relay(kind: BackendKind, response: reqwest::Response) -> Response {
    let status = response.status();
    crate::metrics::record_forward(kind, status.as_u16());
    if status.is_client_error() || status.is_server_error() {
        tracing::warn!(kind = %kind, status = status.as_u16(), "Backend returned an error");
    }

    let upstream = response.headers().clone();
    let mut relayed = Response::new(Body::from_stream(response.bytes_stream()));
    *relayed.status_mut() =
        StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let headers = relayed.headers_mut();
    for (name, value) in &upstream {
        if !is_hop_by_hop(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    relayed
}

fn bytes_response(status: u16, bytes: Bytes) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    (status, [(header::CONTENT_TYPE, "application/json")], bytes).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendStatus;
    use crate::supervisor::testing::{Fixture, fixture_with};
    use axum::{
        Router,
        extract::Multipart,
        routing::{get, post},
    };

    async fn fake_backend() -> String {
        let app = Router::new()
            .route(
                "/v1/chat/completions",
                post(|Json(body): Json<Value>| async move {
                    let last = body["messages"]
                        .as_array()
                        .and_then(|m| m.last())
                        .and_then(|m| m["content"].as_str())
                        .unwrap_or_default()
                        .to_string();
                    Json(json!({
                        "id": "chatcmpl-1",
                        "created": 1,
                        "model": body["model"],
                        "choices": [{
                            "message": {"role": "assistant", "content": format!("echo: {last}")},
                            "finish_reason": "stop"
                        }],
                        "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
                    }))
                }),
            )
            .route(
                "/v1/responses",
                post(|body: Bytes| async move {
                    let raw = String::from_utf8_lossy(&body).into_owned();
                    Json(json!({"object": "response", "native": true, "received": raw}))
                }),
            )
            .route(
                "/v1/embeddings",
                post(|| async { (StatusCode::UNPROCESSABLE_ENTITY, "bad input") }),
            )
            .route(
                "/v1/models",
                get(|| async { Json(json!({"object": "list", "data": [{"id": "from-backend"}]})) }),
            )
            .route(
                "/inference",
                post(|mut multipart: Multipart| async move {
                    let mut fields = Vec::new();
                    while let Some(field) = multipart.next_field().await.unwrap() {
                        let name = field.name().unwrap_or_default().to_string();
                        let value = field.text().await.unwrap();
                        fields.push(format!("{name}={value}"));
                    }
                    Json(json!({"text": fields.join("&")}))
                }),
            )
            .route(
                "/v1/images/generations",
                post(|| async { Json(json!({"created": 1, "data": [{"b64_json": "AAAA"}]})) }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn router_with(
        adjust: impl FnOnce(&mut GatewayConfig),
    ) -> (RequestRouter, Fixture) {
        let url = fake_backend().await;
        let fixture = fixture_with(|config| {
            config.text.url = url.clone();
            config.audio.url = url.clone();
            config.image.url = url.clone();
            adjust(config);
        });
        let catalog = Arc::new(ModelCatalog::new(&fixture.config.models_dir, 1.15));
        catalog.refresh().await.unwrap();
        let coordinator = SwitchCoordinator::new(
            fixture.supervisor.clone(),
            fixture.config.auto_switch,
            fixture.config.switch_timeout(),
        );
        let router = RequestRouter::new(coordinator, catalog, &fixture.config).unwrap();
        (router, fixture)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(CHAT_COMPLETIONS), Some(BackendKind::Text));
        assert_eq!(classify(EMBEDDINGS), Some(BackendKind::Text));
        assert_eq!(classify(RESPONSES), Some(BackendKind::Text));
        assert_eq!(classify(TRANSLATIONS), Some(BackendKind::Audio));
        assert_eq!(classify(IMAGE_GENERATIONS), Some(BackendKind::Image));
        assert_eq!(classify("/v1/moderations"), None);
    }

    #[test]
    fn test_extract_model() {
        assert_eq!(extract_model(b"").unwrap(), None);
        assert_eq!(extract_model(br#"{"model": " qwen "}"#).unwrap(), Some("qwen".into()));
        assert_eq!(extract_model(br#"{"model": ""}"#).unwrap(), None);
        assert_eq!(extract_model(br#"{"messages": []}"#).unwrap(), None);
        assert!(matches!(extract_model(b"{not json"), Err(RouteError::BadRequest(_))));
        assert!(matches!(extract_model(br#"{"model": 7}"#), Err(RouteError::BadRequest(_))));
    }

    #[test]
    fn test_image_validation() {
        assert!(validate_image_request(&json!({"prompt": "a cat"})).is_ok());
        let full = json!({"prompt": "a cat", "n": 2, "size": "512x768", "response_format": "url"});
        assert!(validate_image_request(&full).is_ok());
        assert!(validate_image_request(&json!({"prompt": "  "})).is_err());
        assert!(validate_image_request(&json!({"n": 1})).is_err());
        assert!(validate_image_request(&json!({"prompt": "x", "n": 0})).is_err());
        assert!(validate_image_request(&json!({"prompt": "x", "n": 11})).is_err());
        assert!(validate_image_request(&json!({"prompt": "x", "size": "big"})).is_err());
        assert!(validate_image_request(&json!({"prompt": "x", "size": "0x512"})).is_err());
        assert!(validate_image_request(&json!({"prompt": "x", "response_format": "png"})).is_err());
    }

    #[tokio::test]
    async fn test_chat_switches_to_requested_model() {
        let (router, fixture) = router_with(|_| {}).await;
        let body = Bytes::from_static(
            br#"{"model": "llama-3b", "messages": [{"role": "user", "content": "hi"}]}"#,
        );

        let response = router.route(CHAT_COMPLETIONS, &HeaderMap::new(), body).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["choices"][0]["message"]["content"], "echo: hi");

        let state = fixture.supervisor.current_state(BackendKind::Text).await;
        assert_eq!(state.status, BackendStatus::Ready);
        assert_eq!(state.loaded_model.as_deref(), Some("llama-3b.gguf"));
    }

    #[tokio::test]
    async fn test_unknown_model_is_bad_request() {
        let (router, fixture) = router_with(|_| {}).await;
        let body = Bytes::from_static(br#"{"model": "missing-70b", "messages": []}"#);

        let err = router.route(CHAT_COMPLETIONS, &HeaderMap::new(), body).await.unwrap_err();
        assert!(matches!(err, RouteError::BadRequest(_)));
        assert_eq!(fixture.processes.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_backend_errors_pass_through() {
        let (router, _fixture) = router_with(|_| {}).await;
        let response = router
            .route(EMBEDDINGS, &HeaderMap::new(), Bytes::from_static(b"{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_disabled_switch_is_conflict() {
        let (router, fixture) = router_with(|c| c.auto_switch = false).await;
        let err = router
            .route(CHAT_COMPLETIONS, &HeaderMap::new(), Bytes::from_static(b"{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::Conflict(_)));
        assert_eq!(fixture.processes.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_responses_mapped_through_chat() {
        let (router, _fixture) = router_with(|_| {}).await;
        let body = Bytes::from_static(br#"{"input": "ping", "instructions": "be terse"}"#);

        let response = router.route(RESPONSES, &HeaderMap::new(), body).await.unwrap();
        let json = body_json(response).await;
        assert_eq!(json["object"], "response");
        assert_eq!(json["output_text"], "echo: ping");
        assert_eq!(json["usage"]["total_tokens"], 5);
    }

    #[tokio::test]
    async fn test_responses_proxied_verbatim() {
        let (router, fixture) =
            router_with(|config| config.responses_mode = ResponsesMode::Proxy).await;
        let raw = r#"{"model": "llama-3b", "input": "ping", "store": false}"#;

        let response = router
            .route(RESPONSES, &HeaderMap::new(), Bytes::from_static(raw.as_bytes()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["native"], true);
        assert_eq!(json["received"], raw);

        // the model still drives residency
        let state = fixture.supervisor.current_state(BackendKind::Text).await;
        assert_eq!(state.loaded_model.as_deref(), Some("llama-3b.gguf"));
    }

    #[tokio::test]
    async fn test_image_request_validated_before_switch() {
        let (router, fixture) = router_with(|_| {}).await;
        let err = router
            .route(IMAGE_GENERATIONS, &HeaderMap::new(), Bytes::from_static(br#"{"prompt": ""}"#))
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::BadRequest(_)));
        assert_eq!(fixture.processes.spawn_count(), 0);

        let response = router
            .route(
                IMAGE_GENERATIONS,
                &HeaderMap::new(),
                Bytes::from_static(br#"{"prompt": "a fox"}"#),
            )
            .await
            .unwrap();
        assert_eq!(body_json(response).await["data"][0]["b64_json"], "AAAA");
        assert!(fixture.processes.is_kind_running(BackendKind::Image));
    }

    #[tokio::test]
    async fn test_audio_translation_form() {
        let (router, fixture) = router_with(|_| {}).await;
        let upload = AudioUpload {
            file: Some(AudioFile {
                name: "clip.wav".into(),
                content_type: Some("audio/wav".into()),
                data: Bytes::from_static(b"RIFF"),
            }),
            fields: vec![
                ("language".into(), "es".into()),
                ("unexpected".into(), "dropped".into()),
            ],
        };

        let response = router.route_audio(true, upload).await.unwrap();
        let text = body_json(response).await["text"].as_str().unwrap().to_string();
        assert_eq!(text, "file=RIFF&language=es&translate=true");
        assert!(fixture.processes.is_kind_running(BackendKind::Audio));

        let err = router.route_audio(false, AudioUpload::default()).await.unwrap_err();
        assert!(matches!(err, RouteError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_models_listing_modes() {
        let (router, _fixture) = router_with(|c| c.models_list_mode = ModelsListMode::Active).await;
        assert_eq!(body_json(router.list_models().await.unwrap()).await["data"], json!([]));
        router
            .route(CHAT_COMPLETIONS, &HeaderMap::new(), Bytes::from_static(b"{}"))
            .await
            .unwrap();
        let active = body_json(router.list_models().await.unwrap()).await;
        assert_eq!(active["data"][0]["id"], "from-backend");

        let (router, _fixture) = router_with(|c| c.models_list_mode = ModelsListMode::Local).await;
        let local = body_json(router.list_models().await.unwrap()).await;
        assert_eq!(
            local["data"],
            json!([
                {"id": "llama-3b.gguf", "object": "model"},
                {"id": "qwen-7b.gguf", "object": "model"}
            ])
        );

        let (router, _fixture) = router_with(|c| c.models_list_mode = ModelsListMode::Both).await;
        router
            .route(CHAT_COMPLETIONS, &HeaderMap::new(), Bytes::from_static(b"{}"))
            .await
            .unwrap();
        let both = body_json(router.list_models().await.unwrap()).await;
        let ids: Vec<_> = both["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["id"].clone())
            .collect();
        assert_eq!(ids, vec![json!("qwen-7b.gguf"), json!("llama-3b.gguf")]);
    }
}
