//! Configuration structures and loading logic

use crate::backend::BackendKind;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// How `GET /v1/models` builds its list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelsListMode {
    /// Only the model of the resident backend
    #[default]
    Active,
    /// Every file in the local model directory
    Local,
    /// Resident model first, then local files
    Both,
}

/// How `POST /v1/responses` reaches the text backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponsesMode {
    /// Re-express as a chat completion
    #[default]
    Map,
    /// Forward verbatim to the backend's own `/v1/responses`
    Proxy,
}

impl std::str::FromStr for ModelsListMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "local" => Ok(Self::Local),
            "both" => Ok(Self::Both),
            other => anyhow::bail!("invalid models list mode '{}'", other),
        }
    }
}

impl std::str::FromStr for ResponsesMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "map" => Ok(Self::Map),
            "proxy" => Ok(Self::Proxy),
            other => anyhow::bail!("invalid responses mode '{}'", other),
        }
    }
}

/// Main gateway configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub api_host: String,
    pub api_port: u16,
    pub auto_switch: bool,
    pub switch_timeout_secs: u64,
    /// Health-poll deadline for a single start; falls back to the switch timeout
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_timeout_secs: Option<u64>,
    pub health_poll_interval_ms: u64,
    pub stop_timeout_secs: u64,
    pub stop_command_timeout_secs: u64,
    pub stop_verify_timeout_secs: u64,
    pub monitor_interval_secs: u64,
    pub models_list_mode: ModelsListMode,
    pub responses_mode: ResponsesMode,
    pub models_dir: PathBuf,
    pub log_dir: PathBuf,
    pub hub_endpoint: String,
    #[serde(skip_serializing)]
    pub hf_token: Option<String>,
    pub max_concurrent_downloads: usize,
    pub download_progress_interval_ms: u64,
    pub vram_headroom: f64,

    pub text: BackendConfig,
    pub audio: BackendConfig,
    pub image: BackendConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            api_host: default_api_host(),
            api_port: default_api_port(),
            auto_switch: true,
            switch_timeout_secs: default_switch_timeout(),
            start_timeout_secs: None,
            health_poll_interval_ms: default_health_poll_interval(),
            stop_timeout_secs: default_stop_timeout(),
            stop_command_timeout_secs: default_stop_command_timeout(),
            stop_verify_timeout_secs: default_stop_verify_timeout(),
            monitor_interval_secs: default_monitor_interval(),
            models_list_mode: ModelsListMode::default(),
            responses_mode: ResponsesMode::default(),
            models_dir: default_models_dir(),
            log_dir: default_log_dir(),
            hub_endpoint: default_hub_endpoint(),
            hf_token: None,
            max_concurrent_downloads: default_max_concurrent_downloads(),
            download_progress_interval_ms: default_download_progress_interval(),
            vram_headroom: default_vram_headroom(),
            text: BackendConfig::text(),
            audio: BackendConfig::audio(),
            image: BackendConfig::image(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(port) = std::env::var("MEIGAHUB_API_PORT") {
            config.api_port = port.parse().context("Invalid MEIGAHUB_API_PORT value")?;
        }
        if let Ok(auto) = std::env::var("MEIGAHUB_AUTO_SWITCH") {
            config.auto_switch = parse_bool(&auto).context("Invalid MEIGAHUB_AUTO_SWITCH value")?;
        }
        if let Ok(timeout) = std::env::var("MEIGAHUB_SWITCH_TIMEOUT") {
            config.switch_timeout_secs = timeout
                .parse()
                .context("Invalid MEIGAHUB_SWITCH_TIMEOUT value")?;
        }
        if let Ok(dir) = std::env::var("MEIGAHUB_MODELS_DIR") {
            config.models_dir = PathBuf::from(dir);
        }
        if let Ok(mode) = std::env::var("MEIGAHUB_MODELS_LIST_MODE") {
            config.models_list_mode = mode.parse()?;
        }
        if let Ok(mode) = std::env::var("MEIGAHUB_RESPONSES_MODE") {
            config.responses_mode = mode.parse()?;
        }
        if let Ok(token) = std::env::var("HF_TOKEN")
            && !token.trim().is_empty()
        {
            config.hf_token = Some(token);
        }

        for kind in BackendKind::ALL {
            let prefix = format!("MEIGAHUB_{}", kind.as_str().to_ascii_uppercase());
            let backend = config.backend_mut(kind);
            if let Ok(url) = std::env::var(format!("{prefix}_URL")) {
                backend.url = url;
            }
            if let Ok(command) = std::env::var(format!("{prefix}_COMMAND")) {
                backend.command = command.split_whitespace().map(String::from).collect();
            }
            if let Ok(model) = std::env::var(format!("{prefix}_MODEL")) {
                backend.default_model = Some(model).filter(|m| !m.is_empty());
            }
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.api_port < 1024 {
            anyhow::bail!("API port must be >= 1024 (got {})", self.api_port);
        }
        if self.switch_timeout_secs == 0 {
            anyhow::bail!("switch_timeout_secs must be > 0");
        }
        if self.start_timeout_secs == Some(0) {
            anyhow::bail!("start_timeout_secs must be > 0");
        }
        if self.health_poll_interval_ms == 0 || self.stop_timeout_secs == 0 {
            anyhow::bail!("health_poll_interval_ms and stop_timeout_secs must be > 0");
        }
        if self.monitor_interval_secs == 0 {
            anyhow::bail!("monitor_interval_secs must be > 0");
        }
        if self.vram_headroom < 1.0 {
            anyhow::bail!("vram_headroom must be >= 1.0 (got {})", self.vram_headroom);
        }
        if self.max_concurrent_downloads == 0 {
            anyhow::bail!("max_concurrent_downloads must be >= 1");
        }

        let mut urls = HashSet::new();
        for kind in BackendKind::ALL {
            let backend = self.backend(kind);
            let parsed = reqwest::Url::parse(&backend.url)
                .with_context(|| {
                    format!("Backend '{}' has an invalid url: {}", kind, backend.url)
                })?;
            if !urls.insert(parsed.as_str().trim_end_matches('/').to_string()) {
                anyhow::bail!(
                    "Backend '{}' url {} is shared with another backend",
                    kind,
                    backend.url
                );
            }
            if !backend.health_path.starts_with('/') {
                anyhow::bail!(
                    "Backend '{}' health_path must start with '/' (got {})",
                    kind,
                    backend.health_path
                );
            }
            if backend.model_arg.is_empty() {
                anyhow::bail!("Backend '{}' model_arg cannot be empty", kind);
            }
        }

        if !self.models_dir.exists() {
            std::fs::create_dir_all(&self.models_dir)
                .with_context(|| format!("Cannot create models directory: {:?}", self.models_dir))?;
        }

        Ok(())
    }

    pub fn backend(&self, kind: BackendKind) -> &BackendConfig {
        match kind {
            BackendKind::Text => &self.text,
            BackendKind::Audio => &self.audio,
            BackendKind::Image => &self.image,
        }
    }

    pub fn backend_mut(&mut self, kind: BackendKind) -> &mut BackendConfig {
        match kind {
            BackendKind::Text => &mut self.text,
            BackendKind::Audio => &mut self.audio,
            BackendKind::Image => &mut self.image,
        }
    }

    pub fn switch_timeout(&self) -> Duration {
        Duration::from_secs(self.switch_timeout_secs)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs.unwrap_or(self.switch_timeout_secs))
    }
}

/// Configuration for one backend kind
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BackendConfig {
    /// Base URL the backend listens on
    pub url: String,

    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Launch argv; empty means the backend is managed outside the gateway
    #[serde(default)]
    pub command: Vec<String>,

    /// Optional argv run before the owned process is signalled
    #[serde(default)]
    pub stop_command: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,

    /// Whether requests may pick the model (text only by default)
    #[serde(default)]
    pub dynamic_model: bool,

    #[serde(default = "default_model_arg")]
    pub model_arg: String,

    /// Native inference endpoint for audio and image backends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inference_path: Option<String>,
}

impl BackendConfig {
    pub fn text() -> Self {
        Self {
            url: "http://127.0.0.1:8080".to_string(),
            health_path: default_health_path(),
            command: Vec::new(),
            stop_command: Vec::new(),
            default_model: None,
            dynamic_model: true,
            model_arg: default_model_arg(),
            inference_path: None,
        }
    }

    pub fn audio() -> Self {
        Self {
            url: "http://127.0.0.1:8081".to_string(),
            dynamic_model: false,
            inference_path: Some("/inference".to_string()),
            ..Self::text()
        }
    }

    pub fn image() -> Self {
        Self {
            url: "http://127.0.0.1:8083".to_string(),
            dynamic_model: false,
            inference_path: Some("/v1/images/generations".to_string()),
            ..Self::text()
        }
    }

    /// True when the gateway never spawns this backend itself
    pub fn is_external(&self) -> bool {
        self.command.is_empty()
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.url.trim_end_matches('/'), path)
    }

    pub fn health_url(&self) -> String {
        self.endpoint(&self.health_path)
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::text()
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("expected a boolean, got '{}'", other),
    }
}

// Default functions
fn default_api_host() -> String {
    "0.0.0.0".to_string()
}
fn default_api_port() -> u16 {
    8000
}
fn default_switch_timeout() -> u64 {
    120
}
fn default_health_poll_interval() -> u64 {
    500
}
fn default_stop_timeout() -> u64 {
    10
}
fn default_stop_command_timeout() -> u64 {
    15
}
fn default_stop_verify_timeout() -> u64 {
    5
}
fn default_monitor_interval() -> u64 {
    10
}
fn default_models_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("meigahub")
        .join("models")
}
fn default_log_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("meigahub")
        .join("logs")
}
fn default_hub_endpoint() -> String {
    "https://huggingface.co".to_string()
}
fn default_max_concurrent_downloads() -> usize {
    2
}
fn default_download_progress_interval() -> u64 {
    250
}
fn default_vram_headroom() -> f64 {
    1.15
}
fn default_health_path() -> String {
    "/v1/models".to_string()
}
fn default_model_arg() -> String {
    "--model".to_string()
}
