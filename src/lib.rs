//! MeigaHub - OpenAI-compatible gateway for a single GPU
//!
//! Exposes one OpenAI-style HTTP API and keeps at most one heavyweight
//! inference backend (text, audio or image) resident at a time, switching
//! between them as requests demand. Also manages the local model directory
//! and background model downloads from a model hub.

pub mod api;
pub mod backend;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod gpu;
pub mod health;
pub mod metrics;
pub mod models;
pub mod process;
pub mod router;
pub mod supervisor;
pub mod translate;

pub use backend::{BackendKind, BackendState, BackendStatus};
pub use config::{BackendConfig, GatewayConfig};
pub use coordinator::{SwitchCoordinator, SwitchRequest};
pub use error::{RouteError, StartError, StopError, SwitchError};
pub use health::ResidencyMonitor;
pub use models::{DownloadJob, DownloadManager, JobStatus, ModelCatalog};
pub use router::RequestRouter;
pub use supervisor::BackendSupervisor;
