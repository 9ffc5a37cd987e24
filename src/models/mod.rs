//! Model management
//!
//! - Local model files and their VRAM estimates (`catalog`)
//! - Remote hub search, file listing and URL resolution (`hub`)
//! - Background download jobs into the models directory (`download`)

pub mod catalog;
pub mod download;
pub mod hub;

pub use catalog::{CatalogEntry, ModelCatalog, VramFit};
pub use download::{DownloadJob, DownloadManager, JobStatus};
pub use hub::{HubClient, RemoteFile};
