//! Backend kinds and their observable state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Inference capability served by one external backend process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Text,
    Audio,
    Image,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [BackendKind::Text, BackendKind::Audio, BackendKind::Image];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Audio => "audio",
            Self::Image => "image",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "llm" => Ok(Self::Text),
            "audio" | "whisper" => Ok(Self::Audio),
            "image" => Ok(Self::Image),
            other => Err(format!("unknown backend kind '{other}'")),
        }
    }
}

/// Lifecycle status of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    Stopped,
    Starting,
    Ready,
    Stopping,
    Failed,
}

impl BackendStatus {
    /// Whether this status holds (or is about to hold) the GPU
    pub fn is_resident(&self) -> bool {
        matches!(self, Self::Starting | Self::Ready)
    }
}

impl fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Stopping => "stopping",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Snapshot of one backend's state
///
/// The live copy is owned by the supervisor; everything else sees clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendState {
    pub kind: BackendKind,
    pub status: BackendStatus,
    pub loaded_model: Option<String>,
    /// PID of the owned process, if any
    pub pid: Option<u32>,
    /// True when the backend answers health checks but was not spawned by us
    pub external: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub last_health_check_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl BackendState {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            status: BackendStatus::Stopped,
            loaded_model: None,
            pid: None,
            external: false,
            started_at: None,
            last_health_check_at: None,
            last_error: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == BackendStatus::Ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parsing() {
        assert_eq!("text".parse::<BackendKind>().unwrap(), BackendKind::Text);
        assert_eq!("LLM".parse::<BackendKind>().unwrap(), BackendKind::Text);
        assert_eq!("whisper".parse::<BackendKind>().unwrap(), BackendKind::Audio);
        assert_eq!("image".parse::<BackendKind>().unwrap(), BackendKind::Image);
        assert!("video".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_resident_statuses() {
        assert!(BackendStatus::Ready.is_resident());
        assert!(BackendStatus::Starting.is_resident());
        assert!(!BackendStatus::Stopping.is_resident());
        assert!(!BackendStatus::Failed.is_resident());
        assert!(!BackendStatus::Stopped.is_resident());
    }

    #[test]
    fn test_new_state_is_stopped() {
        let state = BackendState::new(BackendKind::Audio);
        assert_eq!(state.status, BackendStatus::Stopped);
        assert!(state.loaded_model.is_none());
        assert!(state.pid.is_none());

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["kind"], "audio");
        assert_eq!(json["status"], "stopped");
    }
}
