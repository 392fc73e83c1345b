//! Error types shared across SceneMix crates.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for SceneMix operations.
#[derive(Debug, thiserror::Error)]
pub enum ScenemixError {
    /// Signal absent or capture device busy. Recoverable; retried with backoff.
    #[error("Device unavailable for {source_id}: {reason}")]
    DeviceUnavailable { source_id: String, reason: String },

    /// A pipeline did not reach its target state within the bound.
    #[error("{component} did not reach {target} within {timeout:?}")]
    StateTransitionTimeout {
        component: String,
        target: String,
        timeout: Duration,
    },

    /// Invalid scene/source combination, rejected before touching hardware.
    #[error("Pipeline build error: {message}")]
    PipelineBuild { message: String },

    /// Runtime element error reported asynchronously on a pipeline bus.
    #[error("Bus error from {element}: {message}")]
    Bus { element: String, message: String },

    /// Watchdog retried recovery beyond its cap.
    #[error("Recovery exhausted for {component} after {attempts} attempts")]
    RecoveryExhausted { component: String, attempts: u32 },

    #[error("Scene '{scene_id}' rejected: {reason}")]
    SceneRejected { scene_id: String, reason: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    /// The component's coordinator task is gone (shutdown or panic).
    #[error("{component} is shut down")]
    Shutdown { component: String },

    #[error("File not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using ScenemixError.
pub type ScenemixResult<T> = Result<T, ScenemixError>;

impl ScenemixError {
    pub fn device_unavailable(source_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DeviceUnavailable {
            source_id: source_id.into(),
            reason: reason.into(),
        }
    }

    pub fn transition_timeout(
        component: impl Into<String>,
        target: impl std::fmt::Display,
        timeout: Duration,
    ) -> Self {
        Self::StateTransitionTimeout {
            component: component.into(),
            target: target.to_string(),
            timeout,
        }
    }

    pub fn pipeline_build(msg: impl Into<String>) -> Self {
        Self::PipelineBuild {
            message: msg.into(),
        }
    }

    pub fn bus(element: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Bus {
            element: element.into(),
            message: msg.into(),
        }
    }

    pub fn scene_rejected(scene_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SceneRejected {
            scene_id: scene_id.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn shutdown(component: impl Into<String>) -> Self {
        Self::Shutdown {
            component: component.into(),
        }
    }

    /// Whether a retry loop may try again after this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::DeviceUnavailable { .. } | Self::StateTransitionTimeout { .. } | Self::Bus { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification_follows_taxonomy() {
        assert!(ScenemixError::device_unavailable("cam0", "no signal").is_transient());
        assert!(
            ScenemixError::transition_timeout("mixer", "PLAYING", Duration::from_secs(10))
                .is_transient()
        );
        assert!(!ScenemixError::pipeline_build("bad graph").is_transient());
        assert!(!ScenemixError::RecoveryExhausted {
            component: "mixer".to_string(),
            attempts: 5
        }
        .is_transient());
    }

    #[test]
    fn messages_name_the_offender() {
        let err = ScenemixError::scene_rejected("dual", "unknown source 'cam9'");
        assert_eq!(
            err.to_string(),
            "Scene 'dual' rejected: unknown source 'cam9'"
        );
        let err = ScenemixError::transition_timeout("mixer", "PLAYING", Duration::from_secs(10));
        assert_eq!(err.to_string(), "mixer did not reach PLAYING within 10s");
    }
}
