//! Components the watchdog can observe and recover.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scenemix_common::error::ScenemixResult;
use scenemix_common::health::ComponentProbe;
use scenemix_ingest_engine::{component_name, IngestManager};
use scenemix_mixer_core::MixerCore;
use tokio::time::Instant;

/// Recovery surface of a supervised component.
///
/// Every action must be idempotent: the component may have recovered on
/// its own, or a previous step may have already stopped it.
#[async_trait]
pub trait Supervised: Send + Sync {
    fn name(&self) -> String;

    /// Last-known snapshot; must not wait on pipeline transitions.
    fn probe(&self) -> ScenemixResult<ComponentProbe>;

    /// Snapshot logged when a recovery starts.
    fn diagnostics(&self, now: Instant) -> serde_json::Value {
        match self.probe() {
            Ok(probe) => probe.diagnostics(now),
            Err(e) => serde_json::json!({ "name": self.name(), "probe_error": e.to_string() }),
        }
    }

    /// Send EOS and wait up to `timeout` for it to drain.
    async fn drain(&self, timeout: Duration) -> ScenemixResult<()>;

    /// Stop at NULL and release devices without draining.
    async fn force_stop(&self) -> ScenemixResult<()>;

    /// Rebuild and restart from the last-known-good configuration.
    async fn rebuild(&self) -> ScenemixResult<()>;
}

/// The mixer as a supervised component.
pub struct MixerComponent(pub MixerCore);

#[async_trait]
impl Supervised for MixerComponent {
    fn name(&self) -> String {
        scenemix_mixer_core::COMPONENT.to_string()
    }

    fn probe(&self) -> ScenemixResult<ComponentProbe> {
        Ok(self.0.probe())
    }

    fn diagnostics(&self, now: Instant) -> serde_json::Value {
        serde_json::json!({
            "probe": self.0.probe().diagnostics(now),
            "status": serde_json::to_value(self.0.status()).unwrap_or_default(),
        })
    }

    async fn drain(&self, timeout: Duration) -> ScenemixResult<()> {
        self.0.drain(timeout).await
    }

    async fn force_stop(&self) -> ScenemixResult<()> {
        self.0.force_stop().await
    }

    async fn rebuild(&self) -> ScenemixResult<()> {
        self.0.rebuild().await
    }
}

/// One camera's ingest pipeline as a supervised component.
pub struct IngestComponent {
    manager: IngestManager,
    camera_id: String,
}

impl IngestComponent {
    pub fn new(manager: IngestManager, camera_id: impl Into<String>) -> Self {
        Self {
            manager,
            camera_id: camera_id.into(),
        }
    }
}

#[async_trait]
impl Supervised for IngestComponent {
    fn name(&self) -> String {
        component_name(&self.camera_id)
    }

    fn probe(&self) -> ScenemixResult<ComponentProbe> {
        self.manager.probe(&self.camera_id)
    }

    fn diagnostics(&self, now: Instant) -> serde_json::Value {
        let probe = match self.manager.probe(&self.camera_id) {
            Ok(probe) => probe.diagnostics(now),
            Err(e) => serde_json::json!({ "probe_error": e.to_string() }),
        };
        let status = self
            .manager
            .status(&self.camera_id)
            .ok()
            .and_then(|s| serde_json::to_value(s).ok())
            .unwrap_or_default();
        serde_json::json!({ "probe": probe, "status": status })
    }

    async fn drain(&self, timeout: Duration) -> ScenemixResult<()> {
        self.manager.drain(&self.camera_id, timeout).await
    }

    async fn force_stop(&self) -> ScenemixResult<()> {
        self.manager.force_stop(&self.camera_id).await
    }

    async fn rebuild(&self) -> ScenemixResult<()> {
        self.manager.restart(&self.camera_id).await
    }
}

/// The mixer plus one component per configured camera.
pub fn standard_components(ingest: &IngestManager, mixer: &MixerCore) -> Vec<Arc<dyn Supervised>> {
    let mut components: Vec<Arc<dyn Supervised>> = vec![Arc::new(MixerComponent(mixer.clone()))];
    for id in ingest.camera_ids() {
        components.push(Arc::new(IngestComponent::new(ingest.clone(), id)));
    }
    components
}
