//! Where the mixer finds its inputs.

use scenemix_common::config::VideoCodec;
use scenemix_ingest_engine::IngestManager;
use scenemix_media_graph::relay::StreamHandle;

/// A published camera stream the mixer can subscribe to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInfo {
    pub handle: StreamHandle,
    pub codec: VideoCodec,
}

/// Availability of camera sources.
pub trait SourceDirectory: Send + Sync {
    /// The stream for `source_id`, if it is publishing right now.
    fn available(&self, source_id: &str) -> Option<SourceInfo>;
}

impl SourceDirectory for IngestManager {
    fn available(&self, source_id: &str) -> Option<SourceInfo> {
        let handle = self.stream_handle(source_id)?;
        let codec = self.camera_config(source_id)?.codec;
        Some(SourceInfo { handle, codec })
    }
}
