//! Media relay contract.
//!
//! Ingest pipelines publish each camera's encoded stream to a relay; the
//! mixer subscribes to those streams. The two sides never share a pipeline,
//! so tearing the mixer down never touches a capture device.

use std::fmt;

use scenemix_common::config::{RelayConfig, VideoCodec};
use serde::{Deserialize, Serialize};

use crate::graph::{Element, Node};

/// Stable identifier of a published stream, independent of the consumer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamHandle(String);

impl StreamHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Produces the sink and source fragments that move encoded streams through
/// the relay.
pub trait MediaRelay: Send + Sync {
    /// Terminal nodes that publish an encoded stream under `handle`.
    fn publish(&self, handle: &StreamHandle) -> Vec<Node>;

    /// Source nodes that receive `handle` and emit raw video.
    fn subscribe(&self, handle: &StreamHandle, codec: VideoCodec) -> Vec<Node>;

    /// Address of `handle` for operators and logs.
    fn url(&self, handle: &StreamHandle) -> String;
}

/// RTSP relay (e.g. mediamtx) reached over TCP.
#[derive(Debug, Clone)]
pub struct RtspRelay {
    base_url: String,
    latency_ms: u32,
}

impl RtspRelay {
    pub fn new(base_url: impl Into<String>, latency_ms: u32) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            latency_ms,
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(config.base_url.clone(), config.latency_ms)
    }
}

impl MediaRelay for RtspRelay {
    fn publish(&self, handle: &StreamHandle) -> Vec<Node> {
        vec![Element::new("rtspclientsink")
            .prop("location", self.url(handle))
            .token("protocols", "tcp")
            .into()]
    }

    fn subscribe(&self, handle: &StreamHandle, codec: VideoCodec) -> Vec<Node> {
        let source = Element::new("rtspsrc")
            .prop("location", self.url(handle))
            .prop("latency", self.latency_ms)
            .token("protocols", "tcp");
        let (depay, parse, decode) = match codec {
            VideoCodec::H264 => ("rtph264depay", "h264parse", "avdec_h264"),
            VideoCodec::H265 => ("rtph265depay", "h265parse", "avdec_h265"),
        };
        vec![
            source.into(),
            Element::new(depay).into(),
            Element::new(parse).into(),
            Element::new(decode).into(),
        ]
    }

    fn url(&self, handle: &StreamHandle) -> String {
        format!("{}/{}", self.base_url, handle)
    }
}
