//! Ingest pipeline topology.

use scenemix_common::config::CameraConfig;
use scenemix_media_graph::graph::{encoder_nodes, Caps, Chain, Element, PipelineGraph, PropValue};
use scenemix_media_graph::relay::{MediaRelay, StreamHandle};

use crate::signal::FrameSize;

/// Pipeline name for a camera.
pub fn pipeline_name(camera_id: &str) -> String {
    format!("ingest-{camera_id}")
}

/// Stream handle a camera publishes under. Stable across rebuilds.
pub fn stream_handle(camera_id: &str) -> StreamHandle {
    StreamHandle::new(camera_id)
}

/// Capture → encode → publish graph for one camera at the detected size.
///
/// The activity tap sits right after the source so liveness reflects the
/// device, not the encoder.
pub fn ingest_graph(camera: &CameraConfig, size: FrameSize, relay: &dyn MediaRelay) -> PipelineGraph {
    let fps = camera.framerate.max(1);
    let mut graph = PipelineGraph::new(pipeline_name(&camera.id));
    graph.add(
        Chain::new()
            .then(
                Element::new("v4l2src")
                    .prop("device", camera.device_path.to_string_lossy().into_owned())
                    .prop("do-timestamp", true),
            )
            .then(
                Caps::new("video/x-raw")
                    .field("width", size.width as i32)
                    .field("height", size.height as i32),
            )
            .then(Element::activity_tap())
            .then(Element::new("videoconvert"))
            .then(Element::new("videorate"))
            .then(Caps::new("video/x-raw").field("framerate", PropValue::Fraction(fps as i32, 1)))
            .then(Element::leaky_queue(8))
            .then_all(encoder_nodes(camera.codec, camera.bitrate_kbps, fps))
            .then_all(relay.publish(&stream_handle(&camera.id))),
    );
    graph
}

#[cfg(test)]
mod tests {
    use super::*;
    use scenemix_media_graph::relay::RtspRelay;

    #[test]
    fn ingest_graph_captures_at_detected_size_and_publishes() {
        let camera = CameraConfig::new("cam2", "/dev/video2");
        let relay = RtspRelay::new("rtsp://127.0.0.1:8554", 200);
        let graph = ingest_graph(&camera, FrameSize { width: 1280, height: 720 }, &relay);
        let launch = graph.compile().unwrap();

        assert_eq!(graph.name(), "ingest-cam2");
        assert!(launch.starts_with("v4l2src device=\"/dev/video2\" do-timestamp=true ! video/x-raw,width=1280,height=720 ! identity name=activity"));
        assert!(launch.contains("x264enc"));
        assert!(launch.ends_with("rtspclientsink location=\"rtsp://127.0.0.1:8554/cam2\" protocols=tcp"));
        assert_eq!(graph.count_factory("v4l2src"), 1);
    }
}
