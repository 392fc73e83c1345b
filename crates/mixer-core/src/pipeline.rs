//! Mixer pipeline topology.

use scenemix_common::config::MixerSettings;
use scenemix_media_graph::backend::PadProperties;
use scenemix_media_graph::graph::{encoder_nodes, Caps, Chain, Element, Node, PadRef, PipelineGraph};
use scenemix_media_graph::relay::{MediaRelay, StreamHandle};
use scenemix_scene_model::layout::PadGeometry;
use scenemix_scene_model::scene::Resolution;

use crate::plan::{InputKind, InputSpec, VirtualSource};

pub const MIXER_PIPELINE: &str = "mixer";
pub const COMPOSITOR: &str = "comp";

/// Compositor sink pad for the input at `index`.
pub fn sink_pad(index: usize) -> String {
    format!("sink_{index}")
}

/// Name given to the source element of the input at `index`.
///
/// Camera ids are free-form, so branches are named by position and mapped
/// back through the input list.
pub fn input_source(index: usize) -> String {
    format!("in{index}_src")
}

/// Index of the input whose branch posted a bus message.
///
/// `element` is either a bare element name or a `/`-separated hierarchy
/// path whose segments may carry a `Type:` prefix, so messages from
/// children of a source bin still map to their input.
pub fn input_of_element(element: &str, inputs: usize) -> Option<usize> {
    element
        .split('/')
        .map(|segment| segment.rsplit(':').next().unwrap_or(segment))
        .find_map(|name| (0..inputs).find(|&index| input_source(index) == name))
}

/// Build the compositing graph: one branch per input into the compositor,
/// then a single encode published under the configured output handle.
///
/// Input `i` lands on `comp.sink_i`, so callers address pads by the
/// position of the source in `inputs`.
pub fn mixer_graph(
    inputs: &[InputSpec],
    output: Resolution,
    settings: &MixerSettings,
    relay: &dyn MediaRelay,
) -> PipelineGraph {
    let fps = settings.framerate.max(1);
    let mut graph = PipelineGraph::new(MIXER_PIPELINE);

    graph.add(
        Chain::new()
            .then(
                Element::new("compositor")
                    .named(COMPOSITOR)
                    .token("background", "black"),
            )
            .then(Caps::raw_video(output.width, output.height, fps))
            .then(Element::activity_tap())
            .then(Element::new("videoconvert"))
            .then(Element::leaky_queue(8))
            .then_all(encoder_nodes(settings.codec, settings.bitrate_kbps, fps))
            .then_all(relay.publish(&StreamHandle::new(settings.output_handle.clone()))),
    );

    for (index, input) in inputs.iter().enumerate() {
        graph.add(
            Chain::new()
                .then_all(named_source(source_nodes(input, relay), index))
                .then(Element::new("videoconvert"))
                .then(Element::new("videoscale"))
                .then(Element::leaky_queue(4))
                .into_pad(PadRef::new(COMPOSITOR, sink_pad(index))),
        );
    }

    graph
}

fn source_nodes(input: &InputSpec, relay: &dyn MediaRelay) -> Vec<Node> {
    match &input.kind {
        InputKind::Stream(info) => relay.subscribe(&info.handle, info.codec),
        InputKind::Virtual(VirtualSource::Bars) => vec![test_source("smpte")],
        InputKind::Virtual(VirtualSource::Black) | InputKind::Placeholder => {
            vec![test_source("black")]
        }
    }
}

fn named_source(mut nodes: Vec<Node>, index: usize) -> Vec<Node> {
    if let Some(Node::Element(first)) = nodes.first_mut() {
        *first = first.clone().named(input_source(index));
    }
    nodes
}

fn test_source(pattern: &str) -> Node {
    Element::new("videotestsrc")
        .prop("is-live", true)
        .token("pattern", pattern)
        .into()
}

/// Compositor pad properties for a resolved placement.
pub fn pad_properties(geometry: &PadGeometry) -> PadProperties {
    PadProperties {
        xpos: geometry.x as i32,
        ypos: geometry.y as i32,
        width: geometry.width as i32,
        height: geometry.height as i32,
        zorder: geometry.zorder,
        alpha: geometry.alpha,
    }
}
