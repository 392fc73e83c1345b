//! Typed pipeline topology.
//!
//! A [`PipelineGraph`] is a list of [`Chain`]s. Each chain is a linear run
//! of [`Node`]s (elements and caps filters), optionally ending at a named
//! pad of an element defined elsewhere in the graph.
//! [`PipelineGraph::compile`] validates the references and renders the
//! GStreamer launch description.

use std::collections::HashSet;
use std::fmt;

use scenemix_common::config::VideoCodec;
use scenemix_common::error::{ScenemixError, ScenemixResult};

/// Name of the pass-through element whose buffers mark liveness.
pub const ACTIVITY_TAP: &str = "activity";

/// A typed property value.
#[derive(Debug, Clone, PartialEq)]
pub enum PropValue {
    /// Free-form string, quoted when rendered.
    Str(String),
    /// Enum nick, flag list, or format token, rendered bare.
    Token(String),
    Int(i64),
    UInt(u64),
    Bool(bool),
    Double(f64),
    Fraction(i32, i32),
}

impl PropValue {
    pub fn token(value: impl Into<String>) -> Self {
        Self::Token(value.into())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) | Self::Token(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for PropValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => {
                let escaped = s.replace('\\', "\\\\").replace('"', "\\\"");
                write!(f, "\"{escaped}\"")
            }
            Self::Token(s) => f.write_str(s),
            Self::Int(v) => write!(f, "{v}"),
            Self::UInt(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::Fraction(n, d) => write!(f, "{n}/{d}"),
        }
    }
}

impl From<&str> for PropValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for PropValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i32> for PropValue {
    fn from(value: i32) -> Self {
        Self::Int(value as i64)
    }
}

impl From<i64> for PropValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for PropValue {
    fn from(value: u32) -> Self {
        Self::UInt(value as u64)
    }
}

impl From<u64> for PropValue {
    fn from(value: u64) -> Self {
        Self::UInt(value)
    }
}

impl From<bool> for PropValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for PropValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

/// One element instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    factory: String,
    name: Option<String>,
    props: Vec<(String, PropValue)>,
}

impl Element {
    pub fn new(factory: impl Into<String>) -> Self {
        Self {
            factory: factory.into(),
            name: None,
            props: Vec::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn prop(mut self, key: impl Into<String>, value: impl Into<PropValue>) -> Self {
        self.props.push((key.into(), value.into()));
        self
    }

    /// Property rendered bare (enum nicks, flags).
    pub fn token(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.prop(key, PropValue::Token(value.into()))
    }

    pub fn factory(&self) -> &str {
        &self.factory
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn get(&self, key: &str) -> Option<&PropValue> {
        self.props.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Pass-through element marking buffer liveness.
    pub fn activity_tap() -> Self {
        Self::new("identity").named(ACTIVITY_TAP).prop("silent", true)
    }

    /// Leaky queue decoupling a producer from a slower consumer.
    pub fn leaky_queue(max_buffers: u32) -> Self {
        Self::new("queue")
            .prop("max-size-buffers", max_buffers)
            .prop("max-size-bytes", 0u32)
            .prop("max-size-time", 0u64)
            .token("leaky", "downstream")
    }
}

/// A caps filter (`video/x-raw,width=1920,...`).
#[derive(Debug, Clone, PartialEq)]
pub struct Caps {
    media: String,
    fields: Vec<(String, PropValue)>,
}

impl Caps {
    pub fn new(media: impl Into<String>) -> Self {
        Self {
            media: media.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<PropValue>) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }

    /// Raw video caps at a fixed size and rate.
    pub fn raw_video(width: u32, height: u32, framerate: u32) -> Self {
        Self::new("video/x-raw")
            .field("width", width as i32)
            .field("height", height as i32)
            .field("framerate", PropValue::Fraction(framerate as i32, 1))
    }
}

impl fmt::Display for Caps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.media)?;
        for (key, value) in &self.fields {
            match value {
                // Caps strings take unquoted string fields.
                PropValue::Str(s) => write!(f, ",{key}={s}")?,
                other => write!(f, ",{key}={other}")?,
            }
        }
        Ok(())
    }
}

/// A link target or origin: `element.pad`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PadRef {
    pub element: String,
    pub pad: String,
}

impl PadRef {
    pub fn new(element: impl Into<String>, pad: impl Into<String>) -> Self {
        Self {
            element: element.into(),
            pad: pad.into(),
        }
    }
}

impl fmt::Display for PadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.element, self.pad)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    Caps(Caps),
}

impl From<Element> for Node {
    fn from(value: Element) -> Self {
        Self::Element(value)
    }
}

impl From<Caps> for Node {
    fn from(value: Caps) -> Self {
        Self::Caps(value)
    }
}

/// A linear run of nodes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Chain {
    nodes: Vec<Node>,
    to: Option<PadRef>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, node: impl Into<Node>) -> Self {
        self.nodes.push(node.into());
        self
    }

    pub fn then_all(mut self, nodes: impl IntoIterator<Item = Node>) -> Self {
        self.nodes.extend(nodes);
        self
    }

    /// End by linking into a pad of an element defined elsewhere.
    pub fn into_pad(mut self, pad: PadRef) -> Self {
        self.to = Some(pad);
        self
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn target(&self) -> Option<&PadRef> {
        self.to.as_ref()
    }

    fn elements(&self) -> impl Iterator<Item = &Element> {
        self.nodes.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Caps(_) => None,
        })
    }
}

/// A complete pipeline description.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineGraph {
    name: String,
    chains: Vec<Chain>,
}

impl PipelineGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            chains: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add(&mut self, chain: Chain) -> &mut Self {
        self.chains.push(chain);
        self
    }

    pub fn chains(&self) -> &[Chain] {
        &self.chains
    }

    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.chains.iter().flat_map(Chain::elements)
    }

    pub fn element(&self, name: &str) -> Option<&Element> {
        self.elements().find(|e| e.name() == Some(name))
    }

    pub fn count_factory(&self, factory: &str) -> usize {
        self.elements().filter(|e| e.factory() == factory).count()
    }

    /// Check names and pad references.
    pub fn validate(&self) -> ScenemixResult<()> {
        let fail = |msg: String| {
            Err(ScenemixError::pipeline_build(format!(
                "graph '{}': {msg}",
                self.name
            )))
        };

        if self.chains.is_empty() {
            return fail("no chains".to_string());
        }

        let mut names = HashSet::new();
        for element in self.elements() {
            if !is_identifier(element.factory()) {
                return fail(format!("invalid factory name '{}'", element.factory()));
            }
            for (key, _) in &element.props {
                if !is_identifier(key) {
                    return fail(format!("invalid property name '{key}'"));
                }
            }
            if let Some(name) = element.name() {
                if !is_identifier(name) {
                    return fail(format!("invalid element name '{name}'"));
                }
                if !names.insert(name) {
                    return fail(format!("duplicate element name '{name}'"));
                }
            }
        }

        for (idx, chain) in self.chains.iter().enumerate() {
            if chain.nodes.is_empty() {
                return fail(format!("chain {idx} is empty"));
            }
            if matches!(chain.nodes.first(), Some(Node::Caps(_))) {
                return fail(format!("chain {idx} starts with a caps filter"));
            }
            if let Some(pad) = &chain.to {
                if !names.contains(pad.element.as_str()) {
                    return fail(format!("chain {idx} links to unknown element '{}'", pad.element));
                }
            }
        }

        Ok(())
    }

    /// Render the launch description.
    pub fn compile(&self) -> ScenemixResult<String> {
        self.validate()?;
        let chains: Vec<String> = self.chains.iter().map(render_chain).collect();
        Ok(chains.join("  "))
    }
}

fn render_chain(chain: &Chain) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(chain.nodes.len() + 1);
    for node in &chain.nodes {
        parts.push(match node {
            Node::Element(e) => render_element(e),
            Node::Caps(c) => c.to_string(),
        });
    }
    if let Some(to) = &chain.to {
        parts.push(format!("{to}"));
    }
    parts.join(" ! ")
}

fn render_element(element: &Element) -> String {
    let mut out = element.factory.clone();
    if let Some(name) = &element.name {
        out.push_str(&format!(" name={name}"));
    }
    for (key, value) in &element.props {
        out.push_str(&format!(" {key}={value}"));
    }
    out
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Encoder and parser for a published stream.
///
/// One keyframe every two seconds keeps late-joining subscribers waiting
/// at most that long.
pub fn encoder_nodes(codec: VideoCodec, bitrate_kbps: u32, framerate: u32) -> Vec<Node> {
    let keyint = framerate.saturating_mul(2).max(2);
    match codec {
        VideoCodec::H264 => vec![
            Element::new("x264enc")
                .token("tune", "zerolatency")
                .token("speed-preset", "ultrafast")
                .prop("bitrate", bitrate_kbps)
                .prop("key-int-max", keyint)
                .into(),
            Caps::new("video/x-h264").field("profile", "baseline").into(),
            Element::new("h264parse").prop("config-interval", -1).into(),
        ],
        VideoCodec::H265 => vec![
            Element::new("x265enc")
                .token("tune", "zerolatency")
                .token("speed-preset", "ultrafast")
                .prop("bitrate", bitrate_kbps)
                .prop("key-int-max", keyint)
                .into(),
            Element::new("h265parse").prop("config-interval", -1).into(),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_input_graph() -> PipelineGraph {
        let mut graph = PipelineGraph::new("mixer");
        graph
            .add(
                Chain::new()
                    .then(Element::new("compositor").named("comp").token("background", "black"))
                    .then(Caps::raw_video(1920, 1080, 30))
                    .then(Element::activity_tap())
                    .then(Element::new("fakesink")),
            )
            .add(
                Chain::new()
                    .then(Element::new("videotestsrc").prop("is-live", true))
                    .into_pad(PadRef::new("comp", "sink_0")),
            )
            .add(
                Chain::new()
                    .then(Element::new("filesrc").prop("location", "/tmp/a \"b\".mkv"))
                    .into_pad(PadRef::new("comp", "sink_1")),
            );
        graph
    }

    #[test]
    fn compiles_launch_description() {
        let launch = two_input_graph().compile().unwrap();
        assert_eq!(
            launch,
            "compositor name=comp background=black ! video/x-raw,width=1920,height=1080,framerate=30/1 ! identity name=activity silent=true ! fakesink  \
             videotestsrc is-live=true ! comp.sink_0  \
             filesrc location=\"/tmp/a \\\"b\\\".mkv\" ! comp.sink_1"
        );
    }

    #[test]
    fn rejects_dangling_pad_reference() {
        let mut graph = PipelineGraph::new("broken");
        graph.add(
            Chain::new()
                .then(Element::new("videotestsrc"))
                .into_pad(PadRef::new("comp", "sink_0")),
        );
        let err = graph.compile().unwrap_err().to_string();
        assert!(err.contains("unknown element 'comp'"), "{err}");
    }

    #[test]
    fn rejects_duplicate_names_and_bad_identifiers() {
        let mut graph = PipelineGraph::new("dup");
        graph.add(
            Chain::new()
                .then(Element::new("queue").named("q"))
                .then(Element::new("queue").named("q")),
        );
        assert!(graph.validate().is_err());

        let mut graph = PipelineGraph::new("inject");
        graph.add(Chain::new().then(Element::new("fakesink ! filesink")));
        assert!(graph.validate().is_err());
    }

    #[test]
    fn lookup_helpers() {
        let graph = two_input_graph();
        assert!(graph.element("comp").is_some());
        assert_eq!(graph.count_factory("videotestsrc"), 1);
        assert_eq!(
            graph
                .element(ACTIVITY_TAP)
                .and_then(|e| e.get("silent"))
                .cloned(),
            Some(PropValue::Bool(true))
        );
    }

    #[test]
    fn encoder_keyframe_interval_follows_framerate() {
        let nodes = encoder_nodes(VideoCodec::H264, 4000, 30);
        let Node::Element(enc) = &nodes[0] else {
            panic!("expected encoder element");
        };
        assert_eq!(enc.factory(), "x264enc");
        assert_eq!(enc.get("key-int-max"), Some(&PropValue::UInt(60)));
        assert_eq!(enc.get("bitrate"), Some(&PropValue::UInt(4000)));
    }
}
