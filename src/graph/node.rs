//! Graph nodes and their typed pads

use std::fmt;

use serde::{Deserialize, Serialize};

pub const SRC: &str = "src";
pub const SINK: &str = "sink";

/// What flows through a pad
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    Video,
    Audio,
    /// Muxed container stream between the mux and the sinks
    Muxed,
}

impl MediaKind {
    /// Pad name used for decoded outputs of this kind
    pub fn pad_name(self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Muxed => "muxed",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.pad_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PadDirection {
    Input,
    Output,
}

/// Reference to a pad on a named node
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PadRef {
    pub node: String,
    pub pad: String,
}

impl PadRef {
    pub fn new(node: impl Into<String>, pad: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            pad: pad.into(),
        }
    }
}

impl fmt::Display for PadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.pad)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pad {
    pub name: String,
    pub media: MediaKind,
    pub direction: PadDirection,
    /// Requested or dynamically added, as opposed to always present
    pub dynamic: bool,
}

impl Pad {
    pub fn input(name: &str, media: MediaKind) -> Self {
        Self {
            name: name.to_string(),
            media,
            direction: PadDirection::Input,
            dynamic: false,
        }
    }

    pub fn output(name: &str, media: MediaKind) -> Self {
        Self {
            name: name.to_string(),
            media,
            direction: PadDirection::Output,
            dynamic: false,
        }
    }

    fn dynamic(mut self) -> Self {
        self.dynamic = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    /// Constant live test pattern at the backbone format
    Pattern,
    /// Background music loop, or live silence when no file is set
    Music,
    /// File/URI decoder whose outputs appear once decoding has started
    Decode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformKind {
    /// Paints the shared overlay frame over every video frame
    Overlay,
    /// Converts a decoded stream to the backbone format
    Normalize(MediaKind),
    /// Leaky buffer in front of a network sink
    Buffer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Source(SourceKind),
    Transform(TransformKind),
    Selector(MediaKind),
    Mixer,
    Encoder(MediaKind),
    Mux,
    Duplicator,
    /// Network sink pushing to the given location
    Sink(String),
}

impl NodeKind {
    /// Media kind of the pads this node creates on request, if any
    pub fn request_media(&self, direction: PadDirection) -> Option<MediaKind> {
        match (self, direction) {
            (NodeKind::Selector(media), PadDirection::Input) => Some(*media),
            (NodeKind::Mixer, PadDirection::Input) => Some(MediaKind::Audio),
            (NodeKind::Duplicator, PadDirection::Output) => Some(MediaKind::Muxed),
            _ => None,
        }
    }

    fn static_pads(&self) -> Vec<Pad> {
        use MediaKind::*;

        match self {
            NodeKind::Source(SourceKind::Pattern) => vec![Pad::output(SRC, Video)],
            NodeKind::Source(SourceKind::Music) => vec![Pad::output(SRC, Audio)],
            NodeKind::Source(SourceKind::Decode) => Vec::new(),
            NodeKind::Transform(TransformKind::Overlay) => {
                vec![Pad::input(SINK, Video), Pad::output(SRC, Video)]
            }
            NodeKind::Transform(TransformKind::Normalize(media)) => {
                vec![Pad::input(SINK, *media), Pad::output(SRC, *media)]
            }
            NodeKind::Transform(TransformKind::Buffer) => {
                vec![Pad::input(SINK, Muxed), Pad::output(SRC, Muxed)]
            }
            NodeKind::Selector(media) => vec![Pad::output(SRC, *media)],
            NodeKind::Mixer => vec![Pad::output(SRC, Audio)],
            NodeKind::Encoder(media) => vec![Pad::input(SINK, *media), Pad::output(SRC, *media)],
            NodeKind::Mux => vec![
                Pad::input(Video.pad_name(), Video),
                Pad::input(Audio.pad_name(), Audio),
                Pad::output(SRC, Muxed),
            ],
            NodeKind::Duplicator => vec![Pad::input(SINK, Muxed)],
            NodeKind::Sink(_) => vec![Pad::input(SINK, Muxed)],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Idle,
    Running,
}

/// A named processing unit in the media graph
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub name: String,
    pub kind: NodeKind,
    pub pads: Vec<Pad>,
    pub state: NodeState,
}

impl GraphNode {
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        let pads = kind.static_pads();
        Self {
            name: name.into(),
            kind,
            pads,
            state: NodeState::Idle,
        }
    }

    pub fn pad(&self, name: &str) -> Option<&Pad> {
        self.pads.iter().find(|p| p.name == name)
    }

    pub fn inputs(&self) -> impl Iterator<Item = &Pad> {
        self.pads
            .iter()
            .filter(|p| p.direction == PadDirection::Input)
    }

    pub(crate) fn add_dynamic_pad(&mut self, pad: Pad) {
        self.pads.push(pad.dynamic());
    }

    pub(crate) fn remove_pad(&mut self, name: &str) -> Option<Pad> {
        let index = self.pads.iter().position(|p| p.name == name)?;
        Some(self.pads.remove(index))
    }
}

/// Name of the `index`th requested pad in the given direction
pub fn request_pad_name(direction: PadDirection, index: usize) -> String {
    match direction {
        PadDirection::Input => format!("{SINK}_{index}"),
        PadDirection::Output => format!("{SRC}_{index}"),
    }
}
