//! Typed graph structure: nodes, pads and links, plus the fixed backbone

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::GraphError;
use crate::graph::node::{
    request_pad_name, GraphNode, MediaKind, NodeKind, NodeState, Pad, PadDirection, PadRef,
    SourceKind, TransformKind, SINK, SRC,
};

pub const DEFAULT_PATTERN: &str = "default-pattern";
pub const VIDEO_SELECTOR: &str = "video-selector";
pub const COMPOSITOR: &str = "overlay-compositor";
pub const VIDEO_ENCODER: &str = "video-encoder";
pub const MUSIC: &str = "music";
pub const AUDIO_MIXER: &str = "audio-mixer";
pub const AUDIO_SELECTOR: &str = "audio-selector";
pub const AUDIO_ENCODER: &str = "audio-encoder";
pub const MUX: &str = "mux";
pub const DUPLICATOR: &str = "duplicator";

/// Selector and mixer input carrying the always-present source
pub const DEFAULT_INPUT: usize = 0;
/// Selector and mixer input reserved for a dynamic branch
pub const BRANCH_INPUT: usize = 1;

/// A network destination for the muxed stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// "primary" or "backup"
    pub name: String,
    pub location: String,
}

/// Everything needed to lay out the backbone
#[derive(Debug, Clone)]
pub struct BackbonePlan {
    pub endpoints: Vec<Endpoint>,
    pub music: Option<PathBuf>,
}

impl BackbonePlan {
    /// Builds the plan from the output settings, appending the stream key when set.
    pub fn from_config(config: &crate::Config) -> Result<Self, GraphError> {
        let output = &config.output;
        if output.primary.trim().is_empty() {
            return Err(GraphError::NoEndpoint);
        }

        let key = output.stream_key.as_deref().filter(|k| !k.is_empty());
        let mut endpoints = vec![Endpoint {
            name: "primary".into(),
            location: endpoint_location(&output.primary, key),
        }];
        if let Some(backup) = output.backup.as_deref().filter(|b| !b.trim().is_empty()) {
            endpoints.push(Endpoint {
                name: "backup".into(),
                location: endpoint_location(backup, key),
            });
        }

        Ok(Self {
            endpoints,
            music: config.audio.music_path.clone(),
        })
    }
}

fn endpoint_location(url: &str, key: Option<&str>) -> String {
    match key {
        Some(key) => format!("{}/{}", url.trim_end_matches('/'), key),
        None => url.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub from: PadRef,
    pub to: PadRef,
}

/// The processing graph as data. Every mutation is validated here before the
/// media backend is asked to realise it.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    nodes: BTreeMap<String, GraphNode>,
    links: Vec<Link>,
}

impl Topology {
    /// Lays out the fixed backbone: selectors, compositor, mixer, encoders,
    /// mux and one queue+sink per endpoint.
    pub fn backbone(plan: &BackbonePlan) -> Result<Self, GraphError> {
        use MediaKind::*;

        let mut t = Topology::default();

        // Video: pattern -> selector -> overlay -> encoder -> mux
        t.add_node(GraphNode::new(DEFAULT_PATTERN, NodeKind::Source(SourceKind::Pattern)))?;
        t.add_node(GraphNode::new(VIDEO_SELECTOR, NodeKind::Selector(Video)))?;
        t.add_node(GraphNode::new(COMPOSITOR, NodeKind::Transform(TransformKind::Overlay)))?;
        t.add_node(GraphNode::new(VIDEO_ENCODER, NodeKind::Encoder(Video)))?;

        // Audio: music -> mixer -> selector -> encoder -> mux
        t.add_node(GraphNode::new(MUSIC, NodeKind::Source(SourceKind::Music)))?;
        t.add_node(GraphNode::new(AUDIO_MIXER, NodeKind::Mixer))?;
        t.add_node(GraphNode::new(AUDIO_SELECTOR, NodeKind::Selector(Audio)))?;
        t.add_node(GraphNode::new(AUDIO_ENCODER, NodeKind::Encoder(Audio)))?;

        t.add_node(GraphNode::new(MUX, NodeKind::Mux))?;

        let video_default = t.request_pad(VIDEO_SELECTOR, PadDirection::Input, DEFAULT_INPUT)?;
        t.link(&PadRef::new(DEFAULT_PATTERN, SRC), &video_default)?;
        t.link(&PadRef::new(VIDEO_SELECTOR, SRC), &PadRef::new(COMPOSITOR, SINK))?;
        t.link(&PadRef::new(COMPOSITOR, SRC), &PadRef::new(VIDEO_ENCODER, SINK))?;
        t.link(&PadRef::new(VIDEO_ENCODER, SRC), &PadRef::new(MUX, Video.pad_name()))?;

        let music_in = t.request_pad(AUDIO_MIXER, PadDirection::Input, DEFAULT_INPUT)?;
        t.link(&PadRef::new(MUSIC, SRC), &music_in)?;
        let audio_default = t.request_pad(AUDIO_SELECTOR, PadDirection::Input, DEFAULT_INPUT)?;
        t.link(&PadRef::new(AUDIO_MIXER, SRC), &audio_default)?;
        t.link(&PadRef::new(AUDIO_SELECTOR, SRC), &PadRef::new(AUDIO_ENCODER, SINK))?;
        t.link(&PadRef::new(AUDIO_ENCODER, SRC), &PadRef::new(MUX, Audio.pad_name()))?;

        match plan.endpoints.as_slice() {
            [] => return Err(GraphError::NoEndpoint),
            [single] => {
                let queue = t.add_endpoint(single)?;
                t.link(&PadRef::new(MUX, SRC), &queue)?;
            }
            many => {
                t.add_node(GraphNode::new(DUPLICATOR, NodeKind::Duplicator))?;
                t.link(&PadRef::new(MUX, SRC), &PadRef::new(DUPLICATOR, SINK))?;
                for (index, endpoint) in many.iter().enumerate() {
                    let queue = t.add_endpoint(endpoint)?;
                    let tee_out = t.request_pad(DUPLICATOR, PadDirection::Output, index)?;
                    t.link(&tee_out, &queue)?;
                }
            }
        }

        Ok(t)
    }

    /// Adds `<name>-queue -> <name>-sink` and returns the queue's input pad.
    fn add_endpoint(&mut self, endpoint: &Endpoint) -> Result<PadRef, GraphError> {
        let queue = format!("{}-queue", endpoint.name);
        let sink = format!("{}-sink", endpoint.name);
        self.add_node(GraphNode::new(&queue, NodeKind::Transform(TransformKind::Buffer)))?;
        self.add_node(GraphNode::new(&sink, NodeKind::Sink(endpoint.location.clone())))?;
        self.link(&PadRef::new(&queue, SRC), &PadRef::new(&sink, SINK))?;
        Ok(PadRef::new(queue, SINK))
    }

    pub fn add_node(&mut self, node: GraphNode) -> Result<(), GraphError> {
        if self.nodes.contains_key(&node.name) {
            return Err(GraphError::DuplicateNode(node.name));
        }
        self.nodes.insert(node.name.clone(), node);
        Ok(())
    }

    pub fn node(&self, name: &str) -> Option<&GraphNode> {
        self.nodes.get(name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.values()
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    fn node_mut(&mut self, name: &str) -> Result<&mut GraphNode, GraphError> {
        self.nodes
            .get_mut(name)
            .ok_or_else(|| GraphError::UnknownNode(name.to_string()))
    }

    fn pad(&self, pad: &PadRef) -> Result<&Pad, GraphError> {
        self.nodes
            .get(&pad.node)
            .ok_or_else(|| GraphError::UnknownNode(pad.node.clone()))?
            .pad(&pad.pad)
            .ok_or_else(|| GraphError::UnknownPad(pad.clone()))
    }

    /// Creates the `index`th request pad on a selector, mixer or duplicator.
    pub fn request_pad(
        &mut self,
        node: &str,
        direction: PadDirection,
        index: usize,
    ) -> Result<PadRef, GraphError> {
        let target = self.node_mut(node)?;
        let media = target
            .kind
            .request_media(direction)
            .ok_or_else(|| GraphError::NotRequestable(node.to_string()))?;

        let name = request_pad_name(direction, index);
        let pad_ref = PadRef::new(node, &name);
        if target.pad(&name).is_some() {
            return Err(GraphError::PadExists(pad_ref));
        }

        let pad = match direction {
            PadDirection::Input => Pad::input(&name, media),
            PadDirection::Output => Pad::output(&name, media),
        };
        target.add_dynamic_pad(pad);
        Ok(pad_ref)
    }

    /// Adds a decoded output to a decode source once its media kind is known.
    pub fn add_decoded_output(
        &mut self,
        node: &str,
        media: MediaKind,
    ) -> Result<PadRef, GraphError> {
        let source = self.node_mut(node)?;
        if source.kind != NodeKind::Source(SourceKind::Decode) {
            return Err(GraphError::NotRequestable(node.to_string()));
        }

        let pad_ref = PadRef::new(node, media.pad_name());
        if source.pad(media.pad_name()).is_some() {
            return Err(GraphError::PadExists(pad_ref));
        }
        source.add_dynamic_pad(Pad::output(media.pad_name(), media));
        Ok(pad_ref)
    }

    /// Drops a requested or decoded pad together with its link.
    pub fn release_pad(&mut self, pad: &PadRef) -> Result<(), GraphError> {
        if !self.pad(pad)?.dynamic {
            return Err(GraphError::StaticPad(pad.clone()));
        }
        self.links.retain(|l| &l.from != pad && &l.to != pad);
        self.node_mut(&pad.node)?.remove_pad(&pad.pad);
        Ok(())
    }

    /// Links an output pad to an input pad of the same media kind. Each pad
    /// takes part in at most one link.
    pub fn link(&mut self, from: &PadRef, to: &PadRef) -> Result<(), GraphError> {
        let invalid = |reason| GraphError::InvalidLink {
            from: from.clone(),
            to: to.clone(),
            reason,
        };

        let src = self.pad(from)?;
        let sink = self.pad(to)?;
        if src.direction != PadDirection::Output || sink.direction != PadDirection::Input {
            return Err(invalid("links run from an output to an input"));
        }
        if src.media != sink.media {
            return Err(invalid("media kinds differ"));
        }
        if self.is_linked(from) {
            return Err(GraphError::AlreadyLinked(from.clone()));
        }
        if self.is_linked(to) {
            return Err(GraphError::AlreadyLinked(to.clone()));
        }

        self.links.push(Link {
            from: from.clone(),
            to: to.clone(),
        });
        Ok(())
    }

    pub fn is_linked(&self, pad: &PadRef) -> bool {
        self.peer(pad).is_some()
    }

    pub fn peer(&self, pad: &PadRef) -> Option<&PadRef> {
        self.links.iter().find_map(|l| {
            if &l.from == pad {
                Some(&l.to)
            } else if &l.to == pad {
                Some(&l.from)
            } else {
                None
            }
        })
    }

    /// Removes every link touching `node`, returning how many were dropped.
    pub fn unlink_node(&mut self, node: &str) -> usize {
        let before = self.links.len();
        self.links.retain(|l| l.from.node != node && l.to.node != node);
        before - self.links.len()
    }

    pub fn remove_node(&mut self, node: &str) -> Result<GraphNode, GraphError> {
        self.unlink_node(node);
        self.nodes
            .remove(node)
            .ok_or_else(|| GraphError::UnknownNode(node.to_string()))
    }

    /// Input pads of `node` without a peer
    pub fn unlinked_inputs(&self, node: &str) -> Result<Vec<PadRef>, GraphError> {
        let target = self
            .nodes
            .get(node)
            .ok_or_else(|| GraphError::UnknownNode(node.to_string()))?;

        Ok(target
            .inputs()
            .map(|p| PadRef::new(node, &p.name))
            .filter(|p| !self.is_linked(p))
            .collect())
    }

    /// Moves a node to running; refused while any input is unlinked.
    pub fn set_running(&mut self, node: &str) -> Result<(), GraphError> {
        if let Some(pad) = self.unlinked_inputs(node)?.into_iter().next() {
            return Err(GraphError::UnlinkedInput {
                node: node.to_string(),
                pad,
            });
        }
        self.node_mut(node)?.state = NodeState::Running;
        Ok(())
    }

    pub fn start_all(&mut self) -> Result<(), GraphError> {
        let names: Vec<String> = self.nodes.keys().cloned().collect();
        for name in names {
            self.set_running(&name)?;
        }
        Ok(())
    }
}
