//! Runtime owner of the media graph: backbone, selectors and dynamic branches

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::error::GraphError;
use crate::graph::backend::MediaBackend;
use crate::graph::branch::{BranchKey, BranchLink, BranchRole, DynamicBranch, MediaSource};
use crate::graph::node::{
    request_pad_name, GraphNode, MediaKind, NodeKind, PadDirection, PadRef, SourceKind,
    TransformKind, SINK, SRC,
};
use crate::graph::topology::{
    BackbonePlan, Topology, AUDIO_MIXER, AUDIO_SELECTOR, BRANCH_INPUT, DEFAULT_INPUT,
    VIDEO_SELECTOR,
};

/// The two backbone selectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SelectorId {
    Video,
    Audio,
}

impl SelectorId {
    pub const ALL: [SelectorId; 2] = [SelectorId::Video, SelectorId::Audio];

    pub fn node(self) -> &'static str {
        match self {
            SelectorId::Video => VIDEO_SELECTOR,
            SelectorId::Audio => AUDIO_SELECTOR,
        }
    }

    fn for_media(media: MediaKind) -> Option<Self> {
        match media {
            MediaKind::Video => Some(SelectorId::Video),
            MediaKind::Audio => Some(SelectorId::Audio),
            MediaKind::Muxed => None,
        }
    }
}

/// Selector/mixer input `index` of `node`
fn input_pad(node: &str, index: usize) -> PadRef {
    PadRef::new(node, request_pad_name(PadDirection::Input, index))
}

pub struct GraphController<B: MediaBackend> {
    backend: B,
    topology: Topology,
    branches: BTreeMap<BranchRole, DynamicBranch>,
    generation: u64,
    active: BTreeMap<SelectorId, usize>,
}

impl<B: MediaBackend> GraphController<B> {
    /// Lay out the backbone and have the backend create it.
    pub fn build(mut backend: B, plan: &BackbonePlan) -> Result<Self, GraphError> {
        let topology = Topology::backbone(plan)?;
        backend.build(&topology)?;
        info!(
            nodes = topology.nodes().count(),
            links = topology.links().len(),
            "Backbone built"
        );

        Ok(Self {
            backend,
            topology,
            branches: BTreeMap::new(),
            generation: 0,
            active: SelectorId::ALL.iter().map(|s| (*s, DEFAULT_INPUT)).collect(),
        })
    }

    /// Move every node to running and start the backend.
    pub fn start(&mut self) -> Result<(), GraphError> {
        self.topology.start_all()?;
        self.backend.play()
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn branch(&self, role: BranchRole) -> Option<&DynamicBranch> {
        self.branches.get(&role)
    }

    pub fn current_key(&self, role: BranchRole) -> Option<BranchKey> {
        self.branches.get(&role).map(|b| b.key)
    }

    pub fn active_input(&self, selector: SelectorId) -> usize {
        self.active.get(&selector).copied().unwrap_or(DEFAULT_INPUT)
    }

    /// Whether the program branch currently feeds the audio selector
    pub fn program_audio_on_air(&self) -> bool {
        self.active_input(SelectorId::Audio) == BRANCH_INPUT
            && self.branches.contains_key(&BranchRole::Program)
    }

    fn live_branch(&mut self, key: BranchKey) -> Option<&mut DynamicBranch> {
        self.branches.get_mut(&key.role).filter(|b| b.key == key)
    }

    /// Start a new branch for `role`, replacing any existing one.
    #[instrument(skip(self))]
    pub fn attach_branch(
        &mut self,
        role: BranchRole,
        source: MediaSource,
    ) -> Result<BranchKey, GraphError> {
        self.teardown_branch(role)?;

        self.generation += 1;
        let key = BranchKey {
            role,
            generation: self.generation,
        };
        let mut branch = DynamicBranch::new(key, source);

        let decode = branch.decode_node();
        self.topology
            .add_node(GraphNode::new(&decode, NodeKind::Source(SourceKind::Decode)))?;
        if let Err(e) = self.backend.attach_branch(key, &branch.source) {
            let _ = self.topology.remove_node(&decode);
            return Err(e);
        }
        self.topology.set_running(&decode)?;
        branch.nodes.push(decode);

        info!(branch = %key, source = %branch.source, "Branch requested");
        self.branches.insert(role, branch);
        Ok(key)
    }

    /// Wire a freshly decoded output into the backbone. Returns whether it was
    /// linked; stale keys and outputs the role does not use are skipped.
    #[instrument(skip(self))]
    pub fn on_pad_resolved(
        &mut self,
        key: BranchKey,
        media: MediaKind,
    ) -> Result<bool, GraphError> {
        let Some(branch) = self.live_branch(key) else {
            debug!(branch = %key, "Ignoring output of a stale branch");
            return Ok(false);
        };
        if !key.role.accepts(media) || branch.links.contains_key(&media) {
            return Ok(false);
        }
        let Some(target) = branch.target_pad(media) else {
            return Ok(false);
        };
        let decode = branch.decode_node();
        let normalize = branch.normalize_node(media);
        let gain = branch.gain;

        let decoded = self.topology.add_decoded_output(&decode, media)?;
        if let Err(e) = self.wire_output(key, media, &decoded, &normalize, &target) {
            warn!(branch = %key, "Failed to link {} output: {}", media, e);
            let _ = self.topology.release_pad(&target);
            let _ = self.topology.remove_node(&normalize);
            let _ = self.topology.release_pad(&decoded);
            return Err(e);
        }

        if let Some(branch) = self.live_branch(key) {
            branch.nodes.push(normalize);
            branch.links.insert(
                media,
                BranchLink {
                    target: target.clone(),
                    flowing: false,
                    drained: false,
                },
            );
        }
        if let (Some(gain), MediaKind::Audio, BranchRole::Announcement) = (gain, media, key.role) {
            self.backend.set_gain(&target, gain)?;
        }

        info!(branch = %key, "Linked {} output to {}", media, target);
        Ok(true)
    }

    fn wire_output(
        &mut self,
        key: BranchKey,
        media: MediaKind,
        decoded: &PadRef,
        normalize: &str,
        target: &PadRef,
    ) -> Result<(), GraphError> {
        self.topology.add_node(GraphNode::new(
            normalize,
            NodeKind::Transform(TransformKind::Normalize(media)),
        ))?;
        self.topology.link(decoded, &PadRef::new(normalize, SINK))?;
        self.topology
            .request_pad(&target.node, PadDirection::Input, BRANCH_INPUT)?;
        self.topology.link(&PadRef::new(normalize, SRC), target)?;
        self.topology.set_running(normalize)?;
        self.backend.link_branch(key, media, target)
    }

    /// Record that media of `media` is flowing; completes a pending switch for
    /// that kind.
    #[instrument(skip(self))]
    pub fn on_first_sample(&mut self, key: BranchKey, media: MediaKind) -> Result<(), GraphError> {
        let Some(branch) = self.live_branch(key) else {
            return Ok(());
        };
        let Some(link) = branch.links.get_mut(&media) else {
            return Ok(());
        };
        link.flowing = true;
        let pending = branch.pending_switch;

        debug!(branch = %key, "First {} sample", media);
        if pending && key.role == BranchRole::Program {
            if let Some(selector) = SelectorId::for_media(media) {
                self.select(selector, BRANCH_INPUT)?;
            }
        }
        Ok(())
    }

    /// Switch the selectors onto the branch of `role` as soon as each of its
    /// outputs is flowing. Kinds that never flow keep the default input.
    #[instrument(skip(self))]
    pub fn switch_when_ready(&mut self, role: BranchRole) -> Result<(), GraphError> {
        let Some(branch) = self.branches.get_mut(&role) else {
            return Ok(());
        };
        branch.pending_switch = true;

        let ready: Vec<MediaKind> = branch
            .links
            .iter()
            .filter(|(_, l)| l.flowing)
            .map(|(m, _)| *m)
            .collect();
        for media in ready {
            if let Some(selector) = SelectorId::for_media(media) {
                self.select(selector, BRANCH_INPUT)?;
            }
        }
        Ok(())
    }

    /// Make input `index` active on `selector`. The input must be linked.
    pub fn select(&mut self, selector: SelectorId, index: usize) -> Result<(), GraphError> {
        let pad = input_pad(selector.node(), index);
        if !self.topology.is_linked(&pad) {
            return Err(GraphError::InputNotLinked {
                selector: selector.node().to_string(),
                pad,
            });
        }
        if self.active_input(selector) == index {
            return Ok(());
        }

        self.backend.select(selector.node(), &pad)?;
        self.active.insert(selector, index);
        info!("{} now on {}", selector.node(), pad);
        Ok(())
    }

    /// Put both selectors back on their default inputs.
    pub fn switch_to_default(&mut self) -> Result<(), GraphError> {
        for selector in SelectorId::ALL {
            self.select(selector, DEFAULT_INPUT)?;
        }
        Ok(())
    }

    /// Remove the branch of `role`: selectors first, then its nodes and pads.
    /// Returns the key that was torn down, if any.
    #[instrument(skip(self))]
    pub fn teardown_branch(&mut self, role: BranchRole) -> Result<Option<BranchKey>, GraphError> {
        let Some(branch) = self.branches.remove(&role) else {
            return Ok(None);
        };

        for media in branch.links.keys() {
            if let Some(selector) = SelectorId::for_media(*media) {
                if role == BranchRole::Program && self.active_input(selector) == BRANCH_INPUT {
                    self.select(selector, DEFAULT_INPUT)?;
                }
            }
        }

        let backend_result = self.backend.teardown_branch(branch.key);

        for name in &branch.nodes {
            let _ = self.topology.remove_node(name);
        }
        for link in branch.links.values() {
            if let Err(e) = self.topology.release_pad(&link.target) {
                warn!(branch = %branch.key, "Failed to release {}: {}", link.target, e);
            }
        }

        info!(branch = %branch.key, "Branch torn down");
        backend_result.map(|_| Some(branch.key))
    }

    /// Record the end of one output. Returns the key once the whole branch has
    /// drained.
    pub fn on_branch_drained(&mut self, key: BranchKey, media: MediaKind) -> Option<BranchKey> {
        let branch = self.live_branch(key)?;
        branch.links.get_mut(&media)?.drained = true;
        branch.is_drained().then_some(key)
    }

    /// Gain of the music input of the mixer
    pub fn set_music_gain(&mut self, gain: f64) -> Result<(), GraphError> {
        self.backend
            .set_gain(&input_pad(AUDIO_MIXER, DEFAULT_INPUT), gain)
    }

    /// Gain applied to the branch's mixer input, now or once it is linked.
    pub fn set_branch_gain(&mut self, key: BranchKey, gain: f64) -> Result<(), GraphError> {
        let Some(branch) = self.live_branch(key) else {
            return Ok(());
        };
        branch.gain = Some(gain);
        let target = branch
            .links
            .get(&MediaKind::Audio)
            .filter(|l| l.target.node == AUDIO_MIXER)
            .map(|l| l.target.clone());

        match target {
            Some(target) => self.backend.set_gain(&target, gain),
            None => Ok(()),
        }
    }

    /// Tear down all branches, then drain and stop the backend.
    pub fn shutdown(&mut self, timeout: Duration) -> Result<(), GraphError> {
        for role in [BranchRole::Announcement, BranchRole::Program] {
            if let Err(e) = self.teardown_branch(role) {
                warn!("Failed to tear down {} branch: {}", role, e);
            }
        }
        self.backend.shutdown(timeout)
    }
}
