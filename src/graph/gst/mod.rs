//! GStreamer realisation of the media graph

mod compose;
mod elements;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flume::{Receiver, Sender};
use gstreamer as gst;
use gstreamer::prelude::*;
use tracing::{debug, info, instrument, warn};

use crate::error::GraphError;
use crate::events::{BusEvent, Origin};
use crate::graph::backend::{BackendEvent, MediaBackend};
use crate::graph::branch::{BranchKey, BranchRole, MediaSource};
use crate::graph::node::{MediaKind, NodeKind, PadDirection, PadRef, SourceKind, TransformKind};
use crate::graph::topology::{Topology, COMPOSITOR, MUSIC, MUX};
use crate::overlay::SharedFrame;
use crate::Config;

use compose::Compositor;
use elements::Chain;

const PIPELINE_NAME: &str = "onair";

/// Decoded branch outputs held by a blocking probe until linked
type HeldPads = Arc<Mutex<HashMap<(BranchKey, MediaKind), (gst::Pad, gst::PadProbeId)>>>;

struct BranchBin {
    bin: gst::Bin,
    /// Backbone request pads this branch is linked to
    targets: Vec<PadRef>,
}

/// Media backend running a single `gst::Pipeline`
pub struct GstBackend {
    pipeline: gst::Pipeline,
    config: Config,
    chains: HashMap<String, Chain>,
    requested: HashMap<PadRef, gst::Pad>,
    branches: HashMap<BranchKey, BranchBin>,
    held: HeldPads,
    events: Sender<BackendEvent>,
    eos: Receiver<()>,
    frames_out: Arc<AtomicU64>,
    compositor: Arc<Compositor>,
}

impl GstBackend {
    /// Create the pipeline and the channel its notifications arrive on.
    pub fn new(
        config: &Config,
        frame: SharedFrame,
    ) -> Result<(Self, Receiver<BackendEvent>), GraphError> {
        gst::init()
            .map_err(|e| GraphError::Backend(format!("Failed to initialize GStreamer: {}", e)))?;
        info!("Initializing GStreamer media graph");

        let pipeline = gst::Pipeline::builder().name(PIPELINE_NAME).build();
        let (events, rx) = flume::unbounded();
        let (eos_tx, eos) = flume::bounded(1);

        let bus = pipeline
            .bus()
            .ok_or_else(|| GraphError::Backend("pipeline has no bus".into()))?;
        let bus_events = events.clone();
        let music_convert = format!("{MUSIC}-convert");
        bus.set_sync_handler(move |_, msg| {
            forward_message(msg, &bus_events, &eos_tx, &music_convert);
            gst::BusSyncReply::Drop
        });

        Ok((
            Self {
                pipeline,
                config: config.clone(),
                chains: HashMap::new(),
                requested: HashMap::new(),
                branches: HashMap::new(),
                held: Arc::new(Mutex::new(HashMap::new())),
                events,
                eos,
                frames_out: Arc::new(AtomicU64::new(0)),
                compositor: Arc::new(Compositor::new(frame)),
            },
            rx,
        ))
    }

    /// The GStreamer pad behind a topology pad, requesting it if needed.
    fn gst_pad(&mut self, pad: &PadRef, direction: PadDirection) -> Result<gst::Pad, GraphError> {
        if let Some(found) = self.requested.get(pad) {
            return Ok(found.clone());
        }

        let chain = self
            .chains
            .get(&pad.node)
            .ok_or_else(|| GraphError::UnknownNode(pad.node.clone()))?;

        let requestable = pad.pad.starts_with("sink_")
            || pad.pad.starts_with("src_")
            || (pad.node == MUX && direction == PadDirection::Input);
        let found = if requestable {
            let template = match (pad.node.as_str(), direction) {
                (MUX, _) => pad.pad.as_str(),
                (_, PadDirection::Input) => "sink_%u",
                (_, PadDirection::Output) => "src_%u",
            };
            let requested = chain
                .first
                .request_pad_simple(template)
                .ok_or_else(|| GraphError::UnknownPad(pad.clone()))?;
            self.requested.insert(pad.clone(), requested.clone());
            requested
        } else {
            let (element, name) = match direction {
                PadDirection::Input => (&chain.first, "sink"),
                PadDirection::Output => (&chain.last, "src"),
            };
            element
                .static_pad(name)
                .ok_or_else(|| GraphError::UnknownPad(pad.clone()))?
        };
        Ok(found)
    }

    fn release(&mut self, pad: &PadRef) {
        if let Some(gst_pad) = self.requested.remove(pad) {
            if let Some(chain) = self.chains.get(&pad.node) {
                chain.first.release_request_pad(&gst_pad);
            }
        }
    }

    /// Count buffers leaving the mux; the heartbeat reports this.
    fn watch_output(&self) -> Result<(), GraphError> {
        let mux = self
            .chains
            .get(MUX)
            .and_then(|c| c.last.static_pad("src"))
            .ok_or_else(|| GraphError::UnknownPad(PadRef::new(MUX, "src")))?;
        let frames = Arc::clone(&self.frames_out);
        mux.add_probe(gst::PadProbeType::BUFFER, move |_, _| {
            frames.fetch_add(1, Ordering::Relaxed);
            gst::PadProbeReturn::Ok
        });
        Ok(())
    }

    /// Start the music loop with a flushing segment seek.
    fn seek_music(&self) {
        if self.config.audio.music_path.is_none() {
            return;
        }
        if let Some(chain) = self.chains.get(MUSIC) {
            if let Some(convert) = chain.elements.get(1) {
                send_loop_seek(convert, gst::SeekFlags::FLUSH);
            }
        }
    }
}

fn send_loop_seek(element: &gst::Element, extra: gst::SeekFlags) {
    let flags = gst::SeekFlags::SEGMENT | extra;
    element.call_async(move |element| {
        let seek = gst::event::Seek::new(
            1.0,
            flags,
            gst::SeekType::Set,
            gst::ClockTime::ZERO,
            gst::SeekType::None,
            gst::ClockTime::NONE,
        );
        let sent = element
            .static_pad("src")
            .map(|pad| pad.send_event(seek))
            .unwrap_or(false);
        if !sent {
            warn!("Music loop seek was not handled");
        }
    });
}

/// `{role}-branch-{generation}`
fn branch_bin_name(key: BranchKey) -> String {
    format!("{}-branch-{}", key.role, key.generation)
}

fn parse_branch_bin(name: &str) -> Option<BranchKey> {
    let (role, generation) = name.rsplit_once("-branch-")?;
    let role = match role {
        "program" => BranchRole::Program,
        "announcement" => BranchRole::Announcement,
        _ => return None,
    };
    Some(BranchKey {
        role,
        generation: generation.parse().ok()?,
    })
}

/// Branch owning `object`, found by walking up its parents
fn origin_of(object: Option<&gst::Object>) -> Origin {
    let mut current = object.cloned();
    while let Some(obj) = current {
        if let Some(key) = parse_branch_bin(&obj.name()) {
            return Origin::Branch(key);
        }
        current = obj.parent();
    }
    Origin::Graph
}

/// Runs on whichever thread posted the message; only forwards.
fn forward_message(
    msg: &gst::Message,
    events: &Sender<BackendEvent>,
    eos: &Sender<()>,
    music_convert: &str,
) {
    use gst::MessageView;

    let src = msg.src();
    let source = src.map(|s| s.name().to_string()).unwrap_or_default();
    let origin = origin_of(src);

    let event = match msg.view() {
        // Branch ends arrive from the drain probe; a discard sink finishing
        // early must not end the branch.
        MessageView::Eos(_) if origin != Origin::Graph => return,
        MessageView::Eos(_) => {
            let _ = eos.try_send(());
            BusEvent::EndOfStream { origin }
        }
        MessageView::Error(err) => BusEvent::Error {
            origin,
            source,
            detail: match err.debug() {
                Some(debug) => format!("{} ({})", err.error(), debug),
                None => err.error().to_string(),
            },
        },
        MessageView::Warning(w) => BusEvent::Warning {
            origin,
            source,
            detail: w.error().to_string(),
        },
        MessageView::StateChanged(sc) if source == PIPELINE_NAME => BusEvent::StateChanged {
            origin,
            old: format!("{:?}", sc.old()),
            new: format!("{:?}", sc.current()),
        },
        MessageView::SegmentDone(_) => {
            // Only the music loop seeks in segment mode.
            if let Some(pipeline) = src.and_then(|s| {
                let mut top = s.clone();
                while let Some(parent) = top.parent() {
                    top = parent;
                }
                top.downcast::<gst::Bin>().ok()
            }) {
                if let Some(convert) = pipeline.by_name(music_convert) {
                    send_loop_seek(&convert, gst::SeekFlags::empty());
                }
            }
            return;
        }
        _ => return,
    };

    let _ = events.send(BackendEvent::Bus(event));
}

/// Media kind of a decoded pad, from its caps
fn classify(pad: &gst::Pad) -> Option<MediaKind> {
    let caps = pad.current_caps().unwrap_or_else(|| pad.query_caps(None));
    let name = caps.structure(0)?.name();
    if name.starts_with("video/") {
        Some(MediaKind::Video)
    } else if name.starts_with("audio/") {
        Some(MediaKind::Audio)
    } else {
        None
    }
}

/// Terminate an output nobody consumes so it never stalls the decoder.
fn discard(bin: &gst::Bin, pad: &gst::Pad) {
    let sink = match elements::make("fakesink", &format!("{}-discard", pad.name())) {
        Ok(sink) => sink,
        Err(e) => {
            warn!("{}", e);
            return;
        }
    };
    sink.set_property("sync", false);
    if bin.add(&sink).is_err() {
        return;
    }
    let _ = sink.sync_state_with_parent();
    if let Some(sink_pad) = sink.static_pad("sink") {
        let _ = pad.link(&sink_pad);
    }
}

impl MediaBackend for GstBackend {
    #[instrument(skip_all)]
    fn build(&mut self, topology: &Topology) -> Result<(), GraphError> {
        for node in topology.nodes() {
            let chain = elements::realize(node, &self.config)?;
            self.pipeline
                .add_many(&chain.elements)
                .map_err(|e| GraphError::Backend(format!("Failed to add {}: {}", node.name, e)))?;
            if node.kind == NodeKind::Transform(TransformKind::Overlay) {
                self.compositor.attach(&chain.first);
            }
            if node.kind == NodeKind::Source(SourceKind::Pattern) {
                debug!("Default picture: {}", self.config.video.pattern);
            }
            self.chains.insert(node.name.clone(), chain);
        }

        for link in topology.links() {
            let src = self.gst_pad(&link.from, PadDirection::Output)?;
            let sink = self.gst_pad(&link.to, PadDirection::Input)?;
            src.link(&sink).map_err(|e| {
                GraphError::Backend(format!("Failed to link {} to {}: {:?}", link.from, link.to, e))
            })?;
        }

        if !self.chains.contains_key(COMPOSITOR) {
            warn!("Backbone has no overlay compositor");
        }
        self.watch_output()
    }

    fn play(&mut self) -> Result<(), GraphError> {
        info!("Starting GStreamer pipeline");
        self.pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| GraphError::Backend(format!("Failed to start pipeline: {:?}", e)))?;

        let (state_change, _, _) = self.pipeline.state(Some(gst::ClockTime::from_seconds(5)));
        match state_change {
            Ok(gst::StateChangeSuccess::Success) | Ok(gst::StateChangeSuccess::NoPreroll) => {
                info!("Pipeline started successfully");
            }
            Ok(gst::StateChangeSuccess::Async) => info!("Pipeline starting asynchronously"),
            Err(_) => return Err(GraphError::Backend("Failed to start pipeline".into())),
        }

        self.seek_music();
        Ok(())
    }

    #[instrument(skip(self))]
    fn attach_branch(&mut self, key: BranchKey, source: &MediaSource) -> Result<(), GraphError> {
        let uri = source.uri()?;
        let bin = gst::Bin::builder().name(branch_bin_name(key)).build();
        let decode = elements::make("uridecodebin", &format!("{}-decode", key.role))?;
        decode.set_property("uri", &uri);
        bin.add(&decode)
            .map_err(|e| GraphError::Backend(format!("Failed to add decoder: {}", e)))?;

        let held = Arc::clone(&self.held);
        let events = self.events.clone();
        let bin_weak = bin.downgrade();
        decode.connect_pad_added(move |_, pad| {
            let Some(bin) = bin_weak.upgrade() else {
                return;
            };
            let media = classify(pad).filter(|m| key.role.accepts(*m));
            let Some(media) = media else {
                discard(&bin, pad);
                return;
            };

            let mut held = held.lock().unwrap_or_else(|e| e.into_inner());
            if held.contains_key(&(key, media)) {
                // Only the first stream of each kind is used.
                drop(held);
                discard(&bin, pad);
                return;
            }
            let Some(probe) = pad.add_probe(gst::PadProbeType::BLOCK_DOWNSTREAM, |_, _| {
                gst::PadProbeReturn::Ok
            }) else {
                return;
            };
            held.insert((key, media), (pad.clone(), probe));
            drop(held);

            let _ = events.send(BackendEvent::PadResolved { branch: key, media });
        });

        self.pipeline
            .add(&bin)
            .map_err(|e| GraphError::Backend(format!("Failed to add branch: {}", e)))?;
        bin.sync_state_with_parent()
            .map_err(|e| GraphError::Backend(format!("Failed to start branch: {}", e)))?;

        info!(branch = %key, "Decoding {}", uri);
        self.branches.insert(
            key,
            BranchBin {
                bin,
                targets: Vec::new(),
            },
        );
        Ok(())
    }

    #[instrument(skip(self))]
    fn link_branch(
        &mut self,
        key: BranchKey,
        media: MediaKind,
        target: &PadRef,
    ) -> Result<(), GraphError> {
        let bin = self
            .branches
            .get(&key)
            .map(|b| b.bin.clone())
            .ok_or_else(|| GraphError::Backend(format!("unknown branch {}", key)))?;
        let (decoded, probe) = self
            .held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(key, media))
            .ok_or_else(|| GraphError::Backend(format!("no held {} output on {}", media, key)))?;

        let chain = elements::normalizer(&format!("{}-{}", key.role, media), media, &self.config)?;
        bin.add_many(&chain.elements)
            .map_err(|e| GraphError::Backend(format!("Failed to add normalizer: {}", e)))?;
        for element in &chain.elements {
            let _ = element.sync_state_with_parent();
        }

        let first_sink = chain
            .first
            .static_pad("sink")
            .ok_or_else(|| GraphError::Backend("normalizer has no sink".into()))?;
        decoded
            .link(&first_sink)
            .map_err(|e| GraphError::Backend(format!("Failed to link decoder: {:?}", e)))?;

        let last_src = chain
            .last
            .static_pad("src")
            .ok_or_else(|| GraphError::Backend("normalizer has no src".into()))?;
        let ghost = gst::GhostPad::builder_with_target(&last_src)
            .map_err(|e| GraphError::Backend(e.to_string()))?
            .name(media.pad_name())
            .build();
        ghost
            .set_active(true)
            .map_err(|e| GraphError::Backend(e.to_string()))?;
        bin.add_pad(&ghost)
            .map_err(|e| GraphError::Backend(e.to_string()))?;

        // Branch timestamps start at zero; shift them to the current running time.
        if let Some(running) = self.pipeline.current_running_time() {
            ghost.set_offset(running.nseconds() as i64);
        }

        let events = self.events.clone();
        ghost.add_probe(gst::PadProbeType::BUFFER, move |_, _| {
            let _ = events.send(BackendEvent::FirstSample { branch: key, media });
            gst::PadProbeReturn::Remove
        });
        let events = self.events.clone();
        ghost.add_probe(gst::PadProbeType::EVENT_DOWNSTREAM, move |_, info| {
            match &info.data {
                Some(gst::PadProbeData::Event(event)) if event.type_() == gst::EventType::Eos => {
                    let _ = events.send(BackendEvent::Drained { branch: key, media });
                    // The backbone must never see a branch's end of stream.
                    gst::PadProbeReturn::Drop
                }
                _ => gst::PadProbeReturn::Ok,
            }
        });

        let target_pad = self.gst_pad(target, PadDirection::Input)?;
        ghost
            .link(&target_pad)
            .map_err(|e| {
                GraphError::Backend(format!("Failed to link {} to {}: {:?}", key, target, e))
            })?;
        if let Some(branch) = self.branches.get_mut(&key) {
            branch.targets.push(target.clone());
        }

        decoded.remove_probe(probe);
        Ok(())
    }

    #[instrument(skip(self))]
    fn teardown_branch(&mut self, key: BranchKey) -> Result<(), GraphError> {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(k, _), _| *k != key);

        let Some(branch) = self.branches.remove(&key) else {
            return Ok(());
        };

        for target in &branch.targets {
            if let Some(pad) = self.requested.get(target) {
                if let Some(peer) = pad.peer() {
                    let _ = peer.unlink(pad);
                }
            }
            self.release(target);
        }

        branch
            .bin
            .set_state(gst::State::Null)
            .map_err(|e| GraphError::Backend(format!("Failed to stop branch: {:?}", e)))?;
        self.pipeline
            .remove(&branch.bin)
            .map_err(|e| GraphError::Backend(format!("Failed to remove branch: {}", e)))?;
        debug!(branch = %key, "Branch removed from pipeline");
        Ok(())
    }

    fn select(&mut self, selector: &str, input: &PadRef) -> Result<(), GraphError> {
        let pad = self.gst_pad(input, PadDirection::Input)?;
        let element = self
            .chains
            .get(selector)
            .map(|c| c.first.clone())
            .ok_or_else(|| GraphError::UnknownNode(selector.to_string()))?;
        element.set_property("active-pad", &pad);
        Ok(())
    }

    fn set_gain(&mut self, input: &PadRef, gain: f64) -> Result<(), GraphError> {
        let pad = self.gst_pad(input, PadDirection::Input)?;
        pad.set_property("volume", gain);
        Ok(())
    }

    fn frames_out(&self) -> u64 {
        self.frames_out.load(Ordering::Relaxed)
    }

    fn shutdown(&mut self, timeout: Duration) -> Result<(), GraphError> {
        info!("Draining pipeline");
        self.pipeline.send_event(gst::event::Eos::new());
        if self.eos.recv_timeout(timeout).is_err() {
            warn!("Pipeline did not drain within {:?}", timeout);
        }

        info!("Stopping GStreamer pipeline");
        self.pipeline
            .set_state(gst::State::Null)
            .map_err(|e| GraphError::Backend(format!("Failed to stop pipeline: {:?}", e)))?;
        Ok(())
    }
}

impl Drop for GstBackend {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_bins_round_trip_their_key() {
        let key = BranchKey {
            role: BranchRole::Announcement,
            generation: 12,
        };
        assert_eq!(parse_branch_bin(&branch_bin_name(key)), Some(key));
        assert_eq!(parse_branch_bin("video-selector"), None);
    }
}
