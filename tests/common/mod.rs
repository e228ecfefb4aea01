#![allow(dead_code)]

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use onair::graph::{
    BackbonePlan, BranchKey, GraphController, MediaBackend, MediaKind, MediaSource, PadRef,
    Topology,
};
use onair::{Config, GraphError};

/// One call made on the backend
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Build,
    Play,
    Attach(BranchKey, MediaSource),
    Link(BranchKey, MediaKind, PadRef),
    Teardown(BranchKey),
    Select(String, PadRef),
    Gain(PadRef, f64),
    Shutdown,
}

/// Backend that records every call and keeps track of live branches
#[derive(Debug, Default)]
pub struct RecordingBackend {
    pub calls: Vec<Call>,
    pub live: BTreeSet<BranchKey>,
    pub fail_attach: bool,
    pub frames: u64,
}

impl RecordingBackend {
    pub fn attaches(&self) -> Vec<(BranchKey, MediaSource)> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                Call::Attach(key, source) => Some((*key, source.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn selects(&self) -> Vec<(String, String)> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                Call::Select(selector, pad) => Some((selector.clone(), pad.pad.clone())),
                _ => None,
            })
            .collect()
    }

    /// Gains set on `node.pad`, in order
    pub fn gains(&self, node: &str, pad: &str) -> Vec<f64> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                Call::Gain(target, gain) if target.node == node && target.pad == pad => Some(*gain),
                _ => None,
            })
            .collect()
    }

    pub fn teardowns(&self) -> Vec<BranchKey> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                Call::Teardown(key) => Some(*key),
                _ => None,
            })
            .collect()
    }
}

impl MediaBackend for RecordingBackend {
    fn build(&mut self, _topology: &Topology) -> Result<(), GraphError> {
        self.calls.push(Call::Build);
        Ok(())
    }

    fn play(&mut self) -> Result<(), GraphError> {
        self.calls.push(Call::Play);
        Ok(())
    }

    fn attach_branch(&mut self, key: BranchKey, source: &MediaSource) -> Result<(), GraphError> {
        if self.fail_attach {
            return Err(GraphError::Backend("decoder unavailable".into()));
        }
        self.calls.push(Call::Attach(key, source.clone()));
        self.live.insert(key);
        Ok(())
    }

    fn link_branch(
        &mut self,
        key: BranchKey,
        media: MediaKind,
        target: &PadRef,
    ) -> Result<(), GraphError> {
        self.calls.push(Call::Link(key, media, target.clone()));
        Ok(())
    }

    fn teardown_branch(&mut self, key: BranchKey) -> Result<(), GraphError> {
        if self.live.remove(&key) {
            self.calls.push(Call::Teardown(key));
        }
        Ok(())
    }

    fn select(&mut self, selector: &str, input: &PadRef) -> Result<(), GraphError> {
        self.calls.push(Call::Select(selector.to_string(), input.clone()));
        Ok(())
    }

    fn set_gain(&mut self, input: &PadRef, gain: f64) -> Result<(), GraphError> {
        self.calls.push(Call::Gain(input.clone(), gain));
        Ok(())
    }

    fn frames_out(&self) -> u64 {
        self.frames
    }

    fn shutdown(&mut self, _timeout: Duration) -> Result<(), GraphError> {
        self.calls.push(Call::Shutdown);
        Ok(())
    }
}

/// Configuration with a single endpoint and files under `dir`
pub fn config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.output.primary = "rtmp://localhost/live".into();
    config.schedule.media_root = "/srv/media".into();
    config.announcer.trigger_file = dir.join("tts_trigger.json");
    config
}

pub fn controller(config: &Config) -> GraphController<RecordingBackend> {
    let plan = BackbonePlan::from_config(config).unwrap();
    let mut ctrl = GraphController::build(RecordingBackend::default(), &plan).unwrap();
    ctrl.start().unwrap();
    ctrl
}
