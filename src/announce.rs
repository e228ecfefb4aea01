//! Voice announcements: trigger file watching and music ducking

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::error::GraphError;
use crate::graph::{BranchKey, BranchRole, GraphController, MediaBackend, MediaSource};
use crate::AudioConfig;

/// Record written by whoever produced the announcement audio
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AnnouncementTrigger {
    /// Seconds since the epoch
    pub timestamp: f64,
    pub file: PathBuf,
    /// Only "play" (or nothing) starts playback
    #[serde(default)]
    pub action: Option<String>,
}

impl AnnouncementTrigger {
    fn plays(&self) -> bool {
        self.action.as_deref().map_or(true, |a| a == "play")
    }
}

/// Polls the trigger file and yields each fresh trigger once
#[derive(Debug, Clone)]
pub struct TriggerWatcher {
    path: PathBuf,
    last_acted: Option<f64>,
    /// Triggers older than this are consumed without playing
    not_before: f64,
}

impl TriggerWatcher {
    pub fn new(path: impl Into<PathBuf>, not_before: f64) -> Self {
        Self {
            path: path.into(),
            last_acted: None,
            not_before,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A trigger whose timestamp is strictly newer than the last one seen.
    /// Missing or half-written files read as no trigger.
    pub fn check(&mut self) -> Option<AnnouncementTrigger> {
        let contents = std::fs::read_to_string(&self.path).ok()?;
        let trigger: AnnouncementTrigger = match serde_json::from_str(&contents) {
            Ok(trigger) => trigger,
            Err(e) => {
                debug!("Trigger file not readable yet: {}", e);
                return None;
            }
        };

        if self.last_acted.is_some_and(|last| trigger.timestamp <= last) {
            return None;
        }
        self.last_acted = Some(trigger.timestamp);

        if trigger.timestamp < self.not_before {
            debug!(timestamp = trigger.timestamp, "Skipping trigger from before startup");
            return None;
        }
        if !trigger.plays() {
            debug!(action = ?trigger.action, "Ignoring trigger action");
            return None;
        }
        Some(trigger)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MusicVolumeState {
    Normal,
    Ducked,
}

/// Ducks the music under an announcement branch and restores it afterwards
#[derive(Debug, Clone)]
pub struct AnnouncementDucker {
    music_gain: f64,
    ducked_gain: f64,
    announcement_gain: f64,
    volume: MusicVolumeState,
    active: Option<BranchKey>,
}

impl AnnouncementDucker {
    pub fn new(audio: &AudioConfig) -> Self {
        Self {
            music_gain: audio.music_gain,
            ducked_gain: audio.ducked_gain,
            announcement_gain: audio.announcement_gain,
            volume: MusicVolumeState::Normal,
            active: None,
        }
    }

    pub fn volume(&self) -> MusicVolumeState {
        self.volume
    }

    pub fn active(&self) -> Option<BranchKey> {
        self.active
    }

    /// Play `trigger`, replacing any announcement in progress. Returns the new
    /// branch, or `None` when the trigger was ignored.
    #[instrument(skip(self, ctrl))]
    pub fn on_trigger<B: MediaBackend>(
        &mut self,
        ctrl: &mut GraphController<B>,
        trigger: &AnnouncementTrigger,
        program_on_air: bool,
    ) -> Result<Option<BranchKey>, GraphError> {
        if program_on_air {
            info!("Program audio on air, announcement skipped");
            return Ok(None);
        }
        if let Err(e) = std::fs::File::open(&trigger.file) {
            warn!("Announcement {} not playable: {}", trigger.file.display(), e);
            return Ok(None);
        }

        self.duck(ctrl)?;
        let source = MediaSource::File(trigger.file.clone());
        let key = match ctrl.attach_branch(BranchRole::Announcement, source) {
            Ok(key) => key,
            Err(e) => {
                self.active = None;
                self.restore(ctrl)?;
                return Err(e);
            }
        };
        ctrl.set_branch_gain(key, self.announcement_gain)?;
        self.active = Some(key);

        info!(branch = %key, "Announcement started: {}", trigger.file.display());
        Ok(Some(key))
    }

    /// The branch ended or failed. Only the current announcement restores the
    /// music; returns whether `key` was it.
    pub fn on_finished<B: MediaBackend>(
        &mut self,
        ctrl: &mut GraphController<B>,
        key: BranchKey,
    ) -> Result<bool, GraphError> {
        if self.active != Some(key) {
            debug!(branch = %key, "Ignoring end of a replaced announcement");
            return Ok(false);
        }
        self.active = None;
        self.restore(ctrl)?;
        ctrl.teardown_branch(BranchRole::Announcement)?;
        info!(branch = %key, "Announcement finished");
        Ok(true)
    }

    fn duck<B: MediaBackend>(&mut self, ctrl: &mut GraphController<B>) -> Result<(), GraphError> {
        if self.volume == MusicVolumeState::Normal {
            ctrl.set_music_gain(self.ducked_gain)?;
            self.volume = MusicVolumeState::Ducked;
        }
        Ok(())
    }

    fn restore<B: MediaBackend>(
        &mut self,
        ctrl: &mut GraphController<B>,
    ) -> Result<(), GraphError> {
        if self.volume == MusicVolumeState::Ducked {
            ctrl.set_music_gain(self.music_gain)?;
            self.volume = MusicVolumeState::Normal;
        }
        Ok(())
    }
}
