//! Program scheduling: polling the schedule and deciding default/program
//! transitions

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::graph::{BranchKey, MediaSource};
use crate::ScheduleConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProgramId(pub i64);

impl fmt::Display for ProgramId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A program the schedule says should be on air now
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ScheduledProgram {
    pub id: ProgramId,
    #[serde(default)]
    pub title: String,
    /// Path relative to the media root, absolute path, or URL
    pub video_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Due(ScheduledProgram),
    NothingDue,
    /// Transport or decode failure; state stays as it is
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleAction {
    Hold,
    /// Attach a program branch and switch to it once it flows
    Start {
        program: ScheduledProgram,
        source: MediaSource,
    },
    /// Return to the default composite and drop the program branch
    Stop { id: ProgramId },
}

/// What is on air
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgramState {
    pub airing: Option<ProgramId>,
    pub branch: Option<BranchKey>,
    /// The file ended while the schedule still lists the program
    pub finished: bool,
}

/// Idle/Airing state machine fed by poll outcomes
#[derive(Debug, Clone)]
pub struct ProgramScheduler {
    media_root: PathBuf,
    state: ProgramState,
}

impl ProgramScheduler {
    pub fn new(media_root: impl Into<PathBuf>) -> Self {
        Self {
            media_root: media_root.into(),
            state: ProgramState::default(),
        }
    }

    pub fn state(&self) -> &ProgramState {
        &self.state
    }

    pub fn is_airing(&self) -> bool {
        self.state.airing.is_some()
    }

    /// The id held by the scheduler, finished or not
    pub fn program_on_air(&self) -> Option<ProgramId> {
        self.state.airing
    }

    pub fn on_poll(&mut self, outcome: PollOutcome) -> ScheduleAction {
        match outcome {
            PollOutcome::Failed(reason) => {
                warn!("Schedule poll failed: {}", reason);
                ScheduleAction::Hold
            }
            PollOutcome::NothingDue => match self.state.airing.take() {
                Some(id) => {
                    info!(program = %id, "Program no longer scheduled");
                    self.state = ProgramState::default();
                    ScheduleAction::Stop { id }
                }
                None => ScheduleAction::Hold,
            },
            PollOutcome::Due(program) if self.state.airing == Some(program.id) => {
                debug!(program = %program.id, "Program unchanged");
                ScheduleAction::Hold
            }
            PollOutcome::Due(program) => {
                info!(program = %program.id, title = %program.title, "Program due");
                self.state = ProgramState {
                    airing: Some(program.id),
                    branch: None,
                    finished: false,
                };
                let source = self.resolve(&program.video_path);
                ScheduleAction::Start { program, source }
            }
        }
    }

    /// Record the branch now carrying the airing program.
    pub fn attached(&mut self, key: BranchKey) {
        self.state.branch = Some(key);
    }

    /// Attaching failed: go back to idle so the next poll retries.
    pub fn abandon(&mut self) {
        self.state = ProgramState::default();
    }

    /// The program's file ended. Keeps the id so the program is not restarted
    /// while it is still scheduled. Returns whether `key` was the program's.
    pub fn mark_finished(&mut self, key: BranchKey) -> bool {
        if self.state.branch != Some(key) {
            return false;
        }
        self.state.branch = None;
        self.state.finished = true;
        true
    }

    /// URLs pass through, relative paths are joined to the media root.
    pub fn resolve(&self, video_path: &str) -> MediaSource {
        match MediaSource::parse(video_path) {
            MediaSource::File(path) if path.is_relative() => {
                MediaSource::File(self.media_root.join(path))
            }
            source => source,
        }
    }
}

/// Fetches the current program from the scheduling endpoint
#[derive(Debug, Clone)]
pub struct ScheduleClient {
    endpoint: String,
    http: reqwest::Client,
}

impl ScheduleClient {
    pub fn new(config: &ScheduleConfig) -> color_eyre::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            endpoint: config.endpoint.clone(),
            http,
        })
    }

    pub async fn poll(&self) -> PollOutcome {
        let response = match self.http.get(&self.endpoint).send().await {
            Ok(response) => response,
            Err(e) => return PollOutcome::Failed(e.to_string()),
        };
        let ok = response.status().is_success();
        match response.text().await {
            Ok(body) => interpret(ok, &body),
            Err(e) => PollOutcome::Failed(e.to_string()),
        }
    }
}

/// Non-success statuses, empty bodies, `null`, `{}` and objects without an id
/// mean nothing is scheduled. Undecodable bodies are failures.
pub fn interpret(status_ok: bool, body: &str) -> PollOutcome {
    if !status_ok || body.trim().is_empty() {
        return PollOutcome::NothingDue;
    }

    let value: serde_json::Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(e) => return PollOutcome::Failed(format!("invalid schedule response: {}", e)),
    };
    match &value {
        serde_json::Value::Null => return PollOutcome::NothingDue,
        serde_json::Value::Object(map) if map.get("id").map_or(true, |id| id.is_null()) => {
            return PollOutcome::NothingDue
        }
        _ => {}
    }

    match serde_json::from_value(value) {
        Ok(program) => PollOutcome::Due(program),
        Err(e) => PollOutcome::Failed(format!("invalid program: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::BranchRole;

    fn promo() -> ScheduledProgram {
        ScheduledProgram {
            id: ProgramId(7),
            title: "Promo".into(),
            video_path: "ads/promo.mp4".into(),
        }
    }

    #[test]
    fn interprets_empty_responses_as_nothing_due() {
        for body in ["", "  ", "null", "{}", r#"{"id": null}"#] {
            assert_eq!(interpret(true, body), PollOutcome::NothingDue, "{body:?}");
        }
        assert_eq!(
            interpret(false, r#"{"id": 7, "video_path": "a.mp4"}"#),
            PollOutcome::NothingDue
        );
    }

    #[test]
    fn interprets_programs_and_garbage() {
        let body = r#"{"id": 7, "title": "Promo", "video_path": "ads/promo.mp4"}"#;
        assert_eq!(interpret(true, body), PollOutcome::Due(promo()));
        assert!(matches!(interpret(true, "<html>"), PollOutcome::Failed(_)));
        assert!(matches!(interpret(true, r#"{"id": 7}"#), PollOutcome::Failed(_)));
    }

    #[test]
    fn starts_once_per_program_and_stops_when_empty() {
        let mut scheduler = ProgramScheduler::new("/srv/media");

        let action = scheduler.on_poll(PollOutcome::Due(promo()));
        assert_eq!(
            action,
            ScheduleAction::Start {
                program: promo(),
                source: MediaSource::File(PathBuf::from("/srv/media/ads/promo.mp4")),
            }
        );
        assert_eq!(scheduler.on_poll(PollOutcome::Due(promo())), ScheduleAction::Hold);
        assert_eq!(
            scheduler.on_poll(PollOutcome::Failed("timeout".into())),
            ScheduleAction::Hold
        );
        assert!(scheduler.is_airing());

        assert_eq!(
            scheduler.on_poll(PollOutcome::NothingDue),
            ScheduleAction::Stop { id: ProgramId(7) }
        );
        assert_eq!(scheduler.on_poll(PollOutcome::NothingDue), ScheduleAction::Hold);
    }

    #[test]
    fn new_id_replaces_program() {
        let mut scheduler = ProgramScheduler::new("media");
        scheduler.on_poll(PollOutcome::Due(promo()));

        let next = ScheduledProgram {
            id: ProgramId(8),
            title: String::new(),
            video_path: "https://cdn.example/next.mp4".into(),
        };
        let action = scheduler.on_poll(PollOutcome::Due(next.clone()));
        assert_eq!(
            action,
            ScheduleAction::Start {
                program: next,
                source: MediaSource::Uri("https://cdn.example/next.mp4".into()),
            }
        );
    }

    #[test]
    fn finished_program_is_not_restarted() {
        let mut scheduler = ProgramScheduler::new("media");
        scheduler.on_poll(PollOutcome::Due(promo()));
        let key = BranchKey {
            role: BranchRole::Program,
            generation: 1,
        };
        scheduler.attached(key);

        let stale = BranchKey {
            role: BranchRole::Program,
            generation: 0,
        };
        assert!(!scheduler.mark_finished(stale));
        assert!(scheduler.mark_finished(key));
        assert!(scheduler.state().finished);
        assert_eq!(scheduler.on_poll(PollOutcome::Due(promo())), ScheduleAction::Hold);
    }

    #[test]
    fn abandoned_attach_retries_next_poll() {
        let mut scheduler = ProgramScheduler::new("media");
        scheduler.on_poll(PollOutcome::Due(promo()));
        scheduler.abandon();
        assert!(matches!(
            scheduler.on_poll(PollOutcome::Due(promo())),
            ScheduleAction::Start { .. }
        ));
    }
}
