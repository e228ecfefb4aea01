//! Routing of graph-level notifications

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::graph::BranchKey;

/// Where a notification came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// The backbone or the graph as a whole
    Graph,
    Branch(BranchKey),
}

/// Notification posted by the media backend
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    EndOfStream {
        origin: Origin,
    },
    Error {
        origin: Origin,
        /// Element that posted the message
        source: String,
        detail: String,
    },
    Warning {
        origin: Origin,
        source: String,
        detail: String,
    },
    StateChanged {
        origin: Origin,
        old: String,
        new: String,
    },
}

/// What to do about errors on the graph as a whole
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorPolicy {
    /// Log and keep streaming
    #[default]
    KeepRunning,
    /// Exit non-zero and let the supervisor relaunch
    Exit,
}

/// Follow-up the loop has to perform after an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Continue,
    /// The branch ended or failed; its owner treats this as completion
    BranchFinished(BranchKey),
    Shutdown(String),
}

#[derive(Debug, Clone, Default)]
pub struct EventDispatcher {
    policy: ErrorPolicy,
}

impl EventDispatcher {
    pub fn new(policy: ErrorPolicy) -> Self {
        Self { policy }
    }

    pub fn dispatch(&self, event: &BusEvent) -> Dispatch {
        match event {
            BusEvent::EndOfStream {
                origin: Origin::Graph,
            } => {
                info!("End of stream on the main graph");
                Dispatch::Continue
            }
            BusEvent::EndOfStream {
                origin: Origin::Branch(key),
            } => {
                debug!(branch = %key, "Branch reached end of stream");
                Dispatch::BranchFinished(*key)
            }
            BusEvent::Error {
                origin: Origin::Branch(key),
                source,
                detail,
            } => {
                warn!(branch = %key, "Branch error from {}: {}", source, detail);
                Dispatch::BranchFinished(*key)
            }
            BusEvent::Error {
                origin: Origin::Graph,
                source,
                detail,
            } => {
                error!("Graph error from {}: {}", source, detail);
                metrics::counter!("graph_errors").increment(1);
                match self.policy {
                    ErrorPolicy::KeepRunning => Dispatch::Continue,
                    ErrorPolicy::Exit => Dispatch::Shutdown(format!("{source}: {detail}")),
                }
            }
            BusEvent::Warning {
                origin,
                source,
                detail,
            } => {
                match origin {
                    Origin::Graph => warn!("Graph warning from {}: {}", source, detail),
                    Origin::Branch(key) => {
                        warn!(branch = %key, "Branch warning from {}: {}", source, detail)
                    }
                }
                Dispatch::Continue
            }
            BusEvent::StateChanged { origin, old, new } => {
                if *origin == Origin::Graph {
                    info!("Graph state changed: {} -> {}", old, new);
                }
                Dispatch::Continue
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::BranchRole;

    fn branch() -> BranchKey {
        BranchKey {
            role: BranchRole::Announcement,
            generation: 3,
        }
    }

    fn graph_error() -> BusEvent {
        BusEvent::Error {
            origin: Origin::Graph,
            source: "video-encoder".into(),
            detail: "not negotiated".into(),
        }
    }

    #[test]
    fn branch_errors_complete_the_branch() {
        let dispatcher = EventDispatcher::default();
        let event = BusEvent::Error {
            origin: Origin::Branch(branch()),
            source: "announcement-decode".into(),
            detail: "could not demux".into(),
        };
        assert_eq!(dispatcher.dispatch(&event), Dispatch::BranchFinished(branch()));
    }

    #[test]
    fn graph_errors_follow_policy() {
        assert_eq!(
            EventDispatcher::new(ErrorPolicy::KeepRunning).dispatch(&graph_error()),
            Dispatch::Continue
        );
        assert!(matches!(
            EventDispatcher::new(ErrorPolicy::Exit).dispatch(&graph_error()),
            Dispatch::Shutdown(_)
        ));
    }

    #[test]
    fn graph_eos_is_only_logged() {
        let event = BusEvent::EndOfStream {
            origin: Origin::Graph,
        };
        assert_eq!(EventDispatcher::default().dispatch(&event), Dispatch::Continue);
    }

    #[test]
    fn policy_reads_kebab_case() {
        let policy: ErrorPolicy = serde_json::from_str("\"keep-running\"").unwrap();
        assert_eq!(policy, ErrorPolicy::KeepRunning);
        let policy: ErrorPolicy = serde_json::from_str("\"exit\"").unwrap();
        assert_eq!(policy, ErrorPolicy::Exit);
    }
}
