//! Seam between the typed graph and the media framework that realises it

use std::time::Duration;

use crate::error::GraphError;
use crate::events::BusEvent;
use crate::graph::branch::{BranchKey, MediaSource};
use crate::graph::node::{MediaKind, PadRef};
use crate::graph::topology::Topology;

/// Notification from the backend's streaming threads, handled on the loop
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    /// A branch decoder exposed an output of this kind; it is held until linked.
    PadResolved { branch: BranchKey, media: MediaKind },
    /// The first normalized sample of this kind left the branch
    FirstSample { branch: BranchKey, media: MediaKind },
    /// This output of the branch reached its end
    Drained { branch: BranchKey, media: MediaKind },
    Bus(BusEvent),
}

/// Realises a [`Topology`] and the branch operations performed on it.
///
/// All calls happen on the loop thread. Implementations report asynchronous
/// progress as [`BackendEvent`]s on their own channel.
pub trait MediaBackend {
    /// Create every backbone node and link.
    fn build(&mut self, topology: &Topology) -> Result<(), GraphError>;

    fn play(&mut self) -> Result<(), GraphError>;

    /// Start decoding `source` for a new branch. Outputs are reported with
    /// [`BackendEvent::PadResolved`].
    fn attach_branch(&mut self, key: BranchKey, source: &MediaSource) -> Result<(), GraphError>;

    /// Normalize the held output of `media` and link it to `target`, which the
    /// controller has just requested.
    fn link_branch(
        &mut self,
        key: BranchKey,
        media: MediaKind,
        target: &PadRef,
    ) -> Result<(), GraphError>;

    /// Stop and remove the branch, releasing the pads it was linked to.
    /// Unknown keys are ignored.
    fn teardown_branch(&mut self, key: BranchKey) -> Result<(), GraphError>;

    /// Make `input` the active input of `selector`.
    fn select(&mut self, selector: &str, input: &PadRef) -> Result<(), GraphError>;

    /// Set the gain of a mixer input.
    fn set_gain(&mut self, input: &PadRef, gain: f64) -> Result<(), GraphError>;

    /// Buffers pushed out of the mux so far
    fn frames_out(&self) -> u64;

    /// Drain encoders and mux, waiting at most `timeout`, then stop.
    fn shutdown(&mut self, timeout: Duration) -> Result<(), GraphError>;
}
