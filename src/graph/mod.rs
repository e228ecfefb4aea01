//! The live media graph: typed topology, dynamic branches and the backend
//! that realises them

pub mod backend;
pub mod branch;
pub mod controller;
#[cfg(feature = "gstreamer-pipeline")]
pub mod gst;
pub mod node;
pub mod topology;

pub use backend::{BackendEvent, MediaBackend};
pub use branch::{BranchKey, BranchPhase, BranchRole, DynamicBranch, MediaSource};
pub use controller::{GraphController, SelectorId};
pub use node::{GraphNode, MediaKind, NodeKind, PadDirection, PadRef};
pub use topology::{BackbonePlan, Endpoint, Topology, BRANCH_INPUT, DEFAULT_INPUT};
