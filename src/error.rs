//! Typed errors raised by the media graph

use thiserror::Error;

use crate::graph::PadRef;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    #[error("node '{0}' already exists")]
    DuplicateNode(String),

    #[error("unknown node '{0}'")]
    UnknownNode(String),

    #[error("unknown pad {0}")]
    UnknownPad(PadRef),

    #[error("pad {0} already exists")]
    PadExists(PadRef),

    #[error("pad {0} is already linked")]
    AlreadyLinked(PadRef),

    #[error("cannot link {from} to {to}: {reason}")]
    InvalidLink {
        from: PadRef,
        to: PadRef,
        reason: &'static str,
    },

    #[error("node '{node}' cannot run while input {pad} is unlinked")]
    UnlinkedInput { node: String, pad: PadRef },

    #[error("node '{0}' has no request pads")]
    NotRequestable(String),

    #[error("pad {0} is static and cannot be released")]
    StaticPad(PadRef),

    #[error("selector '{selector}' cannot switch to unlinked input {pad}")]
    InputNotLinked { selector: String, pad: PadRef },

    #[error("no output endpoint configured")]
    NoEndpoint,

    #[error("invalid media source: {0}")]
    InvalidSource(String),

    #[error("media backend: {0}")]
    Backend(String),
}
