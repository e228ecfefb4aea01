//! Dynamic decode branches attached to selector and mixer inputs

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use url::Url;

use crate::error::GraphError;
use crate::graph::node::{request_pad_name, MediaKind, PadDirection, PadRef};
use crate::graph::topology::{AUDIO_MIXER, AUDIO_SELECTOR, BRANCH_INPUT, VIDEO_SELECTOR};

/// What a branch is for. At most one branch per role exists at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BranchRole {
    Program,
    Announcement,
}

impl BranchRole {
    /// Whether decoded outputs of this media kind are used by the role
    pub fn accepts(self, media: MediaKind) -> bool {
        match self {
            BranchRole::Program => matches!(media, MediaKind::Video | MediaKind::Audio),
            BranchRole::Announcement => media == MediaKind::Audio,
        }
    }

    /// Node receiving this role's output of the given kind
    pub fn target_node(self, media: MediaKind) -> Option<&'static str> {
        match (self, media) {
            (BranchRole::Program, MediaKind::Video) => Some(VIDEO_SELECTOR),
            (BranchRole::Program, MediaKind::Audio) => Some(AUDIO_SELECTOR),
            (BranchRole::Announcement, MediaKind::Audio) => Some(AUDIO_MIXER),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BranchRole::Program => "program",
            BranchRole::Announcement => "announcement",
        }
    }
}

impl fmt::Display for BranchRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one attachment of a role. Generations only grow, so an event
/// from a replaced branch never matches the live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BranchKey {
    pub role: BranchRole,
    pub generation: u64,
}

impl fmt::Display for BranchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.role, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BranchPhase {
    /// Decoding started, outputs not known yet
    Requested,
    /// At least one output normalized and linked
    Linked,
    /// A normalized sample has been observed
    Flowing,
}

/// Where a branch reads its media from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaSource {
    File(PathBuf),
    Uri(String),
}

impl MediaSource {
    /// Anything with a scheme is passed through, everything else is a path.
    pub fn parse(location: &str) -> Self {
        match Url::parse(location) {
            Ok(url) if url.scheme().len() > 1 => MediaSource::Uri(location.to_string()),
            _ => MediaSource::File(PathBuf::from(location)),
        }
    }

    pub fn uri(&self) -> Result<String, GraphError> {
        match self {
            MediaSource::Uri(uri) => Ok(uri.clone()),
            MediaSource::File(path) => {
                let absolute = if path.is_absolute() {
                    path.clone()
                } else {
                    std::env::current_dir()
                        .map_err(|e| GraphError::InvalidSource(e.to_string()))?
                        .join(path)
                };
                Url::from_file_path(&absolute)
                    .map(String::from)
                    .map_err(|_| GraphError::InvalidSource(absolute.display().to_string()))
            }
        }
    }
}

impl fmt::Display for MediaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaSource::File(path) => write!(f, "{}", path.display()),
            MediaSource::Uri(uri) => f.write_str(uri),
        }
    }
}

/// One decoded output wired into the backbone
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchLink {
    /// Request pad on the selector or mixer
    pub target: PadRef,
    pub flowing: bool,
    pub drained: bool,
}

#[derive(Debug, Clone)]
pub struct DynamicBranch {
    pub key: BranchKey,
    pub source: MediaSource,
    /// Topology nodes owned by this branch
    pub nodes: Vec<String>,
    pub links: BTreeMap<MediaKind, BranchLink>,
    /// Selectors to move onto this branch once its media flows
    pub pending_switch: bool,
    pub gain: Option<f64>,
}

impl DynamicBranch {
    pub fn new(key: BranchKey, source: MediaSource) -> Self {
        Self {
            key,
            source,
            nodes: Vec::new(),
            links: BTreeMap::new(),
            pending_switch: false,
            gain: None,
        }
    }

    pub fn phase(&self) -> BranchPhase {
        if self.links.values().any(|l| l.flowing) {
            BranchPhase::Flowing
        } else if !self.links.is_empty() {
            BranchPhase::Linked
        } else {
            BranchPhase::Requested
        }
    }

    /// Every linked output has reached its end
    pub fn is_drained(&self) -> bool {
        !self.links.is_empty() && self.links.values().all(|l| l.drained)
    }

    /// Reserved request pad on the target of `media` for this branch
    pub fn target_pad(&self, media: MediaKind) -> Option<PadRef> {
        let node = self.key.role.target_node(media)?;
        Some(PadRef::new(
            node,
            request_pad_name(PadDirection::Input, BRANCH_INPUT),
        ))
    }

    /// Name of the branch's decoder node
    pub fn decode_node(&self) -> String {
        format!("{}-decode", self.key.role)
    }

    /// Name of the normalizing node for one decoded output
    pub fn normalize_node(&self, media: MediaKind) -> String {
        format!("{}-{}-normalize", self.key.role, media)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_accept_their_media() {
        assert!(BranchRole::Program.accepts(MediaKind::Video));
        assert!(BranchRole::Program.accepts(MediaKind::Audio));
        assert!(!BranchRole::Announcement.accepts(MediaKind::Video));
        assert_eq!(
            BranchRole::Announcement.target_node(MediaKind::Audio),
            Some(AUDIO_MIXER)
        );
    }

    #[test]
    fn sources_parse_paths_and_uris() {
        assert_eq!(
            MediaSource::parse("ads/promo.mp4"),
            MediaSource::File(PathBuf::from("ads/promo.mp4"))
        );
        assert_eq!(
            MediaSource::parse("https://cdn/promo.mp4"),
            MediaSource::Uri("https://cdn/promo.mp4".into())
        );
        let uri = MediaSource::File(PathBuf::from("/srv/media/a.wav")).uri().unwrap();
        assert_eq!(uri, "file:///srv/media/a.wav");
    }

    #[test]
    fn phase_follows_links() {
        let key = BranchKey {
            role: BranchRole::Program,
            generation: 1,
        };
        let mut branch = DynamicBranch::new(key, MediaSource::parse("a.mp4"));
        assert_eq!(branch.phase(), BranchPhase::Requested);
        assert!(!branch.is_drained());

        let target = branch.target_pad(MediaKind::Video).unwrap();
        assert_eq!(target, PadRef::new(VIDEO_SELECTOR, "sink_1"));
        branch.links.insert(
            MediaKind::Video,
            BranchLink {
                target,
                flowing: false,
                drained: false,
            },
        );
        assert_eq!(branch.phase(), BranchPhase::Linked);

        if let Some(link) = branch.links.get_mut(&MediaKind::Video) {
            link.flowing = true;
            link.drained = true;
        }
        assert_eq!(branch.phase(), BranchPhase::Flowing);
        assert!(branch.is_drained());
    }
}
