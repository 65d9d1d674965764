use std::fmt;

use serde::{Deserialize, Serialize};

/// A tagging strategy selects which meta-tags an image publishes under.
/// `StagesSignature` needs no further existence check once the tag is
/// present (the tag itself bakes in the content signature); the others are
/// compared against the remote tag's content-signature label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaggingStrategy {
    StagesSignature,
    Custom,
    GitBranch,
    GitTag,
    GitCommit,
}

impl TaggingStrategy {
    /// Whether this strategy's actualTag already uniquely identifies the
    /// content signature, making the content-signature-label re-check in
    /// §4.9 step 3 unnecessary.
    pub fn is_self_certifying(self) -> bool {
        matches!(self, TaggingStrategy::StagesSignature)
    }
}

impl fmt::Display for TaggingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaggingStrategy::StagesSignature => "stages-signature",
            TaggingStrategy::Custom => "custom",
            TaggingStrategy::GitBranch => "git-branch",
            TaggingStrategy::GitTag => "git-tag",
            TaggingStrategy::GitCommit => "git-commit",
        };
        write!(f, "{s}")
    }
}

/// One tag value selected by a [`TaggingStrategy`] — a branch name, a git
/// tag, a commit short-SHA, or a user-supplied custom string.
pub type MetaTag = String;
