use kiln_hash::Digest256;
use serde::{Deserialize, Serialize};

/// The closed enumeration of stage kinds a [`crate::image::Image`] can be built
/// from. Order here has no meaning; a stage's position in
/// [`crate::image::Image::stages`] is what fixes build order, and for layered
/// images that position is assigned by the stapel stage graph, not by this
/// enum's declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    From,
    BeforeInstall,
    GitCache,
    GitLatestPatch,
    Install,
    Setup,
    DockerInstructions,
    Dockerfile,
}

/// An ordered sequence of strings fed to the hasher along with the
/// predecessor signature. Order is significant and empty elements are
/// preserved — callers must not filter or sort before constructing one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DependencyVector(pub Vec<String>);

impl DependencyVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, part: impl Into<String>) {
        self.0.push(part.into());
    }

    pub fn extend_from(&mut self, other: &DependencyVector) {
        self.0.extend(other.0.iter().cloned());
    }

    pub fn as_parts(&self) -> &[String] {
        &self.0
    }
}

impl FromIterator<String> for DependencyVector {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// The pair (signature, uniqueID) that identifies one historical build of a
/// stage. Equality for cache lookups should compare `signature` alone;
/// equality for retention and tag selection should compare both fields,
/// which is what the derived `PartialEq` does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StageId {
    pub signature: Digest256,
    /// Monotonically-assigned at store time; distinguishes content-equivalent
    /// builds that share a signature but differ bit-for-bit (e.g. differing
    /// base image digests pulled at different times).
    pub unique_id: u64,
}

impl StageId {
    pub fn new(signature: Digest256, unique_id: u64) -> Self {
        Self { signature, unique_id }
    }

    /// Remote tag encoding for this stage per the store's tag grammar:
    /// `{signature}-{uniqueID}`.
    pub fn as_tag(&self) -> String {
        format!("{}-{}", self.signature, self.unique_id)
    }
}

/// One layer in an [`crate::image::Image`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub kind: StageKind,
    /// The slice of config that produced this stage, kept for diagnostics
    /// (e.g. `DEBUG_STAGE_DEPENDENCIES` dumps); never hashed directly — only
    /// `dependency_vector` is.
    pub declaration: String,
    pub dependency_vector: DependencyVector,
    /// `None` until the signature engine has run for this image.
    pub signature: Option<Digest256>,
    /// Set once the artifact has been observed to exist in the designated
    /// store — never set speculatively.
    pub artifact: Option<StageId>,
}

impl Stage {
    pub fn new(kind: StageKind, declaration: impl Into<String>, dependency_vector: DependencyVector) -> Self {
        Self {
            kind,
            declaration: declaration.into(),
            dependency_vector,
            signature: None,
            artifact: None,
        }
    }

    pub fn is_built(&self) -> bool {
        self.artifact.is_some()
    }
}

/// A [`StageId`] plus descriptive metadata, produced by a `StagesStore`
/// lookup. Never mutated by consumers after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDescription {
    pub id: StageId,
    pub labels: std::collections::BTreeMap<String, String>,
    pub image_id: String,
    pub parent_id: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub size_bytes: u64,
}
