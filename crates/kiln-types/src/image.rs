use serde::{Deserialize, Serialize};

use crate::stage::Stage;

/// How an image's stages are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageKind {
    /// Built stage-by-stage from a `kiln`-native layered declaration.
    Layered,
    /// Built by handing an entire Dockerfile stage to the runtime driver.
    Dockerfile,
}

/// A named build target: an ordered list of [`Stage`]s plus whether the
/// result is ever published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub name: String,
    pub kind: ImageKind,
    /// Artifact images are built so later stages/images can pull files from
    /// them but are never pushed by the publish phase.
    pub artifact: bool,
    pub stages: Vec<Stage>,
}

impl Image {
    pub fn new(name: impl Into<String>, kind: ImageKind, artifact: bool, stages: Vec<Stage>) -> Self {
        Self { name: name.into(), kind, artifact, stages }
    }

    /// The last stage, whose content signature becomes the image's publish
    /// identity. `None` before the signature engine runs or if the stage
    /// list is empty, which is itself an invariant violation the caller
    /// should have already rejected at construction time.
    pub fn content_signature(&self) -> Option<kiln_hash::Digest256> {
        self.stages
            .iter()
            .rev()
            .find_map(|stage| stage.signature)
    }

    pub fn log_name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{DependencyVector, StageKind};

    fn stage_with_sig(sig: Option<kiln_hash::Digest256>) -> Stage {
        let mut stage = Stage::new(StageKind::From, "decl", DependencyVector::new());
        stage.signature = sig;
        stage
    }

    #[test]
    fn content_signature_is_last_non_empty_stage() {
        let a = kiln_hash::hash(["a"]);
        let image = Image::new(
            "web",
            ImageKind::Layered,
            false,
            vec![stage_with_sig(Some(a)), stage_with_sig(None)],
        );
        assert_eq!(image.content_signature(), Some(a));
    }

    #[test]
    fn content_signature_none_before_signatures_computed() {
        let image = Image::new("web", ImageKind::Layered, false, vec![stage_with_sig(None)]);
        assert_eq!(image.content_signature(), None);
    }
}
