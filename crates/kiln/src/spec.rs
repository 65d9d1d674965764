//! Declared image inputs to one invocation: the facade's own view of what
//! a config loader would have produced, kept deliberately thin per the
//! crate's non-goal of owning a YAML/recipe schema.

use std::collections::BTreeMap;
use std::path::PathBuf;

use kiln_stapel::StapelImageDecl;

/// How one declared image is built.
#[derive(Debug, Clone)]
pub enum ImageDecl {
    /// A single Dockerfile stage, handed whole to the runtime driver.
    Dockerfile { content: String, context_dir: PathBuf, build_args: BTreeMap<String, String>, target: Option<String> },
    /// A `kiln`-native layered recipe.
    Stapel(StapelImageDecl),
}

/// One image an invocation builds (and, unless `artifact`, may publish).
#[derive(Debug, Clone)]
pub struct ImageSpec {
    pub name: String,
    pub artifact: bool,
    pub decl: ImageDecl,
}

impl ImageSpec {
    pub fn dockerfile(name: impl Into<String>, artifact: bool, content: impl Into<String>, context_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            artifact,
            decl: ImageDecl::Dockerfile { content: content.into(), context_dir: context_dir.into(), build_args: BTreeMap::new(), target: None },
        }
    }

    pub fn stapel(name: impl Into<String>, artifact: bool, decl: StapelImageDecl) -> Self {
        Self { name: name.into(), artifact, decl: ImageDecl::Stapel(decl) }
    }
}
