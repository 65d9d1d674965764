//! Core data model shared across kiln's build, cache, and publish crates:
//! [`Image`]/[`Stage`] graph types, the closed [`KilnError`] kind set, the
//! publish report, tagging strategies, and the process environment knobs
//! the core reads directly.

mod environment;
mod error;
mod image;
mod report;
mod stage;
mod tag;

pub use environment::Environment;
pub use error::{KilnError, KilnErrorKind};
pub use image::{Image, ImageKind};
pub use report::{PublishEntry, PublishReport};
pub use stage::{DependencyVector, Stage, StageDescription, StageId, StageKind};
pub use tag::{MetaTag, TaggingStrategy};

/// Re-exported so downstream crates can name a signature without depending
/// on `kiln-hash` directly.
pub use kiln_hash::Digest256;
