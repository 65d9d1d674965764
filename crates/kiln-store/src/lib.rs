//! Two `StagesStore` implementations behind one trait:
//! [`LocalStagesStore`] (filesystem-backed index) and [`RepoStagesStore`]
//! (a container registry, using the tag grammar in [`tag`]).

mod local;
mod repo;
pub mod tag;

pub use local::LocalStagesStore;
pub use repo::RepoStagesStore;

use kiln_hash::Digest256;
use kiln_types::{KilnError, Stage, StageDescription, StageId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteStagesOptions {
    pub dry_run: bool,
    pub force_detach_children: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub content_signature: Digest256,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientIdRecord {
    pub client_id: String,
    pub timestamp_millis: i64,
}

/// Every operation is atomic and idempotent: callers may retry freely on
/// transient failure without double-effect risk.
pub trait StagesStore: Send + Sync {
    fn get_all_stages(&self, project: &str) -> Result<Vec<StageId>, KilnError>;
    fn get_stages_by_signature(&self, project: &str, signature: Digest256) -> Result<Vec<StageId>, KilnError>;
    fn get_stage_description(&self, project: &str, signature: Digest256, unique_id: u64) -> Result<Option<StageDescription>, KilnError>;
    /// Assigns a new `uniqueID` equal to the current timestamp in
    /// milliseconds.
    fn store_stage(&self, project: &str, stage: &Stage) -> Result<StageId, KilnError>;
    fn fetch_stage(&self, project: &str, stage_id: StageId) -> Result<(), KilnError>;
    fn delete_stages(&self, options: DeleteStagesOptions, project: &str, stages: &[StageId]) -> Result<(), KilnError>;

    fn put_image_commit(&self, project: &str, image_name: &str, commit: &str, metadata: &ImageMetadata) -> Result<(), KilnError>;
    fn get_image_metadata_by_commit(&self, project: &str, image_name: &str, commit: &str) -> Result<Option<ImageMetadata>, KilnError>;
    fn rm_image_commit(&self, project: &str, image_name: &str, commit: &str) -> Result<(), KilnError>;
    fn get_image_commits(&self, project: &str, image_name: &str) -> Result<Vec<String>, KilnError>;

    fn add_managed_image(&self, project: &str, image_name: &str) -> Result<(), KilnError>;
    fn rm_managed_image(&self, project: &str, image_name: &str) -> Result<(), KilnError>;
    fn get_managed_images(&self, project: &str) -> Result<Vec<String>, KilnError>;

    fn post_client_id_record(&self, project: &str, record: &ClientIdRecord) -> Result<(), KilnError>;
    fn get_client_id_records(&self, project: &str) -> Result<Vec<ClientIdRecord>, KilnError>;
}

/// A timestamp in milliseconds since the epoch, used as the `uniqueID` a
/// store assigns at `store_stage` time. Not wall-clock-sensitive for
/// signature purposes — only for ordering historical builds that share one.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
