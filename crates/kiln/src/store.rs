//! Shares one [`StagesStore`] across every phase in a run.
//!
//! `BuildPhase`/`ShouldBeBuiltPhase`/`CleanupPhase`/`PublishPhase` each take
//! their store by value, so one instance can only back one phase unless
//! something in between hands out shared access. `Arc<S>` can't implement
//! the foreign `StagesStore` trait here (both are foreign to this crate),
//! so `SharedStore` is a local newtype that delegates every method to the
//! `Arc` it wraps — plain forwarding, the same shape as other thin
//! trait-object wrappers around pluggable storage backends.

use std::sync::Arc;

use kiln_hash::Digest256;
use kiln_store::{ClientIdRecord, DeleteStagesOptions, ImageMetadata, StagesStore};
use kiln_types::{KilnError, Stage, StageDescription, StageId};

pub struct SharedStore<S>(Arc<S>);

impl<S> SharedStore<S> {
    pub fn new(store: S) -> Self {
        Self(Arc::new(store))
    }
}

impl<S> Clone for SharedStore<S> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<S: StagesStore> StagesStore for SharedStore<S> {
    fn get_all_stages(&self, project: &str) -> Result<Vec<StageId>, KilnError> {
        self.0.get_all_stages(project)
    }

    fn get_stages_by_signature(&self, project: &str, signature: Digest256) -> Result<Vec<StageId>, KilnError> {
        self.0.get_stages_by_signature(project, signature)
    }

    fn get_stage_description(&self, project: &str, signature: Digest256, unique_id: u64) -> Result<Option<StageDescription>, KilnError> {
        self.0.get_stage_description(project, signature, unique_id)
    }

    fn store_stage(&self, project: &str, stage: &Stage) -> Result<StageId, KilnError> {
        self.0.store_stage(project, stage)
    }

    fn fetch_stage(&self, project: &str, stage_id: StageId) -> Result<(), KilnError> {
        self.0.fetch_stage(project, stage_id)
    }

    fn delete_stages(&self, options: DeleteStagesOptions, project: &str, stages: &[StageId]) -> Result<(), KilnError> {
        self.0.delete_stages(options, project, stages)
    }

    fn put_image_commit(&self, project: &str, image_name: &str, commit: &str, metadata: &ImageMetadata) -> Result<(), KilnError> {
        self.0.put_image_commit(project, image_name, commit, metadata)
    }

    fn get_image_metadata_by_commit(&self, project: &str, image_name: &str, commit: &str) -> Result<Option<ImageMetadata>, KilnError> {
        self.0.get_image_metadata_by_commit(project, image_name, commit)
    }

    fn rm_image_commit(&self, project: &str, image_name: &str, commit: &str) -> Result<(), KilnError> {
        self.0.rm_image_commit(project, image_name, commit)
    }

    fn get_image_commits(&self, project: &str, image_name: &str) -> Result<Vec<String>, KilnError> {
        self.0.get_image_commits(project, image_name)
    }

    fn add_managed_image(&self, project: &str, image_name: &str) -> Result<(), KilnError> {
        self.0.add_managed_image(project, image_name)
    }

    fn rm_managed_image(&self, project: &str, image_name: &str) -> Result<(), KilnError> {
        self.0.rm_managed_image(project, image_name)
    }

    fn get_managed_images(&self, project: &str) -> Result<Vec<String>, KilnError> {
        self.0.get_managed_images(project)
    }

    fn post_client_id_record(&self, project: &str, record: &ClientIdRecord) -> Result<(), KilnError> {
        self.0.post_client_id_record(project, record)
    }

    fn get_client_id_records(&self, project: &str) -> Result<Vec<ClientIdRecord>, KilnError> {
        self.0.get_client_id_records(project)
    }
}
