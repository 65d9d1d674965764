use std::collections::BTreeMap;

use kiln_hash::Digest256;
use kiln_registry::Registry;
use kiln_types::{KilnError, KilnErrorKind, Stage, StageDescription, StageId};

use crate::tag::{self, IMAGE_METADATA_BY_COMMIT_PREFIX, MANAGED_IMAGE_PREFIX};
use crate::{ClientIdRecord, DeleteStagesOptions, ImageMetadata, StagesStore};

const CONTENT_SIGNATURE_LABEL: &str = "ContentSignature";

/// Registry-backed `StagesStore`. Every record — a built stage, a
/// managed-image marker, commit metadata, a client-ID entry — is encoded as
/// a tag on a single repository, per the grammar in [`crate::tag`].
pub struct RepoStagesStore<R: Registry> {
    repo_address: String,
    registry: R,
}

impl<R: Registry> RepoStagesStore<R> {
    pub fn new(repo_address: impl Into<String>, registry: R) -> Self {
        Self { repo_address: repo_address.into(), registry }
    }

    fn reference(&self, tag: &str) -> String {
        format!("{}:{tag}", self.repo_address)
    }
}

impl<R: Registry + Send + Sync> StagesStore for RepoStagesStore<R> {
    fn get_all_stages(&self, _project: &str) -> Result<Vec<StageId>, KilnError> {
        let tags = self.registry.tags(&self.repo_address)?;
        Ok(tags
            .iter()
            .filter(|t| !t.starts_with(MANAGED_IMAGE_PREFIX) && !t.starts_with(IMAGE_METADATA_BY_COMMIT_PREFIX) && !t.starts_with(tag::CLIENT_ID_PREFIX))
            .filter_map(|t| tag::parse_stage_tag(t))
            .map(|(signature, unique_id)| StageId::new(signature, unique_id))
            .collect())
    }

    fn get_stages_by_signature(&self, project: &str, signature: Digest256) -> Result<Vec<StageId>, KilnError> {
        Ok(self.get_all_stages(project)?.into_iter().filter(|id| id.signature == signature).collect())
    }

    fn get_stage_description(&self, _project: &str, signature: Digest256, unique_id: u64) -> Result<Option<StageDescription>, KilnError> {
        let id = StageId::new(signature, unique_id);
        let reference = self.reference(&id.as_tag());
        if !self.registry.exists(&reference)? {
            return Ok(None);
        }
        let config = self.registry.get_config_file(&reference)?;
        Ok(Some(StageDescription { id, labels: config.labels, image_id: reference, parent_id: config.parent, created_at: chrono::Utc::now(), size_bytes: 0 }))
    }

    fn store_stage(&self, _project: &str, stage: &Stage) -> Result<StageId, KilnError> {
        let signature = stage.signature.ok_or_else(|| KilnError::new(KilnErrorKind::SignatureError, "cannot store a stage with no signature"))?;
        let unique_id = crate::now_millis();
        let id = StageId::new(signature, unique_id);
        let mut labels = BTreeMap::new();
        labels.insert(CONTENT_SIGNATURE_LABEL.to_string(), signature.to_string());
        self.registry.push_image(&self.reference(&id.as_tag()), &labels)?;
        Ok(id)
    }

    fn fetch_stage(&self, _project: &str, _stage_id: StageId) -> Result<(), KilnError> {
        Ok(())
    }

    fn delete_stages(&self, options: DeleteStagesOptions, _project: &str, stages: &[StageId]) -> Result<(), KilnError> {
        if options.dry_run {
            return Ok(());
        }
        for id in stages {
            self.registry.delete_image(&self.reference(&id.as_tag()))?;
        }
        Ok(())
    }

    fn put_image_commit(&self, _project: &str, image_name: &str, commit: &str, metadata: &ImageMetadata) -> Result<(), KilnError> {
        let tag = tag::image_metadata_by_commit_tag(image_name, commit);
        let mut labels = BTreeMap::new();
        labels.insert(CONTENT_SIGNATURE_LABEL.to_string(), metadata.content_signature.to_string());
        self.registry.push_image(&self.reference(&tag), &labels)
    }

    fn get_image_metadata_by_commit(&self, _project: &str, image_name: &str, commit: &str) -> Result<Option<ImageMetadata>, KilnError> {
        let tag = tag::image_metadata_by_commit_tag(image_name, commit);
        let reference = self.reference(&tag);
        if !self.registry.exists(&reference)? {
            return Ok(None);
        }
        let config = self.registry.get_config_file(&reference)?;
        match config.labels.get(CONTENT_SIGNATURE_LABEL) {
            Some(sig) => {
                let content_signature: Digest256 = sig.parse().map_err(|_| KilnError::new(KilnErrorKind::StoreUnavailable, format!("malformed content-signature label on {reference}")))?;
                Ok(Some(ImageMetadata { content_signature }))
            }
            None => Ok(None),
        }
    }

    fn rm_image_commit(&self, _project: &str, image_name: &str, commit: &str) -> Result<(), KilnError> {
        let tag = tag::image_metadata_by_commit_tag(image_name, commit);
        self.registry.delete_image(&self.reference(&tag))
    }

    fn get_image_commits(&self, _project: &str, image_name: &str) -> Result<Vec<String>, KilnError> {
        let tags = self.registry.tags(&self.repo_address)?;
        Ok(tags
            .iter()
            .filter_map(|t| tag::parse_image_metadata_by_commit_tag(t))
            .filter(|(name, _)| name == image_name)
            .map(|(_, commit)| commit)
            .collect())
    }

    fn add_managed_image(&self, _project: &str, image_name: &str) -> Result<(), KilnError> {
        let tag = tag::managed_image_tag(image_name);
        let reference = self.reference(&tag);
        if self.registry.exists(&reference)? {
            return Ok(());
        }
        self.registry.push_image(&reference, &BTreeMap::new())
    }

    fn rm_managed_image(&self, _project: &str, image_name: &str) -> Result<(), KilnError> {
        let tag = tag::managed_image_tag(image_name);
        self.registry.delete_image(&self.reference(&tag))
    }

    fn get_managed_images(&self, _project: &str) -> Result<Vec<String>, KilnError> {
        let tags = self.registry.tags(&self.repo_address)?;
        Ok(tags.iter().filter_map(|t| tag::parse_managed_image_tag(t)).collect())
    }

    fn post_client_id_record(&self, _project: &str, record: &ClientIdRecord) -> Result<(), KilnError> {
        let tag = tag::client_id_tag(&record.client_id, record.timestamp_millis);
        let reference = self.reference(&tag);
        if self.registry.exists(&reference)? {
            return Ok(());
        }
        self.registry.push_image(&reference, &BTreeMap::new())
    }

    fn get_client_id_records(&self, _project: &str) -> Result<Vec<ClientIdRecord>, KilnError> {
        let tags = self.registry.tags(&self.repo_address)?;
        Ok(tags
            .iter()
            .filter_map(|t| tag::parse_client_id_tag(t))
            .map(|(client_id, timestamp_millis)| ClientIdRecord { client_id, timestamp_millis })
            .collect())
    }
}
