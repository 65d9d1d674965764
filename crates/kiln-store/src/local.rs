use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use kiln_hash::Digest256;
use kiln_types::{KilnError, KilnErrorKind, Stage, StageDescription, StageId};
use serde::{Deserialize, Serialize};

use crate::{ClientIdRecord, DeleteStagesOptions, ImageMetadata, StagesStore};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ProjectIndex {
    stages: Vec<StageDescription>,
    managed_images: Vec<String>,
    commit_metadata: BTreeMap<String, ImageMetadata>,
    client_id_records: Vec<ClientIdRecord>,
}

fn commit_key(image_name: &str, commit: &str) -> String {
    format!("{image_name}\u{1}{commit}")
}

/// Filesystem-backed `StagesStore`. One JSON index file per project, under
/// `state_dir`, written with the write-to-tmp-then-rename idiom so a crash
/// mid-write never leaves a half-written index on disk.
pub struct LocalStagesStore {
    state_dir: PathBuf,
    lock: Mutex<()>,
}

impl LocalStagesStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self { state_dir: state_dir.into(), lock: Mutex::new(()) }
    }

    fn index_path(&self, project: &str) -> PathBuf {
        self.state_dir.join(format!("{project}.index.json"))
    }

    fn read_index(&self, project: &str) -> Result<ProjectIndex, KilnError> {
        let path = self.index_path(project);
        if !path.exists() {
            return Ok(ProjectIndex::default());
        }
        let content = std::fs::read(&path).map_err(|e| KilnError::new(KilnErrorKind::StoreUnavailable, format!("failed to read index {}: {e}", path.display())))?;
        serde_json::from_slice(&content).map_err(|e| KilnError::new(KilnErrorKind::StoreUnavailable, format!("corrupt index {}: {e}", path.display())))
    }

    fn write_index(&self, project: &str, index: &ProjectIndex) -> Result<(), KilnError> {
        std::fs::create_dir_all(&self.state_dir).map_err(|e| KilnError::new(KilnErrorKind::StoreUnavailable, format!("failed to create state dir: {e}")))?;
        let path = self.index_path(project);
        let tmp_path = path.with_extension("tmp");
        let content = serde_json::to_vec_pretty(index).map_err(|e| KilnError::new(KilnErrorKind::StoreUnavailable, format!("failed to serialize index: {e}")))?;
        std::fs::write(&tmp_path, content).map_err(|e| KilnError::new(KilnErrorKind::StoreUnavailable, format!("failed to write {}: {e}", tmp_path.display())))?;
        std::fs::rename(&tmp_path, &path).map_err(|e| KilnError::new(KilnErrorKind::StoreUnavailable, format!("failed to rename {}: {e}", tmp_path.display())))?;
        Ok(())
    }

    fn with_index<T>(&self, project: &str, f: impl FnOnce(&mut ProjectIndex) -> Result<T, KilnError>) -> Result<T, KilnError> {
        let _guard = self.lock.lock().unwrap();
        let mut index = self.read_index(project)?;
        let result = f(&mut index)?;
        self.write_index(project, &index)?;
        Ok(result)
    }

    fn stage_store_root(&self, project: &str) -> PathBuf {
        self.state_dir.join(project).join("stages")
    }

    /// Path where this store would keep a stage's bits, for implementors
    /// that need a concrete on-disk location (e.g. a `kiln-runtime` driver
    /// exporting an image tarball here).
    pub fn stage_artifact_path(&self, project: &str, stage_id: StageId) -> PathBuf {
        self.stage_store_root(project).join(stage_id.as_tag())
    }
}

impl StagesStore for LocalStagesStore {
    fn get_all_stages(&self, project: &str) -> Result<Vec<StageId>, KilnError> {
        Ok(self.read_index(project)?.stages.iter().map(|s| s.id).collect())
    }

    fn get_stages_by_signature(&self, project: &str, signature: Digest256) -> Result<Vec<StageId>, KilnError> {
        Ok(self.read_index(project)?.stages.iter().map(|s| s.id).filter(|id| id.signature == signature).collect())
    }

    fn get_stage_description(&self, project: &str, signature: Digest256, unique_id: u64) -> Result<Option<StageDescription>, KilnError> {
        Ok(self.read_index(project)?.stages.into_iter().find(|s| s.id.signature == signature && s.id.unique_id == unique_id))
    }

    fn store_stage(&self, project: &str, stage: &Stage) -> Result<StageId, KilnError> {
        let signature = stage.signature.ok_or_else(|| KilnError::new(KilnErrorKind::SignatureError, "cannot store a stage with no signature"))?;
        let unique_id = crate::now_millis();
        let id = StageId::new(signature, unique_id);
        let description = StageDescription { id, labels: BTreeMap::new(), image_id: id.as_tag(), parent_id: None, created_at: Utc::now(), size_bytes: 0 };
        self.with_index(project, |index| {
            index.stages.push(description);
            Ok(id)
        })
    }

    fn fetch_stage(&self, _project: &str, _stage_id: StageId) -> Result<(), KilnError> {
        Ok(())
    }

    fn delete_stages(&self, options: DeleteStagesOptions, project: &str, stages: &[StageId]) -> Result<(), KilnError> {
        if options.dry_run {
            return Ok(());
        }
        self.with_index(project, |index| {
            index.stages.retain(|s| !stages.contains(&s.id));
            Ok(())
        })
    }

    fn put_image_commit(&self, project: &str, image_name: &str, commit: &str, metadata: &ImageMetadata) -> Result<(), KilnError> {
        self.with_index(project, |index| {
            index.commit_metadata.insert(commit_key(image_name, commit), metadata.clone());
            Ok(())
        })
    }

    fn get_image_metadata_by_commit(&self, project: &str, image_name: &str, commit: &str) -> Result<Option<ImageMetadata>, KilnError> {
        Ok(self.read_index(project)?.commit_metadata.get(&commit_key(image_name, commit)).cloned())
    }

    fn rm_image_commit(&self, project: &str, image_name: &str, commit: &str) -> Result<(), KilnError> {
        self.with_index(project, |index| {
            index.commit_metadata.remove(&commit_key(image_name, commit));
            Ok(())
        })
    }

    fn get_image_commits(&self, project: &str, image_name: &str) -> Result<Vec<String>, KilnError> {
        let prefix = format!("{image_name}\u{1}");
        Ok(self.read_index(project)?.commit_metadata.keys().filter_map(|k| k.strip_prefix(&prefix)).map(String::from).collect())
    }

    fn add_managed_image(&self, project: &str, image_name: &str) -> Result<(), KilnError> {
        self.with_index(project, |index| {
            if !index.managed_images.iter().any(|n| n == image_name) {
                index.managed_images.push(image_name.to_string());
            }
            Ok(())
        })
    }

    fn rm_managed_image(&self, project: &str, image_name: &str) -> Result<(), KilnError> {
        self.with_index(project, |index| {
            index.managed_images.retain(|n| n != image_name);
            Ok(())
        })
    }

    fn get_managed_images(&self, project: &str) -> Result<Vec<String>, KilnError> {
        Ok(self.read_index(project)?.managed_images)
    }

    fn post_client_id_record(&self, project: &str, record: &ClientIdRecord) -> Result<(), KilnError> {
        self.with_index(project, |index| {
            index.client_id_records.push(record.clone());
            Ok(())
        })
    }

    fn get_client_id_records(&self, project: &str) -> Result<Vec<ClientIdRecord>, KilnError> {
        Ok(self.read_index(project)?.client_id_records)
    }
}
