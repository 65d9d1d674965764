use std::collections::HashSet;

use chrono::Utc;
use kiln_hash::Digest256;
use kiln_store::{DeleteStagesOptions, StagesStore};
use kiln_types::KilnError;

use crate::{ConveyorContext, Phase};

/// Retention sweep: orthogonal to Build, runs once per invocation rather
/// than per image/stage, so the work happens in `before_images` and the
/// per-stage hooks are no-ops.
///
/// A stage survives if either rule keeps it:
/// - it's in the reachable set (content signature recorded against some
///   commit of a managed image), or
/// - it was built within the retention window.
///
/// `KEEP_STAGES_BUILT_WITHIN_LAST_N_HOURS` unset falls back to
/// `default_keep_hours`; `0` disables the age rule outright, same as
/// `DISABLE_SYNC_LOCAL_STAGES_DATE_PERIOD_POLICY` being set.
pub struct CleanupPhase<S> {
    store: S,
    default_keep_hours: u64,
}

impl<S: StagesStore> CleanupPhase<S> {
    pub fn new(store: S) -> Self {
        Self::with_default_keep_hours(store, 24)
    }

    pub fn with_default_keep_hours(store: S, default_keep_hours: u64) -> Self {
        Self { store, default_keep_hours }
    }

    fn reachable_signatures(&self, project: &str, managed_images: &[String]) -> Result<HashSet<Digest256>, KilnError> {
        let mut reachable = HashSet::new();
        for image_name in managed_images {
            for commit in self.store.get_image_commits(project, image_name)? {
                if let Some(metadata) = self.store.get_image_metadata_by_commit(project, image_name, &commit)? {
                    reachable.insert(metadata.content_signature);
                }
            }
        }
        Ok(reachable)
    }

    fn keep_within_hours(&self, ctx: &ConveyorContext) -> Option<u64> {
        if ctx.environment.disable_sync_local_stages_date_period_policy {
            return None;
        }
        match ctx.environment.keep_stages_built_within_last_n_hours {
            Some(0) => None,
            Some(hours) => Some(hours),
            None => Some(self.default_keep_hours),
        }
    }
}

impl<S: StagesStore + Send + Sync> Phase for CleanupPhase<S> {
    fn name(&self) -> &str {
        "cleanup"
    }

    fn before_images(&self, ctx: &ConveyorContext) -> Result<(), KilnError> {
        let managed_images = self.store.get_managed_images(&ctx.project)?;
        let reachable = self.reachable_signatures(&ctx.project, &managed_images)?;
        let keep_within_hours = self.keep_within_hours(ctx);

        let mut to_delete = Vec::new();
        for id in self.store.get_all_stages(&ctx.project)? {
            if reachable.contains(&id.signature) {
                continue;
            }
            if let Some(hours) = keep_within_hours {
                let description = self.store.get_stage_description(&ctx.project, id.signature, id.unique_id)?;
                let recent = description.is_some_and(|d| Utc::now() - d.created_at < chrono::Duration::hours(hours as i64));
                if recent {
                    continue;
                }
            }
            to_delete.push(id);
        }

        if to_delete.is_empty() {
            return Ok(());
        }
        tracing::info!(count = to_delete.len(), project = %ctx.project, "deleting unreferenced stages");
        self.store.delete_stages(DeleteStagesOptions::default(), &ctx.project, &to_delete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_store::{ClientIdRecord, ImageMetadata};
    use kiln_types::{Environment, Stage, StageDescription, StageId};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeStore {
        stages: Mutex<Vec<StageId>>,
        descriptions: Mutex<BTreeMap<StageId, StageDescription>>,
        managed_images: Mutex<Vec<String>>,
        commit_metadata: Mutex<BTreeMap<(String, String), ImageMetadata>>,
        deleted: Mutex<Vec<StageId>>,
    }

    impl StagesStore for FakeStore {
        fn get_all_stages(&self, _project: &str) -> Result<Vec<StageId>, KilnError> {
            Ok(self.stages.lock().unwrap().clone())
        }
        fn get_stages_by_signature(&self, _project: &str, signature: Digest256) -> Result<Vec<StageId>, KilnError> {
            Ok(self.stages.lock().unwrap().iter().filter(|id| id.signature == signature).copied().collect())
        }
        fn get_stage_description(&self, _project: &str, signature: Digest256, unique_id: u64) -> Result<Option<StageDescription>, KilnError> {
            Ok(self.descriptions.lock().unwrap().get(&StageId::new(signature, unique_id)).cloned())
        }
        fn store_stage(&self, _project: &str, _stage: &Stage) -> Result<StageId, KilnError> {
            unreachable!()
        }
        fn fetch_stage(&self, _project: &str, _stage_id: StageId) -> Result<(), KilnError> {
            Ok(())
        }
        fn delete_stages(&self, _options: kiln_store::DeleteStagesOptions, _project: &str, stages: &[StageId]) -> Result<(), KilnError> {
            self.deleted.lock().unwrap().extend_from_slice(stages);
            self.stages.lock().unwrap().retain(|id| !stages.contains(id));
            Ok(())
        }
        fn put_image_commit(&self, _project: &str, _image_name: &str, _commit: &str, _metadata: &ImageMetadata) -> Result<(), KilnError> {
            Ok(())
        }
        fn get_image_metadata_by_commit(&self, _project: &str, image_name: &str, commit: &str) -> Result<Option<ImageMetadata>, KilnError> {
            Ok(self.commit_metadata.lock().unwrap().get(&(image_name.to_string(), commit.to_string())).cloned())
        }
        fn rm_image_commit(&self, _project: &str, _image_name: &str, _commit: &str) -> Result<(), KilnError> {
            Ok(())
        }
        fn get_image_commits(&self, _project: &str, image_name: &str) -> Result<Vec<String>, KilnError> {
            Ok(self.commit_metadata.lock().unwrap().keys().filter(|(name, _)| name == image_name).map(|(_, commit)| commit.clone()).collect())
        }
        fn add_managed_image(&self, _project: &str, _image_name: &str) -> Result<(), KilnError> {
            Ok(())
        }
        fn rm_managed_image(&self, _project: &str, _image_name: &str) -> Result<(), KilnError> {
            Ok(())
        }
        fn get_managed_images(&self, _project: &str) -> Result<Vec<String>, KilnError> {
            Ok(self.managed_images.lock().unwrap().clone())
        }
        fn post_client_id_record(&self, _project: &str, _record: &ClientIdRecord) -> Result<(), KilnError> {
            Ok(())
        }
        fn get_client_id_records(&self, _project: &str) -> Result<Vec<ClientIdRecord>, KilnError> {
            Ok(vec![])
        }
    }

    fn ctx(environment: Environment) -> ConveyorContext {
        ConveyorContext { project: "proj".into(), cancellation: crate::CancellationToken::new(), environment }
    }

    #[test]
    fn unreferenced_old_stage_is_deleted_when_policy_disabled() {
        let store = FakeStore::default();
        let sig = kiln_hash::hash(["a"]);
        let id = StageId::new(sig, 1);
        store.stages.lock().unwrap().push(id);

        let phase = CleanupPhase::new(store);
        let env = Environment { keep_stages_built_within_last_n_hours: Some(0), ..Default::default() };
        phase.before_images(&ctx(env)).unwrap();
        assert_eq!(phase.store.deleted.lock().unwrap().as_slice(), &[id]);
    }

    #[test]
    fn reachable_stage_is_never_deleted() {
        let store = FakeStore::default();
        let sig = kiln_hash::hash(["a"]);
        let id = StageId::new(sig, 1);
        store.stages.lock().unwrap().push(id);
        store.managed_images.lock().unwrap().push("web".to_string());
        store.commit_metadata.lock().unwrap().insert(("web".to_string(), "deadbeef".to_string()), ImageMetadata { content_signature: sig });

        let phase = CleanupPhase::new(store);
        let env = Environment { keep_stages_built_within_last_n_hours: Some(0), ..Default::default() };
        phase.before_images(&ctx(env)).unwrap();
        assert!(phase.store.deleted.lock().unwrap().is_empty());
    }

    #[test]
    fn recently_built_unreferenced_stage_is_kept() {
        let store = FakeStore::default();
        let sig = kiln_hash::hash(["a"]);
        let id = StageId::new(sig, 1);
        store.stages.lock().unwrap().push(id);
        store.descriptions.lock().unwrap().insert(
            id,
            StageDescription { id, labels: BTreeMap::new(), image_id: "img".into(), parent_id: None, created_at: Utc::now(), size_bytes: 0 },
        );

        let phase = CleanupPhase::new(store);
        let env = Environment { keep_stages_built_within_last_n_hours: Some(48), ..Default::default() };
        phase.before_images(&ctx(env)).unwrap();
        assert!(phase.store.deleted.lock().unwrap().is_empty());
    }

    #[test]
    fn unset_env_var_falls_back_to_default_keep_hours() {
        let store = FakeStore::default();
        let sig = kiln_hash::hash(["a"]);
        let id = StageId::new(sig, 1);
        store.stages.lock().unwrap().push(id);
        store.descriptions.lock().unwrap().insert(
            id,
            StageDescription { id, labels: BTreeMap::new(), image_id: "img".into(), parent_id: None, created_at: Utc::now(), size_bytes: 0 },
        );

        let phase = CleanupPhase::new(store);
        phase.before_images(&ctx(Environment::default())).unwrap();
        assert!(phase.store.deleted.lock().unwrap().is_empty());
    }

    #[test]
    fn disable_sync_flag_deletes_even_recently_built_stages() {
        let store = FakeStore::default();
        let sig = kiln_hash::hash(["a"]);
        let id = StageId::new(sig, 1);
        store.stages.lock().unwrap().push(id);
        store.descriptions.lock().unwrap().insert(
            id,
            StageDescription { id, labels: BTreeMap::new(), image_id: "img".into(), parent_id: None, created_at: Utc::now(), size_bytes: 0 },
        );

        let phase = CleanupPhase::new(store);
        let env = Environment { disable_sync_local_stages_date_period_policy: true, ..Default::default() };
        phase.before_images(&ctx(env)).unwrap();
        assert_eq!(phase.store.deleted.lock().unwrap().len(), 1);
    }
}
