use std::sync::Mutex;

use kiln_store::StagesStore;
use kiln_types::{Image, KilnError, KilnErrorKind};

use crate::{ConveyorContext, Phase};

/// Verifies that every stage's signature is already present in the store,
/// failing with the full list of what's missing rather than the first
/// miss. Used by read-only commands that must not trigger a build.
pub struct ShouldBeBuiltPhase<S> {
    store: S,
    missing: Mutex<Vec<String>>,
}

impl<S: StagesStore> ShouldBeBuiltPhase<S> {
    pub fn new(store: S) -> Self {
        Self { store, missing: Mutex::new(Vec::new()) }
    }
}

impl<S: StagesStore + Send + Sync> Phase for ShouldBeBuiltPhase<S> {
    fn name(&self) -> &str {
        "should-be-built"
    }

    fn on_image_stage(&self, ctx: &ConveyorContext, image: &mut Image, stage_index: usize) -> Result<(), KilnError> {
        let stage = &image.stages[stage_index];
        let signature = stage
            .signature
            .ok_or_else(|| KilnError::new(KilnErrorKind::SignatureError, "should-be-built check ran before the Signatures phase").with_image(image.log_name()).with_stage(stage.kind))?;
        let present = !self.store.get_stages_by_signature(&ctx.project, signature)?.is_empty();
        if !present {
            self.missing.lock().expect("should-be-built missing-list mutex poisoned").push(format!("{}/{:?}", image.log_name(), stage.kind));
        }
        Ok(())
    }

    fn after_images(&self, _ctx: &ConveyorContext) -> Result<(), KilnError> {
        let missing = self.missing.lock().expect("should-be-built missing-list mutex poisoned");
        if missing.is_empty() {
            return Ok(());
        }
        Err(KilnError::new(KilnErrorKind::StoreUnavailable, format!("stages not yet built: {}", missing.join(", "))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_types::{DependencyVector, ImageKind, Stage, StageDescription, StageId, StageKind};
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeStore {
        present: HashMap<kiln_hash::Digest256, Vec<StageId>>,
    }

    impl StagesStore for FakeStore {
        fn get_all_stages(&self, _project: &str) -> Result<Vec<StageId>, KilnError> {
            Ok(self.present.values().flatten().copied().collect())
        }
        fn get_stages_by_signature(&self, _project: &str, signature: kiln_hash::Digest256) -> Result<Vec<StageId>, KilnError> {
            Ok(self.present.get(&signature).cloned().unwrap_or_default())
        }
        fn get_stage_description(&self, _project: &str, _signature: kiln_hash::Digest256, _unique_id: u64) -> Result<Option<StageDescription>, KilnError> {
            Ok(None)
        }
        fn store_stage(&self, _project: &str, _stage: &Stage) -> Result<StageId, KilnError> {
            unreachable!()
        }
        fn fetch_stage(&self, _project: &str, _stage_id: StageId) -> Result<(), KilnError> {
            Ok(())
        }
        fn delete_stages(&self, _options: kiln_store::DeleteStagesOptions, _project: &str, _stages: &[StageId]) -> Result<(), KilnError> {
            Ok(())
        }
        fn put_image_commit(&self, _project: &str, _image_name: &str, _commit: &str, _metadata: &kiln_store::ImageMetadata) -> Result<(), KilnError> {
            Ok(())
        }
        fn get_image_metadata_by_commit(&self, _project: &str, _image_name: &str, _commit: &str) -> Result<Option<kiln_store::ImageMetadata>, KilnError> {
            Ok(None)
        }
        fn rm_image_commit(&self, _project: &str, _image_name: &str, _commit: &str) -> Result<(), KilnError> {
            Ok(())
        }
        fn get_image_commits(&self, _project: &str, _image_name: &str) -> Result<Vec<String>, KilnError> {
            Ok(vec![])
        }
        fn add_managed_image(&self, _project: &str, _image_name: &str) -> Result<(), KilnError> {
            Ok(())
        }
        fn rm_managed_image(&self, _project: &str, _image_name: &str) -> Result<(), KilnError> {
            Ok(())
        }
        fn get_managed_images(&self, _project: &str) -> Result<Vec<String>, KilnError> {
            Ok(vec![])
        }
        fn post_client_id_record(&self, _project: &str, _record: &kiln_store::ClientIdRecord) -> Result<(), KilnError> {
            Ok(())
        }
        fn get_client_id_records(&self, _project: &str) -> Result<Vec<kiln_store::ClientIdRecord>, KilnError> {
            Ok(vec![])
        }
    }

    fn signed_image(sig: kiln_hash::Digest256) -> Image {
        let mut stage = Stage::new(StageKind::From, "from", DependencyVector::new());
        stage.signature = Some(sig);
        Image::new("web", ImageKind::Layered, false, vec![stage])
    }

    fn ctx() -> ConveyorContext {
        ConveyorContext { project: "proj".into(), cancellation: crate::CancellationToken::new(), environment: kiln_types::Environment::default() }
    }

    #[test]
    fn passes_when_stage_present_in_store() {
        let sig = kiln_hash::hash(["a"]);
        let mut store = FakeStore::default();
        store.present.insert(sig, vec![StageId::new(sig, 1)]);
        let phase = ShouldBeBuiltPhase::new(store);
        let mut image = signed_image(sig);
        let ctx = ctx();
        phase.on_image_stage(&ctx, &mut image, 0).unwrap();
        phase.after_images(&ctx).unwrap();
    }

    #[test]
    fn fails_with_missing_list_when_stage_absent() {
        let sig = kiln_hash::hash(["a"]);
        let phase = ShouldBeBuiltPhase::new(FakeStore::default());
        let mut image = signed_image(sig);
        let ctx = ctx();
        phase.on_image_stage(&ctx, &mut image, 0).unwrap();
        let err = phase.after_images(&ctx).unwrap_err();
        assert_eq!(err.kind, KilnErrorKind::StoreUnavailable);
        assert!(err.detail.contains("web"));
    }

    #[test]
    fn unsigned_stage_is_signature_error() {
        let phase = ShouldBeBuiltPhase::new(FakeStore::default());
        let mut image = Image::new("web", ImageKind::Layered, false, vec![Stage::new(StageKind::From, "from", DependencyVector::new())]);
        let ctx = ctx();
        let err = phase.on_image_stage(&ctx, &mut image, 0).unwrap_err();
        assert_eq!(err.kind, KilnErrorKind::SignatureError);
    }
}
