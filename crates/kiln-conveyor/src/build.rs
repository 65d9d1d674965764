use std::sync::Arc;

use kiln_lock::{LockManager, LockOptions};
use kiln_store::StagesStore;
use kiln_types::{Image, KilnError, KilnErrorKind, StageId};

use crate::{ConveyorContext, Phase};

/// Produces the runtime bits for one stage that the store has confirmed is
/// missing. Implementations own the split between layered stages (via
/// `kiln-runtime`'s `commit`) and Dockerfile stages (via `build`) — the
/// Conveyor has no opinion on which driver a given stage needs. On success
/// the stage's content must already be reachable under the store's
/// expected naming convention so a later `fetchStage`/pull can find it.
pub trait StageBuilder: Send + Sync {
    fn build(&self, image: &Image, stage_index: usize) -> Result<(), KilnError>;
}

/// Build phase: for each stage, adopt it from the store if already
/// present; otherwise acquire `stage:{signature}` exclusively, re-check
/// the store inside the critical section (double-checked locking), and
/// only then invoke the [`StageBuilder`].
pub struct BuildPhase<S> {
    store: S,
    locks: Arc<LockManager>,
    builder: Box<dyn StageBuilder>,
}

impl<S: StagesStore> BuildPhase<S> {
    pub fn new(store: S, locks: Arc<LockManager>, builder: Box<dyn StageBuilder>) -> Self {
        Self { store, locks, builder }
    }

    fn adopt_if_present(&self, ctx: &ConveyorContext, signature: kiln_hash::Digest256) -> Result<Option<StageId>, KilnError> {
        Ok(self.store.get_stages_by_signature(&ctx.project, signature)?.into_iter().next())
    }
}

impl<S: StagesStore + Send + Sync> Phase for BuildPhase<S> {
    fn name(&self) -> &str {
        "build"
    }

    fn on_image_stage(&self, ctx: &ConveyorContext, image: &mut Image, stage_index: usize) -> Result<(), KilnError> {
        let stage_kind = image.stages[stage_index].kind;
        let image_name = image.log_name().to_string();
        let signature = image.stages[stage_index]
            .signature
            .ok_or_else(|| KilnError::new(KilnErrorKind::SignatureError, "build phase ran before the Signatures phase").with_image(&image_name).with_stage(stage_kind))?;

        if let Some(id) = self.adopt_if_present(ctx, signature)? {
            image.stages[stage_index].artifact = Some(id);
            return Ok(());
        }

        let lock_name = format!("stage:{signature}");
        let handle = self.locks.lock(&lock_name, LockOptions::exclusive()).map_err(|e| e.with_image(&image_name).with_stage(stage_kind))?;

        let outcome = (|| -> Result<StageId, KilnError> {
            if let Some(id) = self.adopt_if_present(ctx, signature)? {
                return Ok(id);
            }
            ctx.cancellation.check()?;
            self.builder.build(image, stage_index)?;
            self.store.store_stage(&ctx.project, &image.stages[stage_index])
        })();

        self.locks.unlock(handle).map_err(|e| e.with_image(&image_name).with_stage(stage_kind))?;

        let id = outcome.map_err(|e| e.with_image(&image_name).with_stage(stage_kind))?;
        image.stages[stage_index].artifact = Some(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_store::{ClientIdRecord, DeleteStagesOptions, ImageMetadata};
    use kiln_types::{DependencyVector, ImageKind, Stage, StageDescription, StageKind};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeStore {
        present: Mutex<HashMap<kiln_hash::Digest256, StageId>>,
    }

    impl StagesStore for FakeStore {
        fn get_all_stages(&self, _project: &str) -> Result<Vec<StageId>, KilnError> {
            Ok(self.present.lock().unwrap().values().copied().collect())
        }
        fn get_stages_by_signature(&self, _project: &str, signature: kiln_hash::Digest256) -> Result<Vec<StageId>, KilnError> {
            Ok(self.present.lock().unwrap().get(&signature).copied().into_iter().collect())
        }
        fn get_stage_description(&self, _project: &str, _signature: kiln_hash::Digest256, _unique_id: u64) -> Result<Option<StageDescription>, KilnError> {
            Ok(None)
        }
        fn store_stage(&self, _project: &str, stage: &Stage) -> Result<StageId, KilnError> {
            let signature = stage.signature.unwrap();
            let id = StageId::new(signature, 1);
            self.present.lock().unwrap().insert(signature, id);
            Ok(id)
        }
        fn fetch_stage(&self, _project: &str, _stage_id: StageId) -> Result<(), KilnError> {
            Ok(())
        }
        fn delete_stages(&self, _options: DeleteStagesOptions, _project: &str, _stages: &[StageId]) -> Result<(), KilnError> {
            Ok(())
        }
        fn put_image_commit(&self, _project: &str, _image_name: &str, _commit: &str, _metadata: &ImageMetadata) -> Result<(), KilnError> {
            Ok(())
        }
        fn get_image_metadata_by_commit(&self, _project: &str, _image_name: &str, _commit: &str) -> Result<Option<ImageMetadata>, KilnError> {
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
        fn post_client_id_record(&self, _project: &str, _record: &ClientIdRecord) -> Result<(), KilnError> {
            Ok(())
        }
        fn get_client_id_records(&self, _project: &str) -> Result<Vec<ClientIdRecord>, KilnError> {
            Ok(vec![])
        }
    }

    struct CountingBuilder {
        calls: AtomicUsize,
    }

    impl StageBuilder for CountingBuilder {
        fn build(&self, _image: &Image, _stage_index: usize) -> Result<(), KilnError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
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
    fn missing_stage_invokes_builder_and_stores_artifact() {
        let sig = kiln_hash::hash(["a"]);
        let builder = CountingBuilder { calls: AtomicUsize::new(0) };
        let phase = BuildPhase::new(FakeStore::default(), Arc::new(LockManager::new(None)), Box::new(builder));
        let mut image = signed_image(sig);
        phase.on_image_stage(&ctx(), &mut image, 0).unwrap();
        assert!(image.stages[0].artifact.is_some());
    }

    #[test]
    fn present_stage_is_adopted_without_calling_builder() {
        let sig = kiln_hash::hash(["a"]);
        let store = FakeStore::default();
        store.present.lock().unwrap().insert(sig, StageId::new(sig, 7));
        let builder_calls = Arc::new(AtomicUsize::new(0));
        struct Refusing(Arc<AtomicUsize>);
        impl StageBuilder for Refusing {
            fn build(&self, _image: &Image, _stage_index: usize) -> Result<(), KilnError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Err(KilnError::new(KilnErrorKind::RuntimeError, "should never be called"))
            }
        }
        let phase = BuildPhase::new(store, Arc::new(LockManager::new(None)), Box::new(Refusing(builder_calls.clone())));
        let mut image = signed_image(sig);
        phase.on_image_stage(&ctx(), &mut image, 0).unwrap();
        assert_eq!(image.stages[0].artifact, Some(StageId::new(sig, 7)));
        assert_eq!(builder_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unsigned_stage_is_signature_error() {
        let phase = BuildPhase::new(FakeStore::default(), Arc::new(LockManager::new(None)), Box::new(CountingBuilder { calls: AtomicUsize::new(0) }));
        let mut image = Image::new("web", ImageKind::Layered, false, vec![Stage::new(StageKind::From, "from", DependencyVector::new())]);
        let err = phase.on_image_stage(&ctx(), &mut image, 0).unwrap_err();
        assert_eq!(err.kind, KilnErrorKind::SignatureError);
    }

    #[test]
    fn builder_failure_still_releases_the_lock() {
        struct Failing;
        impl StageBuilder for Failing {
            fn build(&self, _image: &Image, _stage_index: usize) -> Result<(), KilnError> {
                Err(KilnError::new(KilnErrorKind::RuntimeError, "boom"))
            }
        }
        let locks = Arc::new(LockManager::new(None));
        let sig = kiln_hash::hash(["a"]);
        let phase = BuildPhase::new(FakeStore::default(), locks.clone(), Box::new(Failing));
        let mut image = signed_image(sig);
        let err = phase.on_image_stage(&ctx(), &mut image, 0).unwrap_err();
        assert_eq!(err.kind, KilnErrorKind::RuntimeError);
        // lock must have been released: a second acquire succeeds immediately
        let handle = locks.lock(&format!("stage:{sig}"), LockOptions::exclusive().non_blocking()).unwrap();
        locks.unlock(handle).unwrap();
    }
}
