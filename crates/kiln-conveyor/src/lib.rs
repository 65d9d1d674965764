//! Phase orchestration for one kiln invocation.
//!
//! The [`Conveyor`] owns the transient image graph for an invocation and
//! drives [`Phase`] objects over it: `beforeImages` once, then per image
//! `beforeImageStages` / `onImageStage`×N / `afterImageStages`, then
//! `afterImages` once. It is itself single-threaded — [`Conveyor::run`]
//! walks images strictly in the caller-supplied dependency order — but
//! [`Conveyor::run_parallel`] delegates independent sibling images within
//! one dependency level to worker threads via `std::thread::scope`,
//! chunking each level across workers bounded by `max_concurrent`.

mod build;
mod cleanup;
mod should_be_built;
mod signatures;

pub use build::{BuildPhase, StageBuilder};
pub use cleanup::CleanupPhase;
pub use should_be_built::ShouldBeBuiltPhase;
pub use signatures::SignaturesPhase;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use kiln_types::{Environment, Image, KilnError, KilnErrorKind};

/// Cooperative cancellation: one token per invocation, polled between
/// stages and inside long-running worker operations.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Returns `Err(cancelled)` if the token has been set; callers poll
    /// this at every phase-hook boundary.
    pub fn check(&self) -> Result<(), KilnError> {
        if self.is_cancelled() { Err(KilnError::cancelled()) } else { Ok(()) }
    }
}

/// Shared, read-only invocation state every phase hook receives.
pub struct ConveyorContext {
    pub project: String,
    pub cancellation: CancellationToken,
    pub environment: Environment,
}

/// One orchestration pass over the image graph: phases are objects
/// implementing beforeImages/beforeImageStages/onImageStage/
/// afterImageStages/afterImages. Default hook bodies are no-ops so a
/// phase only overrides what it needs.
///
/// `Send + Sync` because [`Conveyor::run_parallel`] shares one phase
/// reference across worker threads.
pub trait Phase: Send + Sync {
    fn name(&self) -> &str;

    fn before_images(&self, _ctx: &ConveyorContext) -> Result<(), KilnError> {
        Ok(())
    }

    fn before_image_stages(&self, _ctx: &ConveyorContext, _image: &mut Image) -> Result<(), KilnError> {
        Ok(())
    }

    fn on_image_stage(&self, _ctx: &ConveyorContext, _image: &mut Image, _stage_index: usize) -> Result<(), KilnError> {
        Ok(())
    }

    fn after_image_stages(&self, _ctx: &ConveyorContext, _image: &mut Image) -> Result<(), KilnError> {
        Ok(())
    }

    fn after_images(&self, _ctx: &ConveyorContext) -> Result<(), KilnError> {
        Ok(())
    }
}

/// Drives one end-to-end invocation over a fixed image graph.
///
/// `levels` partitions `images` by dependency indices: level *k* may only
/// depend on images in levels `0..k`, so every image within one level can
/// build independently of its siblings. The caller (the `kiln` facade,
/// which owns the declared image-dependency DAG) is responsible for this
/// partitioning; the Conveyor itself has no opinion on *why* two images are
/// independent, only that the level boundaries say so.
pub struct Conveyor {
    images: Vec<Mutex<Image>>,
    levels: Vec<Vec<usize>>,
    pub ctx: ConveyorContext,
    pub max_resets: u32,
    pub max_concurrent: usize,
}

impl Conveyor {
    pub fn new(project: impl Into<String>, images: Vec<Image>, levels: Vec<Vec<usize>>) -> Self {
        Self {
            images: images.into_iter().map(Mutex::new).collect(),
            levels,
            ctx: ConveyorContext { project: project.into(), cancellation: CancellationToken::new(), environment: Environment::from_process_env() },
            max_resets: 3,
            max_concurrent: 4,
        }
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.ctx.cancellation.clone()
    }

    /// Snapshot of the current image graph, e.g. for a caller building a
    /// [`kiln_types::PublishReport`] after the Publish phase has run.
    pub fn images(&self) -> Vec<Image> {
        self.images.iter().map(|m| m.lock().expect("conveyor image mutex poisoned").clone()).collect()
    }

    fn run_image_stages(&self, phase: &dyn Phase, index: usize) -> Result<(), KilnError> {
        let mut image = self.images[index].lock().expect("conveyor image mutex poisoned");
        phase.before_image_stages(&self.ctx, &mut image)?;
        for stage_index in 0..image.stages.len() {
            self.ctx.cancellation.check()?;
            phase.on_image_stage(&self.ctx, &mut image, stage_index)?;
        }
        phase.after_image_stages(&self.ctx, &mut image)
    }

    /// Runs `phase` over every image, strictly sequentially, on the calling
    /// thread. The right choice for phases that only touch invocation-
    /// scoped state (Signatures, ShouldBeBuilt, Cleanup).
    pub fn run(&self, phase: &dyn Phase) -> Result<(), KilnError> {
        phase.before_images(&self.ctx)?;
        for level in &self.levels {
            for &index in level {
                self.ctx.cancellation.check()?;
                self.run_image_stages(phase, index)?;
            }
        }
        phase.after_images(&self.ctx)
    }

    /// Runs `phase` across worker threads: within one dependency level,
    /// sibling images build concurrently, capped at `max_concurrent`
    /// in-flight threads; levels themselves run in strict sequence. The
    /// right choice for the Build phase, whose per-stage work is
    /// network/subprocess-bound: the Conveyor itself stays single-threaded
    /// but delegates independent stage builds to workers.
    pub fn run_parallel(&self, phase: &dyn Phase) -> Result<(), KilnError> {
        phase.before_images(&self.ctx)?;
        for level in &self.levels {
            for chunk in level.chunks(self.max_concurrent.max(1)) {
                self.ctx.cancellation.check()?;
                let results = std::thread::scope(|scope| {
                    let handles: Vec<_> = chunk.iter().map(|&index| scope.spawn(move || self.run_image_stages(phase, index))).collect();
                    handles.into_iter().map(|h| h.join().expect("conveyor worker thread panicked")).collect::<Vec<_>>()
                });
                for result in results {
                    result?;
                }
            }
        }
        phase.after_images(&self.ctx)
    }

    /// Signatures and Build are run as one renewable unit: a
    /// *reset-required* surfacing from Build means a predecessor stage was
    /// invalidated between signing and building, so signatures are
    /// recomputed and the pair restarts. Bounded by `max_resets`;
    /// exceeding it is fatal.
    pub fn run_signatures_then_build(&self, signatures: &dyn Phase, build: &dyn Phase) -> Result<(), KilnError> {
        let mut resets = 0;
        loop {
            let outcome = self.run(signatures).and_then(|_| self.run_parallel(build));
            match outcome {
                Ok(()) => return Ok(()),
                Err(e) if e.kind == KilnErrorKind::ResetRequired => {
                    resets += 1;
                    if resets > self.max_resets {
                        return Err(KilnError::new(KilnErrorKind::RuntimeError, format!("exceeded {} signature/build resets", self.max_resets)));
                    }
                    tracing::debug!(resets, "stage invalidated mid-build, recomputing signatures");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_types::{DependencyVector, ImageKind, Stage, StageKind};
    use std::sync::atomic::AtomicUsize;

    fn one_stage_image(name: &str) -> Image {
        Image::new(name, ImageKind::Layered, false, vec![Stage::new(StageKind::From, "from", DependencyVector::new())])
    }

    struct CountingPhase {
        before_images: AtomicUsize,
        stages_seen: AtomicUsize,
    }

    impl Phase for CountingPhase {
        fn name(&self) -> &str {
            "counting"
        }
        fn before_images(&self, _ctx: &ConveyorContext) -> Result<(), KilnError> {
            self.before_images.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn on_image_stage(&self, _ctx: &ConveyorContext, _image: &mut Image, _stage_index: usize) -> Result<(), KilnError> {
            self.stages_seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn run_visits_every_stage_of_every_image_once() {
        let conveyor = Conveyor::new("proj", vec![one_stage_image("a"), one_stage_image("b")], vec![vec![0, 1]]);
        let phase = CountingPhase { before_images: AtomicUsize::new(0), stages_seen: AtomicUsize::new(0) };
        conveyor.run(&phase).unwrap();
        assert_eq!(phase.before_images.load(Ordering::SeqCst), 1);
        assert_eq!(phase.stages_seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn run_parallel_visits_every_stage_of_every_image_once() {
        let conveyor = Conveyor::new("proj", vec![one_stage_image("a"), one_stage_image("b"), one_stage_image("c")], vec![vec![0, 1, 2]]);
        let phase = CountingPhase { before_images: AtomicUsize::new(0), stages_seen: AtomicUsize::new(0) };
        conveyor.run_parallel(&phase).unwrap();
        assert_eq!(phase.stages_seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn cancellation_before_run_returns_cancelled() {
        let conveyor = Conveyor::new("proj", vec![one_stage_image("a")], vec![vec![0]]);
        conveyor.cancellation().cancel();
        let phase = CountingPhase { before_images: AtomicUsize::new(0), stages_seen: AtomicUsize::new(0) };
        let err = conveyor.run(&phase).unwrap_err();
        assert_eq!(err.kind, KilnErrorKind::Cancelled);
        assert_eq!(phase.stages_seen.load(Ordering::SeqCst), 0);
    }

    struct AlwaysResets {
        attempts: AtomicUsize,
    }

    impl Phase for AlwaysResets {
        fn name(&self) -> &str {
            "always-resets"
        }
        fn on_image_stage(&self, _ctx: &ConveyorContext, _image: &mut Image, _stage_index: usize) -> Result<(), KilnError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(KilnError::reset_required("predecessor invalidated"))
        }
    }

    struct Noop;
    impl Phase for Noop {
        fn name(&self) -> &str {
            "noop"
        }
    }

    #[test]
    fn resets_are_bounded_then_fatal() {
        let conveyor = Conveyor::new("proj", vec![one_stage_image("a")], vec![vec![0]]);
        let build = AlwaysResets { attempts: AtomicUsize::new(0) };
        let err = conveyor.run_signatures_then_build(&Noop, &build).unwrap_err();
        assert_eq!(err.kind, KilnErrorKind::RuntimeError);
        assert_eq!(build.attempts.load(Ordering::SeqCst) as u32, conveyor.max_resets + 1);
    }
}
