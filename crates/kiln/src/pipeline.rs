//! One invocation end to end: turn declared [`ImageSpec`]s into signed,
//! built, optionally-published [`Image`]s.
//!
//! This is the piece nothing else in the workspace owns — `kiln-conveyor`
//! drives phases over an already-built image graph, but something has to
//! turn declarations into that graph, pre-resolve cross-image
//! `imageDigest` dependencies in build order, and wire a concrete
//! `RuntimeDriver`/`StagesStore`/`Registry` together: the same role a CLI
//! adapter's engine module plays between argument parsing and a library's
//! lower-level phases.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use kiln_conveyor::{BuildPhase, CleanupPhase, Conveyor, ShouldBeBuiltPhase, SignaturesPhase};
use kiln_dockerfile::DockerfileAnalysis;
use kiln_lock::LockManager;
use kiln_publish::{PublishOptions, PublishPhase};
use kiln_registry::DockerRegistryV2Client;
use kiln_runtime::{DockerCliDriver, RuntimeDriver};
use kiln_source::SourceIndex;
use kiln_store::LocalStagesStore;
use kiln_types::{Image, ImageKind, KilnError, KilnErrorKind, PublishReport, Stage, StageKind};

use crate::builder::RuntimeStageBuilder;
use crate::graph::{self, ImageDigests};
use crate::onbuild::RuntimeOnBuildSource;
use crate::spec::{ImageDecl, ImageSpec};
use crate::store::SharedStore;

/// Registry connection for publish and `ONBUILD` resolution. Left unset, an
/// invocation can still build and cache — only `PublishPhase` requires one.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub base_url: String,
    pub repo_base: String,
}

/// Everything one `run_build` call needs. Deliberately flat rather than a
/// builder — this crate's job is to wire the pipeline, not to own an
/// ergonomic construction API on top of it.
pub struct BuildConfig {
    pub project: String,
    /// Where `LocalStagesStore` persists stage metadata and the runtime
    /// build context for Dockerfile-kind images is staged.
    pub state_dir: PathBuf,
    /// Root directory `kiln-source` resolves declared wildcards against.
    pub context_root: PathBuf,
    pub images: Vec<ImageSpec>,
    pub registry: Option<RegistryConfig>,
    pub publish: Option<PublishOptions>,
    pub max_concurrent: usize,
}

impl BuildConfig {
    pub fn new(project: impl Into<String>, state_dir: impl Into<PathBuf>, context_root: impl Into<PathBuf>, images: Vec<ImageSpec>) -> Self {
        Self {
            project: project.into(),
            state_dir: state_dir.into(),
            context_root: context_root.into(),
            images,
            registry: None,
            publish: None,
            max_concurrent: 4,
        }
    }
}

/// What one invocation produced.
pub struct BuildOutcome {
    pub images: Vec<Image>,
    pub publish_report: Option<PublishReport>,
}

fn dockerfile_analysis(
    content: &str,
    build_args: &BTreeMap<String, String>,
    source: &SourceIndex,
    runtime: &dyn RuntimeDriver,
    registry: Option<&DockerRegistryV2Client>,
) -> Result<DockerfileAnalysis, KilnError> {
    let onbuild = RuntimeOnBuildSource::new(runtime, registry);
    kiln_dockerfile::analyze(content, build_args, source, &onbuild)
}

/// Resolve every declared [`ImageSpec`] into an unsigned [`Image`],
/// respecting declared `dependencies` so a `Stapel` image's
/// `imageDigest` imports see an already-signed upstream image.
///
/// Returns images in `specs` order (not level order) alongside the levels
/// `Conveyor::new` needs, since the Conveyor itself re-derives nothing
/// about *why* images are independent.
fn build_image_graph(
    specs: &[ImageSpec],
    source: &SourceIndex,
    runtime: &dyn RuntimeDriver,
    registry: Option<&DockerRegistryV2Client>,
) -> Result<(Vec<Image>, Vec<Vec<usize>>), KilnError> {
    let levels = graph::dependency_levels(specs)?;
    let mut images: Vec<Option<Image>> = vec![None; specs.len()];
    let mut digests: ImageDigests = BTreeMap::new();

    for level in &levels {
        for &index in level {
            let spec = &specs[index];
            let mut image = match &spec.decl {
                ImageDecl::Dockerfile { content, build_args, target, .. } => {
                    let analysis = dockerfile_analysis(content, build_args, source, runtime, registry)?;
                    let vector = match target {
                        Some(name) => analysis
                            .stage_by_name(name)
                            .ok_or_else(|| KilnError::new(KilnErrorKind::ConfigInvalid, format!("Dockerfile has no stage named {name:?}")).with_image(&spec.name))?
                            .dependency_vector
                            .clone(),
                        None => analysis
                            .final_dependency_vector()
                            .ok_or_else(|| KilnError::new(KilnErrorKind::DockerfileAnalyzeError, "Dockerfile has no stages").with_image(&spec.name))?
                            .clone(),
                    };
                    let stage = Stage::new(StageKind::Dockerfile, content.clone(), vector);
                    Image::new(spec.name.clone(), ImageKind::Dockerfile, spec.artifact, vec![stage])
                }
                ImageDecl::Stapel(decl) => {
                    let stages = kiln_stapel::build_stages(decl, &digests)?;
                    Image::new(spec.name.clone(), ImageKind::Layered, spec.artifact, stages)
                }
            };

            // Pre-sign so a dependent image built later in this same pass
            // can resolve this image's imageDigest import. `Conveyor`'s own
            // `SignaturesPhase` re-signs every image once the pipeline
            // runs; `sign_image` is pure and idempotent, so this earlier
            // pass is harmless, not merely tolerated.
            kiln_signature::sign_image(&mut image);
            if let Some(signature) = image.content_signature() {
                digests.insert(spec.name.clone(), signature.to_string());
            }
            images[index] = Some(image);
        }
    }

    let images = images.into_iter().map(|i| i.expect("every index visited by its level")).collect();
    Ok((images, levels))
}

/// Run one invocation: build every declared image, and publish it if
/// `config.publish` is set.
pub fn run_build(config: BuildConfig) -> Result<BuildOutcome> {
    let source = SourceIndex::new(config.context_root.clone());
    let runtime: Arc<dyn RuntimeDriver + Send + Sync> = Arc::new(DockerCliDriver::default());
    let registry = config.registry.as_ref().map(|r| DockerRegistryV2Client::new(r.base_url.clone()));

    let (images, levels) = build_image_graph(&config.images, &source, runtime.as_ref(), registry.as_ref())?;

    let store = SharedStore::new(LocalStagesStore::new(config.state_dir.clone()));
    let locks = Arc::new(LockManager::new(None));
    let builder = RuntimeStageBuilder::new(runtime.clone(), config.state_dir.clone(), &config.images);

    let mut conveyor = Conveyor::new(config.project.clone(), images, levels);
    conveyor.max_concurrent = config.max_concurrent.max(1);

    let signatures = SignaturesPhase;
    let build = BuildPhase::new(store.clone(), locks.clone(), Box::new(builder));
    conveyor.run_signatures_then_build(&signatures, &build)?;

    conveyor.run(&ShouldBeBuiltPhase::new(store.clone()))?;
    conveyor.run(&CleanupPhase::new(store.clone()))?;

    let publish_report = match (config.publish, config.registry.as_ref()) {
        (Some(options), Some(registry_config)) => {
            let registry = registry.ok_or_else(|| KilnError::new(KilnErrorKind::ConfigInvalid, "registry base URL configured but client failed to initialize"))?;
            let publish = PublishPhase::new(store.clone(), registry, runtime.clone(), locks.clone(), registry_config.repo_base.clone(), options);
            conveyor.run_parallel(&publish)?;
            Some(publish.report())
        }
        (Some(_), None) => return Err(KilnError::new(KilnErrorKind::ConfigInvalid, "publish requested without a registry configured").into()),
        (None, _) => None,
    };

    Ok(BuildOutcome { images: conveyor.images(), publish_report })
}
