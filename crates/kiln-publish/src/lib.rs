//! Reconciles each non-artifact image's built stage against the remote
//! repository under every configured tagging strategy, emitting a
//! [`PublishReport`]. Implements `kiln-conveyor`'s `Phase` trait so it
//! composes with the rest of the pipeline through
//! `Conveyor::run`/`run_parallel`.
//!
//! Fetch the repository's existing tags once, check each meta-tag against
//! them (and, for non-self-certifying strategies, the remote tag's
//! content-signature label), and only take the per-(repo,tag) lock and
//! re-check when a push actually looks necessary.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use kiln_conveyor::{ConveyorContext, Phase};
use kiln_lock::{LockManager, LockOptions};
use kiln_registry::Registry;
use kiln_retry::{RetryStrategyConfig, Transience, retry_with_backoff};
use kiln_runtime::{ContainerConfig, RuntimeDriver};
use kiln_store::{ImageMetadata, StagesStore};
use kiln_types::{Image, KilnError, KilnErrorKind, MetaTag, PublishEntry, PublishReport, TaggingStrategy};

pub const CONTENT_SIGNATURE_LABEL: &str = "kiln.content-signature";
pub const TAG_STRATEGY_LABEL: &str = "kiln.tag-strategy";
pub const IMAGE_NAME_LABEL: &str = "kiln.image-name";
pub const IMAGE_TAG_LABEL: &str = "kiln.image-tag";
pub const SCHEMA_VERSION_LABEL: &str = "kiln.schema-version";
pub const SCHEMA_VERSION: &str = "1";

/// What to publish and under which tagging strategies, applied as for
/// each configured tagging strategy, for each meta-tag.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub tags_by_strategy: BTreeMap<TaggingStrategy, Vec<MetaTag>>,
    pub tag_by_stages_signature: bool,
    /// Empty means every non-artifact image is a candidate.
    pub images_to_publish: Vec<String>,
    /// VCS head commit per image name, when version-control metadata is
    /// available. Images absent here skip commit reconciliation entirely.
    pub head_commits: BTreeMap<String, String>,
}

/// Substring classification of a push failure's detail text: lowercase it
/// and scan for known substrings associated with transient network or
/// registry conditions.
fn classify_push_failure(error: &KilnError) -> Transience {
    let hay = error.detail.to_lowercase();
    const TRANSIENT_PATTERNS: &[&str] = &[
        "timeout", "timed out", "connection reset", "connection refused", "connection closed", "temporarily unavailable", "dns", "tls", "502", "503", "504", "too many requests", "429",
    ];
    if TRANSIENT_PATTERNS.iter().any(|p| hay.contains(p)) { Transience::Transient } else { Transience::Permanent }
}

/// Publish phase. Generic over the store and registry traits so tests can
/// substitute fakes; `runtime`/`locks` are shared across workers the same
/// way `BuildPhase` shares them.
pub struct PublishPhase<S, R> {
    store: S,
    registry: R,
    runtime: Arc<dyn RuntimeDriver + Send + Sync>,
    locks: Arc<LockManager>,
    repo_base: String,
    options: PublishOptions,
    retry: RetryStrategyConfig,
    tag_cache: Mutex<BTreeMap<String, Vec<String>>>,
    report: Mutex<PublishReport>,
}

impl<S: StagesStore, R: Registry> PublishPhase<S, R> {
    pub fn new(store: S, registry: R, runtime: Arc<dyn RuntimeDriver + Send + Sync>, locks: Arc<LockManager>, repo_base: impl Into<String>, options: PublishOptions) -> Self {
        Self { store, registry, runtime, locks, repo_base: repo_base.into(), options, retry: RetryStrategyConfig::default(), tag_cache: Mutex::new(BTreeMap::new()), report: Mutex::new(PublishReport::new()) }
    }

    pub fn with_retry_config(mut self, retry: RetryStrategyConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn report(&self) -> PublishReport {
        self.report.lock().expect("publish report mutex poisoned").clone()
    }

    fn image_repository(&self, image_name: &str) -> String {
        format!("{}/{image_name}", self.repo_base)
    }

    fn should_publish(&self, image_name: &str) -> bool {
        self.options.images_to_publish.is_empty() || self.options.images_to_publish.iter().any(|n| n == image_name)
    }

    /// Docker tags may not contain `/`; every strategy but StagesSignature
    /// passes a human meta-tag (branch name, custom string) through
    /// verbatim otherwise. StagesSignature's meta-tag is already a hex
    /// digest and needs no sanitizing.
    fn tag_for(&self, strategy: TaggingStrategy, meta_tag: &str) -> String {
        if strategy == TaggingStrategy::StagesSignature { meta_tag.to_string() } else { meta_tag.replace('/', "-") }
    }

    fn reconcile_commit_metadata(&self, project: &str, image: &Image) -> Result<(), KilnError> {
        let Some(commit) = self.options.head_commits.get(&image.name) else {
            return Ok(());
        };
        let content_signature = image.content_signature().ok_or_else(|| KilnError::new(KilnErrorKind::SignatureError, "publish ran before signatures were computed").with_image(&image.name))?;
        let existing = self.store.get_image_metadata_by_commit(project, &image.name, commit)?;
        let needs_write = !matches!(&existing, Some(m) if m.content_signature == content_signature);
        if needs_write {
            self.store.put_image_commit(project, &image.name, commit, &ImageMetadata { content_signature })?;
        }
        Ok(())
    }

    fn cached_tags(&self, image_name: &str) -> Result<Vec<String>, KilnError> {
        if let Some(tags) = self.tag_cache.lock().expect("publish tag cache mutex poisoned").get(image_name) {
            return Ok(tags.clone());
        }
        let tags = self.registry.tags(&self.image_repository(image_name))?;
        self.tag_cache.lock().expect("publish tag cache mutex poisoned").insert(image_name.to_string(), tags.clone());
        Ok(tags)
    }

    /// A tag counts as already published when it's present, and either
    /// self-certifying or the remote tag's content-signature label
    /// matches. Returns the reference to record as `image_id` in the
    /// report when it does.
    fn already_published(&self, repo: &str, actual_tag: &str, content_signature: kiln_hash::Digest256, check_label: bool, existing_tags: &[String]) -> Result<Option<String>, KilnError> {
        if !existing_tags.iter().any(|t| t == actual_tag) {
            return Ok(None);
        }
        if !check_label {
            return Ok(Some(format!("{repo}:{actual_tag}")));
        }
        let config = self.registry.get_config_file(&format!("{repo}:{actual_tag}"))?;
        let matches = config.labels.get(CONTENT_SIGNATURE_LABEL).is_some_and(|s| s == &content_signature.to_string());
        Ok(matches.then(|| format!("{repo}:{actual_tag}")))
    }

    fn publish_by_tag(&self, project: &str, image: &Image, meta_tag: &str, strategy: TaggingStrategy, check_label: bool, existing_tags: &[String]) -> Result<(), KilnError> {
        let repo = self.image_repository(&image.name);
        let actual_tag = self.tag_for(strategy, meta_tag);
        let content_signature = image.content_signature().ok_or_else(|| KilnError::new(KilnErrorKind::SignatureError, "publish ran before signatures were computed").with_image(&image.name))?;

        if let Some(image_id) = self.already_published(&repo, &actual_tag, content_signature, check_label, existing_tags)? {
            self.report.lock().expect("publish report mutex poisoned").record(image.name.clone(), PublishEntry { repo, tag: actual_tag, image_id, tag_strategy: strategy });
            return Ok(());
        }

        let lock_name = format!("image:{repo}:{actual_tag}");
        let handle = self.locks.lock(&lock_name, LockOptions::exclusive()).map_err(|e| e.with_image(&image.name))?;

        let outcome = (|| -> Result<PublishEntry, KilnError> {
            let refreshed_tags = self.registry.tags(&repo)?;
            if let Some(image_id) = self.already_published(&repo, &actual_tag, content_signature, check_label, &refreshed_tags)? {
                return Ok(PublishEntry { repo: repo.clone(), tag: actual_tag.clone(), image_id, tag_strategy: strategy });
            }

            let last_stage_artifact = image.stages.last().and_then(|s| s.artifact).ok_or_else(|| {
                KilnError::new(KilnErrorKind::StoreUnavailable, "final stage has no built artifact to publish").with_image(&image.name)
            })?;
            self.store.fetch_stage(project, last_stage_artifact)?;

            let mut labels = BTreeMap::new();
            labels.insert(IMAGE_NAME_LABEL.to_string(), image.name.clone());
            labels.insert(IMAGE_TAG_LABEL.to_string(), meta_tag.to_string());
            labels.insert(TAG_STRATEGY_LABEL.to_string(), strategy.to_string());
            labels.insert(CONTENT_SIGNATURE_LABEL.to_string(), content_signature.to_string());
            labels.insert(SCHEMA_VERSION_LABEL.to_string(), SCHEMA_VERSION.to_string());

            let local_id = self
                .runtime
                .commit(&ContainerConfig { base_image: last_stage_artifact.as_tag(), commands: Vec::new(), env: BTreeMap::new(), labels })
                .map_err(|e| e.with_image(&image.name))?;

            let reference = format!("{repo}:{actual_tag}");
            self.runtime.tag(&local_id, &reference).map_err(|e| e.with_image(&image.name))?;

            retry_with_backoff(&self.retry, |_attempt| self.runtime.push(&reference), classify_push_failure, std::thread::sleep).map_err(|e| e.with_image(&image.name))?;

            Ok(PublishEntry { repo: repo.clone(), tag: actual_tag.clone(), image_id: local_id, tag_strategy: strategy })
        })();

        self.locks.unlock(handle).map_err(|e| e.with_image(&image.name))?;

        let entry = outcome?;
        self.report.lock().expect("publish report mutex poisoned").record(image.name.clone(), entry);
        Ok(())
    }

    fn publish_image(&self, project: &str, image: &Image) -> Result<(), KilnError> {
        self.reconcile_commit_metadata(project, image)?;
        let existing_tags = self.cached_tags(&image.name)?;

        for (&strategy, meta_tags) in &self.options.tags_by_strategy {
            for meta_tag in meta_tags {
                self.publish_by_tag(project, image, meta_tag, strategy, true, &existing_tags)?;
            }
        }

        if self.options.tag_by_stages_signature {
            let content_signature = image.content_signature().ok_or_else(|| KilnError::new(KilnErrorKind::SignatureError, "publish ran before signatures were computed").with_image(&image.name))?;
            self.publish_by_tag(project, image, &content_signature.to_string(), TaggingStrategy::StagesSignature, false, &existing_tags)?;
        }

        Ok(())
    }
}

impl<S: StagesStore + Send + Sync, R: Registry + Send + Sync> Phase for PublishPhase<S, R> {
    fn name(&self) -> &str {
        "publish"
    }

    fn after_image_stages(&self, ctx: &ConveyorContext, image: &mut Image) -> Result<(), KilnError> {
        if image.artifact || !self.should_publish(&image.name) {
            return Ok(());
        }
        self.publish_image(&ctx.project, image)
    }
}
