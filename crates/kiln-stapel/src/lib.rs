//! Layered-recipe ("stapel") stage graph construction: turns a
//! [`StapelImageDecl`] into the fixed, ordered sequence of
//! [`kiln_types::Stage`]s for an image, each carrying its canonical
//! dependency vector.
//!
//! Order is fixed by [`kiln_types::StageKind`]'s declaration order, not by
//! where things appear in the recipe — this crate is the only place
//! allowed to build that sequence.

use std::collections::BTreeMap;

use kiln_types::{DependencyVector, KilnError, KilnErrorKind, Stage, StageKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountKind {
    Tmp,
    Build,
    Custom(String),
}

impl MountKind {
    fn as_str(&self) -> &str {
        match self {
            MountKind::Tmp => "tmp",
            MountKind::Build => "build",
            MountKind::Custom(s) => s,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MountDecl {
    pub from: String,
    pub to: String,
    pub kind: MountKind,
}

#[derive(Debug, Clone)]
pub struct GitSourceDecl {
    pub url: String,
    pub branch: String,
    pub to: String,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub stage_dependency_globs: Vec<String>,
    /// The commit currently resolved for `branch`. Contributes only to the
    /// `GitLatestPatch` stage, never to `GitCache` — so a new commit on an
    /// unchanged branch/path configuration busts only the cheap patch
    /// stage, not the expensive clone-and-cache stage.
    pub commit: String,
}

/// Which command stage an import or dependency is materialized before.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachPoint {
    BeforeInstall,
    Install,
    Setup,
}

impl AttachPoint {
    fn stage_kind(self) -> StageKind {
        match self {
            AttachPoint::BeforeInstall => StageKind::BeforeInstall,
            AttachPoint::Install => StageKind::Install,
            AttachPoint::Setup => StageKind::Setup,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImportDecl {
    pub image: String,
    pub add: String,
    pub to: String,
    pub after: AttachPoint,
    pub owner: Option<String>,
    pub group: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DependencyDecl {
    pub image_name: String,
    pub after: AttachPoint,
    /// Which facets of the dependency image to pull in, e.g. `"imageDigest"`.
    pub imports: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct StapelImageDecl {
    pub base_image: String,
    pub mounts: Vec<MountDecl>,
    pub git_sources: Vec<GitSourceDecl>,
    pub before_install_commands: Vec<String>,
    pub install_commands: Vec<String>,
    pub setup_commands: Vec<String>,
    /// Literal final-image configuration lines (labels/env/expose/entrypoint/
    /// cmd/workdir/user), already rendered by the config loader.
    pub docker_instructions: Vec<String>,
    pub imports: Vec<ImportDecl>,
    pub dependencies: Vec<DependencyDecl>,
    /// Free-form cache-busting string from the recipe, mixed into the
    /// dependency vector to force a rebuild without changing any command.
    pub cache_version: String,
}

fn push_import(vector: &mut DependencyVector, import: &ImportDecl) {
    let owner = import.owner.as_deref().unwrap_or("");
    let group = import.group.as_deref().unwrap_or("");
    vector.push(format!("import:{}:{}:{}:{}:{}", import.image, import.add, import.to, owner, group));
}

fn push_dependency(vector: &mut DependencyVector, dep: &DependencyDecl, image_digests: &BTreeMap<String, String>) -> Result<(), KilnError> {
    let digest = image_digests
        .get(&dep.image_name)
        .ok_or_else(|| KilnError::new(KilnErrorKind::ConfigInvalid, format!("dependency image {:?} has not been built yet", dep.image_name)))?;
    for facet in &dep.imports {
        vector.push(format!("dependency:{}:{}:{}", dep.image_name, facet, digest));
    }
    Ok(())
}

fn attached(decl: &StapelImageDecl, point: AttachPoint) -> (Vec<&ImportDecl>, Vec<&DependencyDecl>) {
    let imports = decl.imports.iter().filter(|i| i.after == point).collect();
    let dependencies = decl.dependencies.iter().filter(|d| d.after == point).collect();
    (imports, dependencies)
}

/// Build the fixed ordered stage sequence for a layered-recipe image.
///
/// `image_digests` must already contain an entry for every image named in
/// `decl.dependencies`; a missing entry is a configuration error, not a
/// state to recover from here — the caller is responsible for building
/// dependency images first per the declared image build order.
pub fn build_stages(decl: &StapelImageDecl, image_digests: &BTreeMap<String, String>) -> Result<Vec<Stage>, KilnError> {
    let mut stages = Vec::new();

    let mut from_vector = DependencyVector::new();
    from_vector.push(decl.base_image.clone());
    stages.push(Stage::new(StageKind::From, decl.base_image.clone(), from_vector));

    let mut before_install_vector = DependencyVector::new();
    if !decl.cache_version.is_empty() {
        before_install_vector.push(format!("cache-version:{}", decl.cache_version));
    }
    for mount in &decl.mounts {
        before_install_vector.push(format!("mount:{}:{}:{}", mount.from, mount.to, mount.kind.as_str()));
    }
    let (imports, dependencies) = attached(decl, AttachPoint::BeforeInstall);
    for import in &imports {
        push_import(&mut before_install_vector, import);
    }
    for dep in &dependencies {
        push_dependency(&mut before_install_vector, dep, image_digests)?;
    }
    for command in &decl.before_install_commands {
        before_install_vector.push(command.clone());
    }
    stages.push(Stage::new(StageKind::BeforeInstall, decl.before_install_commands.join("\n"), before_install_vector));

    let mut git_cache_vector = DependencyVector::new();
    for git in &decl.git_sources {
        git_cache_vector.push(format!(
            "git-cache:{}:{}:{}:{}:{}:{}",
            git.url,
            git.branch,
            git.to,
            git.owner.as_deref().unwrap_or(""),
            git.group.as_deref().unwrap_or(""),
            git.stage_dependency_globs.join(",")
        ));
    }
    stages.push(Stage::new(StageKind::GitCache, format!("{} git source(s)", decl.git_sources.len()), git_cache_vector));

    let mut git_latest_patch_vector = DependencyVector::new();
    for git in &decl.git_sources {
        git_latest_patch_vector.push(format!("git-commit:{}:{}", git.to, git.commit));
    }
    stages.push(Stage::new(StageKind::GitLatestPatch, format!("{} git source(s)", decl.git_sources.len()), git_latest_patch_vector));

    let mut install_vector = DependencyVector::new();
    let (imports, dependencies) = attached(decl, AttachPoint::Install);
    for import in &imports {
        push_import(&mut install_vector, import);
    }
    for dep in &dependencies {
        push_dependency(&mut install_vector, dep, image_digests)?;
    }
    for command in &decl.install_commands {
        install_vector.push(command.clone());
    }
    stages.push(Stage::new(StageKind::Install, decl.install_commands.join("\n"), install_vector));

    let mut setup_vector = DependencyVector::new();
    let (imports, dependencies) = attached(decl, AttachPoint::Setup);
    for import in &imports {
        push_import(&mut setup_vector, import);
    }
    for dep in &dependencies {
        push_dependency(&mut setup_vector, dep, image_digests)?;
    }
    for command in &decl.setup_commands {
        setup_vector.push(command.clone());
    }
    stages.push(Stage::new(StageKind::Setup, decl.setup_commands.join("\n"), setup_vector));

    let docker_instructions_vector: DependencyVector = decl.docker_instructions.iter().cloned().collect();
    stages.push(Stage::new(StageKind::DockerInstructions, decl.docker_instructions.join("\n"), docker_instructions_vector));

    Ok(stages)
}
