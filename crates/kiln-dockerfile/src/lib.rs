//! Dockerfile analysis: parses a Dockerfile into stages and derives each
//! stage's [`kiln_types::DependencyVector`] per the per-instruction
//! contribution rules.
//!
//! Built on `dockerfile-parser` for the AST; this crate owns the
//! ARG/ENV substitution, ONBUILD inheritance, and cross-stage `COPY --from`
//! resolution on top of it.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::LazyLock;

use dockerfile_parser::{Dockerfile, Instruction};
use kiln_source::SourceIndex;
use kiln_types::{DependencyVector, KilnError, KilnErrorKind};
use regex::Regex;

/// Where a stage's `FROM` base image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseImageOrigin {
    Scratch,
    /// A prior stage in the same Dockerfile, by index.
    PriorStage(usize),
    /// An external image reference, pulled from a runtime/registry.
    External(String),
}

#[derive(Debug, Clone)]
pub struct StageAnalysis {
    pub index: usize,
    pub alias: Option<String>,
    pub base: BaseImageOrigin,
    pub dependency_vector: DependencyVector,
}

#[derive(Debug, Clone)]
pub struct DockerfileAnalysis {
    pub stages: Vec<StageAnalysis>,
}

impl DockerfileAnalysis {
    /// The dependency vector that becomes the image's `Dockerfile`-kind
    /// stage vector: the last parsed stage's vector, since a Dockerfile
    /// image without an explicit `--target` builds its final `FROM` block.
    pub fn final_dependency_vector(&self) -> Option<&DependencyVector> {
        self.stages.last().map(|s| &s.dependency_vector)
    }

    pub fn stage_by_name(&self, name: &str) -> Option<&StageAnalysis> {
        self.stages.iter().find(|s| s.alias.as_deref() == Some(name))
    }
}

/// How the analyzer obtains a base image's `ONBUILD` instructions: local
/// runtime first, registry on miss, pull-then-reinspect as a last resort.
pub trait OnBuildSource {
    fn onbuild_from_runtime(&self, image: &str) -> Result<Option<Vec<String>>, KilnError>;
    fn onbuild_from_registry(&self, image: &str) -> Result<Option<Vec<String>>, KilnError>;
    fn pull_and_inspect(&self, image: &str) -> Result<Vec<String>, KilnError>;
}

fn resolve_onbuild(source: &dyn OnBuildSource, image: &str) -> Result<Vec<String>, KilnError> {
    if let Some(lines) = source.onbuild_from_runtime(image)? {
        return Ok(lines);
    }
    if let Some(lines) = source.onbuild_from_registry(image)? {
        return Ok(lines);
    }
    source.pull_and_inspect(image)
}

static VAR_REF: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?").unwrap());

/// Substitute `$VAR`/`${VAR}` references in `text` from `vars`, left to
/// right. References to names not in `vars` are left untouched, matching
/// Docker's own "undeclared ARG expands to empty unless referenced before
/// declaration raises a warning, not an error" leniency.
fn resolve_references(text: &str, vars: &BTreeMap<String, String>) -> String {
    VAR_REF
        .replace_all(text, |caps: &regex::Captures| {
            let name = &caps[1];
            vars.get(name).cloned().unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Parse `content` and compute each stage's dependency vector.
///
/// `build_args` are `--build-arg` overrides, applied in both the meta-ARG
/// scope (before the first `FROM`) and every stage scope.
pub fn analyze(
    content: &str,
    build_args: &BTreeMap<String, String>,
    source: &SourceIndex,
    onbuild: &dyn OnBuildSource,
) -> Result<DockerfileAnalysis, KilnError> {
    let dockerfile = Dockerfile::parse(content)
        .map_err(|e| KilnError::new(KilnErrorKind::DockerfileAnalyzeError, format!("failed to parse Dockerfile: {e}")))?;

    let mut meta_vars: BTreeMap<String, String> = BTreeMap::new();
    for arg in &dockerfile.global_args {
        let value = build_args.get(&arg.name.content).cloned().or_else(|| arg.value.as_ref().map(|v| v.content.clone())).unwrap_or_default();
        meta_vars.insert(arg.name.content.clone(), value);
    }

    let mut known_stage_names: HashMap<String, usize> = HashMap::new();
    let mut stages: Vec<StageAnalysis> = Vec::new();

    for stage in dockerfile.iter_stages() {
        let from = stage
            .instructions
            .first()
            .and_then(|i| match i {
                Instruction::From(from) => Some(from),
                _ => None,
            })
            .ok_or_else(|| KilnError::new(KilnErrorKind::DockerfileAnalyzeError, format!("stage {} has no FROM instruction", stage.index)))?;

        let resolved_base_name = resolve_references(&from.image.content, &meta_vars);
        let origin = if resolved_base_name == "scratch" {
            BaseImageOrigin::Scratch
        } else if let Some(&idx) = known_stage_names.get(&resolved_base_name) {
            BaseImageOrigin::PriorStage(idx)
        } else {
            BaseImageOrigin::External(resolved_base_name.clone())
        };

        let mut dependency_vector = DependencyVector::new();

        match &origin {
            BaseImageOrigin::PriorStage(idx) => {
                if let Some(prior) = stages.get(*idx) {
                    dependency_vector.extend_from(&prior.dependency_vector);
                }
            }
            BaseImageOrigin::External(name) => {
                let onbuild_lines = resolve_onbuild(onbuild, name)?;
                for line in onbuild_lines {
                    dependency_vector.push(format!("onbuild:{line}"));
                }
            }
            BaseImageOrigin::Scratch => {}
        }

        let mut stage_vars: BTreeMap<String, String> = BTreeMap::new();

        for instr in &stage.instructions {
            let canonical = format!("{instr:?}");
            dependency_vector.push(canonical.clone());

            match instr {
                Instruction::Arg(arg) => {
                    let raw = build_args.get(&arg.name.content).cloned().or_else(|| arg.value.as_ref().map(|v| v.content.clone())).unwrap_or_default();
                    let resolved = resolve_references(&raw, &stage_vars);
                    if Some(&resolved) != arg.value.as_ref().map(|v| &v.content) {
                        dependency_vector.push(format!("{}={}", arg.name, resolved));
                    }
                    stage_vars.insert(arg.name.content.clone(), resolved);
                }
                Instruction::Env(_) => {
                    let resolved = resolve_references(&canonical, &stage_vars);
                    if resolved != canonical {
                        dependency_vector.push(resolved);
                    }
                }
                Instruction::Copy(copy) => {
                    if let Some(from_flag) = copy.flags.iter().find(|f| f.name.content == "from") {
                        let referenced_idx = known_stage_names
                            .get(&from_flag.value.content)
                            .copied()
                            .or_else(|| from_flag.value.content.parse::<usize>().ok());
                        if let Some(idx) = referenced_idx {
                            if let Some(prior) = stages.get(idx) {
                                dependency_vector.extend_from(&prior.dependency_vector);
                            }
                        }
                    } else {
                        let sources: Vec<PathBuf> = copy.sources.iter().map(|s| PathBuf::from(&s.content)).collect();
                        let digest = source.digest_referenced(&sources)?;
                        dependency_vector.push(digest.to_string());
                    }
                }
                _ => {}
            }
        }

        if let Some(alias) = &from.alias {
            known_stage_names.insert(alias.content.clone(), stage.index);
        }
        known_stage_names.insert(stage.index.to_string(), stage.index);

        stages.push(StageAnalysis { index: stage.index, alias: from.alias.as_ref().map(|a| a.content.clone()), base: origin, dependency_vector });
    }

    if stages.is_empty() {
        return Err(KilnError::new(KilnErrorKind::DockerfileAnalyzeError, "Dockerfile has no stages"));
    }

    Ok(DockerfileAnalysis { stages })
}
