//! Image dependency-level partitioning: turns the `dependencies` declared
//! on each [`crate::spec::ImageSpec`] into the `Vec<Vec<usize>>` levels
//! `kiln_conveyor::Conveyor::new` requires, via the same breadth-first
//! Kahn's-algorithm batching used for workspace crate publish ordering,
//! grouped into waves instead of flattened into one order.

use std::collections::{BTreeMap, HashMap};

use kiln_types::{KilnError, KilnErrorKind};

use crate::spec::{ImageDecl, ImageSpec};

/// Partition `specs` into dependency-respecting levels: level *k* may only
/// depend on images in levels `0..k`. Errors if a `Stapel` image names a
/// dependency absent from `specs`, or if the dependency graph has a cycle.
pub fn dependency_levels(specs: &[ImageSpec]) -> Result<Vec<Vec<usize>>, KilnError> {
    let index_by_name: HashMap<&str, usize> = specs.iter().enumerate().map(|(i, s)| (s.name.as_str(), i)).collect();

    let mut indegree = vec![0usize; specs.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); specs.len()];

    for (i, spec) in specs.iter().enumerate() {
        let ImageDecl::Stapel(decl) = &spec.decl else { continue };
        for dep in &decl.dependencies {
            let &dep_index = index_by_name.get(dep.image_name.as_str()).ok_or_else(|| {
                KilnError::new(KilnErrorKind::ConfigInvalid, format!("image {:?} depends on undeclared image {:?}", spec.name, dep.image_name)).with_image(&spec.name)
            })?;
            dependents[dep_index].push(i);
            indegree[i] += 1;
        }
    }

    let mut levels = Vec::new();
    let mut placed = vec![false; specs.len()];
    let mut placed_count = 0;

    while placed_count < specs.len() {
        let level: Vec<usize> = (0..specs.len()).filter(|&i| !placed[i] && indegree[i] == 0).collect();
        if level.is_empty() {
            return Err(KilnError::new(KilnErrorKind::ConfigInvalid, "image dependency graph has a cycle"));
        }
        for &i in &level {
            placed[i] = true;
            placed_count += 1;
        }
        for &i in &level {
            for &dependent in &dependents[i] {
                indegree[dependent] -= 1;
            }
        }
        levels.push(level);
    }

    Ok(levels)
}

/// Images at level 0 and below that `specs[index]` (a `Stapel` image)
/// declares a dependency on, keyed by name — used to resolve
/// `image_digests` for [`kiln_stapel::build_stages`] without re-deriving
/// the edge list computed by [`dependency_levels`].
pub fn declared_dependency_names(spec: &ImageSpec) -> Vec<&str> {
    match &spec.decl {
        ImageDecl::Stapel(decl) => decl.dependencies.iter().map(|d| d.image_name.as_str()).collect(),
        ImageDecl::Dockerfile { .. } => Vec::new(),
    }
}

/// Carries each image's resolved content signature forward for
/// [`kiln_stapel::build_stages`]'s `image_digests` lookup, keyed by image
/// name and recorded only once an image's own stages have been pre-signed.
pub type ImageDigests = BTreeMap<String, String>;
