//! Build-context file matching and VCS-aware content digesting.
//!
//! VCS partitioning shells out to the `git` CLI rather than binding
//! `libgit2` — a repo this small doesn't need a git implementation
//! in-process, just three `git ls-files` invocations.

use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use kiln_hash::Digest256;
use kiln_types::{KilnError, KilnErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    Regular,
    Symlink,
    Dir,
}

#[derive(Debug, Clone)]
pub struct PathMetadata {
    pub mode: u32,
    pub kind: PathKind,
    pub link_target: Option<String>,
    pub content_digest: Option<Digest256>,
}

impl PathMetadata {
    /// The string fed into the dependency vector for this path: the
    /// content digest for regular files, the raw target for symlinks
    /// (never the followed content), and a fixed marker for directories.
    pub fn contribution(&self) -> String {
        match self.kind {
            PathKind::Regular => self.content_digest.map(|d| d.to_string()).unwrap_or_default(),
            PathKind::Symlink => self.link_target.clone().unwrap_or_default(),
            PathKind::Dir => "dir".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VcsPartitions {
    pub tracked: BTreeSet<PathBuf>,
    pub worktree_modified_or_untracked: BTreeSet<PathBuf>,
    pub ignored_but_referenced: BTreeSet<PathBuf>,
}

/// Matches files under one build context root and memoizes matches and
/// metadata lookups for the lifetime of one invocation.
pub struct SourceIndex {
    context_root: PathBuf,
    metadata_cache: Mutex<std::collections::HashMap<PathBuf, PathMetadata>>,
    vcs_cache: Mutex<Option<GitRepoFiles>>,
}

#[derive(Clone)]
struct GitRepoFiles {
    tracked: BTreeSet<PathBuf>,
    untracked_not_ignored: BTreeSet<PathBuf>,
    ignored: BTreeSet<PathBuf>,
}

impl SourceIndex {
    pub fn new(context_root: impl Into<PathBuf>) -> Self {
        Self {
            context_root: context_root.into(),
            metadata_cache: Mutex::new(std::collections::HashMap::new()),
            vcs_cache: Mutex::new(None),
        }
    }

    pub fn context_root(&self) -> &Path {
        &self.context_root
    }

    /// Expand `wildcards` (relative or absolute, the latter normalized
    /// against the context root) into project-relative paths, excluding
    /// anything matching `ignore_rules` and anything that resolves outside
    /// the context root.
    pub fn match_files(&self, wildcards: &[String], ignore_rules: &[String]) -> Result<Vec<PathBuf>, KilnError> {
        let mut matched = BTreeSet::new();
        for wildcard in wildcards {
            let normalized = self.normalize_wildcard(wildcard);
            let pattern = self.context_root.join(&normalized);
            let pattern_str = pattern.to_string_lossy().into_owned();
            let entries = glob::glob(&pattern_str)
                .map_err(|e| KilnError::new(KilnErrorKind::SourceReadError, format!("invalid wildcard {wildcard:?}: {e}")))?;
            for entry in entries {
                let path = match entry {
                    Ok(p) => p,
                    Err(e) => {
                        return Err(KilnError::new(
                            KilnErrorKind::SourceReadError,
                            format!("failed to read match for {wildcard:?}: {e}"),
                        ));
                    }
                };
                if let Some(relative) = self.relative_within_context(&path) {
                    matched.insert(relative);
                }
                // Paths traversing outside the build context are silently
                // filtered; the caller is expected to log the rejection.
            }
        }

        if !ignore_rules.is_empty() {
            matched.retain(|path| !ignore_rules.iter().any(|rule| path_matches_rule(path, rule)));
        }

        Ok(matched.into_iter().collect())
    }

    fn normalize_wildcard(&self, wildcard: &str) -> PathBuf {
        let path = Path::new(wildcard);
        if path.is_absolute() {
            path.strip_prefix("/").unwrap_or(path).to_path_buf()
        } else {
            path.to_path_buf()
        }
    }

    fn relative_within_context(&self, path: &Path) -> Option<PathBuf> {
        let relative = path.strip_prefix(&self.context_root).ok()?.to_path_buf();
        if relative.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
            return None;
        }
        Some(relative)
    }

    /// Metadata for one project-relative path. A missing path is the
    /// caller's concern — its dependency contribution is simply empty, not
    /// an error; this method only fails with `source-read-error` when the
    /// path exists but its metadata cannot be read.
    pub fn metadata(&self, relative_path: &Path) -> Result<Option<PathMetadata>, KilnError> {
        if let Some(cached) = self.metadata_cache.lock().expect("source index metadata cache poisoned").get(relative_path) {
            return Ok(Some(cached.clone()));
        }

        let full_path = self.context_root.join(relative_path);
        let symlink_meta = match fs::symlink_metadata(&full_path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(KilnError::new(
                    KilnErrorKind::SourceReadError,
                    format!("failed to stat {}: {e}", full_path.display()),
                ));
            }
        };

        let metadata = if symlink_meta.file_type().is_symlink() {
            let target = fs::read_link(&full_path)
                .map_err(|e| KilnError::new(KilnErrorKind::SourceReadError, format!("failed to read symlink {}: {e}", full_path.display())))?;
            PathMetadata {
                mode: symlink_meta.mode(),
                kind: PathKind::Symlink,
                link_target: Some(target.to_string_lossy().into_owned()),
                content_digest: None,
            }
        } else if symlink_meta.is_dir() {
            PathMetadata { mode: symlink_meta.mode(), kind: PathKind::Dir, link_target: None, content_digest: None }
        } else {
            let bytes = fs::read(&full_path)
                .map_err(|e| KilnError::new(KilnErrorKind::SourceReadError, format!("failed to read {}: {e}", full_path.display())))?;
            PathMetadata {
                mode: symlink_meta.mode(),
                kind: PathKind::Regular,
                link_target: None,
                content_digest: Some(kiln_hash::hash([bytes_as_str(&bytes)])),
            }
        };

        self.metadata_cache
            .lock()
            .expect("source index metadata cache poisoned")
            .insert(relative_path.to_path_buf(), metadata.clone());
        Ok(Some(metadata))
    }

    /// Hash the set of `referenced` paths that exist and are readable;
    /// missing paths contribute nothing. Order is the sorted path order so
    /// the result is independent of caller iteration order.
    pub fn digest_referenced(&self, referenced: &[PathBuf]) -> Result<Digest256, KilnError> {
        let mut sorted: Vec<&PathBuf> = referenced.iter().collect();
        sorted.sort();
        let mut parts = Vec::new();
        for path in sorted {
            parts.push(path.to_string_lossy().into_owned());
            if let Some(meta) = self.metadata(path)? {
                parts.push(meta.contribution());
            }
        }
        Ok(kiln_hash::hash(parts))
    }

    fn load_git_files(&self) -> Option<GitRepoFiles> {
        {
            let cache = self.vcs_cache.lock().expect("source index vcs cache poisoned");
            if let Some(cached) = cache.as_ref() {
                return Some(cached.clone());
            }
        }

        if !self.context_root.join(".git").exists() && !self.is_inside_git_work_tree() {
            return None;
        }

        let tracked = git_lines(&self.context_root, &["ls-files"]);
        let untracked_not_ignored = git_lines(&self.context_root, &["ls-files", "--others", "--exclude-standard"]);
        let ignored = git_lines(&self.context_root, &["ls-files", "--others", "--ignored", "--exclude-standard"]);

        let (tracked, untracked_not_ignored, ignored) = match (tracked, untracked_not_ignored, ignored) {
            (Some(t), Some(u), Some(i)) => (t, u, i),
            _ => return None,
        };

        let files = GitRepoFiles {
            tracked: tracked.into_iter().map(PathBuf::from).collect(),
            untracked_not_ignored: untracked_not_ignored.into_iter().map(PathBuf::from).collect(),
            ignored: ignored.into_iter().map(PathBuf::from).collect(),
        };
        *self.vcs_cache.lock().expect("source index vcs cache poisoned") = Some(files.clone());
        Some(files)
    }

    fn is_inside_git_work_tree(&self) -> bool {
        Command::new("git")
            .args(["rev-parse", "--is-inside-work-tree"])
            .current_dir(&self.context_root)
            .output()
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Partition `referenced` paths into the three disjoint VCS buckets.
    /// Returns `None` if no VCS repository is present at the context root
    /// — callers should fall back to treating every path as untracked in
    /// that case.
    pub fn vcs_partitions(&self, referenced: &[PathBuf]) -> Option<VcsPartitions> {
        let files = self.load_git_files()?;
        let referenced: BTreeSet<PathBuf> = referenced.iter().cloned().collect();

        let tracked = referenced.intersection(&files.tracked).cloned().collect();
        let worktree_modified_or_untracked =
            referenced.intersection(&files.untracked_not_ignored).cloned().collect();
        let ignored_but_referenced = referenced.intersection(&files.ignored).cloned().collect();

        Some(VcsPartitions { tracked, worktree_modified_or_untracked, ignored_but_referenced })
    }
}

fn bytes_as_str(bytes: &[u8]) -> String {
    // The hasher operates on `AsRef<str>`; bytes are hashed through a
    // lossless hex encoding so no byte sequence is misrepresented as UTF-8.
    hex::encode(bytes)
}

fn path_matches_rule(path: &Path, rule: &str) -> bool {
    let path_str = path.to_string_lossy();
    glob::Pattern::new(rule).map(|p| p.matches(&path_str)).unwrap_or(false)
}

fn git_lines(repo_root: &Path, args: &[&str]) -> Option<Vec<String>> {
    let output = Command::new("git").args(args).current_dir(repo_root).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| l.to_string())
            .filter(|l| !l.is_empty())
            .collect(),
    )
}
