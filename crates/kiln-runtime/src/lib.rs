//! Container runtime driver interface for kiln.
//!
//! The core never talks to a container engine directly; it calls through
//! [`RuntimeDriver`]. [`DockerCliDriver`] is the default implementation,
//! shelling out to the `docker` CLI the same way a subprocess-driving
//! wrapper shells out to any other external command-line tool.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use kiln_types::{KilnError, KilnErrorKind};
use serde::{Deserialize, Serialize};

/// What `inspect` returns: enough of an image's config to resolve ONBUILD
/// inheritance and label checks without depending on the registry's own
/// config-file type (this one reflects what a *local* runtime can report,
/// which needn't match what's published).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manifest {
    pub labels: BTreeMap<String, String>,
    pub on_build: Vec<String>,
    pub parent: Option<String>,
}

/// Arguments to a Dockerfile-stage build.
#[derive(Debug, Clone)]
pub struct DockerfileBuildArgs {
    pub dockerfile_path: PathBuf,
    pub context_dir: PathBuf,
    pub build_args: BTreeMap<String, String>,
    pub target: Option<String>,
}

/// One command executed against a running container, for `commit`.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub base_image: String,
    pub commands: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

/// Thin adapter to a container runtime for build/commit/push/pull/inspect.
/// The core only ever consumes this interface.
pub trait RuntimeDriver {
    fn inspect(&self, name: &str) -> Result<Option<Manifest>, KilnError>;
    fn pull(&self, name: &str) -> Result<(), KilnError>;
    fn push(&self, name: &str) -> Result<(), KilnError>;
    fn build(&self, args: &DockerfileBuildArgs) -> Result<String, KilnError>;
    fn commit(&self, config: &ContainerConfig) -> Result<String, KilnError>;
    fn tag(&self, local_id: &str, name: &str) -> Result<(), KilnError>;
    fn untag(&self, name: &str) -> Result<(), KilnError>;
    fn exists(&self, name: &str) -> Result<bool, KilnError>;
}

struct CommandResult {
    success: bool,
    stdout: String,
    stderr: String,
}

fn run(program: &str, args: &[&str]) -> Result<CommandResult, KilnError> {
    let output = Command::new(program).args(args).output().map_err(|e| KilnError::new(KilnErrorKind::RuntimeError, format!("failed to run {program} {args:?}: {e}")))?;
    Ok(CommandResult { success: output.status.success(), stdout: String::from_utf8_lossy(&output.stdout).into_owned(), stderr: String::from_utf8_lossy(&output.stderr).into_owned() })
}

fn run_ok(program: &str, args: &[&str]) -> Result<CommandResult, KilnError> {
    let result = run(program, args)?;
    if !result.success {
        return Err(KilnError::new(KilnErrorKind::RuntimeError, format!("{program} {args:?} failed: {}", result.stderr.trim())));
    }
    Ok(result)
}

/// `docker inspect`'s shape, trimmed to the fields [`Manifest`] needs.
#[derive(Deserialize)]
struct DockerInspectEntry {
    #[serde(rename = "Config")]
    config: DockerInspectConfig,
    #[serde(rename = "Parent", default)]
    parent: Option<String>,
}

#[derive(Deserialize, Default)]
struct DockerInspectConfig {
    #[serde(rename = "Labels", default)]
    labels: Option<BTreeMap<String, String>>,
    #[serde(rename = "OnBuild", default)]
    on_build: Option<Vec<String>>,
}

fn parse_inspect(stdout: &str) -> Result<Option<Manifest>, KilnError> {
    let entries: Vec<DockerInspectEntry> = serde_json::from_str(stdout).map_err(|e| KilnError::new(KilnErrorKind::RuntimeError, format!("malformed docker inspect output: {e}")))?;
    Ok(entries.into_iter().next().map(|entry| Manifest {
        labels: entry.config.labels.unwrap_or_default(),
        on_build: entry.config.on_build.unwrap_or_default(),
        parent: entry.parent,
    }))
}

/// Default [`RuntimeDriver`], shelling out to a `docker` binary on `PATH`.
pub struct DockerCliDriver {
    binary: String,
}

impl Default for DockerCliDriver {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCliDriver {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    fn build_tar_args<'a>(&self, args: &'a DockerfileBuildArgs, build_arg_strings: &'a [String]) -> Vec<&'a str> {
        let mut cmd = vec!["build", "-q", "-f"];
        cmd.push(args.dockerfile_path.to_str().unwrap_or_default());
        if let Some(target) = &args.target {
            cmd.push("--target");
            cmd.push(target);
        }
        for s in build_arg_strings {
            cmd.push("--build-arg");
            cmd.push(s);
        }
        cmd.push(args.context_dir.to_str().unwrap_or_default());
        cmd
    }
}

impl RuntimeDriver for DockerCliDriver {
    fn inspect(&self, name: &str) -> Result<Option<Manifest>, KilnError> {
        let result = run(&self.binary, &["inspect", name])?;
        if !result.success {
            return Ok(None);
        }
        parse_inspect(&result.stdout)
    }

    fn pull(&self, name: &str) -> Result<(), KilnError> {
        run_ok(&self.binary, &["pull", name]).map(|_| ())
    }

    fn push(&self, name: &str) -> Result<(), KilnError> {
        run_ok(&self.binary, &["push", name]).map(|_| ())
    }

    fn build(&self, args: &DockerfileBuildArgs) -> Result<String, KilnError> {
        let build_arg_strings: Vec<String> = args.build_args.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let cmd = self.build_tar_args(args, &build_arg_strings);
        let result = run_ok(&self.binary, &cmd)?;
        Ok(result.stdout.trim().to_string())
    }

    fn commit(&self, config: &ContainerConfig) -> Result<String, KilnError> {
        let create = run_ok(&self.binary, &["create", &config.base_image, "sleep", "infinity"])?;
        let container_id = create.stdout.trim().to_string();

        let cleanup = |binary: &str, container_id: &str| {
            let _ = run(binary, &["rm", "-f", container_id]);
        };

        if let Err(e) = run_ok(&self.binary, &["start", &container_id]) {
            cleanup(&self.binary, &container_id);
            return Err(e);
        }

        for command in &config.commands {
            if let Err(e) = run_ok(&self.binary, &["exec", &container_id, "sh", "-c", command]) {
                cleanup(&self.binary, &container_id);
                return Err(e);
            }
        }

        let mut commit_args = vec!["commit".to_string()];
        for (k, v) in &config.env {
            commit_args.push("--change".to_string());
            commit_args.push(format!("ENV {k}={v}"));
        }
        for (k, v) in &config.labels {
            commit_args.push("--change".to_string());
            commit_args.push(format!("LABEL {k}=\"{v}\""));
        }
        commit_args.push(container_id.clone());

        let commit_args_ref: Vec<&str> = commit_args.iter().map(String::as_str).collect();
        let result = run_ok(&self.binary, &commit_args_ref);
        cleanup(&self.binary, &container_id);
        Ok(result?.stdout.trim().to_string())
    }

    fn tag(&self, local_id: &str, name: &str) -> Result<(), KilnError> {
        run_ok(&self.binary, &["tag", local_id, name]).map(|_| ())
    }

    fn untag(&self, name: &str) -> Result<(), KilnError> {
        run_ok(&self.binary, &["rmi", name]).map(|_| ())
    }

    fn exists(&self, name: &str) -> Result<bool, KilnError> {
        Ok(run(&self.binary, &["image", "inspect", name])?.success)
    }
}

/// Where a [`DockerCliDriver`] caller should stage the build context
/// tarball it assembled from `SourceIndex`. Transient files live here and
/// are deleted on success.
pub fn workdir_build_context(workdir: &Path, image_name: &str) -> PathBuf {
    workdir.join(image_name).join("context")
}
