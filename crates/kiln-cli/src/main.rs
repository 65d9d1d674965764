use std::fs;
use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use kiln::{BuildConfig, ImageSpec, RegistryConfig};
use kiln_publish::PublishOptions;

/// A minimal CLI over the `kiln` facade (not a config/recipe front-end —
/// one Dockerfile image per invocation, declared entirely on the command
/// line).
#[derive(Parser, Debug)]
#[command(name = "kiln", version)]
#[command(about = "Build, cache, and publish one container image")]
struct Cli {
    /// Project name stages and managed-image records are scoped under.
    #[arg(long)]
    project: String,

    /// Directory kiln persists stage metadata and build contexts under.
    #[arg(long, default_value = ".kiln")]
    state_dir: PathBuf,

    /// Directory the Dockerfile's `COPY`/`ADD` instructions resolve against.
    #[arg(long, default_value = ".")]
    context: PathBuf,

    /// Path to the Dockerfile to build.
    #[arg(long, default_value = "Dockerfile")]
    dockerfile: PathBuf,

    /// Name for the built image.
    #[arg(long)]
    image: String,

    /// Build the image for internal use only; never published.
    #[arg(long)]
    artifact: bool,

    /// Registry base URL. Required to publish.
    #[arg(long)]
    registry: Option<String>,

    /// Repository path publish targets (e.g. `myorg/myapp`).
    #[arg(long)]
    repo: Option<String>,

    /// How many sibling images build concurrently.
    #[arg(long, default_value_t = 4)]
    max_concurrent: usize,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build (and cache) the declared image.
    Build,
    /// Build the declared image, then publish it under its stages-signature tag.
    Publish,
    /// Print environment and tool diagnostics.
    Doctor,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.cmd {
        Commands::Build => run_build(&cli, false),
        Commands::Publish => run_build(&cli, true),
        Commands::Doctor => run_doctor(),
    }
}

fn run_build(cli: &Cli, publish: bool) -> Result<()> {
    let dockerfile_content = fs::read_to_string(&cli.dockerfile).with_context(|| format!("failed to read {}", cli.dockerfile.display()))?;

    let spec = ImageSpec::dockerfile(cli.image.clone(), cli.artifact, dockerfile_content, cli.context.clone());

    let mut config = BuildConfig::new(cli.project.clone(), cli.state_dir.clone(), cli.context.clone(), vec![spec]);
    config.max_concurrent = cli.max_concurrent.max(1);

    if let Some(base_url) = &cli.registry {
        let repo_base = cli.repo.clone().with_context(|| "--repo is required when --registry is set")?;
        config.registry = Some(RegistryConfig { base_url: base_url.clone(), repo_base });
    }

    if publish {
        let options = PublishOptions { tag_by_stages_signature: true, ..Default::default() };
        config.publish = Some(options);
    }

    let outcome = kiln::run_build(config)?;

    for image in &outcome.images {
        let signature = image.content_signature().map(|s| s.to_string()).unwrap_or_else(|| "unsigned".to_string());
        println!("{}: {signature}", image.log_name());
    }

    if let Some(report) = &outcome.publish_report {
        for (name, entry) in report.iter() {
            println!("published {name}: {}:{} ({:?})", entry.repo, entry.tag, entry.tag_strategy);
        }
    }

    Ok(())
}

fn run_doctor() -> Result<()> {
    print_cmd_version("docker");
    print_cmd_version("git");
    Ok(())
}

fn print_cmd_version(cmd: &str) {
    match Command::new(cmd).arg("--version").output() {
        Ok(out) if out.status.success() => println!("{cmd}: {}", String::from_utf8_lossy(&out.stdout).trim()),
        Ok(out) => eprintln!("[warn] {cmd} --version failed: {}", String::from_utf8_lossy(&out.stderr).trim()),
        Err(e) => eprintln!("[warn] unable to run {cmd} --version: {e}"),
    }
}
