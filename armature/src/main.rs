mod output;

use anyhow::{Context, Result};
use armature_core::{Cache, Environments, GitRepo};
use clap::{Parser, Subcommand};
use output::{DeployOutput, EnvironmentsOutput, GcOutput, OutputWriter, UpdateOutput};
use std::path::{Path, PathBuf};
use tracing::info;

/// Armature - deploy Puppet environments from a shared checkout cache
#[derive(Parser)]
#[command(name = "armature")]
#[command(about = "Deploy Puppet environments from git and forge repositories", long_about = None)]
#[command(version)]
struct Cli {
    /// Cache directory
    #[arg(long, global = true, env = "ARMATURE_CACHE", default_value = "./armature-cache")]
    cache: PathBuf,

    /// Directory environments are published into
    #[arg(long, global = true, env = "ARMATURE_ENVIRONMENTS")]
    environments: Option<PathBuf>,

    /// Output results as JSON
    #[arg(long, global = true, env = "ARMATURE_JSON")]
    json: bool,

    /// Increase log verbosity (-v debug, -vv trace); RUST_LOG overrides it
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy references of a control repository as environments
    Deploy {
        /// URL of the control repository
        control: String,

        /// Branches, tags or commit ids to deploy
        refs: Vec<String>,

        /// Deploy every branch and remove environments whose branch is gone
        #[arg(long, conflicts_with_all = ["refs", "name"])]
        all: bool,

        /// Environment name to publish a single reference under
        #[arg(long)]
        name: Option<String>,

        /// Replace invalid characters in environment names with `_`
        #[arg(long)]
        sanitize_names: bool,
    },

    /// Re-resolve every cached branch and move its reference
    Update,

    /// Remove cache entries no environment references
    Gc {
        /// Report what would be removed without removing it
        #[arg(long)]
        dry_run: bool,
    },

    /// List published environments
    Environments,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let writer = OutputWriter::new(cli.json);
    if let Err(error) = run(&cli, &writer) {
        writer.write_error(&error, 1);
        std::process::exit(1);
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("armature={level},armature_core={level}").into());
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn run(cli: &Cli, writer: &OutputWriter) -> Result<()> {
    let cache = Cache::open(&cli.cache)
        .with_context(|| format!("Failed to open cache at {}", cli.cache.display()))?;

    match &cli.command {
        Commands::Deploy {
            control,
            refs,
            all,
            name,
            sanitize_names,
        } => cmd_deploy(
            &cache,
            environments_dir(cli)?,
            control,
            refs,
            *all,
            name.as_deref(),
            *sanitize_names,
            writer,
        ),
        Commands::Update => cmd_update(&cache, writer),
        Commands::Gc { dry_run } => cmd_gc(&cache, environments_dir(cli)?, *dry_run, writer),
        Commands::Environments => cmd_environments(&cache, environments_dir(cli)?, writer),
    }
}

fn environments_dir(cli: &Cli) -> Result<&Path> {
    cli.environments
        .as_deref()
        .context("No environments directory (use --environments or ARMATURE_ENVIRONMENTS)")
}

#[allow(clippy::too_many_arguments)]
fn cmd_deploy(
    cache: &Cache,
    environments_path: &Path,
    control_url: &str,
    refs: &[String],
    all: bool,
    name: Option<&str>,
    sanitize_names: bool,
    writer: &OutputWriter,
) -> Result<()> {
    if !all && refs.is_empty() {
        anyhow::bail!("Nothing to deploy: give one or more references, or --all");
    }
    if name.is_some() && refs.len() != 1 {
        anyhow::bail!("--name needs exactly one reference");
    }

    let environments = Environments::open(environments_path, cache)
        .with_context(|| format!("Failed to open environments at {}", environments_path.display()))?
        .sanitize_names(sanitize_names);
    let control = GitRepo::from_url(cache, control_url)
        .with_context(|| format!("Failed to open control repository {control_url}"))?;

    let deployments = if all {
        let git = control
            .as_git()
            .context("Control repository is not a git repository")?;
        environments
            .deploy_branches(git)
            .with_context(|| format!("Failed to deploy branches of {control_url}"))?
    } else {
        let mut deployments = Vec::with_capacity(refs.len());
        for reference in refs {
            let deployment = environments
                .check_out_ref(control.as_ref(), reference, name)
                .with_context(|| format!("Failed to deploy {reference} of {control_url}"))?;
            deployments.push(deployment);
        }
        deployments
    };
    info!(count = deployments.len(), "deploy finished");

    let output = DeployOutput {
        success: true,
        result_code: 0,
        control: control_url.to_string(),
        deployments,
    };
    writer.write(&output, || output.render())
}

fn cmd_update(cache: &Cache, writer: &OutputWriter) -> Result<()> {
    let refs_updated = cache
        .update_mutable_refs()
        .context("Failed to update mutable references")?;

    let output = UpdateOutput {
        success: true,
        result_code: 0,
        refs_updated,
    };
    writer.write(&output, || format!("Updated {refs_updated} references\n"))
}

fn cmd_gc(
    cache: &Cache,
    environments_path: &Path,
    dry_run: bool,
    writer: &OutputWriter,
) -> Result<()> {
    let stats = cache
        .garbage_collect(environments_path, dry_run)
        .context("Failed to run garbage collection")?;

    let output = GcOutput {
        success: true,
        result_code: 0,
        dry_run,
        stats,
    };
    writer.write(&output, || output.render())
}

fn cmd_environments(cache: &Cache, environments_path: &Path, writer: &OutputWriter) -> Result<()> {
    let environments = Environments::open(environments_path, cache)
        .with_context(|| format!("Failed to open environments at {}", environments_path.display()))?
        .names()
        .context("Failed to list environments")?;

    let output = EnvironmentsOutput {
        success: true,
        result_code: 0,
        environments,
    };
    writer.write(&output, || {
        if output.environments.is_empty() {
            "No environments\n".to_string()
        } else {
            output.environments.iter().map(|name| format!("{name}\n")).collect()
        }
    })
}
