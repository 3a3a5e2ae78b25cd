use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context as _, Result};
use clap::Parser;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use wharf_core::catalog::InlineCatalog;
use wharf_core::config::Config;
use wharf_core::port::Context;
use wharf_core::toolchain::{GoToolchain, Toolchain};

mod apply;
mod edit;

#[derive(Parser, Debug)]
#[command(name = "wharf")]
#[command(version)]
#[command(about = "Port a Go workspace and its dependencies to another operating system.")]
struct Cli {
    /// Comma-separated list of extra build tags considered satisfied.
    #[arg(long, value_name = "TAGS")]
    tags: Option<String>,

    /// Compute and print suggestions without applying anything.
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Verbose progress output.
    #[arg(short, long)]
    verbose: bool,

    /// Inline catalog (YAML) merged over the built-in one.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Directory imported modules are materialized into.
    #[arg(long, value_name = "DIR")]
    import_dir: Option<PathBuf>,

    /// Overwrite an existing import directory entry.
    #[arg(short, long)]
    force: bool,

    /// Apply the computed pins and patches to the workspace.
    #[arg(long)]
    commit: bool,

    /// Package paths to port.
    #[arg(value_name = "PACKAGE", required = true)]
    paths: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("wharf: {err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Workspace mirror and cache, removed on every exit path. The mirror is
/// kept (and its location reported) when a commit failed half-way.
struct RunGuard {
    mirror: PathBuf,
    cache: PathBuf,
    keep_mirror: bool,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_dir_all(&self.cache) {
            if err.kind() != std::io::ErrorKind::NotFound {
                eprintln!("unable to remove cache {}: {err}", self.cache.display());
            }
        }
        let sum = self.mirror.with_extension("work.sum");
        if let Err(err) = std::fs::remove_file(&sum) {
            if err.kind() != std::io::ErrorKind::NotFound {
                eprintln!("unable to remove {}: {err}", sum.display());
            }
        }
        if !self.keep_mirror {
            if let Err(err) = std::fs::remove_file(&self.mirror) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    eprintln!("unable to remove {}: {err}", self.mirror.display());
                }
            }
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let mut boot = GoToolchain::new(std::env::temp_dir());
    let goenv = boot
        .go_env()
        .context("unable to inspect the Go environment (cannot execute 'go env')")?;

    let gowork = goenv.get("GOWORK").cloned().unwrap_or_default();
    if gowork.is_empty() {
        anyhow::bail!("no workspace found; initialize one with 'go work init' and add modules");
    }
    let gowork = PathBuf::from(gowork);
    let workdir = gowork
        .parent()
        .context("workspace file has no parent directory")?
        .to_path_buf();

    // A private mirror of the workspace file takes all edits; the real one
    // is only touched on commit.
    let mirror = workdir.join(".wharf.work");
    std::fs::copy(&gowork, &mirror).with_context(|| {
        format!("unable to create temporary workspace: {}", mirror.display())
    })?;

    let cache = workdir.join(".wharf_cache");
    std::fs::create_dir_all(&cache)
        .with_context(|| format!("unable to create cache at {}", cache.display()))?;

    let mut guard = RunGuard {
        mirror: mirror.clone(),
        cache: cache.clone(),
        keep_mirror: false,
    };

    let import_dir = cli
        .import_dir
        .clone()
        .unwrap_or_else(|| workdir.join("wharf_port"));

    let extra_tags = cli
        .tags
        .as_deref()
        .unwrap_or("")
        .split(',')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect::<Vec<_>>();

    let mut catalog = InlineCatalog::builtin();
    if let Some(path) = &cli.config {
        catalog
            .load_overrides(path)
            .context("unable to load inline catalog")?;
    }

    let cfg = Config::new(&goenv, extra_tags, cache.clone(), import_dir.clone());
    let target = cfg.target.clone();

    let mut tool = GoToolchain::new(cache.clone());
    tool.set_workspace(mirror.clone());

    let mut ctx = Context::new(cfg, catalog, Box::new(tool));
    let out = ctx.run(&cli.paths)?;

    println!("{}", out.to_json());

    if cli.commit && !cli.dry_run {
        let applied = apply::commit(apply::CommitRequest {
            out: &out,
            gowork: &gowork,
            mirror: &mirror,
            cache: &cache,
            import_dir: &import_dir,
            target: &target,
            force: cli.force,
        });
        if let Err(err) = applied {
            guard.keep_mirror = true;
            warn!("commit failed; edited workspace kept at {}", mirror.display());
            return Err(err);
        }
    }

    Ok(ExitCode::SUCCESS)
}
