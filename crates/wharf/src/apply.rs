//! Commit step: push the mirror's module pins into the real workspace,
//! materialize imported modules, and write the package patches to disk.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use tracing::info;
use walkdir::WalkDir;
use wharf_core::port::output::{FilePatch, ModulePin, Output, PackagePatch};
use wharf_core::tags::{self, Target};
use wharf_core::toolchain::{GoToolchain, Toolchain};

use crate::edit;

pub struct CommitRequest<'a> {
    pub out: &'a Output,
    pub gowork: &'a Path,
    pub mirror: &'a Path,
    pub cache: &'a Path,
    pub import_dir: &'a Path,
    pub target: &'a Target,
    pub force: bool,
}

pub fn commit(req: CommitRequest<'_>) -> Result<()> {
    // Keep the user's workspace file recoverable, then promote the mirror.
    let backup = req.gowork.with_extension("work.backup");
    std::fs::copy(req.gowork, &backup)
        .with_context(|| format!("unable to back up workspace to {}", backup.display()))?;
    std::fs::copy(req.mirror, req.gowork)
        .with_context(|| format!("unable to update workspace {}", req.gowork.display()))?;
    info!("created workspace backup: {}", backup.display());

    let mut tool = GoToolchain::new(req.cache.to_path_buf());
    tool.set_workspace(req.gowork.to_path_buf());

    for pin in &req.out.modules {
        if pin.imported {
            apply_pin(&mut tool, pin, req.import_dir, req.force)?;
        }
    }

    for patch in &req.out.packages {
        if patch.error.is_empty() && !patch.files.is_empty() {
            apply_patch(&req, patch)?;
        }
    }

    tool.mod_tidy().ok();
    Ok(())
}

/// Copy an imported module's source into the workspace and register the
/// copy as the module's provider.
fn apply_pin(
    tool: &mut GoToolchain,
    pin: &ModulePin,
    import_dir: &Path,
    force: bool,
) -> Result<()> {
    let base = pin.path.rsplit('/').next().unwrap_or(&pin.path);
    let dest = import_dir.join(base);
    if dest.exists() {
        if !force {
            anyhow::bail!(
                "import destination {} already exists (use --force to overwrite)",
                dest.display()
            );
        }
        std::fs::remove_dir_all(&dest)
            .with_context(|| format!("clear import destination {}", dest.display()))?;
    }
    if pin.dir.is_empty() {
        anyhow::bail!("module {} has no source directory to import from", pin.path);
    }
    copy_dir(Path::new(&pin.dir), &dest)?;
    info!("imported module {} into {}", pin.path, dest.display());

    tool.work_edit_drop_replace(&pin.path)?;
    if !dest.join("go.mod").exists() {
        tool.mod_init(&dest, &pin.path)?;
    }
    tool.work_use(&dest)?;
    Ok(())
}

fn copy_dir(src: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.with_context(|| format!("walk module source {}", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir yields paths under its root");
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("create dir {}", target.display()))?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create dir {}", parent.display()))?;
            }
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("copy {} to {}", entry.path().display(), target.display()))?;
        }
    }
    Ok(())
}

fn apply_patch(req: &CommitRequest<'_>, patch: &PackagePatch) -> Result<()> {
    // Packages inside imported modules are patched in their workspace copy,
    // never in the module cache.
    let module_pin = req.out.modules.iter().find(|m| m.path == patch.module);
    let dir = resolve_patch_dir(patch, module_pin, req.import_dir)?;

    for file in &patch.files {
        if !file.base_file.is_empty() {
            apply_derived_file(req, patch, file, &dir)?;
        } else if file.build {
            apply_tag(req.target, &req.target.goos, "||", file, &dir)?;
        } else {
            apply_tag(req.target, &format!("!{}", req.target.goos), "&&", file, &dir)?;
        }
    }
    Ok(())
}

fn resolve_patch_dir(
    patch: &PackagePatch,
    module_pin: Option<&ModulePin>,
    import_dir: &Path,
) -> Result<PathBuf> {
    let Some(pin) = module_pin.filter(|pin| pin.imported) else {
        return Ok(PathBuf::from(&patch.dir));
    };
    let rel = Path::new(&patch.dir)
        .strip_prefix(&pin.dir)
        .with_context(|| {
            format!(
                "package dir {} is outside imported module {}",
                patch.dir, pin.dir
            )
        })?;
    let base = pin.path.rsplit('/').next().unwrap_or(&pin.path);
    Ok(import_dir.join(base).join(rel))
}

/// Copy a derived file out of the run cache and stamp it with the target-OS
/// build line.
fn apply_derived_file(
    req: &CommitRequest<'_>,
    patch: &PackagePatch,
    file: &FilePatch,
    dir: &Path,
) -> Result<()> {
    let cached = req.cache.join(&patch.path).join(&file.base_file);
    let src = std::fs::read_to_string(&cached)
        .with_context(|| format!("read derived file {}", cached.display()))?;
    let notice = format!("wharf: derived from {}", file.base_file);
    let patched = edit::append_build_tag(&src, &req.target.goos, "", &notice);
    let dest = dir.join(&file.name);
    std::fs::write(&dest, patched)
        .with_context(|| format!("write derived file {}", dest.display()))?;
    Ok(())
}

fn apply_tag(target: &Target, tag: &str, op: &str, file: &FilePatch, dir: &Path) -> Result<()> {
    let path = dir.join(&file.name);
    let src = std::fs::read_to_string(&path)
        .with_context(|| format!("read source file {}", path.display()))?;
    let notice = format!("wharf: added build tag '{tag}'");
    let patched = edit::append_build_tag(&src, tag, op, &notice);

    // A file whose name carries a GOOS suffix cannot simply grow an OR'd
    // tag; the name keeps excluding it on the target. Write the amended
    // copy under a target-OS name instead.
    let dest = match tags::parse_file_name(&file.name, target) {
        Some(Some(_)) if !tag.starts_with('!') => {
            let stem = file.name.strip_suffix(".go").unwrap_or(&file.name);
            dir.join(format!("{stem}_{}.go", target.goos))
        }
        _ => path,
    };
    std::fs::write(&dest, patched)
        .with_context(|| format!("write source file {}", dest.display()))?;
    Ok(())
}
