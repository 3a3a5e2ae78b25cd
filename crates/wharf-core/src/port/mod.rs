//! The patch engine: a per-package state machine walked leaves-first over
//! the level groups, with a workspace-wide pin coordinator.
//!
//! A pin change aborts the walk with a reload signal and the driver restarts
//! from the loader; each module pins at most twice (upgrade, then back to
//! the original), which bounds the reload count.

mod patch;
pub mod output;

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context as _, Result};
use tracing::{debug, info, warn};

use crate::catalog::InlineCatalog;
use crate::classify::{Classifier, ErrorClass, TypeError};
use crate::config::Config;
use crate::errors::PatchError;
use crate::pkgs::{is_exclude_all_error, load, resolve, ModId, PkgId, Registry};
use crate::port::output::Output;
use crate::toolchain::{CheckFile, CheckRequest, ImportView, Toolchain, TypeView};

/// Per-package state held by the engine.
#[derive(Debug, Clone, Default)]
pub struct Handle {
    /// Index of the selected candidate in `Pkg::builds`.
    pub build_idx: usize,
    /// Latest typed view, if the package has been checked.
    pub view: Option<TypeView>,
    pub errors: Vec<TypeError>,

    /// Type data is current for the selected candidate.
    pub built: bool,
    /// A parent flagged this package as contributing to its errors.
    pub incomplete: bool,
    pub included: bool,

    /// No remaining candidate can help; never porting this package.
    pub exhausted: bool,
    /// A non-default candidate validates.
    pub patched: bool,
    /// The default candidate validates.
    pub valid: bool,

    /// Recorded porting failure, reported in the output.
    pub failure: Option<PatchError>,
}

/// Pin state for one module.
#[derive(Debug, Clone, Default)]
pub struct VersionPin {
    /// Version chosen by module resolution before we intervened.
    pub version: String,
    /// Version the workspace is currently pinned to; empty until the module
    /// has been considered.
    pub pin_to: String,
    /// Module source must be materialized into the workspace for edits.
    pub imported: bool,
}

impl VersionPin {
    fn is_pinned(&self) -> bool {
        !self.pin_to.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    Continue,
    Skipped,
    Reload,
    Patched,
}

enum WalkSignal {
    Done,
    Reload,
}

/// Owner of all mutable porting state: the registry, the handle table, the
/// pin table, and the toolchain port.
pub struct Context {
    pub reg: Registry,
    pub cfg: Config,
    pub catalog: InlineCatalog,
    tool: Box<dyn Toolchain>,
    classifier: Classifier,
    handles: BTreeMap<PkgId, Handle>,
    pins: BTreeMap<String, VersionPin>,
    /// Set whenever a handle transitions during the current pass; a pass
    /// with no transitions is the walk's fixpoint.
    changed: bool,
}

impl Context {
    pub fn new(cfg: Config, catalog: InlineCatalog, tool: Box<dyn Toolchain>) -> Context {
        Context {
            reg: Registry::new(),
            cfg,
            catalog,
            tool,
            classifier: Classifier::new(),
            handles: BTreeMap::new(),
            pins: BTreeMap::new(),
            changed: false,
        }
    }

    pub fn handle(&self, id: PkgId) -> Option<&Handle> {
        self.handles.get(&id)
    }

    /// Drive the whole port: load, resolve, walk, and reload until the walk
    /// completes, then assemble the result.
    pub fn run(&mut self, paths: &[String]) -> Result<Output> {
        let mut loads = 0usize;
        loop {
            loads += 1;
            let roots = load::list(&mut self.reg, self.tool.as_mut(), &self.cfg, paths)?;
            let groups = resolve::resolve(&mut self.reg, &roots)?;
            self.refresh_groups(&groups)?;

            match self.walk(&groups)? {
                WalkSignal::Done => break,
                WalkSignal::Reload => {
                    // Each module pins at most twice, so reloads are bounded.
                    if loads > 2 * self.reg.module_count() + 2 {
                        anyhow::bail!("module pinning did not converge after {loads} reloads");
                    }
                    debug!(loads, "pin changed, reloading workspace");
                }
            }
        }
        Ok(self.assemble())
    }

    /// Refresh every handle in ascending level order and freeze the packages
    /// we must never touch.
    fn refresh_groups(&mut self, groups: &[Vec<PkgId>]) -> Result<()> {
        for group in groups {
            for &id in group {
                {
                    let pkg = self.reg.get(id);
                    if !pkg.first_load
                        && (pkg.meta.goroot || pkg.meta.standard)
                        && (pkg.dirty || pkg.dep_dirty)
                    {
                        anyhow::bail!(
                            "GOROOT package {} changed after first load",
                            pkg.import_path()
                        );
                    }
                }

                self.refresh(id)?;

                // golang.org/x modules the user already replaces are frozen;
                // a replace installed by our own pin coordinator is not.
                let pkg = self.reg.get(id);
                let frozen_x = pkg.is_golang_x()
                    && pkg
                        .module
                        .map(|mid| {
                            let module = self.reg.module(mid);
                            module.replace.is_some() && !self.pins.contains_key(&module.path)
                        })
                        .unwrap_or(false);
                if pkg.meta.goroot || pkg.meta.standard || frozen_x {
                    self.handle_mut(id).exhausted = true;
                }
            }
        }
        Ok(())
    }

    /// Bring a handle's type data up to date with its package's dirtiness.
    fn refresh(&mut self, id: PkgId) -> Result<()> {
        let (dirty, dep_dirty, included, deps_only, name, pkg_path) = {
            let pkg = self.reg.get(id);
            (
                pkg.dirty,
                pkg.dep_dirty,
                pkg.included,
                !pkg.included || pkg.is_stdlib(),
                pkg.meta.name.clone(),
                pkg.import_path().to_string(),
            )
        };

        let build_idx = {
            let handle = self.handle_mut(id);
            if handle.build_idx > 0 && dirty {
                anyhow::bail!("{pkg_path}: package with a selected candidate was marked dirty");
            }
            handle.incomplete = false;
            handle.included = handle.included || included;
            handle.build_idx
        };

        if dirty || dep_dirty {
            let no_files = self.reg.get(id).builds[build_idx].files.is_empty();
            if no_files {
                // Nothing to check; the package contributes an empty surface.
                let handle = self.handle_mut(id);
                handle.view = Some(TypeView::empty(&name));
                handle.errors.clear();
            } else {
                let (view, errors) = self.typecheck(id, build_idx, deps_only)?;
                let handle = self.handle_mut(id);
                handle.view = Some(view);
                handle.errors = errors;
            }
            self.handle_mut(id).built = true;
        }
        Ok(())
    }

    /// Repeat passes over the level groups (ascending, leaves first) until a
    /// pass changes nothing, so packages revisited after their dependents
    /// advanced get their turn.
    fn walk(&mut self, groups: &[Vec<PkgId>]) -> Result<WalkSignal> {
        let mut passes = 0usize;
        loop {
            passes += 1;
            if passes > 4 * self.reg.len() + 8 {
                anyhow::bail!("patch walk did not converge after {passes} passes");
            }

            self.changed = false;
            for group in groups {
                for &id in group {
                    if let StepResult::Reload = self.port_step(id)? {
                        return Ok(WalkSignal::Reload);
                    }
                }
            }
            if !self.changed {
                return Ok(WalkSignal::Done);
            }
        }
    }

    /// One state-machine step for one package.
    fn port_step(&mut self, id: PkgId) -> Result<StepResult> {
        let handle = self.handle_mut(id);
        if !handle.included || handle.exhausted {
            return Ok(StepResult::Skipped);
        }
        if handle.patched {
            if handle.incomplete {
                anyhow::bail!(
                    "{}: package already has a patch associated with it",
                    self.reg.get(id).import_path()
                );
            }
            return Ok(StepResult::Continue);
        }

        if !self.handle_mut(id).built {
            let build_idx = self.handles[&id].build_idx;
            let (view, errors) = self.typecheck(id, build_idx, false)?;
            let handle = self.handle_mut(id);
            handle.view = Some(view);
            handle.errors = errors;
            handle.built = true;
        }

        let handle = &self.handles[&id];
        if handle.errors.is_empty() && !handle.incomplete {
            if handle.build_idx > 0 {
                self.set_patched(id);
            } else {
                self.set_valid(id);
            }
            return Ok(StepResult::Continue);
        }

        // Module-version decisions come before any per-file surgery.
        let module = self.reg.get(id).module;
        let main_module = module
            .map(|mid| self.reg.module(mid).main)
            .unwrap_or(true);
        if !main_module {
            if let Some(mid) = module {
                if self.pin_module(mid)? {
                    return Ok(StepResult::Reload);
                }
            }
        }

        let base_idx = self.handles[&id].build_idx;
        let failure = self.port_package(id)?;

        if self.handles[&id].build_idx != base_idx {
            self.reg.get_mut(id).modified = true;
            self.mark_parents_stale(id);
            self.changed = true;
        }

        if let Some(failure) = failure {
            warn!(pkg = self.reg.get(id).import_path(), %failure, "package is unportable");
            let handle = self.handle_mut(id);
            handle.exhausted = true;
            handle.failure = Some(failure);
            self.changed = true;
            return Ok(StepResult::Continue);
        }

        if self.handles[&id].patched {
            if !main_module {
                if let Some(mid) = module {
                    self.mark_imported(mid);
                }
            }
            return Ok(StepResult::Patched);
        }

        Ok(StepResult::Continue)
    }

    /// Decide the workspace version for a module with errors: try an
    /// upgrade once, then pin back to the original. Returns true when the
    /// workspace changed and a reload is required.
    fn pin_module(&mut self, mid: ModId) -> Result<bool> {
        let module = self.reg.module(mid).clone();
        let pin = self.pins.get(&module.path).cloned().unwrap_or_default();

        let upgrade_failed = pin.is_pinned() && pin.pin_to != pin.version;
        if module.replace.is_none() || upgrade_failed {
            let mut pin_to = module.version.clone();

            if !pin.is_pinned() {
                match self.tool.mod_update_query(&module.path) {
                    Ok(version) if !version.is_empty() => pin_to = version,
                    Ok(_) => {}
                    Err(err) if is_exclude_all_error(&err.to_string()) => {}
                    Err(err) => return Err(err),
                }
            }

            self.tool.work_edit_replace(&module.path, &pin_to)?;

            let old_version = if pin.pin_to.is_empty() {
                module.version.clone()
            } else {
                pin.pin_to.clone()
            };
            self.pins.insert(
                module.path.clone(),
                VersionPin {
                    version: module.version.clone(),
                    pin_to: pin_to.clone(),
                    imported: pin.imported,
                },
            );

            if old_version != pin_to {
                info!(module = %module.path, from = %old_version, to = %pin_to, "pinned module");
                return Ok(true);
            }
        }

        Ok(false)
    }

    fn mark_imported(&mut self, mid: ModId) {
        let module = self.reg.module(mid);
        let entry = self
            .pins
            .entry(module.path.clone())
            .or_insert_with(|| VersionPin {
                version: module.version.clone(),
                ..VersionPin::default()
            });
        entry.imported = true;
    }

    /// The porting decision for one package with errors: retag, defer to
    /// dependency porting, or substitute symbols from the catalog.
    ///
    /// `Ok(Some(_))` is a per-package failure; the run continues with other
    /// roots. `Err(_)` aborts the run.
    fn port_package(&mut self, id: PkgId) -> Result<Option<PatchError>> {
        let pkg_path = self.reg.get(id).import_path().to_string();

        let mut need_tag = self.handles[&id].incomplete;
        self.handle_mut(id).incomplete = false;

        let mut imports: BTreeSet<PkgId> = BTreeSet::new();
        let mut ill: Vec<TypeError> = Vec::new();

        for err in self.handles[&id].errors.clone() {
            match &err.class {
                ErrorClass::BadImportName { pkg_name, .. } => {
                    let dep = self.lookup_error_import(id, pkg_name, &err.file)?;
                    if self.handle_mut(dep).exhausted {
                        need_tag = true;
                    } else {
                        imports.insert(dep);
                    }
                }
                ErrorClass::BadName(_) => need_tag = true,
                ErrorClass::Other => ill.push(err),
            }
        }

        // Never try porting a package with unclassifiable type errors.
        if !ill.is_empty() {
            let messages: Vec<&str> = ill.iter().map(|e| e.message.as_str()).collect();
            return Ok(Some(PatchError::new(
                &pkg_path,
                format!("unknown type error(s) occurred: {}", messages.join("; ")),
            )));
        }

        if !need_tag && imports.is_empty() {
            self.set_valid(id);
            return Ok(None);
        }

        // Retag phase: hunt for a later candidate whose only hard errors
        // are missing dependency symbols.
        let mut retagged = !need_tag;
        if need_tag {
            let total = self.reg.get(id).builds.len();
            let mut build = self.handles[&id].build_idx + 1;
            while build < total {
                let (view, errors) = self.typecheck(id, build, false)?;

                let mut candidate_imports: BTreeSet<PkgId> = BTreeSet::new();
                let mut satisfied = true;
                for err in &errors {
                    match &err.class {
                        ErrorClass::BadImportName { pkg_name, .. } => {
                            let dep = self.lookup_error_import(id, pkg_name, &err.file)?;
                            candidate_imports.insert(dep);
                        }
                        _ if !err.soft => {
                            satisfied = false;
                            break;
                        }
                        _ => {}
                    }
                }

                if satisfied {
                    let previous = self.snapshot(id);
                    {
                        let handle = self.handle_mut(id);
                        handle.build_idx = build;
                        handle.view = Some(view);
                        handle.errors = errors;
                    }
                    if self.validate(id)? {
                        imports = candidate_imports;
                        retagged = true;
                        break;
                    }
                    // A parent rejected this candidate through our surface.
                    self.restore(id, previous);
                }
                build += 1;
            }
        }

        if retagged && imports.is_empty() {
            self.set_patched(id);
            return Ok(None);
        }

        if retagged {
            // The chosen candidate still leans on dependency symbols; port
            // the dependencies first if any of them still can be.
            let mut can_port_imports = false;
            for &dep in &imports {
                let (patched, incomplete, included, exhausted) = {
                    let handle = self.handle_mut(dep);
                    (
                        handle.patched,
                        handle.incomplete,
                        handle.included,
                        handle.exhausted,
                    )
                };
                if patched {
                    anyhow::bail!(
                        "{}: dependency {} claimed patchable but has a bad parent",
                        pkg_path,
                        self.reg.get(dep).import_path()
                    );
                }
                if !incomplete || !included {
                    let handle = self.handle_mut(dep);
                    handle.incomplete = true;
                    handle.included = true;
                    self.changed = true;
                }
                if !exhausted {
                    can_port_imports = true;
                }
            }
            if can_port_imports {
                return Ok(None);
            }
        }

        // Every missing symbol lives in an exhausted dependency (or no
        // candidate accepts). Last resort: inline substitution from the
        // catalog, applied to the candidate we are standing on.
        let edits = self.collect_catalog_edits(id)?;
        if edits.is_empty() {
            self.handle_mut(id).exhausted = true;
            let reason = if !retagged {
                "unable to find a valid configuration"
            } else {
                "no applicable options available"
            };
            return Ok(Some(PatchError::new(&pkg_path, reason)));
        }

        let derived_idx = self.apply_substitutions(id, edits)?;
        let (view, errors) = self.typecheck(id, derived_idx, false)?;
        if errors.iter().any(|e| !e.soft) {
            self.handle_mut(id).exhausted = true;
            return Ok(Some(PatchError::new(
                &pkg_path,
                "inline edits resulted in a bad configuration",
            )));
        }

        {
            let handle = self.handle_mut(id);
            handle.view = Some(view);
            handle.errors = errors;
            handle.build_idx = derived_idx;
        }
        if self.validate(id)? {
            self.set_patched(id);
            return Ok(None);
        }

        self.handle_mut(id).exhausted = true;
        Ok(Some(PatchError::new(&pkg_path, "no applicable options available")))
    }

    /// Substitutions the catalog offers for the current candidate's missing
    /// dependency symbols.
    fn collect_catalog_edits(&mut self, id: PkgId) -> Result<patch::FileEdits> {
        let mut edits = patch::FileEdits::new();
        for err in self.handles[&id].errors.clone() {
            let ErrorClass::BadImportName { pkg_name, name } = &err.class else {
                continue;
            };
            let dep = self.lookup_error_import(id, pkg_name, &err.file)?;
            let dep_path = self.reg.get(dep).import_path();
            if let Some(directive) = self.catalog.export(dep_path, &name.name) {
                edits
                    .entry(err.file.clone())
                    .or_default()
                    .entry(pkg_name.clone())
                    .or_default()
                    .insert(name.name.clone(), directive.clone());
            }
        }
        Ok(edits)
    }

    /// Re-check every parent at its current candidate against this
    /// package's proposed surface. The proposal is rejected if a parent
    /// reports a missing symbol that resolves back to this package.
    fn validate(&mut self, id: PkgId) -> Result<bool> {
        let pkg_path = self.reg.get(id).import_path().to_string();
        let parents = self.reg.get(id).parents.clone();
        for parent in parents {
            let build_idx = self.handle_mut(parent).build_idx;
            let (_, errors) = self.typecheck(parent, build_idx, false)?;
            for err in &errors {
                if let ErrorClass::BadImportName { pkg_name, .. } = &err.class {
                    let dep = self.lookup_error_import(parent, pkg_name, &err.file)?;
                    if self.reg.get(dep).import_path() == pkg_path {
                        debug!(
                            pkg = %pkg_path,
                            parent = self.reg.get(parent).import_path(),
                            "candidate rejected by parent"
                        );
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    /// Type-check one candidate, forwarding every import's latest typed
    /// view from the handle table.
    fn typecheck(&mut self, id: PkgId, build: usize, deps_only: bool) -> Result<(TypeView, Vec<TypeError>)> {
        let req = self.check_request(id, build, deps_only)?;
        let report = self.tool.check(&req).with_context(|| {
            format!("type-check {} (candidate {build})", self.reg.get(id).import_path())
        })?;
        let errors = report
            .errors
            .iter()
            .map(|raw| TypeError::from_raw(&self.classifier, raw))
            .collect();
        Ok((report.view, errors))
    }

    fn check_request(&self, id: PkgId, build: usize, deps_only: bool) -> Result<CheckRequest> {
        let pkg = self.reg.get(id);
        let config = pkg.builds.get(build).ok_or_else(|| {
            anyhow::anyhow!("{}: no candidate configuration {build}", pkg.import_path())
        })?;

        let mut files = Vec::with_capacity(config.files.len());
        for name in &config.files {
            let file = pkg.files.get(name).ok_or_else(|| {
                anyhow::anyhow!("{}: candidate names unknown file {name}", pkg.import_path())
            })?;
            files.push(CheckFile {
                name: file.name.clone(),
                path: file.path.clone(),
            });
        }

        let mut imports = Vec::with_capacity(pkg.imports.len());
        for (source_path, &dep) in &pkg.imports {
            let dep_pkg = self.reg.get(dep);
            let view = self
                .handles
                .get(&dep)
                .and_then(|h| h.view.clone())
                .unwrap_or_else(|| TypeView::empty(&dep_pkg.meta.name));
            imports.push(ImportView {
                source_path: source_path.clone(),
                import_path: dep_pkg.import_path().to_string(),
                view,
            });
        }

        Ok(CheckRequest {
            import_path: pkg.import_path().to_string(),
            package_name: pkg.meta.name.clone(),
            dir: std::path::PathBuf::from(&pkg.meta.dir),
            files,
            imports,
            deps_only,
        })
    }

    /// Resolve the package behind a `BadImportName` error. Failure here
    /// means the graph and the checker disagree, which is fatal.
    fn lookup_error_import(&self, id: PkgId, import_name: &str, file: &str) -> Result<PkgId> {
        self.reg.lookup_import(id, import_name, file).ok_or_else(|| {
            anyhow::anyhow!(
                "{}: missing-symbol error names unknown package {import_name}",
                self.reg.get(id).import_path()
            )
        })
    }

    /// Invalidate the type data of every package that can see this one, so
    /// later passes re-check them against the new surface.
    fn mark_parents_stale(&mut self, id: PkgId) {
        let mut stack = self.reg.get(id).parents.clone();
        let mut seen: BTreeSet<PkgId> = BTreeSet::new();
        while let Some(parent) = stack.pop() {
            if !seen.insert(parent) {
                continue;
            }
            self.handle_mut(parent).built = false;
            stack.extend(self.reg.get(parent).parents.iter().copied());
        }
    }

    fn handle_mut(&mut self, id: PkgId) -> &mut Handle {
        self.handles.entry(id).or_default()
    }

    fn snapshot(&self, id: PkgId) -> Handle {
        self.handles[&id].clone()
    }

    fn restore(&mut self, id: PkgId, handle: Handle) {
        self.handles.insert(id, handle);
    }

    fn set_patched(&mut self, id: PkgId) {
        let handle = self.handle_mut(id);
        if !handle.patched {
            handle.patched = true;
            self.changed = true;
            info!(pkg = self.reg.get(id).import_path(), "package patched");
        }
    }

    fn set_valid(&mut self, id: PkgId) {
        let handle = self.handle_mut(id);
        if !handle.valid {
            handle.valid = true;
            self.changed = true;
        }
    }
}
