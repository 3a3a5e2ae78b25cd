//! Loading and refreshing the package graph through the list oracle.
//!
//! The oracle is invoked on a frontier of import paths; packages that turn
//! up as imports of loaded files but were absent from the response (because
//! only a non-default file imports them) seed the next frontier, until the
//! whole reachable graph is known.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::config::Config;
use crate::errors::ImportMismatch;
use crate::pkgs::{is_exclude_all_error, BuildConfig, GoFile, Meta, PkgId, Registry};
use crate::scan::{self, CGO_IMPORT};
use crate::tags::{self, Constraint, UNIX_PLATFORM_RANKING};
use crate::toolchain::Toolchain;

/// Load (or refresh) the graph reachable from `paths`. Returns the packages
/// matching the requested paths.
pub fn list(
    reg: &mut Registry,
    tool: &mut dyn Toolchain,
    cfg: &Config,
    paths: &[String],
) -> Result<Vec<PkgId>> {
    let mut found: BTreeSet<String> = BTreeSet::new();
    let mut seeking: BTreeSet<String> = BTreeSet::new();
    let mut matching: Vec<PkgId> = Vec::new();

    let mut next: Vec<String> = paths.to_vec();
    let mut first_batch = true;

    while !next.is_empty() {
        let listout = tool.go_list(&next)?;

        let mut metas: Vec<Meta> = Vec::new();
        for item in serde_json::Deserializer::from_str(&listout).into_iter::<Meta>() {
            metas.push(item.context("parse list oracle output")?);
        }
        if metas.is_empty() {
            anyhow::bail!("no packages found in the workspace");
        }

        for mut meta in metas {
            seeking.remove(&meta.import_path);
            if found.contains(&meta.import_path) {
                if !meta.dep_only {
                    anyhow::bail!(
                        "{}: loaded a package more than once in the same pass",
                        meta.import_path
                    );
                }
                continue;
            }

            // An oracle error normally means the environment is bad, except
            // for the one error that just means "no active files here".
            if let Some(err) = &meta.error {
                if is_exclude_all_error(&err.err) {
                    if meta.name.is_empty() {
                        meta.name = tags::find_package_name(
                            Path::new(&meta.dir),
                            &meta.ignored_go_files,
                        );
                    }
                } else {
                    anyhow::bail!("unable to load {}: {}", meta.import_path, err.err);
                }
            }

            let id = reg.intern(&meta.import_path);
            let module = meta.module.as_ref().map(|m| reg.intern_module(m));

            let do_load = {
                let pkg = reg.get_mut(id);
                let first_load = !pkg.loaded;
                // The oracle uses distinct directories for distinct module
                // versions, so a directory change means new source.
                let do_load = first_load || pkg.meta.dir != meta.dir;
                pkg.first_load = first_load;
                pkg.dirty = do_load || pkg.modified;
                pkg.included = first_batch;
                pkg.modified = false;
                pkg.dep_dirty = false;
                pkg.loaded = true;
                pkg.meta = meta;
                pkg.module = module;
                do_load
            };

            if first_batch && !reg.get(id).meta.dep_only {
                let main = reg
                    .get(id)
                    .meta
                    .module
                    .as_ref()
                    .is_some_and(|m| m.main);
                if !main {
                    anyhow::bail!(
                        "{}: target package must be included in the main module",
                        reg.get(id).import_path()
                    );
                }
                matching.push(id);
            }

            if do_load {
                debug!(pkg = reg.get(id).import_path(), "loading package source");
                load_pkg(reg, cfg, id)?;
            }

            let pkg = reg.get(id);
            found.insert(pkg.meta.import_path.clone());
            let mut unseen: Vec<String> = Vec::new();
            for &dep in pkg.imports.values() {
                let dep_path = reg.get(dep).meta.import_path.clone();
                if !found.contains(&dep_path) {
                    unseen.push(dep_path);
                }
            }
            seeking.extend(unseen);
        }

        first_batch = false;
        let frontier: Vec<String> = seeking.iter().cloned().collect();
        if frontier == next {
            anyhow::bail!(
                "list oracle did not resolve requested packages: {}",
                frontier.join(", ")
            );
        }
        next = frontier;
    }

    Ok(matching)
}

/// Scan a package's source files and rebuild its file table, candidate
/// configurations, and import edges.
fn load_pkg(reg: &mut Registry, cfg: &Config, id: PkgId) -> Result<()> {
    let (dir, go_files, cgo_files, ignored_go_files, pkg_name, is_std) = {
        let pkg = reg.get(id);
        (
            PathBuf::from(&pkg.meta.dir),
            pkg.meta.go_files.clone(),
            pkg.meta.cgo_files.clone(),
            pkg.meta.ignored_go_files.clone(),
            pkg.meta.name.clone(),
            pkg.is_stdlib(),
        )
    };

    if !pkg_name.is_empty() {
        reg.register_name(&pkg_name, id);
    }

    let pkg_path = reg.get(id).import_path().to_string();
    let mut files: BTreeMap<String, GoFile> = BTreeMap::new();

    let mut default_files: Vec<String> = Vec::new();
    let mut always: Vec<String> = Vec::new();
    let mut default_sig: BTreeSet<String> = BTreeSet::new();
    let mut platform_files: BTreeMap<&'static str, Vec<String>> = BTreeMap::new();

    let bucket = |file: &GoFile,
                      always: &mut Vec<String>,
                      default_sig: &mut BTreeSet<String>,
                      platform_files: &mut BTreeMap<&'static str, Vec<String>>|
     -> Result<()> {
        match file.constraint {
            Constraint::All | Constraint::Supported => {
                if !file.default {
                    anyhow::bail!(
                        "{pkg_path}: always-build constraint on excluded file {}",
                        file.name
                    );
                }
                always.push(file.name.clone());
            }
            Constraint::Platforms(set) => {
                if file.default {
                    default_sig.insert(file.name.clone());
                }
                for tag in set.iter() {
                    platform_files.entry(tag).or_default().push(file.name.clone());
                }
            }
            Constraint::Ignored => {
                if file.default {
                    anyhow::bail!(
                        "{pkg_path}: never-build constraint on active file {}",
                        file.name
                    );
                }
            }
        }
        Ok(())
    };

    for (names, expect_cgo) in [(&go_files, false), (&cgo_files, true)] {
        for fname in names.iter() {
            let file = scan_go_file(&dir, fname, true, cfg)?;
            if file.cgo != expect_cgo {
                anyhow::bail!(
                    "{pkg_path}: cgo mismatch between oracle and source for {fname}"
                );
            }
            default_files.push(fname.clone());
            if is_std {
                // Frozen packages keep exactly their default configuration.
                always.push(fname.clone());
            } else {
                bucket(&file, &mut always, &mut default_sig, &mut platform_files)?;
            }
            files.insert(fname.clone(), file);
        }
    }

    if !is_std {
        for fname in ignored_go_files.iter() {
            let file = scan_go_file(&dir, fname, false, cfg)?;
            match file.constraint {
                Constraint::Ignored => {}
                _ => bucket(&file, &mut always, &mut default_sig, &mut platform_files)?,
            }
            files.insert(fname.clone(), file);
        }
    }

    // Candidate configurations: one per platform signature, ranked. A
    // platform whose gated file set matches an existing candidate (including
    // the default) coalesces into it.
    let mut builds = vec![BuildConfig {
        platforms: Vec::new(),
        files: default_files,
    }];
    if !is_std {
        let mut signatures: BTreeMap<BTreeSet<String>, usize> = BTreeMap::new();
        signatures.insert(default_sig, 0);
        for platform in UNIX_PLATFORM_RANKING {
            let Some(gated) = platform_files.get(platform) else {
                continue;
            };
            let sig: BTreeSet<String> = gated.iter().cloned().collect();
            match signatures.get(&sig) {
                Some(&idx) => builds[idx].platforms.push(platform.to_string()),
                None => {
                    let mut config_files = gated.clone();
                    config_files.extend(always.iter().cloned());
                    signatures.insert(sig, builds.len());
                    builds.push(BuildConfig {
                        platforms: vec![platform.to_string()],
                        files: config_files,
                    });
                }
            }
        }
    }

    // Register import edges and reconcile what we parsed against what the
    // oracle reported; disagreement means we cannot trust our own scan.
    let mut touched: BTreeMap<String, bool> = BTreeMap::new();
    let mut default_import_count = 0usize;
    let mut edges: Vec<(String, String)> = Vec::new();
    {
        let pkg = reg.get(id);
        for file in files.values() {
            let file_paths = file
                .imports
                .values()
                .chain(file.anon_imports.iter());
            for source_path in file_paths {
                let true_path = pkg.resolve_import_path(source_path).to_string();
                let counted = touched.entry(true_path.clone()).or_insert(false);
                if !*counted && file.default {
                    *counted = true;
                    default_import_count += 1;
                }
                if true_path != CGO_IMPORT {
                    edges.push((source_path.clone(), true_path));
                }
            }
        }
    }

    let mut imports: BTreeMap<String, PkgId> = BTreeMap::new();
    for (source_path, true_path) in edges {
        let dep = reg.intern(&true_path);
        imports.insert(source_path, dep);
    }

    {
        let pkg = reg.get_mut(id);
        pkg.files = files;
        pkg.builds = builds;
        pkg.imports = imports;
    }

    let pkg = reg.get(id);
    if default_import_count != pkg.meta.imports.len() {
        return Err(ImportMismatch {
            pkg: pkg_path.clone(),
            detail: format!(
                "oracle reports {} imports, source declares {}",
                pkg.meta.imports.len(),
                default_import_count
            ),
        }
        .into());
    }
    for import_path in &pkg.meta.imports {
        if !touched.get(import_path).copied().unwrap_or(false) {
            return Err(ImportMismatch {
                pkg: pkg_path.clone(),
                detail: format!("oracle-reported import {import_path} not found in source"),
            }
            .into());
        }
    }

    Ok(())
}

/// Read one file, parse its constraint, and (unless it can never build)
/// scan its imports.
fn scan_go_file(dir: &Path, name: &str, default: bool, cfg: &Config) -> Result<GoFile> {
    let path = dir.join(name);
    let src =
        std::fs::read(&path).with_context(|| format!("read source file: {}", path.display()))?;

    let constraint = tags::parse(name, &src, &cfg.target, &cfg.build_tags);

    let mut file = GoFile {
        name: name.to_string(),
        path,
        cgo: false,
        default,
        constraint,
        imports: BTreeMap::new(),
        anon_imports: Vec::new(),
        derived: None,
    };

    // A never-building excluded file contributes nothing; skip the scan.
    if constraint == Constraint::Ignored && !default {
        return Ok(file);
    }

    match scan::scan_file(&src) {
        Ok(scanned) => {
            file.cgo = scanned.cgo;
            for (name, path) in scanned.named {
                file.imports.insert(name, path);
            }
            file.anon_imports = scanned.anonymous;
        }
        Err(err) => {
            if default {
                return Err(err)
                    .with_context(|| format!("scan source file: {}", file.path.display()));
            }
            // Excluded files are allowed to be unparsable; they simply
            // never become candidates.
            warn!(file = %file.path.display(), %err, "dropping unparsable excluded file");
            file.constraint = Constraint::Ignored;
        }
    }

    Ok(file)
}
