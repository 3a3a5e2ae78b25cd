//! Synthesis of derived files: copies of candidate sources with catalog
//! substitutions applied, collected into a new candidate pinned to the
//! target OS.
//!
//! The substitution is a textual replace over the file contents. It can in
//! principle touch matching text inside comments or string literals; an
//! AST-level rewrite would avoid that, at considerably more machinery.

use std::collections::BTreeMap;

use anyhow::{Context as _, Result};
use tracing::debug;

use crate::catalog::ExportInline;
use crate::pkgs::{BuildConfig, DerivedFile, GoFile, PkgId, SymbolSub};
use crate::port::Context;
use crate::tags::Constraint;

/// file name -> import name -> symbol -> directive
pub(crate) type FileEdits = BTreeMap<String, BTreeMap<String, BTreeMap<String, ExportInline>>>;

impl Context {
    /// Build a new candidate from the current one, replacing each edited
    /// file with a derived copy written into the run cache. Returns the new
    /// candidate's index.
    pub(crate) fn apply_substitutions(&mut self, id: PkgId, edits: FileEdits) -> Result<usize> {
        let goos = self.cfg.target.goos.clone();
        let (pkg_path, base_files) = {
            let pkg = self.reg.get(id);
            let handle = &self.handles[&id];
            (
                pkg.import_path().to_string(),
                pkg.builds[handle.build_idx].files.clone(),
            )
        };

        let cache_dir = self.cfg.cache_dir.join(&pkg_path);
        std::fs::create_dir_all(&cache_dir)
            .with_context(|| format!("create package cache dir: {}", cache_dir.display()))?;

        let mut config_files = Vec::with_capacity(base_files.len());
        let mut derived: Vec<GoFile> = Vec::new();

        for name in &base_files {
            let Some(import_edits) = edits.get(name) else {
                config_files.push(name.clone());
                continue;
            };

            let base = self
                .reg
                .get(id)
                .file(name)
                .ok_or_else(|| anyhow::anyhow!("{pkg_path}: unknown file {name}"))?
                .clone();

            let mut text = std::fs::read_to_string(&base.path)
                .with_context(|| format!("read file for substitution: {}", base.path.display()))?;

            let mut substitutions = Vec::new();
            for (import_name, symbols) in import_edits {
                for (symbol, directive) in symbols {
                    let original = format!("{import_name}.{symbol}");
                    let replacement = directive.replacement_text(import_name);
                    text = text.replace(&original, &replacement);
                    substitutions.push(SymbolSub {
                        original,
                        replacement,
                    });
                }
            }

            let cached_path = cache_dir.join(name);
            std::fs::write(&cached_path, &text)
                .with_context(|| format!("write derived file: {}", cached_path.display()))?;

            let stem = name.strip_suffix(".go").unwrap_or(name);
            let derived_name = format!("{stem}_{goos}.go");
            debug!(pkg = %pkg_path, file = %name, derived = %derived_name, "synthesized derived file");

            derived.push(GoFile {
                name: derived_name.clone(),
                path: cached_path,
                cgo: base.cgo,
                default: false,
                constraint: Constraint::Supported,
                imports: base.imports.clone(),
                anon_imports: base.anon_imports.clone(),
                derived: Some(DerivedFile {
                    base: name.clone(),
                    substitutions,
                }),
            });
            config_files.push(derived_name);
        }

        let pkg = self.reg.get_mut(id);
        for file in derived {
            pkg.files.insert(file.name.clone(), file);
        }
        pkg.builds.push(BuildConfig {
            platforms: vec![goos],
            files: config_files,
        });
        Ok(pkg.builds.len() - 1)
    }
}
