//! The emitted result: module pins and package patches, serialized with the
//! Go ecosystem's PascalCase keys. Collections are assembled in path order
//! so identical runs emit identical bytes.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::port::Context;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Output {
    pub modules: Vec<ModulePin>,
    pub packages: Vec<PackagePatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ModulePin {
    pub path: String,
    /// Version module resolution chose before intervention.
    pub version: String,
    /// Version the workspace ends up pinned to.
    pub pinned: String,
    #[serde(skip_serializing_if = "is_false")]
    pub imported: bool,
    /// Source directory to materialize the module from, when imported.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub dir: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct PackagePatch {
    pub path: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub dir: String,
    pub module: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FilePatch>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct FilePatch {
    pub name: String,
    /// true: include the file on the target (add the target-OS tag);
    /// false: exclude it (add the negated tag).
    pub build: bool,
    /// For derived files, the file this one was copied from.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub base_file: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub symbols: Vec<SymbolRepl>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct SymbolRepl {
    pub original: String,
    pub new: String,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Output {
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).expect("serialize output")
    }
}

impl Context {
    /// Materialize the run's decisions.
    pub(crate) fn assemble(&self) -> Output {
        Output {
            modules: self.collect_pins(),
            packages: self.collect_patches(),
        }
    }

    fn collect_pins(&self) -> Vec<ModulePin> {
        let mut modules = Vec::with_capacity(self.pins.len());
        for (path, pin) in &self.pins {
            let dir = if pin.imported {
                self.reg
                    .module_by_path(path)
                    .map(|m| m.dir.to_string_lossy().into_owned())
                    .unwrap_or_default()
            } else {
                String::new()
            };
            modules.push(ModulePin {
                path: path.clone(),
                version: pin.version.clone(),
                pinned: pin.pin_to.clone(),
                imported: pin.imported,
                dir,
            });
        }
        modules
    }

    fn collect_patches(&self) -> Vec<PackagePatch> {
        let mut patches = Vec::new();
        for id in self.reg.ids() {
            let Some(handle) = self.handles.get(&id) else {
                continue;
            };
            let pkg = self.reg.get(id);
            let module = pkg
                .module
                .map(|mid| self.reg.module(mid).path.clone())
                .unwrap_or_default();

            if let Some(failure) = &handle.failure {
                patches.push(PackagePatch {
                    path: pkg.import_path().to_string(),
                    dir: pkg.meta.dir.clone(),
                    module,
                    tags: Vec::new(),
                    files: Vec::new(),
                    error: failure.to_string(),
                });
                continue;
            }
            if !handle.patched {
                continue;
            }

            let current = &pkg.builds[handle.build_idx];
            let mut default_files: BTreeSet<&str> =
                pkg.builds[0].files.iter().map(String::as_str).collect();

            let mut files = Vec::new();
            // Files the chosen candidate adds relative to the default.
            for name in &current.files {
                if default_files.remove(name.as_str()) {
                    continue;
                }
                let (base_file, symbols) = match pkg.files.get(name).and_then(|f| f.derived.as_ref())
                {
                    Some(derived) => (
                        derived.base.clone(),
                        derived
                            .substitutions
                            .iter()
                            .map(|sub| SymbolRepl {
                                original: sub.original.clone(),
                                new: sub.replacement.clone(),
                            })
                            .collect(),
                    ),
                    None => (String::new(), Vec::new()),
                };
                files.push(FilePatch {
                    name: name.clone(),
                    build: true,
                    base_file,
                    symbols,
                });
            }
            // Default files the candidate leaves out get excluded.
            for name in default_files {
                files.push(FilePatch {
                    name: name.to_string(),
                    build: false,
                    base_file: String::new(),
                    symbols: Vec::new(),
                });
            }

            patches.push(PackagePatch {
                path: pkg.import_path().to_string(),
                dir: pkg.meta.dir.clone(),
                module,
                tags: current.platforms.clone(),
                files,
                error: String::new(),
            });
        }
        patches
    }
}
