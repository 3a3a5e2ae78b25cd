//! The package/module registry: an arena of packages addressed by index,
//! with parent and import links held as ids so the cyclic-looking graph
//! needs no reference counting.

pub mod load;
pub mod resolve;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::tags::Constraint;

pub const GOLANG_X_PREFIX: &str = "golang.org/x/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PkgId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ModId(pub usize);

/// The list-oracle error raised when every file of a package is excluded on
/// the current target. Non-fatal: the package simply has no active files.
pub fn is_exclude_all_error(message: &str) -> bool {
    message.contains("build constraints exclude all Go files in")
}

// Package metadata as the list oracle reports it. Fields the engine has no
// use for are simply not declared.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Meta {
    pub dir: String,
    pub import_path: String,
    pub name: String,
    pub goroot: bool,
    pub standard: bool,
    pub export: String,
    pub module: Option<MetaModule>,
    #[serde(rename = "Match")]
    pub matched: Vec<String>,
    pub dep_only: bool,

    pub go_files: Vec<String>,
    pub cgo_files: Vec<String>,
    pub ignored_go_files: Vec<String>,

    pub imports: Vec<String>,
    pub import_map: BTreeMap<String, String>,

    pub incomplete: bool,
    pub error: Option<MetaError>,
    pub deps_errors: Vec<MetaError>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct MetaError {
    pub import_stack: Vec<String>,
    pub pos: String,
    pub err: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct MetaModule {
    pub path: String,
    pub version: String,
    pub replace: Option<Box<MetaModule>>,
    pub main: bool,
    pub indirect: bool,
    pub dir: String,
    pub go_mod: String,
    pub go_version: String,
}

/// A module as tracked across the run. Refreshed from metadata on every
/// load, since replace directives move its effective directory.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub path: String,
    pub version: String,
    pub main: bool,
    /// Effective directory (the replacement's when a replace is active).
    pub dir: PathBuf,
    pub replace: Option<ModuleReplace>,
}

#[derive(Debug, Clone)]
pub struct ModuleReplace {
    pub path: String,
    pub version: String,
}

/// A single Go source file of a package.
#[derive(Debug, Clone)]
pub struct GoFile {
    pub name: String,
    pub path: PathBuf,
    pub cgo: bool,
    /// Active in the default configuration.
    pub default: bool,
    pub constraint: Constraint,
    /// Local import name to import path, as written in source.
    pub imports: BTreeMap<String, String>,
    /// Side-effect imports.
    pub anon_imports: Vec<String>,
    /// Set on files synthesized by the patch engine; names the file they
    /// were derived from and the substitutions applied.
    pub derived: Option<DerivedFile>,
}

#[derive(Debug, Clone)]
pub struct DerivedFile {
    pub base: String,
    pub substitutions: Vec<SymbolSub>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolSub {
    pub original: String,
    pub replacement: String,
}

/// One candidate build of a package: the platforms it stands for and the
/// files (by name) it compiles. Element 0 of `Pkg::builds` is the default.
#[derive(Debug, Clone, Default)]
pub struct BuildConfig {
    pub platforms: Vec<String>,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Pkg {
    pub meta: Meta,
    pub module: Option<ModId>,
    pub files: BTreeMap<String, GoFile>,
    pub builds: Vec<BuildConfig>,
    /// Source import path to resolved package.
    pub imports: BTreeMap<String, PkgId>,
    pub parents: Vec<PkgId>,

    /// Reachable in the default configuration.
    pub included: bool,
    /// Source changed since last load.
    pub dirty: bool,
    /// Some transitive dependency is dirty.
    pub dep_dirty: bool,
    /// The engine changed this package's selected configuration.
    pub modified: bool,
    pub first_load: bool,
    pub loaded: bool,
    /// Topological level, 0 at leaves. Set by the resolver.
    pub level: usize,
}

impl Pkg {
    pub fn import_path(&self) -> &str {
        &self.meta.import_path
    }

    pub fn is_golang_x(&self) -> bool {
        self.meta
            .module
            .as_ref()
            .is_some_and(|m| m.path.starts_with(GOLANG_X_PREFIX))
    }

    pub fn is_stdlib(&self) -> bool {
        self.meta.goroot || self.meta.standard || self.is_golang_x()
    }

    /// Resolve a source import path through the oracle's import map.
    pub fn resolve_import_path<'a>(&'a self, source_path: &'a str) -> &'a str {
        self.meta
            .import_map
            .get(source_path)
            .map(String::as_str)
            .unwrap_or(source_path)
    }

    pub fn file(&self, name: &str) -> Option<&GoFile> {
        self.files.get(name)
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    packages: Vec<Pkg>,
    by_path: BTreeMap<String, PkgId>,
    /// Package-name fallback for import lookups; first registration wins.
    by_name: BTreeMap<String, PkgId>,
    modules: Vec<Module>,
    module_ids: BTreeMap<String, ModId>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Get or create the package for an import path.
    pub fn intern(&mut self, import_path: &str) -> PkgId {
        if let Some(&id) = self.by_path.get(import_path) {
            return id;
        }
        let id = PkgId(self.packages.len());
        self.packages.push(Pkg {
            meta: Meta {
                import_path: import_path.to_string(),
                ..Meta::default()
            },
            ..Pkg::default()
        });
        self.by_path.insert(import_path.to_string(), id);
        id
    }

    pub fn lookup(&self, import_path: &str) -> Option<PkgId> {
        self.by_path.get(import_path).copied()
    }

    pub fn get(&self, id: PkgId) -> &Pkg {
        &self.packages[id.0]
    }

    pub fn get_mut(&mut self, id: PkgId) -> &mut Pkg {
        &mut self.packages[id.0]
    }

    pub fn register_name(&mut self, name: &str, id: PkgId) {
        self.by_name.entry(name.to_string()).or_insert(id);
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<PkgId> {
        self.by_name.get(name).copied()
    }

    /// Resolve the package a file refers to by local import name, falling
    /// back to the package-name registry for dot-style references.
    pub fn lookup_import(&self, pkg: PkgId, import_name: &str, file: &str) -> Option<PkgId> {
        let pkg = self.get(pkg);
        if let Some(source_path) = pkg.files.get(file).and_then(|f| f.imports.get(import_name)) {
            if let Some(&dep) = pkg.imports.get(source_path) {
                return Some(dep);
            }
        }
        self.lookup_by_name(import_name)
    }

    /// Get or create the module record, refreshing it from metadata.
    pub fn intern_module(&mut self, meta: &MetaModule) -> ModId {
        let id = match self.module_ids.get(&meta.path) {
            Some(&id) => id,
            None => {
                let id = ModId(self.modules.len());
                self.modules.push(Module::default());
                self.module_ids.insert(meta.path.clone(), id);
                id
            }
        };
        let module = &mut self.modules[id.0];
        module.path = meta.path.clone();
        module.version = meta.version.clone();
        module.main = meta.main;
        module.replace = meta.replace.as_ref().map(|r| ModuleReplace {
            path: r.path.clone(),
            version: r.version.clone(),
        });
        let dir = meta
            .replace
            .as_ref()
            .filter(|r| !r.dir.is_empty())
            .map(|r| r.dir.as_str())
            .unwrap_or(meta.dir.as_str());
        module.dir = PathBuf::from(dir);
        id
    }

    pub fn module(&self, id: ModId) -> &Module {
        &self.modules[id.0]
    }

    pub fn module_by_path(&self, path: &str) -> Option<&Module> {
        self.module_ids.get(path).map(|&id| &self.modules[id.0])
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// All package ids in import-path order.
    pub fn ids(&self) -> impl Iterator<Item = PkgId> + '_ {
        self.by_path.values().copied()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}
