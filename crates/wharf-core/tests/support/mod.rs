//! Shared test harness: a scripted toolchain that replays canned responses,
//! plus temp-dir fixtures for package sources.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use wharf_core::catalog::InlineCatalog;
use wharf_core::config::Config;
use wharf_core::port::Context;
use wharf_core::toolchain::{CheckReport, CheckRequest, RawTypeError, Toolchain, TypeView};

pub fn create_temp_dir(prefix: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let base = std::env::temp_dir();
    let pid = std::process::id();
    for _ in 0..10_000 {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = base.join(format!("{prefix}_{pid}_{n}"));
        if std::fs::create_dir(&path).is_ok() {
            return path;
        }
    }
    panic!("failed to create temp dir under {}", base.display());
}

pub fn rm_rf(path: &Path) {
    let _ = std::fs::remove_dir_all(path);
}

pub fn write_file(dir: &Path, name: &str, contents: &str) {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create source dir");
    }
    std::fs::write(&path, contents).expect("write source file");
}

/// Scripted toolchain. List responses replay in order (the last one
/// repeats); check reports are keyed by package and candidate file set and
/// replay in order per key (the last one repeats). Every invocation is
/// recorded for assertions.
#[derive(Default)]
pub struct ScriptedToolchain {
    pub env: BTreeMap<String, String>,
    lists: VecDeque<String>,
    updates: BTreeMap<String, String>,
    checks: BTreeMap<(String, String), VecDeque<CheckReport>>,
    /// Shared so tests can keep a handle after the toolchain moves into the
    /// engine.
    pub log: Arc<Mutex<Vec<String>>>,
}

impl ScriptedToolchain {
    pub fn new() -> ScriptedToolchain {
        let mut env = BTreeMap::new();
        env.insert("GOOS".to_string(), "zos".to_string());
        env.insert("GOARCH".to_string(), "s390x".to_string());
        env.insert("GOVERSION".to_string(), "go1.21.0".to_string());
        env.insert("CGO_ENABLED".to_string(), "0".to_string());
        ScriptedToolchain {
            env,
            ..ScriptedToolchain::default()
        }
    }

    pub fn push_list(&mut self, entries: &[serde_json::Value]) {
        let stream = entries
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("\n");
        self.lists.push_back(stream);
    }

    pub fn set_update(&mut self, module: &str, version: &str) {
        self.updates.insert(module.to_string(), version.to_string());
    }

    pub fn push_check(&mut self, import_path: &str, files: &[&str], report: CheckReport) {
        let mut names: Vec<&str> = files.to_vec();
        names.sort_unstable();
        self.checks
            .entry((import_path.to_string(), names.join(",")))
            .or_default()
            .push_back(report);
    }

    pub fn push_check_ok(&mut self, import_path: &str, files: &[&str]) {
        self.push_check(import_path, files, report_ok(import_path));
    }

    pub fn push_check_errors(&mut self, import_path: &str, files: &[&str], errors: &[(&str, &str)]) {
        self.push_check(import_path, files, report_errors(import_path, errors));
    }
}

pub fn report_ok(package: &str) -> CheckReport {
    CheckReport {
        view: TypeView {
            package: package.rsplit('/').next().unwrap_or(package).to_string(),
            fingerprint: String::new(),
        },
        errors: Vec::new(),
    }
}

pub fn report_errors(package: &str, errors: &[(&str, &str)]) -> CheckReport {
    let mut report = report_ok(package);
    report.errors = errors
        .iter()
        .map(|(file, message)| RawTypeError {
            file: file.to_string(),
            message: message.to_string(),
            soft: false,
        })
        .collect();
    report
}

impl Toolchain for ScriptedToolchain {
    fn go_list(&mut self, paths: &[String]) -> Result<String> {
        self.log.lock().unwrap().push(format!("list {}", paths.join(" ")));
        match self.lists.len() {
            0 => anyhow::bail!("scripted toolchain: no list responses left"),
            1 => Ok(self.lists.front().cloned().unwrap()),
            _ => Ok(self.lists.pop_front().unwrap()),
        }
    }

    fn go_env(&mut self) -> Result<BTreeMap<String, String>> {
        Ok(self.env.clone())
    }

    fn mod_update_query(&mut self, module: &str) -> Result<String> {
        self.log.lock().unwrap().push(format!("update? {module}"));
        Ok(self.updates.get(module).cloned().unwrap_or_default())
    }

    fn work_edit_replace(&mut self, module: &str, version: &str) -> Result<()> {
        self.log.lock().unwrap().push(format!("replace {module}@{version}"));
        Ok(())
    }

    fn work_edit_drop_replace(&mut self, module: &str) -> Result<()> {
        self.log.lock().unwrap().push(format!("dropreplace {module}"));
        Ok(())
    }

    fn work_use(&mut self, dir: &Path) -> Result<()> {
        self.log.lock().unwrap().push(format!("use {}", dir.display()));
        Ok(())
    }

    fn mod_tidy(&mut self) -> Result<()> {
        self.log.lock().unwrap().push("tidy".to_string());
        Ok(())
    }

    fn mod_init(&mut self, dir: &Path, module: &str) -> Result<()> {
        self.log.lock().unwrap().push(format!("init {module} {}", dir.display()));
        Ok(())
    }

    fn check(&mut self, req: &CheckRequest) -> Result<CheckReport> {
        let key = (req.import_path.clone(), req.config_key());
        self.log.lock().unwrap().push(format!("check {} [{}]", key.0, key.1));
        let Some(queue) = self.checks.get_mut(&key) else {
            anyhow::bail!("scripted toolchain: no check response for {} [{}]", key.0, key.1);
        };
        match queue.len() {
            0 => anyhow::bail!("scripted toolchain: check responses exhausted for {}", key.0),
            1 => Ok(queue.front().cloned().unwrap()),
            _ => Ok(queue.pop_front().unwrap()),
        }
    }
}

/// Context wired to a scripted toolchain, with cache and import dirs under
/// the given temp root.
pub fn scripted_context(root: &Path, tool: ScriptedToolchain) -> Context {
    let cache = root.join("cache");
    std::fs::create_dir_all(&cache).expect("create cache dir");
    let cfg = Config::new(
        &tool.env,
        std::iter::empty::<String>(),
        cache,
        root.join("wharf_port"),
    );
    Context::new(cfg, InlineCatalog::builtin(), Box::new(tool))
}

/// Metadata entry for the list-oracle stream.
pub fn meta_entry(
    dir: &Path,
    import_path: &str,
    name: &str,
    module: serde_json::Value,
    go_files: &[&str],
    imports: &[&str],
    root: bool,
) -> serde_json::Value {
    serde_json::json!({
        "Dir": dir.to_string_lossy(),
        "ImportPath": import_path,
        "Name": name,
        "Module": module,
        "GoFiles": go_files,
        "Imports": imports,
        "Match": if root { vec![import_path] } else { vec![] },
        "DepOnly": !root,
    })
}

pub fn main_module(path: &str, dir: &Path) -> serde_json::Value {
    serde_json::json!({
        "Path": path,
        "Main": true,
        "Dir": dir.to_string_lossy(),
    })
}

pub fn dep_module(path: &str, version: &str, dir: &Path) -> serde_json::Value {
    serde_json::json!({
        "Path": path,
        "Version": version,
        "Dir": dir.to_string_lossy(),
    })
}
