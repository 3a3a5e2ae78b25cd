//! Capability port onto the installed Go toolchain.
//!
//! Everything the engine needs from the outside world goes through the
//! [`Toolchain`] trait, so tests can substitute a scripted implementation
//! and replay canned responses without a Go installation present.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::classify::is_soft_message;

/// Opaque export surface of a checked package. Threaded from a package's
/// handle into the check requests of its importers; the engine never looks
/// inside beyond the package name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeView {
    pub package: String,
    pub fingerprint: String,
}

impl TypeView {
    /// The view of a package with no active files on the target.
    pub fn empty(package: &str) -> TypeView {
        TypeView {
            package: package.to_string(),
            fingerprint: String::new(),
        }
    }
}

/// One file of a candidate configuration. `path` points at the real source
/// or, for derived files, at the rewritten copy in the run cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckFile {
    pub name: String,
    pub path: PathBuf,
}

/// The latest typed view of one imported package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportView {
    /// Import path as written in source.
    pub source_path: String,
    /// Resolved import path.
    pub import_path: String,
    pub view: TypeView,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckRequest {
    pub import_path: String,
    pub package_name: String,
    pub dir: PathBuf,
    pub files: Vec<CheckFile>,
    pub imports: Vec<ImportView>,
    /// The package is only needed as a dependency; the checker may skip
    /// function bodies.
    pub deps_only: bool,
}

impl CheckRequest {
    /// Stable identity of the candidate under check, used for fingerprints
    /// and for keying scripted responses.
    pub fn config_key(&self) -> String {
        let mut names: Vec<&str> = self.files.iter().map(|f| f.name.as_str()).collect();
        names.sort_unstable();
        names.join(",")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTypeError {
    pub file: String,
    pub message: String,
    pub soft: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckReport {
    pub view: TypeView,
    pub errors: Vec<RawTypeError>,
}

/// The operations the engine requires from the host toolchain.
pub trait Toolchain {
    /// `go list -json -e -deps` over the given import paths; returns the raw
    /// JSON stream.
    fn go_list(&mut self, paths: &[String]) -> Result<String>;

    /// `go env` as a map.
    fn go_env(&mut self) -> Result<BTreeMap<String, String>>;

    /// Candidate upgrade version for a module, or the current version when
    /// no upgrade exists.
    fn mod_update_query(&mut self, module: &str) -> Result<String>;

    fn work_edit_replace(&mut self, module: &str, version: &str) -> Result<()>;
    fn work_edit_drop_replace(&mut self, module: &str) -> Result<()>;
    fn work_use(&mut self, dir: &Path) -> Result<()>;
    fn mod_tidy(&mut self) -> Result<()>;
    fn mod_init(&mut self, dir: &Path, module: &str) -> Result<()>;

    /// Type-check one candidate configuration.
    fn check(&mut self, req: &CheckRequest) -> Result<CheckReport>;
}

/// Production implementation driving the `go` binary.
///
/// Workspace-affecting commands run with `GOWORK` pointed at the private
/// mirror file so the user's real workspace stays untouched until commit.
pub struct GoToolchain {
    gowork: Option<PathBuf>,
    scratch: PathBuf,
    overlay_seq: u64,
}

impl GoToolchain {
    pub fn new(scratch: PathBuf) -> GoToolchain {
        GoToolchain {
            gowork: None,
            scratch,
            overlay_seq: 0,
        }
    }

    /// Route all subsequent commands through the given workspace file.
    pub fn set_workspace(&mut self, gowork: PathBuf) {
        self.gowork = Some(gowork);
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("go");
        cmd.args(args);
        if let Some(gowork) = &self.gowork {
            cmd.env("GOWORK", gowork);
        }
        cmd
    }

    /// Run a command; trimmed stdout on success, stderr folded into the
    /// error otherwise.
    fn run(&self, mut cmd: Command) -> Result<String> {
        let rendered = render_command(&cmd);
        debug!(cmd = %rendered, "exec");
        let output = cmd
            .output()
            .with_context(|| format!("cmd: {rendered}: failed to spawn"))?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if output.status.success() {
            Ok(stdout)
        } else {
            anyhow::bail!("cmd: {rendered}: {stderr}")
        }
    }
}

fn render_command(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().into_owned()];
    parts.extend(cmd.get_args().map(|a| a.to_string_lossy().into_owned()));
    parts.join(" ")
}

impl Toolchain for GoToolchain {
    fn go_list(&mut self, paths: &[String]) -> Result<String> {
        let mut args = vec!["list", "-json", "-e", "-deps", "-mod=readonly"];
        args.extend(paths.iter().map(String::as_str));
        self.run(self.command(&args))
    }

    fn go_env(&mut self) -> Result<BTreeMap<String, String>> {
        let out = self.run(self.command(&["env", "-json"]))?;
        serde_json::from_str(&out).context("parse 'go env -json' output")
    }

    fn mod_update_query(&mut self, module: &str) -> Result<String> {
        self.run(self.command(&[
            "list",
            "-f",
            "{{if .Update}}{{.Update.Version}}{{else}}{{.Version}}{{end}}",
            "-m",
            "-u",
            "-mod=readonly",
            module,
        ]))
    }

    fn work_edit_replace(&mut self, module: &str, version: &str) -> Result<()> {
        let replace = format!("{module}={module}@{version}");
        self.run(self.command(&["work", "edit", "-replace", &replace]))?;
        Ok(())
    }

    fn work_edit_drop_replace(&mut self, module: &str) -> Result<()> {
        self.run(self.command(&["work", "edit", "-dropreplace", module]))?;
        Ok(())
    }

    fn work_use(&mut self, dir: &Path) -> Result<()> {
        let dir = dir.to_string_lossy();
        self.run(self.command(&["work", "use", dir.as_ref()]))?;
        Ok(())
    }

    fn mod_tidy(&mut self) -> Result<()> {
        self.run(self.command(&["mod", "tidy"]))?;
        Ok(())
    }

    fn mod_init(&mut self, dir: &Path, module: &str) -> Result<()> {
        let mut cmd = self.command(&["mod", "init", module]);
        cmd.current_dir(dir);
        self.run(cmd)?;
        Ok(())
    }

    /// Type-check by building the package with a `-overlay` file that maps
    /// the package directory onto exactly the candidate's file set: files
    /// outside the candidate are masked out, derived files are mapped in
    /// from the cache.
    fn check(&mut self, req: &CheckRequest) -> Result<CheckReport> {
        let overlay = self.write_overlay(req)?;
        let overlay_arg = overlay.to_string_lossy().into_owned();
        let mut cmd = self.command(&["build", "-mod=readonly", "-overlay"]);
        cmd.arg(&overlay_arg).arg(&req.import_path);

        let rendered = render_command(&cmd);
        debug!(cmd = %rendered, "typecheck");
        let output = cmd
            .output()
            .with_context(|| format!("cmd: {rendered}: failed to spawn"))?;
        let _ = std::fs::remove_file(&overlay);

        let mut errors = Vec::new();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            for line in stderr.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                errors.push(parse_diagnostic(line));
            }
        }

        let mut fingerprint = req.config_key();
        for import in &req.imports {
            fingerprint.push('|');
            fingerprint.push_str(&import.view.fingerprint);
        }

        Ok(CheckReport {
            view: TypeView {
                package: req.package_name.clone(),
                fingerprint,
            },
            errors,
        })
    }
}

impl GoToolchain {
    fn write_overlay(&mut self, req: &CheckRequest) -> Result<PathBuf> {
        let mut replace: BTreeMap<String, String> = BTreeMap::new();

        // Mask every on-disk .go file that the candidate does not include.
        let mut wanted: BTreeMap<&str, &Path> = BTreeMap::new();
        for file in &req.files {
            wanted.insert(file.name.as_str(), file.path.as_path());
        }
        let entries = std::fs::read_dir(&req.dir)
            .with_context(|| format!("read package dir: {}", req.dir.display()))?;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".go") {
                continue;
            }
            if !wanted.contains_key(name.as_str()) {
                let orig = req.dir.join(&name);
                replace.insert(orig.to_string_lossy().into_owned(), String::new());
            }
        }
        // Map candidate files that live outside the package dir (derived
        // copies) into it.
        for (name, path) in wanted {
            let in_dir = req.dir.join(name);
            if in_dir != path {
                replace.insert(
                    in_dir.to_string_lossy().into_owned(),
                    path.to_string_lossy().into_owned(),
                );
            }
        }

        #[derive(Serialize)]
        struct Overlay {
            #[serde(rename = "Replace")]
            replace: BTreeMap<String, String>,
        }

        self.overlay_seq += 1;
        let path = self.scratch.join(format!("overlay{}.json", self.overlay_seq));
        let body = serde_json::to_vec(&Overlay { replace })?;
        std::fs::write(&path, body)
            .with_context(|| format!("write overlay: {}", path.display()))?;
        Ok(path)
    }
}

/// Split a `file:line:col: message` diagnostic into its parts. Lines that do
/// not match are kept whole so nothing is silently dropped.
fn parse_diagnostic(line: &str) -> RawTypeError {
    let mut file = String::new();
    let mut message = line.to_string();
    if let Some(idx) = line.find(".go:") {
        let (path, rest) = line.split_at(idx + 3);
        if let Some(msg_idx) = rest.find(": ") {
            file = Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            message = rest[msg_idx + 2..].to_string();
        }
    }
    let soft = is_soft_message(&message);
    RawTypeError {
        file,
        message,
        soft,
    }
}
