//! Inline catalog: configured replacements for symbols that cannot be
//! resolved on the target, keyed by package path.
//!
//! A built-in catalog ships with the binary; a user-supplied YAML file can
//! extend or override individual entries.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const BUILTIN_CATALOG: &str = include_str!("inlines.yaml");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InlineKind {
    /// Apply a patch file to the named source file.
    #[serde(rename = "DIFF")]
    Diff,
    /// Replace `name.symbol` with `name.<Replace>`.
    #[serde(rename = "EXPORT")]
    Export,
    /// Replace `name.symbol` with `<Replace>` verbatim.
    #[serde(rename = "CONST")]
    Const,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInline {
    #[serde(rename = "Type")]
    pub kind: InlineKind,
    #[serde(rename = "Path")]
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportInline {
    #[serde(rename = "Type")]
    pub kind: InlineKind,
    #[serde(rename = "Replace")]
    pub replace: String,
}

impl ExportInline {
    /// The literal replacement text for `import_name.symbol`.
    pub fn replacement_text(&self, import_name: &str) -> String {
        match self.kind {
            InlineKind::Export => format!("{import_name}.{}", self.replace),
            _ => self.replace.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInlines {
    #[serde(default, rename = "Files")]
    pub files: BTreeMap<String, FileInline>,
    #[serde(default, rename = "Exports")]
    pub exports: BTreeMap<String, ExportInline>,
}

#[derive(Debug, Clone, Default)]
pub struct InlineCatalog {
    packages: BTreeMap<String, PackageInlines>,
}

impl InlineCatalog {
    /// The catalog shipped with the binary.
    pub fn builtin() -> InlineCatalog {
        let packages = serde_yaml::from_str(BUILTIN_CATALOG)
            .expect("built-in inline catalog is formatted incorrectly");
        InlineCatalog { packages }
    }

    pub fn empty() -> InlineCatalog {
        InlineCatalog::default()
    }

    /// Merge a user catalog over this one. Entries merge per file and per
    /// symbol; a user entry wins over a built-in one with the same key.
    pub fn load_overrides(&mut self, path: &Path) -> Result<()> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read inline catalog: {}", path.display()))?;
        let overrides: BTreeMap<String, PackageInlines> = serde_yaml::from_str(&data)
            .with_context(|| format!("parse inline catalog: {}", path.display()))?;

        for (pkg, entry) in overrides {
            let base = self.packages.entry(pkg).or_default();
            base.files.extend(entry.files);
            base.exports.extend(entry.exports);
        }
        Ok(())
    }

    pub fn package(&self, pkg_path: &str) -> Option<&PackageInlines> {
        self.packages.get(pkg_path)
    }

    /// The export directive for `symbol` of the package at `pkg_path`.
    pub fn export(&self, pkg_path: &str, symbol: &str) -> Option<&ExportInline> {
        self.packages.get(pkg_path)?.exports.get(symbol)
    }
}
