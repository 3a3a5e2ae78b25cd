//! Typed failures the engine and its callers pattern-match on.

use std::fmt;

use thiserror::Error;

/// An import cycle, fatal for the whole run. The stack lists the packages
/// from the point of re-entry back up to the root that reached it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleError {
    pub stack: Vec<String>,
}

impl std::error::Error for CycleError {}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "import cycle detected:")?;
        let first = self.stack.first().map(String::as_str).unwrap_or("");
        for (idx, pkg) in self.stack.iter().enumerate() {
            if idx == 0 {
                write!(f, "\n{pkg}")?;
            } else {
                write!(f, "\n<- {pkg}")?;
                if pkg == first {
                    write!(f, " --- SEEN HERE BEFORE")?;
                }
            }
        }
        Ok(())
    }
}

/// A package the engine could not port. Recorded against the package; the
/// run continues with the remaining roots.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("cannot patch {pkg_path:?} because {reason}")]
pub struct PatchError {
    pub pkg_path: String,
    pub reason: String,
}

impl PatchError {
    pub fn new(pkg_path: impl Into<String>, reason: impl Into<String>) -> Self {
        PatchError {
            pkg_path: pkg_path.into(),
            reason: reason.into(),
        }
    }
}

/// The parsed source of a package disagrees with what the list oracle
/// reported. Always indicates a bug or a corrupted module cache; fatal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{pkg}: parsed imports disagree with the list oracle ({detail})")]
pub struct ImportMismatch {
    pub pkg: String,
    pub detail: String,
}
