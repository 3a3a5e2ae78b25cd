//! Engine configuration derived from the toolchain environment.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use regex::Regex;
use tracing::warn;

use crate::tags::Target;

/// Everything the engine needs to know about the run, fixed before the
/// first load.
#[derive(Debug, Clone)]
pub struct Config {
    pub target: Target,
    /// Build tags considered satisfied when evaluating constraints.
    pub build_tags: BTreeSet<String>,
    /// Scratch directory for derived files and overlays; removed on exit.
    pub cache_dir: PathBuf,
    /// Directory modules are materialized into when they need edits.
    pub import_dir: PathBuf,
}

impl Config {
    pub fn new(
        goenv: &BTreeMap<String, String>,
        extra_tags: impl IntoIterator<Item = String>,
        cache_dir: PathBuf,
        import_dir: PathBuf,
    ) -> Config {
        let target = Target {
            goos: goenv.get("GOOS").cloned().unwrap_or_default(),
            goarch: goenv.get("GOARCH").cloned().unwrap_or_default(),
        };
        let mut build_tags = goenv_build_tags(goenv);
        build_tags.extend(extra_tags);
        Config {
            target,
            build_tags,
            cache_dir,
            import_dir,
        }
    }
}

/// Tags the toolchain itself would consider set: the architecture, the
/// compiler, cgo when enabled, and `go1.N` for every minor release up to the
/// toolchain's own.
pub fn goenv_build_tags(goenv: &BTreeMap<String, String>) -> BTreeSet<String> {
    let mut tags = BTreeSet::new();

    if let Some(goarch) = goenv.get("GOARCH") {
        tags.insert(goarch.clone());
    }
    tags.insert("gc".to_string());
    if goenv.get("CGO_ENABLED").map(String::as_str) == Some("1") {
        tags.insert("cgo".to_string());
    }

    let goversion = goenv.get("GOVERSION").map(String::as_str).unwrap_or("");
    let minor = Regex::new(r"go1\.(\d+)(?:(?:\.|-).+)?$")
        .unwrap()
        .captures(goversion)
        .and_then(|caps| caps[1].parse::<u32>().ok())
        .unwrap_or_else(|| {
            warn!(goversion, "unknown go version, assuming go1.18");
            18
        });
    for n in 1..=minor {
        tags.insert(format!("go1.{n}"));
    }

    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_tags_accumulate_downward() {
        let mut env = BTreeMap::new();
        env.insert("GOARCH".to_string(), "s390x".to_string());
        env.insert("GOVERSION".to_string(), "go1.21.5".to_string());
        env.insert("CGO_ENABLED".to_string(), "1".to_string());

        let tags = goenv_build_tags(&env);
        assert!(tags.contains("s390x"));
        assert!(tags.contains("cgo"));
        assert!(tags.contains("gc"));
        assert!(tags.contains("go1.1"));
        assert!(tags.contains("go1.21"));
        assert!(!tags.contains("go1.22"));
    }
}
