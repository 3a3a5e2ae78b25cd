//! Topological resolution of the package graph.
//!
//! A three-color DFS assigns each package a level (0 at leaves, strictly
//! above every import), rebuilds the reverse (parent) edges, propagates
//! dirtiness upward, and groups packages by level for the patch engine.

use std::collections::BTreeMap;

use crate::errors::CycleError;
use crate::pkgs::{PkgId, Registry};

/// Level groups in ascending order; group 0 holds the leaves. Each group is
/// sorted by import path so walks are reproducible.
pub fn resolve(reg: &mut Registry, roots: &[PkgId]) -> Result<Vec<Vec<PkgId>>, CycleError> {
    // Parent edges are rebuilt wholesale; stale edges from a previous load
    // would otherwise accumulate across reloads.
    let ids: Vec<PkgId> = reg.ids().collect();
    for id in &ids {
        reg.get_mut(*id).parents.clear();
    }

    let mut walk = Walk {
        reg,
        visited: BTreeMap::new(),
        layers: Vec::new(),
    };

    for &root in roots {
        match walk.visited.get(&root) {
            Some(true) => continue,
            Some(false) => unreachable!("package marked in-progress outside a DFS"),
            None => {
                walk.visit(root)?;
            }
        }
    }

    let Walk {
        reg, mut layers, ..
    } = walk;
    for layer in &mut layers {
        layer.sort_by(|a, b| reg.get(*a).import_path().cmp(reg.get(*b).import_path()));
    }
    Ok(layers)
}

struct Walk<'a> {
    reg: &'a mut Registry,
    /// false = on the current DFS path (gray), true = done (black).
    visited: BTreeMap<PkgId, bool>,
    layers: Vec<Vec<PkgId>>,
}

impl Walk<'_> {
    fn visit(&mut self, id: PkgId) -> Result<usize, CycleError> {
        match self.visited.get(&id) {
            Some(true) => return Ok(self.reg.get(id).level),
            Some(false) => {
                return Err(CycleError {
                    stack: vec![self.reg.get(id).import_path().to_string()],
                })
            }
            None => {}
        }
        self.visited.insert(id, false);

        let mut level = 0usize;
        // Import iteration follows the BTreeMap's source-path order, so the
        // traversal is stable across runs.
        let deps: Vec<PkgId> = self.reg.get(id).imports.values().copied().collect();
        for dep in deps {
            {
                let parents = &mut self.reg.get_mut(dep).parents;
                if !parents.contains(&id) {
                    parents.push(id);
                }
            }

            let dep_level = self.visit(dep).map_err(|mut cycle| {
                cycle.stack.push(self.reg.get(id).import_path().to_string());
                cycle
            })?;

            let dep_pkg = self.reg.get(dep);
            let lift = dep_pkg.dirty || dep_pkg.dep_dirty || dep_pkg.modified;
            let pkg = self.reg.get_mut(id);
            pkg.dep_dirty = pkg.dep_dirty || lift;

            if dep_level >= level {
                level = dep_level + 1;
            }
        }

        while self.layers.len() <= level {
            self.layers.push(Vec::new());
        }
        self.layers[level].push(id);
        self.reg.get_mut(id).level = level;
        self.visited.insert(id, true);

        Ok(level)
    }
}
