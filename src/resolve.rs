//! Dependency resolution.
//!
//! Expands a root formula into an install plan: every formula reachable through
//! `dependencies`, each exactly once, ordered so that dependencies come before
//! their dependents. Siblings keep their declaration order, which makes the
//! plan deterministic for a given set of formulae.
//!
//! Traversal is a depth-first search with three marks (unvisited, in progress,
//! done). Reaching an in-progress node means the graph has a cycle; the error
//! names the whole cycle and no partial plan is returned.

use crate::error::{InstallError, Result};
use crate::formula::{self, FormulaLookup, FormulaRecord};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

struct Resolver<'a> {
    lookup: &'a dyn FormulaLookup,
    marks: HashMap<String, Mark>,
    path: Vec<String>,
    order: Vec<FormulaRecord>,
}

impl<'a> Resolver<'a> {
    fn new(lookup: &'a dyn FormulaLookup) -> Self {
        Self {
            lookup,
            marks: HashMap::new(),
            path: Vec::new(),
            order: Vec::new(),
        }
    }

    fn visit(&mut self, formula: FormulaRecord) -> Result<()> {
        if self.marks.contains_key(&formula.name) {
            return Ok(());
        }
        formula.validate()?;

        self.marks.insert(formula.name.clone(), Mark::InProgress);
        self.path.push(formula.name.clone());

        for dep in &formula.dependencies {
            match self.marks.get(dep) {
                Some(Mark::Done) => continue,
                Some(Mark::InProgress) => {
                    let start = self.path.iter().position(|n| n == dep).unwrap_or(0);
                    let mut cycle = self.path[start..].to_vec();
                    cycle.push(dep.clone());
                    return Err(InstallError::CyclicDependency { cycle });
                }
                None => {}
            }

            let record = self
                .lookup
                .lookup(dep)
                .ok_or_else(|| self.unknown(dep, Some(&formula.name)))?;
            if record.name != *dep {
                return Err(InstallError::InvalidFormula {
                    name: dep.clone(),
                    reason: format!("lookup returned formula {}", record.name),
                });
            }
            self.visit(record)?;
        }

        self.path.pop();
        self.marks.insert(formula.name.clone(), Mark::Done);
        self.order.push(formula);
        Ok(())
    }

    fn unknown(&self, name: &str, required_by: Option<&str>) -> InstallError {
        let names = self.lookup.names();
        InstallError::UnknownDependency {
            name: name.to_string(),
            required_by: required_by.map(str::to_string),
            suggestion: formula::suggest(name, names.iter().map(String::as_str)),
        }
    }
}

/// Install plan for `root`: its transitive dependencies first, `root` last.
pub fn resolve(root: &FormulaRecord, lookup: &dyn FormulaLookup) -> Result<Vec<FormulaRecord>> {
    let mut resolver = Resolver::new(lookup);
    resolver.visit(root.clone())?;
    Ok(resolver.order)
}

/// Look up `name` and resolve it.
pub fn resolve_name(name: &str, lookup: &dyn FormulaLookup) -> Result<Vec<FormulaRecord>> {
    resolve_many(&[name.to_string()], lookup)
}

/// One deduplicated plan covering several roots, in the order given.
pub fn resolve_many(names: &[String], lookup: &dyn FormulaLookup) -> Result<Vec<FormulaRecord>> {
    let mut resolver = Resolver::new(lookup);
    for name in names {
        let record = lookup
            .lookup(name)
            .ok_or_else(|| resolver.unknown(name, None))?;
        resolver.visit(record)?;
    }
    Ok(resolver.order)
}

/// Names in `graph` that list `name` among their dependencies, sorted.
pub fn dependents_of<'a>(
    name: &str,
    graph: impl IntoIterator<Item = (&'a str, &'a [String])>,
) -> Vec<String> {
    graph
        .into_iter()
        .filter(|(node, deps)| *node != name && deps.iter().any(|d| d == name))
        .map(|(node, _)| node.to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::InstallStep;

    fn formula(name: &str, deps: &[&str]) -> FormulaRecord {
        FormulaRecord {
            name: name.to_string(),
            desc: None,
            homepage: None,
            license: None,
            url: format!("file:///src/{}-1.0.0.tar.gz", name),
            sha256: None,
            version: None,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            options: vec![],
            install: vec![InstallStep::Shell("true".into())],
            test: None,
        }
    }

    fn graph(nodes: &[(&str, &[&str])]) -> HashMap<String, FormulaRecord> {
        nodes
            .iter()
            .map(|(name, deps)| (name.to_string(), formula(name, deps)))
            .collect()
    }

    fn names(plan: &[FormulaRecord]) -> Vec<&str> {
        plan.iter().map(|f| f.name.as_str()).collect()
    }

    fn assert_topological(plan: &[FormulaRecord]) {
        let position: HashMap<&str, usize> = plan
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.as_str(), i))
            .collect();
        assert_eq!(position.len(), plan.len(), "duplicate entries in plan");
        for f in plan {
            for dep in &f.dependencies {
                assert!(
                    position[dep.as_str()] < position[f.name.as_str()],
                    "{} must precede {}",
                    dep,
                    f.name
                );
            }
        }
    }

    #[test]
    fn test_earthscii_plan() {
        let lookup = graph(&[
            ("earthscii", &["python@3.11", "numpy", "rasterio"]),
            ("python@3.11", &[]),
            ("numpy", &["python@3.11"]),
            ("rasterio", &["numpy", "gdal"]),
            ("gdal", &[]),
        ]);

        let plan = resolve_name("earthscii", &lookup).unwrap();
        assert_eq!(
            names(&plan),
            vec!["python@3.11", "numpy", "gdal", "rasterio", "earthscii"]
        );
        assert_topological(&plan);
    }

    #[test]
    fn test_diamond_is_deduplicated() {
        let lookup = graph(&[
            ("app", &["left", "right"]),
            ("left", &["base"]),
            ("right", &["base"]),
            ("base", &[]),
        ]);

        let plan = resolve_name("app", &lookup).unwrap();
        assert_eq!(names(&plan), vec!["base", "left", "right", "app"]);
    }

    #[test]
    fn test_declaration_order_breaks_ties() {
        let lookup = graph(&[("app", &["zlib", "acl", "m4"]), ("zlib", &[]), ("acl", &[]), ("m4", &[])]);
        let plan = resolve_name("app", &lookup).unwrap();
        assert_eq!(names(&plan), vec!["zlib", "acl", "m4", "app"]);
    }

    #[test]
    fn test_cycle_is_named() {
        let lookup = graph(&[("a", &["b"]), ("b", &["c"]), ("c", &["a"])]);
        match resolve_name("a", &lookup) {
            Err(InstallError::CyclicDependency { cycle }) => {
                assert_eq!(cycle, vec!["a", "b", "c", "a"]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_cycle_below_root() {
        let lookup = graph(&[("app", &["x"]), ("x", &["y"]), ("y", &["x"])]);
        match resolve_name("app", &lookup) {
            Err(InstallError::CyclicDependency { cycle }) => {
                assert_eq!(cycle, vec!["x", "y", "x"]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_dependency_with_suggestion() {
        let lookup = graph(&[("app", &["nunpy"]), ("numpy", &[])]);
        match resolve_name("app", &lookup) {
            Err(InstallError::UnknownDependency {
                name,
                required_by,
                suggestion,
            }) => {
                assert_eq!(name, "nunpy");
                assert_eq!(required_by.as_deref(), Some("app"));
                assert_eq!(suggestion.as_deref(), Some("numpy"));
            }
            other => panic!("expected unknown dependency, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_root() {
        let lookup = graph(&[("app", &[])]);
        assert!(matches!(
            resolve_name("ap", &lookup),
            Err(InstallError::UnknownDependency { required_by: None, .. })
        ));
    }

    #[test]
    fn test_resolve_many_shares_dependencies() {
        let lookup = graph(&[("a", &["base"]), ("b", &["base"]), ("base", &[])]);
        let plan = resolve_many(&["a".into(), "b".into()], &lookup).unwrap();
        assert_eq!(names(&plan), vec!["base", "a", "b"]);
    }

    #[test]
    fn test_generated_acyclic_graphs_are_ordered() {
        // Layered graphs: node i may depend on any node j < i
        for seed in 1..40u64 {
            let mut state = seed;
            let mut next = || {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                state >> 33
            };
            let count = 2 + (next() % 12) as usize;
            let mut nodes: Vec<(String, Vec<String>)> = Vec::new();
            for i in 0..count {
                let mut deps = Vec::new();
                for j in 0..i {
                    if next() % 3 == 0 {
                        deps.push(format!("n{}", j));
                    }
                }
                nodes.push((format!("n{}", i), deps));
            }

            let lookup: HashMap<String, FormulaRecord> = nodes
                .iter()
                .map(|(name, deps)| {
                    let deps: Vec<&str> = deps.iter().map(String::as_str).collect();
                    (name.clone(), formula(name, &deps))
                })
                .collect();
            let roots: Vec<String> = nodes.iter().map(|(n, _)| n.clone()).rev().collect();

            let plan = resolve_many(&roots, &lookup).unwrap();
            assert_eq!(plan.len(), count);
            assert_topological(&plan);
        }
    }

    #[test]
    fn test_dependents_of() {
        let deps_a = vec!["base".to_string()];
        let deps_b = vec!["base".to_string(), "other".to_string()];
        let none: Vec<String> = vec![];
        let graph = [
            ("b", deps_b.as_slice()),
            ("a", deps_a.as_slice()),
            ("base", none.as_slice()),
        ];
        assert_eq!(dependents_of("base", graph), vec!["a", "b"]);
        assert!(dependents_of("a", graph).is_empty());
    }
}
