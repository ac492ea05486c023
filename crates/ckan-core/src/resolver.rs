//! Turns a requested module set into a consistent install plan.
//!
//! Resolution is a breadth-first closure over `depends`. Each relationship is
//! satisfied by what is installed, by what is already planned, or by the best
//! available candidate. Conflicts are checked once the closure is complete.
//! Any unresolved dependency or conflict aborts the whole resolution.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use ckan_schema::{CkanModule, GameVersion, ModuleVersion, RelationshipDescriptor};
use thiserror::Error;
use tracing::{debug, warn};

use crate::comparator::GameComparator;
use crate::registry::{AvailableModule, Registry};

/// Why a requested set of modules cannot be installed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Module not found: {identifier}{}", .required_by.as_ref().map(|r| format!(" (required by {r})")).unwrap_or_default())]
    ModuleNotFound {
        identifier: String,
        required_by: Option<String>,
    },

    #[error("{first} conflicts with {second}")]
    ModuleConflict { first: String, second: String },

    #[error("{0} is already installed")]
    AlreadyInstalled(String),
}

/// Knobs for a single resolution.
///
/// Recommends and suggests are only followed for explicitly requested modules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolverOptions {
    /// Pull in the `recommends` of requested modules.
    pub with_recommends: bool,
    /// Pull in the `suggests` of requested modules.
    pub with_suggests: bool,
    /// Consider modules the active comparator rejects.
    pub allow_incompatible: bool,
    /// Report conflicts as warnings instead of failing.
    pub conflicts_as_warnings: bool,
}

/// A successful resolution: modules in dependency order plus non-fatal findings.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub modules: Vec<CkanModule>,
    pub warnings: Vec<String>,
}

impl Resolution {
    /// Identifiers of the planned modules, in install order.
    pub fn identifiers(&self) -> Vec<String> {
        self.modules.iter().map(|m| m.identifier.clone()).collect()
    }
}

/// Turns requested modules into a consistent install set against one registry snapshot.
#[derive(Debug)]
pub struct RelationshipResolver<'a> {
    registry: &'a Registry,
    game: &'a GameVersion,
    comparator: &'a dyn GameComparator,
    options: ResolverOptions,
    installed: BTreeMap<String, ModuleVersion>,
    removing: BTreeSet<String>,
    plan: BTreeMap<String, CkanModule>,
    order: Vec<String>,
    warnings: Vec<String>,
}

impl<'a> RelationshipResolver<'a> {
    pub fn new(
        registry: &'a Registry,
        game: &'a GameVersion,
        comparator: &'a dyn GameComparator,
        options: ResolverOptions,
    ) -> Self {
        Self {
            registry,
            game,
            comparator,
            options,
            installed: registry.installed(true),
            removing: BTreeSet::new(),
            plan: BTreeMap::new(),
            order: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Treats these installed modules as already gone, e.g. because they are being upgraded.
    pub fn removing<I, S>(mut self, identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.removing.extend(identifiers.into_iter().map(Into::into));
        let removing: BTreeSet<&str> = self.removing.iter().map(String::as_str).collect();
        self.installed = self.registry.installed_without(&removing);
        self
    }

    /// Resolves the latest compatible release of each identifier plus everything it needs.
    ///
    /// # Errors
    ///
    /// Fails if an identifier is already installed, if any dependency cannot
    /// be satisfied, or on a conflict (unless conflicts are warnings).
    pub fn resolve_identifiers(self, identifiers: &[String]) -> Result<Resolution, ResolveError> {
        let mut modules = Vec::with_capacity(identifiers.len());
        for id in identifiers {
            let installed_for_real = self
                .registry
                .installed_module(id)
                .is_some_and(|m| !m.version.is_autodetected());
            if installed_for_real && !self.removing.contains(id) {
                return Err(ResolveError::AlreadyInstalled(id.clone()));
            }
            let direct = if self.options.allow_incompatible {
                self.registry.all_available(id).last().copied()
            } else {
                self.registry.latest_available(id, self.game, self.comparator)
            };
            let module = match direct {
                Some(m) => m.clone(),
                None => self.pick(&RelationshipDescriptor::new(id.as_str()), None)?,
            };
            modules.push(module);
        }
        self.resolve_modules(modules)
    }

    /// Resolves explicit modules plus everything they need.
    pub fn resolve_modules(mut self, modules: Vec<CkanModule>) -> Result<Resolution, ResolveError> {
        let mut queue = VecDeque::new();
        for module in modules {
            if self.add_to_plan(module.clone())? {
                queue.push_back((module, true));
            }
        }
        self.drain(&mut queue)?;

        let conflicts = self.conflicts();
        if let Some((first, second)) = conflicts.first() {
            if !self.options.conflicts_as_warnings {
                return Err(ResolveError::ModuleConflict {
                    first: first.clone(),
                    second: second.clone(),
                });
            }
            for (first, second) in &conflicts {
                warn!(%first, %second, "Ignoring conflict");
                self.warnings.push(format!("{first} conflicts with {second}"));
            }
        }

        let modules = self.ordered();
        debug!(count = modules.len(), "Resolved install plan");
        Ok(Resolution {
            modules,
            warnings: self.warnings,
        })
    }

    /// Adds a module to the plan. Returns false if it was already there.
    fn add_to_plan(&mut self, module: CkanModule) -> Result<bool, ResolveError> {
        if let Some(existing) = self.plan.get(&module.identifier) {
            if existing.version == module.version {
                return Ok(false);
            }
            return Err(ResolveError::ModuleConflict {
                first: existing.to_string(),
                second: module.to_string(),
            });
        }
        self.order.push(module.identifier.clone());
        self.plan.insert(module.identifier.clone(), module);
        Ok(true)
    }

    fn drain(&mut self, queue: &mut VecDeque<(CkanModule, bool)>) -> Result<(), ResolveError> {
        while let Some((module, explicit)) = queue.pop_front() {
            for dep in &module.depends {
                if let Some(found) = self.satisfy(dep, &module.identifier)? {
                    queue.push_back((found, false));
                }
            }

            if explicit {
                let mut optional: Vec<&RelationshipDescriptor> = Vec::new();
                if self.options.with_recommends {
                    optional.extend(&module.recommends);
                }
                if self.options.with_suggests {
                    optional.extend(&module.suggests);
                }
                for rel in optional {
                    self.try_optional(rel, &module.identifier);
                }
            }
        }
        Ok(())
    }

    /// Resolves a recommendation or suggestion on a copy of the plan,
    /// keeping it only if its whole closure resolves without conflicts.
    fn try_optional(&mut self, rel: &RelationshipDescriptor, from: &str) {
        let plan = self.plan.clone();
        let order = self.order.clone();

        let result = self.satisfy(rel, from).and_then(|found| {
            let mut sub = VecDeque::new();
            if let Some(module) = found {
                sub.push_back((module, false));
            }
            self.drain(&mut sub)?;
            match self.conflicts().into_iter().next() {
                Some((first, second)) => Err(ResolveError::ModuleConflict { first, second }),
                None => Ok(()),
            }
        });

        if let Err(e) = result {
            debug!(relationship = %rel, from, error = %e, "Skipping optional relationship");
            self.warnings.push(format!("Skipping {rel} for {from}: {e}"));
            self.plan = plan;
            self.order = order;
        }
    }

    /// Satisfies one relationship. Returns the module newly added to the plan, if any.
    fn satisfy(
        &mut self,
        rel: &RelationshipDescriptor,
        from: &str,
    ) -> Result<Option<CkanModule>, ResolveError> {
        if self
            .installed
            .get(&rel.name)
            .is_some_and(|v| rel.version_within(v))
        {
            return Ok(None);
        }
        if self.plan.values().any(|m| m.satisfies(rel)) {
            return Ok(None);
        }
        if let Some(planned) = self.plan.get(&rel.name) {
            return Err(ResolveError::ModuleConflict {
                first: planned.to_string(),
                second: format!("{from} (needs {rel})"),
            });
        }

        let chosen = self.pick(rel, Some(from))?;
        debug!(module = %chosen, for_relationship = %rel, from, "Selected dependency");
        self.add_to_plan(chosen.clone())?;
        Ok(Some(chosen))
    }

    /// Best available module satisfying `rel`: highest version, then lowest
    /// repository priority, then identifier.
    fn pick(&self, rel: &RelationshipDescriptor, from: Option<&str>) -> Result<CkanModule, ResolveError> {
        let mut candidates: Vec<&AvailableModule> = self
            .registry
            .available_entries()
            .filter(|a| a.module.satisfies(rel))
            .filter(|a| {
                self.options.allow_incompatible || self.comparator.compatible(self.game, &a.module)
            })
            .filter(|a| !self.plan.contains_key(&a.module.identifier))
            .filter(|a| !self.blocked_by_installed(&a.module))
            .collect();

        candidates.sort_by(|a, b| {
            b.module
                .version
                .cmp(&a.module.version)
                .then_with(|| {
                    let pa = self.registry.repository_priority(a.repository.as_deref());
                    let pb = self.registry.repository_priority(b.repository.as_deref());
                    pa.cmp(&pb)
                })
                .then_with(|| a.module.identifier.cmp(&b.module.identifier))
        });

        candidates
            .first()
            .map(|a| a.module.clone())
            .ok_or_else(|| ResolveError::ModuleNotFound {
                identifier: rel.name.clone(),
                required_by: from.map(str::to_string),
            })
    }

    /// A different installed version (or an autodetected copy) stands in the way.
    fn blocked_by_installed(&self, module: &CkanModule) -> bool {
        self.installed
            .get(&module.identifier)
            .is_some_and(|v| !matches!(v, ModuleVersion::Virtual { .. }))
    }

    /// Every conflicting pair among the plan and the installed modules it would join.
    fn conflicts(&self) -> Vec<(String, String)> {
        let planned: Vec<&CkanModule> = self.plan.values().collect();
        let installed: Vec<&CkanModule> = self
            .registry
            .installed_modules()
            .filter(|(id, _)| !self.removing.contains(*id) && !self.plan.contains_key(*id))
            .filter_map(|(_, m)| m.module.as_ref())
            .collect();

        let mut found = Vec::new();
        for (i, a) in planned.iter().enumerate() {
            for b in planned.iter().skip(i + 1).chain(installed.iter()) {
                if a.conflicts_with(b) || b.conflicts_with(a) {
                    found.push((a.to_string(), b.to_string()));
                }
            }
            for rel in &a.conflicts {
                let autodetected = rel.name != a.identifier
                    && self
                        .installed
                        .get(&rel.name)
                        .is_some_and(ModuleVersion::is_autodetected);
                if autodetected {
                    found.push((a.to_string(), format!("{} (autodetected)", rel.name)));
                }
            }
        }
        found
    }

    /// The plan with every module after the planned modules it depends on.
    fn ordered(&self) -> Vec<CkanModule> {
        let mut visited = HashSet::new();
        let mut out = Vec::with_capacity(self.plan.len());
        for id in &self.order {
            self.visit(id, &mut visited, &mut out);
        }
        out
    }

    fn visit(&self, id: &str, visited: &mut HashSet<String>, out: &mut Vec<CkanModule>) {
        if !visited.insert(id.to_string()) {
            return;
        }
        let Some(module) = self.plan.get(id) else {
            return;
        };
        for dep in &module.depends {
            let provider = self
                .plan
                .values()
                .find(|p| p.identifier != module.identifier && p.satisfies(dep));
            if let Some(provider) = provider {
                self.visit(&provider.identifier, visited, out);
            }
        }
        out.push(module.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::{GrasComparator, StrictComparator, YoyoComparator};
    use crate::registry::Repository;
    use std::collections::BTreeSet as Set;

    fn module(id: &str, version: &str, extra: &str) -> CkanModule {
        let doc = format!(
            r#"{{"identifier":"{id}","version":"{version}","license":"MIT","download":"http://x/{id}-{version}.zip"{extra}}}"#
        );
        CkanModule::from_json(&doc).unwrap()
    }

    fn game() -> GameVersion {
        GameVersion::new(1, 0, 4)
    }

    fn resolve(reg: &Registry, ids: &[&str], options: ResolverOptions) -> Result<Resolution, ResolveError> {
        let g = game();
        let ids: Vec<String> = ids.iter().map(|s| (*s).to_string()).collect();
        RelationshipResolver::new(reg, &g, &GrasComparator, options).resolve_identifiers(&ids)
    }

    fn ids(res: &Resolution) -> Vec<String> {
        res.identifiers()
    }

    #[test]
    fn test_range_excludes_newer_version() {
        let mut reg = Registry::empty();
        reg.add_available(module("X", "1", r#","depends":[{"name":"Y","min_version":"1","max_version":"2"}]"#));
        reg.add_available(module("Y", "3", ""));

        let err = resolve(&reg, &["X"], ResolverOptions::default()).unwrap_err();
        assert!(matches!(err, ResolveError::ModuleNotFound { ref identifier, .. } if identifier == "Y"));

        reg.add_available(module("Y", "1.5", ""));
        let res = resolve(&reg, &["X"], ResolverOptions::default()).unwrap();
        let y = res.modules.iter().find(|m| m.identifier == "Y").unwrap();
        assert_eq!(y.version.to_string(), "1.5");
        assert_eq!(res.modules.len(), 2);
    }

    #[test]
    fn test_dependencies_come_first() {
        let mut reg = Registry::empty();
        reg.add_available(module("A", "1", r#","depends":[{"name":"B"}]"#));
        reg.add_available(module("B", "1", r#","depends":[{"name":"C"}]"#));
        reg.add_available(module("C", "1", ""));
        let res = resolve(&reg, &["A"], ResolverOptions::default()).unwrap();
        assert_eq!(ids(&res), vec!["C", "B", "A"]);
    }

    #[test]
    fn test_installed_dependency_not_replanned() {
        let mut reg = Registry::empty();
        reg.add_available(module("A", "1", r#","depends":[{"name":"B"}]"#));
        reg.add_available(module("B", "2", ""));
        reg.register_module(module("B", "1", ""), Set::new(), Set::new());
        let res = resolve(&reg, &["A"], ResolverOptions::default()).unwrap();
        assert_eq!(ids(&res), vec!["A"]);
    }

    #[test]
    fn test_autodetected_satisfies_bounds() {
        let mut reg = Registry::empty();
        reg.add_available(module("A", "1", r#","depends":[{"name":"Lib","min_version":"9"}]"#));
        reg.register_dll("GameData/Lib.dll");
        let res = resolve(&reg, &["A"], ResolverOptions::default()).unwrap();
        assert_eq!(ids(&res), vec!["A"]);
    }

    #[test]
    fn test_provides_and_tie_breaks() {
        let mut reg = Registry::empty();
        reg.add_repository(Repository::new("main", "http://main", 0)).unwrap();
        reg.add_repository(Repository::new("extra", "http://extra", 10)).unwrap();
        reg.add_available(module("A", "1", r#","depends":[{"name":"Virt"}]"#));
        reg.add_available_from(module("ImplZ", "2", r#","provides":["Virt"]"#), "main");
        reg.add_available_from(module("ImplB", "2", r#","provides":["Virt"]"#), "extra");
        reg.add_available_from(module("ImplC", "1", r#","provides":["Virt"]"#), "main");

        let res = resolve(&reg, &["A"], ResolverOptions::default()).unwrap();
        assert_eq!(ids(&res), vec!["ImplZ", "A"]);
    }

    #[test]
    fn test_same_priority_breaks_on_identifier() {
        let mut reg = Registry::empty();
        reg.add_available(module("A", "1", r#","depends":[{"name":"Virt"}]"#));
        reg.add_available(module("ImplB", "1", r#","provides":["Virt"]"#));
        reg.add_available(module("ImplA", "1", r#","provides":["Virt"]"#));
        let res = resolve(&reg, &["A"], ResolverOptions::default()).unwrap();
        assert_eq!(ids(&res), vec!["ImplA", "A"]);
    }

    #[test]
    fn test_incompatible_candidates_skipped() {
        let mut reg = Registry::empty();
        reg.add_available(module("A", "1", r#","depends":[{"name":"B"}]"#));
        reg.add_available(module("B", "2", r#","ksp_version":"1.1.0""#));
        reg.add_available(module("B", "1", r#","ksp_version":"1.0.4""#));

        let res = resolve(&reg, &["A"], ResolverOptions::default()).unwrap();
        assert_eq!(res.modules[0].version.to_string(), "1");

        let g = game();
        let relaxed = ResolverOptions {
            allow_incompatible: true,
            ..ResolverOptions::default()
        };
        let res = RelationshipResolver::new(&reg, &g, &StrictComparator, relaxed)
            .resolve_identifiers(&["A".to_string()])
            .unwrap();
        assert_eq!(res.modules[0].version.to_string(), "2");
    }

    #[test]
    fn test_conflict_is_fatal_or_warning() {
        let mut reg = Registry::empty();
        reg.add_available(module("A", "1", r#","conflicts":[{"name":"B"}]"#));
        reg.register_module(module("B", "1", ""), Set::new(), Set::new());

        let err = resolve(&reg, &["A"], ResolverOptions::default()).unwrap_err();
        assert!(matches!(err, ResolveError::ModuleConflict { .. }));

        let lenient = ResolverOptions {
            conflicts_as_warnings: true,
            ..ResolverOptions::default()
        };
        let res = resolve(&reg, &["A"], lenient).unwrap();
        assert_eq!(ids(&res), vec!["A"]);
        assert_eq!(res.warnings.len(), 1);
    }

    #[test]
    fn test_conflict_with_replaced_module_ignored() {
        let mut reg = Registry::empty();
        reg.add_available(module("A", "2", r#","conflicts":[{"name":"B","max_version":"1"}]"#));
        reg.add_available(module("B", "2", ""));
        reg.register_module(module("B", "1", ""), Set::new(), Set::new());
        let g = game();
        let res = RelationshipResolver::new(&reg, &g, &YoyoComparator, ResolverOptions::default())
            .removing(["B"])
            .resolve_identifiers(&["A".to_string(), "B".to_string()])
            .unwrap();
        assert_eq!(res.modules.len(), 2);
    }

    #[test]
    fn test_recommends_soft_failure() {
        let mut reg = Registry::empty();
        reg.add_available(module(
            "A",
            "1",
            r#","recommends":[{"name":"Missing"},{"name":"Nice"}],"suggests":[{"name":"Extra"}]"#,
        ));
        reg.add_available(module("Nice", "1", ""));
        reg.add_available(module("Extra", "1", ""));

        let opts = ResolverOptions {
            with_recommends: true,
            ..ResolverOptions::default()
        };
        let res = resolve(&reg, &["A"], opts).unwrap();
        assert_eq!(ids(&res), vec!["A", "Nice"]);
        assert_eq!(res.warnings.len(), 1);
        assert!(res.warnings[0].contains("Missing"));

        let all = ResolverOptions {
            with_recommends: true,
            with_suggests: true,
            ..ResolverOptions::default()
        };
        let res = resolve(&reg, &["A"], all).unwrap();
        assert!(ids(&res).contains(&"Extra".to_string()));
    }

    #[test]
    fn test_recommends_not_followed_for_dependencies() {
        let mut reg = Registry::empty();
        reg.add_available(module("A", "1", r#","depends":[{"name":"B"}]"#));
        reg.add_available(module("B", "1", r#","recommends":[{"name":"C"}]"#));
        reg.add_available(module("C", "1", ""));
        let opts = ResolverOptions {
            with_recommends: true,
            ..ResolverOptions::default()
        };
        let res = resolve(&reg, &["A"], opts).unwrap();
        assert_eq!(ids(&res), vec!["B", "A"]);
    }

    #[test]
    fn test_already_installed() {
        let mut reg = Registry::empty();
        reg.add_available(module("A", "1", ""));
        reg.register_module(module("A", "1", ""), Set::new(), Set::new());
        assert!(matches!(
            resolve(&reg, &["A"], ResolverOptions::default()),
            Err(ResolveError::AlreadyInstalled(_))
        ));
    }

    #[test]
    fn test_unknown_identifier() {
        let reg = Registry::empty();
        assert!(matches!(
            resolve(&reg, &["Ghost"], ResolverOptions::default()),
            Err(ResolveError::ModuleNotFound { required_by: None, .. })
        ));
    }

    #[test]
    fn test_planned_version_out_of_bounds_conflicts() {
        let mut reg = Registry::empty();
        reg.add_available(module("A", "1", r#","depends":[{"name":"Lib","max_version":"1"}]"#));
        reg.add_available(module("Lib", "1", ""));
        reg.add_available(module("Lib", "2", ""));
        let g = game();
        let lib2 = reg.all_available("Lib")[1].clone();
        let a = reg.all_available("A")[0].clone();
        let err = RelationshipResolver::new(&reg, &g, &GrasComparator, ResolverOptions::default())
            .resolve_modules(vec![lib2, a])
            .unwrap_err();
        assert!(matches!(err, ResolveError::ModuleConflict { .. }));
    }
}
