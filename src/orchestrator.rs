//! Drives a single project, and a whole dependency graph, through the
//! build lifecycle: dependee configuration merge, attribute resolution,
//! the check-dependencies staleness pass, the driver phases, link
//! resolution, and install.

use std::{
    fs,
    path::Path,
    time::SystemTime,
};

use serde_json::Value;

use crate::{
    config::BakeConfig,
    driver::{DriverContext, DriverHost, Phase},
    error::{BakeError, Result},
    graph::Crawler,
    installer::Installer,
    paths::EnvPaths,
    project::ProjectId,
    rules::{FileList, FileRecord},
};

pub struct Orchestrator {
    pub paths: EnvPaths,
    pub drivers: DriverHost,
    pub crawler: Crawler,
    pub config: BakeConfig,
}

impl Orchestrator {
    pub fn new(paths: EnvPaths, drivers: DriverHost, crawler: Crawler, config: BakeConfig) -> Self {
        Self { paths, drivers, crawler, config }
    }

    pub fn platform_config(&self) -> String {
        format!("{}-{}", self.paths.platform, self.paths.config)
    }

    /// Builds every project in the crawler's computed build order.
    pub fn build_all(&mut self) -> Result<()> {
        let order = self.crawler.build_order().to_vec();
        for id in &order {
            self.build_project(id)?;
        }
        Ok(())
    }

    /// Runs the full lifecycle for one project: dependee config merge,
    /// attribute resolution, the check-dependencies staleness pass, init,
    /// setup, generate, pre-build install, prebuild, link resolution,
    /// build, postbuild (itself followed by the postbuild install, folded
    /// into the `Postbuild` driver phase's install pass).
    pub fn build_project(&mut self, id: &ProjectId) -> Result<()> {
        let span = tracing::info_span!("build_project", project = %id.dotted());
        let _enter = span.enter();

        self.merge_dependee_config(id)?;
        self.resolve_project_drivers(id)?;
        self.check_dependencies(id)?;

        if self.should_skip_keep_binary(id)? {
            tracing::info!("keep-binary set and artefact present, skipping rebuild");
            return Ok(());
        }

        self.run_phase(id, Phase::Init)?;
        self.run_phase(id, Phase::Setup)?;
        self.run_phase(id, Phase::Generate)?;

        let platform_config = self.platform_config();
        let project = self.require_project(id)?.clone();
        Installer::new(&mut self.paths).install_prebuild(&project, &platform_config)?;

        self.run_phase(id, Phase::Prebuild)?;
        self.resolve_links(id)?;
        self.run_phase(id, Phase::Build)?;
        self.run_phase(id, Phase::Postbuild)?;

        let project = self.require_project(id)?.clone();
        Installer::new(&mut self.paths).install_postbuild(&project, &platform_config)?;

        Ok(())
    }

    pub fn test_project(&mut self, id: &ProjectId) -> Result<()> {
        self.run_phase(id, Phase::Test)
    }

    pub fn coverage_project(&mut self, id: &ProjectId) -> Result<()> {
        self.run_phase(id, Phase::Coverage)
    }

    pub fn clean_project(&mut self, id: &ProjectId) -> Result<()> {
        let span = tracing::info_span!("clean_project", project = %id.dotted());
        let _enter = span.enter();

        self.run_phase(id, Phase::Clean)?;

        let platform_config = self.platform_config();
        let project = self.require_project(id)?.clone();
        let cache = project.cache_path();
        if cache.is_dir() {
            std::fs::remove_dir_all(&cache).map_err(|e| BakeError::Io { path: cache, source: e })?;
        }
        Installer::new(&mut self.paths).uninstall(&project, &platform_config)?;
        Ok(())
    }

    fn require_project(&self, id: &ProjectId) -> Result<&crate::project::Project> {
        self.crawler.project(id).ok_or_else(|| BakeError::DriverRegistration {
            driver: "orchestrator".to_string(),
            message: format!("project '{id}' is unresolved (still a placeholder)"),
        })
    }

    fn run_phase(&mut self, id: &ProjectId, phase: Phase) -> Result<()> {
        let mut project = self.require_project(id)?.clone();
        let Some(driver_id) = project.language_driver_id() else { return Ok(()) };

        let platform_config = self.platform_config();

        if phase == Phase::Build {
            if let Some(driver_ref) = self.drivers.get(&driver_id) {
                project.artefact_filename = driver_ref.artefact_name(&project);
            }
            self.evaluate_rule_graph(&driver_id, &project, &platform_config)?;
        }

        if let Some(mut driver_ref) = self.drivers.get_mut(&driver_id) {
            let mut ctx = DriverContext { project: &project, paths: &mut self.paths, platform_config: &platform_config };
            driver_ref.run_phase(phase, &mut ctx)?;
        }

        if let Some(slot) = self.crawler.project_mut(id) {
            *slot = project;
        }
        Ok(())
    }

    /// If `driver_id` registered a rule graph template, evaluates a fresh
    /// per-project instance of it against `project`'s own root, seeding the
    /// `ARTEFACT` node with the artefact path the driver says this project
    /// should produce. A driver with no rule graph (one that does all its
    /// work in `Driver::build` directly, like a stub test driver) is left
    /// untouched - the graph is this crate's demand-driven alternative to
    /// that, not a mandatory layer on top of it.
    fn evaluate_rule_graph(&self, driver_id: &str, project: &crate::project::Project, platform_config: &str) -> Result<()> {
        let Some(template) = self.drivers.rule_graph(driver_id) else { return Ok(()) };
        if !template.has_node("ARTEFACT") {
            return Ok(());
        }
        let graph = template.instantiate();
        let seed = project
            .artefact_path(platform_config)
            .map(|p| FileList(vec![FileRecord::stat(p)]))
            .unwrap_or_default();
        graph
            .evaluate_seeded("ARTEFACT", &project.path, seed)
            .map_err(|e| e.context(format!("building '{}'", project.id.dotted())))?;
        Ok(())
    }

    /// Runs the attribute interpolation engine over this project's driver
    /// configs, populating `Project.drivers` with the resolved bindings a
    /// driver actually reads. Must run after dependee config has been
    /// merged in, since `${dependee ...}` placeholders need the merged
    /// values to resolve against.
    fn resolve_project_drivers(&mut self, id: &ProjectId) -> Result<()> {
        let mut project = self.require_project(id)?.clone();
        let dependee = self.crawler.dependencies_of(id).first().cloned().and_then(|dep_id| self.crawler.project(&dep_id).cloned());
        project.resolve_drivers(dependee.as_ref(), &mut self.paths)?;
        if let Some(slot) = self.crawler.project_mut(id) {
            *slot = project;
        }
        Ok(())
    }

    /// Compares each build dependency's artefact mtime against this
    /// project's own (predicted, if not yet built) artefact: a dependency
    /// that's newer forces this project's artefact to be deleted so the
    /// next build sees it as stale and rebuilds it, the same cascade
    /// `bake_cache_check` drove off directory mtimes. A dependency this
    /// project can't resolve to a built artefact is only tolerated when
    /// this project is `standalone` (its own vendored copy of that
    /// dependency's sources covers the gap) - otherwise the build aborts
    /// rather than silently proceeding against a missing dependency.
    fn check_dependencies(&mut self, id: &ProjectId) -> Result<()> {
        let project = self.require_project(id)?.clone();
        let platform_config = self.platform_config();

        let own_artefact = project.artefact_path(&platform_config).or_else(|| {
            let driver_id = project.language_driver_id()?;
            let name = self.drivers.get(&driver_id)?.artefact_name(&project)?;
            Some(project.bin_path(&platform_config).join(name))
        });
        let own_mtime = own_artefact.as_ref().and_then(|p| mtime_of(p));

        let mut force_rebuild = false;
        for dep_raw in project.build_dependencies() {
            let Ok(dep_id) = ProjectId::parse(dep_raw) else { continue };
            let Some(dep) = self.crawler.project(&dep_id) else {
                if project.standalone {
                    tracing::debug!(dependency = dep_raw, "unresolved dependency tolerated: project is standalone");
                    continue;
                }
                return Err(BakeError::DriverCallback {
                    project: project.id.dotted().to_string(),
                    node: "check-dependencies".to_string(),
                    detail: format!(" (dependency '{dep_raw}' could not be resolved and project is not standalone)"),
                });
            };
            if dep.language_driver_id().is_none() {
                continue;
            }

            let dep_mtime = dep.artefact_path(&platform_config).as_ref().and_then(|p| mtime_of(p));
            match dep_mtime {
                None if project.standalone => {
                    tracing::debug!(dependency = dep_raw, "missing dependency artefact tolerated: project is standalone");
                }
                None => {
                    return Err(BakeError::DriverCallback {
                        project: project.id.dotted().to_string(),
                        node: "check-dependencies".to_string(),
                        detail: format!(" (dependency '{dep_raw}' has no built artefact and project is not standalone)"),
                    });
                }
                Some(dep_t) if own_mtime.map(|own_t| dep_t > own_t).unwrap_or(true) => {
                    force_rebuild = true;
                }
                Some(_) => {}
            }
        }

        if force_rebuild {
            if let Some(artefact) = &own_artefact {
                if artefact.exists() {
                    tracing::info!(artefact = %artefact.display(), "dependency is newer, forcing rebuild");
                    fs::remove_file(artefact).map_err(|e| BakeError::Io { path: artefact.clone(), source: e })?;
                }
            }
        }
        Ok(())
    }

    /// Merges each dependency's `dependee` configuration block into this
    /// project's driver configs: arrays are concatenated (deduplicated),
    /// scalars must agree across every contributing dependee or the merge
    /// is rejected as ambiguous.
    fn merge_dependee_config(&mut self, id: &ProjectId) -> Result<()> {
        let deps = self.crawler.dependencies_of(id).to_vec();
        let contributions: Vec<(ProjectId, serde_json::Map<String, Value>)> = deps
            .into_iter()
            .filter_map(|dep| self.crawler.project(&dep).filter(|p| !p.dependee.is_empty()).map(|p| (dep, p.dependee.clone())))
            .collect();

        if contributions.is_empty() {
            return Ok(());
        }

        let mut project = self.require_project(id)?.clone();
        for (dep_id, block) in contributions {
            for (key, incoming) in block {
                merge_one(&mut project.driver_configs, &key, incoming, dep_id.dotted())?;
            }
        }

        if let Some(slot) = self.crawler.project_mut(id) {
            *slot = project;
        }
        Ok(())
    }

    /// Resolves every `link` entry before this project is built, so its
    /// driver's `build` (or rule-graph `ARTEFACT` evaluation) can find
    /// whatever it names at link time. An entry that names another project
    /// already in the graph is handled directly: its artefact just needs to
    /// be reachable from the shared `env/lib` directory, which
    /// `install_prebuild`/`install_postbuild` already keep current for any
    /// package. Anything else is handed to this project's own driver via
    /// [`crate::driver::DriverRef::link_to_lib`], which knows how to turn a
    /// named system library into an actual file (e.g. `pthread` ->
    /// `libpthread.so`); entries neither side recognises are assumed to be
    /// literal linker flags and left untouched.
    fn resolve_links(&mut self, id: &ProjectId) -> Result<()> {
        let project = self.require_project(id)?.clone();
        let platform_config = self.platform_config();
        let driver_ref = project.language_driver_id().and_then(|driver_id| self.drivers.get(&driver_id));

        for entry in &project.link {
            if let Ok(dep_id) = ProjectId::parse(entry) {
                if self.crawler.project(&dep_id).is_some() {
                    // Another project in the graph: its own install step
                    // (already run for every project built before this one,
                    // by build order) is what makes it reachable.
                    continue;
                }
            }

            let Some(driver_ref) = &driver_ref else { continue };
            let Some(lib_path) = driver_ref.link_to_lib(entry) else { continue };
            if !lib_path.exists() {
                continue;
            }

            let dest_dir = self.paths.lib_dir();
            fs::create_dir_all(&dest_dir).map_err(|e| BakeError::Io { path: dest_dir.clone(), source: e })?;
            let dest = dest_dir.join(lib_path.file_name().expect("resolved library has a filename"));
            if !dest.exists() {
                let _ = fs::copy(&lib_path, &dest);
            }
        }
        Ok(())
    }

    fn should_skip_keep_binary(&self, id: &ProjectId) -> Result<bool> {
        let project = self.require_project(id)?;
        if !(project.keep_binary || self.config.keep_binary) {
            return Ok(false);
        }
        let platform_config = self.platform_config();
        Ok(project.artefact_path(&platform_config).map(|p| p.exists()).unwrap_or(false))
    }
}

fn merge_one(base: &mut std::collections::BTreeMap<String, Value>, key: &str, incoming: Value, dependee: &str) -> Result<()> {
    match base.get_mut(key) {
        None => {
            base.insert(key.to_string(), incoming);
            Ok(())
        }
        Some(existing) if *existing == incoming => Ok(()),
        Some(Value::Array(existing)) => {
            if let Value::Array(new_items) = incoming {
                for item in new_items {
                    if !existing.contains(&item) {
                        existing.push(item);
                    }
                }
                Ok(())
            } else {
                Err(BakeError::ConfigConflict {
                    key: key.to_string(),
                    dependee: dependee.to_string(),
                    existing: existing_to_string(existing),
                    incoming: incoming.to_string(),
                })
            }
        }
        Some(existing) => Err(BakeError::ConfigConflict {
            key: key.to_string(),
            dependee: dependee.to_string(),
            existing: existing.to_string(),
            incoming: incoming.to_string(),
        }),
    }
}

fn existing_to_string(v: &[Value]) -> String {
    Value::Array(v.to_vec()).to_string()
}

fn mtime_of(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::{Manifest, Project};
    use std::fs;

    fn project_at(tmp: &std::path::Path, id: &str, json_extra: &str) -> Project {
        fs::create_dir_all(tmp).unwrap();
        let manifest_text = format!(r#"{{"id": "{id}" {json_extra}}}"#);
        fs::write(tmp.join("project.json"), &manifest_text).unwrap();
        let manifest = Manifest::parse(&manifest_text, &tmp.join("project.json")).unwrap();
        Project::from_manifest(tmp.to_path_buf(), manifest).unwrap()
    }

    fn test_orchestrator(home: &std::path::Path) -> Orchestrator {
        Orchestrator::new(EnvPaths::init(Some(home.to_path_buf()), None, None), DriverHost::new(), Crawler::new(), BakeConfig::default())
    }

    #[test]
    fn dependee_config_merges_arrays_and_detects_conflicts() {
        let tmp = tempfile::tempdir().unwrap();
        let home = tempfile::tempdir().unwrap();

        let dep = project_at(
            &tmp.path().join("dep"),
            "dep",
            r#", "dependee": {"lang.c": {"cflags": ["-DFOO"]}}"#,
        );
        let consumer = project_at(&tmp.path().join("consumer"), "consumer", r#", "value": {"use": ["dep"]}"#);

        let mut orch = test_orchestrator(home.path());
        orch.crawler.add(dep.clone(), tmp.path().join("dep/project.json")).unwrap();
        orch.crawler.add(consumer, tmp.path().join("consumer/project.json")).unwrap();

        let consumer_id = ProjectId::parse("consumer").unwrap();
        orch.merge_dependee_config(&consumer_id).unwrap();

        let merged = orch.crawler.project(&consumer_id).unwrap();
        assert_eq!(merged.driver_configs["lang.c"]["cflags"], serde_json::json!(["-DFOO"]));
    }

    #[test]
    fn scalar_conflict_between_dependees_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let home = tempfile::tempdir().unwrap();

        let dep_a = project_at(&tmp.path().join("a"), "a", r#", "dependee": {"lang.c": {"std": "c11"}}"#);
        let dep_b = project_at(&tmp.path().join("b"), "b", r#", "dependee": {"lang.c": {"std": "c99"}}"#);
        let consumer =
            project_at(&tmp.path().join("consumer"), "consumer", r#", "value": {"use": ["a", "b"]}"#);

        let mut orch = test_orchestrator(home.path());
        orch.crawler.add(dep_a, tmp.path().join("a/project.json")).unwrap();
        orch.crawler.add(dep_b, tmp.path().join("b/project.json")).unwrap();
        orch.crawler.add(consumer, tmp.path().join("consumer/project.json")).unwrap();

        let consumer_id = ProjectId::parse("consumer").unwrap();
        let result = orch.merge_dependee_config(&consumer_id);
        assert!(result.is_err());
    }

    #[test]
    fn keep_binary_skips_rebuild_when_artefact_exists() {
        let tmp = tempfile::tempdir().unwrap();
        let home = tempfile::tempdir().unwrap();
        let mut project = project_at(&tmp.path().join("p"), "p", r#", "value": {"keep-binary": true}"#);
        project.artefact_filename = Some("libp.so".to_string());

        let mut orch = test_orchestrator(home.path());
        let bin = project.bin_path(&orch.platform_config());
        fs::create_dir_all(&bin).unwrap();
        fs::write(bin.join("libp.so"), b"prebuilt").unwrap();

        orch.crawler.add(project, tmp.path().join("p/project.json")).unwrap();
        let id = ProjectId::parse("p").unwrap();
        assert!(orch.should_skip_keep_binary(&id).unwrap());
    }
}
