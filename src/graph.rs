//! Project discovery and the cross-project dependency graph.
//!
//! Discovery walks a root directory looking for `project.json` files,
//! building a graph whose edges are `use`/`use-private`/`use-build`/
//! `use-runtime` references between projects. A dependency can be declared
//! before the project that provides it has been discovered, so unresolved
//! references are recorded as placeholder nodes and filled in as crawling
//! continues; [`Crawler::finalize`] turns that graph into a concrete build
//! order with Kahn's algorithm, the same walk `bake_crawler_walk` used.

use std::{
    collections::{BTreeMap, VecDeque},
    path::{Path, PathBuf},
};

use walkdir::WalkDir;

use crate::{
    error::{BakeError, Result},
    project::{Project, ProjectId},
};

/// Directories the crawler never descends into, beyond a project's own
/// layout directories once a project root is found.
const ALWAYS_SKIP: &[&str] = &[".git", ".bake_cache", "node_modules"];

/// Subdirectories skipped once we're inside an already-discovered project,
/// so generated or vendored content under it is never mistaken for a
/// nested project.
const PROJECT_INTERNAL_SKIP: &[&str] =
    &["src", "include", "config", "data", "test", "etc", "lib", "bin", "install", "examples", "bake", ".bake_cache"];

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry.file_name().to_str().map(|s| s.starts_with('.')).unwrap_or(false)
}

/// A project's slot in the graph: either a fully discovered project, or a
/// placeholder created because something declared a dependency on this id
/// before its `project.json` was found.
enum Slot {
    Discovered { project: Project, manifest_path: PathBuf },
    Placeholder,
}

struct GraphNode {
    slot: Slot,
    /// Ids this node depends on (build order predecessors).
    depends_on: Vec<ProjectId>,
    /// Ids that depend on this node (the reverse edges `bake_crawler_decrease_dependents` walks).
    dependents: Vec<ProjectId>,
    unresolved: usize,
}

/// Lets an embedder plug in out-of-scope dependency resolution (fetching a
/// bundle from a registry, cloning a repository, ...) for ids the crawler
/// can't find locally. The default behaviour is to leave such dependencies
/// unresolved, matching the rewrite's smaller scope.
pub trait MissingDependencyResolver {
    fn resolve(&mut self, id: &ProjectId) -> Option<PathBuf> {
        let _ = id;
        None
    }
}

/// A resolver that never resolves anything - the default when none is
/// supplied.
pub struct NoopResolver;
impl MissingDependencyResolver for NoopResolver {}

pub struct Crawler {
    nodes: BTreeMap<ProjectId, GraphNode>,
    /// Build order, populated once [`Crawler::finalize`] succeeds.
    order: Vec<ProjectId>,
}

impl Crawler {
    pub fn new() -> Self {
        Self { nodes: BTreeMap::new(), order: Vec::new() }
    }

    /// Walks `root` looking for `project.json` files and adds every project
    /// found, along with placeholders for any dependency that isn't found
    /// under `root` (resolved later via `resolver` during [`finalize`]).
    pub fn crawl(&mut self, root: &Path) -> Result<()> {
        let walker = WalkDir::new(root).into_iter().filter_entry(|e| self.should_descend(e));

        for entry in walker {
            let entry = entry.map_err(|e| BakeError::Io {
                path: e.path().unwrap_or(root).to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
            })?;

            if !entry.file_type().is_dir() {
                continue;
            }
            let manifest_path = entry.path().join("project.json");
            if !manifest_path.is_file() {
                continue;
            }

            let project = Project::load(entry.path())?;
            self.add(project, manifest_path)?;
        }

        Ok(())
    }

    fn should_descend(&self, entry: &walkdir::DirEntry) -> bool {
        if entry.depth() == 0 {
            return true;
        }
        if is_hidden(entry) {
            return false;
        }
        let Some(name) = entry.file_name().to_str() else { return false };
        if ALWAYS_SKIP.contains(&name) {
            return false;
        }
        // Once any ancestor directory of this entry held a project.json,
        // treat its conventional subdirectories as internal, not a place
        // to discover further nested projects.
        if entry.path().ancestors().skip(1).any(|p| p.join("project.json").is_file())
            && PROJECT_INTERNAL_SKIP.contains(&name)
        {
            return false;
        }
        true
    }

    /// Adds a discovered project, replacing its placeholder if one exists.
    /// Declaring the same id twice with two *real* manifests is a hard
    /// error - the original crawler treated this the same way.
    pub fn add(&mut self, project: Project, manifest_path: PathBuf) -> Result<()> {
        let id = project.id.clone();
        let depends_on: Vec<ProjectId> = project
            .build_dependencies()
            .filter_map(|dep| ProjectId::parse(dep).ok())
            .collect();

        match self.nodes.get(&id) {
            Some(GraphNode { slot: Slot::Discovered { manifest_path: first, .. }, .. }) => {
                return Err(BakeError::AmbiguousDependency {
                    id: id.dotted().to_string(),
                    first: first.clone(),
                    second: manifest_path,
                });
            }
            _ => {}
        }

        for dep in &depends_on {
            self.ensure_placeholder(dep);
            self.nodes.get_mut(dep).expect("just ensured").dependents.push(id.clone());
        }

        let unresolved = depends_on.len();
        self.nodes.insert(id, GraphNode { slot: Slot::Discovered { project, manifest_path }, depends_on, dependents: Vec::new(), unresolved });

        Ok(())
    }

    fn ensure_placeholder(&mut self, id: &ProjectId) {
        self.nodes.entry(id.clone()).or_insert_with(|| GraphNode { slot: Slot::Placeholder, depends_on: Vec::new(), dependents: Vec::new(), unresolved: 0 });
    }

    /// Recursively attempts to resolve every remaining placeholder via
    /// `resolver`, mirroring `bake_crawler_lookupDependency`'s fallback
    /// chain (dev-source / source locate, else an installed binary, else
    /// leave unresolved).
    pub fn resolve_recursive(&mut self, resolver: &mut dyn MissingDependencyResolver) -> Result<()> {
        let placeholder_ids: Vec<ProjectId> = self
            .nodes
            .iter()
            .filter(|(_, n)| matches!(n.slot, Slot::Placeholder))
            .map(|(id, _)| id.clone())
            .collect();

        for id in placeholder_ids {
            if let Some(path) = resolver.resolve(&id) {
                let project = Project::load(&path)?;
                if project.id != id {
                    continue;
                }
                let manifest_path = path.join("project.json");
                let new_deps: Vec<ProjectId> =
                    project.build_dependencies().filter_map(|dep| ProjectId::parse(dep).ok()).collect();
                for dep in &new_deps {
                    self.ensure_placeholder(dep);
                    self.nodes.get_mut(dep).expect("just ensured").dependents.push(id.clone());
                }
                if let Some(node) = self.nodes.get_mut(&id) {
                    node.slot = Slot::Discovered { project, manifest_path };
                    node.depends_on = new_deps;
                    node.unresolved = node.depends_on.len();
                }
            }
        }

        Ok(())
    }

    /// Computes a build order with Kahn's algorithm over the
    /// dependency-count graph: projects with zero unresolved dependencies
    /// are ready first; building one decrements its dependents' counters,
    /// making more projects ready as it goes. A leftover count after the
    /// queue drains means a cycle - except for a `standalone` project,
    /// whose dependencies that never got discovered (stayed placeholders)
    /// are dropped from its own in-degree rather than left blocking it
    /// forever: it's declared able to build from its own vendored copy of
    /// what it can't find.
    pub fn finalize(&mut self) -> Result<&[ProjectId]> {
        let total = self.nodes.iter().filter(|(_, n)| matches!(n.slot, Slot::Discovered { .. })).count();

        let mut remaining: BTreeMap<ProjectId, usize> = BTreeMap::new();
        for (id, n) in &self.nodes {
            let Slot::Discovered { project, .. } = &n.slot else { continue };
            let count = if project.standalone {
                n.depends_on
                    .iter()
                    .filter(|dep| matches!(self.nodes.get(*dep).map(|gn| &gn.slot), Some(Slot::Discovered { .. })))
                    .count()
            } else {
                n.unresolved
            };
            remaining.insert(id.clone(), count);
        }

        let mut ready: VecDeque<ProjectId> =
            remaining.iter().filter(|(_, &count)| count == 0).map(|(id, _)| id.clone()).collect();

        let mut order = Vec::with_capacity(total);

        while let Some(id) = ready.pop_front() {
            remaining.remove(&id);
            order.push(id.clone());

            let dependents = self.nodes.get(&id).map(|n| n.dependents.clone()).unwrap_or_default();
            for dependent in dependents {
                if let Some(count) = remaining.get_mut(&dependent) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        ready.push_back(dependent);
                    }
                }
            }
        }

        if order.len() != total {
            let stuck: Vec<String> = remaining.keys().map(ProjectId::to_string).collect();
            return Err(BakeError::CycleDetected { built: order.len(), total, stuck });
        }

        self.order = order;
        Ok(&self.order)
    }

    pub fn build_order(&self) -> &[ProjectId] {
        &self.order
    }

    pub fn project(&self, id: &ProjectId) -> Option<&Project> {
        match self.nodes.get(id)?.slot {
            Slot::Discovered { ref project, .. } => Some(project),
            Slot::Placeholder => None,
        }
    }

    pub fn project_mut(&mut self, id: &ProjectId) -> Option<&mut Project> {
        match self.nodes.get_mut(id)?.slot {
            Slot::Discovered { ref mut project, .. } => Some(project),
            Slot::Placeholder => None,
        }
    }

    pub fn dependencies_of(&self, id: &ProjectId) -> &[ProjectId] {
        self.nodes.get(id).map(|n| n.depends_on.as_slice()).unwrap_or(&[])
    }

    pub fn unresolved_count(&self) -> usize {
        self.nodes.iter().filter(|(_, n)| matches!(n.slot, Slot::Placeholder)).count()
    }
}

impl Default for Crawler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_project(dir: &Path, id: &str, uses: &[&str]) {
        fs::create_dir_all(dir).unwrap();
        let uses_json = uses.iter().map(|u| format!("\"{u}\"")).collect::<Vec<_>>().join(",");
        fs::write(
            dir.join("project.json"),
            format!(r#"{{"id": "{id}", "value": {{"language": "c", "use": [{uses_json}]}}}}"#),
        )
        .unwrap();
    }

    #[test]
    fn build_order_respects_dependencies() {
        let tmp = tempfile::tempdir().unwrap();
        write_project(&tmp.path().join("a"), "a", &["b"]);
        write_project(&tmp.path().join("b"), "b", &[]);

        let mut crawler = Crawler::new();
        crawler.crawl(tmp.path()).unwrap();
        let order = crawler.finalize().unwrap();

        let pos_a = order.iter().position(|id| id.dotted() == "a").unwrap();
        let pos_b = order.iter().position(|id| id.dotted() == "b").unwrap();
        assert!(pos_b < pos_a);
    }

    #[test]
    fn cycle_is_detected() {
        let tmp = tempfile::tempdir().unwrap();
        write_project(&tmp.path().join("a"), "a", &["b"]);
        write_project(&tmp.path().join("b"), "b", &["a"]);

        let mut crawler = Crawler::new();
        crawler.crawl(tmp.path()).unwrap();
        let err = crawler.finalize().unwrap_err();
        assert!(matches!(err, BakeError::CycleDetected { .. }));
    }

    #[test]
    fn duplicate_id_is_a_hard_error() {
        let tmp = tempfile::tempdir().unwrap();
        write_project(&tmp.path().join("a1"), "dup", &[]);
        write_project(&tmp.path().join("a2"), "dup", &[]);

        let mut crawler = Crawler::new();
        let err = crawler.crawl(tmp.path()).unwrap_err();
        assert!(matches!(err, BakeError::AmbiguousDependency { .. }));
    }

    #[test]
    fn missing_dependency_stays_unresolved_without_a_resolver() {
        let tmp = tempfile::tempdir().unwrap();
        write_project(&tmp.path().join("a"), "a", &["ghost"]);

        let mut crawler = Crawler::new();
        crawler.crawl(tmp.path()).unwrap();
        assert_eq!(crawler.unresolved_count(), 1);
        assert!(crawler.finalize().is_err());
    }

    #[test]
    fn standalone_project_builds_despite_a_missing_dependency() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("a")).unwrap();
        fs::write(
            tmp.path().join("a/project.json"),
            r#"{"id": "a", "value": {"language": "c", "use": ["ghost"], "standalone": true}}"#,
        )
        .unwrap();

        let mut crawler = Crawler::new();
        crawler.crawl(tmp.path()).unwrap();
        assert_eq!(crawler.unresolved_count(), 1);
        let order = crawler.finalize().unwrap();
        assert_eq!(order, &[ProjectId::parse("a").unwrap()]);
    }
}
