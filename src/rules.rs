//! The demand-driven rule engine.
//!
//! A project's build is a small DAG of named [`Node`]s: [`Node::Pattern`]
//! and [`Node::File`] are leaves that resolve to files on disk, [`Node::Rule`]
//! derives new files from an input list (1-to-1 "map" rules, e.g. compiling
//! each `.c` to a `.o`, or N-to-1 "aggregate" rules that name their own
//! targets, e.g. archiving every `.o` into a `.a`), and [`Node::DependencyRule`]
//! dynamically grows its input list at evaluation time by parsing a
//! compiler-generated side file (e.g. a `.d` file listing header
//! dependencies) rather than from statically registered globs.
//!
//! Evaluation is postorder and demand-driven: a node's sources are resolved
//! (and built, if stale) before the node itself is considered, and a node
//! already evaluated this run is never visited twice. An *inherited* output
//! list threads down from the root (empty there) to every node; a leaf that
//! resolves to nothing falls back to it, and a `Named` target entry that
//! begins with `$` asks for it directly instead of naming a sibling node.
//!
//! Staleness is mtime comparison only, the same signal `rule.c` used: no
//! content hashing. A target is stale if it doesn't exist, or if any
//! source is strictly newer than it - equal timestamps are treated as
//! up to date, which matters on filesystems coarse enough that a rule and
//! its input can legitimately land in the same tick.

use std::{
    cell::RefCell,
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use crate::error::{io_err, BakeError, Result};

/// A source or target file as it was observed: `mtime` is `None` when the
/// path doesn't exist, which staleness comparisons treat as "infinitely
/// stale" (older than nothing, i.e. always forces a rebuild).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path: PathBuf,
    pub mtime: Option<SystemTime>,
}

impl FileRecord {
    pub fn stat(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mtime = fs::metadata(&path).and_then(|m| m.modified()).ok();
        Self { path, mtime }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FileList(pub Vec<FileRecord>);

impl FileList {
    pub fn paths(&self) -> Vec<PathBuf> {
        self.0.iter().map(|f| f.path.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn sorted_deduped(mut records: Vec<FileRecord>) -> Self {
        records.sort_by(|a, b| a.path.cmp(&b.path));
        records.dedup_by(|a, b| a.path == b.path);
        Self(records)
    }
}

/// An action a rule runs when its target is stale. Boxed so both
/// driver-provided closures and the orchestrator's own subprocess runner
/// can be installed uniformly.
pub type Action = Arc<dyn Fn(&[PathBuf], &[PathBuf]) -> Result<()> + Send + Sync>;

/// Maps a primary source path to the side file a previous action may have
/// produced alongside it (e.g. `foo.c` -> `foo.d`).
pub type DepFileFn = Arc<dyn Fn(&Path) -> PathBuf + Send + Sync>;

/// How a [`Node::Rule`] resolves its target(s).
#[derive(Clone)]
pub enum RuleTarget {
    /// 1-to-1 rename, e.g. `src/foo.c` -> `bin/foo.o`. Every source gets its
    /// own target; staleness is checked pairwise.
    Map(Arc<dyn Fn(&Path) -> PathBuf + Send + Sync>),
    /// N-to-1 aggregation: names one or more other nodes whose resolved
    /// outputs become this rule's target file list (e.g. naming the
    /// `OBJECTS` pattern so an archive rule's target is "whatever object
    /// files already exist"). An entry that begins with `$` is not a node
    /// name: it asks for the inherited output list passed down from this
    /// node's caller instead.
    Named(Vec<String>),
    /// N-to-1 aggregation against a single literal target path, e.g. always
    /// archiving into `lib<name>.a` regardless of how many sources feed it.
    File(PathBuf),
}

impl std::fmt::Debug for RuleTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleTarget::Map(_) => f.write_str("RuleTarget::Map(..)"),
            RuleTarget::Named(names) => write!(f, "RuleTarget::Named({names:?})"),
            RuleTarget::File(p) => write!(f, "RuleTarget::File({})", p.display()),
        }
    }
}

#[derive(Clone)]
pub enum Node {
    /// A named set of files resolved by globbing, e.g. `SOURCES` ->
    /// `src/**/*.c`. Globs are relative to the project root the graph is
    /// evaluated against, not baked in at registration time, since the same
    /// driver-registered graph is reused across every project that driver
    /// builds. The pattern named `SOURCES` is special-cased: it is unioned
    /// with any paths contributed via [`RuleGraph::add_generated_source`] by
    /// a `generate` rule that already ran this evaluation. An empty match
    /// falls back to the inherited output list rather than failing.
    Pattern { name: String, globs: Vec<String> },
    /// A single, already-known file - a leaf that never triggers a build.
    /// `path` is joined onto the evaluation root if relative.
    File { name: String, path: PathBuf },
    /// A rule deriving output(s) from `source`'s resolved file list,
    /// according to `target`'s map/named/file kind.
    Rule {
        name: String,
        source: String,
        target: RuleTarget,
        /// `None` means a pure aggregation step: it still propagates a
        /// combined target [`FileList`] downstream but runs no command.
        action: Option<Action>,
    },
    /// A rule whose input set is not fixed at registration time: it starts
    /// from `source`'s resolved files, then for each one consults `depfile`
    /// to locate a side file from a previous run (e.g. gcc's `-MMD` output)
    /// and, if present, parses it as Makefile-style dependency syntax,
    /// folding every extra path it names into the result as an additional
    /// input. Used so a compile rule's staleness check also accounts for
    /// headers transitively included by a source file, without those
    /// headers being declared anywhere in the project's own manifest.
    DependencyRule { name: String, source: String, depfile: DepFileFn },
}

impl Node {
    pub fn name(&self) -> &str {
        match self {
            Node::Pattern { name, .. } => name,
            Node::File { name, .. } => name,
            Node::Rule { name, .. } => name,
            Node::DependencyRule { name, .. } => name,
        }
    }
}

/// A driver's rule graph: nodes registered once at driver-registration
/// time, evaluated fresh per project via [`RuleGraph::instantiate`] (each
/// project gets its own cache and its own glob base).
pub struct RuleGraph {
    nodes: BTreeMap<String, Node>,
    cache: RefCell<BTreeMap<String, FileList>>,
    generated_sources: RefCell<Vec<PathBuf>>,
}

impl RuleGraph {
    pub fn new() -> Self {
        Self { nodes: BTreeMap::new(), cache: RefCell::new(BTreeMap::new()), generated_sources: RefCell::new(Vec::new()) }
    }

    pub fn add(&mut self, node: Node) {
        self.nodes.insert(node.name().to_string(), node);
    }

    pub fn has_node(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Clones this graph's node definitions into a fresh instance with an
    /// empty cache, so the same driver-registered template can be evaluated
    /// independently for every project it builds.
    pub fn instantiate(&self) -> RuleGraph {
        RuleGraph {
            nodes: self.nodes.clone(),
            cache: RefCell::new(BTreeMap::new()),
            generated_sources: RefCell::new(Vec::new()),
        }
    }

    /// Registers a file a `generate` rule produced this evaluation so that
    /// a later lookup of the `SOURCES` pattern picks it up without a
    /// second filesystem walk.
    pub fn add_generated_source(&self, path: PathBuf) {
        self.generated_sources.borrow_mut().push(path);
    }

    /// Evaluates `name` and everything it transitively depends on, with
    /// globs resolved against `base` (normally the project root), returning
    /// its resulting file list. Idempotent: a node is only ever
    /// globbed/built once per `RuleGraph` instance. Called with an empty
    /// inherited list, as at the root (usually `ARTEFACT`).
    pub fn evaluate(&self, name: &str, base: &Path) -> Result<FileList> {
        self.evaluate_with_inherited(name, base, &FileList::default())
    }

    /// Like [`RuleGraph::evaluate`], but seeds the root call with an
    /// explicit inherited list instead of an empty one - used to hand the
    /// `ARTEFACT` node the expected output path so a pure-aggregation rule
    /// (no action, just naming the thing it wants to exist) still resolves.
    pub fn evaluate_seeded(&self, name: &str, base: &Path, inherited: FileList) -> Result<FileList> {
        self.evaluate_with_inherited(name, base, &inherited)
    }

    fn evaluate_with_inherited(&self, name: &str, base: &Path, inh: &FileList) -> Result<FileList> {
        if let Some(cached) = self.cache.borrow().get(name) {
            return Ok(cached.clone());
        }

        let node = self.nodes.get(name).ok_or_else(|| BakeError::DriverCallback {
            project: String::new(),
            node: name.to_string(),
            detail: " (no such rule node)".to_string(),
        })?;

        let result = match node {
            Node::Pattern { name, globs } => {
                let matched = self.evaluate_pattern(name, globs, base)?;
                if matched.is_empty() { inh.clone() } else { matched }
            }
            Node::File { path, .. } => {
                let full = if path.is_relative() { base.join(path) } else { path.clone() };
                let stat = FileList(vec![FileRecord::stat(full)]);
                if stat.is_empty() { inh.clone() } else { stat }
            }
            Node::Rule { name, source, target, action } => {
                self.evaluate_rule(name, source, target, action.clone(), base, inh)?
            }
            Node::DependencyRule { source, depfile, .. } => {
                self.evaluate_dependency_rule(source, depfile, base, inh)?
            }
        };

        self.cache.borrow_mut().insert(name.to_string(), result.clone());
        Ok(result)
    }

    fn evaluate_pattern(&self, name: &str, globs: &[String], base: &Path) -> Result<FileList> {
        let mut paths = Vec::new();
        for pattern in globs {
            let full = base.join(pattern);
            let full_str = full.to_string_lossy().to_string();
            for entry in glob::glob(&full_str).map_err(|e| BakeError::DriverCallback {
                project: String::new(),
                node: name.to_string(),
                detail: format!(" (bad glob pattern '{full_str}': {e})"),
            })? {
                if let Ok(p) = entry {
                    paths.push(p);
                }
            }
        }

        if name == "SOURCES" {
            paths.extend(self.generated_sources.borrow().iter().cloned());
        }

        paths.sort();
        paths.dedup();
        Ok(FileList(paths.into_iter().map(FileRecord::stat).collect()))
    }

    fn evaluate_rule(
        &self,
        _name: &str,
        source: &str,
        target: &RuleTarget,
        action: Option<Action>,
        base: &Path,
        inh: &FileList,
    ) -> Result<FileList> {
        let sources = self.evaluate_with_inherited(source, base, inh)?;

        match target {
            RuleTarget::Map(map_fn) => {
                let pairs: Vec<(PathBuf, PathBuf)> =
                    sources.0.iter().map(|f| (f.path.clone(), map_fn(&f.path))).collect();

                let mut outputs = Vec::with_capacity(pairs.len());
                for (input, output) in &pairs {
                    let input_record = FileRecord::stat(input);
                    let mut output_record = FileRecord::stat(output);

                    if is_stale(&input_record, &output_record) {
                        if let Some(action) = &action {
                            ensure_parent_dir(output)?;
                            action(std::slice::from_ref(input), std::slice::from_ref(output))?;
                            output_record = FileRecord::stat(output);
                        }
                        // No action: a pure aggregation link. The (possibly
                        // still missing) output record is propagated as-is
                        // so downstream nodes still see this node as stale
                        // next time.
                    }
                    outputs.push(output_record);
                }
                Ok(FileList(outputs))
            }
            RuleTarget::File(path) => {
                let full = if path.is_relative() { base.join(path) } else { path.clone() };
                let targets = FileList(vec![FileRecord::stat(full)]);
                self.run_aggregate(&sources, targets, action)
            }
            RuleTarget::Named(names) => {
                let targets = self.resolve_named_targets(names, base, inh)?;
                self.run_aggregate(&sources, targets, action)
            }
        }
    }

    /// Resolves a [`RuleTarget::Named`] list: a `$`-prefixed entry asks for
    /// the inherited list, anything else names a sibling node to evaluate.
    fn resolve_named_targets(&self, names: &[String], base: &Path, inh: &FileList) -> Result<FileList> {
        let mut out = Vec::new();
        for n in names {
            if n.starts_with('$') {
                out.extend(inh.0.iter().cloned());
            } else {
                out.extend(self.evaluate_with_inherited(n, base, inh)?.0);
            }
        }
        Ok(FileList::sorted_deduped(out))
    }

    /// N-to-1 aggregation, shared by [`RuleTarget::Named`] and
    /// [`RuleTarget::File`]: decide whether to rebuild, run the action at
    /// most once with every input concatenated, and refresh whatever
    /// targets were already known.
    fn run_aggregate(&self, sources: &FileList, targets: FileList, action: Option<Action>) -> Result<FileList> {
        let no_targets_resolved = targets.is_empty();
        let any_input_missing = sources.0.iter().any(|f| f.mtime.is_none());
        let newest_input = sources.0.iter().filter_map(|f| f.mtime).max();
        let oldest_output = targets.0.iter().filter_map(|f| f.mtime).min();
        let any_input_newer = matches!((newest_input, oldest_output), (Some(i), Some(o)) if i > o);

        let should_build = no_targets_resolved || any_input_missing || any_input_newer;

        if !should_build || sources.0.is_empty() {
            return Ok(targets);
        }

        let Some(action) = &action else { return Ok(targets) };

        for t in targets.paths() {
            ensure_parent_dir(&t)?;
        }
        // A single resolved target gets its real path; anything else (zero,
        // or more than one) passes nothing and the action must infer its
        // own output path from the sources it was given.
        let target_arg: Vec<PathBuf> =
            if targets.0.len() == 1 { vec![targets.0[0].path.clone()] } else { Vec::new() };
        action(&sources.paths(), &target_arg)?;

        if no_targets_resolved {
            return Ok(FileList::default());
        }
        Ok(FileList(targets.paths().into_iter().map(FileRecord::stat).collect()))
    }

    fn evaluate_dependency_rule(&self, source: &str, depfile: &DepFileFn, base: &Path, inh: &FileList) -> Result<FileList> {
        let sources = self.evaluate_with_inherited(source, base, inh)?;
        let mut records = sources.0.clone();

        for f in &sources.0 {
            let dep_path = depfile(&f.path);
            if let Ok(contents) = fs::read_to_string(&dep_path) {
                records.extend(parse_makefile_deps(&contents).into_iter().map(FileRecord::stat));
            }
        }

        Ok(FileList::sorted_deduped(records))
    }
}

impl Default for RuleGraph {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses the dependency list out of a Makefile-style `.d` file: `target:
/// dep1 dep2 \` with backslash-newline continuations. Anything before the
/// first unescaped `:` is the rule's own target and is discarded - only the
/// prerequisite paths are returned.
fn parse_makefile_deps(contents: &str) -> Vec<PathBuf> {
    let joined = contents.replace("\\\r\n", " ").replace("\\\n", " ");
    let mut past_colon = false;
    let mut paths = Vec::new();

    for tok in joined.split_whitespace() {
        if !past_colon {
            match tok.split_once(':') {
                Some((_target, rest)) => {
                    past_colon = true;
                    if !rest.is_empty() {
                        paths.push(PathBuf::from(rest));
                    }
                }
                None => continue,
            }
            continue;
        }
        paths.push(PathBuf::from(tok));
    }

    paths
}

/// `target` is stale relative to `source` if it's missing, or `source` is
/// missing (forces a rebuild so the missing-input error surfaces from the
/// action itself), or strictly newer than `target`. Equal timestamps are
/// up to date.
fn is_stale(source: &FileRecord, target: &FileRecord) -> bool {
    match (source.mtime, target.mtime) {
        (_, None) => true,
        (None, Some(_)) => true,
        (Some(s), Some(t)) => s > t,
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn touch(path: &Path) {
        ensure_parent_dir(path).unwrap();
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn map_rule_rebuilds_when_source_is_newer() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("a.txt");
        let dst = tmp.path().join("a.out");
        touch(&src);

        let mut graph = RuleGraph::new();
        graph.add(Node::File { name: "SRC".into(), path: src.clone() });

        let runs = Arc::new(AtomicUsize::new(0));
        let runs2 = runs.clone();
        let dst_clone = dst.clone();
        graph.add(Node::Rule {
            name: "BUILD".into(),
            source: "SRC".into(),
            target: RuleTarget::Map(Arc::new(move |_p| dst_clone.clone())),
            action: Some(Arc::new(move |_ins, outs| {
                runs2.fetch_add(1, Ordering::SeqCst);
                fs::write(&outs[0], b"built").unwrap();
                Ok(())
            })),
        });

        let result = graph.evaluate("BUILD", tmp.path()).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(result.0[0].path, dst);
        assert!(dst.exists());
    }

    #[test]
    fn equal_timestamps_are_not_stale() {
        let stamp = SystemTime::now();
        let source = FileRecord { path: PathBuf::from("a.txt"), mtime: Some(stamp) };
        let target = FileRecord { path: PathBuf::from("a.out"), mtime: Some(stamp) };
        assert!(!is_stale(&source, &target));
    }

    #[test]
    fn missing_target_is_always_stale() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("a.txt");
        touch(&src);
        let source = FileRecord::stat(&src);
        let target = FileRecord { path: tmp.path().join("missing.out"), mtime: None };
        assert!(is_stale(&source, &target));
    }

    #[test]
    fn named_target_with_dollar_prefix_reuses_inherited_list() {
        // A `generate` rule's outputs (the inherited list at the root call)
        // become a later rule's target file list without that rule ever
        // globbing or naming a sibling node.
        let tmp = tempfile::tempdir().unwrap();
        let inherited_path = tmp.path().join("already.generated");
        touch(&inherited_path);

        let mut graph = RuleGraph::new();
        graph.add(Node::File { name: "SRC".into(), path: tmp.path().join("src.txt") });
        touch(&tmp.path().join("src.txt"));
        graph.add(Node::Rule {
            name: "COLLECT".into(),
            source: "SRC".into(),
            target: RuleTarget::Named(vec!["$inherited".into()]),
            action: None,
        });

        let inh = FileList(vec![FileRecord::stat(&inherited_path)]);
        let result = graph.evaluate_seeded("COLLECT", tmp.path(), inh).unwrap();

        assert_eq!(result.0.len(), 1);
        assert_eq!(result.0[0].path, inherited_path);
    }

    #[test]
    fn named_target_aggregates_many_inputs_into_one_target() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a.o");
        let b = tmp.path().join("b.o");
        touch(&a);
        touch(&b);
        let archive = tmp.path().join("lib.a");

        let mut graph = RuleGraph::new();
        graph.add(Node::Pattern { name: "OBJECTS".into(), globs: vec!["*.o".into()] });
        graph.add(Node::File { name: "ARCHIVE_TARGET".into(), path: archive.clone() });

        let archive_clone = archive.clone();
        graph.add(Node::Rule {
            name: "ARCHIVE".into(),
            source: "OBJECTS".into(),
            target: RuleTarget::Named(vec!["ARCHIVE_TARGET".into()]),
            action: Some(Arc::new(move |ins, _outs| {
                assert_eq!(ins.len(), 2);
                fs::write(&archive_clone, b"archive").unwrap();
                Ok(())
            })),
        });

        let result = graph.evaluate("ARCHIVE", tmp.path()).unwrap();
        assert_eq!(result.0.len(), 1);
        assert!(archive.exists());
    }

    #[test]
    fn file_target_aggregation_runs_no_action_when_up_to_date() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("a.o");
        touch(&src);
        let archive = tmp.path().join("lib.a");
        touch(&archive);
        // archive is newer than its only input, so no rebuild is needed.

        let mut graph = RuleGraph::new();
        graph.add(Node::Pattern { name: "OBJECTS".into(), globs: vec!["*.o".into()] });

        let runs = Arc::new(AtomicUsize::new(0));
        let runs2 = runs.clone();
        graph.add(Node::Rule {
            name: "ARCHIVE".into(),
            source: "OBJECTS".into(),
            target: RuleTarget::File(archive.clone()),
            action: Some(Arc::new(move |_ins, _outs| {
                runs2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
        });

        graph.evaluate("ARCHIVE", tmp.path()).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dependency_rule_pulls_in_extra_inputs_from_a_generated_depfile() {
        let tmp = tempfile::tempdir().unwrap();
        let c_file = tmp.path().join("a.c");
        let header = tmp.path().join("a.h");
        let dep_file = tmp.path().join("a.d");
        touch(&c_file);
        touch(&header);
        fs::write(&dep_file, format!("a.o: {} {}\n", c_file.display(), header.display())).unwrap();

        let mut graph = RuleGraph::new();
        graph.add(Node::File { name: "PRIMARY".into(), path: c_file.clone() });

        let dep_file_clone = dep_file.clone();
        graph.add(Node::DependencyRule {
            name: "WITH_HEADERS".into(),
            source: "PRIMARY".into(),
            depfile: Arc::new(move |_p| dep_file_clone.clone()),
        });

        let result = graph.evaluate("WITH_HEADERS", tmp.path()).unwrap();
        let paths = result.paths();
        assert!(paths.contains(&c_file));
        assert!(paths.contains(&header));
    }

    #[test]
    fn dependency_rule_tolerates_a_missing_depfile() {
        let tmp = tempfile::tempdir().unwrap();
        let c_file = tmp.path().join("a.c");
        touch(&c_file);

        let mut graph = RuleGraph::new();
        graph.add(Node::File { name: "PRIMARY".into(), path: c_file.clone() });
        graph.add(Node::DependencyRule {
            name: "WITH_HEADERS".into(),
            source: "PRIMARY".into(),
            depfile: Arc::new(|p| p.with_extension("d")),
        });

        let result = graph.evaluate("WITH_HEADERS", tmp.path()).unwrap();
        assert_eq!(result.paths(), vec![c_file]);
    }

    #[test]
    fn parses_backslash_continued_makefile_deps() {
        let deps = parse_makefile_deps("foo.o: foo.c \\\n  foo.h \\\n  bar.h\n");
        assert_eq!(deps, vec![PathBuf::from("foo.c"), PathBuf::from("foo.h"), PathBuf::from("bar.h")]);
    }
}
