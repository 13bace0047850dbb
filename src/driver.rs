//! The driver plugin ABI.
//!
//! A driver contributes the language- or tool-specific behaviour for one or
//! more phases of a build (code generation, compilation, linking, testing,
//! ...). Drivers can be registered in-process (linked directly into the
//! embedding binary, the common case for this crate's own test harness) or
//! loaded as a native shared object exposing a C `bakemain` entry point, the
//! same shape the original implementation used for its `lang.c`/`lang.cpp`
//! etc. plugins.
//!
//! Every non-FFI driver callback takes its context as a plain borrowed
//! argument. The single exception is [`DynamicDriver`]: calling into a
//! shared object means crossing into `extern "C"` code that cannot carry
//! Rust lifetimes, so the active [`EnvPaths`] is parked behind one
//! `thread_local!` for the duration of that one call and recovered by the
//! host callback the driver is handed. This is the only thread-local state
//! anywhere in the crate, and it never outlives a single `bakemain`
//! round-trip; nothing else in the orchestrator relies on implicit
//! "current project/driver" state the way the original did.

use std::{
    cell::RefCell,
    collections::BTreeMap,
    ffi::{CStr, CString},
    fmt,
    os::raw::c_char,
    path::{Path, PathBuf},
};

use crate::{
    error::{BakeError, Result},
    paths::{EnvPaths, LocateKind},
    project::Project,
    rules::{Action, DepFileFn, Node, RuleGraph, RuleTarget},
};

/// Arguments threaded explicitly into every driver lifecycle call.
pub struct DriverContext<'a> {
    pub project: &'a Project,
    pub paths: &'a mut EnvPaths,
    /// `<cpu>-<os>-<config>`, the subdirectory build outputs land in.
    pub platform_config: &'a str,
}

/// The lifecycle a driver implements. Every method has a no-op default so a
/// driver only needs to override the phases it cares about, mirroring how
/// sparse most of the original `lang.c` callback table was in practice.
pub trait Driver: fmt::Debug {
    fn id(&self) -> &str;

    /// Called once, before any project is processed, with the chance to
    /// `import` other drivers this one depends on.
    fn register(&mut self, _ctx: &mut RegistrationContext) -> Result<()> {
        Ok(())
    }

    fn init(&mut self, _ctx: &DriverContext) -> Result<()> {
        Ok(())
    }
    fn setup(&mut self, _ctx: &DriverContext) -> Result<()> {
        Ok(())
    }
    fn generate(&mut self, _ctx: &DriverContext) -> Result<()> {
        Ok(())
    }
    fn prebuild(&mut self, _ctx: &DriverContext) -> Result<()> {
        Ok(())
    }
    fn build(&mut self, _ctx: &DriverContext) -> Result<()> {
        Ok(())
    }
    fn postbuild(&mut self, _ctx: &DriverContext) -> Result<()> {
        Ok(())
    }
    fn test(&mut self, _ctx: &DriverContext) -> Result<()> {
        Ok(())
    }
    fn coverage(&mut self, _ctx: &DriverContext) -> Result<()> {
        Ok(())
    }
    fn clean(&mut self, _ctx: &DriverContext) -> Result<()> {
        Ok(())
    }

    /// The artefact filename this driver would produce for `project`, e.g.
    /// `"libfoo.so"`. `None` if this driver doesn't produce a linkable
    /// artefact (a `template` driver, for instance).
    fn artefact_name(&self, _project: &Project) -> Option<String> {
        None
    }

    /// Resolves a `link` entry this driver recognises as a named system
    /// library (as opposed to another project in the graph, which the
    /// orchestrator resolves itself) to the actual library file on disk.
    /// `None` (the default) means this driver has no special knowledge of
    /// `name` and the orchestrator's own project-id resolution is all that
    /// applies.
    fn link_to_lib(&self, _name: &str) -> Option<PathBuf> {
        None
    }

    /// Directory names this driver wants the crawler to skip when walking
    /// a project it owns (in addition to the built-in skip list).
    fn ignore_paths(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Passed to [`Driver::register`]. Lets a driver pull in another driver by
/// id before projects are processed (the in-process equivalent of the
/// original implementation's `bake_driver_import`), and lets it build the
/// rule graph describing how its build steps fit together - patterns,
/// leaf files, rules and dependency rules, keyed by name. The graph built
/// here is a template: the orchestrator evaluates a fresh copy of it
/// (see [`RuleGraph::instantiate`]) against each project this driver
/// builds, since the same `SOURCES`/`OBJECTS`/`ARTEFACT` node names are
/// reused across every project but their globs resolve relative to
/// whichever project is currently being built.
pub struct RegistrationContext<'a> {
    host: &'a mut DriverHost,
    importing: &'a mut Vec<String>,
    driver_id: &'a str,
    graph: &'a mut RuleGraph,
}

impl<'a> RegistrationContext<'a> {
    pub fn import(&mut self, driver_id: &str, paths: &mut EnvPaths) -> Result<()> {
        self.host.import(driver_id, paths, &mut *self.importing)
    }

    /// Registers (or, if `name` is already taken, updates) a named set of
    /// files resolved by globbing relative to the project root.
    pub fn pattern(&mut self, name: &str, globs: Vec<String>) {
        self.graph.add(Node::Pattern { name: name.to_string(), globs });
    }

    /// Registers (or updates) a single, already-known file as a leaf node.
    pub fn file(&mut self, name: &str, path: impl Into<PathBuf>) {
        self.graph.add(Node::File { name: name.to_string(), path: path.into() });
    }

    /// Registers (or updates) a rule deriving `target` from `source`'s
    /// resolved files. Errors if `source` is empty or names a node that
    /// hasn't been registered yet, or if `target` is a [`RuleTarget::Named`]
    /// list naming an unregistered node (a `$`-prefixed entry is exempt -
    /// it asks for the inherited list, not a sibling node).
    pub fn rule(&mut self, name: &str, source: &str, target: RuleTarget, action: Option<Action>) -> Result<()> {
        self.validate_source(name, source)?;
        if let RuleTarget::Named(names) = &target {
            for n in names {
                if !n.starts_with('$') && !self.graph.has_node(n) {
                    return Err(BakeError::DriverRegistration {
                        driver: self.driver_id.to_string(),
                        message: format!("rule '{name}' targets unregistered node '{n}'"),
                    });
                }
            }
        }
        self.graph.add(Node::Rule { name: name.to_string(), source: source.to_string(), target, action });
        Ok(())
    }

    /// Registers (or updates) a dependency rule: `source`'s resolved files,
    /// plus whatever extra inputs `depfile` (mapping an input to the side
    /// file listing its own dependencies) turns up at evaluation time.
    pub fn dependency_rule(&mut self, name: &str, source: &str, depfile: DepFileFn) -> Result<()> {
        self.validate_source(name, source)?;
        self.graph.add(Node::DependencyRule { name: name.to_string(), source: source.to_string(), depfile });
        Ok(())
    }

    fn validate_source(&self, rule_name: &str, source: &str) -> Result<()> {
        if source.is_empty() {
            return Err(BakeError::DriverRegistration {
                driver: self.driver_id.to_string(),
                message: format!("rule '{rule_name}' has no source"),
            });
        }
        if !self.graph.has_node(source) {
            return Err(BakeError::DriverRegistration {
                driver: self.driver_id.to_string(),
                message: format!("rule '{rule_name}' source '{source}' is not a registered node"),
            });
        }
        Ok(())
    }
}

/// Owns every driver loaded for a build: in-process trait objects and
/// dynamically loaded shared objects alike, addressed uniformly by id.
#[derive(Default)]
pub struct DriverHost {
    in_process: BTreeMap<String, Box<dyn Driver>>,
    dynamic: BTreeMap<String, DynamicDriver>,
    /// Rule graph templates built during [`DriverHost::register_all`], one
    /// per in-process driver that registered any nodes. Dynamic (shared
    /// object) drivers don't participate: the C ABI has no registration
    /// callbacks for rule nodes, only the lifecycle phases.
    graphs: BTreeMap<String, RuleGraph>,
}

impl fmt::Debug for DriverHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverHost")
            .field("in_process", &self.in_process.keys().collect::<Vec<_>>())
            .field("dynamic", &self.dynamic.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl DriverHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_in_process(&mut self, driver: Box<dyn Driver>) {
        self.in_process.insert(driver.id().to_string(), driver);
    }

    pub fn is_loaded(&self, id: &str) -> bool {
        self.in_process.contains_key(id) || self.dynamic.contains_key(id)
    }

    /// Locates and loads the shared object backing `driver_id`, unless it
    /// (or an in-process driver of the same id) is already loaded.
    /// `importing` is the stack of driver ids currently mid-`register()`,
    /// used to reject cyclic `import` calls rather than recursing forever.
    pub fn import(&mut self, driver_id: &str, paths: &mut EnvPaths, importing: &mut Vec<String>) -> Result<()> {
        if self.is_loaded(driver_id) {
            return Ok(());
        }
        if importing.contains(&driver_id.to_string()) {
            return Err(BakeError::DriverRegistration {
                driver: driver_id.to_string(),
                message: format!("import cycle: {} -> {driver_id}", importing.join(" -> ")),
            });
        }

        let path = paths.locate(driver_id, LocateKind::Lib).ok_or_else(|| BakeError::DriverRegistration {
            driver: driver_id.to_string(),
            message: "not found on BAKE_HOME/BAKE_TARGET lib path".to_string(),
        })?;

        importing.push(driver_id.to_string());
        let dynamic = DynamicDriver::load(driver_id, &path)?;
        self.dynamic.insert(driver_id.to_string(), dynamic);
        importing.pop();
        Ok(())
    }

    /// Runs `register()` for every in-process driver, in id order, so
    /// imports are resolved deterministically. Each driver gets its own
    /// fresh [`RuleGraph`] to register nodes into; graphs that stay empty
    /// (a driver that registers no rule nodes at all) are not kept, so
    /// [`DriverHost::rule_graph`] only returns `Some` for drivers that
    /// actually use the rule engine.
    pub fn register_all(&mut self, paths: &mut EnvPaths) -> Result<()> {
        let ids: Vec<String> = self.in_process.keys().cloned().collect();
        for id in ids {
            let mut driver = self.in_process.remove(&id).expect("key from in_process.keys()");
            let mut importing = vec![id.clone()];
            let mut graph = RuleGraph::new();
            {
                let mut ctx = RegistrationContext { host: self, importing: &mut importing, driver_id: &id, graph: &mut graph };
                driver.register(&mut ctx)?;
            }
            if !graph.is_empty() {
                self.graphs.insert(id.clone(), graph);
            }
            self.in_process.insert(id, driver);
        }
        let _ = paths;
        Ok(())
    }

    /// The rule graph template `driver_id` registered, if any. Evaluate a
    /// fresh copy of it (via [`RuleGraph::instantiate`]) per project.
    pub fn rule_graph(&self, driver_id: &str) -> Option<&RuleGraph> {
        self.graphs.get(driver_id)
    }

    pub fn get(&self, id: &str) -> Option<DriverRef<'_>> {
        if let Some(d) = self.in_process.get(id) {
            return Some(DriverRef::InProcess(d.as_ref()));
        }
        self.dynamic.get(id).map(DriverRef::Dynamic)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<DriverRefMut<'_>> {
        if let Some(d) = self.in_process.get_mut(id) {
            return Some(DriverRefMut::InProcess(d.as_mut()));
        }
        self.dynamic.get_mut(id).map(DriverRefMut::Dynamic)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.in_process.keys().map(String::as_str).chain(self.dynamic.keys().map(String::as_str))
    }
}

/// A borrowed reference to either flavour of driver, for read-only queries
/// (`artefact_name`, `link_to_lib`, `ignore_paths`) that don't need `&mut`.
pub enum DriverRef<'a> {
    InProcess(&'a dyn Driver),
    Dynamic(&'a DynamicDriver),
}

impl<'a> DriverRef<'a> {
    pub fn artefact_name(&self, project: &Project) -> Option<String> {
        match self {
            DriverRef::InProcess(d) => d.artefact_name(project),
            DriverRef::Dynamic(d) => d.artefact_name(project),
        }
    }

    /// `None` for a [`DriverRef::Dynamic`]: a shared-object driver has no
    /// vtable entry for this query, only the lifecycle phases.
    pub fn link_to_lib(&self, name: &str) -> Option<PathBuf> {
        match self {
            DriverRef::InProcess(d) => d.link_to_lib(name),
            DriverRef::Dynamic(_) => None,
        }
    }
}

pub enum DriverRefMut<'a> {
    InProcess(&'a mut dyn Driver),
    Dynamic(&'a mut DynamicDriver),
}

impl<'a> DriverRefMut<'a> {
    pub fn run_phase(&mut self, phase: Phase, ctx: &mut DriverContext) -> Result<()> {
        match self {
            DriverRefMut::InProcess(d) => run_in_process_phase(*d, phase, ctx),
            DriverRefMut::Dynamic(d) => d.run_phase(phase, ctx),
        }
    }
}

/// The lifecycle phases the orchestrator drives a loaded driver through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Setup,
    Generate,
    Prebuild,
    Build,
    Postbuild,
    Test,
    Coverage,
    Clean,
}

fn run_in_process_phase(driver: &mut dyn Driver, phase: Phase, ctx: &DriverContext) -> Result<()> {
    match phase {
        Phase::Init => driver.init(ctx),
        Phase::Setup => driver.setup(ctx),
        Phase::Generate => driver.generate(ctx),
        Phase::Prebuild => driver.prebuild(ctx),
        Phase::Build => driver.build(ctx),
        Phase::Postbuild => driver.postbuild(ctx),
        Phase::Test => driver.test(ctx),
        Phase::Coverage => driver.coverage(ctx),
        Phase::Clean => driver.clean(ctx),
    }
}

// --- Dynamic (shared object) drivers ---------------------------------------

/// Host-provided callbacks handed to a dynamic driver so it can ask
/// questions of the environment without linking against this crate.
#[repr(C)]
struct BakeHostVTable {
    locate: extern "C" fn(kind: i32, id: *const c_char, out: *mut c_char, out_cap: usize) -> i32,
}

/// Function pointers a shared object's `bakemain` fills in for the phases it
/// implements; a null entry means "not implemented", matching the sparse
/// callback tables the original C drivers used.
#[repr(C)]
#[derive(Clone, Copy)]
struct BakeDriverVTable {
    init: Option<extern "C" fn(*const c_char, *const c_char, *const c_char) -> i32>,
    setup: Option<extern "C" fn(*const c_char, *const c_char, *const c_char) -> i32>,
    generate: Option<extern "C" fn(*const c_char, *const c_char, *const c_char) -> i32>,
    prebuild: Option<extern "C" fn(*const c_char, *const c_char, *const c_char) -> i32>,
    build: Option<extern "C" fn(*const c_char, *const c_char, *const c_char) -> i32>,
    postbuild: Option<extern "C" fn(*const c_char, *const c_char, *const c_char) -> i32>,
    test: Option<extern "C" fn(*const c_char, *const c_char, *const c_char) -> i32>,
    coverage: Option<extern "C" fn(*const c_char, *const c_char, *const c_char) -> i32>,
    clean: Option<extern "C" fn(*const c_char, *const c_char, *const c_char) -> i32>,
    artefact_name: Option<extern "C" fn(*const c_char, *mut c_char, usize) -> i32>,
}

type BakeMainFn = unsafe extern "C" fn(host: *const BakeHostVTable) -> BakeDriverVTable;

thread_local! {
    /// The `EnvPaths` a dynamic driver's `locate` callback should resolve
    /// against, valid only while a `bakemain`-provided function is on the
    /// stack. Set and cleared around each FFI call in [`DynamicDriver::call`].
    static ACTIVE_PATHS: RefCell<Option<*mut EnvPaths>> = const { RefCell::new(None) };
}

extern "C" fn host_locate(kind: i32, id: *const c_char, out: *mut c_char, out_cap: usize) -> i32 {
    let id = match unsafe { CStr::from_ptr(id) }.to_str() {
        Ok(s) => s,
        Err(_) => return -1,
    };
    let kind = match kind {
        0 => LocateKind::Meta,
        1 => LocateKind::Include,
        2 => LocateKind::Etc,
        3 => LocateKind::Lib,
        4 => LocateKind::StaticLib,
        5 => LocateKind::App,
        6 => LocateKind::AnyBinary,
        7 => LocateKind::Source,
        8 => LocateKind::DevSource,
        9 => LocateKind::Template,
        _ => return -1,
    };

    let resolved = ACTIVE_PATHS.with(|cell| {
        let ptr = (*cell.borrow())?;
        let paths = unsafe { &mut *ptr };
        paths.locate(id, kind)
    });

    match resolved {
        Some(path) => write_c_string(&path.display().to_string(), out, out_cap),
        None => 0,
    }
}

fn write_c_string(value: &str, out: *mut c_char, out_cap: usize) -> i32 {
    let bytes = value.as_bytes();
    if bytes.len() + 1 > out_cap {
        return -1;
    }
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr() as *const c_char, out, bytes.len());
        *out.add(bytes.len()) = 0;
    }
    1
}

/// A driver backed by a native shared object loaded with `libloading`,
/// speaking the `bakemain(host_vtable) -> driver_vtable` ABI.
pub struct DynamicDriver {
    id: String,
    // Kept alive for the lifetime of the driver: dropping it would unload
    // the library out from under `vtable`'s function pointers.
    _library: libloading::Library,
    vtable: BakeDriverVTable,
}

impl fmt::Debug for DynamicDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicDriver").field("id", &self.id).finish()
    }
}

impl DynamicDriver {
    pub fn load(id: &str, path: &Path) -> Result<Self> {
        let library = unsafe { libloading::Library::new(path) }.map_err(|e| BakeError::DriverRegistration {
            driver: id.to_string(),
            message: format!("failed to load '{}': {e}", path.display()),
        })?;

        let bakemain: libloading::Symbol<BakeMainFn> = unsafe { library.get(b"bakemain\0") }
            .map_err(|e| BakeError::DriverRegistration {
                driver: id.to_string(),
                message: format!("no `bakemain` symbol: {e}"),
            })?;

        static HOST_VTABLE: BakeHostVTable = BakeHostVTable { locate: host_locate };
        let vtable = unsafe { bakemain(&HOST_VTABLE) };

        Ok(Self { id: id.to_string(), _library: library, vtable })
    }

    fn run_phase(&mut self, phase: Phase, ctx: &mut DriverContext) -> Result<()> {
        let callback = match phase {
            Phase::Init => self.vtable.init,
            Phase::Setup => self.vtable.setup,
            Phase::Generate => self.vtable.generate,
            Phase::Prebuild => self.vtable.prebuild,
            Phase::Build => self.vtable.build,
            Phase::Postbuild => self.vtable.postbuild,
            Phase::Test => self.vtable.test,
            Phase::Coverage => self.vtable.coverage,
            Phase::Clean => self.vtable.clean,
        };
        let Some(callback) = callback else { return Ok(()) };

        let project_id = CString::new(ctx.project.id.dotted()).unwrap_or_default();
        let project_path = CString::new(ctx.project.path.display().to_string()).unwrap_or_default();
        let platform_config = CString::new(ctx.platform_config).unwrap_or_default();

        let status = self.call(ctx.paths, || callback(project_id.as_ptr(), project_path.as_ptr(), platform_config.as_ptr()));

        if status == 0 {
            Ok(())
        } else {
            Err(BakeError::DriverCallback {
                project: ctx.project.id.dotted().to_string(),
                node: format!("{:?}", phase),
                detail: format!(" (driver '{}' returned {status})", self.id),
            })
        }
    }

    fn artefact_name(&self, project: &Project) -> Option<String> {
        let callback = self.vtable.artefact_name?;
        let project_id = CString::new(project.id.dotted()).ok()?;
        let mut buf = vec![0_u8; 256];
        let written = callback(project_id.as_ptr(), buf.as_mut_ptr() as *mut c_char, buf.len());
        if written <= 0 {
            return None;
        }
        let cstr = unsafe { CStr::from_ptr(buf.as_ptr() as *const c_char) };
        cstr.to_str().ok().map(str::to_string)
    }

    /// Parks `paths` behind the thread-local for the duration of `f`, so the
    /// host callbacks reachable from inside the dynamic library can resolve
    /// `locate()` calls against it, then clears it unconditionally.
    fn call<T>(&self, paths: &mut EnvPaths, f: impl FnOnce() -> T) -> T {
        ACTIVE_PATHS.with(|cell| *cell.borrow_mut() = Some(paths as *mut EnvPaths));
        let result = f();
        ACTIVE_PATHS.with(|cell| *cell.borrow_mut() = None);
        result
    }
}
