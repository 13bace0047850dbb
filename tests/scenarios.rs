//! End-to-end scenarios exercising discovery, the dependency graph, the
//! driver host and the orchestrator together against temporary project
//! trees. Each scenario uses a stub in-process driver whose `build` just
//! touches a file, since the real compile/link work is a driver's concern,
//! not this crate's.

use std::{
    fs,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use bake_core::{
    driver::{Driver, DriverContext, RegistrationContext},
    error::Result,
    project::Project,
    rules::RuleTarget,
    test_util::TempProject,
    Bake,
};

#[derive(Debug)]
struct TouchDriver {
    id: String,
    build_count: Arc<AtomicUsize>,
}

impl TouchDriver {
    fn new(id: &str) -> Self {
        Self { id: id.to_string(), build_count: Arc::new(AtomicUsize::new(0)) }
    }

    fn counter(&self) -> Arc<AtomicUsize> {
        self.build_count.clone()
    }
}

impl Driver for TouchDriver {
    fn id(&self) -> &str {
        &self.id
    }

    fn build(&mut self, ctx: &DriverContext) -> Result<()> {
        self.build_count.fetch_add(1, Ordering::SeqCst);
        let bin = ctx.project.bin_path(ctx.platform_config);
        fs::create_dir_all(&bin)?;
        fs::write(bin.join(self.artefact_name(ctx.project).unwrap()), b"built")?;
        Ok(())
    }

    fn artefact_name(&self, project: &Project) -> Option<String> {
        Some(format!("lib{}.so", project.id.underscored()))
    }
}

/// A driver that does its work through the rule graph instead of
/// `Driver::build` directly, so the demand-driven mtime staleness check is
/// the thing deciding whether `build_count` advances, not the driver
/// itself.
#[derive(Debug)]
struct RuleDriver {
    id: String,
    build_count: Arc<AtomicUsize>,
}

impl RuleDriver {
    fn new(id: &str) -> Self {
        Self { id: id.to_string(), build_count: Arc::new(AtomicUsize::new(0)) }
    }

    fn counter(&self) -> Arc<AtomicUsize> {
        self.build_count.clone()
    }
}

impl Driver for RuleDriver {
    fn id(&self) -> &str {
        &self.id
    }

    fn register(&mut self, ctx: &mut RegistrationContext) -> Result<()> {
        ctx.pattern("SOURCES", vec!["*.c".to_string()]);
        let build_count = self.build_count.clone();
        ctx.rule(
            "ARTEFACT",
            "SOURCES",
            RuleTarget::Named(vec!["$artefact".to_string()]),
            Some(Arc::new(move |_sources, targets| {
                build_count.fetch_add(1, Ordering::SeqCst);
                fs::write(&targets[0], b"built")?;
                Ok(())
            })),
        )?;
        Ok(())
    }

    fn artefact_name(&self, project: &Project) -> Option<String> {
        Some(format!("lib{}.so", project.id.underscored()))
    }
}

fn setup(project: &TempProject, home: &std::path::Path) -> Bake {
    let mut bake = Bake::new(Some(home.to_path_buf()), None, Some("debug".to_string())).unwrap();
    bake.drivers_mut().register_in_process(Box::new(TouchDriver::new("lang.stub")));
    bake.discover(project.path()).unwrap();
    bake
}

#[test]
fn fresh_build_produces_an_artefact() {
    let home = tempfile::tempdir().unwrap();
    let project = TempProject::new().unwrap();
    project.write_manifest("foo", "foo", r#", "value": {"language": "stub"}"#);

    let mut bake = setup(&project, home.path());
    bake.build().unwrap();

    let p = bake.project("foo").unwrap();
    let platform_config = format!("{}-{}", bake.paths().platform, bake.paths().config);
    let artefact = p.artefact_path(&platform_config).unwrap_or_else(|| p.bin_path(&platform_config).join("libfoo.so"));
    assert!(artefact.exists());
}

#[test]
fn build_order_builds_dependencies_first() {
    let home = tempfile::tempdir().unwrap();
    let project = TempProject::new().unwrap();
    project.write_manifest("base", "base", r#", "value": {"language": "stub"}"#);
    project.write_manifest("app", "app", r#", "value": {"language": "stub", "use": ["base"]}"#);

    let mut bake = setup(&project, home.path());
    let order = bake.build_order();
    let pos_base = order.iter().position(|id| id.dotted() == "base").unwrap();
    let pos_app = order.iter().position(|id| id.dotted() == "app").unwrap();
    assert!(pos_base < pos_app);

    bake.build().unwrap();
    let platform_config = format!("{}-{}", bake.paths().platform, bake.paths().config);
    assert!(bake.project("base").unwrap().bin_path(&platform_config).join("libbase.so").exists());
    assert!(bake.project("app").unwrap().bin_path(&platform_config).join("libapp.so").exists());
}

#[test]
fn dependee_config_flows_into_dependent() {
    let home = tempfile::tempdir().unwrap();
    let project = TempProject::new().unwrap();
    project.write_manifest(
        "base",
        "base",
        r#", "value": {"language": "stub"}, "dependee": {"lang.stub": {"defines": ["USING_BASE"]}}"#,
    );
    project.write_manifest("app", "app", r#", "value": {"language": "stub", "use": ["base"]}"#);

    let mut bake = setup(&project, home.path());
    bake.build().unwrap();

    let app = bake.project("app").unwrap();
    assert_eq!(app.driver_configs["lang.stub"]["defines"], serde_json::json!(["USING_BASE"]));
}

#[test]
fn duplicate_project_id_is_rejected_at_discovery() {
    let home = tempfile::tempdir().unwrap();
    let project = TempProject::new().unwrap();
    project.write_manifest("one", "dup", r#", "value": {"language": "stub"}"#);
    project.write_manifest("two", "dup", r#", "value": {"language": "stub"}"#);

    let mut bake = Bake::new(Some(home.path().to_path_buf()), None, None).unwrap();
    bake.drivers_mut().register_in_process(Box::new(TouchDriver::new("lang.stub")));
    assert!(bake.discover(project.path()).is_err());
}

#[test]
fn cyclic_dependency_is_rejected_at_discovery() {
    let home = tempfile::tempdir().unwrap();
    let project = TempProject::new().unwrap();
    project.write_manifest("a", "a", r#", "value": {"language": "stub", "use": ["b"]}"#);
    project.write_manifest("b", "b", r#", "value": {"language": "stub", "use": ["a"]}"#);

    let mut bake = Bake::new(Some(home.path().to_path_buf()), None, None).unwrap();
    bake.drivers_mut().register_in_process(Box::new(TouchDriver::new("lang.stub")));
    assert!(bake.discover(project.path()).is_err());
}

#[test]
fn clean_removes_installed_metadata() {
    let home = tempfile::tempdir().unwrap();
    let project = TempProject::new().unwrap();
    project.write_manifest("foo", "foo", r#", "value": {"language": "stub", "public": true}"#);

    let mut bake = setup(&project, home.path());
    bake.build().unwrap();
    assert!(home.path().join("meta/foo/project.json").is_file());

    bake.clean().unwrap();
    assert!(!home.path().join("meta/foo").exists());
}

#[test]
fn incremental_rebuild_is_a_no_op_when_nothing_changed() {
    let home = tempfile::tempdir().unwrap();
    let project = TempProject::new().unwrap();
    project.write_manifest("foo", "foo", r#", "value": {"language": "rulestub"}"#);
    project.write_source("foo", "foo.c", "int foo(void) { return 0; }");

    let mut bake = Bake::new(Some(home.path().to_path_buf()), None, Some("debug".to_string())).unwrap();
    let driver = RuleDriver::new("lang.rulestub");
    let runs = driver.counter();
    bake.drivers_mut().register_in_process(Box::new(driver));
    bake.discover(project.path()).unwrap();

    bake.build().unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    bake.build().unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1, "nothing changed, the rule engine should skip the action");
}

#[test]
fn stale_dependency_forces_a_rebuild() {
    let home = tempfile::tempdir().unwrap();
    let project = TempProject::new().unwrap();
    project.write_manifest("base", "base", r#", "value": {"language": "rulestub"}"#);
    project.write_manifest("app", "app", r#", "value": {"language": "rulestub", "use": ["base"]}"#);
    project.write_source("base", "base.c", "int base(void) { return 0; }");
    project.write_source("app", "app.c", "int app(void) { return 0; }");

    let mut bake = Bake::new(Some(home.path().to_path_buf()), None, Some("debug".to_string())).unwrap();
    let driver = RuleDriver::new("lang.rulestub");
    let runs = driver.counter();
    bake.drivers_mut().register_in_process(Box::new(driver));
    bake.discover(project.path()).unwrap();

    bake.build().unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    std::thread::sleep(std::time::Duration::from_secs(1));
    project.write_source("base", "base.c", "int base(void) { return 1; }");

    bake.build().unwrap();
    assert_eq!(
        runs.load(Ordering::SeqCst),
        4,
        "base rebuilds from its own stale source, app rebuilds because base's artefact is now newer"
    );
}

#[test]
fn standalone_project_builds_despite_a_missing_dependency() {
    let home = tempfile::tempdir().unwrap();
    let project = TempProject::new().unwrap();
    project.write_manifest("app", "app", r#", "value": {"language": "rulestub", "use": ["ghost"], "standalone": true}"#);
    project.write_source("app", "app.c", "int app(void) { return 0; }");

    let mut bake = Bake::new(Some(home.path().to_path_buf()), None, Some("debug".to_string())).unwrap();
    bake.drivers_mut().register_in_process(Box::new(RuleDriver::new("lang.rulestub")));
    bake.discover(project.path()).unwrap();
    bake.build().unwrap();

    let p = bake.project("app").unwrap();
    let platform_config = format!("{}-{}", bake.paths().platform, bake.paths().config);
    let artefact = p.artefact_path(&platform_config).unwrap_or_else(|| p.bin_path(&platform_config).join("libapp.so"));
    assert!(artefact.exists());
}
