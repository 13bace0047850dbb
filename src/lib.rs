//! Core library behind the Bake build orchestrator: project discovery,
//! dependency graph construction, a demand-driven incremental rule engine,
//! a driver plugin ABI, the manifest attribute/templating engine, and an
//! environment-layout installer.
//!
//! This crate is the engine, not a CLI: embed it via [`Bake`], the facade
//! that wires discovery, the driver host and the orchestrator together.

pub mod attr;
pub mod config;
pub mod driver;
pub mod error;
pub mod graph;
pub mod installer;
mod jsonc;
pub mod orchestrator;
pub mod paths;
pub mod project;
pub mod rules;

#[cfg(feature = "test-util")]
pub mod test_util;

pub use config::BakeConfig;
pub use driver::{Driver, DriverContext, DriverHost, Phase, RegistrationContext};
pub use error::{BakeError, Result, ResultExt};
pub use graph::{Crawler, MissingDependencyResolver, NoopResolver};
pub use paths::{EnvPaths, LocateKind};
pub use project::{Manifest, Project, ProjectId, ProjectType};

use std::path::{Path, PathBuf};

use orchestrator::Orchestrator;

/// Installs a `tracing` subscriber reading `RUST_LOG`/`BAKE_LOG`, falling
/// back to `info`. Embedders that already manage their own subscriber can
/// skip this and just depend on the crate's spans.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_env("BAKE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = fmt().with_env_filter(filter).try_init();
}

/// The embedding facade: discovers projects under a root, then builds,
/// cleans, tests or runs them. Deliberately not a CLI - argument parsing
/// and output formatting are an embedder's concern.
pub struct Bake {
    orchestrator: Orchestrator,
}

impl Bake {
    /// Sets up the environment layout and driver host for a build rooted
    /// at `home`, reading `<home>/bake.json` if present.
    pub fn new(home: Option<PathBuf>, target: Option<PathBuf>, config: Option<String>) -> Result<Self> {
        let paths = EnvPaths::init(home.clone(), target, config);
        let bake_json = paths.home.join("bake.json");
        let bake_config = BakeConfig::load_or_default(&bake_json)?;

        Ok(Self {
            orchestrator: Orchestrator::new(paths, DriverHost::new(), Crawler::new(), bake_config),
        })
    }

    pub fn drivers_mut(&mut self) -> &mut DriverHost {
        &mut self.orchestrator.drivers
    }

    pub fn paths(&self) -> &EnvPaths {
        &self.orchestrator.paths
    }

    /// Crawls `root` for projects and computes a build order. Must be
    /// called before [`Bake::build`]/[`Bake::clean`]/[`Bake::run`].
    pub fn discover(&mut self, root: &Path) -> Result<()> {
        self.orchestrator.drivers.register_all(&mut self.orchestrator.paths)?;
        self.orchestrator.crawler.crawl(root)?;
        self.orchestrator.crawler.resolve_recursive(&mut NoopResolver)?;
        self.orchestrator.crawler.finalize()?;
        Ok(())
    }

    /// Builds every discovered project in dependency order.
    pub fn build(&mut self) -> Result<()> {
        self.orchestrator.build_all()
    }

    /// Builds a single project (and, since it's already in dependency
    /// order, everything it's declared to need will already have been
    /// built if [`Bake::build`] was used for the rest of the graph).
    pub fn build_one(&mut self, id: &str) -> Result<()> {
        let id = ProjectId::parse(id)?;
        self.orchestrator.build_project(&id)
    }

    pub fn test(&mut self, id: &str) -> Result<()> {
        let id = ProjectId::parse(id)?;
        self.orchestrator.test_project(&id)
    }

    pub fn coverage(&mut self, id: &str) -> Result<()> {
        let id = ProjectId::parse(id)?;
        self.orchestrator.coverage_project(&id)
    }

    /// Cleans every discovered project.
    pub fn clean(&mut self) -> Result<()> {
        let order: Vec<ProjectId> = self.orchestrator.crawler.build_order().to_vec();
        for id in order.iter().rev() {
            self.orchestrator.clean_project(id)?;
        }
        Ok(())
    }

    pub fn clean_one(&mut self, id: &str) -> Result<()> {
        let id = ProjectId::parse(id)?;
        self.orchestrator.clean_project(&id)
    }

    pub fn build_order(&self) -> &[ProjectId] {
        self.orchestrator.crawler.build_order()
    }

    pub fn project(&self, id: &str) -> Option<&Project> {
        let id = ProjectId::parse(id).ok()?;
        self.orchestrator.crawler.project(&id)
    }
}
