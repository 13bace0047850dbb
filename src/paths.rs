//! Path/Env resolver.
//!
//! Computes the environment layout rooted at a user "home" directory and
//! memoizes `locate()` lookups. These paths are read by every other
//! component and are treated as constants for the lifetime of a build.
//!
//! Unlike the original C implementation's process-wide locate cache, the
//! cache here is an explicit field of [`EnvPaths`] rather than global state,
//! per the rewrite's no-globals policy.

use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

/// The kind of artefact being resolved for a project id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocateKind {
    Meta,
    Include,
    Etc,
    Lib,
    StaticLib,
    App,
    AnyBinary,
    Source,
    DevSource,
    Template,
}

/// Resolved, process-lifetime-constant environment paths.
#[derive(Debug, Clone)]
pub struct EnvPaths {
    pub home: PathBuf,
    pub target: PathBuf,
    pub config: String,
    pub platform: String,

    cache: HashMap<(String, LocateKind), Option<PathBuf>>,
}

fn env_or(name: &str, default: impl Into<PathBuf>) -> PathBuf {
    env::var(format!("BAKE_{name}")).map(PathBuf::from).unwrap_or_else(|_| default.into())
}

fn default_home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join("bake")
}

fn default_platform_triple() -> String {
    format!("{}-{}", env::consts::ARCH, env::consts::OS)
}

impl EnvPaths {
    /// Resolves `home`/`target`/`config`, falling back to `BAKE_HOME` /
    /// `BAKE_TARGET` / `BAKE_CONFIG` environment variables, then to
    /// built-in defaults (`$HOME/bake`, the same as `home`, and `"debug"`).
    pub fn init(home: Option<PathBuf>, target: Option<PathBuf>, config: Option<String>) -> Self {
        let home = dunce::simplified(&home.unwrap_or_else(|| env_or("HOME", default_home()))).to_path_buf();
        let target = dunce::simplified(&target.unwrap_or_else(|| env_or("TARGET", home.clone()))).to_path_buf();
        let config = config.unwrap_or_else(|| {
            env::var("BAKE_CONFIG").unwrap_or_else(|_| "debug".to_string())
        });
        let platform = env::var("BAKE_PLATFORM").unwrap_or_else(|_| default_platform_triple());

        Self { home, target, config, platform, cache: HashMap::new() }
    }

    /// Invalidates the memoized locate-result for one project id, without
    /// unloading anything — safe to call even if the project's library is
    /// currently loaded and in use.
    pub fn reset(&mut self, logical_id: &str) {
        self.cache.retain(|(id, _), _| id != logical_id);
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.home.join("meta")
    }

    pub fn include_dir(&self) -> PathBuf {
        self.home.join("include")
    }

    pub fn etc_dir(&self) -> PathBuf {
        self.home.join("etc")
    }

    pub fn lib_dir(&self) -> PathBuf {
        self.home.join("lib")
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.home.join("bin")
    }

    pub fn src_dir(&self) -> PathBuf {
        self.home.join("src")
    }

    pub fn templates_dir(&self) -> PathBuf {
        self.home.join("templates")
    }

    /// `<home>/platform/<cpu>-<os>-<configuration>`
    pub fn platform_dir(&self) -> PathBuf {
        self.home.join("platform").join(format!("{}-{}", self.platform, self.config))
    }

    fn project_meta_dir(&self, id: &str) -> Option<PathBuf> {
        let target_meta = self.target.join("meta").join(id).join("project.json");
        let home_meta = self.home.join("meta").join(id).join("project.json");

        let newer = match (target_meta.exists(), home_meta.exists()) {
            (true, true) => {
                let t = fs::metadata(&target_meta).and_then(|m| m.modified()).ok();
                let h = fs::metadata(&home_meta).and_then(|m| m.modified()).ok();
                if t >= h {
                    target_meta
                } else {
                    home_meta
                }
            }
            (true, false) => target_meta,
            (false, true) => home_meta,
            (false, false) => return None,
        };

        newer.parent().map(Path::to_path_buf)
    }

    fn binary_candidates(&self, underscored: &str) -> Vec<PathBuf> {
        let lib = self.lib_dir();
        vec![
            lib.join(format!("lib{underscored}.so")),
            lib.join(format!("lib{underscored}.dylib")),
            lib.join(format!("lib{underscored}.a")),
            self.bin_dir().join(format!("{underscored}.exe")),
            self.bin_dir().join(underscored),
        ]
    }

    fn resolve(&self, id: &str, kind: LocateKind) -> Option<PathBuf> {
        match kind {
            LocateKind::Meta => self.project_meta_dir(id),
            LocateKind::Include => {
                let dir = self.include_dir().join(format!("{}.dir", id.replace('.', "-")));
                dir.exists().then_some(dir)
            }
            LocateKind::Etc => {
                let dir = self.etc_dir().join(id);
                dir.exists().then_some(dir)
            }
            LocateKind::Lib => {
                let underscored = id.replace('.', "_");
                [format!("lib{underscored}.so"), format!("lib{underscored}.dylib")]
                    .into_iter()
                    .map(|f| self.lib_dir().join(f))
                    .find(|p| p.exists())
            }
            LocateKind::StaticLib => {
                let p = self.lib_dir().join(format!("lib{}.a", id.replace('.', "_")));
                p.exists().then_some(p)
            }
            LocateKind::App => {
                let underscored = id.replace('.', "_");
                [self.bin_dir().join(format!("{underscored}.exe")), self.bin_dir().join(underscored)]
                    .into_iter()
                    .find(|p| p.exists())
            }
            LocateKind::AnyBinary => {
                self.binary_candidates(&id.replace('.', "_")).into_iter().find(|p| p.exists())
            }
            LocateKind::Source => {
                let dir = self.src_dir().join(id);
                dir.exists().then_some(dir)
            }
            LocateKind::DevSource => None,
            LocateKind::Template => {
                let dir = self.templates_dir().join(id);
                dir.exists().then_some(dir)
            }
        }
    }

    /// Resolves a project id to one of the path kinds in [`LocateKind`].
    ///
    /// The first successful lookup for `(id, kind)` is cached; subsequent
    /// calls are O(1), including the negative (not-found) result, so failed
    /// lookups do not re-scan the filesystem. Filesystem errors are treated
    /// as a soft "not found" rather than propagated.
    pub fn locate(&mut self, id: &str, kind: LocateKind) -> Option<PathBuf> {
        let key = (id.to_string(), kind);
        if let Some(cached) = self.cache.get(&key) {
            return cached.clone();
        }

        let resolved = self.resolve(id, kind);
        self.cache.insert(key, resolved.clone());
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locate_caches_negative_results() {
        let tmp = tempfile::tempdir().unwrap();
        let mut paths = EnvPaths::init(Some(tmp.path().to_path_buf()), None, None);

        assert!(paths.locate("nope.nope", LocateKind::Lib).is_none());
        assert!(paths.cache.contains_key(&("nope.nope".to_string(), LocateKind::Lib)));

        // A second call hits the cache rather than touching the filesystem again.
        assert!(paths.locate("nope.nope", LocateKind::Lib).is_none());
    }

    #[test]
    fn reset_drops_only_that_id() {
        let tmp = tempfile::tempdir().unwrap();
        let mut paths = EnvPaths::init(Some(tmp.path().to_path_buf()), None, None);
        paths.locate("a", LocateKind::Lib);
        paths.locate("b", LocateKind::Lib);

        paths.reset("a");

        assert!(!paths.cache.contains_key(&("a".to_string(), LocateKind::Lib)));
        assert!(paths.cache.contains_key(&("b".to_string(), LocateKind::Lib)));
    }

    #[test]
    fn env_paths_default_config_is_debug() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = EnvPaths::init(Some(tmp.path().to_path_buf()), None, None);
        assert_eq!(paths.config, "debug");
    }
}
