//! Temporary project/environment scaffolding for tests, gated behind the
//! `test-util` feature - the same shape as the teacher crate's
//! `project-util` `TempProject` helper, generalized from Solidity fixtures
//! to arbitrary `project.json`/source layouts.

use std::{
    fs,
    path::{Path, PathBuf},
};

use tempfile::TempDir;

/// A scratch `BAKE_HOME`, torn down on drop.
pub struct TempEnv {
    home: TempDir,
}

impl TempEnv {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self { home: tempfile::tempdir()? })
    }

    pub fn path(&self) -> &Path {
        self.home.path()
    }
}

impl Default for TempEnv {
    fn default() -> Self {
        Self::new().expect("failed to create temp env")
    }
}

/// A scratch directory tree of one or more `project.json` files, for
/// exercising the crawler and orchestrator without touching a real
/// filesystem layout.
pub struct TempProject {
    root: TempDir,
}

impl TempProject {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self { root: tempfile::tempdir()? })
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    /// Writes `<subdir>/project.json` with the given `id` and a raw JSON
    /// fragment (e.g. `, "value": {"language": "c"}`) spliced in after it.
    /// Returns the project's directory.
    pub fn write_manifest(&self, subdir: &str, id: &str, extra_json: &str) -> PathBuf {
        let dir = self.root.path().join(subdir);
        fs::create_dir_all(&dir).expect("create project dir");
        let manifest = format!(r#"{{"id": "{id}" {extra_json}}}"#);
        fs::write(dir.join("project.json"), manifest).expect("write project.json");
        dir
    }

    pub fn write_source(&self, subdir: &str, relative: &str, contents: &str) -> PathBuf {
        let path = self.root.path().join(subdir).join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create source dir");
        }
        fs::write(&path, contents).expect("write source file");
        path
    }
}

impl Default for TempProject {
    fn default() -> Self {
        Self::new().expect("failed to create temp project")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_a_loadable_manifest() {
        let tmp = TempProject::new().unwrap();
        let dir = tmp.write_manifest("foo", "foo", r#", "value": {"language": "c"}"#);
        let project = crate::Project::load(&dir).unwrap();
        assert_eq!(project.id.dotted(), "foo");
    }
}
