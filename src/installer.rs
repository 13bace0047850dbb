//! Installs a project's public surface (metadata, headers, artefacts) into
//! the environment layout so other projects can depend on it without a
//! source checkout - the `bake_do_pre_discovery`/`install`-side half of a
//! build, as opposed to the driver-owned compile/link half.

use std::{fs, path::Path};

use crate::{
    error::{io_err, BakeError, Result},
    paths::EnvPaths,
    project::{Project, ProjectId, ProjectType},
};

pub struct Installer<'a> {
    pub paths: &'a mut EnvPaths,
}

impl<'a> Installer<'a> {
    pub fn new(paths: &'a mut EnvPaths) -> Self {
        Self { paths }
    }

    /// Copies `project.json` into `<home>/meta/<id>/`, so `locate(Meta, id)`
    /// can find it without the project's source tree being present. Only
    /// public projects are installed; private ones stay source-local. Also
    /// writes `source.txt` alongside it, pointing back at the project's
    /// source directory, so a dependent can still find the original tree
    /// (e.g. for a `devsource` locate) even once only the installed
    /// metadata is present.
    pub fn install_metadata(&mut self, project: &Project) -> Result<()> {
        if !project.is_public() {
            return Ok(());
        }
        let dest_dir = self.paths.meta_dir().join(project.id.dotted());
        fs::create_dir_all(&dest_dir).map_err(io_err(&dest_dir))?;
        let src = project.path.join("project.json");
        let dest = dest_dir.join("project.json");
        fs::copy(&src, &dest).map_err(io_err(&src))?;

        let source_txt = dest_dir.join("source.txt");
        fs::write(&source_txt, project.path.display().to_string()).map_err(io_err(&source_txt))?;

        self.paths.reset(project.id.dotted());
        Ok(())
    }

    /// Installs every `includes` directory under `<home>/include/<id-dashed>.dir`,
    /// so `${locate include}` resolves for dependents. Rejects an `includes`
    /// entry that escapes the project root, and any top-level entry of an
    /// installed include tree other than `<id-base>.h` or `<id-dashed>/`.
    pub fn install_includes(&mut self, project: &Project) -> Result<()> {
        if !project.is_public() {
            return Ok(());
        }

        let dest = self.paths.include_dir().join(format!("{}.dir", project.id.dashed()));
        fs::create_dir_all(&dest).map_err(io_err(&dest))?;

        for include in &project.includes {
            if Path::new(include).components().any(|c| matches!(c, std::path::Component::ParentDir)) {
                return Err(BakeError::DriverRegistration {
                    driver: "installer".to_string(),
                    message: format!("includes entry '{include}' escapes project root"),
                });
            }
            let src = project.path.join(include);
            if !src.is_dir() {
                continue;
            }
            validate_include_layout(&src, &project.id)?;
            let installed = dest.join(include);
            // A nested id's header gets renamed in the installed copy below,
            // which would otherwise mutate the project's own source tree if
            // the platform-preferred symlink were used - force a real copy.
            if project.id.dotted().contains('.') {
                if let Some(parent) = installed.parent() {
                    fs::create_dir_all(parent).map_err(io_err(parent))?;
                }
                copy_dir_recursive(&src, &installed).map_err(io_err(&installed))?;
            } else {
                link_or_copy_dir(&src, &installed)?;
            }
            rename_nested_header(&installed, &project.id)?;
        }

        self.paths.reset(project.id.dotted());
        Ok(())
    }

    /// Runs before a project's driver is invoked for `build`: ensures its
    /// own bin directory exists, its headers are already installed (a
    /// sibling project's `generate` step may need to find them before
    /// `postbuild` would otherwise install them), its `etc/` tree is
    /// mirrored into the environment, and - for a package, which other
    /// projects may link against without ever reaching this project's own
    /// `postbuild` - its prior `lib/` output is mirrored too so a partial,
    /// not-yet-rebuilt artefact is still visible to dependents mid-build.
    pub fn install_prebuild(&mut self, project: &Project, platform_config: &str) -> Result<()> {
        let bin = project.bin_path(platform_config);
        fs::create_dir_all(&bin).map_err(io_err(&bin))?;

        self.install_includes(project)?;
        self.install_etc(project)?;

        if project.project_type == ProjectType::Package {
            let lib_src = project.path.join("lib");
            if lib_src.is_dir() {
                let dest = self.paths.lib_dir();
                fs::create_dir_all(&dest).map_err(io_err(&dest))?;
                copy_dir_recursive(&lib_src, &dest).map_err(io_err(&dest))?;
            }
        }

        Ok(())
    }

    /// Copies a project's `etc/` directory (non-code runtime resources,
    /// e.g. data files a driver's action reads at build time) into
    /// `<home>/etc/<id>/`, mirroring the `include`/`meta` install pattern.
    pub fn install_etc(&mut self, project: &Project) -> Result<()> {
        if !project.is_public() {
            return Ok(());
        }
        let src = project.path.join("etc");
        if !src.is_dir() {
            return Ok(());
        }
        let dest = self.paths.etc_dir().join(project.id.dotted());
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        link_or_copy_dir(&src, &dest)?;
        self.paths.reset(project.id.dotted());
        Ok(())
    }

    /// Copies (or symlinks, on Unix) the built artefact into `<home>/lib`
    /// or `<home>/bin`, and installs metadata/includes - the step that
    /// makes a freshly built project immediately usable by its dependents.
    pub fn install_postbuild(&mut self, project: &Project, platform_config: &str) -> Result<()> {
        self.install_metadata(project)?;
        self.install_includes(project)?;
        self.install_etc(project)?;

        let Some(artefact) = project.artefact_path(platform_config) else { return Ok(()) };
        if !artefact.exists() {
            return Ok(());
        }

        let is_binary = artefact
            .extension()
            .map(|ext| !matches!(ext.to_str(), Some("so") | Some("dylib") | Some("a") | Some("dll")))
            .unwrap_or(true);

        let dest_dir = if is_binary { self.paths.bin_dir() } else { self.paths.lib_dir() };
        fs::create_dir_all(&dest_dir).map_err(io_err(&dest_dir))?;
        let dest = dest_dir.join(artefact.file_name().expect("artefact has a filename"));

        link_or_copy_file(&artefact, &dest)
    }

    /// Removes a project's installed metadata, headers, `etc/` tree and
    /// artefacts.
    pub fn uninstall(&mut self, project: &Project, platform_config: &str) -> Result<()> {
        let meta_dir = self.paths.meta_dir().join(project.id.dotted());
        remove_if_exists(&meta_dir)?;

        let include_dir = self.paths.include_dir().join(format!("{}.dir", project.id.dashed()));
        remove_if_exists(&include_dir)?;

        let etc_dir = self.paths.etc_dir().join(project.id.dotted());
        remove_if_exists(&etc_dir)?;

        if let Some(artefact) = project.artefact_path(platform_config) {
            if let Some(name) = artefact.file_name() {
                remove_if_exists(&self.paths.lib_dir().join(name))?;
                remove_if_exists(&self.paths.bin_dir().join(name))?;
            }
        }

        self.paths.reset(project.id.dotted());
        Ok(())
    }
}

/// A project's `includes` directory may only hold `<id-base>.h` and a
/// `<id-dashed>/` subdirectory at its top level - anything else is a stray
/// file that would pollute the shared `env/include/` namespace.
fn validate_include_layout(src: &Path, id: &ProjectId) -> Result<()> {
    let header_name = format!("{}.h", id.base());
    let dir_name = id.dashed();

    for entry in fs::read_dir(src).map_err(io_err(src))? {
        let entry = entry.map_err(io_err(src))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let is_allowed_header = entry.path().is_file() && name == header_name;
        let is_allowed_dir = entry.path().is_dir() && name == dir_name;
        if !is_allowed_header && !is_allowed_dir {
            return Err(BakeError::DriverRegistration {
                driver: "installer".to_string(),
                message: format!(
                    "stray entry '{name}' in includes directory for '{}': only '{header_name}' and '{dir_name}/' are permitted",
                    id.dotted()
                ),
            });
        }
    }
    Ok(())
}

/// Renames `<id-base>.h` to `<id-underscored>.h` in the installed copy when
/// the project id is nested (contains a dot), so two projects whose base
/// name collides (`a.foo` and `b.foo`) don't clobber each other's header
/// once both land under the same `env/include/` tree.
fn rename_nested_header(installed_dir: &Path, id: &ProjectId) -> Result<()> {
    if !id.dotted().contains('.') {
        return Ok(());
    }
    let from = installed_dir.join(format!("{}.h", id.base()));
    if !from.is_file() {
        return Ok(());
    }
    let to = installed_dir.join(format!("{}.h", id.underscored()));
    fs::rename(&from, &to).map_err(io_err(&from))
}

fn remove_if_exists(path: &Path) -> Result<()> {
    if path.is_dir() {
        fs::remove_dir_all(path).map_err(io_err(path))
    } else if path.exists() {
        fs::remove_file(path).map_err(io_err(path))
    } else {
        Ok(())
    }
}

#[cfg(unix)]
fn link_or_copy_file(src: &Path, dest: &Path) -> Result<()> {
    if dest.exists() || dest.symlink_metadata().is_ok() {
        fs::remove_file(dest).map_err(io_err(dest))?;
    }
    std::os::unix::fs::symlink(src, dest).or_else(|_| fs::copy(src, dest).map(|_| ())).map_err(io_err(dest))
}

#[cfg(not(unix))]
fn link_or_copy_file(src: &Path, dest: &Path) -> Result<()> {
    if dest.exists() {
        fs::remove_file(dest).map_err(io_err(dest))?;
    }
    fs::copy(src, dest).map(|_| ()).map_err(io_err(dest))
}

#[cfg(unix)]
fn link_or_copy_dir(src: &Path, dest: &Path) -> Result<()> {
    if dest.symlink_metadata().is_ok() {
        if dest.is_dir() && dest.symlink_metadata().map(|m| !m.file_type().is_symlink()).unwrap_or(false) {
            fs::remove_dir_all(dest).map_err(io_err(dest))?;
        } else {
            fs::remove_file(dest).map_err(io_err(dest))?;
        }
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    std::os::unix::fs::symlink(src, dest).or_else(|_| copy_dir_recursive(src, dest)).map_err(io_err(dest))
}

#[cfg(not(unix))]
fn link_or_copy_dir(src: &Path, dest: &Path) -> Result<()> {
    if dest.exists() {
        fs::remove_dir_all(dest).map_err(io_err(dest))?;
    }
    copy_dir_recursive(src, dest).map_err(io_err(dest))
}

fn copy_dir_recursive(src: &Path, dest: &Path) -> std::io::Result<()> {
    let options = fs_extra::dir::CopyOptions::new().copy_inside(true).overwrite(true);
    fs_extra::dir::copy(src, dest, &options)
        .map(|_| ())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::Manifest;

    fn make_project(tmp: &Path, id: &str, public: bool) -> Project {
        let manifest = Manifest::parse(
            &format!(r#"{{"id": "{id}", "value": {{"language": "c", "public": {public}}}}}"#),
            &tmp.join("project.json"),
        )
        .unwrap();
        let project = Project::from_manifest(tmp.to_path_buf(), manifest).unwrap();
        fs::create_dir_all(tmp.join("include")).unwrap();
        fs::write(tmp.join("include").join(format!("{}.h", project.id.base())), b"// header").unwrap();
        project
    }

    #[test]
    fn installs_and_removes_metadata() {
        let home = tempfile::tempdir().unwrap();
        let project_dir = tempfile::tempdir().unwrap();
        fs::write(project_dir.path().join("project.json"), br#"{"id": "foo"}"#).unwrap();
        let project = make_project(project_dir.path(), "foo", true);

        let mut paths = EnvPaths::init(Some(home.path().to_path_buf()), None, None);
        let mut installer = Installer::new(&mut paths);

        installer.install_metadata(&project).unwrap();
        assert!(home.path().join("meta/foo/project.json").is_file());

        installer.uninstall(&project, "x86_64-linux-debug").unwrap();
        assert!(!home.path().join("meta/foo").exists());
    }

    #[test]
    fn private_projects_are_not_installed() {
        let home = tempfile::tempdir().unwrap();
        let project_dir = tempfile::tempdir().unwrap();
        let project = make_project(project_dir.path(), "priv", false);

        let mut paths = EnvPaths::init(Some(home.path().to_path_buf()), None, None);
        let mut installer = Installer::new(&mut paths);
        installer.install_metadata(&project).unwrap();

        assert!(!home.path().join("meta/priv").exists());
    }

    #[test]
    fn includes_escaping_project_root_are_rejected() {
        let home = tempfile::tempdir().unwrap();
        let project_dir = tempfile::tempdir().unwrap();
        let mut project = make_project(project_dir.path(), "foo", true);
        project.includes = vec!["../../etc".to_string()];

        let mut paths = EnvPaths::init(Some(home.path().to_path_buf()), None, None);
        let mut installer = Installer::new(&mut paths);
        assert!(installer.install_includes(&project).is_err());
    }

    #[test]
    fn stray_top_level_include_entry_is_rejected() {
        let home = tempfile::tempdir().unwrap();
        let project_dir = tempfile::tempdir().unwrap();
        let project = make_project(project_dir.path(), "foo", true);
        fs::write(project_dir.path().join("include/stray.txt"), b"nope").unwrap();

        let mut paths = EnvPaths::init(Some(home.path().to_path_buf()), None, None);
        let mut installer = Installer::new(&mut paths);
        assert!(installer.install_includes(&project).is_err());
    }

    #[test]
    fn install_metadata_writes_source_txt() {
        let home = tempfile::tempdir().unwrap();
        let project_dir = tempfile::tempdir().unwrap();
        let project = make_project(project_dir.path(), "foo", true);

        let mut paths = EnvPaths::init(Some(home.path().to_path_buf()), None, None);
        let mut installer = Installer::new(&mut paths);
        installer.install_metadata(&project).unwrap();

        let source_txt = home.path().join("meta/foo/source.txt");
        assert!(source_txt.is_file());
        assert_eq!(fs::read_to_string(&source_txt).unwrap(), project_dir.path().display().to_string());
    }

    #[test]
    fn install_prebuild_mirrors_etc_and_package_lib() {
        let home = tempfile::tempdir().unwrap();
        let project_dir = tempfile::tempdir().unwrap();
        let project = make_project(project_dir.path(), "foo", true);

        fs::create_dir_all(project_dir.path().join("etc")).unwrap();
        fs::write(project_dir.path().join("etc/data.txt"), b"resource").unwrap();
        fs::create_dir_all(project_dir.path().join("lib")).unwrap();
        fs::write(project_dir.path().join("lib/libvendored.a"), b"prebuilt").unwrap();

        let mut paths = EnvPaths::init(Some(home.path().to_path_buf()), None, None);
        let mut installer = Installer::new(&mut paths);
        installer.install_prebuild(&project, "x86_64-linux-debug").unwrap();

        assert!(home.path().join("etc/foo/data.txt").exists());
        assert!(home.path().join("lib/libvendored.a").exists());
    }

    #[test]
    fn uninstall_removes_etc_tree() {
        let home = tempfile::tempdir().unwrap();
        let project_dir = tempfile::tempdir().unwrap();
        let project = make_project(project_dir.path(), "foo", true);
        fs::create_dir_all(project_dir.path().join("etc")).unwrap();
        fs::write(project_dir.path().join("etc/data.txt"), b"resource").unwrap();

        let mut paths = EnvPaths::init(Some(home.path().to_path_buf()), None, None);
        let mut installer = Installer::new(&mut paths);
        installer.install_etc(&project).unwrap();
        assert!(home.path().join("etc/foo").exists());

        installer.uninstall(&project, "x86_64-linux-debug").unwrap();
        assert!(!home.path().join("etc/foo").exists());
    }

    #[test]
    fn nested_id_header_is_renamed_to_underscored_form_on_install() {
        let home = tempfile::tempdir().unwrap();
        let project_dir = tempfile::tempdir().unwrap();
        let project = make_project(project_dir.path(), "foo.bar", true);

        let mut paths = EnvPaths::init(Some(home.path().to_path_buf()), None, None);
        let mut installer = Installer::new(&mut paths);
        installer.install_includes(&project).unwrap();

        let installed = home.path().join("include").join(format!("{}.dir", project.id.dashed())).join("include");
        assert!(!installed.join("bar.h").exists());
        assert!(installed.join("foo_bar.h").exists());
    }
}
