//! The project model: `project.json` manifests, logical ids, and the
//! in-memory representation of a single project.

use std::{
    collections::BTreeMap,
    fmt,
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    attr::{resolve_driver_config, AttrValue},
    error::{io_err, BakeError, Result},
    jsonc,
    paths::EnvPaths,
};

/// A validated logical project id, e.g. `foo.bar.baz`.
///
/// Per the data model invariant, the first character must be a letter and
/// every remaining character must be a letter, digit, `_` or `.`. The
/// underscored and dashed forms used elsewhere (paths, C symbol names,
/// filenames) are derived on demand rather than stored, since they are
/// purely a function of the dotted id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ProjectId(String);

impl ProjectId {
    pub fn parse(raw: &str) -> Result<Self> {
        let mut chars = raw.chars();
        let valid = match chars.next() {
            Some(c) if c.is_ascii_alphabetic() => {
                chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
            }
            _ => false,
        };

        if !valid {
            return Err(BakeError::InvalidProjectId(raw.to_string()));
        }

        Ok(ProjectId(raw.to_string()))
    }

    /// The canonical dotted form, e.g. `"foo.bar.baz"`.
    pub fn dotted(&self) -> &str {
        &self.0
    }

    /// e.g. `"foo_bar_baz"`.
    pub fn underscored(&self) -> String {
        self.0.replace('.', "_")
    }

    /// e.g. `"foo-bar-baz"`.
    pub fn dashed(&self) -> String {
        self.0.replace('.', "-")
    }

    /// The last dotted component, e.g. `"baz"` for `"foo.bar.baz"`.
    pub fn base(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or(&self.0)
    }

    pub fn upper(&self) -> String {
        self.underscored().to_uppercase()
    }

    pub fn camel_case(&self) -> String {
        Self::join_case(&self.0, false)
    }

    pub fn pascal_case(&self) -> String {
        Self::join_case(&self.0, true)
    }

    fn join_case(id: &str, capitalize_first: bool) -> String {
        let mut out = String::with_capacity(id.len());
        let mut capitalize_next = capitalize_first;
        for c in id.chars() {
            if c == '.' {
                capitalize_next = true;
                continue;
            }
            if capitalize_next {
                out.extend(c.to_uppercase());
                capitalize_next = false;
            } else {
                out.push(c);
            }
        }
        out
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `type` field of a manifest. Legacy `executable`/`library` values are
/// accepted as aliases for `application`/`package`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectType {
    #[serde(alias = "library")]
    #[default]
    Package,
    #[serde(alias = "executable")]
    Application,
    Tool,
    Template,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ManifestValue {
    pub author: Option<String>,
    pub description: Option<String>,
    pub version: Option<String>,
    pub language: Option<String>,
    #[serde(default)]
    pub public: bool,
    #[serde(default, rename = "use")]
    pub use_: Vec<String>,
    #[serde(default, rename = "use-private")]
    pub use_private: Vec<String>,
    #[serde(default, rename = "use-build")]
    pub use_build: Vec<String>,
    #[serde(default, rename = "use-runtime")]
    pub use_runtime: Vec<String>,
    #[serde(default, rename = "use-bundle")]
    pub use_bundle: Vec<String>,
    #[serde(default)]
    pub link: Vec<String>,
    pub sources: Option<Vec<String>>,
    pub includes: Option<Vec<String>>,
    #[serde(default, rename = "keep-binary")]
    pub keep_binary: bool,
    #[serde(default)]
    pub coverage: bool,
    #[serde(default)]
    pub amalgamate: bool,
    #[serde(default)]
    pub standalone: bool,
    pub repository: Option<String>,
}

/// The raw, deserialized shape of `project.json`.
///
/// Any top-level key other than `id`, `type`, `value`, `dependee` and
/// `bundle` is the id of a driver whose configuration is the object value;
/// `#[serde(flatten)]` collects those into `driver_configs` for free.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    pub id: String,
    #[serde(default, rename = "type")]
    pub project_type: ProjectType,
    #[serde(default)]
    pub value: ManifestValue,
    #[serde(default)]
    pub dependee: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub bundle: serde_json::Map<String, serde_json::Value>,
    #[serde(flatten)]
    pub driver_configs: BTreeMap<String, serde_json::Value>,
}

impl Manifest {
    pub fn parse(text: &str, path: &Path) -> Result<Self> {
        let stripped = jsonc::strip_comments(text);
        serde_json::from_str(&stripped)
            .map_err(|source| BakeError::ManifestParse { path: path.to_path_buf(), source })
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(io_err(path))?;
        Self::parse(&text, path)
    }
}

/// A driver's parsed configuration for one project: the raw JSON object the
/// manifest declared for it, plus the typed attribute map the attribute
/// engine resolved from it.
#[derive(Debug, Clone, Default)]
pub struct DriverBinding {
    pub driver_id: String,
    pub raw: serde_json::Value,
    pub attrs: BTreeMap<String, AttrValue>,
    /// Attributes inherited from a base driver this one declared, if any.
    pub base_attrs: Option<BTreeMap<String, AttrValue>>,
}

/// In-memory representation of a single discovered (or placeholder)
/// project.
#[derive(Debug, Clone)]
pub struct Project {
    pub id: ProjectId,
    pub project_type: ProjectType,
    pub path: PathBuf,
    pub language: Option<String>,
    pub version: Option<String>,
    pub author: Option<String>,
    pub description: Option<String>,
    pub public: bool,
    pub sources: Vec<String>,
    pub includes: Vec<String>,
    pub use_: Vec<String>,
    pub use_private: Vec<String>,
    pub use_build: Vec<String>,
    pub use_runtime: Vec<String>,
    pub use_bundle: Vec<String>,
    pub link: Vec<String>,
    pub keep_binary: bool,
    pub coverage: bool,
    pub amalgamate: bool,
    pub standalone: bool,
    pub repository: Option<String>,
    pub dependee: serde_json::Map<String, serde_json::Value>,
    pub bundle: serde_json::Map<String, serde_json::Value>,
    pub driver_configs: BTreeMap<String, serde_json::Value>,
    pub drivers: Vec<DriverBinding>,
    /// Filename of the build artefact, computed by the language driver
    /// (e.g. `libfoo.so`). `None` until the `build` phase has run once.
    pub artefact_filename: Option<String>,
}

const DEFAULT_SOURCES: &str = "src";
const DEFAULT_INCLUDES: &str = "include";

impl Project {
    pub fn from_manifest(path: PathBuf, manifest: Manifest) -> Result<Self> {
        let id = ProjectId::parse(&manifest.id)?;
        let v = manifest.value;

        Ok(Self {
            id,
            project_type: manifest.project_type,
            path,
            language: v.language,
            version: v.version,
            author: v.author,
            description: v.description,
            public: v.public,
            sources: v.sources.unwrap_or_else(|| vec![DEFAULT_SOURCES.to_string()]),
            includes: v.includes.unwrap_or_else(|| vec![DEFAULT_INCLUDES.to_string()]),
            use_: v.use_,
            use_private: v.use_private,
            use_build: v.use_build,
            use_runtime: v.use_runtime,
            use_bundle: v.use_bundle,
            link: v.link,
            keep_binary: v.keep_binary,
            coverage: v.coverage,
            amalgamate: v.amalgamate,
            standalone: v.standalone,
            repository: v.repository,
            dependee: manifest.dependee,
            bundle: manifest.bundle,
            driver_configs: manifest.driver_configs,
            drivers: Vec::new(),
            artefact_filename: None,
        })
    }

    /// Loads `<dir>/project.json`.
    pub fn load(dir: &Path) -> Result<Self> {
        let manifest_path = dir.join("project.json");
        let manifest = Manifest::read(&manifest_path)?;
        Self::from_manifest(dir.to_path_buf(), manifest)
    }

    /// The id of this project's language driver, e.g. `"lang.c"`, if any.
    pub fn language_driver_id(&self) -> Option<String> {
        self.language.as_ref().map(|l| format!("lang.{l}"))
    }

    /// `use ∪ use-private ∪ use-build ∪ use-runtime` — the edges the
    /// dependency graph walks. `use-bundle` is excluded: it only feeds the
    /// (out of scope) bundle fetcher, not the build order.
    pub fn build_dependencies(&self) -> impl Iterator<Item = &str> {
        self.use_
            .iter()
            .chain(self.use_private.iter())
            .chain(self.use_build.iter())
            .chain(self.use_runtime.iter())
            .map(String::as_str)
    }

    /// `<path>/bin/<cpu-os-config>`, where build outputs land before being
    /// installed into the environment.
    pub fn bin_path(&self, platform_config: &str) -> PathBuf {
        self.path.join("bin").join(platform_config)
    }

    /// `<path>/.bake_cache` — per-project incremental build cache.
    pub fn cache_path(&self) -> PathBuf {
        self.path.join(".bake_cache")
    }

    /// The full path to this project's artefact, if the language driver has
    /// computed a filename for it. `None` for `template` projects, and for
    /// any project that hasn't been built yet.
    pub fn artefact_path(&self, platform_config: &str) -> Option<PathBuf> {
        self.artefact_filename.as_ref().map(|f| self.bin_path(platform_config).join(f))
    }

    pub fn is_public(&self) -> bool {
        self.public
    }

    pub fn produces_artefact(&self) -> bool {
        !matches!(self.project_type, ProjectType::Template)
    }

    /// Runs the attribute interpolation engine over every driver config
    /// block this project declared, resolving `${...}` placeholders and
    /// folding conditional sub-blocks, and populates `self.drivers` with
    /// the result. Must run after `driver_configs` has received any
    /// dependee contributions, and before a driver is handed its config.
    pub fn resolve_drivers(&mut self, dependee: Option<&Project>, paths: &mut EnvPaths) -> Result<()> {
        let configs = self.driver_configs.clone();
        let mut bindings = Vec::with_capacity(configs.len());
        for (driver_id, raw) in &configs {
            let (merged, attrs) = {
                let mut ctx = crate::attr::InterpContext { project: self, dependee, driver_id, paths };
                resolve_driver_config(raw, &mut ctx).map_err(|detail| BakeError::DriverCallback {
                    project: self.id.dotted().to_string(),
                    node: driver_id.clone(),
                    detail: format!(" ({detail})"),
                })?
            };
            bindings.push(DriverBinding { driver_id: driver_id.clone(), raw: merged, attrs, base_attrs: None });
        }
        self.drivers = bindings;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_forms_round_trip() {
        let id = ProjectId::parse("a.b.c").unwrap();
        assert_eq!(id.base(), "c");
        assert_eq!(id.underscored(), "a_b_c");
        assert_eq!(id.dashed(), "a-b-c");
    }

    #[test]
    fn id_must_start_with_a_letter() {
        assert!(ProjectId::parse("9abc").is_err());
        assert!(ProjectId::parse("_abc").is_err());
        assert!(ProjectId::parse("abc9_.def").is_ok());
    }

    #[test]
    fn id_rejects_dash() {
        // dashes are only ever a derived *display* form, never valid input.
        assert!(ProjectId::parse("foo-bar").is_err());
    }

    #[test]
    fn manifest_accepts_legacy_type_aliases() {
        let manifest = Manifest::parse(
            r#"{"id": "foo", "type": "executable", "value": {"language": "c"}}"#,
            Path::new("project.json"),
        )
        .unwrap();
        assert_eq!(manifest.project_type, ProjectType::Application);
    }

    #[test]
    fn manifest_collects_driver_configs() {
        let manifest = Manifest::parse(
            r#"{
                "id": "foo",
                "value": {"language": "c"},
                "lang.c": {"cflags": ["-Wall"]}
            }"#,
            Path::new("project.json"),
        )
        .unwrap();
        assert!(manifest.driver_configs.contains_key("lang.c"));
    }

    #[test]
    fn manifest_tolerates_comments() {
        let manifest = Manifest::parse(
            r#"{
                // a comment
                "id": "foo" /* trailing */
            }"#,
            Path::new("project.json"),
        )
        .unwrap();
        assert_eq!(manifest.id, "foo");
    }

    #[test]
    fn defaults_sources_and_includes() {
        let manifest =
            Manifest::parse(r#"{"id": "foo"}"#, Path::new("project.json")).unwrap();
        let project = Project::from_manifest(PathBuf::from("/tmp/foo"), manifest).unwrap();
        assert_eq!(project.sources, vec!["src".to_string()]);
        assert_eq!(project.includes, vec!["include".to_string()]);
    }
}
