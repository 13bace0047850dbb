//! `bake.json`: the user-level configuration file naming build profiles,
//! environment overrides and bundles, as distinct from a project's own
//! `project.json`.

use std::{fs, path::Path};

use serde::Deserialize;

use crate::{
    error::{io_err, BakeError, Result},
    jsonc,
};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigProfile {
    #[serde(default)]
    pub symbols: bool,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub optimizations: bool,
    #[serde(default)]
    pub coverage: bool,
    /// Treats a driver warning (e.g. an unknown attribute) as a hard error
    /// while this profile is active.
    #[serde(default)]
    pub strict: bool,
    /// Extra attributes merged into every project's driver configuration
    /// while this profile is active, keyed by driver id.
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

/// A project id's resolved bundle reference: which published bundle
/// satisfies its `use-bundle` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct BundleRef {
    pub bundle: String,
}

/// `bake.json`'s root shape.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BakeConfig {
    #[serde(default)]
    pub configuration: Option<String>,
    #[serde(default)]
    pub configurations: std::collections::BTreeMap<String, ConfigProfile>,
    /// Project id -> the bundle that satisfies it.
    #[serde(default)]
    pub bundles: std::collections::BTreeMap<String, BundleRef>,
    /// Round-tripped from the original tool's `keep-binary`/`assembly`/`CI`
    /// top-level flags, which the distillation dropped but real-world
    /// `bake.json` files still set.
    #[serde(default, rename = "keep-binary")]
    pub keep_binary: bool,
    #[serde(default)]
    pub assembly: bool,
    #[serde(default, rename = "CI")]
    pub ci: bool,
}

impl BakeConfig {
    pub fn parse(text: &str, path: &Path) -> Result<Self> {
        let stripped = jsonc::strip_comments(text);
        serde_json::from_str(&stripped).map_err(|source| BakeError::ManifestParse { path: path.to_path_buf(), source })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(io_err(path))?;
        Self::parse(&text, path)
    }

    /// Loads `<home>/bake.json`, returning the default (empty) config if
    /// it doesn't exist - `bake.json` is optional.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn active_profile(&self, requested: Option<&str>) -> Option<&ConfigProfile> {
        let name = requested.or(self.configuration.as_deref())?;
        self.configurations.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn missing_file_yields_default_config() {
        let config = BakeConfig::load_or_default(&PathBuf::from("/nonexistent/bake.json")).unwrap();
        assert!(config.configurations.is_empty());
    }

    #[test]
    fn parses_profiles_and_bundles() {
        let config = BakeConfig::parse(
            r#"{
                "configuration": "debug",
                "configurations": {"debug": {"debug": true, "symbols": true, "strict": true}},
                "bundles": {"foo.lib": {"bundle": "foo.bundle"}},
                "keep-binary": true
            }"#,
            Path::new("bake.json"),
        )
        .unwrap();

        assert_eq!(config.configuration.as_deref(), Some("debug"));
        let profile = config.active_profile(None).unwrap();
        assert!(profile.debug);
        assert!(profile.strict);
        assert_eq!(config.bundles["foo.lib"].bundle, "foo.bundle");
        assert!(config.keep_binary);
    }
}
