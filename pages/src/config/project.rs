use pages_core::ProjectType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::error::{ConfigError, Result};

pub const DESCRIPTOR_FILE: &str = "sked.proj.json";
pub const PACKAGE_FILE: &str = "package.json";

/// Per-project descriptor (`sked.proj.json`).
///
/// Only the fields the dev tooling consumes are modelled; anything else in
/// the file is ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectDescriptor {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(rename = "type")]
    pub project_type: ProjectType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,

    /// Passed through to the remote dev session registration
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,

    /// Function request handler command (function projects)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,

    /// Package manager used to run scripts, e.g. `npm`, `yarn`, `pnpm`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_manager: Option<String>,
}

impl ProjectDescriptor {
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let path = dir.join(DESCRIPTOR_FILE);
        if !path.is_file() {
            return Err(ConfigError::ProjectNotFound(path));
        }
        let content =
            fs::read_to_string(&path).map_err(|e| ConfigError::FileRead(path.clone(), e))?;
        let descriptor: Self =
            serde_json::from_str(&content).map_err(|e| ConfigError::JsonParse(path.clone(), e))?;
        if descriptor.name.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "{} has an empty `name`",
                path.display()
            )));
        }
        Ok(descriptor)
    }
}

/// The `scripts` map of a project's `package.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PackageScripts {
    #[serde(default)]
    pub scripts: BTreeMap<String, String>,
}

impl PackageScripts {
    /// Load scripts; a project without `package.json` has none.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let path: PathBuf = dir.join(PACKAGE_FILE);
        if !path.is_file() {
            return Ok(Self::default());
        }
        let content =
            fs::read_to_string(&path).map_err(|e| ConfigError::FileRead(path.clone(), e))?;
        serde_json::from_str(&content).map_err(|e| ConfigError::JsonParse(path, e))
    }

    pub fn has(&self, name: &str) -> bool {
        self.scripts.contains_key(name)
    }
}
