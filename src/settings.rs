use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_yaml::Value;
use thiserror::Error;
use tracing::info;

use crate::collab::GitClient;

/// The settings tree loaded from the pipeline's YAML file. Stage and
/// action-link subtrees stay dynamically typed; the walker validates them
/// key by key so every problem can be reported in one pass. Keys not
/// listed here are ignored.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct PipelineSettings {
    #[serde(default)]
    pub parameters: ParameterSection,
    #[serde(default)]
    pub stages: Vec<Value>,
    #[serde(default)]
    pub actions: BTreeMap<String, Value>,
    #[serde(default)]
    pub playbooks: BTreeMap<String, String>,
    #[serde(default)]
    pub inventories: BTreeMap<String, String>,
    #[serde(default)]
    pub scripts: BTreeMap<String, Value>,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct ParameterSection {
    #[serde(default)]
    pub required: Vec<Value>,
    #[serde(default)]
    pub optional: Vec<Value>,
}

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("Failed to clone settings repository {url} at branch {branch}: {message}")]
    Clone {
        url: String,
        branch: String,
        message: String,
    },

    #[error("Failed to read settings file {path}: {message}")]
    Read { path: PathBuf, message: String },

    #[error("Failed to parse settings file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Fetch the settings repository and parse the pipeline's YAML file.
pub struct SettingsLoader<'a> {
    git: &'a dyn GitClient,
    credentials: Option<String>,
}

impl<'a> SettingsLoader<'a> {
    pub fn new(git: &'a dyn GitClient, credentials: Option<String>) -> Self {
        Self { git, credentials }
    }

    /// Clone `url` at `branch` into `workspace/pipeline-settings`, then
    /// read and parse `relative_path` inside the clone. When `verbose` the
    /// raw file contents are logged before parsing.
    pub async fn load(
        &self,
        url: &str,
        branch: &str,
        relative_path: &str,
        workspace: &Path,
        verbose: bool,
    ) -> Result<PipelineSettings, LoaderError> {
        let checkout = workspace.join("pipeline-settings");
        self.git
            .clone_repo(url, branch, &checkout, self.credentials.as_deref())
            .await
            .map_err(|err| LoaderError::Clone {
                url: url.to_string(),
                branch: branch.to_string(),
                message: err.to_string(),
            })?;

        load_file(&checkout.join(relative_path), verbose)
    }
}

/// Parse a settings file already present on disk.
pub fn load_file(path: &Path, verbose: bool) -> Result<PipelineSettings, LoaderError> {
    let content = std::fs::read_to_string(path).map_err(|err| LoaderError::Read {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;

    if verbose {
        info!(path = %path.display(), "Raw pipeline settings:\n{content}");
    }

    serde_yaml::from_str(&content).map_err(|err| LoaderError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_settings_tree_parses() {
        let yaml = r#"
parameters:
  required:
    - name: TARGET
      type: string
  optional:
    - name: FLAVOR
      choices: [a, b]
stages:
  - name: build
    actions:
      - action: checkout
actions:
  checkout:
    repo_url: https://example.invalid/repo.git
playbooks:
  deploy: |
    - hosts: all
inventories:
  default: |
    localhost
scripts:
  hello:
    script: echo hello
"#;
        let settings: PipelineSettings = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(settings.parameters.required.len(), 1);
        assert_eq!(settings.parameters.optional.len(), 1);
        assert_eq!(settings.stages.len(), 1);
        assert!(settings.actions.contains_key("checkout"));
        assert!(settings.playbooks.contains_key("deploy"));
        assert!(settings.inventories.contains_key("default"));
        assert!(settings.scripts.contains_key("hello"));
    }

    #[test]
    fn missing_sections_default_to_empty() {
        let settings: PipelineSettings = serde_yaml::from_str("stages: []").unwrap();
        assert!(settings.parameters.required.is_empty());
        assert!(settings.actions.is_empty());
    }

    #[test]
    fn unreadable_file_is_a_read_error() {
        let err = load_file(Path::new("/nonexistent/settings.yaml"), false).unwrap_err();
        assert!(matches!(err, LoaderError::Read { .. }));
    }

    #[test]
    fn malformed_yaml_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "stages: [unclosed").unwrap();
        let err = load_file(&path, false).unwrap_err();
        assert!(matches!(err, LoaderError::Parse { .. }));
    }
}
