use std::env;

use anyhow::{Context, Result};
use regex::Regex;

const ENV_SETTINGS_GIT_URL: &str = "PIPEWRIGHT_SETTINGS_GIT_URL";
const ENV_SETTINGS_GIT_BRANCH: &str = "PIPEWRIGHT_SETTINGS_GIT_BRANCH";
const ENV_SETTINGS_PATH_PREFIX: &str = "PIPEWRIGHT_SETTINGS_PATH_PREFIX";
const ENV_NAME_REGEX_REPLACE: &str = "PIPEWRIGHT_NAME_REGEX_REPLACE";

/// Tunables governing where pipeline settings are fetched from and how the
/// settings filename is derived from the job name. Each field falls back to
/// a compiled-in default and is overridable through a `PIPEWRIGHT_`-prefixed
/// environment variable.
#[derive(Debug, Clone)]
pub struct Config {
    pub settings_repo_url: String,
    pub settings_default_branch: String,
    pub settings_relative_path_prefix: String,
    /// Ordered regex patterns stripped from the job name when deriving the
    /// settings filename.
    pub pipeline_name_regex_replace: Vec<String>,
    /// Credentials identifier handed to the git collaborator when an action
    /// does not name its own.
    pub default_credentials_id: String,
    /// Installation name of the remote runner, surfaced through built-ins.
    pub remote_runner_installation: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            settings_repo_url: "ssh://git@git.internal/ci/pipeline-settings.git".to_string(),
            settings_default_branch: "main".to_string(),
            settings_relative_path_prefix: "settings".to_string(),
            pipeline_name_regex_replace: vec!["^(ci|deploy)-".to_string(), "-(dev|prod)$".to_string()],
            default_credentials_id: "pipeline-git".to_string(),
            remote_runner_installation: "ansible210".to_string(),
        }
    }
}

impl Config {
    /// Defaults overlaid with any environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = env::var(ENV_SETTINGS_GIT_URL) {
            config.settings_repo_url = url;
        }
        if let Ok(branch) = env::var(ENV_SETTINGS_GIT_BRANCH) {
            config.settings_default_branch = branch;
        }
        if let Ok(prefix) = env::var(ENV_SETTINGS_PATH_PREFIX) {
            config.settings_relative_path_prefix = prefix;
        }
        if let Ok(patterns) = env::var(ENV_NAME_REGEX_REPLACE) {
            config.pipeline_name_regex_replace = patterns
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
        }
        config
    }

    /// Strip the configured patterns from a job name, in order.
    pub fn stripped_job_name(&self, job_name: &str) -> Result<String> {
        let mut name = job_name.to_string();
        for pattern in &self.pipeline_name_regex_replace {
            let re = Regex::new(pattern)
                .with_context(|| format!("Invalid job name strip pattern: {pattern}"))?;
            name = re.replace_all(&name, "").to_string();
        }
        Ok(name)
    }

    /// Relative path of the settings file for a job:
    /// `<prefix>/<stripped-name>.yaml`.
    pub fn settings_relative_path(&self, job_name: &str) -> Result<String> {
        let stripped = self.stripped_job_name(job_name)?;
        Ok(format!(
            "{}/{}.yaml",
            self.settings_relative_path_prefix.trim_end_matches('/'),
            stripped
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_patterns_apply_in_order() {
        let config = Config {
            pipeline_name_regex_replace: vec!["^ci-".to_string(), "-prod$".to_string()],
            ..Config::default()
        };
        assert_eq!(config.stripped_job_name("ci-webapp-prod").unwrap(), "webapp");
        assert_eq!(config.stripped_job_name("webapp").unwrap(), "webapp");
    }

    #[test]
    fn relative_path_includes_prefix() {
        let config = Config {
            settings_relative_path_prefix: "settings/".to_string(),
            pipeline_name_regex_replace: vec!["^ci-".to_string()],
            ..Config::default()
        };
        assert_eq!(
            config.settings_relative_path("ci-webapp").unwrap(),
            "settings/webapp.yaml"
        );
    }

    #[test]
    fn invalid_strip_pattern_is_an_error() {
        let config = Config {
            pipeline_name_regex_replace: vec!["([".to_string()],
            ..Config::default()
        };
        assert!(config.stripped_job_name("anything").is_err());
    }
}
