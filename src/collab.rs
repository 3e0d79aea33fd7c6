//! Collaborator contracts for everything the orchestrator core does not
//! implement itself: source control, remote command execution, downstream
//! job dispatch, artifact handling, messaging, node lookup and the
//! build-level host operations.
//!
//! All traits are async and backend-agnostic. Process-backed local
//! implementations live here; in-memory fakes for testing live in the
//! `fakes` module.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::context::BuildResult;
use crate::params::schema::ParamSchema;

/// Clone primitive for the settings repository and `repo_url` actions.
#[async_trait]
pub trait GitClient: Send + Sync {
    async fn clone_repo(
        &self,
        url: &str,
        branch: &str,
        folder: &Path,
        credentials: Option<&str>,
    ) -> Result<()>;
}

/// Remote-command runner behind the `playbook` and `collections` actions.
#[async_trait]
pub trait RemoteRunner: Send + Sync {
    async fn run_playbook(
        &self,
        playbook: &str,
        inventory: &str,
        installation: &str,
    ) -> Result<()>;

    async fn install_collection(&self, collection: &str, installation: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Shell execution for `script` actions.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run_shell(&self, script: &str, dir: Option<&Path>) -> Result<CommandOutput>;
}

#[derive(Debug, Clone)]
pub struct DownstreamParam {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct DownstreamBuild {
    pub result: BuildResult,
    pub number: u64,
    pub url: String,
}

/// Downstream job system behind the `pipeline` action.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        name: &str,
        params: &[DownstreamParam],
        propagate: bool,
        wait: bool,
    ) -> Result<DownstreamBuild>;
}

#[derive(Debug, Clone, Default)]
pub struct StashSpec {
    pub includes: Option<String>,
    pub excludes: Option<String>,
    pub default_excludes: bool,
    pub allow_empty: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PublishSpec {
    pub artifacts: String,
    pub excludes: Option<String>,
    pub allow_empty: bool,
    pub fingerprint: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CopySpec {
    pub filter: Option<String>,
    pub excludes: Option<String>,
    pub target_directory: Option<String>,
    pub optional: bool,
    pub flatten: bool,
    pub fingerprint: bool,
}

/// Stash/unstash, artifact publication and cross-build artifact copy.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn stash(&self, name: &str, spec: &StashSpec) -> Result<()>;
    async fn unstash(&self, name: &str) -> Result<()>;
    async fn publish(&self, spec: &PublishSpec) -> Result<()>;
    async fn copy(&self, project: &str, build_number: u64, spec: &CopySpec) -> Result<()>;
}

/// Messaging sinks behind the `report` action.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_email(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        reply_to: Option<&str>,
    ) -> Result<()>;

    async fn send_mattermost(&self, url: &str, text: &str) -> Result<()>;
}

/// A worker host known to the registry.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub name: String,
    pub labels: Vec<String>,
}

/// Live view of the worker fleet. The core makes the match decision; the
/// registry only reports what exists right now.
#[async_trait]
pub trait NodeRegistry: Send + Sync {
    async fn nodes(&self) -> Result<Vec<NodeInfo>>;
}

/// Build-level operations on the CI host owning the run.
#[async_trait]
pub trait CiHost: Send + Sync {
    /// Parameters declared on the current build, as name/value pairs.
    fn current_parameters(&self) -> BTreeMap<String, String>;

    /// Replace the build's parameter declaration with the given schema.
    async fn install_parameters(&self, schema: &[ParamSchema]) -> Result<()>;

    /// Rename the running build.
    async fn rename_build(&self, name: &str) -> Result<()>;

    /// Name of the host the run is currently attached to.
    fn current_node(&self) -> String;

    /// Block until a node matching the name (or carrying the label) can
    /// take the next action. Worker allocation itself is the host's
    /// business.
    async fn lease_node(&self, target: &str, is_label: bool) -> Result<()>;

    fn workspace(&self) -> PathBuf;
}

/// Bundle of collaborator handles threaded through the walker.
#[derive(Clone)]
pub struct Collaborators {
    pub git: Arc<dyn GitClient>,
    pub runner: Arc<dyn RemoteRunner>,
    pub shell: Arc<dyn CommandRunner>,
    pub dispatcher: Arc<dyn JobDispatcher>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub messenger: Arc<dyn Messenger>,
    pub nodes: Arc<dyn NodeRegistry>,
    pub host: Arc<dyn CiHost>,
}

// ---------------------------------------------------------------------------
// Process-backed local implementations
// ---------------------------------------------------------------------------

/// Git CLI wrapper.
pub struct ProcessGitClient;

#[async_trait]
impl GitClient for ProcessGitClient {
    async fn clone_repo(
        &self,
        url: &str,
        branch: &str,
        folder: &Path,
        credentials: Option<&str>,
    ) -> Result<()> {
        if let Some(id) = credentials {
            info!(credentials = id, "Using configured git credentials");
        }
        let output = Command::new("git")
            .args(["clone", "--depth", "1", "--branch", branch, url])
            .arg(folder)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("Failed to spawn git")?;
        if !output.status.success() {
            bail!(
                "git clone of branch '{}' failed: {}",
                branch,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Runs scripts through the local shell.
pub struct LocalShell;

#[async_trait]
impl CommandRunner for LocalShell {
    async fn run_shell(&self, script: &str, dir: Option<&Path>) -> Result<CommandOutput> {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        if let Some(dir) = dir {
            command.current_dir(dir);
        }
        let output = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("Failed to spawn shell")?;
        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Remote runner backed by a local ansible installation: playbook and
/// inventory texts are written into the workspace and handed to
/// `ansible-playbook`.
pub struct ProcessRemoteRunner {
    workspace: PathBuf,
}

impl ProcessRemoteRunner {
    pub fn new(workspace: PathBuf) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl RemoteRunner for ProcessRemoteRunner {
    async fn run_playbook(
        &self,
        playbook: &str,
        inventory: &str,
        installation: &str,
    ) -> Result<()> {
        let dir = self.workspace.join(".remote-runner");
        tokio::fs::create_dir_all(&dir).await?;
        let playbook_path = dir.join("playbook.yaml");
        let inventory_path = dir.join("inventory.ini");
        tokio::fs::write(&playbook_path, playbook).await?;
        tokio::fs::write(&inventory_path, inventory).await?;

        info!(installation, "Invoking remote runner");
        let output = Command::new("ansible-playbook")
            .arg("-i")
            .arg(&inventory_path)
            .arg(&playbook_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("Failed to spawn ansible-playbook")?;
        if !output.status.success() {
            bail!(
                "Playbook run failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    async fn install_collection(&self, collection: &str, installation: &str) -> Result<()> {
        info!(collection, installation, "Installing collection");
        let output = Command::new("ansible-galaxy")
            .args(["collection", "install", collection])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("Failed to spawn ansible-galaxy")?;
        if !output.status.success() {
            bail!(
                "Collection install of '{}' failed: {}",
                collection,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Messaging sink that logs instead of sending; local runs have no mail
/// relay or chat webhook wired in.
pub struct LogMessenger;

#[async_trait]
impl Messenger for LogMessenger {
    async fn send_email(
        &self,
        to: &str,
        subject: &str,
        body: &str,
        reply_to: Option<&str>,
    ) -> Result<()> {
        info!(to, subject, reply_to, "Email report:\n{body}");
        Ok(())
    }

    async fn send_mattermost(&self, url: &str, text: &str) -> Result<()> {
        info!(url, "Mattermost report:\n{text}");
        Ok(())
    }
}

/// Registry containing only the local host, labelled through the
/// PIPEWRIGHT_NODE_LABELS environment variable.
pub struct LocalNodeRegistry;

#[async_trait]
impl NodeRegistry for LocalNodeRegistry {
    async fn nodes(&self) -> Result<Vec<NodeInfo>> {
        let name = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let labels = std::env::var("PIPEWRIGHT_NODE_LABELS")
            .map(|raw| {
                raw.split(',')
                    .map(|l| l.trim().to_string())
                    .filter(|l| !l.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        Ok(vec![NodeInfo { name, labels }])
    }
}

/// Placeholder dispatcher for hosts without a downstream job system.
pub struct UnsupportedDispatcher;

#[async_trait]
impl JobDispatcher for UnsupportedDispatcher {
    async fn dispatch(
        &self,
        name: &str,
        _params: &[DownstreamParam],
        _propagate: bool,
        _wait: bool,
    ) -> Result<DownstreamBuild> {
        bail!("Downstream job '{name}' cannot be dispatched: no job system configured");
    }
}

/// Host implementation for running a pipeline on the local machine: build
/// parameters come from the process environment, the parameter declaration
/// is written into the workspace, and node leases are a formality.
pub struct LocalHost {
    workspace: PathBuf,
    node_name: String,
}

impl LocalHost {
    pub fn new(workspace: PathBuf) -> Self {
        let node_name = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        Self {
            workspace,
            node_name,
        }
    }
}

#[async_trait]
impl CiHost for LocalHost {
    fn current_parameters(&self) -> BTreeMap<String, String> {
        std::env::vars().collect()
    }

    async fn install_parameters(&self, schema: &[ParamSchema]) -> Result<()> {
        let declaration: Vec<serde_yaml::Value> =
            schema.iter().map(ParamSchema::to_declaration).collect();
        let rendered = serde_yaml::to_string(&declaration)?;
        let path = self.workspace.join("parameters.yaml");
        tokio::fs::write(&path, rendered)
            .await
            .with_context(|| format!("Failed to write parameter declaration: {}", path.display()))?;
        info!(path = %path.display(), "Parameter declaration installed");
        Ok(())
    }

    async fn rename_build(&self, name: &str) -> Result<()> {
        info!(build_name = name, "Build renamed");
        Ok(())
    }

    fn current_node(&self) -> String {
        self.node_name.clone()
    }

    async fn lease_node(&self, target: &str, is_label: bool) -> Result<()> {
        info!(target, is_label, "Node lease requested");
        Ok(())
    }

    fn workspace(&self) -> PathBuf {
        self.workspace.clone()
    }
}
