//! In-memory fakes for the collaborator traits (testing only).
//!
//! Every fake records the calls it receives behind a mutex so tests can
//! assert on ordering and payloads without touching git, a shell, or any
//! remote system.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use async_trait::async_trait;

use crate::collab::{
    ArtifactStore, CiHost, Collaborators, CommandOutput, CommandRunner, CopySpec, DownstreamBuild,
    DownstreamParam, GitClient, JobDispatcher, Messenger, NodeInfo, NodeRegistry, PublishSpec,
    StashSpec,
};
use crate::context::BuildResult;
use crate::params::schema::ParamSchema;

#[derive(Debug, Default)]
pub struct RecordingGit {
    pub clones: Mutex<Vec<(String, String, PathBuf)>>,
    pub fail: bool,
}

#[async_trait]
impl GitClient for RecordingGit {
    async fn clone_repo(
        &self,
        url: &str,
        branch: &str,
        folder: &Path,
        _credentials: Option<&str>,
    ) -> Result<()> {
        if self.fail {
            bail!("clone refused");
        }
        self.clones.lock().unwrap().push((
            url.to_string(),
            branch.to_string(),
            folder.to_path_buf(),
        ));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingRunner {
    pub playbooks: Mutex<Vec<(String, String, String)>>,
    pub collections: Mutex<Vec<String>>,
    pub fail: bool,
}

#[async_trait]
impl crate::collab::RemoteRunner for RecordingRunner {
    async fn run_playbook(
        &self,
        playbook: &str,
        inventory: &str,
        installation: &str,
    ) -> Result<()> {
        if self.fail {
            bail!("remote runner refused");
        }
        self.playbooks.lock().unwrap().push((
            playbook.to_string(),
            inventory.to_string(),
            installation.to_string(),
        ));
        Ok(())
    }

    async fn install_collection(&self, collection: &str, _installation: &str) -> Result<()> {
        if self.fail {
            bail!("remote runner refused");
        }
        self.collections.lock().unwrap().push(collection.to_string());
        Ok(())
    }
}

/// Shell whose outputs are scripted per call; unscripted calls succeed
/// with empty output.
#[derive(Debug, Default)]
pub struct ScriptedShell {
    pub outputs: Mutex<BTreeMap<String, CommandOutput>>,
    pub calls: Mutex<Vec<String>>,
}

impl ScriptedShell {
    pub fn respond(&self, script: &str, exit_code: i32, stdout: &str) {
        self.outputs.lock().unwrap().insert(
            script.to_string(),
            CommandOutput {
                exit_code,
                stdout: stdout.to_string(),
                stderr: if exit_code == 0 {
                    String::new()
                } else {
                    "scripted failure".to_string()
                },
            },
        );
    }
}

#[async_trait]
impl CommandRunner for ScriptedShell {
    async fn run_shell(&self, script: &str, _dir: Option<&Path>) -> Result<CommandOutput> {
        self.calls.lock().unwrap().push(script.to_string());
        Ok(self
            .outputs
            .lock()
            .unwrap()
            .get(script)
            .cloned()
            .unwrap_or(CommandOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            }))
    }
}

/// Dispatcher returning a configured result for every downstream job.
#[derive(Debug)]
pub struct ScriptedDispatcher {
    pub result: BuildResult,
    pub dispatched: Mutex<Vec<(String, Vec<DownstreamParam>)>>,
}

impl ScriptedDispatcher {
    pub fn returning(result: BuildResult) -> Self {
        Self {
            result,
            dispatched: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl JobDispatcher for ScriptedDispatcher {
    async fn dispatch(
        &self,
        name: &str,
        params: &[DownstreamParam],
        _propagate: bool,
        _wait: bool,
    ) -> Result<DownstreamBuild> {
        self.dispatched
            .lock()
            .unwrap()
            .push((name.to_string(), params.to_vec()));
        Ok(DownstreamBuild {
            result: self.result,
            number: 7,
            url: format!("https://ci.invalid/job/{name}/7"),
        })
    }
}

#[derive(Debug, Default)]
pub struct MemoryArtifacts {
    pub stashes: Mutex<Vec<String>>,
    pub unstashes: Mutex<Vec<String>>,
    pub published: Mutex<Vec<PublishSpec>>,
    pub copies: Mutex<Vec<(String, u64, CopySpec)>>,
}

#[async_trait]
impl ArtifactStore for MemoryArtifacts {
    async fn stash(&self, name: &str, _spec: &StashSpec) -> Result<()> {
        self.stashes.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn unstash(&self, name: &str) -> Result<()> {
        let known = self.stashes.lock().unwrap();
        if !known.contains(&name.to_string()) {
            bail!("No stash named '{name}'");
        }
        self.unstashes.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn publish(&self, spec: &PublishSpec) -> Result<()> {
        self.published.lock().unwrap().push(spec.clone());
        Ok(())
    }

    async fn copy(&self, project: &str, build_number: u64, spec: &CopySpec) -> Result<()> {
        self.copies
            .lock()
            .unwrap()
            .push((project.to_string(), build_number, spec.clone()));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingMessenger {
    pub emails: Mutex<Vec<(String, String)>>,
    pub mattermost: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl Messenger for RecordingMessenger {
    async fn send_email(
        &self,
        to: &str,
        subject: &str,
        _body: &str,
        _reply_to: Option<&str>,
    ) -> Result<()> {
        self.emails
            .lock()
            .unwrap()
            .push((to.to_string(), subject.to_string()));
        Ok(())
    }

    async fn send_mattermost(&self, url: &str, text: &str) -> Result<()> {
        self.mattermost
            .lock()
            .unwrap()
            .push((url.to_string(), text.to_string()));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct StaticNodes {
    pub nodes: Vec<NodeInfo>,
}

impl StaticNodes {
    pub fn with(nodes: &[(&str, &[&str])]) -> Self {
        Self {
            nodes: nodes
                .iter()
                .map(|(name, labels)| NodeInfo {
                    name: name.to_string(),
                    labels: labels.iter().map(|l| l.to_string()).collect(),
                })
                .collect(),
        }
    }
}

#[async_trait]
impl NodeRegistry for StaticNodes {
    async fn nodes(&self) -> Result<Vec<NodeInfo>> {
        Ok(self.nodes.clone())
    }
}

#[derive(Debug)]
pub struct FakeHost {
    pub parameters: BTreeMap<String, String>,
    pub workspace: PathBuf,
    pub node: String,
    pub installed: Mutex<Vec<Vec<ParamSchema>>>,
    pub renames: Mutex<Vec<String>>,
    pub leases: Mutex<Vec<(String, bool)>>,
}

impl FakeHost {
    pub fn new(parameters: BTreeMap<String, String>, workspace: PathBuf) -> Self {
        Self {
            parameters,
            workspace,
            node: "controller".to_string(),
            installed: Mutex::new(Vec::new()),
            renames: Mutex::new(Vec::new()),
            leases: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl CiHost for FakeHost {
    fn current_parameters(&self) -> BTreeMap<String, String> {
        self.parameters.clone()
    }

    async fn install_parameters(&self, schema: &[ParamSchema]) -> Result<()> {
        self.installed.lock().unwrap().push(schema.to_vec());
        Ok(())
    }

    async fn rename_build(&self, name: &str) -> Result<()> {
        self.renames.lock().unwrap().push(name.to_string());
        Ok(())
    }

    fn current_node(&self) -> String {
        self.node.clone()
    }

    async fn lease_node(&self, target: &str, is_label: bool) -> Result<()> {
        self.leases
            .lock()
            .unwrap()
            .push((target.to_string(), is_label));
        Ok(())
    }

    fn workspace(&self) -> PathBuf {
        self.workspace.clone()
    }
}

/// A full collaborator bundle backed by fakes, with handles retained for
/// assertions.
pub struct FakeWorld {
    pub git: Arc<RecordingGit>,
    pub runner: Arc<RecordingRunner>,
    pub shell: Arc<ScriptedShell>,
    pub dispatcher: Arc<ScriptedDispatcher>,
    pub artifacts: Arc<MemoryArtifacts>,
    pub messenger: Arc<RecordingMessenger>,
    pub nodes: Arc<StaticNodes>,
    pub host: Arc<FakeHost>,
}

impl FakeWorld {
    pub fn new(workspace: PathBuf) -> Self {
        Self::with_downstream_result(workspace, BuildResult::Success)
    }

    pub fn with_downstream_result(workspace: PathBuf, result: BuildResult) -> Self {
        Self {
            git: Arc::new(RecordingGit::default()),
            runner: Arc::new(RecordingRunner::default()),
            shell: Arc::new(ScriptedShell::default()),
            dispatcher: Arc::new(ScriptedDispatcher::returning(result)),
            artifacts: Arc::new(MemoryArtifacts::default()),
            messenger: Arc::new(RecordingMessenger::default()),
            nodes: Arc::new(StaticNodes::with(&[
                ("controller", &["linux"]),
                ("build-01", &["linux", "docker"]),
            ])),
            host: Arc::new(FakeHost::new(BTreeMap::new(), workspace)),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            git: self.git.clone(),
            runner: self.runner.clone(),
            shell: self.shell.clone(),
            dispatcher: self.dispatcher.clone(),
            artifacts: self.artifacts.clone(),
            messenger: self.messenger.clone(),
            nodes: self.nodes.clone(),
            host: self.host.clone(),
        }
    }
}
