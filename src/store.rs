//! Workspace-backed artifact store for local runs. Stashes live under
//! `.pipeline-stash/<name>` inside the workspace; published artifacts are
//! copied into `build-artifacts/`.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use glob::Pattern;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::collab::{ArtifactStore, CopySpec, PublishSpec, StashSpec};

const STASH_DIR: &str = ".pipeline-stash";
const ARTIFACTS_DIR: &str = "build-artifacts";

pub struct WorkspaceArtifacts {
    workspace: PathBuf,
}

impl WorkspaceArtifacts {
    pub fn new(workspace: PathBuf) -> Self {
        Self { workspace }
    }

    /// Workspace-relative files matching `includes` minus `excludes`.
    fn collect(
        &self,
        includes: &str,
        excludes: Option<&str>,
        default_excludes: bool,
    ) -> Result<Vec<PathBuf>> {
        let exclude = excludes
            .map(Pattern::new)
            .transpose()
            .context("Invalid excludes pattern")?;
        let absolute = self.workspace.join(includes);
        let mut files = Vec::new();
        for entry in glob::glob(&absolute.to_string_lossy())
            .with_context(|| format!("Invalid glob pattern: {includes}"))?
        {
            let path = entry?;
            if !path.is_file() {
                continue;
            }
            let relative = path
                .strip_prefix(&self.workspace)
                .unwrap_or(&path)
                .to_path_buf();
            if default_excludes
                && relative
                    .components()
                    .any(|c| c.as_os_str() == ".git" || c.as_os_str() == STASH_DIR)
            {
                continue;
            }
            if let Some(exclude) = &exclude
                && exclude.matches_path(&relative)
            {
                continue;
            }
            files.push(relative);
        }
        Ok(files)
    }

    fn copy_into(&self, relative: &Path, target_root: &Path) -> Result<()> {
        let source = self.workspace.join(relative);
        let target = target_root.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        std::fs::copy(&source, &target)
            .with_context(|| format!("Failed to copy {}", source.display()))?;
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for WorkspaceArtifacts {
    async fn stash(&self, name: &str, spec: &StashSpec) -> Result<()> {
        let includes = spec.includes.as_deref().unwrap_or("**/*");
        let files = self.collect(includes, spec.excludes.as_deref(), spec.default_excludes)?;
        if files.is_empty() && !spec.allow_empty {
            bail!("Stash '{name}' matched no files for pattern '{includes}'");
        }
        let root = self.workspace.join(STASH_DIR).join(name);
        for file in &files {
            self.copy_into(file, &root)?;
        }
        info!(stash = name, files = files.len(), "Stashed files");
        Ok(())
    }

    async fn unstash(&self, name: &str) -> Result<()> {
        let root = self.workspace.join(STASH_DIR).join(name);
        if !root.is_dir() {
            bail!("No stash named '{name}'");
        }
        let mut restored = 0usize;
        let mut pending = vec![root.clone()];
        while let Some(dir) = pending.pop() {
            for entry in std::fs::read_dir(&dir)
                .with_context(|| format!("Failed to read stash: {}", dir.display()))?
            {
                let path = entry?.path();
                if path.is_dir() {
                    pending.push(path);
                    continue;
                }
                let relative = path.strip_prefix(&root).unwrap_or(&path);
                let target = self.workspace.join(relative);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(&path, &target)?;
                restored += 1;
            }
        }
        info!(stash = name, files = restored, "Restored stash");
        Ok(())
    }

    async fn publish(&self, spec: &PublishSpec) -> Result<()> {
        let files = self.collect(&spec.artifacts, spec.excludes.as_deref(), true)?;
        if files.is_empty() && !spec.allow_empty {
            bail!("No artifacts matched pattern '{}'", spec.artifacts);
        }
        let root = self.workspace.join(ARTIFACTS_DIR);
        for file in &files {
            self.copy_into(file, &root)?;
            if spec.fingerprint {
                let digest = compute_sha256(&self.workspace.join(file))?;
                info!(artifact = %file.display(), digest, "Fingerprinted artifact");
            }
        }
        info!(files = files.len(), "Published artifacts");
        Ok(())
    }

    async fn copy(&self, project: &str, build_number: u64, _spec: &CopySpec) -> Result<()> {
        bail!(
            "Copying artifacts from {project} #{build_number} requires a CI artifact service"
        );
    }
}

/// SHA256 digest of the file at `path`, as a hex string.
pub fn compute_sha256(path: &Path) -> Result<String> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open file for hashing: {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn write(workspace: &Path, relative: &str, content: &str) {
        let path = workspace.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut file = File::create(path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn stash_then_unstash_round_trips() {
        let temp = tempdir().unwrap();
        write(temp.path(), "logs/build.log", "log line");
        write(temp.path(), "logs/other.txt", "other");

        let store = WorkspaceArtifacts::new(temp.path().to_path_buf());
        let spec = StashSpec {
            includes: Some("logs/*.log".to_string()),
            default_excludes: true,
            ..StashSpec::default()
        };
        store.stash("logs", &spec).await.unwrap();

        std::fs::remove_file(temp.path().join("logs/build.log")).unwrap();
        store.unstash("logs").await.unwrap();
        assert!(temp.path().join("logs/build.log").is_file());
    }

    #[tokio::test]
    async fn empty_stash_fails_unless_allowed() {
        let temp = tempdir().unwrap();
        let store = WorkspaceArtifacts::new(temp.path().to_path_buf());

        let strict = StashSpec {
            includes: Some("*.missing".to_string()),
            ..StashSpec::default()
        };
        assert!(store.stash("s", &strict).await.is_err());

        let relaxed = StashSpec {
            includes: Some("*.missing".to_string()),
            allow_empty: true,
            ..StashSpec::default()
        };
        store.stash("s", &relaxed).await.unwrap();
    }

    #[tokio::test]
    async fn publish_copies_matches_and_honors_excludes() {
        let temp = tempdir().unwrap();
        write(temp.path(), "out/a.log", "a");
        write(temp.path(), "out/b.log", "b");

        let store = WorkspaceArtifacts::new(temp.path().to_path_buf());
        let spec = PublishSpec {
            artifacts: "out/*.log".to_string(),
            excludes: Some("out/b.log".to_string()),
            fingerprint: true,
            ..PublishSpec::default()
        };
        store.publish(&spec).await.unwrap();

        assert!(temp.path().join("build-artifacts/out/a.log").is_file());
        assert!(!temp.path().join("build-artifacts/out/b.log").exists());
    }

    #[test]
    fn compute_sha256_is_stable() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("digest.bin");
        std::fs::write(&path, b"pipeline").unwrap();
        let digest = compute_sha256(&path).unwrap();
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, compute_sha256(&path).unwrap());
    }
}
