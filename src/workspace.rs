//! Workspace Manager (C1): per-notebook directory, `package.json`
//! synthesis, dependency install/clear, and fingerprint metadata.

use crate::env::NotebookEnv;
use crate::output::{NotebookOutput, StreamName};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

/// Carries a preparation failure's message alongside any diagnostic lines
/// that were meant to be streamed to the cell's stderr before the run was
/// abandoned (spec §7: a failed install still reports `[env] Install
/// failed: ...` even though `ensureEnvironment` never returns a workspace).
#[derive(Debug)]
pub struct PrepareError {
    pub source: String,
    pub diagnostics: Vec<NotebookOutput>,
}

impl fmt::Display for PrepareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl std::error::Error for PrepareError {}

impl From<anyhow::Error> for PrepareError {
    fn from(err: anyhow::Error) -> Self {
        PrepareError {
            source: err.to_string(),
            diagnostics: Vec::new(),
        }
    }
}

const ENTRY_FILE: &str = "__runtime__.cjs";
const METADATA_FILE: &str = ".nodebooks-env.json";

/// On-disk layout for a single notebook's sandboxed dependency graph
/// (spec §6 "Workspace layout").
#[derive(Debug, Clone)]
pub struct Workspace {
    pub dir: PathBuf,
    pub package_json_path: PathBuf,
    pub entry_path: PathBuf,
    pub metadata_path: PathBuf,
    pub node_modules_path: PathBuf,
    pub lockfile_path: PathBuf,
}

impl Workspace {
    fn new(dir: PathBuf) -> Self {
        Workspace {
            package_json_path: dir.join("package.json"),
            entry_path: dir.join(ENTRY_FILE),
            metadata_path: dir.join(METADATA_FILE),
            node_modules_path: dir.join("node_modules"),
            lockfile_path: dir.join("package-lock.json"),
            dir,
        }
    }

    pub fn ui_package_dir(&self) -> PathBuf {
        self.node_modules_path.join("@nodebooks").join("ui")
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WorkspaceMetadata {
    #[serde(rename = "packagesKey")]
    packages_key: Option<String>,
}

/// Replaces any character outside `[A-Za-z0-9_-]` with `-` (spec §6).
pub fn sanitize_notebook_id(notebook_id: &str) -> String {
    notebook_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Injected so tests can supply a fake that never shells out.
pub trait DependencyInstaller: Send + Sync {
    fn install(&self, cwd: &Path, packages: &BTreeMap<String, String>) -> Result<()>;
}

/// Default installer: `npm install --no-audit --no-fund` in the workspace
/// directory, with the update notifier disabled.
pub struct NpmInstaller;

impl DependencyInstaller for NpmInstaller {
    fn install(&self, cwd: &Path, _packages: &BTreeMap<String, String>) -> Result<()> {
        let status = Command::new("npm")
            .args(["install", "--no-audit", "--no-fund"])
            .env("npm_config_update_notifier", "false")
            .current_dir(cwd)
            .status()
            .with_context(|| "Failed to spawn npm".to_string())?;

        if !status.success() {
            anyhow::bail!(
                "npm install exited with status {}",
                status.code().unwrap_or(-1)
            );
        }

        Ok(())
    }
}

pub struct WorkspaceManager {
    root: PathBuf,
    installer: Arc<dyn DependencyInstaller>,
    /// Serializes `ensure_environment` calls so concurrent cell runs don't
    /// race over the same on-disk workspace (spec §4.1).
    queue: Mutex<()>,
}

impl WorkspaceManager {
    pub fn new(root: PathBuf, installer: Arc<dyn DependencyInstaller>) -> Self {
        WorkspaceManager {
            root,
            installer,
            queue: Mutex::new(()),
        }
    }

    pub fn workspace_for(&self, notebook_id: &str) -> Workspace {
        let dir = self.root.join(sanitize_notebook_id(notebook_id));
        Workspace::new(dir)
    }

    /// Idempotently prepares the notebook's workspace so that it reflects
    /// `env.packages`. Returns the resulting `Workspace` and, when the
    /// installer was invoked, any diagnostic lines meant to be streamed to
    /// the cell's stderr.
    pub fn ensure_environment(
        &self,
        notebook_id: &str,
        env: &NotebookEnv,
    ) -> Result<(Workspace, Vec<NotebookOutput>), PrepareError> {
        let _guard = self.queue.lock().unwrap();

        let workspace = self.workspace_for(notebook_id);
        let fingerprint = env.packages_fingerprint();
        let diagnostics = Vec::new();

        fs::create_dir_all(&workspace.dir)
            .with_context(|| format!("Failed to create workspace at {:?}", workspace.dir))?;

        write_package_json(&workspace, env)?;
        ensure_entry_stub(&workspace)?;

        if env.packages.is_empty() {
            clear_dependencies(&workspace)?;
            write_metadata(&workspace, &fingerprint)?;
            write_ui_package(&workspace)?;
            return Ok((workspace, diagnostics));
        }

        let metadata = read_metadata(&workspace);
        let needs_install =
            metadata.packages_key.as_deref() != Some(fingerprint.as_str())
                || !workspace.node_modules_path.is_dir();

        if needs_install {
            if let Err(err) = self.installer.install(&workspace.dir, &env.packages) {
                // Leave the metadata fingerprint untouched so the next
                // attempt retries the install.
                return Err(PrepareError {
                    source: err.to_string(),
                    diagnostics: vec![NotebookOutput::stream(
                        StreamName::Stderr,
                        format!("[env] Install failed: {err}\n"),
                    )],
                });
            }
        }

        write_metadata(&workspace, &fingerprint)?;
        write_ui_package(&workspace)?;

        Ok((workspace, diagnostics))
    }
}

fn write_package_json(workspace: &Workspace, env: &NotebookEnv) -> Result<()> {
    let name = format!(
        "notebook-{}",
        sanitize_notebook_id(
            workspace
                .dir
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("unknown")
        )
    );

    let manifest = serde_json::json!({
        "name": name,
        "private": true,
        "version": "0.0.0",
        "type": "commonjs",
        "dependencies": env.packages,
    });

    fs::write(
        &workspace.package_json_path,
        serde_json::to_string_pretty(&manifest)? + "\n",
    )
    .with_context(|| format!("Failed to write {:?}", workspace.package_json_path))
}

fn ensure_entry_stub(workspace: &Workspace) -> Result<()> {
    if !workspace.entry_path.is_file() {
        fs::write(&workspace.entry_path, "module.exports = {}\n")
            .with_context(|| format!("Failed to write {:?}", workspace.entry_path))?;
    }
    Ok(())
}

fn clear_dependencies(workspace: &Workspace) -> Result<()> {
    if workspace.node_modules_path.is_dir() {
        fs::remove_dir_all(&workspace.node_modules_path)?;
    }
    if workspace.lockfile_path.is_file() {
        fs::remove_file(&workspace.lockfile_path)?;
    }
    Ok(())
}

fn read_metadata(workspace: &Workspace) -> WorkspaceMetadata {
    fs::read_to_string(&workspace.metadata_path)
        .ok()
        .and_then(|content| serde_json::from_str(&content).ok())
        .unwrap_or_default()
}

fn write_metadata(workspace: &Workspace, fingerprint: &str) -> Result<()> {
    let metadata = WorkspaceMetadata {
        packages_key: Some(fingerprint.to_string()),
    };
    fs::write(&workspace.metadata_path, serde_json::to_string(&metadata)?)
        .with_context(|| format!("Failed to write {:?}", workspace.metadata_path))
}

/// `@nodebooks/ui`'s on-disk shape: rewritten on every successful
/// preparation so a corrupted or manually-removed copy self-heals.
fn write_ui_package(workspace: &Workspace) -> Result<()> {
    let pkg_dir = workspace.ui_package_dir();
    fs::create_dir_all(&pkg_dir)?;

    let manifest = serde_json::json!({
        "name": "@nodebooks/ui",
        "version": "0.0.0",
        "private": true,
        "main": "index.js",
        "types": "index.d.ts",
    });

    fs::write(
        pkg_dir.join("package.json"),
        serde_json::to_string_pretty(&manifest)?,
    )?;
    fs::write(pkg_dir.join("index.js"), crate::interceptor::UI_PACKAGE_JS)?;
    fs::write(pkg_dir.join("index.d.ts"), crate::interceptor::UI_PACKAGE_DTS)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    struct NeverInstall;

    impl DependencyInstaller for NeverInstall {
        fn install(&self, _cwd: &Path, _packages: &BTreeMap<String, String>) -> Result<()> {
            Ok(())
        }
    }

    struct FailingInstall;

    impl DependencyInstaller for FailingInstall {
        fn install(&self, _cwd: &Path, _packages: &BTreeMap<String, String>) -> Result<()> {
            anyhow::bail!("boom")
        }
    }

    #[test]
    fn sanitizes_notebook_ids() {
        assert_eq!(sanitize_notebook_id("nb/../1 2"), "nb---1-2");
        assert_eq!(sanitize_notebook_id("abc_123-ok"), "abc_123-ok");
    }

    #[test]
    fn empty_packages_skip_install_and_write_ui_package() {
        let root = tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path().to_path_buf(), Arc::new(NeverInstall));
        let env = NotebookEnv::default();

        let (workspace, diagnostics) = manager.ensure_environment("nb-1", &env).unwrap();

        assert!(diagnostics.is_empty());
        assert!(!workspace.node_modules_path.is_dir() || {
            // node_modules may still exist from the @nodebooks/ui package only.
            workspace.ui_package_dir().is_dir()
        });
        assert!(workspace.ui_package_dir().join("index.js").is_file());
        assert!(workspace.package_json_path.is_file());

        let metadata = read_metadata(&workspace);
        assert_eq!(metadata.packages_key.as_deref(), Some(env.packages_fingerprint().as_str()));
    }

    #[test]
    fn failed_install_leaves_fingerprint_untouched() {
        let root = tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path().to_path_buf(), Arc::new(FailingInstall));
        let env = NotebookEnv::new(vec![("left-pad".to_string(), "1.0.0".to_string())], vec![]);

        let result = manager.ensure_environment("nb-2", &env);
        assert!(result.is_err());

        let workspace = manager.workspace_for("nb-2");
        let metadata = read_metadata(&workspace);
        assert_eq!(metadata.packages_key, None);
    }

    #[test]
    fn package_json_reflects_canonical_packages() {
        use assert_fs::prelude::PathChild;

        let root = assert_fs::TempDir::new().unwrap();
        let manager = WorkspaceManager::new(root.path().to_path_buf(), Arc::new(NeverInstall));
        let env = NotebookEnv::new(vec![("lodash".to_string(), "latest".to_string())], vec![]);

        // Installer never actually populates node_modules, so force the
        // "no install needed" path by pre-creating it.
        let workspace = manager.workspace_for("nb-3");
        fs::create_dir_all(&workspace.node_modules_path).unwrap();

        manager.ensure_environment("nb-3", &env).unwrap();
        let package_json = root.child("nb-3").child("package.json");
        let contents = fs::read_to_string(package_json.path()).unwrap();
        assert!(contents.contains("lodash"));
        assert!(contents.contains("\"type\": \"commonjs\""));
    }
}
