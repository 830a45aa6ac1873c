//! Worker dependency installation
//!
//! Runs before the worker is spawned from a bundled runtime, so the
//! extension's requirements are present in that runtime.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use super::environment::WorkerEnvironment;
use super::executable::{ExecutableOrigin, ResolvedExecutable};
use crate::error::{BridgeError, Result};
use crate::requirements::{self, PackageInventory};

/// Everything an installer needs to know about the pending spawn
#[derive(Debug)]
pub struct InstallRequest<'a> {
    /// Executable about to be spawned
    pub executable: &'a ResolvedExecutable,
    /// Worker install directory
    pub install_dir: &'a Path,
    /// Extension directory whose requirements are installed
    pub extension_dir: &'a Path,
    /// Environment the installer runs with
    pub environment: &'a WorkerEnvironment,
}

impl InstallRequest<'_> {
    /// `<extension_dir>/requirements.txt`
    pub fn requirements_file(&self) -> PathBuf {
        self.extension_dir.join("requirements.txt")
    }
}

/// Prepares a worker runtime before spawn
#[async_trait]
pub trait DependencyInstaller: Send + Sync {
    async fn ensure_installed(&self, request: &InstallRequest<'_>) -> Result<()>;
}

/// Installs nothing
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopInstaller;

#[async_trait]
impl DependencyInstaller for NoopInstaller {
    async fn ensure_installed(&self, _request: &InstallRequest<'_>) -> Result<()> {
        Ok(())
    }
}

/// Installs missing requirements with the runtime's own `pip`
#[derive(Clone, Copy, Debug, Default)]
pub struct PipInstaller;

impl PipInstaller {
    fn command(request: &InstallRequest<'_>) -> Command {
        let mut cmd = Command::new(&request.executable.path);
        // Embedded runtimes must not pick up user site-packages.
        if request.executable.origin == ExecutableOrigin::Embedded {
            cmd.arg("-s");
        }
        cmd.args(["-m", "pip"])
            .current_dir(request.install_dir)
            .env_clear()
            .envs(request.environment.iter())
            .stdin(Stdio::null());
        cmd
    }

    async fn inventory(request: &InstallRequest<'_>) -> Option<PackageInventory> {
        let output = Self::command(request)
            .args(["list", "--format=json", "--disable-pip-version-check"])
            .stderr(Stdio::null())
            .output()
            .await;
        match output {
            Ok(out) if out.status.success() => match PackageInventory::from_pip_json(&out.stdout) {
                Ok(inventory) => Some(inventory),
                Err(e) => {
                    tracing::warn!(error = %e, "Unreadable package list, installing all requirements");
                    None
                }
            },
            Ok(out) => {
                tracing::warn!(status = %out.status, "Listing packages failed, installing all requirements");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not run pip, installing all requirements");
                None
            }
        }
    }

    async fn pip_install(request: &InstallRequest<'_>, args: &[String]) -> Result<()> {
        tracing::info!(packages = ?args, "Installing worker dependencies");
        let status = Self::command(request)
            .arg("install")
            .args(args)
            .status()
            .await
            .map_err(|e| BridgeError::DependencyInstall(format!("failed to run pip: {e}")))?;
        if status.success() {
            Ok(())
        } else {
            Err(BridgeError::DependencyInstall(format!(
                "pip install exited with {status}"
            )))
        }
    }
}

#[async_trait]
impl DependencyInstaller for PipInstaller {
    async fn ensure_installed(&self, request: &InstallRequest<'_>) -> Result<()> {
        let path = request.requirements_file();
        let required = match requirements::read_requirements(&path) {
            Ok(required) => required,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No requirements file, nothing to install");
                return Ok(());
            }
            Err(e) => {
                return Err(BridgeError::DependencyInstall(format!(
                    "cannot read {}: {e}",
                    path.display()
                )))
            }
        };
        if required.is_empty() {
            return Ok(());
        }

        let Some(inventory) = Self::inventory(request).await else {
            return Self::pip_install(request, &["-r".to_string(), path.display().to_string()])
                .await;
        };

        let missing: Vec<String> = requirements::missing_requirements(&required, &inventory)
            .into_iter()
            .map(ToString::to_string)
            .collect();
        if missing.is_empty() {
            tracing::debug!("Worker dependencies already satisfied");
            return Ok(());
        }
        Self::pip_install(request, &missing).await
    }
}
