//! Worker executable discovery
//!
//! Preference order: a virtual environment inside the install directory,
//! then an embedded runtime next to it, then the host's fallback. The
//! default fallback is the `bridge-worker` binary installed next to the
//! running executable.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Where the resolved executable came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutableOrigin {
    /// `<install>/<venv>/bin/<name>`
    VirtualEnv,
    /// `<install>/../<embedded>/<name>`
    Embedded,
    /// The host's own fallback executable
    Fallback,
}

/// Stem of the worker binary built by this crate
pub const WORKER_BINARY: &str = "bridge-worker";

/// Executable chosen for the worker
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedExecutable {
    /// Path handed to the spawn
    pub path: PathBuf,
    /// Which candidate it is
    pub origin: ExecutableOrigin,
}

/// `bridge-worker` next to the running executable
///
/// A host never falls back to its own binary: it has no worker mode and
/// would spawn copies of itself. When the running executable cannot be
/// determined, the bare name is returned and resolved through `PATH`.
#[must_use]
pub fn default_worker_executable() -> PathBuf {
    let name = format!("{WORKER_BINARY}{}", std::env::consts::EXE_SUFFIX);
    match std::env::current_exe() {
        Ok(exe) => exe.with_file_name(name),
        Err(e) => {
            tracing::debug!(error = %e, "Cannot locate the running executable");
            PathBuf::from(name)
        }
    }
}

/// Directory layout searched for a worker runtime
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeLayout {
    /// Virtual environment directory inside the install directory
    pub venv_dir: String,
    /// Embedded runtime directory next to the install directory
    pub embedded_dir: String,
    /// Executable stem (`.exe` is appended on Windows)
    pub executable: String,
}

impl Default for RuntimeLayout {
    fn default() -> Self {
        Self {
            venv_dir: "venv".into(),
            embedded_dir: "python_embeded".into(),
            executable: "python".into(),
        }
    }
}

impl RuntimeLayout {
    fn executable_file_name(&self) -> String {
        if cfg!(windows) {
            format!("{}.exe", self.executable)
        } else {
            self.executable.clone()
        }
    }

    /// Candidate paths in preference order
    pub fn candidates(&self, install_dir: &Path) -> Vec<(PathBuf, ExecutableOrigin)> {
        let exe = self.executable_file_name();
        let scripts = if cfg!(windows) { "Scripts" } else { "bin" };

        let mut candidates = vec![(
            install_dir.join(&self.venv_dir).join(scripts).join(&exe),
            ExecutableOrigin::VirtualEnv,
        )];
        if let Some(parent) = install_dir.parent() {
            candidates.push((
                parent.join(&self.embedded_dir).join(&exe),
                ExecutableOrigin::Embedded,
            ));
        }
        candidates
    }
}

/// Pick the first existing candidate, else `fallback`
pub fn resolve_worker_executable(
    install_dir: &Path,
    layout: &RuntimeLayout,
    fallback: &Path,
) -> ResolvedExecutable {
    for (path, origin) in layout.candidates(install_dir) {
        if path.is_file() {
            tracing::debug!(path = %path.display(), ?origin, "Using worker runtime");
            return ResolvedExecutable { path, origin };
        }
    }
    tracing::debug!(path = %fallback.display(), "No bundled runtime found, using fallback executable");
    ResolvedExecutable {
        path: fallback.to_path_buf(),
        origin: ExecutableOrigin::Fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"").unwrap();
    }

    #[test]
    fn test_default_fallback_is_sibling_worker_binary() {
        let fallback = default_worker_executable();
        let current = std::env::current_exe().unwrap();

        assert_ne!(fallback, current);
        assert_eq!(fallback.parent(), current.parent());
        assert_eq!(
            fallback.file_stem().and_then(|s| s.to_str()),
            Some(WORKER_BINARY)
        );
    }

    #[test]
    fn test_prefers_venv_over_embedded() {
        let root = tempfile::tempdir().unwrap();
        let install = root.path().join("engine");
        let layout = RuntimeLayout::default();
        let candidates = layout.candidates(&install);
        for (path, _) in &candidates {
            touch(path);
        }

        let resolved = resolve_worker_executable(&install, &layout, Path::new("/usr/bin/host"));
        assert_eq!(resolved.origin, ExecutableOrigin::VirtualEnv);
        assert_eq!(resolved.path, candidates[0].0);
    }

    #[test]
    fn test_embedded_runtime_next_to_install() {
        let root = tempfile::tempdir().unwrap();
        let install = root.path().join("engine");
        let layout = RuntimeLayout::default();
        let embedded = &layout.candidates(&install)[1].0;
        touch(embedded);

        let resolved = resolve_worker_executable(&install, &layout, Path::new("/usr/bin/host"));
        assert_eq!(resolved.origin, ExecutableOrigin::Embedded);
        assert!(resolved.path.starts_with(root.path().join("python_embeded")));
    }

    #[test]
    fn test_falls_back_to_host_executable() {
        let root = tempfile::tempdir().unwrap();
        let resolved = resolve_worker_executable(
            &root.path().join("engine"),
            &RuntimeLayout::default(),
            Path::new("/usr/bin/host"),
        );
        assert_eq!(resolved.origin, ExecutableOrigin::Fallback);
        assert_eq!(resolved.path, PathBuf::from("/usr/bin/host"));
    }

    #[cfg(unix)]
    #[test]
    fn test_venv_layout_on_unix() {
        let candidates = RuntimeLayout::default().candidates(Path::new("/opt/engine"));
        assert_eq!(candidates[0].0, PathBuf::from("/opt/engine/venv/bin/python"));
        assert_eq!(candidates[1].0, PathBuf::from("/opt/python_embeded/python"));
    }
}
