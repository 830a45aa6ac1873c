//! Launching the host binary against stand-in worker executables

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::{Duration, Instant};

use tokio::process::Command;

/// Well above how long a failing launch should take
const CALL_TIMEOUT_MS: &str = "30000";

struct Layout {
    _root: tempfile::TempDir,
    bin_dir: PathBuf,
    install_dir: PathBuf,
    extension_dir: PathBuf,
    ipc_dir: PathBuf,
}

impl Layout {
    /// A copy of the host binary in a directory of its own
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let bin_dir = root.path().join("bin");
        let install_dir = root.path().join("engine");
        let extension_dir = root.path().join("ext");
        let ipc_dir = root.path().join("ipc");
        for dir in [&bin_dir, &install_dir, &extension_dir, &ipc_dir] {
            std::fs::create_dir_all(dir).unwrap();
        }
        std::fs::copy(env!("CARGO_BIN_EXE_bridge-host"), bin_dir.join("bridge-host")).unwrap();
        Self {
            _root: root,
            bin_dir,
            install_dir,
            extension_dir,
            ipc_dir,
        }
    }

    fn add_worker_script(&self, body: &str) {
        let path = self.bin_dir.join("bridge-worker");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    async fn invoke(&self, identifier: &str) -> (Output, Duration) {
        let mut command = Command::new(self.bin_dir.join("bridge-host"));
        command
            .arg("--config")
            .arg(self.bin_dir.join("absent.toml"))
            .arg("--install-dir")
            .arg(&self.install_dir)
            .arg("--extension-dir")
            .arg(&self.extension_dir)
            .arg("--ipc-dir")
            .arg(&self.ipc_dir)
            .args(["--transport", "file", "--invoke", identifier])
            .env_remove("BRIDGE_ENABLED")
            .env("BRIDGE_CALL_TIMEOUT", CALL_TIMEOUT_MS)
            .kill_on_drop(true);

        let started = Instant::now();
        let output = tokio::time::timeout(Duration::from_secs(20), command.output())
            .await
            .expect("host did not finish")
            .unwrap();
        (output, started.elapsed())
    }
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn marker(dir: &Path) -> PathBuf {
    dir.join("spawned")
}

#[tokio::test]
async fn test_host_without_worker_binary_fails_to_spawn() {
    let layout = Layout::new();

    let (output, elapsed) = layout.invoke("worker.ping").await;

    assert!(!output.status.success());
    assert!(elapsed < Duration::from_secs(10), "took {elapsed:?}");
    let stderr = stderr(&output);
    assert!(
        stderr.contains(&layout.bin_dir.join("bridge-worker").display().to_string()),
        "{stderr}"
    );
}

#[tokio::test]
async fn test_host_spawns_sibling_worker_and_notices_its_exit() {
    let layout = Layout::new();
    layout.add_worker_script("touch \"$BRIDGE_EXTENSION_DIR/spawned\"\nexit 7");

    let (output, elapsed) = layout.invoke("worker.ping").await;

    assert!(marker(&layout.extension_dir).exists());
    assert!(!output.status.success());
    assert!(elapsed < Duration::from_secs(10), "took {elapsed:?}");
    let stderr = stderr(&output);
    assert!(stderr.contains("Worker exited"), "{stderr}");
    assert!(stderr.contains('7'), "{stderr}");
}
