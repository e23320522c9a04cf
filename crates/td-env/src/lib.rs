//! Builds or reuses an isolated interpreter+packages environment from a
//! requirements manifest. Concurrent callers targeting the same manifest
//! coordinate through a file lock keyed by the environment's name so only
//! one of them builds; the environment is immutable once built.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use fs4::tokio::AsyncFileExt;
use sha2::{Digest, Sha256};
use td_errors::WorkerError;
use tokio::fs::OpenOptions;

const MANIFEST_MARKER: &str = ".td-manifest-sha256";
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(300);

/// Deterministic environment name derived from a requirements manifest and
/// the current platform tag. Two provisioners given the same manifest and
/// platform always agree on this name.
pub fn env_name(manifest: &str, platform: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(manifest.as_bytes());
    hasher.update(b"\0");
    hasher.update(platform.as_bytes());
    let digest = hasher.finalize();
    format!("td-env-{:x}", digest)
}

fn manifest_hash(manifest: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(manifest.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Coordinates building or reusing environments under `envs_root`, with
/// file locks for concurrent builders under `locks_root`.
pub struct EnvironmentProvisioner {
    envs_root: PathBuf,
    locks_root: PathBuf,
    lock_timeout: Duration,
}

impl EnvironmentProvisioner {
    pub fn new(envs_root: impl Into<PathBuf>, locks_root: impl Into<PathBuf>) -> Self {
        Self {
            envs_root: envs_root.into(),
            locks_root: locks_root.into(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Builds (if necessary) and returns the absolute path to the
    /// environment's binary. `build` receives the environment's directory
    /// and is responsible for populating it; it's only invoked once per
    /// manifest across all concurrent callers.
    pub async fn provision<F, Fut>(
        &self,
        manifest: &str,
        platform: &str,
        binary_relpath: &str,
        build: F,
    ) -> Result<PathBuf, WorkerError>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: std::future::Future<Output = Result<(), WorkerError>>,
    {
        let name = env_name(manifest, platform);
        let env_dir = self.envs_root.join(&name);
        let hash = manifest_hash(manifest);

        if let Some(path) = self.try_reuse(&env_dir, &hash, binary_relpath).await? {
            return Ok(path);
        }

        tokio::fs::create_dir_all(&self.locks_root)
            .await
            .map_err(|e| WorkerError::environment("EnvLockTimeout", e.to_string()))?;
        let lock_path = self.locks_root.join(format!("{name}.lock"));
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .await
            .map_err(|e| WorkerError::environment("EnvLockTimeout", e.to_string()))?;

        tokio::time::timeout(self.lock_timeout, lock_file.lock_exclusive())
            .await
            .map_err(|_| {
                WorkerError::environment(
                    "EnvLockTimeout",
                    format!("timed out waiting for the lock on environment {name}"),
                )
            })?
            .map_err(|e| WorkerError::environment("EnvLockTimeout", e.to_string()))?;

        // Re-check: another process may have built it while we waited.
        let result = if let Some(path) = self.try_reuse(&env_dir, &hash, binary_relpath).await? {
            Ok(path)
        } else {
            tokio::fs::create_dir_all(&env_dir)
                .await
                .map_err(|e| WorkerError::environment("EnvBuildFailed", e.to_string()))?;
            build(env_dir.clone()).await?;
            tokio::fs::write(env_dir.join(MANIFEST_MARKER), &hash)
                .await
                .map_err(|e| WorkerError::environment("EnvBuildFailed", e.to_string()))?;
            tracing::info!(env = %name, "built environment");
            Ok(env_dir.join(binary_relpath))
        };

        AsyncFileExt::unlock(&lock_file)
            .await
            .map_err(|e| WorkerError::environment("EnvLockTimeout", e.to_string()))?;

        result
    }

    async fn try_reuse(
        &self,
        env_dir: &Path,
        expected_hash: &str,
        binary_relpath: &str,
    ) -> Result<Option<PathBuf>, WorkerError> {
        let marker = env_dir.join(MANIFEST_MARKER);
        match tokio::fs::read_to_string(&marker).await {
            Ok(on_disk_hash) => {
                if on_disk_hash != expected_hash {
                    return Err(WorkerError::environment(
                        "EnvCorrupt",
                        format!(
                            "environment at {} has manifest hash {on_disk_hash} but expected {expected_hash}",
                            env_dir.display()
                        ),
                    ));
                }
                Ok(Some(env_dir.join(binary_relpath)))
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(WorkerError::environment("EnvCorrupt", e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    #[test]
    fn env_name_is_deterministic() {
        let a = env_name("numpy==1.2\n", "linux-x86_64");
        let b = env_name("numpy==1.2\n", "linux-x86_64");
        assert_eq!(a, b);
        let c = env_name("numpy==1.3\n", "linux-x86_64");
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn builds_once_and_reuses() {
        let tmp = tempfile::tempdir().unwrap();
        let provisioner =
            EnvironmentProvisioner::new(tmp.path().join("envs"), tmp.path().join("locks"));
        let build_count = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let build_count = build_count.clone();
            let path = provisioner
                .provision("req==1\n", "linux-x86_64", "bin/python", move |dir| {
                    let build_count = build_count.clone();
                    async move {
                        build_count.fetch_add(1, Ordering::SeqCst);
                        tokio::fs::create_dir_all(dir.join("bin")).await.unwrap();
                        tokio::fs::write(dir.join("bin/python"), b"#!/bin/sh\n")
                            .await
                            .unwrap();
                        Ok(())
                    }
                })
                .await
                .unwrap();
            assert!(path.ends_with("bin/python"));
        }
        assert_eq!(build_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn mismatched_manifest_hash_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let provisioner =
            EnvironmentProvisioner::new(tmp.path().join("envs"), tmp.path().join("locks"));
        let name = env_name("req==1\n", "linux-x86_64");
        let env_dir = tmp.path().join("envs").join(&name);
        tokio::fs::create_dir_all(&env_dir).await.unwrap();
        tokio::fs::write(env_dir.join(MANIFEST_MARKER), "deadbeef")
            .await
            .unwrap();

        let err = provisioner
            .provision("req==1\n", "linux-x86_64", "bin/python", |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert_eq!(err.short_msg, "EnvCorrupt");
    }
}
