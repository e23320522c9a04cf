//! Supervises a single worker invocation: reads the inline mount document,
//! extracts the function bundle, provisions its isolated environment, and
//! assembles the subprocess spec the binary entry point spawns.
//!
//! The actual `Command` construction, signal forwarding, and exit-code
//! propagation live in `main.rs` — this module only builds the
//! platform-independent plan, so it can be tested without spawning a real
//! child process.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use td_env::EnvironmentProvisioner;
use td_errors::WorkerError;
use td_protocol::FunctionBundle;

/// Folders the invoker was handed on the command line.
#[derive(Debug, Clone)]
pub struct InvokerArgs {
    pub request_folder: PathBuf,
    pub response_folder: PathBuf,
    pub output_folder: PathBuf,
    pub bin_folder: Option<PathBuf>,
    pub locks_folder: PathBuf,
    pub logs_folder: Option<PathBuf>,
    pub current_instance: Option<String>,
    pub work: PathBuf,
}

/// Everything needed to spawn the worker subprocess.
#[derive(Debug, Clone)]
pub struct ChildSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// Extracts the function bundle named by `bundle`, returning the directory
/// its contents now live in. Only `file://` bundle URIs are supported — the
/// bundle is always staged locally before extraction, regardless of where
/// the platform ultimately stores it.
pub fn extract_bundle(bundle: &FunctionBundle, bin_folder: Option<&Path>) -> Result<PathBuf, WorkerError> {
    let archive_path = td_uri::to_path(&bundle.uri)
        .map_err(|e| WorkerError::configuration("MalformedUri", e.to_string()))?;
    td_bundle::extract(&archive_path, bin_folder)
}

/// Derives the per-worker-pool namespace segment `provision_environment`
/// appends to the configured environments root, from the `--work` directory
/// the invoker was given. Two invokers pointed at different `--work`
/// directories never share a cached environment, even if their manifests are
/// identical, so one logical worker pool's environment churn can't stall or
/// corrupt another's cache.
pub fn work_namespace(work: &Path) -> String {
    work.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "default".to_owned())
}

/// Provisions (building only if necessary) the isolated environment this
/// bundle's requirements manifest maps to, then copies `self_exe` into it as
/// the worker binary. Rust has no per-function interpreter to rebuild, so
/// "provisioning" here is a content-addressed copy of the single worker
/// binary already installed on this host — the cache and lock semantics are
/// identical to the general case, just with a trivial build step.
pub async fn provision_environment(
    provisioner: &EnvironmentProvisioner,
    bundle_dir: &Path,
    platform: &str,
    worker_binary_relpath: &str,
    self_exe: &Path,
) -> Result<PathBuf, WorkerError> {
    let config = td_executor::FunctionConfig::load(bundle_dir)?;
    let manifest = config.requirements_manifest(bundle_dir)?;
    let self_exe = self_exe.to_path_buf();
    let relpath = worker_binary_relpath.to_owned();

    provisioner
        .provision(&manifest, platform, worker_binary_relpath, move |dir| {
            let self_exe = self_exe.clone();
            let relpath = relpath.clone();
            async move {
                let target = dir.join(&relpath);
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| WorkerError::environment("EnvBuildFailed", e.to_string()))?;
                }
                tokio::fs::copy(&self_exe, &target)
                    .await
                    .map_err(|e| WorkerError::environment("EnvBuildFailed", e.to_string()))?;
                Ok(())
            }
        })
        .await
}

/// Builds the child's environment: a minimal inherited set (just `PATH` and
/// `TD_LOG_CFG`, if present) plus every resolved `TDS_*` mount variable.
/// Everything else — in particular any `TD_*`/`PYTHONPATH`-equivalent
/// variable from the invoker's own environment — is deliberately left out so
/// the child starts from a clean slate.
pub fn build_child_env(resolved_mounts: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    if let Ok(path) = std::env::var("PATH") {
        env.insert("PATH".to_owned(), path);
    }
    if let Ok(log_cfg) = std::env::var("TD_LOG_CFG") {
        env.insert("TD_LOG_CFG".to_owned(), log_cfg);
    }
    env.extend(resolved_mounts.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

/// Which signal the supervisor forwards to the worker child. Named
/// independently of any OS signal type so the signal -> child-action mapping
/// is a pure function, testable without spawning a real process or receiving
/// a real signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardedSignal {
    Terminate,
    Interrupt,
}

#[cfg(unix)]
impl From<ForwardedSignal> for nix::sys::signal::Signal {
    fn from(sig: ForwardedSignal) -> Self {
        match sig {
            ForwardedSignal::Terminate => nix::sys::signal::Signal::SIGTERM,
            ForwardedSignal::Interrupt => nix::sys::signal::Signal::SIGINT,
        }
    }
}

/// Assembles the worker's CLI arguments from the invoker's own folders. The
/// bundle directory is forwarded explicitly — and always, regardless of
/// whether `--bin-folder` was given on the invoker's own command line —
/// since the worker has no other way to find where the bundle actually
/// landed when the invoker picked a fresh temp directory for it.
pub fn worker_args(args: &InvokerArgs, bundle_dir: &Path) -> Vec<String> {
    let mut out = vec![
        "--request-folder".to_owned(),
        args.request_folder.display().to_string(),
        "--response-folder".to_owned(),
        args.response_folder.display().to_string(),
        "--output-folder".to_owned(),
        args.output_folder.display().to_string(),
        "--bin-folder".to_owned(),
        bundle_dir.display().to_string(),
        "--work".to_owned(),
        args.work.display().to_string(),
    ];
    if let Some(logs) = &args.logs_folder {
        out.push("--logs-folder".to_owned());
        out.push(logs.display().to_string());
    }
    if let Some(instance) = &args.current_instance {
        out.push("--current-instance".to_owned());
        out.push(instance.clone());
    }
    out
}
