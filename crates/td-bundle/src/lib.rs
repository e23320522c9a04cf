//! Fetches, decompresses, and safely extracts `tar.gz` function bundles.
//!
//! Extraction defaults to a *safe-data* policy that rejects symlinks,
//! absolute paths, path traversal, and device/special entries. A permissive
//! policy exists only for test harnesses and is selected solely via the
//! `TD_SYMLINK_POLARS_LIBS_PYTEST` environment variable — there is no
//! programmatic way to opt into it from production code.

use std::{
    fs::File,
    path::{Path, PathBuf},
};

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use td_errors::WorkerError;

const PERMISSIVE_TOGGLE_ENV: &str = "TD_SYMLINK_POLARS_LIBS_PYTEST";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionPolicy {
    /// Reject symlinks, hardlinks, absolute paths, traversal, and
    /// device/special entries.
    SafeData,
    /// Accept anything the `tar` crate will parse. Only ever selected via
    /// [`PERMISSIVE_TOGGLE_ENV`].
    Permissive,
}

impl ExtractionPolicy {
    /// The policy this process should use: permissive only when the
    /// test-only environment toggle is set, safe-data otherwise.
    pub fn from_env() -> Self {
        match std::env::var(PERMISSIVE_TOGGLE_ENV) {
            Ok(v) if v == "1" || v.eq_ignore_ascii_case("true") => Self::Permissive,
            _ => Self::SafeData,
        }
    }
}

/// Extracts the gzip-compressed tar bundle at `bundle_path` into
/// `destination` (a caller-provided bin folder) or, if `None`, a freshly
/// created folder under the platform temp directory. Returns the folder the
/// bundle's contents now live in.
pub fn extract(bundle_path: &Path, destination: Option<&Path>) -> Result<PathBuf, WorkerError> {
    extract_with_policy(bundle_path, destination, ExtractionPolicy::from_env())
}

pub fn extract_with_policy(
    bundle_path: &Path,
    destination: Option<&Path>,
    policy: ExtractionPolicy,
) -> Result<PathBuf, WorkerError> {
    let dest = match destination {
        Some(d) => {
            std::fs::create_dir_all(d).map_err(|e| {
                WorkerError::io("BundleDestinationUnwritable", e.to_string())
            })?;
            d.to_path_buf()
        },
        None => tempfile::Builder::new()
            .prefix("td-bundle-")
            .tempdir()
            .map_err(|e| WorkerError::io("BundleTempDirFailed", e.to_string()))?
            .keep(),
    };

    let file = File::open(bundle_path).map_err(|e| {
        WorkerError::bundle(
            "BundleNotFound",
            format!("could not open bundle at {}: {e}", bundle_path.display()),
        )
    })?;
    let gz = GzDecoder::new(file);
    let mut archive = Archive::new(gz);

    let entries = archive.entries().map_err(|e| {
        WorkerError::bundle("BundleCorrupt", format!("bundle is not a valid tar: {e}"))
    })?;

    for entry in entries {
        let mut entry = entry.map_err(|e| {
            WorkerError::bundle("BundleCorrupt", format!("corrupt tar entry: {e}"))
        })?;
        let path = entry
            .path()
            .map_err(|e| WorkerError::bundle("BundleCorrupt", e.to_string()))?
            .into_owned();

        if policy == ExtractionPolicy::SafeData {
            validate_safe_entry(&path, entry.header().entry_type())?;
        }

        let target = dest.join(&path);
        entry.unpack(&target).map_err(|e| {
            WorkerError::io(
                "BundleExtractFailed",
                format!("failed writing {}: {e}", target.display()),
            )
        })?;
    }

    tracing::info!(bundle = %bundle_path.display(), dest = %dest.display(), "extracted function bundle");
    Ok(dest)
}

fn validate_safe_entry(path: &Path, entry_type: EntryType) -> Result<(), WorkerError> {
    if path.is_absolute() {
        return Err(WorkerError::bundle(
            "BundleUnsafe",
            format!("entry {} has an absolute path", path.display()),
        ));
    }
    if path
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(WorkerError::bundle(
            "BundleUnsafe",
            format!("entry {} attempts path traversal", path.display()),
        ));
    }
    match entry_type {
        EntryType::Regular | EntryType::Directory | EntryType::GNUSparse => Ok(()),
        EntryType::Symlink | EntryType::Link => Err(WorkerError::bundle(
            "BundleUnsafe",
            format!("entry {} is a symlink or hard link", path.display()),
        )),
        other => Err(WorkerError::bundle(
            "BundleUnsafe",
            format!("entry {} has disallowed type {other:?}", path.display()),
        )),
    }
}
