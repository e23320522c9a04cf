//! Periodic retention-based cleanup of aged message/cast folders.
//!
//! One tick enumerates completed message files, decodes their embedded
//! timestamp via the identifier clock, and deletes anything older than the
//! retention window along with its sibling per-attempt workspaces. The loop
//! itself is driven by a [`td_runtime::Runtime`] so it can be exercised
//! against a virtual clock in tests instead of racing the wall clock.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use td_errors::WorkerError;
use td_runtime::Runtime;

pub const MESSAGES_DIR: &str = "msg/complete";
pub const CAST_DIR: &str = "proc/ephemeral/function/work/cast";

#[derive(Debug, Clone)]
pub struct JanitorConfig {
    pub instance_root: PathBuf,
    pub frequency: Duration,
    pub retention: Duration,
    pub per_run_limit: usize,
}

/// One completed message file: its stem's identifier, cast index, and path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct MessageFile {
    id26: String,
    n: u32,
    path_suffix: String,
}

fn parse_stem(stem: &str) -> Option<(String, u32)> {
    let (id26, n) = stem.rsplit_once('_')?;
    let n: u32 = n.parse().ok()?;
    Some((id26.to_owned(), n))
}

async fn list_messages(instance_root: &Path) -> Result<Vec<MessageFile>, WorkerError> {
    let dir = instance_root.join(MESSAGES_DIR);
    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(WorkerError::io("IoFailed", format!("{}: {e}", dir.display()))),
    };

    let mut messages = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| WorkerError::io("IoFailed", e.to_string()))?
    {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Some((id26, n)) = parse_stem(stem) else {
            tracing::warn!(file = %path.display(), "skipping message file with an unrecognized name");
            continue;
        };
        messages.push(MessageFile {
            id26,
            n,
            path_suffix: stem.to_owned(),
        });
    }
    messages.sort();
    Ok(messages)
}

async fn remove_dir_missing_ok(path: &Path) -> Result<(), WorkerError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) | Err(_) if !path.exists() => Ok(()),
        Err(e) => Err(WorkerError::io("IoFailed", format!("{}: {e}", path.display()))),
    }
}

async fn remove_file_missing_ok(path: &Path) -> Result<(), WorkerError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) | Err(_) if !path.exists() => Ok(()),
        Err(e) => Err(WorkerError::io("IoFailed", format!("{}: {e}", path.display()))),
    }
}

/// Runs a single tick. Returns the number of message files deleted (bounded
/// by `per_run_limit`). Per-file failures are logged and skipped rather than
/// aborting the tick.
pub async fn tick(config: &JanitorConfig, runtime: &impl Runtime) -> Result<usize, WorkerError> {
    let now = runtime.unix_timestamp_millis();
    let messages = list_messages(&config.instance_root).await?;
    let retention_ms = config.retention.as_millis() as u64;

    let mut deleted = 0usize;
    for message in &messages {
        if deleted >= config.per_run_limit {
            break;
        }
        let id = match td_id::Id::decode(&message.id26) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(id = %message.id26, error = %e, "skipping message with an unparseable identifier");
                continue;
            },
        };
        let age = now.saturating_sub(id.millis());
        if age <= retention_ms {
            continue;
        }

        let mut ok = true;
        for m in 0..=message.n {
            let cast_dir = config
                .instance_root
                .join(CAST_DIR)
                .join(format!("{}_{m}", message.id26));
            if let Err(e) = remove_dir_missing_ok(&cast_dir).await {
                tracing::warn!(dir = %cast_dir.display(), error = %e, "failed to remove cast folder, skipping this message");
                ok = false;
                break;
            }
        }
        if !ok {
            continue;
        }

        let message_path = config
            .instance_root
            .join(MESSAGES_DIR)
            .join(format!("{}.yaml", message.path_suffix));
        if let Err(e) = remove_file_missing_ok(&message_path).await {
            tracing::warn!(file = %message_path.display(), error = %e, "failed to remove message file");
            continue;
        }

        deleted += 1;
    }
    Ok(deleted)
}

/// Runs ticks on `config.frequency` until `stop` fires, honored both between
/// iterations and while sleeping.
pub async fn run(
    config: JanitorConfig,
    runtime: impl Runtime,
    mut stop: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        if *stop.borrow() {
            return;
        }
        match tick(&config, &runtime).await {
            Ok(deleted) if deleted > 0 => tracing::info!(deleted, "janitor tick removed aged artifacts"),
            Ok(_) => {},
            Err(e) => tracing::warn!(error = %e, "janitor tick failed"),
        }

        tokio::select! {
            _ = runtime.wait(config.frequency) => {},
            _ = stop.changed() => {
                if *stop.borrow() {
                    return;
                }
            },
        }
    }
}
