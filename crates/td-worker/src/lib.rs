//! Wires the request/response codec, mount resolution, lazy table I/O, the
//! system-column engine, and the function executor into the single binary
//! the invoker spawns to run one function.
//!
//! The bundle's entrypoint is treated as an opaque subprocess: inputs are
//! sunk to parquet files under a working directory, the entrypoint is run
//! once, and its declared outputs are scanned back. This mirrors the
//! teacher's node-executor pattern of marshalling a user computation across
//! a process boundary through the filesystem rather than an in-process call.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use async_trait::async_trait;
use serde::Deserialize;
use td_errors::WorkerError;
use td_executor::{RawResult, ResolvedInput, UserFunction};
use td_tableio::LazyTable;

pub const OFFSET_FILENAME: &str = "offset.json";
pub const NEXT_OFFSET_FILENAME: &str = "next_offset.json";
pub const OUTPUT_MANIFEST_FILENAME: &str = "output_manifest.json";
pub const EXCEPTION_FILENAME: &str = "exception.json";

/// What the subprocess entrypoint writes to `exception.json` on a user-code
/// failure, distinct from the platform's own `exception.yaml` — this one
/// only carries the parts the worker needs to build a `WorkerError::user`.
#[derive(Debug, Deserialize)]
struct SubprocessException {
    message: String,
    error_code: Option<String>,
}

/// Drives the bundle's entrypoint executable as a subprocess, marshalling
/// inputs and outputs as parquet files under a scratch working directory.
pub struct SubprocessUserFunction {
    entrypoint: PathBuf,
    working_dir: PathBuf,
    output_count: usize,
    next_offset: Mutex<Option<serde_json::Value>>,
}

impl SubprocessUserFunction {
    pub fn new(entrypoint: PathBuf, working_dir: PathBuf, output_count: usize) -> Self {
        Self {
            entrypoint,
            working_dir,
            output_count,
            next_offset: Mutex::new(None),
        }
    }

    async fn write_inputs(&self, inputs: &[ResolvedInput]) -> Result<(), WorkerError> {
        for (i, input) in inputs.iter().enumerate() {
            match input {
                ResolvedInput::Table(Some(table)) => self.sink_input_file(&format!("input_{i}.parquet"), table).await?,
                ResolvedInput::Table(None) => {},
                ResolvedInput::Versions(versions) => {
                    for (j, version) in versions.iter().enumerate() {
                        if let Some(table) = version {
                            self.sink_input_file(&format!("input_{i}_{j}.parquet"), table).await?;
                        }
                    }
                },
            }
        }
        Ok(())
    }

    async fn sink_input_file(&self, filename: &str, table: &LazyTable) -> Result<(), WorkerError> {
        let location = td_tableio::Location {
            uri: td_uri::to_uri(&self.working_dir.join(filename)).ok(),
            options: BTreeMap::new(),
        };
        td_tableio::sink(&location, table.schema(), table.batches()).await
    }

    async fn read_outputs(&self) -> Result<Vec<Option<LazyTable>>, WorkerError> {
        let manifest_path = self.working_dir.join(OUTPUT_MANIFEST_FILENAME);
        let bytes = tokio::fs::read(&manifest_path)
            .await
            .map_err(|e| WorkerError::integrity("EntrypointProtocolViolation", format!("missing {OUTPUT_MANIFEST_FILENAME}: {e}")))?;
        let filenames: Vec<Option<String>> = serde_json::from_slice(&bytes)
            .map_err(|e| WorkerError::integrity("EntrypointProtocolViolation", e.to_string()))?;

        let mut outputs = Vec::with_capacity(filenames.len());
        for filename in filenames {
            match filename {
                None => outputs.push(None),
                Some(filename) => {
                    let location = td_tableio::Location {
                        uri: td_uri::to_uri(&self.working_dir.join(filename)).ok(),
                        options: BTreeMap::new(),
                    };
                    outputs.push(td_tableio::scan(&location, false).await?);
                },
            }
        }
        Ok(outputs)
    }
}

#[async_trait]
impl UserFunction for SubprocessUserFunction {
    async fn invoke(&self, offset: Option<serde_json::Value>, inputs: Vec<ResolvedInput>) -> Result<RawResult, WorkerError> {
        tokio::fs::create_dir_all(&self.working_dir)
            .await
            .map_err(|e| WorkerError::io("IoFailed", e.to_string()))?;

        if let Some(offset) = &offset {
            let bytes = serde_json::to_vec(offset).map_err(|e| WorkerError::other("OffsetEncodeFailed", e.to_string()))?;
            tokio::fs::write(self.working_dir.join(OFFSET_FILENAME), bytes)
                .await
                .map_err(|e| WorkerError::io("IoFailed", e.to_string()))?;
        }
        self.write_inputs(&inputs).await?;

        let status = tokio::process::Command::new(&self.entrypoint)
            .arg("--working-dir")
            .arg(&self.working_dir)
            .arg("--output-count")
            .arg(self.output_count.to_string())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| WorkerError::other("EntrypointSpawnFailed", e.to_string()))?;

        if !status.success() {
            let exception_path = self.working_dir.join(EXCEPTION_FILENAME);
            if let Ok(bytes) = tokio::fs::read(&exception_path).await {
                if let Ok(exc) = serde_json::from_slice::<SubprocessException>(&bytes) {
                    return Err(WorkerError::user("CustomException", exc.message, exc.error_code));
                }
            }
            return Err(WorkerError::other(
                "EntrypointFailed",
                format!("entrypoint exited with status {status}"),
            ));
        }

        let next_offset_path = self.working_dir.join(NEXT_OFFSET_FILENAME);
        if let Ok(bytes) = tokio::fs::read(&next_offset_path).await {
            let value: serde_json::Value = serde_json::from_slice(&bytes)
                .map_err(|e| WorkerError::integrity("EntrypointProtocolViolation", e.to_string()))?;
            *self.next_offset.lock().unwrap() = Some(value);
        }

        let outputs = self.read_outputs().await?;
        Ok(RawResult::List(outputs))
    }

    fn next_offset(&self) -> Option<serde_json::Value> {
        self.next_offset.lock().unwrap().clone()
    }
}

/// The handful of worker-process CLI folders, mirroring the invoker's own.
#[derive(Debug, Clone)]
pub struct WorkerArgs {
    pub request_folder: PathBuf,
    pub response_folder: PathBuf,
    pub output_folder: PathBuf,
    pub bin_folder: PathBuf,
    pub work: PathBuf,
}

/// Runs one function end to end: parse the request, resolve mounts already
/// injected into this process's environment, run the executor, and write
/// exactly one of `response.yaml`/`exception.yaml`. Returns the process exit
/// code.
pub async fn run(args: &WorkerArgs) -> i32 {
    match run_inner(args).await {
        Ok(()) => 0,
        Err(e) => {
            let exception = td_protocol::ExceptionV1::from(&e);
            if let Err(write_err) = td_protocol::write_exception(&args.response_folder, &exception) {
                tracing::error!(error = %write_err, "failed to write exception.yaml");
            }
            e.exit_status()
        },
    }
}

/// Writes `exception.yaml` with `kind=Canceled` into `args.response_folder`.
/// Called when the worker is asked to stop cooperatively via a forwarded
/// SIGTERM, rather than failing on its own: the entrypoint subprocess (if
/// any is running) is killed as a side effect of dropping the in-flight
/// [`run`] future this races against, since it's spawned with
/// `kill_on_drop(true)`.
pub fn write_canceled_exception(response_folder: &Path) -> Result<(), WorkerError> {
    let exception = td_protocol::ExceptionV1::new(
        "Canceled",
        "the worker was terminated by a SIGTERM signal",
        td_errors::EXIT_GENERAL_ERROR,
        None,
    );
    td_protocol::write_exception(response_folder, &exception)?;
    Ok(())
}

async fn run_inner(args: &WorkerArgs) -> Result<(), WorkerError> {
    let request_yaml = tokio::fs::read_to_string(args.request_folder.join("request.yaml"))
        .await
        .map_err(|e| WorkerError::configuration("RequestNotFound", e.to_string()))?;
    let request = td_protocol::parse_request(&request_yaml)?;

    let config = td_executor::FunctionConfig::load(&args.bin_folder)?;
    let entrypoint = args.bin_folder.join(&config.entrypoint);
    let mounts: BTreeMap<String, String> = std::env::vars().filter(|(k, _)| k.starts_with("TDS_")).collect();

    let user_fn = SubprocessUserFunction::new(entrypoint, args.work.clone(), request.output.len());
    let response = td_executor::execute(&request, &mounts, &user_fn).await?;

    td_protocol::write_response(&args.response_folder, &response)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::{
        array::{Int64Array, StringArray},
        datatypes::{DataType, Field, Schema},
        record_batch::RecordBatch,
    };

    use super::*;

    #[cfg(unix)]
    async fn make_executable(path: &Path, body: &[u8]) {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::write(path, body).await.unwrap();
        let mut perms = tokio::fs::metadata(path).await.unwrap().permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(path, perms).await.unwrap();
    }

    fn sample_table(ids: &[i64], names: &[&str]) -> LazyTable {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, false),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(ids.to_vec())),
                Arc::new(StringArray::from(names.to_vec())),
            ],
        )
        .unwrap();
        LazyTable::new(schema, vec![batch])
    }

    /// A single-table publisher: one resolved input flows straight through
    /// the subprocess boundary to one output, exercising the full
    /// sink-to-parquet / spawn / scan-back round trip with a real child
    /// process rather than an in-process fake.
    #[cfg(unix)]
    #[tokio::test]
    async fn single_input_round_trips_through_the_subprocess_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        let entrypoint = dir.path().join("copy-entrypoint.sh");
        make_executable(
            &entrypoint,
            b"#!/bin/sh\nset -e\nwhile [ \"$1\" != \"--working-dir\" ]; do shift; done\nwd=\"$2\"\ncp \"$wd/input_0.parquet\" \"$wd/output_0.parquet\"\nprintf '[\"output_0.parquet\"]' > \"$wd/output_manifest.json\"\n",
        )
        .await;

        let user_fn = SubprocessUserFunction::new(entrypoint, work, 1);
        let table = sample_table(&[1, 2], &["a", "b"]);
        let outputs = match user_fn.invoke(None, vec![ResolvedInput::Table(Some(table))]).await.unwrap() {
            RawResult::List(outputs) => outputs,
            _ => panic!("expected a list"),
        };
        assert_eq!(outputs.len(), 1);
        let output = outputs[0].as_ref().unwrap();
        assert_eq!(output.batches()[0].num_rows(), 2);
    }

    /// A historical-range input: several resolved versions of the same table
    /// are marshalled as independently indexed files, and a missing version
    /// produces no file at all.
    #[cfg(unix)]
    #[tokio::test]
    async fn historical_versions_are_marshalled_as_indexed_files() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        let entrypoint = dir.path().join("latest-version-entrypoint.sh");
        make_executable(
            &entrypoint,
            b"#!/bin/sh\nset -e\nwhile [ \"$1\" != \"--working-dir\" ]; do shift; done\nwd=\"$2\"\n[ -f \"$wd/input_0_0.parquet\" ] || exit 9\n[ -f \"$wd/input_0_2.parquet\" ] && exit 9\ncp \"$wd/input_0_1.parquet\" \"$wd/output_0.parquet\"\nprintf '[\"output_0.parquet\"]' > \"$wd/output_manifest.json\"\n",
        )
        .await;

        let user_fn = SubprocessUserFunction::new(entrypoint, work, 1);
        let versions = vec![
            Some(sample_table(&[1], &["v0"])),
            Some(sample_table(&[2, 3], &["v1a", "v1b"])),
            None,
        ];
        let outputs = match user_fn.invoke(None, vec![ResolvedInput::Versions(versions)]).await.unwrap() {
            RawResult::List(outputs) => outputs,
            _ => panic!("expected a list"),
        };
        let output = outputs[0].as_ref().unwrap();
        assert_eq!(output.batches()[0].num_rows(), 2);
    }

    #[test]
    fn canceled_exception_carries_a_nonzero_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        write_canceled_exception(dir.path()).unwrap();
        let yaml = std::fs::read_to_string(dir.path().join("exception.yaml")).unwrap();
        let exception = td_protocol::parse_exception(&yaml).unwrap();
        assert_eq!(exception.kind, "Canceled");
        assert_ne!(exception.exit_status, 0);
    }

    #[tokio::test]
    async fn entrypoint_failure_without_exception_file_maps_to_other() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        let entrypoint = dir.path().join("false-entrypoint.sh");
        tokio::fs::write(&entrypoint, b"#!/bin/sh\nexit 7\n").await.unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = tokio::fs::metadata(&entrypoint).await.unwrap().permissions();
            perms.set_mode(0o755);
            tokio::fs::set_permissions(&entrypoint, perms).await.unwrap();
        }

        let user_fn = SubprocessUserFunction::new(entrypoint, work, 1);
        let err = user_fn.invoke(None, vec![]).await.unwrap_err();
        assert_eq!(err.short_msg, "EntrypointFailed");
    }

    #[tokio::test]
    async fn entrypoint_failure_with_exception_file_maps_to_user_error() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        tokio::fs::create_dir_all(&work).await.unwrap();
        tokio::fs::write(
            work.join(EXCEPTION_FILENAME),
            br#"{"message":"bad row","error_code":"E1"}"#,
        )
        .await
        .unwrap();

        let entrypoint = dir.path().join("fail-entrypoint.sh");
        tokio::fs::write(&entrypoint, b"#!/bin/sh\nexit 1\n").await.unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = tokio::fs::metadata(&entrypoint).await.unwrap().permissions();
            perms.set_mode(0o755);
            tokio::fs::set_permissions(&entrypoint, perms).await.unwrap();
        }

        let user_fn = SubprocessUserFunction::new(entrypoint, work, 1);
        let err = user_fn.invoke(None, vec![]).await.unwrap_err();
        assert_eq!(err.kind, td_errors::Kind::User);
        assert_eq!(err.error_code.as_deref(), Some("E1"));
    }
}
