//! Drives a user function against a parsed request: resolves input slots,
//! normalizes whatever shape the function returns into a fixed-arity
//! collection, runs the final system-column pass, sinks each output, and
//! persists the function's offset for the next run.
//!
//! Also carries the plugin contract (source/destination connectors and the
//! publisher/transformer/subscriber decorators) that a user bundle binds to
//! — the core only ever calls through this surface, never into a specific
//! connector implementation.

use std::{collections::BTreeMap, path::PathBuf};

use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use td_errors::WorkerError;
use td_protocol::{InputSlot, OutputItem, RequestV1, ResponseV2, Table as ProtoTable};
use td_tableio::LazyTable;

pub const CONFIG_FILENAME: &str = "CONFIG";
pub const REQUIREMENTS_FILENAME: &str = "requirements.txt";

/// A function bundle's declared shape, read from its `CONFIG` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionConfig {
    pub function_type: FunctionKind,
    /// Path, relative to the bundle root, of the executable the worker
    /// invokes to run the user function.
    pub entrypoint: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub requirements_hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionKind {
    Publisher,
    Transformer,
    Subscriber,
}

impl FunctionConfig {
    pub fn load(bundle_dir: &std::path::Path) -> Result<Self, WorkerError> {
        let path = bundle_dir.join(CONFIG_FILENAME);
        let bytes = std::fs::read(&path).map_err(|e| {
            WorkerError::bundle("ConfigNotFound", format!("{}: {e}", path.display()))
        })?;
        serde_json::from_slice(&bytes)
            .map_err(|e| WorkerError::bundle("ConfigMalformed", e.to_string()))
    }

    pub fn requirements_manifest(&self, bundle_dir: &std::path::Path) -> Result<String, WorkerError> {
        let path = bundle_dir.join(REQUIREMENTS_FILENAME);
        std::fs::read_to_string(&path).map_err(|e| {
            WorkerError::bundle("RequirementsNotFound", format!("{}: {e}", path.display()))
        })
    }
}

/// One resolved input slot, ready to hand to the user function.
#[derive(Clone)]
pub enum ResolvedInput {
    Table(Option<LazyTable>),
    Versions(Vec<Option<LazyTable>>),
}

/// What a user function handed back before normalization: a single value,
/// a positional tuple, or a list — the three shapes `spec.md` allows.
pub enum RawResult {
    Single(Option<LazyTable>),
    Tuple(Vec<Option<LazyTable>>),
    List(Vec<Option<LazyTable>>),
}

/// The user function's return value, normalized to exactly one slot per
/// declared output. Mirrors the teacher's subprocess-outcome normalization:
/// a heterogeneous return shape collapses to one fixed-length sequence
/// before anything downstream touches it.
pub struct ResultsCollection(pub Vec<Option<LazyTable>>);

impl ResultsCollection {
    pub fn normalize(raw: RawResult, arity: usize) -> Result<Self, WorkerError> {
        let values = match raw {
            RawResult::Single(v) => vec![v],
            RawResult::Tuple(v) | RawResult::List(v) => v,
        };
        if values.len() != arity {
            return Err(WorkerError::integrity(
                "ResultArityMismatch",
                format!(
                    "function returned {} result(s) but {arity} output(s) are declared",
                    values.len()
                ),
            ));
        }
        Ok(Self(values))
    }
}

/// The in-process boundary a user bundle's entry point implements. The
/// worker calls `invoke` once with the resolved inputs (offset excluded —
/// it travels separately) and reads back whatever new offset the function
/// wants persisted.
#[async_trait]
pub trait UserFunction: Send + Sync {
    async fn invoke(
        &self,
        offset: Option<serde_json::Value>,
        inputs: Vec<ResolvedInput>,
    ) -> Result<RawResult, WorkerError>;

    fn next_offset(&self) -> Option<serde_json::Value>;
}

/// What a [`SourcePlugin::chunk`] call handed back.
pub enum ChunkOutput {
    Single(PathBuf),
    Tuple(Vec<PathBuf>),
    List(Vec<PathBuf>),
}

/// Materializes data under a working directory as parquet files. The
/// `initial_values` property is read on entry and may be rewritten on exit;
/// the platform persists whatever value is left there.
pub trait SourcePlugin: Send + Sync {
    fn chunk(&mut self, working_dir: &std::path::Path) -> Result<ChunkOutput, WorkerError>;
    fn initial_values(&self) -> Option<serde_json::Value>;
    fn set_initial_values(&mut self, values: Option<serde_json::Value>);
}

/// Writes resolved frames to an external sink. Empty slots are passed as
/// `None`.
pub trait DestinationPlugin: Send + Sync {
    fn stream(&mut self, working_dir: &std::path::Path, frames: &[Option<LazyTable>]) -> Result<(), WorkerError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherSpec {
    pub function: String,
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformerSpec {
    pub function: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberSpec {
    pub function: String,
    pub inputs: Vec<String>,
}

fn options_for(env_prefix: &Option<String>, mounts: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let Some(prefix) = env_prefix else {
        return BTreeMap::new();
    };
    let marker = format!("TDS_{}_", prefix.to_ascii_uppercase());
    mounts
        .iter()
        .filter_map(|(k, v)| k.strip_prefix(&marker).map(|rest| (rest.to_owned(), v.clone())))
        .collect()
}

fn apply_mode(table: LazyTable, mode: td_syscolumns::Mode) -> LazyTable {
    let schema = table.schema();
    let raw = table.into_batches();
    let batches = if raw.is_empty() {
        vec![RecordBatch::new_empty(schema)]
    } else {
        raw
    };
    let prepared: Vec<RecordBatch> = batches.iter().map(|b| td_syscolumns::apply(b, mode)).collect();
    let new_schema = prepared[0].schema();
    LazyTable::new(new_schema, prepared)
}

async fn resolve_and_prepare(table: &ProtoTable, mounts: &BTreeMap<String, String>) -> Result<Option<LazyTable>, WorkerError> {
    let options = options_for(&table.location.env_prefix, mounts);
    let location = td_tableio::Location {
        uri: table.location.uri.clone(),
        options,
    };
    let scanned = td_tableio::scan(&location, true).await?;
    Ok(scanned.map(|lt| apply_mode(lt, td_syscolumns::Mode::Tab)))
}

async fn resolve_offset(table: &ProtoTable) -> Result<Option<serde_json::Value>, WorkerError> {
    let Some(uri) = &table.location.uri else {
        return Ok(None);
    };
    let path = td_uri::to_path(uri).map_err(|e| WorkerError::configuration("MalformedUri", e.to_string()))?;
    match tokio::fs::read(&path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| WorkerError::integrity("OffsetMalformed", e.to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(WorkerError::io("IoFailed", e.to_string())),
    }
}

async fn persist_offset(table: &ProtoTable, value: Option<&serde_json::Value>) -> Result<(), WorkerError> {
    let Some(value) = value else { return Ok(()) };
    let uri = table
        .location
        .uri
        .as_ref()
        .ok_or_else(|| WorkerError::configuration("MissingLocationUri", "no uri to persist the offset to"))?;
    let path = td_uri::to_path(uri).map_err(|e| WorkerError::configuration("MalformedUri", e.to_string()))?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| WorkerError::io("IoFailed", e.to_string()))?;
    }
    let bytes = serde_json::to_vec(value).map_err(|e| WorkerError::other("OffsetEncodeFailed", e.to_string()))?;
    tokio::fs::write(&path, bytes)
        .await
        .map_err(|e| WorkerError::io("IoFailed", e.to_string()))
}

/// Runs the full C9 contract: resolve inputs, invoke, normalize, final
/// system-column pass, sink, persist the offset. Returns the response to
/// write to `response.yaml` — the caller is responsible for writing it only
/// after this returns `Ok`.
pub async fn execute(
    request: &RequestV1,
    mounts: &BTreeMap<String, String>,
    user_fn: &dyn UserFunction,
) -> Result<ResponseV2, WorkerError> {
    let initial_values_table = match request.input.first() {
        Some(InputSlot::Single(t)) => t,
        _ => {
            return Err(WorkerError::configuration(
                "MissingInitialValuesSlot",
                "request.input[0] must be the reserved offset slot",
            ))
        },
    };
    let offset = resolve_offset(initial_values_table).await?;

    let mut inputs = Vec::with_capacity(request.input.len().saturating_sub(1));
    for slot in request.input.iter().skip(1) {
        match slot {
            InputSlot::Single(t) => inputs.push(ResolvedInput::Table(resolve_and_prepare(t, mounts).await?)),
            InputSlot::Versions(versions) => {
                let mut list = Vec::with_capacity(versions.list_of_table_objects.len());
                for t in &versions.list_of_table_objects {
                    list.push(resolve_and_prepare(t, mounts).await?);
                }
                inputs.push(ResolvedInput::Versions(list));
            },
        }
    }

    let raw = user_fn.invoke(offset, inputs).await?;
    let results = ResultsCollection::normalize(raw, request.output.len())?;

    let mut output_items = Vec::with_capacity(request.output.len());
    for (out_table, result) in request.output.iter().zip(results.0.into_iter()) {
        match result {
            None => output_items.push(OutputItem::NoData {
                table: out_table.clone(),
            }),
            Some(table) => {
                let prepared = apply_mode(table, td_syscolumns::Mode::Sys);
                for batch in prepared.batches() {
                    td_syscolumns::enforce_required(batch)?;
                }
                let options = options_for(&out_table.location.env_prefix, mounts);
                let location = td_tableio::Location {
                    uri: out_table.location.uri.clone(),
                    options,
                };
                td_tableio::sink(&location, prepared.schema(), prepared.batches()).await?;
                output_items.push(OutputItem::Data {
                    table: out_table.clone(),
                });
            },
        }
    }

    persist_offset(initial_values_table, user_fn.next_offset().as_ref()).await?;

    Ok(ResponseV2 { output: output_items })
}
