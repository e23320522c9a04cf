//! Parses the versioned request YAML and emits the versioned response and
//! exception YAML that make up the worker's on-disk contract with its
//! supervisor.
//!
//! Versioning rides on YAML's node tag (`!V1`, `!V2`) rather than a mapping
//! key, matching `serde_yaml`'s externally-tagged enum representation: an
//! enum with a single variant `V1` serializes as `!V1` followed by the
//! variant's fields, and deserializes the same way.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use td_errors::WorkerError;

pub const INITIAL_VALUES_SLOT: &str = "$td.initial_values";
pub const RESPONSE_FILENAME: &str = "response.yaml";
pub const EXCEPTION_FILENAME: &str = "exception.yaml";

const KIND_MAX: usize = 64;
const MESSAGE_MAX: usize = 128;
const ERROR_CODE_MAX: usize = 16;

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// `(uri, env_prefix?)`. `uri` absent means "no data for this slot".
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Location {
    pub uri: Option<String>,
    pub env_prefix: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    #[serde(flatten)]
    pub location: Location,
    pub execution_id: Option<String>,
    pub transaction_id: Option<String>,
    pub table_data_version_id: Option<String>,
    pub input_idx: Option<u32>,
    pub triggered_on: Option<i64>,
    /// Fields the current schema doesn't know about. Kept so a newer
    /// platform's requests round-trip through decode without data loss, but
    /// never written back out — see the module-level contract note.
    #[serde(flatten, skip_serializing)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl Table {
    pub fn has_data(&self) -> bool {
        self.location.uri.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableVersions {
    pub list_of_table_objects: Vec<Table>,
}

/// An input slot: a single physical table, or an ordered historical slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputSlot {
    Versions(TableVersions),
    Single(Table),
}

impl InputSlot {
    pub fn name(&self) -> Option<&str> {
        match self {
            InputSlot::Single(t) => Some(&t.name),
            InputSlot::Versions(v) => v.list_of_table_objects.first().map(|t| t.name.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionBundle {
    pub uri: String,
    pub env_prefix: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestInfo {
    pub function_bundle: FunctionBundle,
    pub dataset_data_version: Option<String>,
    pub triggered_on: Option<i64>,
    pub execution_plan_triggered_on: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestV1 {
    pub info: RequestInfo,
    pub input: Vec<InputSlot>,
    pub output: Vec<Table>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Request {
    V1(RequestV1),
}

/// One of the worker's declared outputs: either sunk data, or an explicit
/// "nothing to write" for this run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OutputItem {
    Data { table: Table },
    NoData { table: Table },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseV2 {
    pub output: Vec<OutputItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Response {
    V2(ResponseV2),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionV1 {
    pub kind: String,
    pub message: String,
    pub exit_status: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl ExceptionV1 {
    pub fn new(kind: &str, message: &str, exit_status: i32, error_code: Option<&str>) -> Self {
        Self {
            kind: truncate(kind, KIND_MAX),
            message: truncate(message, MESSAGE_MAX),
            exit_status,
            error_code: error_code.map(|c| truncate(c, ERROR_CODE_MAX)),
        }
    }
}

impl From<&WorkerError> for ExceptionV1 {
    fn from(err: &WorkerError) -> Self {
        ExceptionV1::new(
            &err.short_msg,
            &err.msg,
            err.exit_status(),
            err.error_code.as_deref(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Exception {
    V1(ExceptionV1),
}

fn classify_decode_error(e: serde_yaml::Error) -> WorkerError {
    let msg = e.to_string();
    if msg.contains("unknown variant") {
        WorkerError::integrity("UnknownSchemaVersion", msg)
    } else {
        WorkerError::integrity("MalformedDocument", msg)
    }
}

/// Parses `!V1` request YAML. Fails with `UnknownSchemaVersion` if the tag
/// isn't `V1`, or `MissingInitialValuesSlot` if the reserved first input
/// slot isn't present and correctly named.
pub fn parse_request(yaml: &str) -> Result<RequestV1, WorkerError> {
    let Request::V1(request) = serde_yaml::from_str(yaml).map_err(classify_decode_error)?;
    validate_request(&request)?;
    Ok(request)
}

fn validate_request(request: &RequestV1) -> Result<(), WorkerError> {
    match request.input.first().and_then(InputSlot::name) {
        Some(name) if name == INITIAL_VALUES_SLOT => {},
        _ => {
            return Err(WorkerError::configuration(
                "MissingInitialValuesSlot",
                format!("input[0] must be named {INITIAL_VALUES_SLOT}"),
            ))
        },
    }

    let mut seen = std::collections::HashSet::new();
    for table in &request.output {
        let Some(uri) = &table.location.uri else { continue };
        if !seen.insert(uri) {
            return Err(WorkerError::configuration(
                "DuplicateOutputUri",
                format!("more than one output slot targets {uri}"),
            ));
        }
    }

    Ok(())
}

/// Parses `!V2` response YAML.
pub fn parse_response(yaml: &str) -> Result<ResponseV2, WorkerError> {
    let Response::V2(response) = serde_yaml::from_str(yaml).map_err(classify_decode_error)?;
    Ok(response)
}

/// Parses `!V1` exception YAML.
pub fn parse_exception(yaml: &str) -> Result<ExceptionV1, WorkerError> {
    let Exception::V1(exception) = serde_yaml::from_str(yaml).map_err(classify_decode_error)?;
    Ok(exception)
}

fn write_atomically(dir: &Path, filename: &str, contents: &str) -> Result<PathBuf, WorkerError> {
    std::fs::create_dir_all(dir)
        .map_err(|e| WorkerError::io("ResponseFolderUnwritable", e.to_string()))?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".td-write-")
        .tempfile_in(dir)
        .map_err(|e| WorkerError::io("ResponseFolderUnwritable", e.to_string()))?;
    use std::io::Write;
    tmp.write_all(contents.as_bytes())
        .map_err(|e| WorkerError::io("ResponseWriteFailed", e.to_string()))?;
    let dest = dir.join(filename);
    tmp.persist(&dest)
        .map_err(|e| WorkerError::io("ResponseWriteFailed", e.to_string()))?;
    Ok(dest)
}

/// Writes `response.yaml` into `folder`, atomically: the file only ever
/// appears in its final, complete form. Never call this after
/// [`write_exception`] for the same run, or vice versa.
pub fn write_response(folder: &Path, response: &ResponseV2) -> Result<PathBuf, WorkerError> {
    let yaml = serde_yaml::to_string(&Response::V2(response.clone()))
        .map_err(|e| WorkerError::other("ResponseEncodeFailed", e.to_string()))?;
    write_atomically(folder, RESPONSE_FILENAME, &yaml)
}

/// Writes `exception.yaml` into `folder`, atomically.
pub fn write_exception(folder: &Path, exception: &ExceptionV1) -> Result<PathBuf, WorkerError> {
    let yaml = serde_yaml::to_string(&Exception::V1(exception.clone()))
        .map_err(|e| WorkerError::other("ResponseEncodeFailed", e.to_string()))?;
    write_atomically(folder, EXCEPTION_FILENAME, &yaml)
}
