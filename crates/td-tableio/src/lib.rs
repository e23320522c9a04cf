//! Scans and sinks parquet lazy-tables over local and object-store URIs.
//!
//! A single URI scheme dispatch, courtesy of `object_store::parse_url_opts`,
//! covers `file://`, `s3://`, `az://`/`abfs://`, and `gs://` alike; the
//! lazy-tabular-engine surface itself is kept to schema + row-batch
//! iteration plus a parquet sink, since the expression layer (joins,
//! filters, aggregations) is out of scope here.

use std::{collections::BTreeMap, sync::Arc};

use arrow::{
    datatypes::{Schema, SchemaRef},
    record_batch::RecordBatch,
};
use object_store::{path::Path as ObjectPath, ObjectStore};
use parquet::arrow::{arrow_reader::ParquetRecordBatchReaderBuilder, arrow_writer::ArrowWriter};
use td_errors::WorkerError;

pub const RESERVED_PREFIX: &str = "$td.";

/// A location to scan from or sink to: a URI plus the resolved options
/// (already flattened and uppercased by `td-mounts`) needed to reach it.
#[derive(Debug, Clone, Default)]
pub struct Location {
    pub uri: Option<String>,
    pub options: BTreeMap<String, String>,
}

/// An in-memory lazy table: a schema plus its materialized batches. Kept
/// intentionally thin — callers that need expression evaluation operate on
/// `batches()` directly or hand them to the system-column engine.
#[derive(Clone)]
pub struct LazyTable {
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
}

impl LazyTable {
    pub fn new(schema: SchemaRef, batches: Vec<RecordBatch>) -> Self {
        Self { schema, batches }
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    pub fn into_batches(self) -> Vec<RecordBatch> {
        self.batches
    }
}

fn open_store(uri: &str, options: &BTreeMap<String, String>) -> Result<(Box<dyn ObjectStore>, ObjectPath), WorkerError> {
    let url = url::Url::parse(uri)
        .map_err(|e| WorkerError::configuration("MalformedUri", format!("{uri}: {e}")))?;
    object_store::parse_url_opts(&url, options.iter())
        .map_err(|e| classify_store_error(e, uri))
}

fn classify_store_error(err: object_store::Error, uri: &str) -> WorkerError {
    match &err {
        object_store::Error::PermissionDenied { .. } => {
            WorkerError::io("PermissionDenied", format!("{uri}: {err}"))
        },
        _ => WorkerError::io("IoFailed", format!("{uri}: {err}")),
    }
}

/// Scans `location` into a [`LazyTable`]. Returns `Ok(None)` iff `uri` is
/// absent and `allow_missing` is set; otherwise a missing `uri` fails with
/// `MissingLocationUri`.
pub async fn scan(location: &Location, allow_missing: bool) -> Result<Option<LazyTable>, WorkerError> {
    let uri = match &location.uri {
        Some(uri) => uri,
        None if allow_missing => return Ok(None),
        None => {
            return Err(WorkerError::configuration(
                "MissingLocationUri",
                "scan target has no uri and the caller does not allow a missing slot",
            ))
        },
    };

    let (store, path) = open_store(uri, &location.options)?;
    let get_result = store
        .get(&path)
        .await
        .map_err(|e| classify_store_error(e, uri))?;
    let bytes = get_result
        .bytes()
        .await
        .map_err(|e| classify_store_error(e, uri))?;

    let builder = ParquetRecordBatchReaderBuilder::try_new(bytes)
        .map_err(|e| WorkerError::io("IoFailed", format!("{uri} is not a valid parquet file: {e}")))?;
    let schema = builder.schema().clone();
    let reader = builder
        .build()
        .map_err(|e| WorkerError::io("IoFailed", format!("{uri}: {e}")))?;
    let batches = reader
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| WorkerError::io("IoFailed", format!("{uri}: {e}")))?;

    tracing::debug!(uri = %uri, rows = batches.iter().map(RecordBatch::num_rows).sum::<usize>(), "scanned table");
    Ok(Some(LazyTable::new(schema, batches)))
}

/// Removes any column whose name collides with the reserved `$td.`
/// namespace but isn't in `allowed_reserved_columns`. `td_syscolumns::apply`
/// already performs this drop as part of its own reserved-column pass (it
/// strips every `$td.`-prefixed field before regenerating only the closed
/// standard set), so the executor's sink path never needs to call this
/// directly; it's kept public for callers that sink a batch without going
/// through the system-column engine at all.
pub fn drop_reserved_collisions(batch: &RecordBatch, allowed_reserved_columns: &[String]) -> RecordBatch {
    let schema = batch.schema();
    let mut fields = Vec::new();
    let mut columns = Vec::new();
    for (i, field) in schema.fields().iter().enumerate() {
        let name = field.name();
        if name.starts_with(RESERVED_PREFIX) && !allowed_reserved_columns.iter().any(|a| a == name) {
            continue;
        }
        fields.push(field.clone());
        columns.push(batch.column(i).clone());
    }
    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
        .expect("filtering columns out of a valid batch cannot produce an invalid one")
}

/// Writes `batches` as a single parquet object at `location`, creating
/// parent directories for `file://` targets. Writes preserve row order —
/// batches are written in the order given, never reordered or merged across
/// concurrent sinks.
pub async fn sink(location: &Location, schema: SchemaRef, batches: &[RecordBatch]) -> Result<(), WorkerError> {
    let uri = location
        .uri
        .as_ref()
        .ok_or_else(|| WorkerError::configuration("MissingLocationUri", "sink target has no uri"))?;
    let (store, path) = open_store(uri, &location.options)?;

    let mut buf = Vec::new();
    {
        let mut writer = ArrowWriter::try_new(&mut buf, schema, None)
            .map_err(|e| WorkerError::io("IoFailed", format!("{uri}: {e}")))?;
        for batch in batches {
            writer
                .write(batch)
                .map_err(|e| WorkerError::io("IoFailed", format!("{uri}: {e}")))?;
        }
        writer
            .close()
            .map_err(|e| WorkerError::io("IoFailed", format!("{uri}: {e}")))?;
    }

    store
        .put(&path, buf.into())
        .await
        .map_err(|e| classify_store_error(e, uri))?;
    tracing::debug!(uri = %uri, bytes = %path, "sunk table");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::{
        array::{Int64Array, StringArray},
        datatypes::{DataType, Field},
    };
    use td_uri::to_uri;

    use super::*;

    fn sample_batch() -> (SchemaRef, RecordBatch) {
        let schema = Arc::new(Schema::new(vec![
            Field::new("$td.id", DataType::Utf8, false),
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, false),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(vec!["a", "b"])),
                Arc::new(Int64Array::from(vec![1, 2])),
                Arc::new(StringArray::from(vec!["x", "y"])),
            ],
        )
        .unwrap();
        (schema, batch)
    }

    #[tokio::test]
    async fn sinks_and_scans_a_local_parquet_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.parquet");
        let uri = to_uri(&path).unwrap();
        let (schema, batch) = sample_batch();

        let location = Location {
            uri: Some(uri.clone()),
            options: BTreeMap::new(),
        };
        sink(&location, schema, &[batch.clone()]).await.unwrap();
        assert!(path.exists());

        let scanned = scan(&location, false).await.unwrap().unwrap();
        assert_eq!(scanned.schema().fields().len(), 3);
        assert_eq!(scanned.batches()[0].num_rows(), 2);
    }

    #[tokio::test]
    async fn missing_uri_yields_none_when_allowed() {
        let location = Location::default();
        assert!(scan(&location, true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_uri_fails_when_not_allowed() {
        let location = Location::default();
        let err = scan(&location, false).await.unwrap_err();
        assert_eq!(err.short_msg, "MissingLocationUri");
    }

    #[test]
    fn drops_unauthorized_reserved_columns() {
        let (_, batch) = sample_batch();
        let filtered = drop_reserved_collisions(&batch, &[]);
        assert_eq!(filtered.num_columns(), 2);
        assert!(filtered.schema().field_with_name("$td.id").is_err());

        let kept = drop_reserved_collisions(&batch, &["$td.id".to_owned()]);
        assert_eq!(kept.num_columns(), 3);
    }
}
