//! Owns the reserved `$td.` column contract: the closed set of system
//! columns, the policies that govern how they're applied when a table is
//! materialized, and the required-columns check every output must pass.
//!
//! Pure logic, no I/O — `td-tableio` scans/sinks the bytes; this crate only
//! ever touches in-memory `RecordBatch`es.

use std::sync::Arc;

use arrow::{
    array::{ArrayRef, StringArray},
    datatypes::{DataType, Field, Schema},
    record_batch::RecordBatch,
};
use td_errors::WorkerError;

pub const RESERVED_PREFIX: &str = "$td.";

/// Whether a system column is recomputed or carried forward unchanged when
/// the engine does its final pass before sinking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inception {
    /// Recomputed every time a table is materialized.
    Regenerate,
    /// Left as-is if present; only given a default when entirely absent.
    Propagate,
}

/// Metadata for one column of the closed reserved set.
#[derive(Debug, Clone, Copy)]
pub struct ColumnMetadata {
    pub name: &'static str,
    pub dtype: DataType,
    pub inception: Inception,
    /// Whether every persisted output must carry this column.
    pub required: bool,
}

/// The closed set `S` of standard system columns. Column names outside this
/// set that still start with [`RESERVED_PREFIX`] (e.g. the transient
/// `$td._index` family used by aggregation operators) are reserved for the
/// engine but carry no standalone metadata here.
pub fn standard_columns() -> &'static [ColumnMetadata] {
    &[
        ColumnMetadata {
            name: "$td.id",
            dtype: DataType::Utf8,
            inception: Inception::Regenerate,
            required: true,
        },
        ColumnMetadata {
            name: "$td.offset",
            dtype: DataType::Utf8,
            inception: Inception::Propagate,
            required: false,
        },
    ]
}

pub fn is_reserved(name: &str) -> bool {
    name.starts_with(RESERVED_PREFIX)
}

/// The materialization mode governing how system columns are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Drop every reserved column present, then regenerate all of `S`.
    /// Used when loading data that has never passed through the engine.
    Raw,
    /// Add only the reserved columns missing from the schema; an
    /// already-prepared table is loaded idempotently.
    Tab,
    /// The executor's final pass before sinking: `Regenerate` columns are
    /// recomputed unconditionally, `Propagate` columns are kept if present
    /// and given a default only if entirely missing.
    Sys,
}

fn column_index(batch: &RecordBatch, name: &str) -> Option<usize> {
    batch.schema().fields().iter().position(|f| f.name() == name)
}

fn generate(meta: &ColumnMetadata, num_rows: usize) -> ArrayRef {
    match meta.name {
        "$td.id" => Arc::new(StringArray::from(
            (0..num_rows).map(|_| td_id::new().to_string()).collect::<Vec<_>>(),
        )),
        _ => Arc::new(StringArray::from(vec![None::<&str>; num_rows])),
    }
}

/// Applies `mode`'s policy to `batch`, returning a new batch with the
/// reserved columns in the state the mode prescribes. Non-reserved columns
/// are carried through unchanged and in their original order.
pub fn apply(batch: &RecordBatch, mode: Mode) -> RecordBatch {
    let num_rows = batch.num_rows();
    let mut fields = Vec::new();
    let mut columns = Vec::new();

    for (i, field) in batch.schema().fields().iter().enumerate() {
        if !is_reserved(field.name()) {
            fields.push(field.clone());
            columns.push(batch.column(i).clone());
        }
    }

    for meta in standard_columns() {
        let existing = column_index(batch, meta.name);
        let keep_existing = match mode {
            Mode::Raw => false,
            Mode::Tab => existing.is_some(),
            Mode::Sys => existing.is_some() && meta.inception == Inception::Propagate,
        };
        let array = if keep_existing {
            batch.column(existing.unwrap()).clone()
        } else {
            generate(meta, num_rows)
        };
        fields.push(Arc::new(Field::new(meta.name, meta.dtype.clone(), true)));
        columns.push(array);
    }

    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
        .expect("system-column application preserves row count across all columns")
}

/// Fails with `MissingRequiredColumn` if `batch` lacks any column in the
/// required subset of [`standard_columns`].
pub fn enforce_required(batch: &RecordBatch) -> Result<(), WorkerError> {
    for meta in standard_columns().iter().filter(|m| m.required) {
        if column_index(batch, meta.name).is_none() {
            return Err(WorkerError::integrity(
                "MissingRequiredColumn",
                format!("output is missing required system column {}", meta.name),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use arrow::array::Int64Array;

    use super::*;

    fn user_batch(rows: usize) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from((0..rows as i64).collect::<Vec<_>>()))]).unwrap()
    }

    #[test]
    fn raw_mode_regenerates_id_even_if_present() {
        let batch = apply(&user_batch(3), Mode::Raw);
        enforce_required(&batch).unwrap();
        let ids = batch
            .column(batch.schema().index_of("$td.id").unwrap())
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(ids.len(), 3);
        assert_ne!(ids.value(0), ids.value(1));
    }

    #[test]
    fn tab_mode_is_idempotent() {
        let once = apply(&user_batch(2), Mode::Tab);
        let twice = apply(&once, Mode::Tab);
        let ids_once = once
            .column(once.schema().index_of("$td.id").unwrap())
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        let ids_twice = twice
            .column(twice.schema().index_of("$td.id").unwrap())
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(ids_once.iter().collect::<Vec<_>>(), ids_twice.iter().collect::<Vec<_>>());
    }

    #[test]
    fn sys_mode_preserves_propagate_columns_but_regenerates_id() {
        let prepared = apply(&user_batch(2), Mode::Raw);
        let offset_field = Arc::new(Field::new("$td.offset", DataType::Utf8, true));
        let mut fields = prepared.schema().fields().to_vec();
        fields.push(offset_field);
        let mut columns = (0..prepared.num_columns()).map(|i| prepared.column(i).clone()).collect::<Vec<_>>();
        columns.push(Arc::new(StringArray::from(vec![Some("carried-forward"), Some("carried-forward")])));
        let with_offset = RecordBatch::try_new(Arc::new(Schema::new(fields)), columns).unwrap();

        let resunk = apply(&with_offset, Mode::Sys);
        let offset_idx = resunk.schema().index_of("$td.offset").unwrap();
        let offsets = resunk.column(offset_idx).as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(offsets.value(0), "carried-forward");

        let original_ids = prepared
            .column(prepared.schema().index_of("$td.id").unwrap())
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap()
            .value(0)
            .to_owned();
        let resunk_id = resunk
            .column(resunk.schema().index_of("$td.id").unwrap())
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap()
            .value(0);
        assert_ne!(original_ids, resunk_id);
    }

    #[test]
    fn empty_frame_materializes_zero_rows_not_one() {
        let batch = apply(&user_batch(0), Mode::Raw);
        assert_eq!(batch.num_rows(), 0);
    }

    #[test]
    fn missing_required_column_is_reported() {
        let schema = Arc::new(Schema::new(vec![Field::new("name", DataType::Utf8, false)]));
        let batch = RecordBatch::try_new(schema, vec![Arc::new(StringArray::from(vec!["x"]))]).unwrap();
        let err = enforce_required(&batch).unwrap_err();
        assert_eq!(err.short_msg, "MissingRequiredColumn");
    }
}
