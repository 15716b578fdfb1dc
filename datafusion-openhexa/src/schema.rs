use datafusion::arrow::array::{ArrayRef, RecordBatch, StringBuilder};
use datafusion::arrow::datatypes::{DataType as ArrowDataType, Field, Schema, SchemaRef};
use datafusion::arrow::record_batch::RecordBatchOptions;
use openhexa_client::DatasetFileRecord;
use std::sync::Arc;

use crate::error::Result;

/// Columns of the `list_files` table, in order
pub const DATASET_FILE_COLUMNS: [&str; 5] =
    ["workspace", "dataset", "version", "filename", "file_path"];

/// Arrow schema of the dataset file listing. There is no URL column.
pub fn dataset_files_schema() -> SchemaRef {
    let fields: Vec<Field> = DATASET_FILE_COLUMNS
        .iter()
        .map(|name| Field::new(*name, ArrowDataType::Utf8, false))
        .collect();
    Arc::new(Schema::new(fields))
}

/// Create projected Arrow schema from column indices
pub fn create_projected_schema(schema: &Schema, projection: &[usize]) -> Result<SchemaRef> {
    Ok(Arc::new(schema.project(projection)?))
}

/// Build one batch of listing rows restricted to `projection`
pub fn records_to_batch(
    records: &[DatasetFileRecord],
    projection: Option<&[usize]>,
) -> Result<RecordBatch> {
    let schema = dataset_files_schema();
    let all: Vec<usize> = (0..DATASET_FILE_COLUMNS.len()).collect();
    let projection = projection.unwrap_or(&all[..]);

    let columns: Vec<ArrayRef> = projection
        .iter()
        .map(|&idx| {
            let mut builder = StringBuilder::with_capacity(records.len(), records.len() * 16);
            for record in records {
                builder.append_value(column_value(record, idx));
            }
            Arc::new(builder.finish()) as ArrayRef
        })
        .collect();

    let projected = create_projected_schema(&schema, projection)?;
    let options = RecordBatchOptions::new().with_row_count(Some(records.len()));
    Ok(RecordBatch::try_new_with_options(projected, columns, &options)?)
}

fn column_value(record: &DatasetFileRecord, idx: usize) -> &str {
    match idx {
        0 => &record.workspace,
        1 => &record.dataset,
        2 => &record.version,
        3 => &record.filename,
        _ => &record.file_id,
    }
}
