use datafusion::arrow::array::RecordBatch;
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::error::{DataFusionError, Result as DataFusionResult};
use datafusion::execution::{RecordBatchStream, SendableRecordBatchStream, TaskContext};
use datafusion::physical_expr::EquivalenceProperties;
use datafusion::physical_plan::execution_plan::{Boundedness, EmissionType};
use datafusion::physical_plan::{
    DisplayAs, DisplayFormatType, ExecutionPlan, Partitioning, PlanProperties,
};
use futures::stream::Stream;
use openhexa_client::DatasetFileRecord;
use std::any::Any;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::error::Result;
use crate::schema::{create_projected_schema, records_to_batch};

/// Execution plan serving an already fetched dataset file listing
#[derive(Debug)]
pub struct DatasetFilesExec {
    records: Arc<Vec<DatasetFileRecord>>,
    schema: SchemaRef,
    projection: Option<Vec<usize>>,
    limit: Option<usize>,
    plan_properties: PlanProperties,
}

impl DatasetFilesExec {
    pub fn try_new(
        records: Arc<Vec<DatasetFileRecord>>,
        schema: SchemaRef,
        projection: Option<Vec<usize>>,
        limit: Option<usize>,
    ) -> Result<Self> {
        let projected_schema = match &projection {
            Some(proj) => create_projected_schema(schema.as_ref(), proj)?,
            None => schema,
        };

        let plan_properties = PlanProperties::new(
            EquivalenceProperties::new(projected_schema.clone()),
            Partitioning::UnknownPartitioning(1),
            EmissionType::Incremental,
            Boundedness::Bounded,
        );

        Ok(Self {
            records,
            schema: projected_schema,
            projection,
            limit,
            plan_properties,
        })
    }

    fn num_rows(&self) -> usize {
        let total = self.records.len();
        self.limit.map_or(total, |limit| limit.min(total))
    }
}

impl DisplayAs for DatasetFilesExec {
    fn fmt_as(&self, _t: DisplayFormatType, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DatasetFilesExec: files={}", self.num_rows())
    }
}

impl ExecutionPlan for DatasetFilesExec {
    fn name(&self) -> &str {
        "DatasetFilesExec"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn properties(&self) -> &PlanProperties {
        &self.plan_properties
    }

    fn children(&self) -> Vec<&Arc<dyn ExecutionPlan>> {
        vec![]
    }

    fn with_new_children(
        self: Arc<Self>,
        _children: Vec<Arc<dyn ExecutionPlan>>,
    ) -> DataFusionResult<Arc<dyn ExecutionPlan>> {
        Ok(self)
    }

    fn execute(
        &self,
        partition: usize,
        context: Arc<TaskContext>,
    ) -> DataFusionResult<SendableRecordBatchStream> {
        if partition != 0 {
            return Err(DataFusionError::Execution(format!(
                "Partition {} out of range (have 1 partition)",
                partition
            )));
        }

        let batch_size = context.session_config().batch_size().max(1);
        let records = &self.records[..self.num_rows()];

        let batches = records
            .chunks(batch_size)
            .map(|chunk| records_to_batch(chunk, self.projection.as_deref()))
            .collect::<Result<Vec<_>>>()?;

        Ok(Box::pin(DatasetFilesStream {
            schema: self.schema.clone(),
            batches,
            index: 0,
        }))
    }
}

/// Stream of RecordBatches of listing rows
struct DatasetFilesStream {
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
    index: usize,
}

impl Stream for DatasetFilesStream {
    type Item = DataFusionResult<RecordBatch>;

    fn poll_next(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.index < self.batches.len() {
            let batch = self.batches[self.index].clone();
            self.index += 1;
            Poll::Ready(Some(Ok(batch)))
        } else {
            Poll::Ready(None)
        }
    }
}

impl RecordBatchStream for DatasetFilesStream {
    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::dataset_files_schema;
    use datafusion::physical_plan::common::collect;

    fn records(n: usize) -> Arc<Vec<DatasetFileRecord>> {
        Arc::new(
            (0..n)
                .map(|i| DatasetFileRecord {
                    workspace: "ws1".to_string(),
                    dataset: "ds".to_string(),
                    version: "v1".to_string(),
                    filename: format!("f{}.csv", i),
                    file_id: format!("file-{}", i),
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_execute_with_projection_and_limit() {
        let exec =
            DatasetFilesExec::try_new(records(10), dataset_files_schema(), Some(vec![4]), Some(3))
                .unwrap();
        assert_eq!(exec.schema().fields().len(), 1);

        let stream = exec.execute(0, Arc::new(TaskContext::default())).unwrap();
        let batches = collect(stream).await.unwrap();

        let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(rows, 3);
    }

    #[tokio::test]
    async fn test_execute_empty_listing() {
        let exec =
            DatasetFilesExec::try_new(records(0), dataset_files_schema(), None, None).unwrap();

        let stream = exec.execute(0, Arc::new(TaskContext::default())).unwrap();
        let batches = collect(stream).await.unwrap();

        assert!(batches.is_empty());
    }

    #[test]
    fn test_bad_partition() {
        let exec =
            DatasetFilesExec::try_new(records(1), dataset_files_schema(), None, None).unwrap();
        assert!(exec.execute(1, Arc::new(TaskContext::default())).is_err());
    }
}
