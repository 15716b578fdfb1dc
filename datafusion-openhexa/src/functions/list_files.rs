use async_trait::async_trait;
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::catalog::{Session, TableFunctionImpl};
use datafusion::common::{plan_err, ScalarValue};
use datafusion::datasource::TableProvider;
use datafusion::error::Result as DataFusionResult;
use datafusion::logical_expr::{Expr, TableType};
use datafusion::physical_plan::ExecutionPlan;
use std::any::Any;
use std::sync::Arc;

use crate::cache::MetadataCache;
use crate::exec::DatasetFilesExec;
use crate::identity::CallerIdentity;
use crate::schema::dataset_files_schema;

/// `list_files([workspace])` table function
#[derive(Debug)]
pub struct ListFilesFunction {
    cache: Arc<MetadataCache>,
    identity: CallerIdentity,
}

impl ListFilesFunction {
    pub fn new(cache: Arc<MetadataCache>, identity: CallerIdentity) -> Self {
        Self { cache, identity }
    }
}

impl TableFunctionImpl for ListFilesFunction {
    fn call(&self, args: &[Expr]) -> DataFusionResult<Arc<dyn TableProvider>> {
        let workspace = match args {
            [] => None,
            [Expr::Literal(ScalarValue::Utf8(value))]
            | [Expr::Literal(ScalarValue::LargeUtf8(value))]
            | [Expr::Literal(ScalarValue::Utf8View(value))] => value.clone(),
            [Expr::Literal(ScalarValue::Null)] => None,
            _ => {
                return plan_err!(
                    "list_files takes at most one argument, a workspace slug string literal"
                )
            }
        };

        // An empty slug means no filter
        let workspace = workspace.filter(|w| !w.is_empty());

        Ok(Arc::new(DatasetFilesTable {
            cache: Arc::clone(&self.cache),
            identity: self.identity.clone(),
            workspace,
            schema: dataset_files_schema(),
        }))
    }
}

/// Listing of dataset files, fetched through the cache when scanned
#[derive(Debug)]
pub struct DatasetFilesTable {
    cache: Arc<MetadataCache>,
    identity: CallerIdentity,
    workspace: Option<String>,
    schema: SchemaRef,
}

impl DatasetFilesTable {
    pub fn workspace(&self) -> Option<&str> {
        self.workspace.as_deref()
    }
}

#[async_trait]
impl TableProvider for DatasetFilesTable {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    fn table_type(&self) -> TableType {
        TableType::Temporary
    }

    async fn scan(
        &self,
        _state: &dyn Session,
        projection: Option<&Vec<usize>>,
        _filters: &[Expr],
        limit: Option<usize>,
    ) -> DataFusionResult<Arc<dyn ExecutionPlan>> {
        // No partial listing: an upstream failure fails the scan
        let records = self
            .cache
            .list_files(&self.identity, self.workspace.as_deref())
            .await?;

        Ok(Arc::new(DatasetFilesExec::try_new(
            records,
            self.schema.clone(),
            projection.cloned(),
            limit,
        )?))
    }
}
