use async_trait::async_trait;
use intel_report::retry::RetryPolicy;
use intel_report::tools::warehouse::{ QueryExecutor, WarehouseError, WarehouseTool };
use intel_report::tools::{ ToolError, ToolHandler };
use serde_json::{ json, Value };
use std::sync::atomic::{ AtomicUsize, Ordering };
use std::sync::{ Arc, Mutex };
use std::time::Duration;

/// Fails with the queued errors first, then returns `rows`.
struct FlakyWarehouse {
    failures: Mutex<Vec<WarehouseError>>,
    rows: Vec<Value>,
    calls: AtomicUsize,
}

impl FlakyWarehouse {
    fn new(failures: Vec<WarehouseError>, rows: Vec<Value>) -> Arc<Self> {
        Arc::new(Self { failures: Mutex::new(failures), rows, calls: AtomicUsize::new(0) })
    }
}

#[async_trait]
impl QueryExecutor for FlakyWarehouse {
    async fn run_query(&self, _sql: &str) -> Result<Vec<Value>, WarehouseError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut failures = self.failures.lock().unwrap();
        if failures.is_empty() {
            Ok(self.rows.clone())
        } else {
            Err(failures.remove(0))
        }
    }
}

fn internal_error() -> WarehouseError {
    WarehouseError::Transient { status: 500, message: "An internal error occurred".to_string() }
}

fn tool(warehouse: Arc<FlakyWarehouse>) -> WarehouseTool {
    WarehouseTool::new(warehouse).with_retry_policy(RetryPolicy::fixed(1, Duration::from_millis(5)))
}

#[tokio::test]
async fn one_transient_failure_is_retried_exactly_once() {
    let rows = vec![json!({"source_name": "CNN", "relevance_score": 0.9})];
    let warehouse = FlakyWarehouse::new(vec![internal_error()], rows.clone());

    let out = tool(warehouse.clone()).call(&json!({"query": "SELECT 1"})).await.unwrap();

    assert_eq!(warehouse.calls.load(Ordering::SeqCst), 2);
    assert_eq!(serde_json::from_str::<Vec<Value>>(&out).unwrap(), rows);
}

#[tokio::test]
async fn second_transient_failure_is_not_retried_again() {
    let warehouse = FlakyWarehouse::new(vec![internal_error(), internal_error()], Vec::new());

    let err = tool(warehouse.clone()).call(&json!({"query": "SELECT 1"})).await.unwrap_err();

    assert_eq!(warehouse.calls.load(Ordering::SeqCst), 2);
    assert!(matches!(err, ToolError::Warehouse(WarehouseError::Transient { status: 500, .. })));
}

#[tokio::test]
async fn malformed_query_comes_back_as_text() {
    let warehouse = FlakyWarehouse::new(
        vec![WarehouseError::BadRequest { message: "400 Unrecognized name: pdat".to_string() }],
        Vec::new()
    );

    let out = tool(warehouse.clone()).call(&json!({"query": "SELECT pdat FROM hack.main"})).await.unwrap();

    assert_eq!(out, "ERROR: 400 Unrecognized name: pdat");
    assert_eq!(warehouse.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn missing_credentials_are_not_retried() {
    let warehouse = FlakyWarehouse::new(vec![WarehouseError::MissingCredentials], Vec::new());

    let err = tool(warehouse.clone()).call(&json!({"query": "SELECT 1"})).await.unwrap_err();

    assert_eq!(warehouse.calls.load(Ordering::SeqCst), 1);
    assert_eq!(err.to_string(), "The environment variable 'GOOGLE_APPLICATION_CREDENTIALS' is not set.");
}

#[tokio::test]
async fn query_argument_is_required() {
    let warehouse = FlakyWarehouse::new(Vec::new(), Vec::new());

    let err = tool(warehouse.clone()).call(&json!({"sql": "SELECT 1"})).await.unwrap_err();

    assert!(matches!(err, ToolError::InvalidArguments(_)));
    assert_eq!(warehouse.calls.load(Ordering::SeqCst), 0);
}
