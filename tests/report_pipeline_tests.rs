mod common;

use async_trait::async_trait;
use common::{ call, text_reply, tool_reply, ScriptedTransport };
use intel_report::report::{ warehouse_registry, Analyst, WarehouseAgentTool };
use intel_report::retry::RetryPolicy;
use intel_report::tools::warehouse::{ QueryExecutor, WarehouseError, WarehouseTool };
use intel_report::tools::{ FnTool, ToolDescriptor, ToolHandler, ToolRegistry };
use serde_json::{ json, Value };
use std::sync::{ Arc, Mutex };

struct RecordingWarehouse {
    queries: Mutex<Vec<String>>,
    rows: Vec<Value>,
}

impl RecordingWarehouse {
    fn returning(rows: Vec<Value>) -> Arc<Self> {
        Arc::new(Self { queries: Mutex::new(Vec::new()), rows })
    }
}

#[async_trait]
impl QueryExecutor for RecordingWarehouse {
    async fn run_query(&self, sql: &str) -> Result<Vec<Value>, WarehouseError> {
        self.queries.lock().unwrap().push(sql.to_string());
        Ok(self.rows.clone())
    }
}

const SQL: &str =
    "SELECT DISTINCT source_name, url, relevance_score FROM hack.main WHERE pdate > DATE_SUB(CURRENT_DATE, INTERVAL 14 DAY)";

#[tokio::test]
async fn warehouse_rows_end_the_sub_agent_without_validation() {
    let warehouse = RecordingWarehouse::returning(
        vec![json!({"source_name": "CNN", "url": "https://cnn.com/a", "relevance_score": 0.9})]
    );
    let tool = WarehouseTool::new(warehouse.clone()).with_retry_policy(RetryPolicy::none());
    let transport = Arc::new(
        ScriptedTransport::new(
            vec![tool_reply("", vec![call("q1", "call_gbq_function", json!({"query": SQL}))])]
        )
    );
    let agent = WarehouseAgentTool::new(transport.clone(), warehouse_registry(tool), "<instructions/>");

    let outcome = agent.ask("What is CNN saying?").await.unwrap();

    assert_eq!(*warehouse.queries.lock().unwrap(), vec![SQL.to_string()]);
    assert_eq!(outcome.iterations, 1);
    assert_eq!(transport.turns(), 1);
    let rows: Value = serde_json::from_str(&outcome.answer).unwrap();
    assert_eq!(rows[0]["source_name"], "CNN");
    assert_eq!(rows[0]["url"], "https://cnn.com/a");
}

#[tokio::test]
async fn empty_rows_fall_through_to_validated_json() {
    let warehouse = RecordingWarehouse::returning(Vec::new());
    let tool = WarehouseTool::new(warehouse.clone()).with_retry_policy(RetryPolicy::none());
    let answer = r#"{"status": "error", "results": []}"#;
    let transport = Arc::new(
        ScriptedTransport::new(
            vec![
                tool_reply("", vec![call("q1", "call_gbq_function", json!({"query": SQL}))]),
                tool_reply("", vec![call("v1", "validate_json", json!({"json_str": answer}))])
            ]
        )
    );
    let agent = WarehouseAgentTool::new(transport.clone(), warehouse_registry(tool), "<instructions/>");

    let out = agent.call(&json!({"query": "What is CNN saying?"})).await.unwrap();

    let value: Value = serde_json::from_str(&out).unwrap();
    assert_eq!(value, json!({"status": "error", "results": []}));
    let seen = transport.transcript(1);
    assert_eq!(seen.last().unwrap().content, "[]");
}

struct RejectingWarehouse;

#[async_trait]
impl QueryExecutor for RejectingWarehouse {
    async fn run_query(&self, _sql: &str) -> Result<Vec<Value>, WarehouseError> {
        Err(WarehouseError::BadRequest { message: "400 Unrecognized name: pdat".to_string() })
    }
}

#[tokio::test]
async fn rejected_query_keeps_the_sub_agent_going() {
    let tool = WarehouseTool::new(Arc::new(RejectingWarehouse)).with_retry_policy(RetryPolicy::none());
    let transport = Arc::new(
        ScriptedTransport::new(
            vec![
                tool_reply("", vec![call("q1", "call_gbq_function", json!({"query": "SELECT pdat FROM hack.main"}))]),
                tool_reply("", vec![call("v1", "validate_json", json!({"json_str": "{'status': 'error'}"}))])
            ]
        )
    );
    let agent = WarehouseAgentTool::new(transport.clone(), warehouse_registry(tool), "<instructions/>");

    let outcome = agent.ask("What is CNN saying?").await.unwrap();

    assert_eq!(outcome.iterations, 2);
    assert_eq!(outcome.answer, r#"{"status":"error"}"#);
    assert_eq!(transport.transcript(1).last().unwrap().content, "ERROR: 400 Unrecognized name: pdat");
}

#[tokio::test]
async fn analyst_returns_report_from_first_heading() {
    let registry = ToolRegistry::new().with_tool(
        ToolDescriptor::new("get_omelas_results", "Retrieve data from Database", json!({"type": "object"})),
        Arc::new(FnTool::new(|_: &Value| Ok(r#"{"status":"success","results":[]}"#.to_string())))
    );
    let transport = Arc::new(
        ScriptedTransport::new(
            vec![
                tool_reply("", vec![call("t1", "get_omelas_results", json!({"query": "Kharkiv"}))]),
                text_reply("Based on my research, here is the report.\n\n# Kharkiv\n\n## Bottom Line Up Front\nQuiet.")
            ]
        )
    );
    let analyst = Analyst::new(transport, registry, "analyst instructions");

    let report = analyst.call_system("What is happening in Kharkiv?").await.unwrap();

    assert_eq!(report, "# Kharkiv\n\n## Bottom Line Up Front\nQuiet.");
}

#[tokio::test]
async fn analyst_surfaces_non_convergence() {
    let transport = Arc::new(
        ScriptedTransport::repeating(tool_reply("", vec![call("t1", "validate_json", json!({"json_str": "{}"}))]))
    );
    let analyst = Analyst::new(transport, ToolRegistry::new(), "analyst instructions").with_max_iterations(2);

    let err = analyst.call_system("prompt").await.unwrap_err();

    assert_eq!(err.to_string(), "Tool loop did not reach an answer within 2 turns");
}
