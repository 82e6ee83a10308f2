use async_trait::async_trait;
use chrono::{ DateTime, Utc };
use log::{ error, info };
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use serde_json::{ json, Map, Value };
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use yup_oauth2::{ read_service_account_key, ServiceAccountAuthenticator };

use super::{ required_str, ToolDescriptor, ToolError, ToolHandler };
use crate::retry::{ with_retry, RetryPolicy, Retryable };

pub const CALL_GBQ_FUNCTION: &str = "call_gbq_function";

const BIGQUERY_SCOPE: &str = "https://www.googleapis.com/auth/bigquery";
const BIGQUERY_API: &str = "https://bigquery.googleapis.com/bigquery/v2";
const QUERY_TIMEOUT_MS: u64 = 30_000;
const MAX_POLLS: u32 = 20;
const DEFAULT_MAX_ROWS: usize = 500;

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("The environment variable 'GOOGLE_APPLICATION_CREDENTIALS' is not set.")]
    MissingCredentials,
    #[error("Failed to authenticate with service account key {path}: {message}")]
    Auth {
        path: String,
        message: String,
    },
    #[error("No BigQuery project: set BIGQUERY_PROJECT or use a key file that names a project_id")]
    MissingProject,
    #[error("BigQuery transient failure (HTTP {status}): {message}")]
    Transient {
        status: u16,
        message: String,
    },
    #[error("{message}")]
    BadRequest {
        message: String,
    },
    #[error("BigQuery request failed (HTTP {status}): {message}")]
    Api {
        status: u16,
        message: String,
    },
    #[error("HTTP request to BigQuery failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Query job {job_id} did not complete after {polls} polls")]
    Timeout {
        job_id: String,
        polls: u32,
    },
    #[error("Unexpected BigQuery response: {0}")]
    Decode(String),
}

impl Retryable for WarehouseError {
    fn is_retryable(&self) -> bool {
        match self {
            WarehouseError::Transient { .. } => true,
            WarehouseError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

/// Runs one SQL query and returns its rows as JSON objects.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn run_query(&self, sql: &str) -> Result<Vec<Value>, WarehouseError>;
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct FieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldSchema>,
}

#[derive(Deserialize, Debug, Clone, Default)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<FieldSchema>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    #[serde(default)]
    job_reference: Option<JobReference>,
    #[serde(default)]
    schema: Option<TableSchema>,
    #[serde(default)]
    rows: Vec<Value>,
    #[serde(default)]
    page_token: Option<String>,
}

pub struct BigQueryClient {
    http: reqwest::Client,
    credentials_path: Option<String>,
    project_id: Option<String>,
    location: Option<String>,
    api_base: String,
    max_rows: usize,
}

impl BigQueryClient {
    pub fn new(credentials_path: Option<String>, project_id: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            credentials_path: credentials_path.filter(|p| !p.trim().is_empty()),
            project_id: project_id.filter(|p| !p.trim().is_empty()),
            location: None,
            api_base: BIGQUERY_API.to_string(),
            max_rows: DEFAULT_MAX_ROWS,
        }
    }

    pub fn with_location(mut self, location: Option<String>) -> Self {
        self.location = location.filter(|l| !l.trim().is_empty());
        self
    }

    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = max_rows;
        self
    }

    /// Token and project for this call. The key file is read every time, so a
    /// missing variable fails at the start of the query that needs it.
    async fn access_token(&self) -> Result<(String, String), WarehouseError> {
        let path = self.credentials_path.as_deref().ok_or(WarehouseError::MissingCredentials)?;
        let auth_err = |message: String| WarehouseError::Auth { path: path.to_string(), message };

        let key = read_service_account_key(Path::new(path)).await.map_err(|e| auth_err(e.to_string()))?;
        let project = self.project_id
            .clone()
            .or_else(|| key.project_id.clone())
            .ok_or(WarehouseError::MissingProject)?;

        let auth = ServiceAccountAuthenticator::builder(key)
            .build().await
            .map_err(|e| auth_err(e.to_string()))?;
        let token = auth.token(&[BIGQUERY_SCOPE]).await.map_err(|e| auth_err(e.to_string()))?;
        let token = token
            .token()
            .ok_or_else(|| auth_err("OAuth token was None".to_string()))?
            .to_string();
        Ok((token, project))
    }

    async fn read_response(resp: reqwest::Response) -> Result<QueryResponse, WarehouseError> {
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(classify_error(status.as_u16(), &body));
        }
        serde_json::from_str(&body).map_err(|e| WarehouseError::Decode(e.to_string()))
    }

    async fn get_query_results(
        &self,
        token: &str,
        project: &str,
        job: &JobReference,
        page_token: Option<&str>
    ) -> Result<QueryResponse, WarehouseError> {
        let url = format!("{}/projects/{}/queries/{}", self.api_base, project, job.job_id);
        let mut query: Vec<(&str, String)> = vec![("timeoutMs", QUERY_TIMEOUT_MS.to_string())];
        if let Some(location) = job.location.as_ref().or(self.location.as_ref()) {
            query.push(("location", location.clone()));
        }
        if let Some(page_token) = page_token {
            query.push(("pageToken", page_token.to_string()));
        }
        let resp = self.http
            .get(&url)
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .query(&query)
            .send().await?;
        Self::read_response(resp).await
    }
}

#[async_trait]
impl QueryExecutor for BigQueryClient {
    async fn run_query(&self, sql: &str) -> Result<Vec<Value>, WarehouseError> {
        let (token, project) = self.access_token().await?;
        let url = format!("{}/projects/{}/queries", self.api_base, project);
        let mut body = json!({
            "query": sql,
            "useLegacySql": false,
            "timeoutMs": QUERY_TIMEOUT_MS,
        });
        if let Some(location) = &self.location {
            body["location"] = Value::String(location.clone());
        }

        info!("Running BigQuery query ({} chars) in project {}", sql.len(), project);
        let resp = self.http
            .post(&url)
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .json(&body)
            .send().await?;
        let mut page = Self::read_response(resp).await?;

        let mut polls = 0;
        while !page.job_complete {
            let job = page.job_reference
                .as_ref()
                .ok_or_else(|| WarehouseError::Decode("incomplete job without jobReference".to_string()))?;
            if polls >= MAX_POLLS {
                return Err(WarehouseError::Timeout { job_id: job.job_id.clone(), polls });
            }
            polls += 1;
            let next = self.get_query_results(&token, &project, job, None).await?;
            page = QueryResponse { job_reference: next.job_reference.or(page.job_reference.take()), ..next };
        }

        let fields = page.schema
            .take()
            .map(|s| s.fields)
            .unwrap_or_default();
        let mut rows: Vec<Value> = page.rows
            .iter()
            .map(|row| decode_row(&fields, row))
            .collect();

        while rows.len() < self.max_rows {
            let (Some(token_str), Some(job)) = (page.page_token.take(), page.job_reference.as_ref()) else {
                break;
            };
            let next = self.get_query_results(&token, &project, job, Some(&token_str)).await?;
            rows.extend(next.rows.iter().map(|row| decode_row(&fields, row)));
            page.page_token = next.page_token;
        }
        rows.truncate(self.max_rows);

        info!("BigQuery returned {} rows", rows.len());
        Ok(rows)
    }
}

/// Maps an error response onto transient (retry) or malformed (report) classes.
pub fn classify_error(status: u16, body: &str) -> WarehouseError {
    let parsed: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    let error = &parsed["error"];
    let message = error["message"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| body.trim().to_string());
    let reason = error["errors"][0]["reason"].as_str().unwrap_or_default();

    match reason {
        "backendError" | "internalError" | "rateLimitExceeded" | "jobBackendError" => {
            return WarehouseError::Transient { status, message };
        }
        "invalidQuery" | "invalid" => {
            return WarehouseError::BadRequest { message: format!("{} {}", status, message) };
        }
        _ => {}
    }

    match status {
        500..=599 => WarehouseError::Transient { status, message },
        400 => WarehouseError::BadRequest { message: format!("{} {}", status, message) },
        _ => WarehouseError::Api { status, message },
    }
}

/// Decodes one `{"f": [{"v": ...}]}` row using the result schema.
pub fn decode_row(fields: &[FieldSchema], row: &Value) -> Value {
    let cells = row["f"].as_array().map(Vec::as_slice).unwrap_or_default();
    let mut out = Map::new();
    for (field, cell) in fields.iter().zip(cells) {
        out.insert(field.name.clone(), decode_cell(field, &cell["v"]));
    }
    Value::Object(out)
}

fn decode_cell(field: &FieldSchema, v: &Value) -> Value {
    if field.mode.as_deref() == Some("REPEATED") {
        return match v {
            Value::Array(items) =>
                Value::Array(
                    items
                        .iter()
                        .map(|item| decode_single(field, &item["v"]))
                        .collect()
                ),
            Value::Null => Value::Array(Vec::new()),
            other => other.clone(),
        };
    }
    decode_single(field, v)
}

fn decode_single(field: &FieldSchema, v: &Value) -> Value {
    if v.is_null() {
        return Value::Null;
    }
    let text = match v {
        Value::String(s) => s.as_str(),
        other if field.field_type == "RECORD" || field.field_type == "STRUCT" => {
            return decode_row(&field.fields, other);
        }
        other => {
            return other.clone();
        }
    };

    match field.field_type.as_str() {
        "INTEGER" | "INT64" =>
            text
                .parse::<i64>()
                .map(Value::from)
                .unwrap_or_else(|_| Value::String(text.to_string())),
        "FLOAT" | "FLOAT64" =>
            text
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(text.to_string())),
        "BOOLEAN" | "BOOL" => Value::Bool(text.eq_ignore_ascii_case("true")),
        "TIMESTAMP" =>
            parse_timestamp(text)
                .map(|ts| Value::String(ts.to_rfc3339()))
                .unwrap_or_else(|| Value::String(text.to_string())),
        _ => Value::String(text.to_string()),
    }
}

/// BigQuery sends TIMESTAMP cells as epoch seconds in float notation.
fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let secs: f64 = text.parse().ok()?;
    let whole = secs.floor();
    let nanos = ((secs - whole) * 1e9).round().min(999_999_999.0) as u32;
    DateTime::<Utc>::from_timestamp(whole as i64, nanos)
}

pub fn descriptor() -> ToolDescriptor {
    ToolDescriptor::new(
        CALL_GBQ_FUNCTION,
        "Retrieve data from Database",
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The query to execute."
                }
            },
            "required": ["query"]
        })
    )
}

/// `call_gbq_function`: runs model-written SQL. Transient failures retry once
/// after two seconds; rejected queries come back as `ERROR: ...` text so the
/// model can rewrite them.
pub struct WarehouseTool {
    executor: Arc<dyn QueryExecutor>,
    retry: RetryPolicy,
}

impl WarehouseTool {
    pub fn new(executor: Arc<dyn QueryExecutor>) -> Self {
        Self { executor, retry: RetryPolicy::fixed(1, Duration::from_secs(2)) }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn query(&self, sql: &str) -> Result<Vec<Value>, WarehouseError> {
        let executor = &self.executor;
        with_retry(&self.retry, "BigQuery query", move || executor.run_query(sql)).await
    }
}

#[async_trait]
impl ToolHandler for WarehouseTool {
    async fn call(&self, arguments: &Value) -> Result<String, ToolError> {
        let sql = required_str(arguments, "query")?;
        match self.query(sql).await {
            Ok(rows) => Ok(serde_json::to_string(&rows)?),
            Err(WarehouseError::BadRequest { message }) => {
                error!("ERROR: {}", message);
                Ok(format!("ERROR: {}", message))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, field_type: &str, mode: Option<&str>) -> FieldSchema {
        FieldSchema {
            name: name.to_string(),
            field_type: field_type.to_string(),
            mode: mode.map(str::to_string),
            fields: Vec::new(),
        }
    }

    #[test]
    fn decodes_typed_scalars() {
        let fields = vec![
            field("source_name", "STRING", Some("NULLABLE")),
            field("relevance_score", "FLOAT", None),
            field("shares", "INTEGER", None),
            field("verified", "BOOLEAN", None),
            field("missing", "STRING", None)
        ];
        let row = json!({"f": [{"v": "CNN"}, {"v": "0.9"}, {"v": "12"}, {"v": "true"}, {"v": null}]});
        assert_eq!(
            decode_row(&fields, &row),
            json!({"source_name": "CNN", "relevance_score": 0.9, "shares": 12, "verified": true, "missing": null})
        );
    }

    #[test]
    fn decodes_repeated_records() {
        let mut ner = field("ner_data", "RECORD", Some("REPEATED"));
        ner.fields = vec![field("country", "STRING", None), field("count", "INTEGER", None)];
        let fields = vec![ner];
        let row = json!({"f": [{"v": [
            {"v": {"f": [{"v": "Ukraine"}, {"v": "3"}]}},
            {"v": {"f": [{"v": "Poland"}, {"v": "1"}]}}
        ]}]});
        assert_eq!(
            decode_row(&fields, &row),
            json!({"ner_data": [{"country": "Ukraine", "count": 3}, {"country": "Poland", "count": 1}]})
        );
    }

    #[test]
    fn decodes_timestamps_as_rfc3339() {
        let fields = vec![field("date", "TIMESTAMP", None)];
        let row = json!({"f": [{"v": "1.7040672E9"}]});
        assert_eq!(decode_row(&fields, &row), json!({"date": "2024-01-01T00:00:00+00:00"}));
    }

    #[test]
    fn classifies_server_errors_as_transient() {
        let body = r#"{"error": {"code": 500, "message": "An internal error occurred", "errors": [{"reason": "backendError"}]}}"#;
        let err = classify_error(500, body);
        assert!(matches!(err, WarehouseError::Transient { status: 500, .. }));
        assert!(err.is_retryable());
        assert!(classify_error(503, "Service Unavailable").is_retryable());
    }

    #[test]
    fn classifies_invalid_queries_as_bad_request() {
        let body = r#"{"error": {"code": 400, "message": "Unrecognized name: pdat at [3:7]", "errors": [{"reason": "invalidQuery"}]}}"#;
        let err = classify_error(400, body);
        assert_eq!(err.to_string(), "400 Unrecognized name: pdat at [3:7]");
        assert!(!err.is_retryable());
    }

    #[test]
    fn other_statuses_are_plain_api_errors() {
        let err = classify_error(403, r#"{"error": {"message": "Access Denied"}}"#);
        assert!(matches!(err, WarehouseError::Api { status: 403, .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn default_policy_retries_once_after_two_seconds() {
        let tool = WarehouseTool::new(Arc::new(BigQueryClient::new(None, None)));
        assert_eq!(tool.retry, RetryPolicy::fixed(1, Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn missing_credentials_fail_at_call_start() {
        let client = BigQueryClient::new(None, Some("proj".to_string()));
        let err = client.run_query("SELECT 1").await.unwrap_err();
        assert_eq!(err.to_string(), "The environment variable 'GOOGLE_APPLICATION_CREDENTIALS' is not set.");
    }
}
