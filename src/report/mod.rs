use async_trait::async_trait;
use log::info;
use serde_json::{ json, Value };
use std::sync::Arc;

use crate::agent::{ run_tool_loop, ExitCondition, LoopConfig, LoopError, LoopOutcome, DEFAULT_MAX_ITERATIONS };
use crate::config::prompt::PromptConfig;
use crate::llm::chat::ChatTransport;
use crate::tools::scrape::{ self, FirecrawlClient, SearchAndScrapeTool, DEFAULT_MAX_CHARS };
use crate::tools::search::SerpApiClient;
use crate::tools::warehouse::{ self, BigQueryClient, QueryExecutor, WarehouseTool };
use crate::tools::{ required_str, ToolDescriptor, ToolError, ToolHandler, ToolRegistry };

pub const GET_OMELAS_RESULTS: &str = "get_omelas_results";

/// Credentials and limits for the tools behind the report pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub google_credentials: Option<String>,
    pub bigquery_project: Option<String>,
    pub bigquery_location: Option<String>,
    pub serpapi_api_key: Option<String>,
    pub firecrawl_api_key: Option<String>,
    pub scrape_max_chars: usize,
    pub max_iterations: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            google_credentials: None,
            bigquery_project: None,
            bigquery_location: None,
            serpapi_api_key: None,
            firecrawl_api_key: None,
            scrape_max_chars: DEFAULT_MAX_CHARS,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }
}

/// Registry of the SQL sub-agent: `call_gbq_function` plus `validate_json`.
pub fn warehouse_registry(tool: WarehouseTool) -> ToolRegistry {
    ToolRegistry::new().with_tool(warehouse::descriptor(), Arc::new(tool))
}

pub fn descriptor() -> ToolDescriptor {
    ToolDescriptor::new(
        GET_OMELAS_RESULTS,
        "Retrieve data from Database",
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The question to ask of the data"
                }
            },
            "required": ["query"]
        })
    )
}

/// `get_omelas_results`: answers a plain-English question by running a nested
/// tool loop that writes SQL, queries the warehouse and returns validated JSON.
pub struct WarehouseAgentTool {
    transport: Arc<dyn ChatTransport>,
    registry: ToolRegistry,
    system: String,
    max_iterations: usize,
}

impl WarehouseAgentTool {
    pub fn new(transport: Arc<dyn ChatTransport>, registry: ToolRegistry, system: impl Into<String>) -> Self {
        Self { transport, registry, system: system.into(), max_iterations: DEFAULT_MAX_ITERATIONS }
    }

    pub fn from_settings(
        transport: Arc<dyn ChatTransport>,
        prompts: &PromptConfig,
        settings: &PipelineSettings
    ) -> Self {
        let executor: Arc<dyn QueryExecutor> = Arc::new(
            BigQueryClient::new(
                settings.google_credentials.clone(),
                settings.bigquery_project.clone()
            ).with_location(settings.bigquery_location.clone())
        );
        let registry = warehouse_registry(WarehouseTool::new(executor));
        Self::new(transport, registry, prompts.warehouse_system_prompt()).with_max_iterations(
            settings.max_iterations
        )
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub async fn ask(&self, question: &str) -> Result<LoopOutcome, LoopError> {
        let config = LoopConfig::new(&self.registry)
            .with_exit(ExitCondition::ValidatedJsonOrToolResult(warehouse::CALL_GBQ_FUNCTION))
            .with_max_iterations(self.max_iterations);
        run_tool_loop(self.transport.as_ref(), &self.system, question, &config).await
    }
}

#[async_trait]
impl ToolHandler for WarehouseAgentTool {
    async fn call(&self, arguments: &Value) -> Result<String, ToolError> {
        let question = required_str(arguments, "query")?;
        let outcome = self.ask(question).await?;
        info!(
            "Warehouse sub-agent answered in {} turns ({} in / {} out tokens)",
            outcome.iterations,
            outcome.usage.input_tokens,
            outcome.usage.output_tokens
        );
        Ok(outcome.answer)
    }
}

/// The analyst: researches a prompt with the warehouse sub-agent and web search,
/// then writes a markdown report.
pub struct Analyst {
    transport: Arc<dyn ChatTransport>,
    registry: ToolRegistry,
    instructions: String,
    max_iterations: usize,
}

impl Analyst {
    pub fn new(transport: Arc<dyn ChatTransport>, registry: ToolRegistry, instructions: impl Into<String>) -> Self {
        Self { transport, registry, instructions: instructions.into(), max_iterations: DEFAULT_MAX_ITERATIONS }
    }

    pub fn from_settings(
        transport: Arc<dyn ChatTransport>,
        prompts: &PromptConfig,
        settings: &PipelineSettings
    ) -> Self {
        let warehouse_agent = WarehouseAgentTool::from_settings(transport.clone(), prompts, settings);
        let search_and_scrape = SearchAndScrapeTool::new(
            SerpApiClient::new(settings.serpapi_api_key.clone()),
            Arc::new(FirecrawlClient::new(settings.firecrawl_api_key.clone()))
        ).with_max_chars(settings.scrape_max_chars);

        let registry = ToolRegistry::new()
            .with_tool(descriptor(), Arc::new(warehouse_agent))
            .with_tool(scrape::descriptor(), Arc::new(search_and_scrape));

        Self::new(transport, registry, prompts.instructions.clone()).with_max_iterations(settings.max_iterations)
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub async fn call_system(&self, prompt: &str) -> Result<String, LoopError> {
        let config = LoopConfig::new(&self.registry).with_max_iterations(self.max_iterations);
        let outcome = run_tool_loop(self.transport.as_ref(), &self.instructions, prompt, &config).await?;
        info!(
            "Report ready after {} turns ({} in / {} out tokens)",
            outcome.iterations,
            outcome.usage.input_tokens,
            outcome.usage.output_tokens
        );
        Ok(report_body(&outcome.answer))
    }
}

/// Drops any preamble before the report's first markdown heading.
pub fn report_body(answer: &str) -> String {
    match answer.split_once('#') {
        Some((_, rest)) => format!("#{}", rest),
        None => format!("#{}", answer),
    }
}
