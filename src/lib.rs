pub mod agent;
pub mod bot;
pub mod cli;
pub mod config;
pub mod llm;
pub mod models;
pub mod report;
pub mod retry;
pub mod server;
pub mod tools;

use cli::{ Args, Command };
use config::prompt;
use llm::chat::{ new_client as new_chat_client, ChatTransport };
use llm::{ LlmConfig, LlmType };
use log::{ info, warn };
use report::{ Analyst, PipelineSettings, WarehouseAgentTool };
use server::{ Server, TlsSettings };
use std::error::Error;
use std::sync::Arc;
use tools::scrape::{ FirecrawlClient, SearchAndScrapeTool };
use tools::search::{ SearchEngine, SerpApiClient };

fn chat_config(args: &Args) -> Result<LlmConfig, Box<dyn Error + Send + Sync>> {
    let llm_type: LlmType = args.chat_llm_type.parse()?;
    let api_key = if !args.chat_api_key.is_empty() { Some(args.chat_api_key.clone()) } else { None };
    Ok(LlmConfig {
        llm_type,
        api_key,
        model: args.chat_model.clone(),
        base_url: args.chat_base_url.clone(),
        max_tokens: args.chat_max_tokens,
        ..Default::default()
    })
}

fn chat_transport(args: &Args) -> Result<Arc<dyn ChatTransport>, Box<dyn Error + Send + Sync>> {
    let config = chat_config(args)?;
    let transport = new_chat_client(&config)?;
    info!(
        "Chat client configured: Type={}, Model={}, BaseURL={}",
        config.llm_type,
        transport.model(),
        config.base_url.as_deref().unwrap_or("adapter default")
    );
    Ok(transport)
}

fn pipeline_settings(args: &Args) -> PipelineSettings {
    PipelineSettings {
        google_credentials: args.google_application_credentials.clone(),
        bigquery_project: args.bigquery_project.clone(),
        bigquery_location: args.bigquery_location.clone(),
        serpapi_api_key: args.serpapi_api_key.clone(),
        firecrawl_api_key: args.firecrawl_api_key.clone(),
        scrape_max_chars: args.scrape_max_chars,
        max_iterations: args.max_iterations,
    }
}

fn build_analyst(args: &Args) -> Result<Analyst, Box<dyn Error + Send + Sync>> {
    let transport = chat_transport(args)?;
    let prompts = prompt::load_prompts(args.prompts_path.as_deref())?;
    Ok(Analyst::from_settings(transport, &prompts, &pipeline_settings(args)))
}

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!("--- Core Configuration ---");
    info!("Chat LLM Type: {}", args.chat_llm_type);
    info!("Max Iterations: {}", args.max_iterations);
    info!("Prompts Path: {}", args.prompts_path.as_deref().unwrap_or("built-in"));
    info!("BigQuery Credentials: {}", args.google_application_credentials.as_deref().unwrap_or("not set"));
    info!("-------------------------");

    match &args.command {
        Command::Serve { server_addr, server_api_key, tls_cert_path, tls_key_path, enable_tls } => {
            let analyst = match build_analyst(&args) {
                Ok(analyst) => Some(Arc::new(analyst)),
                Err(e) => {
                    warn!("Report pipeline unavailable: {}", e);
                    None
                }
            };
            let tls = TlsSettings {
                enabled: *enable_tls,
                cert_path: tls_cert_path.clone(),
                key_path: tls_key_path.clone(),
            };
            info!("Starting server on: {}", server_addr);
            let server = Server::new(server_addr.clone(), analyst, server_api_key.clone(), tls);
            server.run().await?;
        }
        Command::Bot { teloxide_token, mainapi_url } => {
            bot::run_bot(teloxide_token.clone(), mainapi_url.clone()).await?;
        }
        Command::Report { prompt } => {
            let analyst = build_analyst(&args)?;
            let report = analyst.call_system(prompt).await?;
            println!("{}", report);
        }
        Command::Query { question } => {
            let transport = chat_transport(&args)?;
            let prompts = prompt::load_prompts(args.prompts_path.as_deref())?;
            let agent = WarehouseAgentTool::from_settings(transport, &prompts, &pipeline_settings(&args));
            let outcome = agent.ask(question).await?;
            println!("{}", outcome.answer);
        }
        Command::Search { query, engine } => {
            let engine: SearchEngine = engine.parse()?;
            let tool = SearchAndScrapeTool::new(
                SerpApiClient::new(args.serpapi_api_key.clone()),
                Arc::new(FirecrawlClient::new(args.firecrawl_api_key.clone()))
            ).with_max_chars(args.scrape_max_chars);
            let results = tool.search_and_scrape(engine, query).await?;
            for result in &results {
                println!("{}", serde_json::to_string_pretty(result)?);
                println!("\n{}\n", "-".repeat(80));
            }
        }
    }

    Ok(())
}
