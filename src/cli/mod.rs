use clap::{ Parser, Subcommand };

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    // --- Chat LLM Provider Args ---
    /// Type of LLM provider for the tool loop (anthropic, openai)
    #[arg(long, env = "CHAT_LLM_TYPE", default_value = "anthropic", global = true)]
    pub chat_llm_type: String,

    /// Base URL for the Chat LLM provider API (e.g., an OpenAI-compatible Llama endpoint)
    #[arg(long, env = "CHAT_BASE_URL", global = true)] // No default, let adapters handle defaults if None
    pub chat_base_url: Option<String>,

    /// API Key for the Chat LLM provider
    #[arg(long, env = "CHAT_API_KEY", default_value = "", hide_env_values = true, global = true)]
    pub chat_api_key: String,

    /// Model name for chat completion (e.g., claude-3-5-sonnet-latest, gpt-4o-mini)
    #[arg(long, env = "CHAT_MODEL", global = true)] // No default, rely on adapter defaults if None
    pub chat_model: Option<String>,

    /// Maximum tokens per model reply.
    #[arg(long, env = "CHAT_MAX_TOKENS", default_value = "8192", global = true)]
    pub chat_max_tokens: u32,

    /// Maximum model turns before a tool loop gives up.
    #[arg(long, env = "MAX_ITERATIONS", default_value = "25", global = true)]
    pub max_iterations: usize,

    // --- Data Source Args ---
    /// Path to the Google service account key used for BigQuery.
    #[arg(long, env = "GOOGLE_APPLICATION_CREDENTIALS", global = true)]
    pub google_application_credentials: Option<String>,

    /// BigQuery project to run queries in. Defaults to the key file's project_id.
    #[arg(long, env = "BIGQUERY_PROJECT", global = true)]
    pub bigquery_project: Option<String>,

    /// BigQuery location of the dataset (e.g., US, EU).
    #[arg(long, env = "BIGQUERY_LOCATION", global = true)]
    pub bigquery_location: Option<String>,

    /// SerpAPI key for web search.
    #[arg(long, env = "SERPAPI_API_KEY", hide_env_values = true, global = true)]
    pub serpapi_api_key: Option<String>,

    /// Firecrawl key for page scraping.
    #[arg(long, env = "FIRECRAWL_API_KEY", hide_env_values = true, global = true)]
    pub firecrawl_api_key: Option<String>,

    /// Characters of scraped markdown kept per page.
    #[arg(long, env = "SCRAPE_MAX_CHARS", default_value = "20000", global = true)]
    pub scrape_max_chars: usize,

    // --- General App Args ---
    /// Optional JSON file overriding any of: instructions, query_gen, data_dictionary.
    #[arg(long, env = "PROMPTS_PATH", global = true)]
    pub prompts_path: Option<String>,

    /// Enable debug logging/output
    #[arg(long, env = "DEBUG", default_value = "false", global = true)]
    pub debug: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the HTTP API (POST /echo, POST /report).
    Serve {
        /// Host address and port for the server to listen on.
        #[arg(long, env = "SERVER_ADDR", default_value = "0.0.0.0:8000")]
        server_addr: String,

        /// Optional API Key required in the X-API-Key header for POST /report.
        #[arg(long, env = "SERVER_API_KEY", hide_env_values = true)]
        server_api_key: Option<String>,

        /// Optional path to the TLS certificate file (PEM format). Requires --tls-key-path.
        #[arg(long, env = "TLS_CERT_PATH")]
        tls_cert_path: Option<String>,

        /// Optional path to the TLS private key file (PEM format). Requires --tls-cert-path.
        #[arg(long, env = "TLS_KEY_PATH")]
        tls_key_path: Option<String>,

        #[arg(long, env = "ENABLE_TLS", default_value = "false")]
        enable_tls: bool,
    },
    /// Run the Telegram bot that relays messages to the HTTP API.
    Bot {
        /// Telegram bot token.
        #[arg(long, env = "TELOXIDE_TOKEN", default_value = "", hide_env_values = true)]
        teloxide_token: String,

        /// Endpoint the bot posts user messages to.
        #[arg(long, env = "MAINAPI_URL", default_value = "http://mainapi:8000/echo")]
        mainapi_url: String,
    },
    /// Write one intelligence report and print it.
    Report {
        prompt: String,
    },
    /// Answer a question from the data warehouse and print the validated JSON.
    Query {
        question: String,
    },
    /// Search one engine, scrape every result and print them.
    Search {
        query: String,

        /// google, baidu or yandex
        #[arg(long, default_value = "google")]
        engine: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_subcommand_takes_prompt() {
        let args = Args::try_parse_from(["intel-report", "report", "What is happening in Kharkiv?"]).unwrap();
        match args.command {
            Command::Report { prompt } => assert_eq!(prompt, "What is happening in Kharkiv?"),
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(args.max_iterations, 25);
    }

    #[test]
    fn global_options_follow_the_subcommand() {
        let args = Args::try_parse_from([
            "intel-report",
            "search",
            "выборы",
            "--engine",
            "yandex",
            "--scrape-max-chars",
            "500",
        ]).unwrap();
        assert_eq!(args.scrape_max_chars, 500);
        assert!(matches!(args.command, Command::Search { ref engine, .. } if engine == "yandex"));
    }
}
