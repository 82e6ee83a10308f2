use crate::models::echo::TextPayload;
use log::{ error, info };
use std::error::Error;
use std::sync::Arc;
use teloxide::prelude::*;

pub const ERROR_REPLY: &str = "Error: Unable to process your request.";

pub const HELP_MESSAGE: &str =
    "Send me a question and I will pass it to the analysis service and reply with its answer.\n\n\
     Commands:\n/help - show this message\n/start - show this message";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Incoming<'a> {
    Help,
    Text(&'a str),
    Ignored,
}

/// Sorts an incoming chat message: `/help` and `/start` (optionally addressed
/// as `/help@bot_name`) get the help text, other text is relayed.
pub fn classify(text: Option<&str>) -> Incoming<'_> {
    let Some(text) = text.map(str::trim).filter(|t| !t.is_empty()) else {
        return Incoming::Ignored;
    };
    let command = text.split_whitespace().next().unwrap_or_default();
    let command = command.split('@').next().unwrap_or_default();
    match command {
        "/help" | "/start" => Incoming::Help,
        _ => Incoming::Text(text),
    }
}

/// Client for the HTTP API the bot forwards messages to.
#[derive(Clone)]
pub struct MainApiClient {
    http: reqwest::Client,
    url: String,
}

impl MainApiClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self { http: reqwest::Client::new(), url: url.into() }
    }

    /// Posts `{"text": ...}` and returns the reply's `text`, or the generic
    /// error reply when the service does not answer 200.
    pub async fn relay(&self, text: &str) -> String {
        let resp = match self.http.post(&self.url).json(&TextPayload::new(text)).send().await {
            Ok(resp) => resp,
            Err(e) => {
                error!("Request to {} failed: {}", self.url, e);
                return ERROR_REPLY.to_string();
            }
        };

        if resp.status() != reqwest::StatusCode::OK {
            error!("Request failed with status code {}", resp.status().as_u16());
            return ERROR_REPLY.to_string();
        }

        match resp.json::<serde_json::Value>().await {
            Ok(body) =>
                body
                    .get("text")
                    .and_then(|t| t.as_str())
                    .unwrap_or_default()
                    .to_string(),
            Err(e) => {
                error!("Unreadable reply from {}: {}", self.url, e);
                ERROR_REPLY.to_string()
            }
        }
    }
}

pub async fn run_bot(token: String, mainapi_url: String) -> Result<(), Box<dyn Error + Send + Sync>> {
    if token.trim().is_empty() {
        return Err("TELOXIDE_TOKEN is not set".into());
    }
    info!("Starting Telegram bot, forwarding messages to {}", mainapi_url);

    let bot = Bot::new(token);
    let api = Arc::new(MainApiClient::new(mainapi_url));

    teloxide::repl(bot, move |bot: Bot, msg: Message| {
        let api = api.clone();
        async move {
            let reply = match classify(msg.text()) {
                Incoming::Help => HELP_MESSAGE.to_string(),
                Incoming::Text(text) => {
                    info!("{}", text);
                    api.relay(text).await
                }
                Incoming::Ignored => {
                    return respond(());
                }
            };
            bot.send_message(msg.chat.id, reply).await?;
            respond(())
        }
    }).await;

    Ok(())
}
