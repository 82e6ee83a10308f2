use log::{ debug, info, warn };
use thiserror::Error;
use uuid::Uuid;

use crate::llm::chat::{ ChatError, ChatTransport, TurnRequest };
use crate::models::chat::{ Message, TokenUsage, Transcript };
use crate::tools::validate::{ validated_value, VALIDATE_JSON };
use crate::tools::ToolRegistry;

pub const DEFAULT_MAX_ITERATIONS: usize = 25;

pub const JSON_NUDGE: &str =
    "Please validate your response is properly formatted JSON. Respond only with a json or the function will fail.";

/// What ends a tool loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCondition {
    /// The first reply without a tool call is the answer.
    FinalText,
    /// Only a successful `validate_json` call ends the loop; its decoded value is the answer.
    ValidatedJson,
    /// As `ValidatedJson`, but a usable result from the named tool also ends the
    /// loop and is returned verbatim. Results starting with `ERROR` or no longer
    /// than two characters (`[]`, `{}`) do not count.
    ValidatedJsonOrToolResult(&'static str),
}

impl ExitCondition {
    fn wants_validated_json(self) -> bool {
        !matches!(self, ExitCondition::FinalText)
    }

    fn finishing_tool(self) -> Option<&'static str> {
        match self {
            ExitCondition::ValidatedJsonOrToolResult(name) => Some(name),
            _ => None,
        }
    }
}

fn is_usable_result(content: &str) -> bool {
    !content.starts_with("ERROR") && content.chars().count() > 2
}

pub struct LoopConfig<'a> {
    pub registry: &'a ToolRegistry,
    pub max_iterations: usize,
    pub exit: ExitCondition,
}

impl<'a> LoopConfig<'a> {
    pub fn new(registry: &'a ToolRegistry) -> Self {
        Self { registry, max_iterations: DEFAULT_MAX_ITERATIONS, exit: ExitCondition::FinalText }
    }

    pub fn with_exit(mut self, exit: ExitCondition) -> Self {
        self.exit = exit;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }
}

#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub answer: String,
    pub iterations: usize,
    pub usage: TokenUsage,
    pub transcript: Transcript,
}

#[derive(Debug, Error)]
pub enum LoopError {
    #[error(transparent)]
    Transport(#[from] ChatError),
    #[error("Tool loop did not reach an answer within {max_iterations} turns")]
    NotConverged {
        max_iterations: usize,
    },
}

/// Drives one conversation: send the transcript, run whatever tools the model
/// asks for, feed their results back, and stop on the configured exit.
/// Tool failures never abort the loop; their text goes back to the model.
pub async fn run_tool_loop(
    transport: &dyn ChatTransport,
    system: &str,
    prompt: &str,
    config: &LoopConfig<'_>
) -> Result<LoopOutcome, LoopError> {
    let run_id = Uuid::new_v4();
    info!(
        "[{}] Tool loop start: provider={}, model={}, tools=[{}], exit={:?}",
        run_id,
        transport.provider(),
        transport.model(),
        config.registry.names().join(", "),
        config.exit
    );

    let mut transcript = Transcript::new();
    transcript.push(Message::user(prompt));
    let mut usage = TokenUsage::default();

    for iteration in 1..=config.max_iterations {
        let request = TurnRequest {
            system,
            transcript: &transcript,
            tools: config.registry.descriptors(),
        };
        let reply = transport.complete_turn(&request).await?;
        usage += reply.usage;

        if !reply.requests_tools() {
            match config.exit {
                ExitCondition::FinalText => {
                    info!("[{}] Final answer after {} turns", run_id, iteration);
                    transcript.push(Message::assistant(reply.text.clone(), Vec::new()));
                    return Ok(LoopOutcome { answer: reply.text, iterations: iteration, usage, transcript });
                }
                ExitCondition::ValidatedJson | ExitCondition::ValidatedJsonOrToolResult(_) => {
                    debug!("[{}] Reply without tool call, asking for validated JSON", run_id);
                    transcript.push(Message::assistant(reply.text, Vec::new()));
                    transcript.push(Message::user(JSON_NUDGE));
                    continue;
                }
            }
        }

        transcript.push(Message::assistant(reply.text, reply.tool_calls.clone()));

        let mut answer = None;
        for call in &reply.tool_calls {
            let outcome = config.registry.dispatch(call).await;
            if answer.is_none() && !outcome.is_error {
                if config.exit.wants_validated_json() && call.name == VALIDATE_JSON {
                    answer = validated_value(&outcome.content).map(|value| value.to_string());
                } else if
                    config.exit.finishing_tool() == Some(call.name.as_str()) &&
                    is_usable_result(&outcome.content)
                {
                    debug!("[{}] {} returned a usable result, ending loop", run_id, call.name);
                    answer = Some(outcome.content.clone());
                }
            }
            transcript.push(Message::tool_result(call.id.clone(), outcome.content, outcome.is_error));
        }

        if let Some(answer) = answer {
            info!("[{}] Answer after {} turns", run_id, iteration);
            return Ok(LoopOutcome { answer, iterations: iteration, usage, transcript });
        }
    }

    warn!("[{}] No answer after {} turns", run_id, config.max_iterations);
    Err(LoopError::NotConverged { max_iterations: config.max_iterations })
}
