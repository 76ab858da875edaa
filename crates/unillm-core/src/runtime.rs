//! Tool-use loop.
//!
//! Sends the conversation to a provider, and when the model answers with
//! tool-use blocks, executes them and feeds the results back.  This repeats
//! until the model produces a response with no tool use or the turn limit is
//! reached.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{LlmError, Result};
use crate::http::cancellable;
use crate::provider::{Provider, StreamCallback};
use crate::types::{ChatRequest, Message, Response, Tool, ToolCall};

/// Default cap on model responses per run.
pub const DEFAULT_MAX_TURNS: u32 = 20;

// ---------------------------------------------------------------------------
// Tool executor trait
// ---------------------------------------------------------------------------

/// Something that can run the tools a model asks for.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Tool definitions advertised to the model.
    fn tools(&self) -> Vec<Tool>;

    /// Run one tool call, returning its output as text.
    async fn execute(&self, call: &ToolCall) -> Result<String>;
}

/// An executor with no tools.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTools;

#[async_trait]
impl ToolExecutor for NoTools {
    fn tools(&self) -> Vec<Tool> {
        Vec::new()
    }

    async fn execute(&self, call: &ToolCall) -> Result<String> {
        Err(unknown_tool(&call.name))
    }
}

/// Routes each call to the executor that advertises the tool.
#[derive(Default, Clone)]
pub struct ToolSet {
    executors: Vec<Arc<dyn ToolExecutor>>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, executor: Arc<dyn ToolExecutor>) -> Self {
        self.executors.push(executor);
        self
    }

    fn find_executor(&self, tool_name: &str) -> Option<&Arc<dyn ToolExecutor>> {
        self.executors
            .iter()
            .find(|e| e.tools().iter().any(|t| t.name == tool_name))
    }
}

#[async_trait]
impl ToolExecutor for ToolSet {
    fn tools(&self) -> Vec<Tool> {
        self.executors.iter().flat_map(|e| e.tools()).collect()
    }

    async fn execute(&self, call: &ToolCall) -> Result<String> {
        let executor = self
            .find_executor(&call.name)
            .ok_or_else(|| unknown_tool(&call.name))?;
        executor.execute(call).await
    }
}

fn unknown_tool(name: &str) -> LlmError {
    LlmError::ToolExecution {
        tool_name: name.to_owned(),
        reason: "unknown tool".into(),
    }
}

// ---------------------------------------------------------------------------
// Configuration and result
// ---------------------------------------------------------------------------

/// Configuration for one tool-use run.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Maximum number of model responses.  Prevents infinite loops.
    pub max_turns: u32,

    pub system_prompt: Option<String>,

    /// Model override; the provider default when `None`.
    pub model: Option<String>,

    /// Per-response token cap; 0 uses the provider default.
    pub max_tokens: u32,

    pub temperature: Option<f32>,

    /// Use `chat_stream` and forward its events.
    pub stream: bool,

    pub cancel: CancellationToken,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: DEFAULT_MAX_TURNS,
            system_prompt: None,
            model: None,
            max_tokens: 0,
            temperature: None,
            stream: false,
            cancel: CancellationToken::new(),
        }
    }
}

/// The final result of a tool-use run.
#[derive(Debug, Clone)]
pub struct AgentResponse {
    /// Text of the final response.
    pub text: String,

    /// Number of model responses received.
    pub turns_used: u32,

    /// Every tool call executed, in order.
    pub tool_calls: Vec<ToolCall>,

    /// The last model response.
    pub response: Response,

    pub run_id: Uuid,
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

/// Run the tool-use loop over `messages`.
///
/// 1. Sends the conversation and the executor's tools to `provider`.
/// 2. A response without tool use ends the run.
/// 3. Otherwise the response is echoed as an assistant message, each tool
///    is executed in order, and one tool-result message per call is
///    appended (error-flagged when the tool failed).
/// 4. Repeats until `max_turns` responses have been received; tools
///    requested by the last allowed response are not run.
///
/// `messages` is the working conversation and holds the full history
/// afterwards.  `on_event` receives stream events when `config.stream` is
/// set.
///
/// # Errors
///
/// [`LlmError::TurnLimitExceeded`] when the cap is hit; provider errors and
/// cancellation propagate unchanged.  Tool failures do not abort the run.
pub async fn react_loop(
    provider: &dyn Provider,
    executor: &dyn ToolExecutor,
    messages: &mut Vec<Message>,
    config: &AgentConfig,
    on_event: &mut StreamCallback<'_>,
) -> Result<AgentResponse> {
    let tools = executor.tools();
    let run_id = Uuid::now_v7();
    let max_turns = config.max_turns;
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    tracing::info!(
        run_id = %run_id,
        provider = %provider.identity().kind,
        max_turns,
        tool_count = tools.len(),
        "starting tool-use loop"
    );

    for turn in 0..max_turns {
        tracing::debug!(turn, "tool-use turn start");

        let mut request = ChatRequest::new(messages.clone())
            .with_tools(tools.clone())
            .with_max_tokens(config.max_tokens)
            .with_cancel(config.cancel.clone());
        request.system_prompt = config.system_prompt.clone();
        request.model = config.model.clone();
        request.temperature = config.temperature;

        let response = if config.stream {
            provider.chat_stream(&request, on_event).await?
        } else {
            provider.chat(&request).await?
        };
        let turns_used = turn + 1;

        messages.push(Message::assistant_blocks(response.content.clone()));

        let calls: Vec<ToolCall> = response.tool_calls().into_iter().cloned().collect();
        if calls.is_empty() {
            tracing::info!(
                run_id = %run_id,
                turns = turns_used,
                "tool-use loop completed"
            );
            return Ok(AgentResponse {
                text: response.text(),
                turns_used,
                tool_calls,
                response,
                run_id,
            });
        }

        if turns_used == max_turns {
            tracing::warn!(
                run_id = %run_id,
                max_turns,
                pending_tools = calls.len(),
                "turn limit reached with tool calls pending"
            );
            return Err(LlmError::TurnLimitExceeded { max_turns });
        }

        tracing::info!(
            run_id = %run_id,
            turn,
            tool_count = calls.len(),
            tools = ?calls.iter().map(|c| &c.name).collect::<Vec<_>>(),
            "model requested tool calls"
        );

        for call in calls {
            let (content, is_error) = run_tool(executor, &call, &config.cancel).await?;
            messages.push(Message::tool_result(&call.id, content, is_error));
            tool_calls.push(call);
        }
    }

    Err(LlmError::TurnLimitExceeded { max_turns })
}

/// Execute one call.  Tool failures become error-flagged output; only
/// cancellation is returned as an error.
async fn run_tool(
    executor: &dyn ToolExecutor,
    call: &ToolCall,
    cancel: &CancellationToken,
) -> Result<(String, bool)> {
    tracing::debug!(tool = %call.name, id = %call.id, "executing tool");

    match cancellable(cancel, executor.execute(call)).await? {
        Ok(output) => Ok((output, false)),
        Err(e) => {
            tracing::warn!(tool = %call.name, error = %e, "tool execution failed");
            Ok((format!("Error: {e}"), true))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
