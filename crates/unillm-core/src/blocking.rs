//! Synchronous wrapper around any [`Provider`].
//!
//! Each call blocks the calling thread on a private current-thread runtime
//! until the single outstanding request completes.  Must not be used from
//! inside an async context.

use std::sync::Arc;

use tokio::runtime::{Builder, Runtime};

use crate::error::{LlmError, Result};
use crate::provider::{Provider, ProviderIdentity, StreamEvent};
use crate::runtime::{AgentConfig, AgentResponse, ToolExecutor, react_loop};
use crate::types::{ChatRequest, Message, Response};

/// Blocking facade over an async provider.
pub struct BlockingProvider {
    inner: Arc<dyn Provider>,
    runtime: Runtime,
}

impl BlockingProvider {
    pub fn new(inner: Arc<dyn Provider>) -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| LlmError::Config {
                reason: format!("failed to build blocking runtime: {e}"),
            })?;
        Ok(Self { inner, runtime })
    }

    pub fn chat(&self, request: &ChatRequest) -> Result<Response> {
        self.runtime.block_on(self.inner.chat(request))
    }

    pub fn chat_stream(
        &self,
        request: &ChatRequest,
        mut on_event: impl FnMut(StreamEvent) + Send,
    ) -> Result<Response> {
        self.runtime
            .block_on(self.inner.chat_stream(request, &mut on_event))
    }

    /// Run the tool-use loop to completion.
    pub fn run_tools(
        &self,
        executor: &dyn ToolExecutor,
        messages: &mut Vec<Message>,
        config: &AgentConfig,
    ) -> Result<AgentResponse> {
        let mut ignore = |_event: StreamEvent| {};
        self.runtime.block_on(react_loop(
            self.inner.as_ref(),
            executor,
            messages,
            config,
            &mut ignore,
        ))
    }

    pub fn identity(&self) -> ProviderIdentity {
        self.inner.identity()
    }

    pub fn list_models(&self) -> Vec<String> {
        self.inner.list_models()
    }
}
