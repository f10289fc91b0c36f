use std::collections::BTreeMap;

use tracing::debug;

use qproxy_common::now_epoch_seconds;
use qproxy_protocol::openai::response::{
    AssistantMessage, AssistantToolCall, AssistantToolCallFunction, ChatCompletionResponse,
    CompletionChoice, CompletionObjectType,
};
use qproxy_protocol::openai::stream::{ChatCompletionChunk, FinishReason, ToolCallChunk};
use qproxy_protocol::qwen::stream::StreamEvent;
use qproxy_protocol::sse;

use crate::phase::PhaseWriter;

#[derive(Debug, Default)]
struct ToolCallState {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Aggregates the same upstream SSE the streaming path consumes into a
/// single buffered completion. Thinking text is wrapped identically, so the
/// collected content matches the streamed concatenation.
pub struct CompletionCollector {
    id: String,
    model: String,
    created: i64,
    phase: PhaseWriter,
    content: String,
    tool_calls: BTreeMap<i64, ToolCallState>,
    finish_reason: FinishReason,
    done: bool,
}

impl CompletionCollector {
    pub fn new(model: &str) -> Self {
        Self {
            id: ChatCompletionChunk::fresh_id(),
            model: model.to_string(),
            created: now_epoch_seconds(),
            phase: PhaseWriter::new(),
            content: String::new(),
            tool_calls: BTreeMap::new(),
            finish_reason: FinishReason::Stop,
            done: false,
        }
    }

    pub fn push_data(&mut self, data: &str) {
        if self.done {
            return;
        }
        if data == sse::DONE {
            self.done = true;
            return;
        }

        let event: StreamEvent = match serde_json::from_str(data) {
            Ok(event) => event,
            Err(err) => {
                debug!(event = "collect_frame_skipped", error = %err);
                return;
            }
        };
        let Some(delta) = event.delta() else {
            return;
        };

        if delta.is_terminal() && delta.is_truncated() {
            self.finish_reason = FinishReason::Length;
        }

        if let Some(content) = delta.content.as_deref()
            && !content.is_empty()
        {
            self.content
                .push_str(&self.phase.render(delta.phase.as_deref(), content));
        }

        if let Some(tool_calls) = &delta.tool_calls {
            for tool_call in tool_calls {
                self.merge_tool_call(tool_call);
            }
        }
    }

    fn merge_tool_call(&mut self, chunk: &ToolCallChunk) {
        let entry = self.tool_calls.entry(chunk.index).or_default();
        if chunk.id.is_some() {
            entry.id = chunk.id.clone();
        }
        if let Some(function) = &chunk.function {
            if let Some(name) = &function.name {
                entry.name = Some(name.clone());
            }
            if let Some(arguments) = &function.arguments {
                entry.arguments.push_str(arguments);
            }
        }
    }

    /// Builds the final completion. A dropped upstream connection still
    /// yields whatever was collected, finished with `stop`.
    pub fn finalize(mut self) -> ChatCompletionResponse {
        if let Some(close) = self.phase.close() {
            self.content.push_str(close);
        }

        let tool_calls = if self.tool_calls.is_empty() {
            None
        } else {
            Some(
                self.tool_calls
                    .iter()
                    .map(|(index, state)| AssistantToolCall {
                        id: state
                            .id
                            .clone()
                            .unwrap_or_else(|| format!("tool_call_0_{index}")),
                        kind: "function".to_string(),
                        function: AssistantToolCallFunction {
                            name: state.name.clone().unwrap_or_else(|| "tool".to_string()),
                            arguments: state.arguments.clone(),
                        },
                    })
                    .collect(),
            )
        };

        ChatCompletionResponse {
            id: self.id,
            object: CompletionObjectType::ChatCompletion,
            created: self.created,
            model: self.model,
            choices: vec![CompletionChoice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant".to_string(),
                    content: self.content,
                    tool_calls,
                },
                finish_reason: self.finish_reason,
            }],
        }
    }
}
