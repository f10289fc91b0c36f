use bytes::Bytes;
use tracing::debug;

use qproxy_common::now_epoch_seconds;
use qproxy_protocol::openai::stream::{
    ChatCompletionChunk, ChunkChoice, ChunkDelta, ChunkObjectType, FinishReason,
};
use qproxy_protocol::qwen::stream::StreamEvent;
use qproxy_protocol::sse;

use crate::phase::PhaseWriter;

/// Translates upstream phase-tagged SSE payloads into OpenAI chunk frames.
///
/// One translator per response. Completion is convergent: whichever of
/// upstream end, upstream error, or caller finish happens first wins, and
/// `[DONE]` is written at most once.
pub struct ChunkTranslator {
    id: String,
    model: String,
    created: i64,
    phase: PhaseWriter,
    role_sent: bool,
    finished: bool,
    finish_reason: FinishReason,
}

impl ChunkTranslator {
    pub fn new(model: &str) -> Self {
        Self {
            id: ChatCompletionChunk::fresh_id(),
            model: model.to_string(),
            created: now_epoch_seconds(),
            phase: PhaseWriter::new(),
            role_sent: false,
            finished: false,
            finish_reason: FinishReason::Stop,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Translates one upstream `data:` payload. Malformed frames are skipped
    /// without aborting the stream.
    pub fn push_data(&mut self, data: &str) -> Vec<Bytes> {
        if self.finished {
            return Vec::new();
        }
        if data == sse::DONE {
            return self.finish();
        }

        let event: StreamEvent = match serde_json::from_str(data) {
            Ok(event) => event,
            Err(err) => {
                debug!(event = "stream_frame_skipped", error = %err);
                return Vec::new();
            }
        };
        let Some(delta) = event.delta() else {
            return Vec::new();
        };

        if delta.is_terminal() && delta.is_truncated() {
            self.finish_reason = FinishReason::Length;
        }

        let mut frames = Vec::new();
        let has_payload = delta.content.as_deref().is_some_and(|c| !c.is_empty())
            || delta.tool_calls.is_some();
        if !self.role_sent && has_payload {
            self.role_sent = true;
            frames.extend(self.frame(ChunkDelta {
                role: Some("assistant".to_string()),
                ..ChunkDelta::default()
            }));
        }

        if let Some(content) = delta.content.as_deref()
            && !content.is_empty()
        {
            let text = self.phase.render(delta.phase.as_deref(), content);
            if !text.is_empty() {
                frames.extend(self.frame(ChunkDelta {
                    content: Some(text),
                    ..ChunkDelta::default()
                }));
            }
        }

        if let Some(tool_calls) = delta.tool_calls.clone() {
            frames.extend(self.frame(ChunkDelta {
                tool_calls: Some(tool_calls),
                ..ChunkDelta::default()
            }));
        }

        frames
    }

    /// Terminates the stream: closes a dangling thinking section, emits the
    /// finish chunk and `[DONE]`. Calling it again is a no-op.
    pub fn finish(&mut self) -> Vec<Bytes> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let mut frames = Vec::new();
        if let Some(close) = self.phase.close() {
            frames.extend(self.frame(ChunkDelta {
                content: Some(close.to_string()),
                ..ChunkDelta::default()
            }));
        }
        let finish = ChatCompletionChunk::finish(
            &self.id,
            &self.model,
            self.created,
            self.finish_reason,
        );
        frames.extend(sse::json_frame(&finish));
        frames.push(sse::done_frame());
        frames
    }

    /// Mid-stream failure after headers were sent: one synthetic chunk
    /// carrying the error text plus a stop finish, then `[DONE]`.
    pub fn fail(&mut self, message: &str) -> Vec<Bytes> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let mut frames = Vec::new();
        if let Some(close) = self.phase.close() {
            frames.extend(self.frame(ChunkDelta {
                content: Some(close.to_string()),
                ..ChunkDelta::default()
            }));
        }
        let chunk = ChatCompletionChunk {
            id: self.id.clone(),
            object: ChunkObjectType::ChatCompletionChunk,
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    content: Some(message.to_string()),
                    ..ChunkDelta::default()
                },
                finish_reason: Some(FinishReason::Stop),
            }],
        };
        frames.extend(sse::json_frame(&chunk));
        frames.push(sse::done_frame());
        frames
    }

    fn frame(&self, delta: ChunkDelta) -> Option<Bytes> {
        let chunk = ChatCompletionChunk::new(&self.id, &self.model, self.created, delta);
        sse::json_frame(&chunk)
    }
}
