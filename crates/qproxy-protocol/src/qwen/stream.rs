use serde::Deserialize;

use crate::openai::stream::ToolCallChunk;

/// One upstream SSE payload. The interesting part is `choices[0].delta`;
/// everything else varies across upstream versions and is ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamEvent {
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamChoice {
    #[serde(default)]
    pub delta: StreamDelta,
}

/// Phase-tagged delta. `phase` labels which segment of the answer is being
/// emitted; unknown phases are treated as answer text downstream.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamDelta {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub phase: Option<String>,
    /// "finished" on the terminal event.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCallChunk>>,
}

pub const PHASE_THINKING: &str = "thinking";

impl StreamDelta {
    pub fn is_terminal(&self) -> bool {
        self.status.as_deref() == Some("finished")
    }

    pub fn is_truncated(&self) -> bool {
        self.finish_reason.as_deref() == Some("length")
    }
}

impl StreamEvent {
    pub fn delta(&self) -> Option<&StreamDelta> {
        self.choices.first().map(|choice| &choice.delta)
    }
}
