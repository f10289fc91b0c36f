use qproxy_protocol::qwen::stream::PHASE_THINKING;

/// Tracks the thinking phase across deltas so streamed and collected output
/// wrap reasoning text identically. Unknown phases count as answer text.
#[derive(Debug, Default)]
pub(crate) struct PhaseWriter {
    thinking_open: bool,
}

impl PhaseWriter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Renders one delta's text, inserting `<think>`/`</think>` at phase
    /// boundaries.
    pub(crate) fn render(&mut self, phase: Option<&str>, content: &str) -> String {
        let thinking = phase == Some(PHASE_THINKING);
        let mut out = String::with_capacity(content.len() + 8);
        if thinking && !self.thinking_open {
            out.push_str("<think>");
            self.thinking_open = true;
        } else if !thinking && self.thinking_open {
            out.push_str("</think>");
            self.thinking_open = false;
        }
        out.push_str(content);
        out
    }

    /// Closes a dangling thinking section at end of stream.
    pub(crate) fn close(&mut self) -> Option<&'static str> {
        if self.thinking_open {
            self.thinking_open = false;
            Some("</think>")
        } else {
            None
        }
    }
}
