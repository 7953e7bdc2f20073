//! Folding provider events into the current state of a streaming session.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::ProviderEvent;

/// Lifecycle state of a streaming session.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StreamingStatus {
    /// No stream, or the last one completed.
    #[default]
    Idle,
    /// A stream is producing output.
    Streaming,
    /// The stream waits for the answer to a question.
    WaitingInput,
    /// The last stream failed or was aborted.
    Error,
}

/// The tool call currently in progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolState {
    /// Tool call id.
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Raw input text, as streamed so far.
    pub input: String,
}

/// A question waiting for the user's answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AskState {
    /// Question id.
    pub id: String,
    /// The question text.
    pub question: String,
    /// Suggested answers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// Current state of a streaming session, as persisted and served to late subscribers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingSnapshot {
    /// Text of the current block.
    pub text_content: String,
    /// Reasoning of the current block.
    pub reasoning_content: String,
    /// Where the session is in its lifecycle.
    pub streaming_status: StreamingStatus,
    /// True between `text-start` and `text-end`.
    pub is_text_streaming: bool,
    /// True between `reasoning-start` and `reasoning-end`.
    pub is_reasoning_streaming: bool,
    /// The tool call in progress.
    pub current_tool: Option<ToolState>,
    /// The question waiting for an answer.
    pub ask_question: Option<AskState>,
}

/// Decides when a changed snapshot is written to storage.
///
/// Forced persists always go through. Other changes are written at most once per interval;
/// a change that arrives inside the window stays pending and is written with the next event
/// after the window has passed.
#[derive(Debug, Clone)]
pub struct PersistDebouncer {
    interval: Duration,
    last_persist: Option<Instant>,
    pending: bool,
}

impl PersistDebouncer {
    /// Creates a debouncer letting one unforced persist through per `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_persist: None,
            pending: false,
        }
    }

    /// Returns true if the state should be persisted now, and records the persist if so.
    pub fn should_persist(&mut self, now: Instant, changed: bool, force: bool) -> bool {
        if !force {
            if !changed && !self.pending {
                return false;
            }
            if let Some(last) = self.last_persist {
                if now.duration_since(last) < self.interval {
                    self.pending = true;
                    return false;
                }
            }
        }
        self.last_persist = Some(now);
        self.pending = false;
        true
    }

    /// Returns true if a change was held back by the debounce window.
    pub fn has_pending(&self) -> bool {
        self.pending
    }

    /// Returns the time of the last persist.
    pub fn last_persist(&self) -> Option<Instant> {
        self.last_persist
    }
}

/// Session scoped state built from a provider's event stream.
#[derive(Debug, Clone)]
pub struct StreamingStateAccumulator {
    snapshot: StreamingSnapshot,
    debouncer: PersistDebouncer,
}

impl StreamingStateAccumulator {
    /// Creates an idle accumulator whose persists are debounced by `debounce`.
    pub fn new(debounce: Duration) -> Self {
        Self {
            snapshot: StreamingSnapshot::default(),
            debouncer: PersistDebouncer::new(debounce),
        }
    }

    /// Returns the current state.
    pub fn snapshot(&self) -> &StreamingSnapshot {
        &self.snapshot
    }

    /// Consumes the accumulator, returning the current state.
    pub fn into_snapshot(self) -> StreamingSnapshot {
        self.snapshot
    }

    /// Returns the debouncer deciding when the state is persisted.
    pub fn debouncer_mut(&mut self) -> &mut PersistDebouncer {
        &mut self.debouncer
    }

    /// Folds `event` into the state, returning true if the state changed.
    pub fn apply(&mut self, event: &ProviderEvent) -> bool {
        let state = &mut self.snapshot;
        match event {
            ProviderEvent::SessionCreated { .. } => set_status(state, StreamingStatus::Streaming),
            ProviderEvent::TextStart => {
                state.text_content.clear();
                state.is_text_streaming = true;
                set_status(state, StreamingStatus::Streaming);
                true
            }
            ProviderEvent::TextDelta { text } => {
                state.text_content.push_str(text);
                let status = set_status(state, StreamingStatus::Streaming);
                status || !text.is_empty()
            }
            ProviderEvent::TextEnd => std::mem::replace(&mut state.is_text_streaming, false),
            ProviderEvent::ReasoningStart => {
                state.reasoning_content.clear();
                state.is_reasoning_streaming = true;
                set_status(state, StreamingStatus::Streaming);
                true
            }
            ProviderEvent::ReasoningDelta { text } => {
                state.reasoning_content.push_str(text);
                let status = set_status(state, StreamingStatus::Streaming);
                status || !text.is_empty()
            }
            ProviderEvent::ReasoningEnd => {
                std::mem::replace(&mut state.is_reasoning_streaming, false)
            }
            ProviderEvent::ToolCall { id, name, input } => {
                state.current_tool = Some(ToolState {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                });
                true
            }
            ProviderEvent::ToolInputDelta { text } => match &mut state.current_tool {
                Some(tool) if !text.is_empty() => {
                    tool.input.push_str(text);
                    true
                }
                _ => false,
            },
            ProviderEvent::ToolResult { .. } | ProviderEvent::ToolError { .. } => {
                state.current_tool.take().is_some()
            }
            ProviderEvent::AskQuestionStart {
                id,
                question,
                options,
            } => {
                state.ask_question = Some(AskState {
                    id: id.clone(),
                    question: question.clone(),
                    options: options.clone(),
                });
                state.streaming_status = StreamingStatus::WaitingInput;
                true
            }
            ProviderEvent::AskQuestionAnswered { .. } => {
                let cleared = state.ask_question.take().is_some();
                set_status(state, StreamingStatus::Streaming) || cleared
            }
            ProviderEvent::Error { .. } => {
                finish(state);
                state.streaming_status = StreamingStatus::Error;
                true
            }
            ProviderEvent::Complete => {
                finish(state);
                state.streaming_status = StreamingStatus::Idle;
                true
            }
        }
    }
}

fn set_status(state: &mut StreamingSnapshot, status: StreamingStatus) -> bool {
    std::mem::replace(&mut state.streaming_status, status) != status
}

fn finish(state: &mut StreamingSnapshot) {
    state.is_text_streaming = false;
    state.is_reasoning_streaming = false;
    state.current_tool = None;
    state.ask_question = None;
}
