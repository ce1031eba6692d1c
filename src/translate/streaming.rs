//! Incremental transcoding of upstream SSE streams into the client's dialect.
//!
//! Each upstream dialect has a decoder turning SSE frames into canonical
//! [`StreamEvent`]s, and each client dialect has an encoder turning canonical
//! events back into SSE frames. [`StreamTranscoder`] glues one of each together
//! and owns the stream lifecycle: exactly one terminal event, then the
//! `[DONE]` sentinel, then silence.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;

use super::anthropic_types::{
    Delta, DeltaUsage, ErrorBody, ErrorResponse, MessageDeltaBody, MessagesResponse,
    ResponseContentBlock, StreamEvent as AnthropicEvent, Usage as AnthropicUsage,
};
use super::canonical::StopReason;
use super::openai_types::{
    ChatCompletionChunk, ChatErrorResponse, ChatUsage, ChunkChoice, ChunkDelta, ChunkToolCall,
    ChunkToolCallFunction,
};
use super::response::openai_error_to_envelope;
use super::{Dialect, STREAM_SENTINEL};
use crate::error::{GatewayError, Result};

/// Dialect-neutral stream event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    MessageStart {
        id: Option<String>,
        model: Option<String>,
    },
    ContentDelta(ContentDelta),
    /// One argument fragment of tool call `index`. `id`/`name` arrive with the
    /// first fragment only.
    ToolCallDelta {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments: String,
    },
    ToolCallEnd {
        index: usize,
    },
    Usage {
        input_tokens: Option<u64>,
        output_tokens: Option<u64>,
    },
    MessageStop {
        stop_reason: Option<StopReason>,
        stop_sequence: Option<String>,
    },
    Error(ErrorBody),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentDelta {
    Text(String),
    Thinking(String),
    Signature(String),
}

/// Tool call being assembled from streamed argument fragments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccumulatedToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
    finished: bool,
}

impl AccumulatedToolCall {
    fn push(&mut self, id: Option<&str>, name: Option<&str>, fragment: &str) {
        if self.finished {
            return;
        }
        if let Some(id) = id.filter(|s| !s.is_empty()) {
            self.id = id.to_string();
        }
        if let Some(name) = name.filter(|s| !s.is_empty()) {
            self.name = name.to_string();
        }
        self.arguments.push_str(fragment);
    }

    fn finish(&mut self) {
        self.finished = true;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// One outgoing SSE frame.
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    pub event: Option<&'static str>,
    pub data: String,
}

impl SseFrame {
    pub fn to_bytes(&self) -> Bytes {
        match self.event {
            Some(name) => Bytes::from(format!("event: {name}\ndata: {}\n\n", self.data)),
            None => Bytes::from(format!("data: {}\n\n", self.data)),
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Decoders
// ---------------------------------------------------------------------------

/// Decodes `OpenAI` `chat.completion.chunk` frames.
///
/// The finish reason is held back until `[DONE]` (or end of stream) because
/// providers send the usage chunk after the chunk carrying `finish_reason`.
#[derive(Debug, Default)]
pub struct OpenAiDecoder {
    started: bool,
    done: bool,
    pending_stop: Option<StopReason>,
    tool_indices: Vec<usize>,
}

impl OpenAiDecoder {
    pub fn decode(&mut self, data: &str) -> Result<Vec<StreamEvent>> {
        if self.done {
            return Ok(Vec::new());
        }
        let data = data.trim();
        if data == "[DONE]" {
            return Ok(self.complete());
        }
        if data.is_empty() {
            return Ok(Vec::new());
        }

        let value: serde_json::Value = serde_json::from_str(data)
            .map_err(|e| GatewayError::conversion(format!("Malformed upstream chunk: {e}")))?;

        if value.get("error").is_some() {
            let err: ChatErrorResponse = serde_json::from_value(value)
                .map_err(|e| GatewayError::conversion(format!("Malformed upstream error: {e}")))?;
            self.done = true;
            return Ok(vec![StreamEvent::Error(openai_error_to_envelope(&err).error)]);
        }

        let chunk: ChatCompletionChunk = serde_json::from_value(value)
            .map_err(|e| GatewayError::conversion(format!("Unexpected upstream chunk: {e}")))?;

        let mut events = Vec::new();

        if !self.started {
            self.started = true;
            events.push(StreamEvent::MessageStart {
                id: Some(chunk.id.trim_start_matches("chatcmpl-").to_string())
                    .filter(|s| !s.is_empty()),
                model: Some(chunk.model.clone()).filter(|s| !s.is_empty()),
            });
        }

        if let Some(usage) = &chunk.usage {
            events.push(StreamEvent::Usage {
                input_tokens: Some(usage.prompt_tokens),
                output_tokens: Some(usage.completion_tokens),
            });
        }

        let Some(choice) = chunk.choices.first() else {
            return Ok(events);
        };

        if let Some(reasoning) = choice.delta.reasoning_content.as_deref() {
            if !reasoning.is_empty() {
                events.push(StreamEvent::ContentDelta(ContentDelta::Thinking(
                    reasoning.to_string(),
                )));
            }
        }

        if let Some(content) = choice.delta.content.as_deref() {
            if !content.is_empty() {
                events.push(StreamEvent::ContentDelta(ContentDelta::Text(
                    content.to_string(),
                )));
            }
        }

        for tc in choice.delta.tool_calls.iter().flatten() {
            let index = tc.index as usize;
            if !self.tool_indices.contains(&index) {
                self.tool_indices.push(index);
            }
            let function = tc.function.as_ref();
            events.push(StreamEvent::ToolCallDelta {
                index,
                id: tc.id.clone(),
                name: function.and_then(|f| f.name.clone()),
                arguments: function
                    .and_then(|f| f.arguments.clone())
                    .unwrap_or_default(),
            });
        }

        if let Some(reason) = choice.finish_reason.as_deref() {
            self.pending_stop = Some(StopReason::from_wire(Dialect::OpenAi, reason));
        }

        Ok(events)
    }

    /// Upstream closed the connection. Without `[DONE]` or a finish reason the
    /// response was cut short, which is reported rather than passed off as a stop.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if !self.done && self.pending_stop.is_none() {
            self.done = true;
            return vec![StreamEvent::Error(truncated_stream_error())];
        }
        self.complete()
    }

    /// Close open tool calls and emit the stop.
    fn complete(&mut self) -> Vec<StreamEvent> {
        if self.done {
            return Vec::new();
        }
        self.done = true;

        let mut events = Vec::new();
        if !self.started {
            self.started = true;
            events.push(StreamEvent::MessageStart {
                id: None,
                model: None,
            });
        }
        events.extend(
            self.tool_indices
                .drain(..)
                .map(|index| StreamEvent::ToolCallEnd { index }),
        );
        events.push(StreamEvent::MessageStop {
            stop_reason: self.pending_stop.take(),
            stop_sequence: None,
        });
        events
    }
}

/// Decodes Anthropic Messages stream events.
#[derive(Debug, Default)]
pub struct AnthropicDecoder {
    done: bool,
    started: bool,
    /// content block index -> tool ordinal
    tool_blocks: HashMap<usize, usize>,
    pending_stop: Option<StopReason>,
    pending_stop_sequence: Option<String>,
}

impl AnthropicDecoder {
    pub fn decode(&mut self, data: &str) -> Result<Vec<StreamEvent>> {
        if self.done {
            return Ok(Vec::new());
        }
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            return Ok(if data.is_empty() { Vec::new() } else { self.complete() });
        }

        let event: AnthropicEvent = serde_json::from_str(data)
            .map_err(|e| GatewayError::conversion(format!("Malformed upstream event: {e}")))?;

        let events = match event {
            AnthropicEvent::Ping => Vec::new(),
            AnthropicEvent::MessageStart { message } => {
                self.started = true;
                vec![
                    StreamEvent::MessageStart {
                        id: Some(message.id.trim_start_matches("msg_").to_string()),
                        model: Some(message.model),
                    },
                    StreamEvent::Usage {
                        input_tokens: Some(message.usage.input_tokens),
                        output_tokens: None,
                    },
                ]
            }
            AnthropicEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                ResponseContentBlock::ToolUse { id, name, .. } => {
                    let ordinal = self.tool_blocks.len();
                    self.tool_blocks.insert(index, ordinal);
                    vec![StreamEvent::ToolCallDelta {
                        index: ordinal,
                        id: Some(id),
                        name: Some(name),
                        arguments: String::new(),
                    }]
                }
                ResponseContentBlock::Text { text } if !text.is_empty() => {
                    vec![StreamEvent::ContentDelta(ContentDelta::Text(text))]
                }
                ResponseContentBlock::Thinking { thinking, .. } if !thinking.is_empty() => {
                    vec![StreamEvent::ContentDelta(ContentDelta::Thinking(thinking))]
                }
                _ => Vec::new(),
            },
            AnthropicEvent::ContentBlockDelta { index, delta } => match delta {
                Delta::TextDelta { text } => {
                    vec![StreamEvent::ContentDelta(ContentDelta::Text(text))]
                }
                Delta::ThinkingDelta { thinking } => {
                    vec![StreamEvent::ContentDelta(ContentDelta::Thinking(thinking))]
                }
                Delta::SignatureDelta { signature } => {
                    vec![StreamEvent::ContentDelta(ContentDelta::Signature(signature))]
                }
                Delta::InputJsonDelta { partial_json } => {
                    let ordinal = self.tool_blocks.get(&index).copied().ok_or_else(|| {
                        GatewayError::conversion(format!(
                            "input_json_delta for block {index}, which is not a tool_use block"
                        ))
                    })?;
                    vec![StreamEvent::ToolCallDelta {
                        index: ordinal,
                        id: None,
                        name: None,
                        arguments: partial_json,
                    }]
                }
            },
            AnthropicEvent::ContentBlockStop { index } => self
                .tool_blocks
                .get(&index)
                .map(|&ordinal| vec![StreamEvent::ToolCallEnd { index: ordinal }])
                .unwrap_or_default(),
            AnthropicEvent::MessageDelta { delta, usage } => {
                if let Some(reason) = delta.stop_reason.as_deref() {
                    self.pending_stop = Some(StopReason::from_wire(Dialect::Anthropic, reason));
                }
                self.pending_stop_sequence = delta.stop_sequence;
                vec![StreamEvent::Usage {
                    input_tokens: usage.input_tokens,
                    output_tokens: Some(usage.output_tokens),
                }]
            }
            AnthropicEvent::MessageStop => self.complete(),
            AnthropicEvent::Error { error } => {
                self.done = true;
                vec![StreamEvent::Error(error)]
            }
        };

        Ok(events)
    }

    /// Upstream closed the connection; cut short unless a stop reason arrived.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if !self.done && self.pending_stop.is_none() {
            self.done = true;
            return vec![StreamEvent::Error(truncated_stream_error())];
        }
        self.complete()
    }

    fn complete(&mut self) -> Vec<StreamEvent> {
        if self.done {
            return Vec::new();
        }
        self.done = true;

        let mut events = Vec::new();
        if !self.started {
            events.push(StreamEvent::MessageStart {
                id: None,
                model: None,
            });
        }
        events.push(StreamEvent::MessageStop {
            stop_reason: self.pending_stop.take(),
            stop_sequence: self.pending_stop_sequence.take(),
        });
        events
    }
}

fn truncated_stream_error() -> ErrorBody {
    ErrorBody::new("api_error", "Upstream stream ended before the response was complete")
}

// ---------------------------------------------------------------------------
// Encoders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
    Tool(usize),
}

#[derive(Debug, Clone, Copy)]
struct OpenBlock {
    index: usize,
    kind: BlockKind,
}

/// Encodes canonical events as Anthropic SSE events.
///
/// Tool argument fragments are forwarded immediately as `input_json_delta`
/// and also accumulated, so the finished calls are known at the end.
#[derive(Debug)]
pub struct AnthropicEncoder {
    model: String,
    msg_id: String,
    started: bool,
    next_block: usize,
    open: Option<OpenBlock>,
    tool_blocks: HashMap<usize, usize>,
    tool_calls: BTreeMap<usize, AccumulatedToolCall>,
    input_tokens: u64,
    output_tokens: u64,
}

impl AnthropicEncoder {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            msg_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            started: false,
            next_block: 0,
            open: None,
            tool_blocks: HashMap::new(),
            tool_calls: BTreeMap::new(),
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    pub fn encode(&mut self, event: StreamEvent) -> Vec<AnthropicEvent> {
        let mut events = Vec::new();

        if let StreamEvent::Usage {
            input_tokens,
            output_tokens,
        } = &event
        {
            self.input_tokens = input_tokens.unwrap_or(self.input_tokens);
            self.output_tokens = output_tokens.unwrap_or(self.output_tokens);
            return events;
        }

        if !matches!(event, StreamEvent::Error(_)) {
            self.ensure_started(&mut events);
        }

        match event {
            StreamEvent::MessageStart { .. } | StreamEvent::Usage { .. } => {}
            StreamEvent::ContentDelta(ContentDelta::Text(text)) => {
                let index = self.ensure_block(BlockKind::Text, &mut events);
                events.push(AnthropicEvent::ContentBlockDelta {
                    index,
                    delta: Delta::TextDelta { text },
                });
            }
            StreamEvent::ContentDelta(ContentDelta::Thinking(thinking)) => {
                let index = self.ensure_block(BlockKind::Thinking, &mut events);
                events.push(AnthropicEvent::ContentBlockDelta {
                    index,
                    delta: Delta::ThinkingDelta { thinking },
                });
            }
            StreamEvent::ContentDelta(ContentDelta::Signature(signature)) => {
                let index = self.ensure_block(BlockKind::Thinking, &mut events);
                events.push(AnthropicEvent::ContentBlockDelta {
                    index,
                    delta: Delta::SignatureDelta { signature },
                });
            }
            StreamEvent::ToolCallDelta {
                index,
                id,
                name,
                arguments,
            } => {
                let block = match self.tool_blocks.get(&index) {
                    Some(&block) => block,
                    None => {
                        let block = self.open_block(BlockKind::Tool(index), &mut events, |_| {
                            ResponseContentBlock::ToolUse {
                                id: id.clone().unwrap_or_default(),
                                name: name.clone().unwrap_or_default(),
                                input: serde_json::Value::Object(serde_json::Map::new()),
                            }
                        });
                        self.tool_blocks.insert(index, block);
                        block
                    }
                };

                self.tool_calls.entry(index).or_default().push(
                    id.as_deref(),
                    name.as_deref(),
                    &arguments,
                );

                if !arguments.is_empty() {
                    events.push(AnthropicEvent::ContentBlockDelta {
                        index: block,
                        delta: Delta::InputJsonDelta {
                            partial_json: arguments,
                        },
                    });
                }
            }
            StreamEvent::ToolCallEnd { index } => {
                if let Some(call) = self.tool_calls.get_mut(&index) {
                    call.finish();
                }
                if matches!(self.open, Some(OpenBlock { kind: BlockKind::Tool(i), .. }) if i == index)
                {
                    self.close_block(&mut events);
                }
            }
            StreamEvent::MessageStop {
                stop_reason,
                stop_sequence,
            } => {
                self.close_block(&mut events);
                for call in self.tool_calls.values_mut() {
                    call.finish();
                }
                events.push(AnthropicEvent::MessageDelta {
                    delta: MessageDeltaBody {
                        stop_reason: Some(
                            stop_reason
                                .unwrap_or(StopReason::EndTurn)
                                .to_wire(Dialect::Anthropic),
                        ),
                        stop_sequence,
                    },
                    usage: DeltaUsage {
                        input_tokens: Some(self.input_tokens),
                        output_tokens: self.output_tokens,
                    },
                });
                events.push(AnthropicEvent::MessageStop);
            }
            StreamEvent::Error(error) => events.push(AnthropicEvent::Error { error }),
        }

        events
    }

    fn ensure_started(&mut self, events: &mut Vec<AnthropicEvent>) {
        if self.started {
            return;
        }
        self.started = true;
        events.push(AnthropicEvent::MessageStart {
            message: MessagesResponse {
                id: self.msg_id.clone(),
                response_type: "message".to_string(),
                role: "assistant".to_string(),
                content: Vec::new(),
                model: self.model.clone(),
                stop_reason: None,
                stop_sequence: None,
                usage: AnthropicUsage {
                    input_tokens: self.input_tokens,
                    ..AnthropicUsage::default()
                },
            },
        });
        events.push(AnthropicEvent::Ping);
    }

    fn ensure_block(&mut self, kind: BlockKind, events: &mut Vec<AnthropicEvent>) -> usize {
        match self.open {
            Some(open) if open.kind == kind => open.index,
            _ => self.open_block(kind, events, |kind| match kind {
                BlockKind::Thinking => ResponseContentBlock::Thinking {
                    thinking: String::new(),
                    signature: None,
                },
                _ => ResponseContentBlock::Text {
                    text: String::new(),
                },
            }),
        }
    }

    fn open_block(
        &mut self,
        kind: BlockKind,
        events: &mut Vec<AnthropicEvent>,
        content_block: impl FnOnce(BlockKind) -> ResponseContentBlock,
    ) -> usize {
        self.close_block(events);
        let index = self.next_block;
        self.next_block += 1;
        events.push(AnthropicEvent::ContentBlockStart {
            index,
            content_block: content_block(kind),
        });
        self.open = Some(OpenBlock { index, kind });
        index
    }

    fn close_block(&mut self, events: &mut Vec<AnthropicEvent>) {
        if let Some(open) = self.open.take() {
            events.push(AnthropicEvent::ContentBlockStop { index: open.index });
        }
    }

    pub fn tool_calls(&self) -> Vec<&AccumulatedToolCall> {
        self.tool_calls.values().collect()
    }

    pub fn frame(event: &AnthropicEvent) -> SseFrame {
        SseFrame {
            event: Some(event.event_name()),
            data: to_json(event),
        }
    }
}

/// Encodes canonical events as `OpenAI` `chat.completion.chunk` frames.
///
/// Tool arguments are buffered per call and emitted as one complete
/// `tool_calls` delta once the call ends.
#[derive(Debug)]
pub struct OpenAiEncoder {
    id: String,
    model: String,
    created: u64,
    role_sent: bool,
    tool_calls: BTreeMap<usize, AccumulatedToolCall>,
    emitted_tools: Vec<usize>,
    input_tokens: u64,
    output_tokens: u64,
}

impl OpenAiEncoder {
    pub fn new(model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            model: model.to_string(),
            created: chrono::Utc::now().timestamp().max(0) as u64,
            role_sent: false,
            tool_calls: BTreeMap::new(),
            emitted_tools: Vec::new(),
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    pub fn encode(&mut self, event: StreamEvent) -> Vec<SseFrame> {
        let mut frames = Vec::new();

        match event {
            StreamEvent::MessageStart { .. } => self.ensure_role(&mut frames),
            StreamEvent::ContentDelta(ContentDelta::Text(text)) => {
                self.ensure_role(&mut frames);
                frames.push(self.chunk(
                    ChunkDelta {
                        content: Some(text),
                        ..ChunkDelta::default()
                    },
                    None,
                ));
            }
            StreamEvent::ContentDelta(ContentDelta::Thinking(thinking)) => {
                self.ensure_role(&mut frames);
                frames.push(self.chunk(
                    ChunkDelta {
                        reasoning_content: Some(thinking),
                        ..ChunkDelta::default()
                    },
                    None,
                ));
            }
            // no place for a signature in the chunk grammar
            StreamEvent::ContentDelta(ContentDelta::Signature(_)) => {}
            StreamEvent::ToolCallDelta {
                index,
                id,
                name,
                arguments,
            } => {
                self.tool_calls.entry(index).or_default().push(
                    id.as_deref(),
                    name.as_deref(),
                    &arguments,
                );
            }
            StreamEvent::ToolCallEnd { index } => {
                self.ensure_role(&mut frames);
                frames.extend(self.emit_tool_call(index));
            }
            StreamEvent::Usage {
                input_tokens,
                output_tokens,
            } => {
                self.input_tokens = input_tokens.unwrap_or(self.input_tokens);
                self.output_tokens = output_tokens.unwrap_or(self.output_tokens);
            }
            StreamEvent::MessageStop { stop_reason, .. } => {
                self.ensure_role(&mut frames);
                let pending: Vec<usize> = self.tool_calls.keys().copied().collect();
                for index in pending {
                    frames.extend(self.emit_tool_call(index));
                }

                let reason = match stop_reason {
                    Some(reason) => reason,
                    None if !self.emitted_tools.is_empty() => StopReason::ToolUse,
                    None => StopReason::EndTurn,
                };
                frames.push(self.chunk(ChunkDelta::default(), Some(reason.to_wire(Dialect::OpenAi))));

                let usage_chunk = ChatCompletionChunk {
                    id: self.id.clone(),
                    object: "chat.completion.chunk".to_string(),
                    created: self.created,
                    model: self.model.clone(),
                    choices: Vec::new(),
                    usage: Some(ChatUsage::new(self.input_tokens, self.output_tokens)),
                };
                frames.push(SseFrame {
                    event: None,
                    data: to_json(&usage_chunk),
                });
            }
            StreamEvent::Error(error) => frames.push(SseFrame {
                event: None,
                data: to_json(&ErrorResponse::from_body(error)),
            }),
        }

        frames
    }

    fn ensure_role(&mut self, frames: &mut Vec<SseFrame>) {
        if self.role_sent {
            return;
        }
        self.role_sent = true;
        frames.push(self.chunk(
            ChunkDelta {
                role: Some("assistant".to_string()),
                content: Some(String::new()),
                ..ChunkDelta::default()
            },
            None,
        ));
    }

    fn emit_tool_call(&mut self, index: usize) -> Option<SseFrame> {
        if self.emitted_tools.contains(&index) {
            return None;
        }
        let call = self.tool_calls.get_mut(&index)?;
        call.finish();
        let tool_call = ChunkToolCall {
            index: index as u64,
            id: Some(call.id.clone()),
            call_type: Some("function".to_string()),
            function: Some(ChunkToolCallFunction {
                name: Some(call.name.clone()),
                arguments: Some(call.arguments.clone()),
            }),
        };
        self.emitted_tools.push(index);
        Some(self.chunk(
            ChunkDelta {
                tool_calls: Some(vec![tool_call]),
                ..ChunkDelta::default()
            },
            None,
        ))
    }

    fn chunk(&self, delta: ChunkDelta, finish_reason: Option<String>) -> SseFrame {
        let chunk = ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage: None,
        };
        SseFrame {
            event: None,
            data: to_json(&chunk),
        }
    }

    pub fn tool_calls(&self) -> Vec<&AccumulatedToolCall> {
        self.tool_calls.values().collect()
    }
}

// ---------------------------------------------------------------------------
// Transcoder
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Decoder {
    OpenAi(OpenAiDecoder),
    Anthropic(AnthropicDecoder),
}

impl Decoder {
    fn decode(&mut self, data: &str) -> Result<Vec<StreamEvent>> {
        match self {
            Decoder::OpenAi(d) => d.decode(data),
            Decoder::Anthropic(d) => d.decode(data),
        }
    }

    fn finish(&mut self) -> Vec<StreamEvent> {
        match self {
            Decoder::OpenAi(d) => d.finish(),
            Decoder::Anthropic(d) => d.finish(),
        }
    }
}

#[derive(Debug)]
enum Encoder {
    OpenAi(OpenAiEncoder),
    Anthropic(AnthropicEncoder),
}

impl Encoder {
    fn encode(&mut self, event: StreamEvent) -> Vec<Bytes> {
        match self {
            Encoder::OpenAi(e) => e.encode(event).iter().map(SseFrame::to_bytes).collect(),
            Encoder::Anthropic(e) => e
                .encode(event)
                .iter()
                .map(|ev| AnthropicEncoder::frame(ev).to_bytes())
                .collect(),
        }
    }

    fn tool_calls(&self) -> Vec<&AccumulatedToolCall> {
        match self {
            Encoder::OpenAi(e) => e.tool_calls(),
            Encoder::Anthropic(e) => e.tool_calls(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscoderState {
    Idle,
    Streaming,
    Completing,
    Erroring,
    Closed,
}

/// Converts one upstream event stream into one client event stream.
///
/// Output from [`process`](Self::process), [`finish`](Self::finish) and
/// [`fail`](Self::fail) is ready-to-send SSE bytes. Once the sentinel has been
/// produced the transcoder is closed and every further call yields nothing.
#[derive(Debug)]
pub struct StreamTranscoder {
    decoder: Decoder,
    encoder: Encoder,
    state: TranscoderState,
    failed: bool,
    input_tokens: u64,
    output_tokens: u64,
}

impl StreamTranscoder {
    /// `model` is the name reported to the client in stream metadata.
    pub fn new(upstream: Dialect, client: Dialect, model: &str) -> Self {
        let decoder = match upstream {
            Dialect::OpenAi => Decoder::OpenAi(OpenAiDecoder::default()),
            Dialect::Anthropic => Decoder::Anthropic(AnthropicDecoder::default()),
        };
        let encoder = match client {
            Dialect::OpenAi => Encoder::OpenAi(OpenAiEncoder::new(model)),
            Dialect::Anthropic => Encoder::Anthropic(AnthropicEncoder::new(model)),
        };
        Self {
            decoder,
            encoder,
            state: TranscoderState::Idle,
            failed: false,
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    pub fn state(&self) -> TranscoderState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == TranscoderState::Closed
    }

    /// True once the stream was terminated by an error event.
    pub fn failed(&self) -> bool {
        self.failed
    }

    /// (input, output) token counts reported by the upstream so far.
    pub fn usage(&self) -> (u64, u64) {
        (self.input_tokens, self.output_tokens)
    }

    pub fn tool_calls(&self) -> Vec<&AccumulatedToolCall> {
        self.encoder.tool_calls()
    }

    /// Feed one upstream SSE `data` payload. A conversion error leaves the
    /// transcoder open so the caller can report it through [`fail`](Self::fail).
    pub fn process(&mut self, data: &str) -> Result<Vec<Bytes>> {
        if self.is_closed() {
            return Ok(Vec::new());
        }
        let events = self.decoder.decode(data)?;
        Ok(self.emit(events))
    }

    /// Upstream ended. Flushes open blocks and terminates the stream.
    pub fn finish(&mut self) -> Vec<Bytes> {
        if self.is_closed() {
            return Vec::new();
        }
        let events = self.decoder.finish();
        self.emit(events)
    }

    /// Terminate the stream with an error event.
    pub fn fail(&mut self, error: ErrorBody) -> Vec<Bytes> {
        if self.is_closed() {
            return Vec::new();
        }
        self.state = TranscoderState::Erroring;
        self.failed = true;
        let mut out = self.encoder.encode(StreamEvent::Error(error));
        out.push(Bytes::from_static(STREAM_SENTINEL.as_bytes()));
        self.state = TranscoderState::Closed;
        out
    }

    fn emit(&mut self, events: Vec<StreamEvent>) -> Vec<Bytes> {
        let mut out = Vec::new();
        for event in events {
            match event {
                StreamEvent::Error(error) => {
                    out.extend(self.fail(error));
                    break;
                }
                StreamEvent::MessageStop { .. } => {
                    self.state = TranscoderState::Completing;
                    out.extend(self.encoder.encode(event));
                    out.push(Bytes::from_static(STREAM_SENTINEL.as_bytes()));
                    self.state = TranscoderState::Closed;
                    break;
                }
                other => {
                    if let StreamEvent::Usage {
                        input_tokens,
                        output_tokens,
                    } = &other
                    {
                        self.input_tokens = input_tokens.unwrap_or(self.input_tokens);
                        self.output_tokens = output_tokens.unwrap_or(self.output_tokens);
                    }
                    self.state = TranscoderState::Streaming;
                    out.extend(self.encoder.encode(other));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frames_to_string(frames: &[Bytes]) -> String {
        frames
            .iter()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .collect()
    }

    /// Parse emitted SSE text into (event name, data json) pairs, skipping the sentinel.
    fn parse_frames(text: &str) -> Vec<(Option<String>, serde_json::Value)> {
        text.split("\n\n")
            .filter(|f| !f.is_empty() && *f != "data: [DONE]")
            .map(|frame| {
                let mut name = None;
                let mut data = serde_json::Value::Null;
                for line in frame.lines() {
                    if let Some(n) = line.strip_prefix("event: ") {
                        name = Some(n.to_string());
                    } else if let Some(d) = line.strip_prefix("data: ") {
                        data = serde_json::from_str(d).unwrap();
                    }
                }
                (name, data)
            })
            .collect()
    }

    fn openai_chunk(delta: serde_json::Value, finish: Option<&str>) -> String {
        json!({
            "id": "chatcmpl-1",
            "object": "chat.completion.chunk",
            "created": 0,
            "model": "gpt-4o",
            "choices": [{"index": 0, "delta": delta, "finish_reason": finish}]
        })
        .to_string()
    }

    fn tool_fragment(args: &str, first: bool) -> String {
        let mut call = json!({"index": 0, "function": {"arguments": args}});
        if first {
            call["id"] = json!("call_1");
            call["type"] = json!("function");
            call["function"]["name"] = json!("set");
        }
        openai_chunk(json!({"tool_calls": [call]}), None)
    }

    #[test]
    fn test_openai_text_to_anthropic() {
        let mut t = StreamTranscoder::new(Dialect::OpenAi, Dialect::Anthropic, "haiku");
        let mut out = Vec::new();
        out.extend(t.process(&openai_chunk(json!({"role": "assistant", "content": "Hel"}), None)).unwrap());
        out.extend(t.process(&openai_chunk(json!({"content": "lo"}), None)).unwrap());
        out.extend(t.process(&openai_chunk(json!({}), Some("stop"))).unwrap());
        out.extend(
            t.process(r#"{"id":"chatcmpl-1","choices":[],"usage":{"prompt_tokens":3,"completion_tokens":2,"total_tokens":5}}"#)
                .unwrap(),
        );
        out.extend(t.process("[DONE]").unwrap());

        let text = frames_to_string(&out);
        assert!(text.ends_with(STREAM_SENTINEL));
        let frames = parse_frames(&text);
        let names: Vec<_> = frames.iter().map(|(n, _)| n.clone().unwrap()).collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "ping",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop"
            ]
        );
        assert_eq!(frames[0].1["message"]["model"], "haiku");
        // stop was deferred until the usage chunk arrived
        assert_eq!(frames[6].1["delta"]["stop_reason"], "end_turn");
        assert_eq!(frames[6].1["usage"]["output_tokens"], 2);
        assert_eq!(t.usage(), (3, 2));
        assert!(t.is_closed());
    }

    #[test]
    fn test_tool_fragments_to_anthropic_accumulate() {
        let mut t = StreamTranscoder::new(Dialect::OpenAi, Dialect::Anthropic, "m");
        let mut out = Vec::new();
        out.extend(t.process(&tool_fragment("{\"a\":", true)).unwrap());
        out.extend(t.process(&tool_fragment("1", false)).unwrap());
        out.extend(t.process(&tool_fragment("}", false)).unwrap());
        out.extend(t.process(&openai_chunk(json!({}), Some("tool_calls"))).unwrap());
        out.extend(t.finish());

        let calls = t.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments, "{\"a\":1}");
        assert!(calls[0].is_finished());
        let parsed: serde_json::Value = serde_json::from_str(&calls[0].arguments).unwrap();
        assert_eq!(parsed, json!({"a": 1}));

        let frames = parse_frames(&frames_to_string(&out));
        let deltas: Vec<_> = frames
            .iter()
            .filter(|(_, d)| d["delta"]["type"] == "input_json_delta")
            .map(|(_, d)| d["delta"]["partial_json"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(deltas, vec!["{\"a\":", "1", "}"]);
        let stop = frames.iter().find(|(n, _)| n.as_deref() == Some("message_delta")).unwrap();
        assert_eq!(stop.1["delta"]["stop_reason"], "tool_use");
    }

    #[test]
    fn test_tool_fragments_to_openai_emit_once() {
        let mut t = StreamTranscoder::new(Dialect::Anthropic, Dialect::OpenAi, "m");
        let events = [
            json!({"type": "message_start", "message": {"id": "msg_1", "type": "message", "role": "assistant", "content": [], "model": "claude", "stop_reason": null, "stop_sequence": null, "usage": {"input_tokens": 9, "output_tokens": 0}}}),
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "tool_use", "id": "toolu_1", "name": "set", "input": {}}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "input_json_delta", "partial_json": "{\"a\":"}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "input_json_delta", "partial_json": "1"}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "input_json_delta", "partial_json": "}"}}),
            json!({"type": "content_block_stop", "index": 0}),
            json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 4}}),
            json!({"type": "message_stop"}),
        ];

        let mut out = Vec::new();
        for ev in &events {
            out.extend(t.process(&ev.to_string()).unwrap());
        }

        let text = frames_to_string(&out);
        assert!(text.ends_with(STREAM_SENTINEL));
        let frames = parse_frames(&text);

        let tool_chunks: Vec<_> = frames
            .iter()
            .filter(|(_, d)| !d["choices"][0]["delta"]["tool_calls"].is_null())
            .collect();
        assert_eq!(tool_chunks.len(), 1);
        let call = &tool_chunks[0].1["choices"][0]["delta"]["tool_calls"][0];
        assert_eq!(call["id"], "toolu_1");
        assert_eq!(call["function"]["arguments"], "{\"a\":1}");

        let finish = frames
            .iter()
            .find_map(|(_, d)| d["choices"][0]["finish_reason"].as_str())
            .unwrap();
        assert_eq!(finish, "tool_calls");
        let usage = &frames.last().unwrap().1["usage"];
        assert_eq!(usage["prompt_tokens"], 9);
        assert_eq!(usage["completion_tokens"], 4);
    }

    #[test]
    fn test_thinking_and_signature_to_openai() {
        let mut t = StreamTranscoder::new(Dialect::Anthropic, Dialect::OpenAi, "m");
        let events = [
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "thinking", "thinking": ""}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "thinking_delta", "thinking": "hmm"}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "signature_delta", "signature": "ab"}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "signature_delta", "signature": "cd"}}),
            json!({"type": "content_block_stop", "index": 0}),
        ];
        let mut out = Vec::new();
        for ev in &events {
            out.extend(t.process(&ev.to_string()).unwrap());
        }
        let text = frames_to_string(&out);
        let frames = parse_frames(&text);
        assert!(frames
            .iter()
            .any(|(_, d)| d["choices"][0]["delta"]["reasoning_content"] == "hmm"));
        assert!(!text.contains("abcd"));
    }

    #[test]
    fn test_nothing_after_sentinel() {
        let mut t = StreamTranscoder::new(Dialect::OpenAi, Dialect::OpenAi, "m");
        t.process(&openai_chunk(json!({"content": "x"}), Some("stop"))).unwrap();
        let closing = t.process("[DONE]").unwrap();
        assert_eq!(
            closing.last().map(|b| b.as_ref()),
            Some(STREAM_SENTINEL.as_bytes())
        );

        assert!(t.process(&openai_chunk(json!({"content": "late"}), None)).unwrap().is_empty());
        assert!(t.finish().is_empty());
        assert!(t.fail(ErrorBody::new("api_error", "late")).is_empty());
    }

    #[test]
    fn test_exactly_one_terminal_event() {
        let mut t = StreamTranscoder::new(Dialect::Anthropic, Dialect::Anthropic, "m");
        let mut out = Vec::new();
        out.extend(t.process(r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hi"}}"#).unwrap());
        out.extend(t.process(r#"{"type":"message_stop"}"#).unwrap());
        out.extend(t.finish());

        let text = frames_to_string(&out);
        assert_eq!(text.matches("event: message_stop").count(), 1);
        assert_eq!(text.matches("[DONE]").count(), 1);
        assert!(text.ends_with(STREAM_SENTINEL));
    }

    #[test]
    fn test_upstream_error_event_closes_stream() {
        let mut t = StreamTranscoder::new(Dialect::Anthropic, Dialect::OpenAi, "m");
        let out = t
            .process(r#"{"type":"error","error":{"type":"overloaded_error","message":"busy"}}"#)
            .unwrap();
        let text = frames_to_string(&out);
        let frames = parse_frames(&text);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].1["error"]["type"], "overloaded_error");
        assert!(text.ends_with(STREAM_SENTINEL));
        assert_eq!(t.state(), TranscoderState::Closed);
    }

    #[test]
    fn test_malformed_chunk_is_conversion_error() {
        let mut t = StreamTranscoder::new(Dialect::OpenAi, Dialect::Anthropic, "m");
        let err = t.process("{not json").unwrap_err();
        assert!(matches!(err, GatewayError::Conversion { .. }));
        assert!(!t.is_closed());

        let out = t.fail(ErrorBody::new("api_error", err.to_string()));
        let text = frames_to_string(&out);
        assert!(text.starts_with("event: error\n"));
        assert!(text.ends_with(STREAM_SENTINEL));
    }

    #[test]
    fn test_eof_after_finish_reason_without_done_terminates() {
        let mut t = StreamTranscoder::new(Dialect::OpenAi, Dialect::OpenAi, "m");
        t.process(&openai_chunk(json!({"content": "all"}), Some("length"))).unwrap();
        let out = frames_to_string(&t.finish());
        let frames = parse_frames(&out);
        assert_eq!(frames[0].1["choices"][0]["finish_reason"], "length");
        assert!(out.ends_with(STREAM_SENTINEL));
        assert!(!t.failed());
    }

    #[test]
    fn test_truncated_openai_stream_is_reported() {
        let mut t = StreamTranscoder::new(Dialect::OpenAi, Dialect::Anthropic, "m");
        t.process(&openai_chunk(json!({"content": "partial"}), None)).unwrap();
        let out = frames_to_string(&t.finish());
        let frames = parse_frames(&out);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0.as_deref(), Some("error"));
        assert_eq!(frames[0].1["error"]["type"], "api_error");
        assert!(!out.contains("end_turn"));
        assert!(out.ends_with(STREAM_SENTINEL));
        assert!(t.failed());
    }

    #[test]
    fn test_truncated_anthropic_stream_is_reported() {
        let mut t = StreamTranscoder::new(Dialect::Anthropic, Dialect::OpenAi, "m");
        t.process(r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hi"}}"#)
            .unwrap();
        let out = frames_to_string(&t.finish());
        assert!(out.contains("\"api_error\""));
        assert!(!out.contains("finish_reason\":\"stop"));
        assert!(out.ends_with(STREAM_SENTINEL));
    }
}
