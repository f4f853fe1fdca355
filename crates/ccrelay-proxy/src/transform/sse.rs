//! Server-Sent Events plumbing shared by the transformers.
//!
//! Upstream providers stream `data: {json}` frames separated by a blank line.
//! [`SseDecoder`] reassembles frames across arbitrary chunk boundaries
//! (including split UTF-8 sequences), and [`AnthropicSseWriter`] emits the
//! Anthropic event sequence the assistant expects:
//!
//! ```text
//! message_start
//! content_block_start / content_block_delta* / content_block_stop   (per block)
//! message_delta
//! message_stop
//! ```

use crate::types::Usage;
use bytes::Bytes;
use serde_json::{json, Value};
use std::collections::HashMap;

/// One decoded SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE frame decoder.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every frame it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let raw: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            if let Some(frame) = parse_frame(&String::from_utf8_lossy(&raw)) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush a trailing frame that was not terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        let raw = std::mem::take(&mut self.buffer);
        parse_frame(&String::from_utf8_lossy(&raw))
    }
}

fn parse_frame(raw: &str) -> Option<SseFrame> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();

    for line in raw.lines() {
        if line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }

    if data.is_empty() {
        return None;
    }

    Some(SseFrame {
        event,
        data: data.join("\n"),
    })
}

/// Format one Anthropic SSE event.
pub fn sse_event(event: &str, data: &Value) -> Bytes {
    Bytes::from(format!("event: {}\ndata: {}\n\n", event, data))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum OpenBlock {
    Text(usize),
    Tool { index: usize, key: String },
}

/// Stateful emitter of Anthropic streaming events.
///
/// Blocks are strictly sequential: opening a new block closes the previous
/// one, matching what the Messages API itself sends.
#[derive(Debug)]
pub struct AnthropicSseWriter {
    model: String,
    message_id: Option<String>,
    started: bool,
    open: Option<OpenBlock>,
    next_index: usize,
    tool_indices: HashMap<String, usize>,
    usage: Usage,
    stop_reason: Option<String>,
    saw_tool_use: bool,
}

impl AnthropicSseWriter {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            message_id: None,
            started: false,
            open: None,
            next_index: 0,
            tool_indices: HashMap::new(),
            usage: Usage::default(),
            stop_reason: None,
            saw_tool_use: false,
        }
    }

    pub fn set_message_id(&mut self, id: &str) {
        if self.message_id.is_none() && !id.is_empty() {
            self.message_id = Some(id.to_string());
        }
    }

    pub fn set_input_tokens(&mut self, tokens: u32) {
        self.usage.input_tokens = tokens;
    }

    pub fn set_output_tokens(&mut self, tokens: u32) {
        self.usage.output_tokens = tokens;
    }

    /// First stop reason wins; later chunks often repeat or clear it.
    pub fn set_stop_reason(&mut self, reason: String) {
        if self.stop_reason.is_none() {
            self.stop_reason = Some(reason);
        }
    }

    pub fn has_tool_use(&self) -> bool {
        self.saw_tool_use
    }

    fn ensure_started(&mut self, out: &mut Vec<Bytes>) {
        if self.started {
            return;
        }
        self.started = true;
        let id = self
            .message_id
            .clone()
            .unwrap_or_else(|| "msg_ccrelay".to_string());
        out.push(sse_event(
            "message_start",
            &json!({
                "type": "message_start",
                "message": {
                    "id": id,
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "content": [],
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": self.usage.input_tokens, "output_tokens": 0}
                }
            }),
        ));
    }

    fn close_open(&mut self, out: &mut Vec<Bytes>) {
        if let Some(block) = self.open.take() {
            let index = match block {
                OpenBlock::Text(index) => index,
                OpenBlock::Tool { index, .. } => index,
            };
            out.push(sse_event(
                "content_block_stop",
                &json!({"type": "content_block_stop", "index": index}),
            ));
        }
    }

    /// Append streamed text, opening a text block if needed.
    pub fn text(&mut self, text: &str) -> Vec<Bytes> {
        let mut out = Vec::new();
        self.ensure_started(&mut out);
        if text.is_empty() {
            return out;
        }

        let index = match self.open {
            Some(OpenBlock::Text(index)) => index,
            _ => {
                self.close_open(&mut out);
                let index = self.next_index;
                self.next_index += 1;
                self.open = Some(OpenBlock::Text(index));
                out.push(sse_event(
                    "content_block_start",
                    &json!({
                        "type": "content_block_start",
                        "index": index,
                        "content_block": {"type": "text", "text": ""}
                    }),
                ));
                index
            }
        };

        out.push(sse_event(
            "content_block_delta",
            &json!({
                "type": "content_block_delta",
                "index": index,
                "delta": {"type": "text_delta", "text": text}
            }),
        ));
        out
    }

    /// Open a tool_use block. `key` identifies the call across chunks.
    pub fn tool_start(&mut self, key: &str, id: &str, name: &str) -> Vec<Bytes> {
        let mut out = Vec::new();
        self.ensure_started(&mut out);
        if self.tool_indices.contains_key(key) {
            return out;
        }

        self.close_open(&mut out);
        let index = self.next_index;
        self.next_index += 1;
        self.tool_indices.insert(key.to_string(), index);
        self.open = Some(OpenBlock::Tool {
            index,
            key: key.to_string(),
        });
        self.saw_tool_use = true;

        out.push(sse_event(
            "content_block_start",
            &json!({
                "type": "content_block_start",
                "index": index,
                "content_block": {"type": "tool_use", "id": id, "name": name, "input": {}}
            }),
        ));
        out
    }

    /// Append partial JSON arguments to a started tool call.
    pub fn tool_args(&mut self, key: &str, partial_json: &str) -> Vec<Bytes> {
        let Some(&index) = self.tool_indices.get(key) else {
            return Vec::new();
        };
        if partial_json.is_empty() {
            return Vec::new();
        }

        vec![sse_event(
            "content_block_delta",
            &json!({
                "type": "content_block_delta",
                "index": index,
                "delta": {"type": "input_json_delta", "partial_json": partial_json}
            }),
        )]
    }

    /// Close the open block and emit the terminal events.
    pub fn finish(&mut self) -> Vec<Bytes> {
        let mut out = Vec::new();
        self.ensure_started(&mut out);
        self.close_open(&mut out);

        let stop_reason = self.stop_reason.clone().unwrap_or_else(|| {
            if self.saw_tool_use {
                "tool_use".to_string()
            } else {
                "end_turn".to_string()
            }
        });

        out.push(sse_event(
            "message_delta",
            &json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason, "stop_sequence": null},
                "usage": {
                    "input_tokens": self.usage.input_tokens,
                    "output_tokens": self.usage.output_tokens
                }
            }),
        ));
        out.push(sse_event("message_stop", &json!({"type": "message_stop"})));
        out
    }
}
