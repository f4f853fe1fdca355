//! Anthropic <-> OpenAI Chat Completions translation.
//!
//! Covers OpenAI itself and the many providers that clone its API
//! (OpenRouter, Groq, Together, Mistral):
//! - Anthropic `/v1/messages` request -> `chat/completions` JSON
//! - `chat/completions` response -> Anthropic `/v1/messages`
//! - `chat/completions` SSE chunks -> Anthropic SSE events

use super::sse::{AnthropicSseWriter, SseDecoder};
use super::{ByteStream, Transformer, UpstreamRequest};
use crate::error::TransformError;
use crate::registry::Endpoint;
use crate::types::{ContentBlock, MessagesRequest, MessagesResponse, Role, ToolChoice, Usage};
use async_stream::try_stream;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::{json, Map, Value};

const DOMAINS: &[&str] = &[
    "api.openai.com",
    "openrouter.ai",
    "api.groq.com",
    "api.together.xyz",
    "api.mistral.ai",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAiTransformer;

impl Transformer for OpenAiTransformer {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn domains(&self) -> &'static [&'static str] {
        DOMAINS
    }

    fn build_request(
        &self,
        req: &MessagesRequest,
        endpoint: &Endpoint,
    ) -> Result<UpstreamRequest, TransformError> {
        Ok(UpstreamRequest {
            url: endpoint.url_for("/v1/chat/completions"),
            headers: vec![
                ("content-type".to_string(), "application/json".to_string()),
                (
                    "authorization".to_string(),
                    format!("Bearer {}", endpoint.api_key()),
                ),
            ],
            body: to_chat_completions(req)?,
        })
    }

    fn transform_response(
        &self,
        body: Value,
        req: &MessagesRequest,
    ) -> Result<MessagesResponse, TransformError> {
        from_chat_completion(body, req)
    }

    fn transform_stream(&self, upstream: ByteStream, req: &MessagesRequest) -> ByteStream {
        Box::pin(stream_chat_completions(upstream, req.model.clone()))
    }
}

/// Convert an Anthropic Messages request into a `chat/completions` payload.
pub fn to_chat_completions(req: &MessagesRequest) -> Result<Value, TransformError> {
    let mut out_messages: Vec<Value> = Vec::new();

    if let Some(system) = &req.system {
        let system_text = system.to_plaintext();
        if !system_text.is_empty() {
            out_messages.push(json!({"role": "system", "content": system_text}));
        }
    }

    for msg in &req.messages {
        let mut parts: Vec<Value> = Vec::new();
        let mut tool_calls: Vec<Value> = Vec::new();

        for block in msg.content.as_blocks() {
            match block {
                ContentBlock::Text { text } => {
                    if !text.is_empty() {
                        parts.push(json!({"type": "text", "text": text}));
                    }
                }
                ContentBlock::Image { source } => {
                    if let Some(url) = source.to_url() {
                        parts.push(json!({"type": "image_url", "image_url": {"url": url}}));
                    }
                }
                ContentBlock::ToolUse { id, name, input } => {
                    tool_calls.push(json!({
                        "id": id,
                        "type": "function",
                        "function": {"name": name, "arguments": serde_json::to_string(&input)?}
                    }));
                }
                // Tool results become `role: tool` messages, which must
                // directly follow the assistant turn that issued the calls.
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } => {
                    out_messages.push(json!({
                        "role": "tool",
                        "tool_call_id": tool_use_id,
                        "content": content.to_plaintext(),
                    }));
                }
                ContentBlock::Thinking { .. }
                | ContentBlock::RedactedThinking { .. }
                | ContentBlock::Unknown => {}
            }
        }

        let role = match msg.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        let mut obj = Map::new();
        obj.insert("role".to_string(), json!(role));
        if let Some(content) = collapse_parts(parts) {
            obj.insert("content".to_string(), content);
        }
        if !tool_calls.is_empty() {
            obj.insert("tool_calls".to_string(), Value::Array(tool_calls));
        }

        // Skip messages that only carried tool results or dropped blocks.
        if obj.len() > 1 {
            out_messages.push(Value::Object(obj));
        }
    }

    let mut out = json!({
        "model": req.model,
        "messages": out_messages,
        "max_tokens": req.max_tokens,
    });

    if req.is_streaming() {
        out["stream"] = json!(true);
        out["stream_options"] = json!({"include_usage": true});
    }
    if let Some(t) = req.temperature {
        out["temperature"] = json!(t);
    }
    if let Some(tp) = req.top_p {
        out["top_p"] = json!(tp);
    }
    if let Some(ss) = &req.stop_sequences {
        out["stop"] = json!(ss);
    }

    if let Some(tools) = &req.tools {
        let mapped: Vec<Value> = tools
            .iter()
            .map(|t| {
                let parameters = if t.input_schema.is_object() {
                    t.input_schema.clone()
                } else {
                    json!({"type": "object", "properties": {}})
                };
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description.clone().unwrap_or_default(),
                        "parameters": parameters,
                    }
                })
            })
            .collect();
        if !mapped.is_empty() {
            out["tools"] = Value::Array(mapped);
        }
    }

    if let Some(choice) = &req.tool_choice {
        out["tool_choice"] = match choice {
            ToolChoice::Auto => json!("auto"),
            ToolChoice::Any => json!("required"),
            ToolChoice::None => json!("none"),
            ToolChoice::Tool { name } => json!({
                "type": "function",
                "function": {"name": name}
            }),
        };
    }

    Ok(out)
}

/// A lone text part is sent as a plain string, which every clone accepts.
fn collapse_parts(mut parts: Vec<Value>) -> Option<Value> {
    match parts.len() {
        0 => None,
        1 if parts[0]["type"] == "text" => {
            let mut first = parts.remove(0);
            Some(first["text"].take())
        }
        _ => Some(Value::Array(parts)),
    }
}

/// Convert a `chat/completions` response into an Anthropic Messages response.
pub fn from_chat_completion(
    resp: Value,
    req: &MessagesRequest,
) -> Result<MessagesResponse, TransformError> {
    let id = resp
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or("msg_ccrelay")
        .to_string();

    let choice = resp
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|arr| arr.first())
        .ok_or_else(|| TransformError::InvalidResponse("missing choices[0]".to_string()))?;

    let msg = choice
        .get("message")
        .ok_or_else(|| TransformError::InvalidResponse("missing choices[0].message".to_string()))?;

    let mut content: Vec<ContentBlock> = Vec::new();

    match msg.get("content") {
        Some(Value::String(s)) if !s.is_empty() => {
            content.push(ContentBlock::Text { text: s.clone() });
        }
        Some(Value::Array(parts)) => {
            let text: String = parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect();
            if !text.is_empty() {
                content.push(ContentBlock::Text { text });
            }
        }
        _ => {}
    }

    for (i, call) in msg
        .get("tool_calls")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .enumerate()
    {
        let func = call.get("function").ok_or_else(|| {
            TransformError::InvalidResponse("tool_calls[].function missing".to_string())
        })?;
        let args = func.get("arguments").and_then(Value::as_str).unwrap_or("{}");
        let input: Value = if args.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(args).unwrap_or_else(|_| json!({"raw": args}))
        };
        content.push(ContentBlock::ToolUse {
            id: call
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("call_{}", i)),
            name: func
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            input,
        });
    }

    let usage = resp.get("usage").map(read_usage).unwrap_or_default();

    Ok(MessagesResponse {
        id,
        kind: "message".to_string(),
        role: Role::Assistant,
        content,
        model: req.model.clone(),
        stop_reason: choice
            .get("finish_reason")
            .and_then(Value::as_str)
            .map(map_finish_reason),
        stop_sequence: None,
        usage,
    })
}

fn read_usage(usage: &Value) -> Usage {
    let field = |name: &str| usage.get(name).and_then(Value::as_u64).unwrap_or(0) as u32;
    Usage {
        input_tokens: field("prompt_tokens"),
        output_tokens: field("completion_tokens"),
    }
}

fn map_finish_reason(reason: &str) -> String {
    match reason {
        "stop" => "end_turn".to_string(),
        "length" => "max_tokens".to_string(),
        "tool_calls" | "function_call" => "tool_use".to_string(),
        other => other.to_string(),
    }
}

/// Convert `chat/completions` SSE chunks into Anthropic SSE frames.
fn stream_chat_completions(
    upstream: ByteStream,
    model: String,
) -> impl Stream<Item = Result<Bytes, TransformError>> + Send {
    try_stream! {
        let mut upstream = upstream;
        let mut decoder = SseDecoder::new();
        let mut writer = AnthropicSseWriter::new(model);
        let mut done = false;

        'read: while let Some(chunk) = upstream.next().await {
            let chunk = chunk?;
            for frame in decoder.push(&chunk) {
                if frame.data.trim() == "[DONE]" {
                    done = true;
                    break 'read;
                }
                let value: Value = serde_json::from_str(&frame.data)?;
                for out in apply_chunk(&mut writer, &value)? {
                    yield out;
                }
            }
        }
        if !done {
            if let Some(frame) = decoder.finish().filter(|f| f.data.trim() != "[DONE]") {
                let value: Value = serde_json::from_str(&frame.data)?;
                for out in apply_chunk(&mut writer, &value)? {
                    yield out;
                }
            }
        }

        for out in writer.finish() {
            yield out;
        }
    }
}

/// Feed one decoded chunk into the writer.
fn apply_chunk(
    writer: &mut AnthropicSseWriter,
    chunk: &Value,
) -> Result<Vec<Bytes>, TransformError> {
    if let Some(error) = chunk.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(TransformError::Stream(message));
    }

    if let Some(id) = chunk.get("id").and_then(Value::as_str) {
        writer.set_message_id(id);
    }
    if let Some(usage) = chunk.get("usage").filter(|u| u.is_object()) {
        let usage = read_usage(usage);
        writer.set_input_tokens(usage.input_tokens);
        writer.set_output_tokens(usage.output_tokens);
    }

    let mut out = Vec::new();
    let Some(choice) = chunk
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
    else {
        return Ok(out);
    };

    let delta = choice.get("delta");

    if let Some(text) = delta
        .and_then(|d| d.get("content"))
        .and_then(Value::as_str)
    {
        out.extend(writer.text(text));
    }

    // Only the first chunk of a call carries its id and name; later chunks
    // are matched by `index`.
    for (position, call) in delta
        .and_then(|d| d.get("tool_calls"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .enumerate()
    {
        let index = call
            .get("index")
            .and_then(Value::as_u64)
            .unwrap_or(position as u64);
        let key = index.to_string();
        let func = call.get("function");

        if let Some(name) = func.and_then(|f| f.get("name")).and_then(Value::as_str) {
            let id = call
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("call_{}", index));
            out.extend(writer.tool_start(&key, &id, name));
        }

        if let Some(args) = func
            .and_then(|f| f.get("arguments"))
            .and_then(Value::as_str)
        {
            out.extend(writer.tool_args(&key, args));
        }
    }

    if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
        writer.set_stop_reason(map_finish_reason(reason));
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::byte_stream;
    use crate::transform::sse::tests::decode_events;
    use crate::types::{
        Content, ImageSource, ImageSourceType, Message, SystemContent, Tool, ToolResultContent,
    };

    fn request(messages: Vec<Message>) -> MessagesRequest {
        let mut req = MessagesRequest::probe("gpt-4.1");
        req.messages = messages;
        req.max_tokens = 32_000;
        req
    }

    #[test]
    fn test_request_maps_system_tools_and_keeps_max_tokens() {
        let mut req = request(vec![Message::user("hi")]);
        req.system = Some(SystemContent::String("sys".to_string()));
        req.tools = Some(vec![Tool {
            name: "read".into(),
            description: Some("read a file".into()),
            input_schema: json!({"type": "object", "properties": {"path": {"type": "string"}}}),
        }]);
        req.tool_choice = Some(ToolChoice::Any);
        req.stream = Some(true);

        let out = to_chat_completions(&req).unwrap();
        assert_eq!(out["messages"][0], json!({"role": "system", "content": "sys"}));
        assert_eq!(out["messages"][1], json!({"role": "user", "content": "hi"}));
        assert_eq!(out["max_tokens"], 32_000);
        assert_eq!(out["tools"][0]["function"]["name"], "read");
        assert_eq!(out["tool_choice"], "required");
        assert_eq!(out["stream_options"]["include_usage"], true);
    }

    #[test]
    fn test_request_orders_tool_results_before_user_text() {
        let req = request(vec![
            Message {
                role: Role::Assistant,
                content: Content::Blocks(vec![
                    ContentBlock::Thinking {
                        thinking: "plan".into(),
                        signature: None,
                    },
                    ContentBlock::ToolUse {
                        id: "call_1".into(),
                        name: "read".into(),
                        input: json!({"path": "a"}),
                    },
                ]),
            },
            Message {
                role: Role::User,
                content: Content::Blocks(vec![
                    ContentBlock::Text {
                        text: "here you go".into(),
                    },
                    ContentBlock::ToolResult {
                        tool_use_id: "call_1".into(),
                        content: ToolResultContent::String("file body".into()),
                        is_error: None,
                    },
                    ContentBlock::Image {
                        source: ImageSource {
                            kind: ImageSourceType::Base64,
                            media_type: Some("image/png".into()),
                            data: Some("AAAA".into()),
                            url: None,
                        },
                    },
                ]),
            },
        ]);

        let out = to_chat_completions(&req).unwrap();
        let messages = out["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["role"], "assistant");
        assert!(messages[0].get("content").is_none());
        assert_eq!(messages[0]["tool_calls"][0]["function"]["arguments"], "{\"path\":\"a\"}");
        assert_eq!(messages[1]["role"], "tool");
        assert_eq!(messages[1]["tool_call_id"], "call_1");
        assert_eq!(messages[1]["content"], "file body");
        assert_eq!(messages[2]["role"], "user");
        assert_eq!(messages[2]["content"][1]["image_url"]["url"], "data:image/png;base64,AAAA");
    }

    #[test]
    fn test_build_request_uses_bearer_and_completions_path() {
        let endpoint = Endpoint::for_tests("groq", "https://api.groq.com/openai", 1);
        let upstream = OpenAiTransformer
            .build_request(&request(vec![Message::user("hi")]), &endpoint)
            .unwrap();
        assert_eq!(upstream.url, "https://api.groq.com/openai/v1/chat/completions");
        assert!(upstream
            .headers
            .contains(&("authorization".to_string(), "Bearer sk-groq".to_string())));
    }

    #[test]
    fn test_response_converts_text_and_tool_calls() {
        let resp = json!({
            "id": "chatcmpl_123",
            "model": "gpt-4.1",
            "choices": [{
                "finish_reason": "tool_calls",
                "message": {
                    "role": "assistant",
                    "content": "checking",
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "do", "arguments": "{\"x\":1}"}
                    }]
                }
            }],
            "usage": {"prompt_tokens": 3, "completion_tokens": 2}
        });

        let out = from_chat_completion(resp, &request(vec![])).unwrap();
        assert_eq!(out.stop_reason.as_deref(), Some("tool_use"));
        assert!(matches!(&out.content[0], ContentBlock::Text { text } if text == "checking"));
        match &out.content[1] {
            ContentBlock::ToolUse { id, name, input } => {
                assert_eq!(id, "call_1");
                assert_eq!(name, "do");
                assert_eq!(input["x"], 1);
            }
            other => panic!("expected tool_use, got {:?}", other),
        }
        assert_eq!(out.usage.input_tokens, 3);
        assert_eq!(out.usage.output_tokens, 2);
    }

    #[test]
    fn test_response_without_choices_is_invalid() {
        let err = from_chat_completion(json!({"id": "x"}), &request(vec![])).unwrap_err();
        assert!(matches!(err, TransformError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_stream_converts_text_and_indexed_tool_calls() {
        let body = concat!(
            "data: {\"id\":\"chatcmpl-9\",\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":\"Hi\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_a\",\"function\":{\"name\":\"read\",\"arguments\":\"\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{\\\"p\\\":1}\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":4}}\n\n",
            "data: [DONE]\n\n",
        );
        // Split mid-frame to exercise reassembly.
        let bytes = body.as_bytes();
        let chunks: Vec<Result<Bytes, std::io::Error>> = bytes
            .chunks(37)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();

        let stream = OpenAiTransformer.transform_stream(
            byte_stream(futures::stream::iter(chunks)),
            &request(vec![]),
        );
        let frames: Vec<Bytes> = stream.map(|f| f.unwrap()).collect().await;
        let events = decode_events(&frames);

        let names: Vec<&str> = events.iter().map(|(e, _)| e.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        assert_eq!(events[0].1["message"]["id"], "chatcmpl-9");
        assert_eq!(events[4].1["content_block"]["id"], "call_a");
        assert_eq!(events[5].1["index"], 1);
        assert_eq!(events[5].1["delta"]["partial_json"], "{\"p\":1}");
        assert_eq!(events[7].1["delta"]["stop_reason"], "tool_use");
        assert_eq!(events[7].1["usage"]["output_tokens"], 4);
    }

    #[tokio::test]
    async fn test_stream_flushes_unterminated_final_chunk() {
        let body = concat!(
            "data: {\"id\":\"chatcmpl-1\",\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}",
        );
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![Ok(Bytes::from_static(body.as_bytes()))];

        let stream = OpenAiTransformer.transform_stream(
            byte_stream(futures::stream::iter(chunks)),
            &request(vec![]),
        );
        let frames: Vec<Bytes> = stream.map(|f| f.unwrap()).collect().await;
        let events = decode_events(&frames);

        let text: String = events
            .iter()
            .filter(|(e, _)| e == "content_block_delta")
            .filter_map(|(_, v)| v["delta"]["text"].as_str())
            .collect();
        assert_eq!(text, "Hello");
        let delta = events.iter().find(|(e, _)| e == "message_delta").unwrap();
        assert_eq!(delta.1["delta"]["stop_reason"], "end_turn");
    }

    #[tokio::test]
    async fn test_stream_surfaces_upstream_error_chunks() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![Ok(Bytes::from_static(
            b"data: {\"error\":{\"message\":\"rate limited\"}}\n\n",
        ))];
        let mut stream = OpenAiTransformer.transform_stream(
            byte_stream(futures::stream::iter(chunks)),
            &request(vec![]),
        );
        let first = stream.next().await.unwrap();
        assert!(matches!(first, Err(TransformError::Stream(m)) if m == "rate limited"));
    }
}
