//! Anthropic <-> Google Gemini `generateContent` translation.

use super::sse::{AnthropicSseWriter, SseDecoder};
use super::{ByteStream, Transformer, UpstreamRequest};
use crate::error::TransformError;
use crate::registry::Endpoint;
use crate::types::{
    ContentBlock, ImageSourceType, MessagesRequest, MessagesResponse, Role, ToolChoice, Usage,
};
use async_stream::try_stream;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;

const DOMAINS: &[&str] = &["generativelanguage.googleapis.com"];

#[derive(Debug, Clone, Copy, Default)]
pub struct GeminiTransformer;

impl Transformer for GeminiTransformer {
    fn name(&self) -> &'static str {
        "gemini"
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
            url: generate_url(&endpoint.base_url, &req.model, req.is_streaming()),
            headers: vec![
                ("content-type".to_string(), "application/json".to_string()),
                ("x-goog-api-key".to_string(), endpoint.api_key().to_string()),
            ],
            body: to_generate_content(req)?,
        })
    }

    fn transform_response(
        &self,
        body: Value,
        req: &MessagesRequest,
    ) -> Result<MessagesResponse, TransformError> {
        from_generate_content(body, req)
    }

    fn transform_stream(&self, upstream: ByteStream, req: &MessagesRequest) -> ByteStream {
        Box::pin(stream_generate_content(upstream, req.model.clone()))
    }
}

fn generate_url(base_url: &str, model: &str, stream: bool) -> String {
    let base = base_url.trim_end_matches('/');
    let base = if base.ends_with("/v1beta") || base.ends_with("/v1") {
        base.to_string()
    } else {
        format!("{}/v1beta", base)
    };
    let model = model.strip_prefix("models/").unwrap_or(model);
    if stream {
        format!("{}/models/{}:streamGenerateContent?alt=sse", base, model)
    } else {
        format!("{}/models/{}:generateContent", base, model)
    }
}

/// Convert an Anthropic Messages request into a `generateContent` body.
pub fn to_generate_content(req: &MessagesRequest) -> Result<Value, TransformError> {
    // functionResponse parts are matched by name, not id.
    let mut tool_names: HashMap<String, String> = HashMap::new();
    let mut contents: Vec<Value> = Vec::new();

    for msg in &req.messages {
        let mut parts: Vec<Value> = Vec::new();
        for block in msg.content.as_blocks() {
            match block {
                ContentBlock::Text { text } => {
                    if !text.is_empty() {
                        parts.push(json!({"text": text}));
                    }
                }
                ContentBlock::Image { source } => match source.kind {
                    ImageSourceType::Base64 => {
                        if let Some(data) = source.data {
                            parts.push(json!({"inlineData": {
                                "mimeType": source.media_type.unwrap_or_else(|| "image/png".to_string()),
                                "data": data,
                            }}));
                        }
                    }
                    ImageSourceType::Url => {
                        if let Some(url) = source.url {
                            let mut file = json!({"fileUri": url});
                            if let Some(mime) = source.media_type {
                                file["mimeType"] = json!(mime);
                            }
                            parts.push(json!({"fileData": file}));
                        }
                    }
                },
                ContentBlock::ToolUse { id, name, input } => {
                    tool_names.insert(id, name.clone());
                    parts.push(json!({"functionCall": {"name": name, "args": input}}));
                }
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => {
                    let name = tool_names
                        .get(&tool_use_id)
                        .cloned()
                        .unwrap_or_else(|| tool_use_id.clone());
                    let key = if is_error.unwrap_or(false) { "error" } else { "content" };
                    parts.push(json!({"functionResponse": {
                        "name": name,
                        "response": {key: content.to_plaintext()},
                    }}));
                }
                ContentBlock::Thinking { .. }
                | ContentBlock::RedactedThinking { .. }
                | ContentBlock::Unknown => {}
            }
        }

        if parts.is_empty() {
            continue;
        }
        let role = match msg.role {
            Role::User => "user",
            Role::Assistant => "model",
        };
        contents.push(json!({"role": role, "parts": parts}));
    }

    let mut generation_config = json!({"maxOutputTokens": req.max_tokens});
    if let Some(t) = req.temperature {
        generation_config["temperature"] = json!(t);
    }
    if let Some(tp) = req.top_p {
        generation_config["topP"] = json!(tp);
    }
    if let Some(tk) = req.top_k {
        generation_config["topK"] = json!(tk);
    }
    if let Some(ss) = &req.stop_sequences {
        generation_config["stopSequences"] = json!(ss);
    }

    let mut out = json!({
        "contents": contents,
        "generationConfig": generation_config,
    });

    if let Some(system) = &req.system {
        let text = system.to_plaintext();
        if !text.is_empty() {
            out["systemInstruction"] = json!({"parts": [{"text": text}]});
        }
    }

    if let Some(tools) = &req.tools {
        let declarations: Vec<Value> = tools
            .iter()
            .map(|t| {
                let mut decl = json!({
                    "name": t.name,
                    "description": t.description.clone().unwrap_or_default(),
                });
                if t.input_schema.is_object() {
                    let mut schema = t.input_schema.clone();
                    clean_gemini_schema(&mut schema);
                    decl["parameters"] = schema;
                }
                decl
            })
            .collect();
        if !declarations.is_empty() {
            out["tools"] = json!([{"functionDeclarations": declarations}]);
        }
    }

    if let Some(choice) = &req.tool_choice {
        out["toolConfig"] = match choice {
            ToolChoice::Auto => json!({"functionCallingConfig": {"mode": "AUTO"}}),
            ToolChoice::Any => json!({"functionCallingConfig": {"mode": "ANY"}}),
            ToolChoice::None => json!({"functionCallingConfig": {"mode": "NONE"}}),
            ToolChoice::Tool { name } => json!({"functionCallingConfig": {
                "mode": "ANY",
                "allowedFunctionNames": [name],
            }}),
        };
    }

    Ok(out)
}

/// Remove schema features that Gemini's tool schema parser rejects.
pub fn clean_gemini_schema(schema: &mut Value) {
    let Some(obj) = schema.as_object_mut() else {
        return;
    };

    const STRIP_KEYS: &[&str] = &[
        "$schema",
        "$id",
        "title",
        "default",
        "examples",
        "additionalProperties",
        "patternProperties",
    ];

    for k in STRIP_KEYS {
        obj.remove(*k);
    }

    for v in obj.values_mut() {
        match v {
            Value::Object(_) => clean_gemini_schema(v),
            Value::Array(arr) => arr.iter_mut().for_each(clean_gemini_schema),
            _ => {}
        }
    }
}

/// Convert a `generateContent` response into an Anthropic Messages response.
pub fn from_generate_content(
    resp: Value,
    req: &MessagesRequest,
) -> Result<MessagesResponse, TransformError> {
    let candidate = resp
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .ok_or_else(|| {
            let reason = resp
                .pointer("/promptFeedback/blockReason")
                .and_then(Value::as_str)
                .unwrap_or("missing candidates[0]");
            TransformError::InvalidResponse(reason.to_string())
        })?;

    let mut content = Vec::new();
    let mut text = String::new();
    for (i, part) in candidate_parts(candidate).iter().enumerate() {
        if part.get("thought").and_then(Value::as_bool).unwrap_or(false) {
            continue;
        }
        if let Some(t) = part.get("text").and_then(Value::as_str) {
            text.push_str(t);
        } else if let Some(call) = part.get("functionCall") {
            if !text.is_empty() {
                content.push(ContentBlock::Text {
                    text: std::mem::take(&mut text),
                });
            }
            content.push(ContentBlock::ToolUse {
                id: function_call_id(call, i),
                name: call
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
                input: call.get("args").cloned().unwrap_or_else(|| json!({})),
            });
        }
    }
    if !text.is_empty() {
        content.push(ContentBlock::Text { text });
    }

    let has_tool_use = content
        .iter()
        .any(|b| matches!(b, ContentBlock::ToolUse { .. }));

    Ok(MessagesResponse {
        id: resp
            .get("responseId")
            .and_then(Value::as_str)
            .map(|id| format!("msg_{}", id))
            .unwrap_or_else(|| "msg_ccrelay".to_string()),
        kind: "message".to_string(),
        role: Role::Assistant,
        content,
        model: req.model.clone(),
        stop_reason: candidate
            .get("finishReason")
            .and_then(Value::as_str)
            .map(|r| map_finish_reason(r, has_tool_use)),
        stop_sequence: None,
        usage: resp.get("usageMetadata").map(read_usage).unwrap_or_default(),
    })
}

fn candidate_parts(candidate: &Value) -> &[Value] {
    candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn function_call_id(call: &Value, position: usize) -> String {
    call.get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("toolu_gemini_{}", position))
}

fn read_usage(usage: &Value) -> Usage {
    let field = |name: &str| usage.get(name).and_then(Value::as_u64).unwrap_or(0) as u32;
    Usage {
        input_tokens: field("promptTokenCount"),
        output_tokens: field("candidatesTokenCount"),
    }
}

fn map_finish_reason(reason: &str, has_tool_use: bool) -> String {
    match reason {
        "STOP" if has_tool_use => "tool_use".to_string(),
        "STOP" => "end_turn".to_string(),
        "MAX_TOKENS" => "max_tokens".to_string(),
        _ => "end_turn".to_string(),
    }
}

/// Convert `streamGenerateContent?alt=sse` chunks into Anthropic SSE frames.
fn stream_generate_content(
    upstream: ByteStream,
    model: String,
) -> impl Stream<Item = Result<Bytes, TransformError>> + Send {
    try_stream! {
        let mut upstream = upstream;
        let mut decoder = SseDecoder::new();
        let mut writer = AnthropicSseWriter::new(model);
        let mut calls = 0usize;

        while let Some(chunk) = upstream.next().await {
            let chunk = chunk?;
            for frame in decoder.push(&chunk) {
                let value: Value = serde_json::from_str(&frame.data)?;
                for out in apply_chunk(&mut writer, &value, &mut calls)? {
                    yield out;
                }
            }
        }
        if let Some(frame) = decoder.finish() {
            let value: Value = serde_json::from_str(&frame.data)?;
            for out in apply_chunk(&mut writer, &value, &mut calls)? {
                yield out;
            }
        }

        for out in writer.finish() {
            yield out;
        }
    }
}

/// Feed one streamed `GenerateContentResponse` into the writer. Gemini sends
/// each function call whole, so every call opens and fills one block.
fn apply_chunk(
    writer: &mut AnthropicSseWriter,
    chunk: &Value,
    calls: &mut usize,
) -> Result<Vec<Bytes>, TransformError> {
    if let Some(error) = chunk.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(TransformError::Stream(message));
    }

    if let Some(id) = chunk.get("responseId").and_then(Value::as_str) {
        writer.set_message_id(&format!("msg_{}", id));
    }
    if let Some(usage) = chunk.get("usageMetadata") {
        let usage = read_usage(usage);
        writer.set_input_tokens(usage.input_tokens);
        writer.set_output_tokens(usage.output_tokens);
    }

    let mut out = Vec::new();
    let Some(candidate) = chunk
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
    else {
        return Ok(out);
    };

    for part in candidate_parts(candidate) {
        if part.get("thought").and_then(Value::as_bool).unwrap_or(false) {
            continue;
        }
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            out.extend(writer.text(text));
        } else if let Some(call) = part.get("functionCall") {
            let key = format!("call_{}", calls);
            let id = function_call_id(call, *calls);
            *calls += 1;
            let name = call.get("name").and_then(Value::as_str).unwrap_or("unknown");
            let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
            out.extend(writer.tool_start(&key, &id, name));
            out.extend(writer.tool_args(&key, &args.to_string()));
        }
    }

    if let Some(reason) = candidate.get("finishReason").and_then(Value::as_str) {
        writer.set_stop_reason(map_finish_reason(reason, writer.has_tool_use()));
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::byte_stream;
    use crate::transform::sse::tests::decode_events;
    use crate::types::{
        Content, ImageSource, Message, SystemContent, Tool, ToolResultContent,
    };

    fn request(messages: Vec<Message>) -> MessagesRequest {
        let mut req = MessagesRequest::probe("gemini-2.5-pro");
        req.messages = messages;
        req.max_tokens = 1024;
        req
    }

    #[test]
    fn test_generate_url_variants() {
        assert_eq!(
            generate_url("https://generativelanguage.googleapis.com", "gemini-2.5-pro", false),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-pro:generateContent"
        );
        assert_eq!(
            generate_url(
                "https://generativelanguage.googleapis.com/v1beta/",
                "models/gemini-2.5-flash",
                true
            ),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash:streamGenerateContent?alt=sse"
        );
    }

    #[test]
    fn test_build_request_uses_google_key_header() {
        let endpoint = Endpoint::for_tests(
            "gemini",
            "https://generativelanguage.googleapis.com",
            1,
        );
        let upstream = GeminiTransformer
            .build_request(&request(vec![Message::user("hi")]), &endpoint)
            .unwrap();
        assert!(upstream
            .headers
            .contains(&("x-goog-api-key".to_string(), "sk-gemini".to_string())));
        assert!(upstream.headers.iter().all(|(k, _)| k != "authorization"));
    }

    #[test]
    fn test_request_maps_roles_tools_and_results() {
        let mut req = request(vec![
            Message::user("read a"),
            Message {
                role: Role::Assistant,
                content: Content::Blocks(vec![ContentBlock::ToolUse {
                    id: "toolu_1".into(),
                    name: "read".into(),
                    input: json!({"path": "a"}),
                }]),
            },
            Message {
                role: Role::User,
                content: Content::Blocks(vec![
                    ContentBlock::ToolResult {
                        tool_use_id: "toolu_1".into(),
                        content: ToolResultContent::String("body".into()),
                        is_error: None,
                    },
                    ContentBlock::Image {
                        source: ImageSource {
                            kind: ImageSourceType::Base64,
                            media_type: Some("image/jpeg".into()),
                            data: Some("AAAA".into()),
                            url: None,
                        },
                    },
                ]),
            },
        ]);
        req.system = Some(SystemContent::String("sys".into()));
        req.tools = Some(vec![Tool {
            name: "read".into(),
            description: None,
            input_schema: json!({
                "$schema": "http://json-schema.org/draft-07/schema#",
                "type": "object",
                "additionalProperties": false,
                "properties": {"path": {"type": "string", "default": "."}}
            }),
        }]);
        req.tool_choice = Some(ToolChoice::Tool {
            name: "read".into(),
        });

        let out = to_generate_content(&req).unwrap();
        assert_eq!(out["systemInstruction"]["parts"][0]["text"], "sys");
        assert_eq!(out["generationConfig"]["maxOutputTokens"], 1024);

        let contents = out["contents"].as_array().unwrap();
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[1]["parts"][0]["functionCall"]["name"], "read");
        assert_eq!(contents[2]["parts"][0]["functionResponse"]["name"], "read");
        assert_eq!(
            contents[2]["parts"][0]["functionResponse"]["response"]["content"],
            "body"
        );
        assert_eq!(contents[2]["parts"][1]["inlineData"]["mimeType"], "image/jpeg");

        let params = &out["tools"][0]["functionDeclarations"][0]["parameters"];
        assert!(params.get("$schema").is_none());
        assert!(params.get("additionalProperties").is_none());
        assert!(params["properties"]["path"].get("default").is_none());
        assert_eq!(out["toolConfig"]["functionCallingConfig"]["mode"], "ANY");
    }

    #[test]
    fn test_response_skips_thoughts_and_maps_calls() {
        let resp = json!({
            "responseId": "abc",
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"text": "pondering", "thought": true},
                    {"text": "Let me look."},
                    {"functionCall": {"name": "read", "args": {"path": "a"}}}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 11, "candidatesTokenCount": 6}
        });

        let out = from_generate_content(resp, &request(vec![])).unwrap();
        assert_eq!(out.id, "msg_abc");
        assert_eq!(out.content.len(), 2);
        assert!(matches!(&out.content[0], ContentBlock::Text { text } if text == "Let me look."));
        assert!(matches!(&out.content[1], ContentBlock::ToolUse { name, .. } if name == "read"));
        assert_eq!(out.stop_reason.as_deref(), Some("tool_use"));
        assert_eq!(out.usage.input_tokens, 11);
        assert_eq!(out.usage.output_tokens, 6);
    }

    #[test]
    fn test_blocked_prompt_is_invalid_response() {
        let err = from_generate_content(
            json!({"promptFeedback": {"blockReason": "SAFETY"}}),
            &request(vec![]),
        )
        .unwrap_err();
        assert!(matches!(err, TransformError::InvalidResponse(reason) if reason == "SAFETY"));
    }

    #[tokio::test]
    async fn test_stream_converts_text_and_calls() {
        let body = concat!(
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hel\"}]}}],\"responseId\":\"r1\"}\r\n\r\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"lo\"}]}}]}\r\n\r\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"functionCall\":{\"name\":\"ls\",\"args\":{}}}]},\"finishReason\":\"STOP\"}],",
            "\"usageMetadata\":{\"promptTokenCount\":3,\"candidatesTokenCount\":2}}\r\n\r\n",
        );
        let chunks: Vec<Result<Bytes, std::io::Error>> = body
            .as_bytes()
            .chunks(29)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();

        let stream = GeminiTransformer.transform_stream(
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
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        assert_eq!(events[0].1["message"]["id"], "msg_r1");
        assert_eq!(events[5].1["content_block"]["name"], "ls");
        assert_eq!(events[6].1["delta"]["partial_json"], "{}");
        assert_eq!(events[8].1["delta"]["stop_reason"], "tool_use");
        assert_eq!(events[8].1["usage"]["output_tokens"], 2);
    }
}
