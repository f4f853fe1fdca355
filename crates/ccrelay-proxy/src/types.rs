//! Messages API shapes on the assistant side of the proxy.
//!
//! Every transformer converts from and back to these. `system`, message
//! content and tool results may arrive as a bare string or as a block list;
//! block types the proxy does not model land in `ContentBlock::Unknown` so a
//! new client feature never fails a request.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Content,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Content::String(text.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    String(String),
    Blocks(Vec<ContentBlock>),
}

impl Content {
    /// Blocks view; a bare string becomes one text block.
    pub fn as_blocks(&self) -> Vec<ContentBlock> {
        match self {
            Self::String(text) => vec![ContentBlock::Text { text: text.clone() }],
            Self::Blocks(blocks) => blocks.clone(),
        }
    }

    pub fn to_plaintext(&self) -> String {
        match self {
            Self::String(text) => text.clone(),
            Self::Blocks(blocks) => blocks.iter().map(ContentBlock::to_plaintext).collect(),
        }
    }
}

/// `system` as a string or as `{type, text}` blocks (cache hints ignored).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SystemContent {
    String(String),
    Blocks(Vec<SystemBlock>),
}

impl SystemContent {
    /// Blocks are joined with newlines.
    pub fn to_plaintext(&self) -> String {
        match self {
            Self::String(text) => text.clone(),
            Self::Blocks(blocks) => {
                let parts: Vec<&str> = blocks.iter().map(|b| b.text.as_str()).collect();
                parts.join("\n")
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemBlock {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },

    Image { source: ImageSource },

    /// Model-issued call; `input` is the parsed argument object.
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    /// Client-supplied output for an earlier `ToolUse` with the same id.
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: ToolResultContent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },

    /// Replayed reasoning from an earlier assistant turn. No provider
    /// behind a transformer accepts it back.
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },

    RedactedThinking { data: String },

    #[serde(other)]
    Unknown,
}

impl ContentBlock {
    /// Text used for token estimates. Non-text blocks count as a short
    /// placeholder.
    pub fn to_plaintext(&self) -> String {
        match self {
            Self::Text { text } => text.clone(),
            Self::ToolResult { content, .. } => content.to_plaintext(),
            Self::ToolUse { name, input, .. } => format!("{}{}", name, input),
            Self::Image { .. } => "[image]".to_string(),
            Self::Thinking { .. } | Self::RedactedThinking { .. } | Self::Unknown => String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub kind: ImageSourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ImageSource {
    /// `data:` URI for base64 sources, the plain URL otherwise.
    pub fn to_url(&self) -> Option<String> {
        match self.kind {
            ImageSourceType::Base64 => {
                let media_type = self.media_type.as_deref().unwrap_or("image/png");
                self.data
                    .as_ref()
                    .map(|data| format!("data:{};base64,{}", media_type, data))
            }
            ImageSourceType::Url => self.url.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSourceType {
    Base64,
    Url,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    String(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for ToolResultContent {
    fn default() -> Self {
        Self::String(String::new())
    }
}

impl ToolResultContent {
    pub fn to_plaintext(&self) -> String {
        match self {
            Self::String(text) => text.clone(),
            Self::Blocks(blocks) => blocks.iter().map(ContentBlock::to_plaintext).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Server-side tools (web search, ...) carry no schema.
    #[serde(default)]
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    Any,
    None,
    Tool { name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingConfig {
    #[serde(rename = "type")]
    pub kind: ThinkingType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_tokens: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingType {
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagesRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemContent>,
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl MessagesRequest {
    /// Smallest valid request, used by health probes.
    pub fn probe(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: vec![Message::user("ping")],
            max_tokens: 1,
            ..Default::default()
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub role: Role,
    pub content: Vec<ContentBlock>,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Request body for `/v1/messages/count_tokens`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCountRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
}

impl TokenCountRequest {
    /// Rough local estimate (four characters per token) for providers
    /// without a token counting endpoint.
    pub fn estimate_tokens(&self) -> u32 {
        let mut chars = self
            .system
            .as_ref()
            .map(|s| s.to_plaintext().len())
            .unwrap_or(0);
        for message in &self.messages {
            chars += message.content.to_plaintext().len();
        }
        for tool in self.tools.iter().flatten() {
            chars += tool.name.len();
            chars += tool.description.as_deref().map(str::len).unwrap_or(0);
            chars += tool.input_schema.to_string().len();
        }
        (chars as u32).div_ceil(4).max(1)
    }
}

/// Response body for `/v1/messages/count_tokens`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TokenCountResponse {
    pub input_tokens: u32,
}
