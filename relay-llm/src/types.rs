use base64::Engine as _;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
    Developer,
}

impl Role {
    /// System and developer messages both carry instructions rather than turns.
    pub fn is_instruction(self) -> bool {
        matches!(self, Role::System | Role::Developer)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinarySource {
    /// Base64-encoded bytes.
    Base64(String),
    /// A remote reference the backend fetches itself.
    Url(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Binary {
        mime_type: String,
        source: BinarySource,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn binary(mime_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self::Binary {
            mime_type: mime_type.into(),
            source: BinarySource::Base64(base64::engine::general_purpose::STANDARD.encode(bytes)),
        }
    }

    pub fn url(mime_type: impl Into<String>, url: impl Into<String>) -> Self {
        Self::Binary {
            mime_type: mime_type.into(),
            source: BinarySource::Url(url.into()),
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, Self::Binary { mime_type, .. } if mime_type.starts_with("image/"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for Content {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl From<String> for Content {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for Content {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl Content {
    /// Concatenated text of every text part.
    pub fn text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::Binary { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn parts(&self) -> Vec<ContentPart> {
        match self {
            Self::Text(s) if s.is_empty() => Vec::new(),
            Self::Text(s) => vec![ContentPart::text(s.clone())],
            Self::Parts(parts) => parts.clone(),
        }
    }

    pub fn has_images(&self) -> bool {
        matches!(self, Self::Parts(parts) if parts.iter().any(ContentPart::is_image))
    }

    pub fn has_binary(&self) -> bool {
        matches!(self, Self::Parts(parts) if parts.iter().any(|p| matches!(p, ContentPart::Binary { .. })))
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(s) => s.trim().is_empty(),
            Self::Parts(parts) => parts.is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON string, parsed on demand.
    pub arguments: String,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    /// An empty argument string is treated as `{}`.
    pub fn parse_arguments(&self) -> serde_json::Result<serde_json::Value> {
        if self.arguments.trim().is_empty() {
            return Ok(serde_json::Value::Object(serde_json::Map::new()));
        }
        serde_json::from_str(&self.arguments)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_tokens: Option<u64>,
    /// USD.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            ..Default::default()
        }
    }

    /// Fill `total_tokens` when a backend reports only the parts.
    pub fn normalized(mut self) -> Self {
        if self.total_tokens == 0 {
            self.total_tokens = self.input_tokens + self.output_tokens;
        }
        self
    }

    /// Additive; never decreases any counter.
    pub fn accumulate(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
        self.cached_tokens = add_optional(self.cached_tokens, other.cached_tokens);
        self.cache_creation_tokens =
            add_optional(self.cache_creation_tokens, other.cache_creation_tokens);
        self.cost = match (self.cost, other.cost) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or(0.0) + b.unwrap_or(0.0)),
        };
    }
}

fn add_optional(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (None, None) => None,
        (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Content,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<Content>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: vec![],
            tool_call_id: None,
            reasoning: None,
            usage: None,
        }
    }

    pub fn system(content: impl Into<Content>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<Content>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<Content>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<Content>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::new(Role::Tool, content)
        }
    }

    pub fn text(&self) -> String {
        self.content.text()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// Normalized JSON Schema.
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    /// Create a `ToolDefinition` after validating the name against all provider constraints.
    pub fn validated(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: &crate::schema::Schema,
    ) -> crate::error::Result<Self> {
        let name = name.into();
        validate_tool_name(&name)?;
        Ok(Self {
            name,
            description: description.into(),
            parameters: parameters.to_json_schema(),
        })
    }
}

/// Names every backend accepts once the OpenAI sanitizer has run: non-empty,
/// at most 64 characters, no whitespace.
pub fn validate_tool_name(name: &str) -> crate::error::Result<()> {
    if name.is_empty() || name.chars().count() > 64 {
        return Err(crate::error::LlmError::InvalidInput(format!(
            "tool name must be 1..=64 characters: {name:?}"
        )));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(crate::error::LlmError::InvalidInput(format!(
            "tool name must not contain whitespace: {name:?}"
        )));
    }
    Ok(())
}

/// Canonical streaming unit; nothing backend-specific crosses this boundary.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChatChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// Complete tool calls; decoders accumulate argument fragments themselves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl ChatChunk {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self {
            reasoning: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn tool_call(call: ToolCall) -> Self {
        Self {
            tool_calls: Some(vec![call]),
            ..Default::default()
        }
    }

    pub fn usage(usage: Usage) -> Self {
        Self {
            usage: Some(usage),
            ..Default::default()
        }
    }

    pub fn done(finish_reason: Option<String>, usage: Option<Usage>) -> Self {
        Self {
            done: true,
            finish_reason,
            usage,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

impl ChatResponse {
    pub fn into_message(self) -> ChatMessage {
        ChatMessage {
            role: Role::Assistant,
            content: Content::Text(self.content),
            tool_calls: self.tool_calls,
            tool_call_id: None,
            reasoning: self.reasoning,
            usage: Some(self.usage),
        }
    }
}

/// Split a message list into instruction messages and everything else,
/// preserving relative order within each half.
pub fn split_system_messages(messages: &[ChatMessage]) -> (Vec<ChatMessage>, Vec<ChatMessage>) {
    messages
        .iter()
        .cloned()
        .partition(|m| m.role.is_instruction())
}

/// Text first, then binary parts in caller order.
pub fn merge_content(text: impl Into<String>, parts: Vec<ContentPart>) -> Content {
    let text = text.into();
    if parts.is_empty() {
        return Content::Text(text);
    }
    let mut out = Vec::with_capacity(parts.len() + 1);
    if !text.is_empty() {
        out.push(ContentPart::text(text));
    }
    out.extend(parts);
    Content::Parts(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_preserves_relative_order() {
        let messages = vec![
            ChatMessage::system("a"),
            ChatMessage::user("1"),
            ChatMessage::new(Role::Developer, "b"),
            ChatMessage::assistant("2"),
            ChatMessage::system("c"),
        ];
        let (system, other) = split_system_messages(&messages);
        let system: Vec<String> = system.iter().map(ChatMessage::text).collect();
        let other: Vec<String> = other.iter().map(ChatMessage::text).collect();
        assert_eq!(system, vec!["a", "b", "c"]);
        assert_eq!(other, vec!["1", "2"]);
    }

    #[test]
    fn merge_puts_text_before_binary_parts() {
        let merged = merge_content(
            "describe these",
            vec![
                ContentPart::binary("image/png", b"one"),
                ContentPart::url("image/jpeg", "https://example.com/two.jpg"),
            ],
        );
        let Content::Parts(parts) = merged else {
            panic!("expected parts");
        };
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], ContentPart::text("describe these"));
        assert!(matches!(&parts[1], ContentPart::Binary { mime_type, .. } if mime_type == "image/png"));
        assert!(matches!(&parts[2], ContentPart::Binary { source: BinarySource::Url(_), .. }));
    }

    #[test]
    fn merge_without_parts_stays_plain_text() {
        assert_eq!(merge_content("hi", vec![]), Content::Text("hi".to_string()));
    }

    #[test]
    fn usage_accumulates_additively() {
        let mut total = Usage::default();
        total.accumulate(&Usage::new(10, 5));
        total.accumulate(&Usage {
            cached_tokens: Some(4),
            cost: Some(0.5),
            ..Usage::new(7, 3)
        });
        assert_eq!(total.input_tokens, 17);
        assert_eq!(total.output_tokens, 8);
        assert_eq!(total.total_tokens, 25);
        assert_eq!(total.cached_tokens, Some(4));
        assert_eq!(total.cost, Some(0.5));
    }

    #[test]
    fn empty_arguments_parse_as_empty_object() {
        let call = ToolCall::new("c1", "noop", "");
        assert_eq!(call.parse_arguments().unwrap(), serde_json::json!({}));
    }

    #[test]
    fn tool_names_with_whitespace_are_rejected() {
        assert!(validate_tool_name("get weather").is_err());
        assert!(validate_tool_name("").is_err());
        assert!(validate_tool_name("shell.execute").is_ok());
    }
}
