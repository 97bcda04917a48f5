//! Vendor-neutral LLM provider layer for relay.
//!
//! Canonical message and chunk types, the [`Provider`] contract, a
//! [`ProviderRegistry`], wire decoders for SSE and binary event-stream
//! responses, a SigV4 signer and token cost attribution. Backends:
//! OpenAI Chat Completions, Anthropic Messages, Google Gemini and AWS
//! Bedrock Converse.

mod anthropic;
mod bedrock;
mod error;
pub mod eventstream;
mod gemini;
mod http;
mod openai;
pub mod pricing;
mod provider;
mod registry;
mod schema;
pub mod sigv4;
pub mod sse;
mod stream;
mod types;

pub use anthropic::AnthropicProvider;
pub use bedrock::BedrockProvider;
pub use error::{LlmError, Result};
pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;
pub use pricing::{Cost, ModelPricing, PricingTable, calculate_cost};
pub use provider::{
    Capabilities, ChatRequest, ChunkStream, Provider, ProviderConfig, TracedProvider,
};
pub use registry::{Interceptor, ProviderFactory, ProviderRegistry};
pub use schema::{ResponseFormat, Schema};
pub use types::{
    BinarySource, ChatChunk, ChatMessage, ChatResponse, Content, ContentPart, Role, ToolCall,
    ToolDefinition, Usage, merge_content, split_system_messages, validate_tool_name,
};
