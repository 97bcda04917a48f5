//! `relay ask` and `relay providers`.

use crate::config::RelayConfig;
use futures_util::StreamExt;
use relay_chat::{AskOptions, Chat, ToolExecution, TracingMiddleware};
use relay_llm::{ChatMessage, Provider, ProviderRegistry, Schema, ToolCall, TracedProvider};
use relay_tools::FnTool;
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct AskArgs {
    pub prompt: String,
    pub stream: bool,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub files: Vec<PathBuf>,
    pub tool_execution: Option<ToolExecution>,
}

pub fn registry() -> ProviderRegistry {
    let registry = ProviderRegistry::with_builtin();
    registry.install_interceptor(Arc::new(TracedProvider::wrap));
    registry
}

pub fn build_chat(
    cfg: &RelayConfig,
    provider: Arc<dyn Provider>,
    model: &str,
    tool_execution: ToolExecution,
) -> Chat {
    let mut chat = Chat::new(provider, model)
        .with_tool(current_time_tool())
        .with_tool_execution(tool_execution)
        .with_max_tool_calls(cfg.engine.max_tool_calls)
        .with_request_timeout(cfg.request_timeout())
        .with_pricing(Arc::new(cfg.pricing_table()))
        .with_middleware(TracingMiddleware);
    if let Some(instructions) = &cfg.general.instructions {
        chat = chat.with_instructions(instructions.clone());
    }
    if let Some(t) = cfg.general.temperature {
        chat = chat.with_temperature(t);
    }
    if let Some(n) = cfg.general.max_tokens {
        chat = chat.with_max_tokens(n);
    }
    if tool_execution == ToolExecution::Confirm {
        chat = chat.on_confirm_tool_call(confirm_on_terminal);
    }
    chat
}

fn current_time_tool() -> FnTool {
    FnTool::new(
        "current_time",
        "Current UTC date and time in RFC 3339 format.",
        Schema::empty(),
        |_| async { Ok(json!(chrono::Utc::now().to_rfc3339())) },
    )
}

async fn confirm_on_terminal(call: ToolCall) -> bool {
    eprint!("run tool {}({})? [y/N] ", call.name, call.arguments);
    let _ = std::io::stderr().flush();
    let mut line = String::new();
    match BufReader::new(tokio::io::stdin()).read_line(&mut line).await {
        Ok(_) => matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
        Err(e) => {
            tracing::warn!(error = %e, "failed to read confirmation; rejecting tool call");
            false
        }
    }
}

pub async fn ask(cfg: &RelayConfig, args: AskArgs) -> anyhow::Result<()> {
    let provider_name = args.provider.as_deref().unwrap_or(&cfg.general.provider);
    let model = args.model.as_deref().unwrap_or(&cfg.general.model);
    let tool_execution = args.tool_execution.unwrap_or(cfg.engine.tool_execution);

    let provider = registry()
        .resolve(provider_name, &cfg.provider_config(provider_name))
        .map_err(|e| anyhow::anyhow!("resolve provider {provider_name}: {e}"))?;
    let mut chat = build_chat(cfg, provider, model, tool_execution);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; cancelling");
            on_interrupt.cancel();
        }
    });

    let mut options = AskOptions::new().with_cancellation(cancel);
    for file in args.files {
        options = options.with_file(file);
    }

    let message = if args.stream {
        stream_to_stdout(&mut chat, args.prompt, options).await?
    } else {
        let message = chat.ask(args.prompt, options).await?;
        println!("{}", message.text());
        message
    };
    print_pending_tool_calls(&message)?;

    let usage = chat.total_usage();
    tracing::info!(
        input_tokens = usage.input_tokens,
        output_tokens = usage.output_tokens,
        total_tokens = usage.total_tokens,
        cost_usd = ?usage.cost,
        "usage"
    );
    Ok(())
}

async fn stream_to_stdout(
    chat: &mut Chat,
    prompt: String,
    options: AskOptions,
) -> anyhow::Result<ChatMessage> {
    let mut stdout = std::io::stdout();
    let mut stream = chat.stream(prompt, options);
    while let Some(item) = stream.next().await {
        let chunk = item?;
        if let Some(text) = &chunk.content {
            write!(stdout, "{text}")?;
            stdout.flush()?;
        }
    }
    writeln!(stdout)?;
    Ok(stream.into_message().await?)
}

/// Dry-run mode leaves the requested calls on the final message.
fn print_pending_tool_calls(message: &ChatMessage) -> anyhow::Result<()> {
    if message.tool_calls.is_empty() {
        return Ok(());
    }
    println!("{}", serde_json::to_string_pretty(&message.tool_calls)?);
    Ok(())
}

pub fn providers(cfg: &RelayConfig) {
    let registry = registry();
    for name in registry.names() {
        let configured = cfg.providers.keys().any(|k| k.eq_ignore_ascii_case(&name));
        let marker = if name.eq_ignore_ascii_case(&cfg.general.provider) {
            "*"
        } else {
            " "
        };
        println!(
            "{marker} {name}{}",
            if configured { "" } else { " (not configured)" }
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_carries_builtins_and_the_tracing_interceptor() {
        let registry = registry();
        assert!(registry.has_interceptor());
        assert_eq!(
            registry.names(),
            vec!["anthropic", "bedrock", "gemini", "openai"]
        );
    }

    #[test]
    fn chat_is_built_from_config() {
        let cfg = RelayConfig::from_toml_str(
            r#"
[general]
provider = "openai"
model = "gpt-4o-mini"

[engine]
tool_execution = "confirm"

[providers.openai]
api_key = "sk-test"
"#,
        )
        .unwrap();
        let provider = registry()
            .resolve("openai", &cfg.provider_config("openai"))
            .unwrap();
        let chat = build_chat(&cfg, provider, "gpt-4o", cfg.engine.tool_execution);
        assert_eq!(chat.model(), "gpt-4o");
        assert_eq!(chat.provider().name(), "openai");
        assert_eq!(chat.tool_execution(), ToolExecution::Confirm);
        assert!(chat.history().is_empty());
    }

    #[tokio::test]
    async fn current_time_tool_returns_rfc3339() {
        use relay_tools::Tool;
        let out = current_time_tool().execute(json!({})).await.unwrap();
        let text = out.as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(text).is_ok());
    }
}
