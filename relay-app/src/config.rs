//! Relay configuration loader.
//!
//! TOML on disk, then environment overrides, then validation.

use relay_chat::{DEFAULT_MAX_TOOL_CALLS, ToolExecution};
use relay_llm::{ModelPricing, PricingTable, ProviderConfig};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    #[serde(default)]
    pub pricing: Vec<ModelPricing>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: String::new(),
            instructions: None,
            temperature: None,
            max_tokens: None,
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub tool_execution: ToolExecution,
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tool_execution: ToolExecution::default(),
            max_tool_calls: default_max_tool_calls(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_max_tool_calls() -> usize {
    DEFAULT_MAX_TOOL_CALLS
}

fn default_request_timeout_secs() -> u64 {
    120
}

impl RelayConfig {
    /// An explicit path must exist. A missing default file is not an error;
    /// the environment alone may carry everything.
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let explicit = path.is_some();
        let path = path.unwrap_or_else(default_config_path);

        let mut cfg = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Self::from_toml_str(&contents)
                .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?,
            Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file; using defaults");
                Self::default()
            }
            Err(e) => return Err(anyhow::anyhow!("read config {}: {e}", path.display())),
        };

        cfg.apply_env_overrides(|key| std::env::var(key).ok());
        cfg.validate()?;
        tracing::info!(
            path = %path.display(),
            provider = %cfg.general.provider,
            model = %cfg.general.model,
            providers_configured = cfg.providers.len(),
            pricing_entries = cfg.pricing.len(),
            "config loaded"
        );
        Ok(cfg)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("RELAY_PROVIDER") {
            self.general.provider = v;
        }
        if let Some(v) = var("RELAY_MODEL") {
            self.general.model = v;
        }
        if let Some(v) = var("OPENAI_API_KEY") {
            self.provider_entry("openai").api_key = Some(v);
        }
        if let Some(v) = var("ANTHROPIC_API_KEY") {
            self.provider_entry("anthropic").api_key = Some(v);
        }
        if let Some(v) = var("GEMINI_API_KEY") {
            self.provider_entry("gemini").api_key = Some(v);
        }
        if let Some(v) = var("AWS_ACCESS_KEY_ID") {
            self.provider_entry("bedrock").access_key_id = Some(v);
        }
        if let Some(v) = var("AWS_SECRET_ACCESS_KEY") {
            self.provider_entry("bedrock").secret_access_key = Some(v);
        }
        if let Some(v) = var("AWS_SESSION_TOKEN") {
            self.provider_entry("bedrock").session_token = Some(v);
        }
        if let Some(v) = var("AWS_REGION") {
            self.provider_entry("bedrock").region = Some(v);
        }
    }

    fn provider_entry(&mut self, name: &str) -> &mut ProviderConfig {
        self.providers.entry(name.to_string()).or_default()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.general.provider.trim().is_empty() {
            return Err(anyhow::anyhow!("general.provider is required"));
        }
        if self.general.model.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "general.model is required (set it in the config file or RELAY_MODEL)"
            ));
        }
        if let Some(t) = self.general.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(anyhow::anyhow!("general.temperature must be within 0.0..=2.0"));
            }
        }
        if self.general.max_tokens == Some(0) {
            return Err(anyhow::anyhow!("general.max_tokens must be > 0"));
        }
        if self.engine.request_timeout_secs == 0 {
            return Err(anyhow::anyhow!("engine.request_timeout_secs must be > 0"));
        }
        for p in &self.pricing {
            let prices = [Some(p.input), Some(p.output), p.cached_input, p.cache_write];
            if prices.into_iter().flatten().any(|v| !v.is_finite() || v < 0.0) {
                return Err(anyhow::anyhow!(
                    "pricing for {}/{} must be non-negative",
                    p.provider,
                    p.model
                ));
            }
        }
        Ok(())
    }

    /// Settings for a backend; an unconfigured backend gets defaults.
    pub fn provider_config(&self, name: &str) -> ProviderConfig {
        self.providers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
            .unwrap_or_default()
    }

    pub fn pricing_table(&self) -> PricingTable {
        PricingTable::from_entries(self.pricing.iter().cloned())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.engine.request_timeout_secs)
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".relay").join("config.toml")
}
