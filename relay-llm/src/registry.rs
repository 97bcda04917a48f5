use crate::anthropic::AnthropicProvider;
use crate::bedrock::BedrockProvider;
use crate::error::{LlmError, Result};
use crate::gemini::GeminiProvider;
use crate::openai::OpenAiProvider;
use crate::provider::{Provider, ProviderConfig};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use std::sync::Arc;

pub type ProviderFactory =
    Arc<dyn Fn(&ProviderConfig) -> Result<Arc<dyn Provider>> + Send + Sync>;

/// Wraps every resolved provider, e.g. [`crate::TracedProvider::wrap`].
pub type Interceptor = Arc<dyn Fn(Arc<dyn Provider>) -> Arc<dyn Provider> + Send + Sync>;

/// Name to factory lookup with a single, explicitly managed interceptor slot.
///
/// Names are case-insensitive. The first registration for a name wins; later
/// ones are ignored so an already-wired backend cannot be swapped out.
#[derive(Default)]
pub struct ProviderRegistry {
    factories: DashMap<String, ProviderFactory>,
    interceptor: RwLock<Option<Interceptor>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.names())
            .field("interceptor", &self.has_interceptor())
            .finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the OpenAI, Anthropic, Gemini and Bedrock backends.
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        registry.register(crate::openai::NAME, |c: &ProviderConfig| {
            Ok(Arc::new(OpenAiProvider::new(c)?) as Arc<dyn Provider>)
        });
        registry.register(crate::anthropic::NAME, |c: &ProviderConfig| {
            Ok(Arc::new(AnthropicProvider::new(c)?) as Arc<dyn Provider>)
        });
        registry.register(crate::gemini::NAME, |c: &ProviderConfig| {
            Ok(Arc::new(GeminiProvider::new(c)?) as Arc<dyn Provider>)
        });
        registry.register(crate::bedrock::NAME, |c: &ProviderConfig| {
            Ok(Arc::new(BedrockProvider::new(c)?) as Arc<dyn Provider>)
        });
        registry
    }

    /// Returns `false` when the name was already taken.
    pub fn register<F>(&self, name: &str, factory: F) -> bool
    where
        F: Fn(&ProviderConfig) -> Result<Arc<dyn Provider>> + Send + Sync + 'static,
    {
        match self.factories.entry(name.to_ascii_lowercase()) {
            Entry::Occupied(_) => {
                tracing::warn!(provider = name, "provider already registered; ignoring");
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(factory));
                tracing::debug!(provider = name, "provider registered");
                true
            }
        }
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.factories.contains_key(&name.to_ascii_lowercase())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Replaces whatever interceptor was installed and returns it.
    pub fn install_interceptor(&self, interceptor: Interceptor) -> Option<Interceptor> {
        self.interceptor.write().replace(interceptor)
    }

    pub fn clear_interceptor(&self) -> Option<Interceptor> {
        self.interceptor.write().take()
    }

    pub fn has_interceptor(&self) -> bool {
        self.interceptor.read().is_some()
    }

    #[tracing::instrument(level = "debug", skip(self, config))]
    pub fn resolve(&self, name: &str, config: &ProviderConfig) -> Result<Arc<dyn Provider>> {
        let factory = self
            .factories
            .get(&name.to_ascii_lowercase())
            .map(|f| Arc::clone(f.value()))
            .ok_or_else(|| LlmError::ProviderNotRegistered(name.to_string()))?;
        let provider = factory(config)?;

        let interceptor = self.interceptor.read().clone();
        Ok(match interceptor {
            Some(wrap) => wrap(provider),
            None => provider,
        })
    }
}
