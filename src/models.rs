use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The external LLM vendors the relay can route to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Groq,
    OpenAi,
    Anthropic,
    Google,
}

impl Provider {
    pub const ALL: [Provider; 4] = [
        Provider::Groq,
        Provider::OpenAi,
        Provider::Anthropic,
        Provider::Google,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Groq => "groq",
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Google => "google",
        }
    }

    /// Whether models on this provider are served with the relay's own
    /// service key instead of a per-user credential.
    pub fn is_always_free(self) -> bool {
        matches!(self, Provider::Groq)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in the static model catalog.
#[derive(Debug, Clone, Serialize)]
pub struct ModelSpec {
    pub id: &'static str,
    pub display_name: &'static str,
    pub provider: Provider,
    pub is_free: bool,
    /// Combined prompt + history token budget the model accepts.
    pub context_window_tokens: usize,
    /// Hard cap on a single inbound message, in characters.
    pub max_message_length: usize,
    pub max_output_tokens: u32,
}

/// Model used when the client does not ask for one. Must be free and require
/// no credential.
pub const DEFAULT_MODEL: &str = "deepseek-r1-distill-llama-70b";

/// Static catalog of available models. Loaded once at process start; ids are
/// globally unique across providers.
const CATALOG: &[ModelSpec] = &[
    ModelSpec {
        id: "deepseek-r1-distill-llama-70b",
        display_name: "DeepSeek R1 Distill 70B",
        provider: Provider::Groq,
        is_free: true,
        context_window_tokens: 128_000,
        max_message_length: 32_000,
        max_output_tokens: 8_192,
    },
    ModelSpec {
        id: "llama-3.3-70b-versatile",
        display_name: "Llama 3.3 70B",
        provider: Provider::Groq,
        is_free: true,
        context_window_tokens: 128_000,
        max_message_length: 32_000,
        max_output_tokens: 8_192,
    },
    ModelSpec {
        id: "llama-3.1-8b-instant",
        display_name: "Llama 3.1 8B",
        provider: Provider::Groq,
        is_free: true,
        context_window_tokens: 128_000,
        max_message_length: 32_000,
        max_output_tokens: 8_192,
    },
    ModelSpec {
        id: "gpt-4o",
        display_name: "GPT-4o",
        provider: Provider::OpenAi,
        is_free: false,
        context_window_tokens: 128_000,
        max_message_length: 32_000,
        max_output_tokens: 16_384,
    },
    ModelSpec {
        id: "gpt-4o-mini",
        display_name: "GPT-4o mini",
        provider: Provider::OpenAi,
        is_free: false,
        context_window_tokens: 128_000,
        max_message_length: 32_000,
        max_output_tokens: 16_384,
    },
    ModelSpec {
        id: "claude-sonnet-4-20250514",
        display_name: "Claude Sonnet 4",
        provider: Provider::Anthropic,
        is_free: false,
        context_window_tokens: 200_000,
        max_message_length: 32_000,
        max_output_tokens: 8_192,
    },
    ModelSpec {
        id: "claude-3-5-haiku-20241022",
        display_name: "Claude 3.5 Haiku",
        provider: Provider::Anthropic,
        is_free: false,
        context_window_tokens: 200_000,
        max_message_length: 32_000,
        max_output_tokens: 8_192,
    },
    ModelSpec {
        id: "gemini-2.0-flash",
        display_name: "Gemini 2.0 Flash",
        provider: Provider::Google,
        is_free: false,
        context_window_tokens: 1_048_576,
        max_message_length: 32_000,
        max_output_tokens: 8_192,
    },
    ModelSpec {
        id: "gemini-1.5-pro",
        display_name: "Gemini 1.5 Pro",
        provider: Provider::Google,
        is_free: false,
        context_window_tokens: 1_048_576,
        max_message_length: 32_000,
        max_output_tokens: 8_192,
    },
];

/// Pure lookup table over the static catalog. No side effects; "not found"
/// is the caller's problem.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    index: HashMap<&'static str, &'static ModelSpec>,
}

impl ModelRegistry {
    pub fn builtin() -> Self {
        let mut index = HashMap::with_capacity(CATALOG.len());
        for model in CATALOG {
            let previous = index.insert(model.id, model);
            debug_assert!(previous.is_none(), "duplicate model id: {}", model.id);
        }
        Self { index }
    }

    pub fn get(&self, id: &str) -> Option<&'static ModelSpec> {
        self.index.get(id).copied()
    }

    pub fn all(&self) -> impl Iterator<Item = &'static ModelSpec> + '_ {
        CATALOG.iter()
    }

    /// Catalog grouped by provider, for the model-listing endpoint.
    pub fn by_provider(&self) -> HashMap<Provider, Vec<&'static ModelSpec>> {
        let mut groups: HashMap<Provider, Vec<&'static ModelSpec>> = HashMap::new();
        for model in CATALOG {
            groups.entry(model.provider).or_default().push(model);
        }
        groups
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_ids_are_globally_unique() {
        let mut seen = std::collections::HashSet::new();
        for model in CATALOG {
            assert!(seen.insert(model.id), "duplicate model id: {}", model.id);
        }
    }

    #[test]
    fn default_model_is_free_and_credential_free() {
        let registry = ModelRegistry::builtin();
        let model = registry.get(DEFAULT_MODEL).expect("default model missing");
        assert!(model.is_free);
        assert!(model.provider.is_always_free());
    }

    #[test]
    fn lookup_misses_return_none() {
        let registry = ModelRegistry::builtin();
        assert!(registry.get("gpt-17").is_none());
    }

    #[test]
    fn grouping_covers_every_catalog_entry() {
        let registry = ModelRegistry::builtin();
        let groups = registry.by_provider();
        let total: usize = groups.values().map(Vec::len).sum();
        assert_eq!(total, CATALOG.len());
        assert!(groups.contains_key(&Provider::Groq));
        assert!(groups.contains_key(&Provider::Anthropic));
    }

    #[test]
    fn provider_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&Provider::OpenAi).unwrap(),
            "\"openai\""
        );
        assert_eq!(Provider::Google.to_string(), "google");
    }
}
