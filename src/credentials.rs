//! Per-user provider credential resolution.

use std::sync::Arc;

use crate::errors::{ChatError, ChatResult};
use crate::models::ModelSpec;
use crate::storage::{CredentialStore, SecretCipher};

/// Resolves the API key to use for one provider call.
///
/// The secret is decrypted in memory for the duration of a single call and
/// never logged. Validity against the live provider is tracked where keys are
/// saved, not here: a key that was revoked after validation surfaces as a
/// provider error at call time.
pub struct CredentialResolver {
    store: Arc<dyn CredentialStore>,
    cipher: Arc<dyn SecretCipher>,
}

impl CredentialResolver {
    pub fn new(store: Arc<dyn CredentialStore>, cipher: Arc<dyn SecretCipher>) -> Self {
        Self { store, cipher }
    }

    /// Returns `None` for models on the always-free provider (no lookup at
    /// all), or the decrypted per-user key otherwise.
    pub async fn resolve(&self, model: &ModelSpec, user_id: &str) -> ChatResult<Option<String>> {
        let provider = model.provider;
        if provider.is_always_free() {
            return Ok(None);
        }

        let credential = self
            .store
            .get_encrypted_secret(user_id, provider)
            .await?
            .ok_or(ChatError::NoCredential { provider })?;

        let secret = self
            .cipher
            .decrypt(&credential.secret, user_id)
            .map_err(|err| {
                tracing::warn!(%provider, error = %err, "credential decryption failed");
                ChatError::InvalidCredential { provider }
            })?;

        Ok(Some(secret))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DEFAULT_MODEL, ModelRegistry, Provider};
    use crate::storage::{EncryptedCredential, InMemoryStore, TaggedCipher};

    fn resolver(store: Arc<InMemoryStore>) -> CredentialResolver {
        CredentialResolver::new(store, Arc::new(TaggedCipher))
    }

    #[tokio::test]
    async fn free_provider_skips_lookup_entirely() {
        let registry = ModelRegistry::builtin();
        let model = registry.get(DEFAULT_MODEL).unwrap();
        // No credential seeded; the free path must not even look.
        let resolver = resolver(Arc::new(InMemoryStore::new()));
        assert_eq!(resolver.resolve(model, "alice").await.unwrap(), None);
    }

    #[tokio::test]
    async fn missing_credential_is_a_typed_error() {
        let registry = ModelRegistry::builtin();
        let model = registry.get("gpt-4o").unwrap();
        let resolver = resolver(Arc::new(InMemoryStore::new()));
        let err = resolver.resolve(model, "alice").await.unwrap_err();
        assert!(matches!(
            err,
            ChatError::NoCredential {
                provider: Provider::OpenAi
            }
        ));
    }

    #[tokio::test]
    async fn stored_credential_is_decrypted_for_its_owner() {
        let registry = ModelRegistry::builtin();
        let model = registry.get("gpt-4o").unwrap();
        let store = Arc::new(InMemoryStore::new());
        store.put_credential(
            "alice",
            Provider::OpenAi,
            EncryptedCredential {
                secret: TaggedCipher::encrypt("sk-alice", "alice"),
                is_validated: true,
                last_validated_at: None,
            },
        );
        let resolver = resolver(store);
        assert_eq!(
            resolver.resolve(model, "alice").await.unwrap(),
            Some("sk-alice".to_string())
        );
    }

    #[tokio::test]
    async fn undecryptable_credential_is_distinct_from_missing() {
        let registry = ModelRegistry::builtin();
        let model = registry.get("claude-3-5-haiku-20241022").unwrap();
        let store = Arc::new(InMemoryStore::new());
        // Ciphertext bound to another user's context.
        store.put_credential(
            "alice",
            Provider::Anthropic,
            EncryptedCredential {
                secret: TaggedCipher::encrypt("sk-ant", "bob"),
                is_validated: true,
                last_validated_at: None,
            },
        );
        let resolver = resolver(store);
        let err = resolver.resolve(model, "alice").await.unwrap_err();
        assert!(matches!(
            err,
            ChatError::InvalidCredential {
                provider: Provider::Anthropic
            }
        ));
    }
}
