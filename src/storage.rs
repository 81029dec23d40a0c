//! Persistence and credential collaborator interfaces.
//!
//! The relational schema and the key-encryption primitive live outside this
//! crate; the pipeline only sees the traits below. `InMemoryStore` is a
//! reference implementation used by the demo binary and the test suite.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::errors::{ChatError, ChatResult};
use crate::models::Provider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One turn of a conversation as handed to the context assembler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
}

impl ConversationMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRecord {
    pub id: String,
    pub user_id: String,
    pub title: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Write request for a new message row.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub chat_id: String,
    pub role: Role,
    pub content: String,
    /// Model that produced the content; set for assistant messages only.
    pub model: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: Uuid,
    pub chat_id: String,
    pub role: Role,
    pub content: String,
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Encrypted provider key as stored per (user, provider).
#[derive(Debug, Clone)]
pub struct EncryptedCredential {
    pub secret: String,
    /// Set when the key was last verified against the live provider. Not
    /// re-checked at dispatch time; a revoked key fails at the provider call.
    pub is_validated: bool,
    pub last_validated_at: Option<DateTime<Utc>>,
}

/// Chat and message persistence as seen from inside the pipeline.
///
/// Every write is a single independent statement. Streaming can last tens of
/// seconds, so no transaction is ever held open across a stream.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn find_chat_with_history(
        &self,
        chat_id: &str,
        user_id: &str,
    ) -> ChatResult<Option<(ChatRecord, Vec<ConversationMessage>)>>;

    async fn create_message(&self, message: NewMessage) -> ChatResult<StoredMessage>;

    async fn touch_chat_updated_at(&self, chat_id: &str) -> ChatResult<()>;
}

/// Read access to stored provider credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_encrypted_secret(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> ChatResult<Option<EncryptedCredential>>;
}

#[derive(Error, Debug)]
#[error("decryption failed: {0}")]
pub struct CipherError(pub String);

/// Decryption primitive for stored API keys. The user id participates in key
/// derivation, so one user's ciphertext is not decryptable in another user's
/// context.
pub trait SecretCipher: Send + Sync {
    fn decrypt(&self, ciphertext: &str, user_id: &str) -> Result<String, CipherError>;
}

// ---------------------------------------------------------------------------
// In-memory reference implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    chats: HashMap<String, ChatRecord>,
    messages: HashMap<String, Vec<StoredMessage>>,
    credentials: HashMap<(String, Provider), EncryptedCredential>,
}

/// In-memory `ChatStore` + `CredentialStore` backed by a mutex-guarded map.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<MemoryInner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a chat owned by `user_id` and return its id.
    pub fn seed_chat(&self, user_id: &str) -> String {
        let id = Uuid::new_v4().to_string();
        let mut inner = self.inner.lock().expect("store poisoned");
        inner.chats.insert(
            id.clone(),
            ChatRecord {
                id: id.clone(),
                user_id: user_id.to_string(),
                title: None,
                updated_at: Utc::now(),
            },
        );
        inner.messages.insert(id.clone(), Vec::new());
        id
    }

    /// Append a history message directly, bypassing the pipeline.
    pub fn seed_message(&self, chat_id: &str, role: Role, content: &str) {
        let mut inner = self.inner.lock().expect("store poisoned");
        let messages = inner.messages.entry(chat_id.to_string()).or_default();
        messages.push(StoredMessage {
            id: Uuid::new_v4(),
            chat_id: chat_id.to_string(),
            role,
            content: content.to_string(),
            model: None,
            created_at: Utc::now(),
        });
    }

    pub fn put_credential(&self, user_id: &str, provider: Provider, credential: EncryptedCredential) {
        let mut inner = self.inner.lock().expect("store poisoned");
        inner
            .credentials
            .insert((user_id.to_string(), provider), credential);
    }

    /// All messages persisted for a chat, in insertion order.
    pub fn messages(&self, chat_id: &str) -> Vec<StoredMessage> {
        let inner = self.inner.lock().expect("store poisoned");
        inner.messages.get(chat_id).cloned().unwrap_or_default()
    }

    pub fn chat(&self, chat_id: &str) -> Option<ChatRecord> {
        let inner = self.inner.lock().expect("store poisoned");
        inner.chats.get(chat_id).cloned()
    }
}

#[async_trait]
impl ChatStore for InMemoryStore {
    async fn find_chat_with_history(
        &self,
        chat_id: &str,
        user_id: &str,
    ) -> ChatResult<Option<(ChatRecord, Vec<ConversationMessage>)>> {
        let inner = self.inner.lock().map_err(|_| ChatError::storage("store poisoned"))?;
        let Some(chat) = inner.chats.get(chat_id) else {
            return Ok(None);
        };
        if chat.user_id != user_id {
            // Chats are scoped to their owner; treat foreign ids as absent.
            return Ok(None);
        }
        let history = inner
            .messages
            .get(chat_id)
            .map(|messages| {
                messages
                    .iter()
                    .map(|m| ConversationMessage {
                        role: m.role,
                        content: m.content.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(Some((chat.clone(), history)))
    }

    async fn create_message(&self, message: NewMessage) -> ChatResult<StoredMessage> {
        let mut inner = self.inner.lock().map_err(|_| ChatError::storage("store poisoned"))?;
        if !inner.chats.contains_key(&message.chat_id) {
            return Err(ChatError::storage(format!(
                "chat {} does not exist",
                message.chat_id
            )));
        }
        let stored = StoredMessage {
            id: Uuid::new_v4(),
            chat_id: message.chat_id.clone(),
            role: message.role,
            content: message.content,
            model: message.model,
            created_at: Utc::now(),
        };
        inner
            .messages
            .entry(message.chat_id)
            .or_default()
            .push(stored.clone());
        Ok(stored)
    }

    async fn touch_chat_updated_at(&self, chat_id: &str) -> ChatResult<()> {
        let mut inner = self.inner.lock().map_err(|_| ChatError::storage("store poisoned"))?;
        if let Some(chat) = inner.chats.get_mut(chat_id) {
            chat.updated_at = Utc::now();
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for InMemoryStore {
    async fn get_encrypted_secret(
        &self,
        user_id: &str,
        provider: Provider,
    ) -> ChatResult<Option<EncryptedCredential>> {
        let inner = self.inner.lock().map_err(|_| ChatError::storage("store poisoned"))?;
        Ok(inner
            .credentials
            .get(&(user_id.to_string(), provider))
            .cloned())
    }
}

/// Cipher stand-in whose ciphertext format is `enc:{user_id}:{plaintext}`.
/// Decryption fails for any other user's context, mirroring user-bound key
/// derivation in the real primitive.
pub struct TaggedCipher;

impl TaggedCipher {
    pub fn encrypt(plaintext: &str, user_id: &str) -> String {
        format!("enc:{user_id}:{plaintext}")
    }
}

impl SecretCipher for TaggedCipher {
    fn decrypt(&self, ciphertext: &str, user_id: &str) -> Result<String, CipherError> {
        let rest = ciphertext
            .strip_prefix("enc:")
            .ok_or_else(|| CipherError("malformed ciphertext".to_string()))?;
        let (owner, plaintext) = rest
            .split_once(':')
            .ok_or_else(|| CipherError("malformed ciphertext".to_string()))?;
        if owner != user_id {
            return Err(CipherError("key derivation mismatch".to_string()));
        }
        Ok(plaintext.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn foreign_user_cannot_see_chat() {
        let store = InMemoryStore::new();
        let chat_id = store.seed_chat("alice");
        assert!(
            store
                .find_chat_with_history(&chat_id, "mallory")
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            store
                .find_chat_with_history(&chat_id, "alice")
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn create_message_requires_existing_chat() {
        let store = InMemoryStore::new();
        let err = store
            .create_message(NewMessage {
                chat_id: "missing".to_string(),
                role: Role::User,
                content: "hi".to_string(),
                model: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "storage_error");
    }

    #[test]
    fn tagged_cipher_is_user_bound() {
        let ciphertext = TaggedCipher::encrypt("sk-secret", "alice");
        assert_eq!(
            TaggedCipher.decrypt(&ciphertext, "alice").unwrap(),
            "sk-secret"
        );
        assert!(TaggedCipher.decrypt(&ciphertext, "bob").is_err());
        assert!(TaggedCipher.decrypt("garbage", "alice").is_err());
    }
}
