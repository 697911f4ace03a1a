//! Inference request model.
//!
//! Requests are provider-neutral: role-tagged messages plus a caller-assigned
//! correlation id. Provider adapters translate them into each provider's wire
//! format at submission time.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A model identifier, e.g. `gpt-4o-mini` or `gemini-2.0-flash`.
///
/// The identifier determines which provider serves the request (see
/// [`crate::provider::ProviderRouting`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(String);

impl ModelId {
    /// Wraps a model identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModelId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Conversation role of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// End-user content.
    User,
    /// Model output (for few-shot or continuation prompts).
    Assistant,
}

/// One role-tagged message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Conversation role.
    pub role: Role,
    /// Message text.
    pub content: String,
}

impl Message {
    /// Creates a system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// Creates a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Creates an assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// One inference request within a batch submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceRequest {
    /// Caller-assigned correlation id, unique within the submission. Results
    /// are ordered by this id.
    pub custom_id: String,
    /// Target model; all requests in one submission must route to the same
    /// provider.
    pub model: ModelId,
    /// Role-tagged conversation content.
    pub messages: Vec<Message>,
}

impl InferenceRequest {
    /// Creates a request.
    #[must_use]
    pub fn new(custom_id: impl Into<String>, model: impl Into<ModelId>, messages: Vec<Message>) -> Self {
        Self {
            custom_id: custom_id.into(),
            model: model.into(),
            messages,
        }
    }
}

impl From<String> for ModelId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_serialize_lowercase() {
        let json = serde_json::to_string(&Role::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
    }

    #[test]
    fn request_serializes_camel_case() {
        let request = InferenceRequest::new("r1", "gpt-4o-mini", vec![Message::user("hi")]);
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("customId"));
        assert!(json.contains("\"model\":\"gpt-4o-mini\""));
    }
}
