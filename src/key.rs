//! Call identity used to shard rate and circuit state

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity under which rate budgets and circuit state are tracked.
///
/// Two calls with different keys never share budget or circuit state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallKey {
    /// Platform name (e.g. `twitter`, `openai`)
    pub platform: String,
    /// Endpoint name within the platform
    pub endpoint: String,
    /// Optional user the budget is scoped to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl CallKey {
    /// Create a key without a user scope
    pub fn new(platform: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            endpoint: endpoint.into(),
            user_id: None,
        }
    }

    /// Scope the key to a user
    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Stable encoding used at the storage boundary.
    ///
    /// Format: `{namespace}:{platform}:{endpoint}:{user|~}`. Components are
    /// form-urlencoded, so neither a `:` nor a literal `~` inside a component
    /// can forge another key.
    #[must_use]
    pub fn storage_key(&self, namespace: &str) -> String {
        let user = self.user_id.as_deref().map_or_else(|| "~".to_string(), encode);
        format!(
            "{namespace}:{}:{}:{user}",
            encode(&self.platform),
            encode(&self.endpoint)
        )
    }
}

fn encode(component: &str) -> String {
    url::form_urlencoded::byte_serialize(component.as_bytes()).collect()
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.user_id {
            Some(user) => write!(f, "{}:{}@{user}", self.platform, self.endpoint),
            None => write!(f, "{}:{}", self.platform, self.endpoint),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_key_without_user() {
        let key = CallKey::new("twitter", "post_tweet");
        assert_eq!(key.storage_key("rate"), "rate:twitter:post_tweet:~");
    }

    #[test]
    fn test_storage_key_with_user() {
        let key = CallKey::new("openai", "chat").with_user("42");
        assert_eq!(key.storage_key("circuit"), "circuit:openai:chat:42");
    }

    #[test]
    fn test_storage_key_escapes_separator() {
        let a = CallKey::new("a:b", "c");
        let b = CallKey::new("a", "b:c");
        assert_ne!(a.storage_key("rate"), b.storage_key("rate"));
    }

    #[test]
    fn test_user_tilde_does_not_collide_with_missing_user() {
        let anonymous = CallKey::new("x", "y");
        let tilde_user = CallKey::new("x", "y").with_user("~");
        assert_ne!(anonymous.storage_key("rate"), tilde_user.storage_key("rate"));
    }

    #[test]
    fn test_display() {
        assert_eq!(CallKey::new("linkedin", "share").to_string(), "linkedin:share");
        assert_eq!(
            CallKey::new("linkedin", "share").with_user("7").to_string(),
            "linkedin:share@7"
        );
    }
}
