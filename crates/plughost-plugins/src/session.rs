//! Session manager seam (§3 `PluginContext`'s session manager, §4.4 `SESSION_REQUEST`).
//!
//! Session identity and conversation state belong to the agent runtime, out of scope
//! here (§1). This defines the trait C6 dispatches `SESSION_REQUEST` onto, plus a
//! minimal in-process implementation.

use async_trait::async_trait;
use dashmap::DashMap;

/// Session lifecycle operations a plugin may request (§4.4).
#[async_trait]
pub trait SessionManager: Send + Sync {
    /// Create a session, returning its id.
    async fn create(&self, metadata: serde_json::Value) -> Option<String>;
    /// Fetch a session's metadata by id.
    async fn get(&self, id: &str) -> Option<serde_json::Value>;
    /// Destroy a session, returning whether one existed.
    async fn destroy(&self, id: &str) -> bool;
    /// List all live session ids.
    async fn list(&self) -> Vec<String>;
}

/// In-process session table, sessions addressed by a generated UUID.
#[derive(Default)]
pub struct InMemorySessionManager {
    sessions: DashMap<String, serde_json::Value>,
}

impl InMemorySessionManager {
    /// Create an empty session manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionManager for InMemorySessionManager {
    async fn create(&self, metadata: serde_json::Value) -> Option<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.sessions.insert(id.clone(), metadata);
        Some(id)
    }

    async fn get(&self, id: &str) -> Option<serde_json::Value> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    async fn destroy(&self, id: &str) -> bool {
        self.sessions.remove(id).is_some()
    }

    async fn list(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_get_destroy_round_trip() {
        let manager = InMemorySessionManager::new();
        let id = manager.create(serde_json::json!({"user": "a"})).await.unwrap();
        assert!(manager.get(&id).await.is_some());
        assert!(manager.destroy(&id).await);
        assert!(manager.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn list_reflects_live_sessions() {
        let manager = InMemorySessionManager::new();
        let a = manager.create(serde_json::json!({})).await.unwrap();
        let b = manager.create(serde_json::json!({})).await.unwrap();
        let mut ids = manager.list().await;
        ids.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(ids, expected);
    }
}
