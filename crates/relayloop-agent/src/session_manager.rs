use anyhow::Result;
use std::sync::Arc;

use crate::storage::Storage;
use relayloop_core::config::AgentMode;

/// Thin coordinator over `Storage` for the parent/child session hierarchy.
/// Holds no state of its own beyond the storage handle — every query is a
/// direct pass-through, so two `SessionManager`s sharing one `Storage` stay
/// consistent automatically.
pub struct SessionManager {
    storage: Arc<dyn Storage>,
}

impl SessionManager {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Mint a unique child session id under `parent_id`, persist it, and
    /// return the id. `prompt` seeds the child's first turn elsewhere
    /// (Delegation); the session record itself only needs a title.
    pub async fn create_child_session(
        &self,
        parent_id: &str,
        model: &str,
        prompt: &str,
        title: Option<&str>,
    ) -> Result<String> {
        let id = format!("child-{}", uuid::Uuid::new_v4());
        let title = title.map(String::from).unwrap_or_else(|| truncate_title(prompt));
        self.storage
            .create_session(&id, &title, model, Some(parent_id), AgentMode::Child)
            .await?;
        Ok(id)
    }

    pub async fn get_children(&self, parent_id: &str) -> Result<Vec<String>> {
        self.storage.get_child_sessions(parent_id).await
    }

    pub async fn get_hierarchy(&self, id: &str) -> Result<Option<crate::storage::SessionRecord>> {
        self.storage.get_session_hierarchy(id).await
    }

    pub async fn is_child_session(&self, id: &str) -> Result<bool> {
        Ok(self
            .get_hierarchy(id)
            .await?
            .map(|r| r.parent_id.is_some())
            .unwrap_or(false))
    }

    pub async fn get_agent_mode(&self, id: &str) -> Result<Option<AgentMode>> {
        Ok(self.get_hierarchy(id).await?.map(|r| r.agent_mode))
    }
}

fn truncate_title(prompt: &str) -> String {
    const MAX_LEN: usize = 60;
    if prompt.len() <= MAX_LEN {
        prompt.to_string()
    } else {
        let mut truncated: String = prompt.chars().take(MAX_LEN).collect();
        truncated.push('…');
        truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;

    async fn manager() -> (SessionManager, Arc<dyn Storage>) {
        let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::open_memory().unwrap());
        storage
            .create_session("parent", "root", "m", None, AgentMode::Parent)
            .await
            .unwrap();
        (SessionManager::new(storage.clone()), storage)
    }

    #[tokio::test]
    async fn test_create_child_session_sets_mode_and_parent() {
        let (mgr, _storage) = manager().await;
        let child_id = mgr
            .create_child_session("parent", "m", "do the thing", None)
            .await
            .unwrap();

        assert!(mgr.is_child_session(&child_id).await.unwrap());
        assert_eq!(mgr.get_agent_mode(&child_id).await.unwrap(), Some(AgentMode::Child));
        assert_eq!(mgr.get_children("parent").await.unwrap(), vec![child_id]);
    }

    #[tokio::test]
    async fn test_parent_is_not_a_child() {
        let (mgr, _storage) = manager().await;
        assert!(!mgr.is_child_session("parent").await.unwrap());
        assert_eq!(mgr.get_agent_mode("parent").await.unwrap(), Some(AgentMode::Parent));
    }

    #[tokio::test]
    async fn test_title_falls_back_to_truncated_prompt() {
        let (mgr, storage) = manager().await;
        let child_id = mgr
            .create_child_session("parent", "m", "a very specific task description", None)
            .await
            .unwrap();
        let record = storage.get_session_hierarchy(&child_id).await.unwrap().unwrap();
        assert_eq!(record.title, "a very specific task description");
    }
}
