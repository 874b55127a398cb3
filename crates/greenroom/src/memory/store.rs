//! File-backed agent memory store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::context::manager::AgentMemory;

/// Fallback filename component for ids that sanitize to nothing
const DEFAULT_COMPONENT: &str = "default";

/// Stores one JSON document per `(agent_type, story_id)` pair under a root
/// directory, with an in-memory cache in front of the filesystem.
///
/// Filenames are `{agent_type}_{story_id}.json` with every non-alphanumeric
/// character stripped from both components, so caller-supplied ids can never
/// escape the root directory.
pub struct FileMemoryStore {
    root: PathBuf,
    cache: Mutex<HashMap<(String, String), serde_json::Value>>,
}

impl FileMemoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Strip everything but alphanumeric characters; ids that sanitize to
    /// nothing become `"default"`.
    fn sanitize(component: &str) -> String {
        let cleaned: String = component.chars().filter(|c| c.is_alphanumeric()).collect();
        if cleaned.is_empty() {
            DEFAULT_COMPONENT.to_string()
        } else {
            cleaned
        }
    }

    fn file_path(&self, agent_type: &str, story_id: &str) -> PathBuf {
        let filename = format!(
            "{}_{}.json",
            Self::sanitize(agent_type),
            Self::sanitize(story_id)
        );
        self.root.join(filename)
    }

    /// Root directory this store writes under.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl AgentMemory for FileMemoryStore {
    async fn get_memory(
        &self,
        agent_type: &str,
        story_id: &str,
    ) -> anyhow::Result<Option<serde_json::Value>> {
        let cache_key = (agent_type.to_string(), story_id.to_string());
        if let Some(value) = self.cache.lock().get(&cache_key) {
            return Ok(Some(value.clone()));
        }

        let path = self.file_path(agent_type, story_id);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let value: serde_json::Value = serde_json::from_str(&raw)?;
        self.cache.lock().insert(cache_key, value.clone());
        Ok(Some(value))
    }

    async fn store_memory(
        &self,
        agent_type: &str,
        story_id: &str,
        memory: serde_json::Value,
    ) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.file_path(agent_type, story_id);
        let raw = serde_json::to_string_pretty(&memory)?;
        tokio::fs::write(&path, raw).await?;
        debug!(path = %path.display(), "agent memory stored");

        self.cache
            .lock()
            .insert((agent_type.to_string(), story_id.to_string()), memory);
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sanitize_strips_non_alphanumeric() {
        assert_eq!(FileMemoryStore::sanitize("coder-agent"), "coderagent");
        assert_eq!(FileMemoryStore::sanitize("story/42"), "story42");
        assert_eq!(FileMemoryStore::sanitize("../../etc"), "etc");
        assert_eq!(FileMemoryStore::sanitize("plain123"), "plain123");
    }

    #[test]
    fn test_sanitize_empty_falls_back_to_default() {
        assert_eq!(FileMemoryStore::sanitize(""), "default");
        assert_eq!(FileMemoryStore::sanitize("   "), "default");
        assert_eq!(FileMemoryStore::sanitize("../.."), "default");
    }

    #[tokio::test]
    async fn test_store_and_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileMemoryStore::new(dir.path());

        let memory = json!({"decisions": ["used builder pattern"], "attempts": 2});
        store
            .store_memory("coder", "story-42", memory.clone())
            .await
            .unwrap();

        let loaded = store.get_memory("coder", "story-42").await.unwrap();
        assert_eq!(loaded, Some(memory));

        // Sanitized filename on disk.
        assert!(dir.path().join("coder_story42.json").exists());
    }

    #[tokio::test]
    async fn test_get_missing_memory_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileMemoryStore::new(dir.path());
        assert_eq!(store.get_memory("coder", "nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_get_reads_through_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let writer = FileMemoryStore::new(dir.path());
            writer
                .store_memory("reviewer", "story-1", json!({"notes": "ok"}))
                .await
                .unwrap();
        }

        // Fresh store with a cold cache reads the same file.
        let reader = FileMemoryStore::new(dir.path());
        let loaded = reader.get_memory("reviewer", "story-1").await.unwrap();
        assert_eq!(loaded, Some(json!({"notes": "ok"})));
    }

    #[tokio::test]
    async fn test_overwrite_replaces_previous_memory() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileMemoryStore::new(dir.path());

        store
            .store_memory("coder", "story-1", json!({"version": 1}))
            .await
            .unwrap();
        store
            .store_memory("coder", "story-1", json!({"version": 2}))
            .await
            .unwrap();

        let loaded = store.get_memory("coder", "story-1").await.unwrap();
        assert_eq!(loaded, Some(json!({"version": 2})));
    }

    #[tokio::test]
    async fn test_hostile_ids_stay_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileMemoryStore::new(dir.path());

        store
            .store_memory("../../outside", "../escape", json!({"x": 1}))
            .await
            .unwrap();

        // Both components sanitized; file lands inside the root.
        assert!(dir.path().join("outside_escape.json").exists());
    }
}
