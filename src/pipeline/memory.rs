//! Process-lifetime analysis memory.

use crate::models::{MemoryEntry, PipelineRequest, StageResult};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Derives the memory key for a subject: `<name>_<category>`, lower-cased.
pub fn memory_key(name: &str, category: &str) -> String {
    format!("{}_{}", name.trim(), category.trim()).to_lowercase()
}

/// Latest final result per subject. Cheap to clone; clones share entries.
#[derive(Debug, Clone, Default)]
pub struct AnalysisMemory {
    entries: Arc<RwLock<HashMap<String, MemoryEntry>>>,
}

impl AnalysisMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<MemoryEntry> {
        self.entries.read().get(key).cloned()
    }

    /// Store an entry under `key`, returning the one it replaces.
    pub fn put(&self, key: impl Into<String>, mut entry: MemoryEntry) -> Option<MemoryEntry> {
        let key = key.into();
        entry.key = key.clone();
        self.entries.write().insert(key, entry)
    }

    /// Store a final result stamped with the current time.
    pub fn record(
        &self,
        key: &str,
        result: StageResult,
        request: PipelineRequest,
    ) -> Option<MemoryEntry> {
        self.put(
            key,
            MemoryEntry {
                key: key.to_string(),
                result,
                request,
                stored_at: Utc::now(),
            },
        )
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// All stored keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StageKind;

    fn result(content: &str) -> StageResult {
        StageResult {
            role: "recommendation".to_string(),
            stage: StageKind::Synthesis,
            sequence: 5,
            content: content.to_string(),
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn test_memory_key_is_lowercased() {
        assert_eq!(memory_key("Acme Corp", " Retail "), "acme corp_retail");
    }

    #[test]
    fn test_put_overwrites_and_returns_previous() {
        let memory = AnalysisMemory::new();
        let request = PipelineRequest::new().with("name", "Acme");

        assert!(memory.record("acme_retail", result("first"), request.clone()).is_none());
        let previous = memory
            .record("acme_retail", result("second"), request)
            .unwrap();

        assert_eq!(previous.result.content, "first");
        assert_eq!(memory.get("acme_retail").unwrap().result.content, "second");
        assert_eq!(memory.len(), 1);
    }

    #[test]
    fn test_clones_share_entries() {
        let memory = AnalysisMemory::new();
        let other = memory.clone();
        other.record("b_x", result("b"), PipelineRequest::new());
        other.record("a_x", result("a"), PipelineRequest::new());

        assert!(!memory.is_empty());
        assert_eq!(memory.keys(), vec!["a_x".to_string(), "b_x".to_string()]);
        assert!(memory.get("missing").is_none());
    }
}
