//! In-memory session registry and idle pool
//!
//! Owned by one [`crate::TerminalManager`]; never shared across scopes.

use std::collections::HashMap;

/// Bookkeeping for one logical session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEntry {
    /// Derived, sanitized multiplexer session name
    pub backend_name: String,
    /// Longest capture seen so far; deltas are computed against it
    pub last_captured: String,
    pub busy: bool,
    /// Done marker of a command that timed out before completing
    pub pending_sentinel: Option<String>,
    /// An interrupt key was sent while a sentinel was pending
    pub interrupted: bool,
}

impl SessionEntry {
    pub fn new(backend_name: impl Into<String>) -> Self {
        Self {
            backend_name: backend_name.into(),
            last_captured: String::new(),
            busy: false,
            pending_sentinel: None,
            interrupted: false,
        }
    }

    /// Replace the baseline only with a longer capture
    pub fn advance_baseline(&mut self, captured: &str) {
        if captured.len() > self.last_captured.len() {
            self.last_captured = captured.to_string();
        }
    }

    /// Start a new baseline epoch after the scrollback was cleared
    pub fn reset_baseline(&mut self, captured: &str) {
        self.last_captured = captured.to_string();
    }
}

/// Snapshot of one registry entry
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub backend_name: String,
    pub busy: bool,
    pub pending: bool,
    pub baseline_len: usize,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    entries: HashMap<String, SessionEntry>,
    idle_pool: Vec<String>,
    next_auto: u64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&SessionEntry> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut SessionEntry> {
        self.entries.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, id: impl Into<String>, entry: SessionEntry) {
        let id = id.into();
        self.idle_pool.retain(|pooled| pooled != &id);
        self.entries.insert(id, entry);
    }

    /// Drop every trace of a session, returning its entry if it was known
    pub fn remove(&mut self, id: &str) -> Option<SessionEntry> {
        self.idle_pool.retain(|pooled| pooled != id);
        self.entries.remove(id)
    }

    pub fn mark_busy(&mut self, id: &str) -> crate::Result<()> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| crate::TerminalError::SessionNotFound(id.to_string()))?;
        entry.busy = true;
        self.idle_pool.retain(|pooled| pooled != id);
        Ok(())
    }

    /// Mark a session idle and push it onto the pool
    ///
    /// Refused while a sentinel is pending; such a session stays busy until
    /// `wait` or `kill` resolves it.
    pub fn release(&mut self, id: &str) -> crate::Result<()> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| crate::TerminalError::SessionNotFound(id.to_string()))?;
        if entry.pending_sentinel.is_some() {
            return Err(crate::TerminalError::InvalidInput(format!(
                "Session {} has a pending command; wait for it or kill the session",
                id
            )));
        }
        entry.busy = false;
        if !self.idle_pool.iter().any(|pooled| pooled == id) {
            self.idle_pool.push(id.to_string());
        }
        Ok(())
    }

    /// Most recently released idle session
    pub fn pop_idle(&mut self) -> Option<String> {
        while let Some(id) = self.idle_pool.pop() {
            if self.entries.get(&id).is_some_and(|entry| !entry.busy) {
                return Some(id);
            }
        }
        None
    }

    pub fn idle_count(&self) -> usize {
        self.idle_pool.len()
    }

    /// Next `s0`, `s1`, ... id not already registered
    pub fn next_auto_id(&mut self) -> String {
        loop {
            let id = format!("s{}", self.next_auto);
            self.next_auto += 1;
            if !self.entries.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .entries
            .iter()
            .map(|(id, entry)| SessionInfo {
                id: id.clone(),
                backend_name: entry.backend_name.clone(),
                busy: entry.busy,
                pending: entry.pending_sentinel.is_some(),
                baseline_len: entry.last_captured.len(),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }
}

/// Candidate names `base_1`, `base_2`, ... for a busy preferred session
pub fn suffixed_names(base: &str) -> impl Iterator<Item = String> + '_ {
    (1u32..).map(move |n| format!("{}_{}", base, n))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baseline_is_monotonic() {
        let mut entry = SessionEntry::new("ta-x-s0");
        entry.advance_baseline("abc\n");
        entry.advance_baseline("ab");
        assert_eq!(entry.last_captured, "abc\n");
        entry.advance_baseline("abc\ndef\n");
        assert_eq!(entry.last_captured, "abc\ndef\n");

        entry.reset_baseline("$\n");
        assert_eq!(entry.last_captured, "$\n");
    }

    #[test]
    fn test_idle_pool_is_lifo() {
        let mut registry = SessionRegistry::new();
        registry.insert("a", SessionEntry::new("ta-x-a"));
        registry.insert("b", SessionEntry::new("ta-x-b"));
        registry.mark_busy("a").unwrap();
        registry.mark_busy("b").unwrap();

        registry.release("a").unwrap();
        registry.release("b").unwrap();
        assert_eq!(registry.idle_count(), 2);
        assert_eq!(registry.pop_idle(), Some("b".to_string()));
        assert_eq!(registry.pop_idle(), Some("a".to_string()));
        assert_eq!(registry.pop_idle(), None);
    }

    #[test]
    fn test_release_refused_while_pending() {
        let mut registry = SessionRegistry::new();
        let mut entry = SessionEntry::new("ta-x-s0");
        entry.busy = true;
        entry.pending_sentinel = Some("__TA_DONE_abc__".to_string());
        registry.insert("s0", entry);

        let result = registry.release("s0");
        assert!(result.is_err());
        assert!(registry.get("s0").unwrap().busy);
        assert_eq!(registry.idle_count(), 0);
    }

    #[test]
    fn test_release_unknown_session() {
        let mut registry = SessionRegistry::new();
        let result = registry.release("missing");
        assert!(matches!(result, Err(crate::TerminalError::SessionNotFound(_))));
    }

    #[test]
    fn test_remove_clears_pool() {
        let mut registry = SessionRegistry::new();
        registry.insert("a", SessionEntry::new("ta-x-a"));
        registry.release("a").unwrap();
        assert!(registry.remove("a").is_some());
        assert_eq!(registry.pop_idle(), None);
        assert!(registry.remove("a").is_none());
    }

    #[test]
    fn test_auto_ids_skip_registered() {
        let mut registry = SessionRegistry::new();
        registry.insert("s1", SessionEntry::new("ta-x-s1"));
        assert_eq!(registry.next_auto_id(), "s0");
        assert_eq!(registry.next_auto_id(), "s2");
    }

    #[test]
    fn test_suffixed_names() {
        let names: Vec<String> = suffixed_names("build").take(3).collect();
        assert_eq!(names, vec!["build_1", "build_2", "build_3"]);
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let mut registry = SessionRegistry::new();
        registry.insert("s1", SessionEntry::new("ta-x-s1"));
        registry.insert("s0", SessionEntry::new("ta-x-s0"));
        let ids: Vec<String> = registry.snapshot().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["s0", "s1"]);
    }
}
