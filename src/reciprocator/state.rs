//! In-memory session state for a browsing batch.

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

/// Where the engine currently is in its browse/like/rest cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowsePhase {
    /// Home timeline navigation issued, waiting for the load to finish.
    NavigatingHome,
    Browsing,
    /// A like was dispatched; browsing is held until the post-like wait
    /// elapses.
    LikePause,
    Resting,
}

/// One batch of reciprocation targets plus its progress.
///
/// Targets move from `targets` to `liked` exactly once, at dispatch
/// time. A handle claimed for a like is never offered to a later scan
/// even if the like has not been confirmed yet.
pub struct BrowseSession {
    pub id: Uuid,
    pub phase: BrowsePhase,
    /// Seconds left in the current browse or rest phase.
    pub countdown_secs: i64,
    targets: HashMap<String, String>,
    liked: HashSet<String>,
}

impl BrowseSession {
    /// Builds a session from `(handle, action_id)` pairs. Handles are
    /// lowercased so page-reported casing never splits a target.
    pub fn new(targets: Vec<(String, String)>) -> Self {
        let targets = targets
            .into_iter()
            .map(|(handle, action_id)| (handle.to_lowercase(), action_id))
            .collect();
        Self {
            id: Uuid::new_v4(),
            phase: BrowsePhase::NavigatingHome,
            countdown_secs: 0,
            targets,
            liked: HashSet::new(),
        }
    }

    pub fn remaining_handles(&self) -> Vec<String> {
        self.targets.keys().cloned().collect()
    }

    pub fn remaining_count(&self) -> usize {
        self.targets.len()
    }

    pub fn liked_count(&self) -> usize {
        self.liked.len()
    }

    /// Claims a target for liking, returning its ledger action id.
    /// Returns `None` if the handle is not (or no longer) a target, so
    /// a duplicate page report cannot double-dispatch.
    pub fn claim(&mut self, handle: &str) -> Option<String> {
        let handle = handle.to_lowercase();
        let action_id = self.targets.remove(&handle)?;
        self.liked.insert(handle);
        Some(action_id)
    }

    pub fn is_complete(&self) -> bool {
        self.targets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> BrowseSession {
        BrowseSession::new(vec![
            ("Alice".into(), "a1".into()),
            ("bob".into(), "b1".into()),
        ])
    }

    #[test]
    fn claim_is_case_insensitive_and_single_shot() {
        let mut s = session();
        assert_eq!(s.claim("ALICE"), Some("a1".into()));
        assert_eq!(s.claim("alice"), None);
        assert_eq!(s.remaining_count(), 1);
        assert_eq!(s.liked_count(), 1);
    }

    #[test]
    fn complete_when_all_targets_claimed() {
        let mut s = session();
        assert!(!s.is_complete());
        s.claim("alice");
        s.claim("bob");
        assert!(s.is_complete());
        assert!(s.remaining_handles().is_empty());
    }

    #[test]
    fn unknown_handle_claims_nothing() {
        let mut s = session();
        assert_eq!(s.claim("mallory"), None);
        assert_eq!(s.remaining_count(), 2);
    }
}
