use std::time::Instant;

use hashbrown::HashMap;

use replaymux_cdp::cdp::browser_protocol::target::{SessionId, TargetId};

use crate::cmd::CommandChain;

/// Empty-drain counter value that suppresses further self-healing probes for
/// the rest of the page load.
pub(crate) const SELF_HEAL_SENTINEL: i32 = i32::MIN / 2;

/// How many consecutive empty drains trigger the self-healing probe.
pub(crate) const SELF_HEAL_THRESHOLD: i32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TargetKind {
    Page,
    ChallengeIframe,
}

/// Everything the coordinator tracks per attached target.
#[derive(Debug)]
pub(crate) struct TargetState {
    pub target_id: TargetId,
    pub session_id: SessionId,
    pub kind: TargetKind,
    pub url: String,
    pub started: Instant,
    /// Recording instrumentation is live in the current document.
    pub injected: bool,
    /// Consecutive drains that produced nothing; negative means healed.
    pub empty_drains: i32,
    /// A per-page socket reconnect has been tried for this session.
    pub reconnect_attempted: bool,
    /// The reconnect failed; never try again for this session.
    pub failed_reconnect: bool,
    /// Attachment command sequence still being driven.
    pub init: Option<CommandChain>,
    pub waiting_for_debugger: bool,
    /// Running total of drained recording events.
    pub event_count: u64,
}

impl TargetState {
    pub fn new(
        target_id: TargetId,
        session_id: SessionId,
        kind: TargetKind,
        url: String,
        waiting_for_debugger: bool,
    ) -> Self {
        Self {
            target_id,
            session_id,
            kind,
            url,
            started: Instant::now(),
            injected: false,
            empty_drains: 0,
            reconnect_attempted: false,
            failed_reconnect: false,
            init: None,
            waiting_for_debugger,
            event_count: 0,
        }
    }

    pub fn is_page(&self) -> bool {
        self.kind == TargetKind::Page
    }

    /// A navigation happened: the current document's instrumentation state is
    /// unknown again.
    pub fn reset_for_navigation(&mut self, url: String) {
        self.url = url;
        self.injected = false;
        self.empty_drains = 0;
    }
}

/// Mapping of a challenge iframe to the page that owns it.
#[derive(Debug, Clone)]
pub(crate) struct IframeLink {
    pub iframe_session: SessionId,
    pub iframe_target: TargetId,
    pub parent_session: SessionId,
    pub parent_target: TargetId,
    pub url: String,
}

/// Dual-indexed registry of attached targets plus iframe->parent links.
///
/// Every tracked target is reachable by target id and by session id; removal
/// clears both indices and any iframe links in one call.
#[derive(Debug, Default)]
pub(crate) struct TargetRegistry {
    targets: HashMap<TargetId, TargetState>,
    by_session: HashMap<SessionId, TargetId>,
    /// iframe session id -> link (also indexed by iframe target id)
    iframe_by_session: HashMap<SessionId, IframeLink>,
    iframe_by_target: HashMap<TargetId, SessionId>,
}

impl TargetRegistry {
    pub fn insert(&mut self, state: TargetState) {
        self.by_session
            .insert(state.session_id.clone(), state.target_id.clone());
        self.targets.insert(state.target_id.clone(), state);
    }

    pub fn get(&self, target_id: &TargetId) -> Option<&TargetState> {
        self.targets.get(target_id)
    }

    pub fn get_mut(&mut self, target_id: &TargetId) -> Option<&mut TargetState> {
        self.targets.get_mut(target_id)
    }

    pub fn contains(&self, target_id: &TargetId) -> bool {
        self.targets.contains_key(target_id)
    }

    pub fn by_session(&self, session_id: &SessionId) -> Option<&TargetState> {
        self.by_session
            .get(session_id)
            .and_then(|id| self.targets.get(id))
    }

    pub fn by_session_mut(&mut self, session_id: &SessionId) -> Option<&mut TargetState> {
        let id = self.by_session.get(session_id)?.clone();
        self.targets.get_mut(&id)
    }

    /// Removes the target from both indices and drops any iframe links whose
    /// parent was this target. Returns the removed state.
    pub fn remove(&mut self, target_id: &TargetId) -> Option<TargetState> {
        let state = self.targets.remove(target_id)?;
        self.by_session.remove(&state.session_id);

        let orphaned: Vec<SessionId> = self
            .iframe_by_session
            .iter()
            .filter(|(_, link)| &link.parent_target == target_id)
            .map(|(sess, _)| sess.clone())
            .collect();
        for sess in orphaned {
            if let Some(link) = self.iframe_by_session.remove(&sess) {
                self.iframe_by_target.remove(&link.iframe_target);
            }
        }
        if let Some(sess) = self.iframe_by_target.remove(target_id) {
            self.iframe_by_session.remove(&sess);
        }
        Some(state)
    }

    pub fn link_iframe(&mut self, link: IframeLink) {
        self.iframe_by_target
            .insert(link.iframe_target.clone(), link.iframe_session.clone());
        self.iframe_by_session
            .insert(link.iframe_session.clone(), link);
    }

    pub fn iframe_link(&self, session_id: &SessionId) -> Option<&IframeLink> {
        self.iframe_by_session.get(session_id)
    }

    pub fn iframe_link_by_target(&self, target_id: &TargetId) -> Option<&IframeLink> {
        self.iframe_by_target
            .get(target_id)
            .and_then(|sess| self.iframe_by_session.get(sess))
    }

    /// Iterator over tracked page targets.
    pub fn pages(&self) -> impl Iterator<Item = &TargetState> + '_ {
        self.targets.values().filter(|t| t.is_page())
    }

    pub fn page_ids(&self) -> Vec<TargetId> {
        self.pages().map(|t| t.target_id.clone()).collect()
    }

    pub fn all_ids(&self) -> Vec<TargetId> {
        self.targets.keys().cloned().collect()
    }

    pub fn page_count(&self) -> usize {
        self.pages().count()
    }

    pub fn clear(&mut self) {
        self.targets.clear();
        self.by_session.clear();
        self.iframe_by_session.clear();
        self.iframe_by_target.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(target: &str, session: &str) -> TargetState {
        TargetState::new(
            target.into(),
            session.into(),
            TargetKind::Page,
            "https://example.test/".to_string(),
            false,
        )
    }

    #[test]
    fn dual_index_stays_consistent() {
        let mut reg = TargetRegistry::default();
        reg.insert(page("T1", "S1"));
        reg.insert(page("T2", "S2"));

        assert_eq!(
            reg.by_session(&"S2".into()).unwrap().target_id,
            TargetId::from("T2")
        );
        assert_eq!(reg.page_count(), 2);

        let removed = reg.remove(&"T1".into()).unwrap();
        assert_eq!(removed.session_id, SessionId::from("S1"));
        assert!(reg.by_session(&"S1".into()).is_none());
        assert!(reg.get(&"T1".into()).is_none());
        assert_eq!(reg.page_count(), 1);
    }

    #[test]
    fn removing_parent_drops_iframe_links() {
        let mut reg = TargetRegistry::default();
        reg.insert(page("T1", "S1"));
        reg.link_iframe(IframeLink {
            iframe_session: "IS1".into(),
            iframe_target: "IT1".into(),
            parent_session: "S1".into(),
            parent_target: "T1".into(),
            url: "https://challenges.example/turnstile".to_string(),
        });

        assert!(reg.iframe_link(&"IS1".into()).is_some());
        assert!(reg.iframe_link_by_target(&"IT1".into()).is_some());

        reg.remove(&"T1".into());
        assert!(reg.iframe_link(&"IS1".into()).is_none());
        assert!(reg.iframe_link_by_target(&"IT1".into()).is_none());
    }

    #[test]
    fn navigation_reset_clears_drain_state() {
        let mut state = page("T1", "S1");
        state.injected = true;
        state.empty_drains = SELF_HEAL_SENTINEL;
        state.reset_for_navigation("https://example.test/next".to_string());
        assert!(!state.injected);
        assert_eq!(state.empty_drains, 0);
        assert_eq!(state.url, "https://example.test/next");
    }
}
