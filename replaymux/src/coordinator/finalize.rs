use hashbrown::{HashMap, HashSet};
use serde::Serialize;

use replaymux_cdp::cdp::browser_protocol::target::TargetId;

/// Outcome of finalizing one tab's recording.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizedTab {
    pub replay_id: String,
    pub duration_ms: u64,
    pub event_count: u64,
    pub replay_url: String,
    pub frame_count: u64,
    pub encoding_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
}

/// Converges the teardown paths (target destroyed, session cleanup) into one
/// finalization per target. The first caller wins; later callers observe the
/// cached outcome.
#[derive(Debug, Default)]
pub(crate) struct TabFinalizer {
    started: HashSet<TargetId>,
    results: HashMap<TargetId, Option<FinalizedTab>>,
}

impl TabFinalizer {
    /// Claims finalization for `target_id`. Returns `false` when another
    /// caller already did.
    pub fn begin(&mut self, target_id: &TargetId) -> bool {
        self.started.insert(target_id.clone())
    }

    pub fn is_started(&self, target_id: &TargetId) -> bool {
        self.started.contains(target_id)
    }

    /// Stores the outcome (possibly `None` when the store declined the tab).
    pub fn complete(&mut self, target_id: TargetId, result: Option<FinalizedTab>) {
        self.results.insert(target_id, result);
    }

    /// The cached outcome, if finalization already completed.
    pub fn result_of(&self, target_id: &TargetId) -> Option<&Option<FinalizedTab>> {
        self.results.get(target_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: &str) -> FinalizedTab {
        FinalizedTab {
            replay_id: id.to_string(),
            duration_ms: 1200,
            event_count: 42,
            replay_url: format!("/replay/{id}"),
            frame_count: 0,
            encoding_status: "none".to_string(),
            video_url: None,
        }
    }

    #[test]
    fn second_begin_is_rejected() {
        let mut fin = TabFinalizer::default();
        let target: TargetId = "T1".into();
        assert!(fin.begin(&target));
        assert!(!fin.begin(&target));
        assert!(fin.is_started(&target));
    }

    #[test]
    fn completed_result_is_cached() {
        let mut fin = TabFinalizer::default();
        let target: TargetId = "T1".into();
        assert!(fin.begin(&target));
        fin.complete(target.clone(), Some(result("r1")));

        let cached = fin.result_of(&target).unwrap().as_ref().unwrap();
        assert_eq!(cached.replay_id, "r1");
        // a second teardown path converges on the cache instead of re-running
        assert!(!fin.begin(&target));
    }

    #[test]
    fn declined_tabs_cache_none() {
        let mut fin = TabFinalizer::default();
        let target: TargetId = "T2".into();
        fin.begin(&target);
        fin.complete(target.clone(), None);
        assert!(fin.result_of(&target).unwrap().is_none());
    }
}
