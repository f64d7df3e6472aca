//! Drain-loop bookkeeping: parsing the buffer evaluate result, tracking
//! consecutive empty drains, and deciding when the self-healing probe runs.

use serde::Deserialize;

use replaymux_cdp::cdp::js_protocol::runtime::EvaluateReturns;

use crate::coordinator::target::{TargetState, SELF_HEAL_SENTINEL, SELF_HEAL_THRESHOLD};

/// What the coordinator should do after one drain round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DrainAction {
    /// Nothing further.
    None,
    /// The empty-drain threshold was hit: probe the recorder state.
    Probe,
}

/// Pulls the drained events out of an evaluate response.
///
/// The drain script returns a JSON string (the one raw `result.value` escape
/// hatch); a missing or malformed value is treated as an empty drain and the
/// buffer is retried next tick.
pub(crate) fn parse_drained_events(returns: &EvaluateReturns) -> Vec<serde_json::Value> {
    let raw = match returns.result.value.as_ref().and_then(|v| v.as_str()) {
        Some(raw) => raw,
        None => return Vec::new(),
    };
    serde_json::from_str::<Vec<serde_json::Value>>(raw).unwrap_or_default()
}

/// Applies one drain outcome to the target's counters.
pub(crate) fn apply_drain(state: &mut TargetState, drained: usize) -> DrainAction {
    if drained > 0 {
        state.event_count += drained as u64;
        state.empty_drains = 0;
        return DrainAction::None;
    }
    if state.empty_drains < 0 {
        // healed already for this page load
        return DrainAction::None;
    }
    state.empty_drains += 1;
    if state.empty_drains == SELF_HEAL_THRESHOLD {
        DrainAction::Probe
    } else {
        DrainAction::None
    }
}

/// Result of the self-heal probe script.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct ProbeReport {
    pub has_buffer: bool,
    pub has_stop: bool,
    pub ready_state: String,
    pub href: String,
}

impl ProbeReport {
    pub fn parse(returns: &EvaluateReturns) -> Option<Self> {
        let raw = returns.result.value.as_ref()?.as_str()?;
        serde_json::from_str(raw).ok()
    }

    /// The page is showing real content but the recorder is gone.
    pub fn needs_reinject(&self) -> bool {
        let real_url = !self.href.is_empty()
            && self.href != "about:blank"
            && !self.href.starts_with("chrome-");
        real_url && !(self.has_buffer && self.has_stop)
    }
}

/// Marks the page load as healed so the probe never refires for it.
pub(crate) fn mark_healed(state: &mut TargetState) {
    state.empty_drains = SELF_HEAL_SENTINEL;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::target::TargetKind;
    use replaymux_cdp::cdp::js_protocol::runtime::RemoteObject;

    fn state() -> TargetState {
        TargetState::new(
            "T1".into(),
            "S1".into(),
            TargetKind::Page,
            "https://example.test/".to_string(),
            false,
        )
    }

    fn returns(value: serde_json::Value) -> EvaluateReturns {
        EvaluateReturns {
            result: RemoteObject {
                r#type: "string".to_string(),
                subtype: None,
                value: Some(value),
                description: None,
            },
            exception_details: None,
        }
    }

    #[test]
    fn probe_fires_at_exactly_the_threshold() {
        let mut st = state();
        for i in 1..SELF_HEAL_THRESHOLD {
            assert_eq!(apply_drain(&mut st, 0), DrainAction::None, "iteration {i}");
        }
        assert_eq!(apply_drain(&mut st, 0), DrainAction::Probe);
        // one past the threshold does not re-probe
        assert_eq!(apply_drain(&mut st, 0), DrainAction::None);
    }

    #[test]
    fn events_reset_the_counter() {
        let mut st = state();
        for _ in 0..5 {
            apply_drain(&mut st, 0);
        }
        assert_eq!(apply_drain(&mut st, 3), DrainAction::None);
        assert_eq!(st.empty_drains, 0);
        assert_eq!(st.event_count, 3);
    }

    #[test]
    fn sentinel_suppresses_further_probes() {
        let mut st = state();
        mark_healed(&mut st);
        for _ in 0..50 {
            assert_eq!(apply_drain(&mut st, 0), DrainAction::None);
        }
        assert_eq!(st.empty_drains, SELF_HEAL_SENTINEL);
    }

    #[test]
    fn drained_events_parse_from_the_raw_string() {
        let ret = returns(serde_json::Value::String(
            r#"[{"tag":"input.click","payload":{}},{"tag":"dom.mutation","payload":{}}]"#
                .to_string(),
        ));
        assert_eq!(parse_drained_events(&ret).len(), 2);

        let empty = returns(serde_json::Value::String("[]".to_string()));
        assert!(parse_drained_events(&empty).is_empty());

        let garbage = returns(serde_json::Value::String("not-json".to_string()));
        assert!(parse_drained_events(&garbage).is_empty());
    }

    #[test]
    fn probe_report_reinject_logic() {
        let healthy: ProbeReport = serde_json::from_str(
            r#"{"hasBuffer":true,"hasStop":true,"readyState":"complete","href":"https://example.test/x"}"#,
        )
        .unwrap();
        assert!(!healthy.needs_reinject());

        let dead: ProbeReport = serde_json::from_str(
            r#"{"hasBuffer":false,"hasStop":false,"readyState":"complete","href":"https://example.test/x"}"#,
        )
        .unwrap();
        assert!(dead.needs_reinject());

        let blank: ProbeReport = serde_json::from_str(
            r#"{"hasBuffer":false,"hasStop":false,"readyState":"complete","href":"about:blank"}"#,
        )
        .unwrap();
        assert!(!blank.needs_reinject());
    }
}
