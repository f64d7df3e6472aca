//! Challenge event emission: the observable stream plus recording markers.

use std::sync::Arc;

use futures::channel::mpsc::UnboundedSender;
use serde::Serialize;

use crate::javascript;
use crate::session::SessionHandle;
use crate::solver::state::ActiveDetection;

/// Observable challenge lifecycle events. Each detection produces exactly one
/// `detected` and at most one terminal `solved`/`failed`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ChallengeEvent {
    Detected {
        target_id: String,
        r#type: String,
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        iframe_url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        c_ray: Option<String>,
        detection_method: String,
        poll_count: u32,
    },
    Progress {
        target_id: String,
        state: String,
        elapsed_ms: u64,
        attempt: u32,
        #[serde(skip_serializing_if = "serde_json::Value::is_null")]
        extras: serde_json::Value,
    },
    Solved {
        target_id: String,
        solved: bool,
        r#type: String,
        method: String,
        token_length: u64,
        duration_ms: u64,
        attempts: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        auto_resolved: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        signal: Option<String>,
        summary: serde_json::Value,
    },
    Failed {
        target_id: String,
        reason: String,
        r#type: String,
        duration_ms: u64,
        attempts: u32,
        summary: serde_json::Value,
    },
}

impl ChallengeEvent {
    pub fn target_id(&self) -> &str {
        match self {
            ChallengeEvent::Detected { target_id, .. }
            | ChallengeEvent::Progress { target_id, .. }
            | ChallengeEvent::Solved { target_id, .. }
            | ChallengeEvent::Failed { target_id, .. } => target_id,
        }
    }
}

/// Sends challenge events to the session's sink and mirrors each one as a
/// marker in the page's recording buffer.
#[derive(Debug, Clone)]
pub(crate) struct Emitter {
    sink: UnboundedSender<ChallengeEvent>,
    handle: SessionHandle,
}

impl Emitter {
    pub fn new(sink: UnboundedSender<ChallengeEvent>, handle: SessionHandle) -> Self {
        Self { sink, handle }
    }

    fn send(&self, det: &Arc<ActiveDetection>, event: ChallengeEvent) {
        // mirror the event as a marker on the replay timeline
        if !det.page_session.as_ref().is_empty() {
            if let Ok(payload) = serde_json::to_value(&event) {
                let expr = javascript::push_recording_event("challenge", &payload);
                self.handle.fire_on(
                    &det.page_session,
                    replaymux_cdp::cdp::js_protocol::runtime::EvaluateParams::by_value(expr),
                );
            }
        }
        let _ = self.sink.unbounded_send(event);
    }

    pub fn detected(&self, det: &Arc<ActiveDetection>) {
        let info = &det.info;
        self.send(
            det,
            ChallengeEvent::Detected {
                target_id: det.target_id.as_ref().to_string(),
                r#type: info.challenge_type.as_str().to_string(),
                url: info.url.clone(),
                iframe_url: info.iframe_url.clone(),
                c_ray: info.c_ray.clone(),
                detection_method: info.detection_method.clone(),
                poll_count: info.poll_count,
            },
        );
    }

    pub fn progress(&self, det: &Arc<ActiveDetection>, state: &str, extras: serde_json::Value) {
        if det.is_aborted() {
            return;
        }
        det.track(|t| t.record_progress(state));
        self.send(
            det,
            ChallengeEvent::Progress {
                target_id: det.target_id.as_ref().to_string(),
                state: state.to_string(),
                elapsed_ms: det.elapsed_ms(),
                attempt: det.attempt(),
                extras,
            },
        );
    }

    /// Terminal success. Call only after `claim_terminal()` succeeded.
    pub fn solved(
        &self,
        det: &Arc<ActiveDetection>,
        method: &str,
        signal: Option<&str>,
        token_length: u64,
        auto_resolved: bool,
    ) {
        self.send(
            det,
            ChallengeEvent::Solved {
                target_id: det.target_id.as_ref().to_string(),
                solved: true,
                r#type: det.info.challenge_type.as_str().to_string(),
                method: method.to_string(),
                token_length,
                duration_ms: det.elapsed_ms(),
                attempts: det.attempt(),
                auto_resolved: auto_resolved.then_some(true),
                signal: signal.map(|s| s.to_string()),
                summary: det.summary(),
            },
        );
    }

    /// Terminal failure. Call only after `claim_terminal()` succeeded.
    pub fn failed(&self, det: &Arc<ActiveDetection>, reason: &str) {
        self.send(
            det,
            ChallengeEvent::Failed {
                target_id: det.target_id.as_ref().to_string(),
                reason: reason.to_string(),
                r#type: det.info.challenge_type.as_str().to_string(),
                duration_ms: det.elapsed_ms(),
                attempts: det.attempt(),
                summary: det.summary(),
            },
        );
    }

    /// A detected+solved pair for solves observed without a prior detection
    /// (binding or beacon fired before any detection path ran).
    pub fn standalone_pair(&self, det: &Arc<ActiveDetection>, signal: &str, token_length: u64) {
        self.detected(det);
        self.solved(det, "auto_solve", Some(signal), token_length, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialized_events_carry_the_contract_fields() {
        let ev = ChallengeEvent::Solved {
            target_id: "T7".to_string(),
            solved: true,
            r#type: "managed".to_string(),
            method: "auto_navigation".to_string(),
            token_length: 0,
            duration_ms: 6010,
            attempts: 1,
            auto_resolved: None,
            signal: Some("page_navigated".to_string()),
            summary: serde_json::json!({}),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event"], "solved");
        assert_eq!(json["targetId"].as_str(), None); // snake_case contract
        assert_eq!(json["target_id"], "T7");
        assert_eq!(json["signal"], "page_navigated");
        assert!(json.get("auto_resolved").is_none());
    }

    #[test]
    fn progress_omits_null_extras() {
        let ev = ChallengeEvent::Progress {
            target_id: "T1".to_string(),
            state: "activity_poll".to_string(),
            elapsed_ms: 1500,
            attempt: 1,
            extras: serde_json::Value::Null,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert!(json.get("extras").is_none());
    }
}
