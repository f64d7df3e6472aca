//! Challenge taxonomy, per-detection state and the activity tracker.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use replaymux_cdp::cdp::browser_protocol::target::{SessionId, TargetId};

/// The closed set of challenge shapes the solver distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeType {
    Managed,
    NonInteractive,
    Invisible,
    Interstitial,
    Turnstile,
    Block,
}

impl ChallengeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeType::Managed => "managed",
            ChallengeType::NonInteractive => "non_interactive",
            ChallengeType::Invisible => "invisible",
            ChallengeType::Interstitial => "interstitial",
            ChallengeType::Turnstile => "turnstile",
            ChallengeType::Block => "block",
        }
    }

    /// Interstitial-style pages succeed by navigating away.
    pub fn is_interstitial_like(&self) -> bool {
        matches!(self, ChallengeType::Interstitial | ChallengeType::Managed)
    }
}

/// What the in-page detection script reports.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct DetectionReport {
    pub detected: bool,
    #[serde(default)]
    pub m: String,
    #[serde(default, rename = "cType")]
    pub c_type: Option<String>,
    #[serde(default, rename = "cRay")]
    pub c_ray: Option<String>,
    #[serde(default)]
    pub url: String,
    #[serde(default, rename = "hasIframe")]
    pub has_iframe: bool,
}

/// Classifies a detection report into the challenge taxonomy.
///
/// `iframe_linked` reflects whether a challenge iframe has already attached
/// for the page, which disambiguates the ray-id-only signal.
pub(crate) fn classify(report: &DetectionReport, iframe_linked: bool) -> ChallengeType {
    let has_iframe = report.has_iframe || iframe_linked;
    if let Some(c_type) = report.c_type.as_deref() {
        match c_type {
            "managed" | "interactive" => return ChallengeType::Managed,
            "non-interactive" | "non_interactive" => return ChallengeType::NonInteractive,
            "invisible" => return ChallengeType::Invisible,
            // older taxonomy aliases for the standalone widget
            "embedded" | "widget" | "turnstile" => return ChallengeType::Turnstile,
            _ => {}
        }
    }
    match report.m.as_str() {
        "cf_error_page" => ChallengeType::Block,
        "title_interstitial" | "body_text_challenge" | "challenge_element"
        | "challenge_running_class" => ChallengeType::Interstitial,
        "ray_id_footer" => {
            if has_iframe {
                ChallengeType::Turnstile
            } else {
                ChallengeType::Interstitial
            }
        }
        "widget_iframe" => ChallengeType::Turnstile,
        // _cf_chl_opt without a usable cType is the managed flow
        "cf_chl_opt" => ChallengeType::Managed,
        _ if has_iframe => ChallengeType::Turnstile,
        _ => ChallengeType::Interstitial,
    }
}

/// Static facts about one detected challenge.
#[derive(Debug, Clone)]
pub struct ChallengeInfo {
    pub challenge_type: ChallengeType,
    pub url: String,
    pub iframe_url: Option<String>,
    pub c_ray: Option<String>,
    pub detection_method: String,
    pub poll_count: u32,
}

/// Accumulates everything that happened while solving, for the terminal
/// event's summary payload.
#[derive(Debug, Default)]
pub struct DetectionTracker {
    pub find_methods: Vec<String>,
    pub click_coords: Vec<(i64, i64)>,
    pub presence_phases: u32,
    pub activity_polls: u32,
    pub iframe_states: Vec<String>,
    pub progress_states: Vec<String>,
    pub errors: u32,
}

impl DetectionTracker {
    pub fn record_progress(&mut self, state: &str) {
        self.progress_states.push(state.to_string());
    }

    pub fn record_iframe_state(&mut self, state: &str) {
        self.iframe_states.push(state.to_string());
    }

    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "find_methods": self.find_methods,
            "click_coords": self.click_coords.iter()
                .map(|(x, y)| serde_json::json!([x, y]))
                .collect::<Vec<_>>(),
            "presence_phases": self.presence_phases,
            "activity_polls": self.activity_polls,
            "iframe_states": self.iframe_states,
            "progress_states": self.progress_states,
            "errors": self.errors,
        })
    }
}

/// One in-progress challenge solve.
#[derive(Debug)]
pub struct ActiveDetection {
    pub info: ChallengeInfo,
    pub target_id: TargetId,
    pub page_session: SessionId,
    pub started: Instant,
    pub attempts: AtomicU32,
    /// One-way latch: set on the terminal event, stops every loop.
    pub aborted: AtomicBool,
    pub activity_started: AtomicBool,
    pub tracker: Mutex<DetectionTracker>,
}

impl ActiveDetection {
    pub fn new(info: ChallengeInfo, target_id: TargetId, page_session: SessionId) -> Self {
        Self {
            info,
            target_id,
            page_session,
            started: Instant::now(),
            attempts: AtomicU32::new(1),
            aborted: AtomicBool::new(false),
            activity_started: AtomicBool::new(false),
            tracker: Mutex::new(DetectionTracker::default()),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Claims the terminal event. Only the first caller gets `true`.
    pub fn claim_terminal(&self) -> bool {
        !self.aborted.swap(true, Ordering::SeqCst)
    }

    pub fn attempt(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub fn track(&self, f: impl FnOnce(&mut DetectionTracker)) {
        if let Ok(mut tracker) = self.tracker.lock() {
            f(&mut tracker);
        }
    }

    pub fn summary(&self) -> serde_json::Value {
        self.tracker
            .lock()
            .map(|t| t.summary())
            .unwrap_or_else(|_| serde_json::json!({}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(m: &str, c_type: Option<&str>, has_iframe: bool) -> DetectionReport {
        DetectionReport {
            detected: true,
            m: m.to_string(),
            c_type: c_type.map(|s| s.to_string()),
            c_ray: None,
            url: "https://example.test/".to_string(),
            has_iframe,
        }
    }

    #[test]
    fn classification_follows_the_c_type_first() {
        assert_eq!(
            classify(&report("cf_chl_opt", Some("managed"), false), false),
            ChallengeType::Managed
        );
        assert_eq!(
            classify(&report("cf_chl_opt", Some("interactive"), false), false),
            ChallengeType::Managed
        );
        assert_eq!(
            classify(&report("cf_chl_opt", Some("non-interactive"), false), false),
            ChallengeType::NonInteractive
        );
        assert_eq!(
            classify(&report("cf_chl_opt", Some("invisible"), false), false),
            ChallengeType::Invisible
        );
    }

    #[test]
    fn old_taxonomy_aliases_map_to_turnstile() {
        assert_eq!(
            classify(&report("cf_chl_opt", Some("embedded"), false), false),
            ChallengeType::Turnstile
        );
        assert_eq!(
            classify(&report("cf_chl_opt", Some("widget"), false), false),
            ChallengeType::Turnstile
        );
    }

    #[test]
    fn method_classification() {
        for m in [
            "title_interstitial",
            "body_text_challenge",
            "challenge_element",
            "challenge_running_class",
        ] {
            assert_eq!(classify(&report(m, None, false), false), ChallengeType::Interstitial);
        }
        assert_eq!(
            classify(&report("cf_error_page", None, false), false),
            ChallengeType::Block
        );
    }

    #[test]
    fn ray_id_depends_on_iframe_presence() {
        assert_eq!(
            classify(&report("ray_id_footer", None, false), false),
            ChallengeType::Interstitial
        );
        assert_eq!(
            classify(&report("ray_id_footer", None, true), false),
            ChallengeType::Turnstile
        );
        // a linked iframe counts even when the page report missed it
        assert_eq!(
            classify(&report("ray_id_footer", None, false), true),
            ChallengeType::Turnstile
        );
    }

    #[test]
    fn iframe_without_c_type_is_turnstile() {
        assert_eq!(
            classify(&report("widget_iframe", None, true), false),
            ChallengeType::Turnstile
        );
    }

    #[test]
    fn terminal_claim_is_exactly_once() {
        let det = ActiveDetection::new(
            ChallengeInfo {
                challenge_type: ChallengeType::Managed,
                url: "https://example.test/".to_string(),
                iframe_url: None,
                c_ray: Some("abc".to_string()),
                detection_method: "cf_chl_opt".to_string(),
                poll_count: 1,
            },
            "T1".into(),
            "S1".into(),
        );
        assert!(!det.is_aborted());
        assert!(det.claim_terminal());
        assert!(det.is_aborted());
        assert!(!det.claim_terminal());
        assert!(!det.claim_terminal());
    }

    #[test]
    fn tracker_summary_shape() {
        let mut tracker = DetectionTracker::default();
        tracker.find_methods.push("0_iframe_src".to_string());
        tracker.click_coords.push((315, 442));
        tracker.record_progress("widget_found");
        tracker.record_iframe_state("verifying");
        tracker.errors = 1;
        let summary = tracker.summary();
        assert_eq!(summary["find_methods"][0], "0_iframe_src");
        assert_eq!(summary["click_coords"][0][0], 315);
        assert_eq!(summary["errors"], 1);
    }
}
