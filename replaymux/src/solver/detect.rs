//! Detection strategies. All of them race; dedup happens in the shared
//! state, never in the strategies themselves.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use replaymux_cdp::cdp::browser_protocol::target::{SessionId, TargetId};

use crate::javascript;
use crate::solver::solve;
use crate::solver::state::{classify, ActiveDetection, ChallengeInfo, ChallengeType, DetectionReport};
use crate::solver::SolverCtx;

/// Iterations of the widget fallback poll.
const WIDGET_POLL_ROUNDS: u32 = 20;
const WIDGET_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Default, Deserialize)]
pub(crate) struct WidgetPollReport {
    #[serde(default)]
    pub present: bool,
    #[serde(default)]
    pub solved: bool,
    #[serde(default, rename = "tokenLength")]
    pub token_length: u64,
}

async fn eval_detection(
    ctx: &Arc<SolverCtx>,
    target_id: &TargetId,
    session_id: &SessionId,
) -> Option<DetectionReport> {
    let script = javascript::with_challenge_host(
        javascript::DETECTION_SCRIPT,
        &ctx.config.challenge_host,
    );
    match ctx.handle.evaluate_json(target_id, session_id, &script).await {
        Ok(Some(value)) => serde_json::from_value(value).ok(),
        Ok(None) => None,
        Err(err) => {
            tracing::debug!(target_id = %target_id, "detection evaluate failed: {err}");
            None
        }
    }
}

pub(crate) async fn eval_widget_poll(
    ctx: &Arc<SolverCtx>,
    target_id: &TargetId,
    session_id: &SessionId,
) -> Option<WidgetPollReport> {
    let script =
        javascript::with_challenge_host(javascript::WIDGET_POLL, &ctx.config.challenge_host);
    match ctx.handle.evaluate_json(target_id, session_id, &script).await {
        Ok(Some(value)) => serde_json::from_value(value).ok(),
        _ => None,
    }
}

/// Entry for both the attach signal and each navigation.
///
/// One deliberate evaluation, no poll loop: the challenge markers are set
/// inline during HTML parse, and repeated polls only delay the widget
/// fallback below.
pub(crate) async fn on_navigation_signal(
    ctx: Arc<SolverCtx>,
    target_id: TargetId,
    session_id: SessionId,
    url: String,
    from_navigation: bool,
) {
    if ctx.is_destroyed() {
        return;
    }

    let report = eval_detection(&ctx, &target_id, &session_id).await;
    let challenge_present = report.as_ref().map(|r| r.detected).unwrap_or(false);

    // a navigation away from an active interstitial IS the success signal:
    // the unload beacon is routinely killed mid-flight by the redirect
    if from_navigation {
        if let Some(existing) = ctx.detection_of(&target_id) {
            if existing.info.challenge_type.is_interstitial_like() && !existing.is_aborted() {
                if challenge_present {
                    // destination is itself a challenge: suppress the solved
                    // and let the fresh detection below take over
                    existing.claim_terminal();
                    ctx.remove_detection(&target_id);
                } else {
                    ctx.resolve_solved(&existing, "auto_navigation", Some("page_navigated"), 0, false);
                    return;
                }
            }
        }
    }

    let Some(report) = report else {
        // detection failed or found nothing; the widget poll still runs
        widget_poll(ctx, target_id, session_id).await;
        return;
    };
    if !report.detected {
        widget_poll(ctx, target_id, session_id).await;
        return;
    }

    let iframe = ctx.iframe_of(&target_id);
    let challenge_type = classify(&report, iframe.is_some());
    if challenge_type == ChallengeType::Block {
        tracing::warn!(
            target_id = %target_id,
            url = %url,
            "block page detected; not solvable"
        );
        return;
    }

    let info = ChallengeInfo {
        challenge_type,
        url: if report.url.is_empty() { url } else { report.url.clone() },
        iframe_url: iframe.map(|i| i.url),
        c_ray: report.c_ray.clone().filter(|r| !r.is_empty()),
        detection_method: report.m.clone(),
        poll_count: 1,
    };
    let Some(det) = ctx.insert_detection(ActiveDetection::new(
        info,
        target_id.clone(),
        session_id.clone(),
    )) else {
        return;
    };
    ctx.emitter.detected(&det);
    solve::start_activity_loop(ctx.clone(), det.clone());
    solve::solve_detection(ctx, det).await;
}

/// Fallback widget poll: every 200 ms, up to 20 rounds. A CDP failure never
/// abandons the poll; losing both the detected and solved events over one
/// dropped evaluate is the regression this guards against.
pub(crate) async fn widget_poll(ctx: Arc<SolverCtx>, target_id: TargetId, session_id: SessionId) {
    for round in 0..WIDGET_POLL_ROUNDS {
        if ctx.is_destroyed() || ctx.detection_of(&target_id).is_some() {
            return;
        }
        tokio::time::sleep(WIDGET_POLL_INTERVAL).await;

        let Some(report) = eval_widget_poll(&ctx, &target_id, &session_id).await else {
            continue;
        };
        if !report.present {
            continue;
        }

        let iframe = ctx.iframe_of(&target_id);
        let info = ChallengeInfo {
            challenge_type: ChallengeType::Turnstile,
            url: String::new(),
            iframe_url: iframe.map(|i| i.url),
            c_ray: None,
            detection_method: "widget_poll".to_string(),
            poll_count: round + 1,
        };
        let Some(det) = ctx.insert_detection(ActiveDetection::new(
            info,
            target_id.clone(),
            session_id.clone(),
        )) else {
            return;
        };
        ctx.emitter.detected(&det);

        if report.solved {
            // token already present: fast-path, skip the solve pipeline
            ctx.resolve_solved(
                &det,
                "auto_solve",
                Some("widget_poll_token"),
                report.token_length,
                true,
            );
            return;
        }
        solve::start_activity_loop(ctx.clone(), det.clone());
        solve::solve_detection(ctx, det).await;
        return;
    }
}

/// `__turnstileSolvedBinding` fired from the page hook.
pub(crate) async fn on_solved_binding(
    ctx: Arc<SolverCtx>,
    target_id: TargetId,
    session_id: SessionId,
    payload: String,
) {
    let token_length = if payload == "solved" {
        0
    } else {
        payload.len() as u64
    };

    if let Some(det) = ctx.detection_of(&target_id) {
        ctx.resolve_solved(&det, "auto_solve", Some("callback_binding"), token_length, false);
        return;
    }

    if !ctx.mark_binding_solved(&target_id) {
        return;
    }
    // no detection ever ran for this page; emit a synthetic pair so the
    // accounting still sees the solve
    let url = ctx
        .shared
        .lock()
        .ok()
        .and_then(|s| s.last_urls.get(&target_id).cloned())
        .unwrap_or_default();
    let det = Arc::new(ActiveDetection::new(
        ChallengeInfo {
            challenge_type: ChallengeType::Turnstile,
            url,
            iframe_url: None,
            c_ray: None,
            detection_method: "callback_binding".to_string(),
            poll_count: 0,
        },
        target_id,
        session_id,
    ));
    det.claim_terminal();
    ctx.emitter
        .standalone_pair(&det, "callback_binding", token_length);
}

/// Out-of-band beacon delivered over HTTP from the unloading page.
pub(crate) async fn on_beacon(
    ctx: Arc<SolverCtx>,
    target_id: TargetId,
    token_length: u64,
    target_known: bool,
) {
    if let Some(det) = ctx.detection_of(&target_id) {
        ctx.resolve_solved(&det, "auto_solve", Some("beacon_push"), token_length, false);
        return;
    }
    if !target_known {
        // sessions receiving a broadcast filter by their own targets
        return;
    }
    if !ctx.mark_binding_solved(&target_id) {
        return;
    }
    let url = ctx
        .shared
        .lock()
        .ok()
        .and_then(|s| s.last_urls.get(&target_id).cloned())
        .unwrap_or_default();
    let det = Arc::new(ActiveDetection::new(
        ChallengeInfo {
            challenge_type: ChallengeType::Turnstile,
            url,
            iframe_url: None,
            c_ray: None,
            detection_method: "beacon_push".to_string(),
            poll_count: 0,
        },
        target_id,
        SessionId::from(""),
    ));
    det.claim_terminal();
    ctx.emitter.standalone_pair(&det, "beacon_push", token_length);
}

/// Widget state transition observed inside the challenge iframe.
pub(crate) async fn on_iframe_state(ctx: Arc<SolverCtx>, parent_target: TargetId, state: String) {
    let Some(det) = ctx.detection_of(&parent_target) else {
        return;
    };
    det.track(|t| t.record_iframe_state(&state));
    ctx.emitter
        .progress(&det, &state, serde_json::Value::Null);

    match state.as_str() {
        "success" => {
            // give the token a beat to land before trusting the signal
            tokio::time::sleep(Duration::from_millis(500)).await;
            if det.is_aborted() {
                return;
            }
            let poll = eval_widget_poll(&ctx, &det.target_id, &det.page_session).await;
            let solved = poll.as_ref().map(|p| p.solved).unwrap_or(false);
            let gone = eval_detection(&ctx, &det.target_id, &det.page_session)
                .await
                .map(|r| !r.detected)
                .unwrap_or(false);
            if solved || gone {
                let token_length = poll.map(|p| p.token_length).unwrap_or(0);
                ctx.resolve_solved(&det, "state_change", Some("iframe_state"), token_length, false);
            } else {
                ctx.emitter
                    .progress(&det, "false_positive", serde_json::Value::Null);
            }
        }
        "fail" | "expired" | "timeout" => {
            let attempt = det
                .attempts
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
                + 1;
            if attempt <= ctx.config.max_attempts {
                tracing::debug!(
                    target_id = %det.target_id,
                    attempt,
                    "widget reported {state}; retrying solve"
                );
                solve::solve_detection(ctx.clone(), det).await;
            } else {
                ctx.resolve_failed(&det, &state);
            }
        }
        _ => {}
    }
}
