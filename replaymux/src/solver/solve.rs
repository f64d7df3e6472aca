//! Solve pipelines: presence, widget finding, the click commit and the
//! per-detection activity loop.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

use replaymux_humanize::{plan_approach, plan_direct_approach, plan_presence, Point};

use crate::javascript;
use crate::solver::detect::eval_widget_poll;
use crate::solver::input::MouseDriver;
use crate::solver::state::{ActiveDetection, ChallengeType};
use crate::solver::SolverCtx;

/// What the in-page finder cascade reports.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct FinderHit {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub m: String,
    #[serde(default)]
    pub d: String,
}

fn rand_duration(lo_ms: u64, hi_ms: u64) -> Duration {
    Duration::from_millis(rand::rng().random_range(lo_ms..=hi_ms))
}

/// Routes one detection into its pipeline. The activity loop is expected to
/// already be running.
pub(crate) async fn solve_detection(ctx: Arc<SolverCtx>, det: Arc<ActiveDetection>) {
    if det.is_aborted() || ctx.is_destroyed() {
        return;
    }
    match det.info.challenge_type {
        ChallengeType::Interstitial | ChallengeType::Managed => {
            solve_by_clicking(ctx, det).await;
        }
        ChallengeType::Turnstile => {
            solve_turnstile(ctx, det).await;
        }
        ChallengeType::NonInteractive | ChallengeType::Invisible => {
            solve_automatic(ctx, det).await;
        }
        ChallengeType::Block => {}
    }
}

/// Is the challenge already solved? Runs the four-signal predicate and, on
/// success, fetches the token length. Returns the token length when solved.
async fn check_solved(ctx: &Arc<SolverCtx>, det: &Arc<ActiveDetection>) -> Option<u64> {
    let value = ctx
        .handle
        .evaluate_json(
            &det.target_id,
            &det.page_session,
            javascript::SOLVED_PREDICATE,
        )
        .await
        .ok()??;
    if value.as_bool() != Some(true) {
        return None;
    }
    let token_length = eval_widget_poll(ctx, &det.target_id, &det.page_session)
        .await
        .map(|r| r.token_length)
        .unwrap_or(0);
    Some(token_length)
}

async fn simulate_presence(
    ctx: &Arc<SolverCtx>,
    det: &Arc<ActiveDetection>,
    duration: Duration,
) -> Option<Point> {
    let (w, h) = ctx.config.viewport;
    let start = Point::new(
        rand::rng().random_range(0.0..w * 0.4),
        rand::rng().random_range(0.0..h * 0.4),
    );
    let plan = plan_presence(start, w, h, duration);
    det.track(|t| t.presence_phases += 1);
    let driver = MouseDriver::new(&ctx.handle, &det.page_session);
    match driver.run_presence(&plan, &det.aborted).await {
        Ok(p) => Some(p),
        Err(err) => {
            tracing::debug!(target_id = %det.target_id, "presence simulation failed: {err}");
            det.track(|t| t.errors += 1);
            None
        }
    }
}

/// Interstitial / managed: presence, find, click, keyboard fallback.
async fn solve_by_clicking(ctx: Arc<SolverCtx>, det: Arc<ActiveDetection>) {
    let presence_span = match det.info.challenge_type {
        ChallengeType::Managed => rand_duration(500, 1500),
        _ => rand_duration(300, 1000),
    };
    let presence_pos = simulate_presence(&ctx, &det, presence_span).await;
    ctx.emitter
        .progress(&det, "presence_complete", serde_json::Value::Null);

    if det.is_aborted() {
        return;
    }
    if let Some(token_length) = check_solved(&ctx, &det).await {
        ctx.resolve_solved(&det, "auto_solve", None, token_length, true);
        return;
    }

    match find_click_target(&ctx, &det).await {
        Some(hit) => {
            perform_click(&ctx, &det, Point::new(hit.0, hit.1), presence_pos, None).await;
        }
        None => {
            ctx.emitter
                .progress(&det, "find_target_failed", serde_json::Value::Null);
            tab_space_fallback(&ctx, &det).await;
        }
    }
}

/// Standalone widget: skip the full presence ritual (too slow under many-tab
/// contention), wait for the iframe, click with a lightweight approach.
async fn solve_turnstile(ctx: Arc<SolverCtx>, det: Arc<ActiveDetection>) {
    let deadline = det.started + ctx.config.turnstile_deadline;

    let wait_until = det.started + ctx.config.iframe_wait;
    while ctx.iframe_of(&det.target_id).is_none() {
        if det.is_aborted() || std::time::Instant::now() >= wait_until {
            break;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    ctx.emitter.progress(
        &det,
        "iframe_wait_complete",
        serde_json::json!({ "iframe_attached": ctx.iframe_of(&det.target_id).is_some() }),
    );

    if det.is_aborted() || std::time::Instant::now() >= deadline {
        return;
    }
    if let Some(token_length) = check_solved(&ctx, &det).await {
        ctx.resolve_solved(&det, "auto_solve", None, token_length, true);
        return;
    }

    match find_click_target(&ctx, &det).await {
        Some(hit) => {
            perform_click(&ctx, &det, Point::new(hit.0, hit.1), None, Some(deadline)).await;
        }
        None => {
            // the widget may still auto-pass; the activity loop keeps watch
            ctx.emitter
                .progress(&det, "find_target_failed", serde_json::Value::Null);
        }
    }
}

/// Non-interactive / invisible: look human for a while, let the activity
/// loop spot the token.
async fn solve_automatic(ctx: Arc<SolverCtx>, det: Arc<ActiveDetection>) {
    simulate_presence(&ctx, &det, rand_duration(2000, 4000)).await;
    ctx.emitter
        .progress(&det, "presence_complete", serde_json::Value::Null);
}

/// Coordinates from the observer binding win; the 12-method cascade is the
/// fallback.
async fn find_click_target(ctx: &Arc<SolverCtx>, det: &Arc<ActiveDetection>) -> Option<(f64, f64)> {
    if let Some(coords) = ctx.take_pending_coords(&det.target_id) {
        det.track(|t| t.find_methods.push("observer_binding".to_string()));
        return Some((coords.x, coords.y));
    }

    let script =
        javascript::with_challenge_host(javascript::WIDGET_FINDER, &ctx.config.challenge_host);
    let value = match ctx
        .handle
        .evaluate_json(&det.target_id, &det.page_session, &script)
        .await
    {
        Ok(Some(value)) => value,
        Ok(None) => return None,
        Err(err) => {
            tracing::debug!(target_id = %det.target_id, "widget finder failed: {err}");
            det.track(|t| t.errors += 1);
            return None;
        }
    };
    let hit: FinderHit = serde_json::from_value(value).ok()?;
    det.track(|t| t.find_methods.push(hit.m.clone()));
    if hit.m == "none" || hit.m.is_empty() {
        return None;
    }
    ctx.emitter.progress(
        det,
        "widget_found",
        serde_json::json!({ "method": hit.m, "debug": hit.d }),
    );
    Some((hit.x, hit.y))
}

/// Shared click pipeline: approach, gate, commit, dwell.
async fn perform_click(
    ctx: &Arc<SolverCtx>,
    det: &Arc<ActiveDetection>,
    target: Point,
    presence_pos: Option<Point>,
    deadline: Option<std::time::Instant>,
) {
    let driver = MouseDriver::new(&ctx.handle, &det.page_session);

    let plan = match presence_pos {
        Some(from) => plan_approach(from, target),
        None => {
            let (w, h) = ctx.config.viewport;
            plan_direct_approach(Point::new(w / 2.0, h / 2.0), target)
        }
    };
    let landing = match driver.run_approach(&plan, &det.aborted).await {
        Ok(Some(landing)) => landing,
        Ok(None) => return,
        Err(err) => {
            tracing::debug!(target_id = %det.target_id, "approach failed: {err}");
            det.track(|t| t.errors += 1);
            return;
        }
    };
    ctx.emitter.progress(
        det,
        "approach_complete",
        serde_json::json!({ "x": landing.x.round(), "y": landing.y.round() }),
    );

    // gate: a concurrent path may have resolved while the pointer traveled
    if det.is_aborted() {
        return;
    }
    if let Some(deadline) = deadline {
        if std::time::Instant::now() >= deadline {
            return;
        }
    }
    if let Some(token_length) = check_solved(ctx, det).await {
        ctx.resolve_solved(det, "auto_solve", None, token_length, true);
        return;
    }

    if let Err(err) = driver.commit_click(landing).await {
        tracing::debug!(target_id = %det.target_id, "click failed: {err}");
        det.track(|t| t.errors += 1);
        return;
    }
    det.track(|t| {
        t.click_coords
            .push((landing.x.round() as i64, landing.y.round() as i64))
    });
    ctx.emitter.progress(
        det,
        "clicked",
        serde_json::json!({ "x": landing.x.round(), "y": landing.y.round() }),
    );

    // post-click dwell; the page may navigate out from under us, which is fine
    let _ = simulate_presence(ctx, det, rand_duration(300, 800)).await;
}

/// Tab+Space keyboard activation for widgets no finder method could place.
async fn tab_space_fallback(ctx: &Arc<SolverCtx>, det: &Arc<ActiveDetection>) {
    ctx.emitter
        .progress(det, "tab_space_fallback", serde_json::Value::Null);
    let driver = MouseDriver::new(&ctx.handle, &det.page_session);

    if let Err(err) = ctx
        .handle
        .evaluate_json(
            &det.target_id,
            &det.page_session,
            javascript::FOCUS_RESET_BUTTON,
        )
        .await
    {
        tracing::debug!(target_id = %det.target_id, "focus reset failed: {err}");
    }

    for _ in 0..ctx.config.max_tabs {
        if det.is_aborted() || ctx.is_destroyed() {
            return;
        }
        if driver.tab().await.is_err() {
            det.track(|t| t.errors += 1);
            return;
        }
        tokio::time::sleep(replaymux_humanize::timing::tab_to_space()).await;
        if driver.space().await.is_err() {
            det.track(|t| t.errors += 1);
            return;
        }
        tokio::time::sleep(replaymux_humanize::timing::space_result_wait()).await;

        if let Some(token_length) = check_solved(ctx, det).await {
            ctx.resolve_solved(det, "auto_solve", Some("tab_space"), token_length, false);
            return;
        }
        // restart the tab order from the known anchor
        let _ = ctx
            .handle
            .evaluate_json(
                &det.target_id,
                &det.page_session,
                javascript::FOCUS_RESET_BUTTON,
            )
            .await;
    }
}

/// Starts the per-detection activity loop exactly once.
pub(crate) fn start_activity_loop(ctx: Arc<SolverCtx>, det: Arc<ActiveDetection>) {
    if det.activity_started.swap(true, std::sync::atomic::Ordering::SeqCst) {
        return;
    }
    tokio::spawn(async move {
        activity_loop(ctx, det).await;
    });
}

/// Every 3-7 s: poll for the token, surface widget errors, keep looking
/// human. Bounded by the hard ceiling regardless of external cancellation.
async fn activity_loop(ctx: Arc<SolverCtx>, det: Arc<ActiveDetection>) {
    let ceiling = ctx.config.activity_ceiling;
    loop {
        if det.is_aborted() || ctx.is_destroyed() || det.started.elapsed() >= ceiling {
            return;
        }
        tokio::time::sleep(rand_duration(3000, 7000)).await;
        if det.is_aborted() || ctx.is_destroyed() || det.started.elapsed() >= ceiling {
            return;
        }

        let poll = eval_widget_poll(&ctx, &det.target_id, &det.page_session).await;
        let Some(report) = poll else {
            // page unreachable: skip the micro-presence but keep polling
            det.track(|t| t.errors += 1);
            continue;
        };
        if report.solved {
            ctx.resolve_solved(&det, "auto_solve", None, report.token_length, true);
            return;
        }

        det.track(|t| t.activity_polls += 1);
        ctx.emitter
            .progress(&det, "activity_poll", serde_json::Value::Null);

        if let Ok(Some(value)) = ctx
            .handle
            .evaluate_json(
                &det.target_id,
                &det.page_session,
                javascript::WIDGET_ERROR_CHECK,
            )
            .await
        {
            let error = value["error"].as_bool().unwrap_or(false);
            if error {
                // error text alongside a token is cosmetic; without one the
                // widget genuinely failed, though it may still recover
                let has_token = value["hasToken"].as_bool().unwrap_or(false);
                let kind = if has_token { "error_text" } else { "confirmed_error" };
                ctx.emitter.progress(
                    &det,
                    "widget_error",
                    serde_json::json!({
                        "kind": kind,
                        "text": value["text"].as_str().unwrap_or(""),
                    }),
                );
            }
        }

        let _ = simulate_presence(&ctx, &det, rand_duration(500, 1500)).await;
    }
}
