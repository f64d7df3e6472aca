//! The per-session challenge solver.
//!
//! Detection signals race concurrently (navigation poll, binding push,
//! runtime poll, beacon push, iframe state observation); the first to land a
//! terminal result wins through the one-way `aborted` latch and the
//! binding-solved dedup set. Long-running work runs on spawned tasks that
//! talk to the coordinator through its [`SessionHandle`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::channel::mpsc::UnboundedSender;
use hashbrown::{HashMap, HashSet};

use replaymux_cdp::cdp::browser_protocol::target::{SessionId, TargetId};

use crate::session::SessionHandle;

pub(crate) mod detect;
pub mod emit;
pub(crate) mod input;
pub(crate) mod solve;
pub mod state;

pub use emit::ChallengeEvent;
pub use state::{ChallengeInfo, ChallengeType};

use emit::Emitter;
use state::ActiveDetection;

/// Tunables for the solver.
#[derive(Debug, Clone)]
pub struct SolverConfig {
    /// Host substring identifying the challenge vendor.
    pub challenge_host: String,
    /// Viewport used for presence planning.
    pub viewport: (f64, f64),
    /// Retries after a widget reported fail/expired/timeout.
    pub max_attempts: u32,
    /// Tab+Space cycles in the keyboard fallback.
    pub max_tabs: u32,
    /// Hard ceiling on the activity loop.
    pub activity_ceiling: Duration,
    /// Deadline for the standalone-widget pipeline.
    pub turnstile_deadline: Duration,
    /// How long to wait for the challenge iframe to attach.
    pub iframe_wait: Duration,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            challenge_host: "challenges.cloudflare.com".to_string(),
            viewport: (1280.0, 720.0),
            max_attempts: 3,
            max_tabs: 5,
            activity_ceiling: Duration::from_secs(90),
            turnstile_deadline: Duration::from_secs(30),
            iframe_wait: Duration::from_secs(5),
        }
    }
}

/// A challenge iframe linked to its page.
#[derive(Debug, Clone)]
pub(crate) struct IframeRef {
    pub session: SessionId,
    pub target: TargetId,
    pub url: String,
}

/// Widget coordinates pushed from the in-page observer binding.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingCoords {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Default)]
pub(crate) struct SolverShared {
    detections: HashMap<TargetId, Arc<ActiveDetection>>,
    /// Targets that already produced a solved signal; dedups synthetic pairs.
    binding_solved: HashSet<TargetId>,
    /// page target -> its challenge iframe
    iframes: HashMap<TargetId, IframeRef>,
    /// Coordinates reported by `__turnstileTargetBinding`, keyed by page.
    pending_coords: HashMap<TargetId, PendingCoords>,
    /// Last url seen per page; dedups repeated targetInfoChanged storms.
    last_urls: HashMap<TargetId, String>,
}

pub(crate) struct SolverCtx {
    pub handle: SessionHandle,
    pub emitter: Emitter,
    pub config: SolverConfig,
    pub shared: Mutex<SolverShared>,
    pub destroyed: AtomicBool,
}

impl SolverCtx {
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn detection_of(&self, target_id: &TargetId) -> Option<Arc<ActiveDetection>> {
        self.shared
            .lock()
            .ok()?
            .detections
            .get(target_id)
            .cloned()
    }

    /// Registers a new detection unless one is already active for the target.
    pub fn insert_detection(&self, det: ActiveDetection) -> Option<Arc<ActiveDetection>> {
        let mut shared = self.shared.lock().ok()?;
        if shared.detections.contains_key(&det.target_id) {
            return None;
        }
        let det = Arc::new(det);
        shared.detections.insert(det.target_id.clone(), det.clone());
        Some(det)
    }

    pub fn remove_detection(&self, target_id: &TargetId) {
        if let Ok(mut shared) = self.shared.lock() {
            shared.detections.remove(target_id);
        }
    }

    pub fn iframe_of(&self, target_id: &TargetId) -> Option<IframeRef> {
        self.shared.lock().ok()?.iframes.get(target_id).cloned()
    }

    pub fn take_pending_coords(&self, target_id: &TargetId) -> Option<PendingCoords> {
        self.shared.lock().ok()?.pending_coords.remove(target_id)
    }

    /// `true` when this target's solved signal is new.
    pub fn mark_binding_solved(&self, target_id: &TargetId) -> bool {
        self.shared
            .lock()
            .map(|mut s| s.binding_solved.insert(target_id.clone()))
            .unwrap_or(false)
    }

    /// Terminal success; exactly-once per detection via the latch.
    pub fn resolve_solved(
        &self,
        det: &Arc<ActiveDetection>,
        method: &str,
        signal: Option<&str>,
        token_length: u64,
        auto_resolved: bool,
    ) {
        if !det.claim_terminal() {
            return;
        }
        self.remove_detection(&det.target_id);
        self.mark_binding_solved(&det.target_id);
        self.emitter
            .solved(det, method, signal, token_length, auto_resolved);
    }

    /// Terminal failure; exactly-once per detection via the latch.
    pub fn resolve_failed(&self, det: &Arc<ActiveDetection>, reason: &str) {
        if !det.claim_terminal() {
            return;
        }
        self.remove_detection(&det.target_id);
        self.emitter.failed(det, reason);
    }
}

/// Public face of the solver; every method returns immediately and does its
/// work on a spawned task.
pub struct ChallengeSolver {
    ctx: Arc<SolverCtx>,
}

impl std::fmt::Debug for ChallengeSolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeSolver").finish()
    }
}

impl ChallengeSolver {
    pub fn new(
        handle: SessionHandle,
        sink: UnboundedSender<ChallengeEvent>,
        config: SolverConfig,
    ) -> Self {
        let emitter = Emitter::new(sink, handle.clone());
        Self {
            ctx: Arc::new(SolverCtx {
                handle,
                emitter,
                config,
                shared: Mutex::new(SolverShared::default()),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    pub fn on_page_attached(&self, target_id: TargetId, session_id: SessionId, url: String) {
        if let Ok(mut shared) = self.ctx.shared.lock() {
            shared.last_urls.insert(target_id.clone(), url.clone());
        }
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            detect::on_navigation_signal(ctx, target_id, session_id, url, false).await;
        });
    }

    pub fn on_page_navigated(&self, target_id: TargetId, session_id: SessionId, url: String) {
        // targetInfoChanged fires for title changes too; only real url moves
        // re-enter detection
        let changed = match self.ctx.shared.lock() {
            Ok(mut shared) => {
                let prev = shared.last_urls.insert(target_id.clone(), url.clone());
                prev.as_deref() != Some(url.as_str())
            }
            Err(_) => true,
        };
        if !changed {
            return;
        }
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            detect::on_navigation_signal(ctx, target_id, session_id, url, true).await;
        });
    }

    pub fn on_iframe_attached(
        &self,
        parent_target: TargetId,
        iframe_session: SessionId,
        iframe_target: TargetId,
        url: String,
    ) {
        if let Ok(mut shared) = self.ctx.shared.lock() {
            shared.iframes.insert(
                parent_target,
                IframeRef {
                    session: iframe_session,
                    target: iframe_target,
                    url,
                },
            );
        }
    }

    pub fn on_solved_binding(&self, target_id: TargetId, session_id: SessionId, payload: String) {
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            detect::on_solved_binding(ctx, target_id, session_id, payload).await;
        });
    }

    pub fn on_target_coords(&self, target_id: TargetId, payload: String) {
        let parsed: Option<serde_json::Value> = serde_json::from_str(&payload).ok();
        let Some(value) = parsed else { return };
        let (Some(x), Some(y)) = (value["x"].as_f64(), value["y"].as_f64()) else {
            return;
        };
        if let Ok(mut shared) = self.ctx.shared.lock() {
            shared
                .pending_coords
                .insert(target_id.clone(), PendingCoords { x, y });
        }
        if let Some(det) = self.ctx.detection_of(&target_id) {
            self.ctx.emitter.progress(
                &det,
                "widget_found",
                serde_json::json!({
                    "method": value["m"].as_str().unwrap_or("observer_binding"),
                    "source": "binding",
                }),
            );
        }
    }

    pub fn on_iframe_state(&self, parent_target: TargetId, state: String) {
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            detect::on_iframe_state(ctx, parent_target, state).await;
        });
    }

    pub fn on_beacon(&self, target_id: TargetId, token_length: u64, target_known: bool) {
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            detect::on_beacon(ctx, target_id, token_length, target_known).await;
        });
    }

    /// Session-close fallback: no detection may stay unresolved.
    pub fn emit_unresolved(&self) {
        let detections: Vec<Arc<ActiveDetection>> = match self.ctx.shared.lock() {
            Ok(mut shared) => shared.detections.drain().map(|(_, det)| det).collect(),
            Err(_) => Vec::new(),
        };
        for det in detections {
            if det.claim_terminal() {
                self.ctx
                    .emitter
                    .solved(&det, "auto_solve", Some("session_close"), 0, true);
            }
        }
    }

    pub fn shutdown(&self) {
        self.ctx.destroyed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::state::{ChallengeInfo, ChallengeType};

    fn test_ctx() -> (
        Arc<SolverCtx>,
        futures::channel::mpsc::UnboundedReceiver<ChallengeEvent>,
    ) {
        let (tx, rx) = futures::channel::mpsc::unbounded();
        let (cmd_tx, _cmd_rx) = futures::channel::mpsc::channel(8);
        let handle = crate::session::test_support::handle("test-session", cmd_tx);
        let emitter = Emitter::new(tx, handle.clone());
        (
            Arc::new(SolverCtx {
                handle,
                emitter,
                config: SolverConfig::default(),
                shared: Mutex::new(SolverShared::default()),
                destroyed: AtomicBool::new(false),
            }),
            rx,
        )
    }

    fn detection(target: &str) -> ActiveDetection {
        ActiveDetection::new(
            ChallengeInfo {
                challenge_type: ChallengeType::Managed,
                url: "https://example.test/verify".to_string(),
                iframe_url: None,
                c_ray: None,
                detection_method: "cf_chl_opt".to_string(),
                poll_count: 1,
            },
            target.into(),
            "S1".into(),
        )
    }

    #[tokio::test]
    async fn only_one_detection_per_target() {
        let (ctx, _rx) = test_ctx();
        assert!(ctx.insert_detection(detection("T1")).is_some());
        assert!(ctx.insert_detection(detection("T1")).is_none());
        assert!(ctx.insert_detection(detection("T2")).is_some());
    }

    #[tokio::test]
    async fn resolve_solved_emits_once() {
        use futures::StreamExt;

        let (ctx, mut rx) = test_ctx();
        let det = ctx.insert_detection(detection("T1")).unwrap();

        ctx.resolve_solved(&det, "auto_solve", Some("callback_binding"), 42, false);
        // the race loser is silently ignored
        ctx.resolve_solved(&det, "auto_navigation", Some("page_navigated"), 0, false);
        ctx.resolve_failed(&det, "too_late");

        let ev = rx.next().await.unwrap();
        match ev {
            ChallengeEvent::Solved {
                token_length,
                signal,
                ..
            } => {
                assert_eq!(token_length, 42);
                assert_eq!(signal.as_deref(), Some("callback_binding"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(rx.try_next().is_err(), "no second terminal event");
        assert!(ctx.detection_of(&"T1".into()).is_none());
    }

    #[tokio::test]
    async fn binding_solved_dedup() {
        let (ctx, _rx) = test_ctx();
        assert!(ctx.mark_binding_solved(&"T1".into()));
        assert!(!ctx.mark_binding_solved(&"T1".into()));
    }
}
