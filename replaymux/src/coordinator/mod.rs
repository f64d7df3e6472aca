//! The per-session coordinator: one event loop that owns the browser
//! websocket, the per-page sockets, the target registry, the drain loop and
//! tab finalization, and feeds the challenge solver.
//!
//! External callers talk to it through [`CoordinatorMessage`]s carrying
//! oneshot responders; everything else happens inside `poll_next`.

use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use fnv::FnvHashMap;
use futures::channel::mpsc::Receiver;
use futures::channel::oneshot::Sender as OneshotSender;
use futures::stream::{Fuse, Stream, StreamExt};
use hashbrown::HashMap;
use lazy_static::lazy_static;

use replaymux_cdp::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, EventScreencastFrame, ScreencastFrameAckParams,
    StartScreencastParams, StopScreencastParams,
};
use replaymux_cdp::cdp::browser_protocol::target::{
    AttachToTargetParams, EventAttachedToTarget, EventTargetCreated, EventTargetDestroyed,
    EventTargetInfoChanged, SessionId, SetAutoAttachParams, SetDiscoverTargetsParams, TargetId,
};
use replaymux_cdp::cdp::browser_protocol::{network, page};
use replaymux_cdp::cdp::js_protocol::runtime::{self, EvaluateParams, EvaluateReturns};
use replaymux_cdp::cdp::{CdpEvent, CdpEventMessage};
use replaymux_cdp::{CallId, Message, Method, MethodId, Response};

use crate::cmd::{CommandChain, CommandMessage};
use crate::conn::Connection;
use crate::coordinator::bridge::{bridge_console, bridge_request, bridge_response, is_challenge_cdn};
use crate::coordinator::drain::{DrainAction, ProbeReport};
use crate::coordinator::finalize::{FinalizedTab, TabFinalizer};
use crate::coordinator::job::PeriodicJob;
use crate::coordinator::target::{IframeLink, TargetKind, TargetRegistry, TargetState};
use crate::error::{CdpError, Result};
use crate::javascript;
use crate::metrics::Metrics;
use crate::screencast::CaptureSession;
use crate::session::SessionStats;
use crate::solver::ChallengeSolver;
use crate::store::ReplayStore;

pub mod bridge;
pub mod drain;
pub mod finalize;
mod job;
pub mod target;

/// Standard timeout in MS
pub const REQUEST_TIMEOUT: u64 = 30_000;

/// Per-page sockets allocate ids in a disjoint range for log correlation.
pub const PAGE_CALL_ID_OFFSET: usize = 100_000;

/// How often the in-page buffers are drained.
pub(crate) const DRAIN_INTERVAL: Duration = Duration::from_millis(500);

/// Deadline for opening a per-page socket.
const PAGE_WS_OPEN_TIMEOUT: Duration = Duration::from_secs(2);

/// In-memory replay budget per session; beyond it events are dropped.
const MAX_REPLAY_BYTES: u64 = 64 * 1024 * 1024;

/// Budget for the global attachment setup commands.
const SETUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Only stateless commands may route over a per-page socket. Everything that
/// registers bindings or enables event domains must use the browser socket:
/// events arrive on the connection whose session issued the enabling command.
const PAGE_ROUTE_ELIGIBLE: [&str; 2] = [
    EvaluateParams::IDENTIFIER,
    AddScriptToEvaluateOnNewDocumentParams::IDENTIFIER,
];

lazy_static! {
    static ref AUTO_ATTACH_PARAMS: (MethodId, serde_json::Value) = {
        let params = SetAutoAttachParams::new(true, true);
        (
            params.identifier(),
            serde_json::to_value(params).expect("valid auto attach params"),
        )
    };
    static ref DISCOVER_PARAMS: (MethodId, serde_json::Value) = {
        let params = SetDiscoverTargetsParams::new(true);
        (
            params.identifier(),
            serde_json::to_value(params).expect("valid discover params"),
        )
    };
}

/// How this coordinator instruments its browser session.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub session_id: String,
    /// The browser-wide debugger websocket url.
    pub ws_url: String,
    /// Host substring identifying challenge iframes and CDN traffic.
    pub challenge_host: String,
    /// Full source of the in-page recorder.
    pub recording_script: String,
    pub capture_video: bool,
    pub videos_dir: std::path::PathBuf,
    /// Absolute url the in-page hook beacons to on unload.
    pub beacon_url: String,
    pub request_timeout: Duration,
    /// Viewport used for presence simulation plans.
    pub viewport: (f64, f64),
    /// Receives each tab's finalization result, if anyone cares.
    pub on_tab_finalized: Option<futures::channel::mpsc::UnboundedSender<FinalizedTab>>,
}

/// Messages used to communicate with the coordinator, which executes in the
/// background task.
#[derive(Debug)]
pub(crate) enum CoordinatorMessage {
    Command(CommandMessage),
    PageSocketConnected(TargetId, Result<Connection<CdpEventMessage>>),
    Beacon {
        target_id: String,
        token_length: u64,
    },
    FinalizeDone(TargetId, Option<FinalizedTab>),
    Destroy {
        source: String,
        ack: OneshotSender<()>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SetupKind {
    AutoAttach,
    Discover,
}

impl SetupKind {
    fn params(&self) -> (MethodId, serde_json::Value) {
        match self {
            SetupKind::AutoAttach => AUTO_ATTACH_PARAMS.clone(),
            SetupKind::Discover => DISCOVER_PARAMS.clone(),
        }
    }
}

/// Work scheduled for a later loop iteration.
#[derive(Debug)]
enum DelayedAction {
    /// Re-evaluate the recorder into the current document after navigation.
    ReInject(TargetId),
    /// Second-chance iframe instrumentation for races with document creation.
    IframeFallback(TargetId),
    SetupRetry {
        kind: SetupKind,
        attempt: u32,
    },
}

#[derive(Debug)]
enum PendingKind {
    /// A request received via channel; the caller parses the raw response.
    External(OneshotSender<Result<Response>>),
    /// Part of a target's attachment chain.
    Chain(TargetId),
    /// Periodic buffer drain for this target.
    Drain(TargetId),
    /// Self-healing probe for this target.
    Probe(TargetId),
    /// The last drain before finalization.
    FinalDrain(TargetId),
    Setup {
        kind: SetupKind,
        attempt: u32,
    },
    /// Fire-and-forget; protocol errors are logged at debug.
    Fire,
}

#[derive(Debug)]
struct PendingCommand {
    kind: PendingKind,
    method: MethodId,
    deadline: Instant,
}

/// A dedicated socket for one page target.
#[derive(Debug)]
struct PageChannel {
    conn: Connection<CdpEventMessage>,
    pending: FnvHashMap<CallId, PendingCommand>,
}

/// The coordinator that owns all per-session state and drives the protocol.
#[must_use = "streams do nothing unless polled"]
pub struct SessionCoordinator {
    config: CoordinatorConfig,
    /// The websocket connection to the browser instance
    conn: Connection<CdpEventMessage>,
    /// Commands awaiting a response on the browser socket
    pending_commands: FnvHashMap<CallId, PendingCommand>,
    page_channels: HashMap<TargetId, PageChannel>,
    from_service: Fuse<Receiver<CoordinatorMessage>>,
    to_self: futures::channel::mpsc::Sender<CoordinatorMessage>,
    registry: TargetRegistry,
    finalizer: TabFinalizer,
    solver: ChallengeSolver,
    store: ReplayStore,
    capture: Option<CaptureSession>,
    stats: Arc<SessionStats>,
    metrics: Metrics,
    /// Evicts timed out requests periodically
    evict_tick: PeriodicJob,
    drain_tick: PeriodicJob,
    /// Wakes the loop for the delayed-action queue
    timer_tick: PeriodicJob,
    delayed: Vec<(Instant, DelayedAction)>,
    session_started: Instant,
    /// The in-memory replay budget was exhausted.
    overflowed: bool,
    closing: bool,
    cleaned: bool,
}

impl std::fmt::Debug for SessionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCoordinator")
            .field("session_id", &self.config.session_id)
            .field("tabs", &self.registry.page_count())
            .field("page_channels", &self.page_channels.len())
            .field("pending", &self.pending_commands.len())
            .finish()
    }
}

impl SessionCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        conn: Connection<CdpEventMessage>,
        rx: Receiver<CoordinatorMessage>,
        to_self: futures::channel::mpsc::Sender<CoordinatorMessage>,
        config: CoordinatorConfig,
        store: ReplayStore,
        stats: Arc<SessionStats>,
        metrics: Metrics,
        solver: ChallengeSolver,
    ) -> Self {
        let capture = if config.capture_video {
            Some(CaptureSession::new(
                config.videos_dir.join(&config.session_id),
            ))
        } else {
            None
        };

        let mut coordinator = Self {
            conn,
            pending_commands: Default::default(),
            page_channels: Default::default(),
            from_service: rx.fuse(),
            to_self,
            registry: Default::default(),
            finalizer: Default::default(),
            solver,
            store,
            capture,
            stats,
            metrics,
            evict_tick: PeriodicJob::new(Duration::from_secs(1)),
            drain_tick: PeriodicJob::new(DRAIN_INTERVAL),
            timer_tick: PeriodicJob::new(Duration::from_millis(50)),
            delayed: Vec::new(),
            session_started: Instant::now(),
            overflowed: false,
            closing: false,
            cleaned: false,
            config,
        };
        let now = Instant::now();
        coordinator.submit_setup(SetupKind::AutoAttach, 1, now);
        coordinator.submit_setup(SetupKind::Discover, 1, now);
        coordinator
    }

    pub fn session_id(&self) -> &str {
        &self.config.session_id
    }

    // ---- command submission -------------------------------------------------

    fn submit_setup(&mut self, kind: SetupKind, attempt: u32, now: Instant) {
        let (method, params) = kind.params();
        if let Ok(call_id) = self.conn.submit_command(method.clone(), None, params) {
            self.pending_commands.insert(
                call_id,
                PendingCommand {
                    kind: PendingKind::Setup { kind, attempt },
                    method,
                    deadline: now + SETUP_TIMEOUT,
                },
            );
        }
    }

    fn submit_fire(
        &mut self,
        session_id: Option<SessionId>,
        method: MethodId,
        params: serde_json::Value,
        now: Instant,
    ) {
        match self.conn.submit_command(method.clone(), session_id, params) {
            Ok(call_id) => {
                self.pending_commands.insert(
                    call_id,
                    PendingCommand {
                        kind: PendingKind::Fire,
                        method,
                        deadline: now + self.config.request_timeout,
                    },
                );
            }
            Err(err) => tracing::debug!("failed to serialize {method}: {err}"),
        }
    }

    fn fire_evaluate(&mut self, session_id: &SessionId, expression: String, now: Instant) {
        let params = EvaluateParams {
            expression,
            return_by_value: Some(true),
            await_promise: None,
            silent: Some(true),
            user_gesture: None,
        };
        match serde_json::to_value(&params) {
            Ok(value) => self.submit_fire(
                Some(session_id.clone()),
                EvaluateParams::IDENTIFIER.into(),
                value,
                now,
            ),
            Err(err) => tracing::debug!("failed to serialize evaluate: {err}"),
        }
    }

    /// Evaluate on the browser socket with a typed pending kind, for flows
    /// that must not lose the response (drain, probe, final drain).
    fn submit_tracked_evaluate(
        &mut self,
        session_id: &SessionId,
        expression: &str,
        kind: PendingKind,
        now: Instant,
    ) {
        let params = EvaluateParams::by_value(expression);
        let method: MethodId = EvaluateParams::IDENTIFIER.into();
        match serde_json::to_value(&params) {
            Ok(value) => {
                if let Ok(call_id) =
                    self.conn
                        .submit_command(method.clone(), Some(session_id.clone()), value)
                {
                    self.pending_commands.insert(
                        call_id,
                        PendingCommand {
                            kind,
                            method,
                            deadline: now + self.config.request_timeout,
                        },
                    );
                }
            }
            Err(err) => tracing::debug!("failed to serialize evaluate: {err}"),
        }
    }

    /// Submit a command initiated via channel, honoring per-page routing.
    fn submit_external_command(&mut self, msg: CommandMessage, now: Instant) {
        let deadline = now + msg.timeout.unwrap_or(self.config.request_timeout);

        if let Some(target_id) = msg.page_route.clone() {
            if PAGE_ROUTE_ELIGIBLE.contains(&msg.method.as_ref()) {
                if let Some(channel) = self.page_channels.get_mut(&target_id) {
                    let method = msg.method.clone();
                    match channel.conn.submit_command(method.clone(), None, msg.params) {
                        Ok(call_id) => {
                            channel.pending.insert(
                                call_id,
                                PendingCommand {
                                    kind: PendingKind::External(msg.sender),
                                    method,
                                    deadline,
                                },
                            );
                        }
                        Err(err) => {
                            let _ = msg.sender.send(Err(err.into()));
                        }
                    }
                    return;
                }
            }
        }

        // fall back to the browser socket with the session attached
        match self
            .conn
            .submit_command(msg.method.clone(), msg.session_id, msg.params)
        {
            Ok(call_id) => {
                self.pending_commands.insert(
                    call_id,
                    PendingCommand {
                        kind: PendingKind::External(msg.sender),
                        method: msg.method,
                        deadline,
                    },
                );
            }
            Err(err) => {
                let _ = msg.sender.send(Err(err.into()));
            }
        }
    }

    // ---- attachment pipeline ------------------------------------------------

    fn on_attached_to_target(&mut self, event: Box<EventAttachedToTarget>, now: Instant) {
        let info = event.target_info;
        let session_id = event.session_id;

        if self.registry.contains(&info.target_id) {
            return;
        }

        if info.is_page() {
            let mut state = TargetState::new(
                info.target_id.clone(),
                session_id.clone(),
                TargetKind::Page,
                info.url.clone(),
                event.waiting_for_debugger,
            );
            state.init = Some(self.page_attach_chain(&info.target_id, event.waiting_for_debugger));
            self.registry.insert(state);
            tracing::debug!(
                target_id = %info.target_id,
                url = %info.url,
                "page target attached"
            );
            self.spawn_start_replay(&info.target_id, &info.url);
        } else if info.is_iframe() && info.url.contains(&self.config.challenge_host) {
            let parent = self
                .registry
                .pages()
                .max_by_key(|p| p.started)
                .map(|p| (p.session_id.clone(), p.target_id.clone()));
            let Some((parent_session, parent_target)) = self.iframe_parent(&info, parent) else {
                return;
            };
            let mut state = TargetState::new(
                info.target_id.clone(),
                session_id.clone(),
                TargetKind::ChallengeIframe,
                info.url.clone(),
                event.waiting_for_debugger,
            );
            state.init = Some(self.iframe_attach_chain(event.waiting_for_debugger));
            self.registry.insert(state);
            self.registry.link_iframe(IframeLink {
                iframe_session: session_id.clone(),
                iframe_target: info.target_id.clone(),
                parent_session: parent_session.clone(),
                parent_target: parent_target.clone(),
                url: info.url.clone(),
            });
            self.delayed.push((
                now + Duration::from_millis(50),
                DelayedAction::IframeFallback(info.target_id.clone()),
            ));
            self.solver.on_iframe_attached(
                parent_target,
                session_id,
                info.target_id.clone(),
                info.url.clone(),
            );
            tracing::debug!(target_id = %info.target_id, "challenge iframe attached");
        } else if event.waiting_for_debugger {
            // unrelated child target paused by auto-attach: let it run
            self.submit_fire(
                Some(session_id),
                runtime::RunIfWaitingForDebuggerParams::IDENTIFIER.into(),
                serde_json::json!({}),
                now,
            );
        }
        self.sync_stats();
    }

    /// Resolve the owning page for a challenge iframe: the opener if tracked,
    /// otherwise the most recently attached page.
    fn iframe_parent(
        &self,
        info: &replaymux_cdp::cdp::browser_protocol::target::TargetInfo,
        fallback: Option<(SessionId, TargetId)>,
    ) -> Option<(SessionId, TargetId)> {
        if let Some(opener) = info.opener_id.as_ref() {
            if let Some(parent) = self.registry.get(opener) {
                return Some((parent.session_id.clone(), parent.target_id.clone()));
            }
        }
        fallback
    }

    fn page_attach_chain(&self, target_id: &TargetId, waiting: bool) -> CommandChain {
        let hook = javascript::challenge_hook(
            &self.config.session_id,
            target_id.as_ref(),
            &self.config.beacon_url,
        );
        let mut cmds: Vec<(MethodId, serde_json::Value)> = vec![
            cmd_value(page::EnableParams::default()),
            cmd_value(AddScriptToEvaluateOnNewDocumentParams::run_immediately(
                self.config.recording_script.clone(),
            )),
            cmd_value(AddScriptToEvaluateOnNewDocumentParams::run_immediately(
                hook.clone(),
            )),
            cmd_value(runtime::AddBindingParams::new("__turnstileSolvedBinding")),
            cmd_value(runtime::AddBindingParams::new("__turnstileTargetBinding")),
            // propagate auto-attach so cross-origin iframes are caught
            cmd_value(SetAutoAttachParams::new(true, true)),
        ];
        if waiting {
            cmds.push(cmd_value(runtime::RunIfWaitingForDebuggerParams::default()));
        } else {
            // already executing; synthesize the injection into the live document
            cmds.push(cmd_value(EvaluateParams::by_value(
                self.config.recording_script.clone(),
            )));
            cmds.push(cmd_value(EvaluateParams::by_value(hook)));
        }
        if self.config.capture_video {
            cmds.push(cmd_value(StartScreencastParams {
                format: Some("png".to_string()),
                quality: None,
                max_width: Some(1280),
                max_height: Some(720),
                every_nth_frame: Some(2),
            }));
        }
        CommandChain::new(cmds, self.config.request_timeout)
    }

    fn iframe_attach_chain(&self, waiting: bool) -> CommandChain {
        let mut cmds: Vec<(MethodId, serde_json::Value)> = vec![
            cmd_value(AddScriptToEvaluateOnNewDocumentParams::run_immediately(
                javascript::IFRAME_RECORDER,
            )),
            cmd_value(runtime::AddBindingParams::new("__turnstileStateBinding")),
            cmd_value(AddScriptToEvaluateOnNewDocumentParams::run_immediately(
                javascript::IFRAME_STATE_OBSERVER,
            )),
            cmd_value(network::EnableParams::default()),
            cmd_value(runtime::EnableParams::default()),
        ];
        if waiting {
            cmds.push(cmd_value(runtime::RunIfWaitingForDebuggerParams::default()));
        }
        CommandChain::new(cmds, self.config.request_timeout)
    }

    /// Drive every in-flight attachment chain forward.
    fn poll_init_chains(&mut self, now: Instant) {
        let ids = self.registry.all_ids();
        for target_id in ids {
            loop {
                let Some(state) = self.registry.get_mut(&target_id) else {
                    break;
                };
                let Some(chain) = state.init.as_mut() else {
                    break;
                };
                match chain.poll(now) {
                    Poll::Ready(Some(Ok((method, params)))) => {
                        let session = state.session_id.clone();
                        if let Ok(call_id) =
                            self.conn
                                .submit_command(method.clone(), Some(session), params)
                        {
                            self.pending_commands.insert(
                                call_id,
                                PendingCommand {
                                    kind: PendingKind::Chain(target_id.clone()),
                                    method,
                                    deadline: now + self.config.request_timeout,
                                },
                            );
                        }
                        break;
                    }
                    Poll::Ready(Some(Err(expired))) => {
                        tracing::debug!(
                            target_id = %target_id,
                            method = %expired.method,
                            "attachment command timed out; continuing"
                        );
                        state.init = None;
                        self.finish_attach(&target_id, now);
                        break;
                    }
                    Poll::Ready(None) => {
                        state.init = None;
                        self.finish_attach(&target_id, now);
                        break;
                    }
                    Poll::Pending => break,
                }
            }
        }
    }

    fn finish_attach(&mut self, target_id: &TargetId, _now: Instant) {
        let Some(state) = self.registry.get_mut(target_id) else {
            return;
        };
        match state.kind {
            TargetKind::Page => {
                state.injected = true;
                let session = state.session_id.clone();
                let url = state.url.clone();
                if let Some(capture) = self.capture.as_mut() {
                    capture.start_target(target_id);
                }
                self.spawn_page_socket(target_id.clone());
                self.solver
                    .on_page_attached(target_id.clone(), session, url);
            }
            TargetKind::ChallengeIframe => {
                state.injected = true;
            }
        }
    }

    fn spawn_page_socket(&self, target_id: TargetId) {
        let Some(url) = self.page_ws_url(&target_id) else {
            return;
        };
        let mut to_self = self.to_self.clone();
        tokio::spawn(async move {
            let result = match tokio::time::timeout(
                PAGE_WS_OPEN_TIMEOUT,
                Connection::connect_with_base(&url, PAGE_CALL_ID_OFFSET),
            )
            .await
            {
                Ok(res) => res,
                Err(_) => Err(CdpError::Timeout),
            };
            let _ = to_self
                .try_send(CoordinatorMessage::PageSocketConnected(target_id, result));
        });
    }

    fn page_ws_url(&self, target_id: &TargetId) -> Option<String> {
        let parsed = url::Url::parse(&self.config.ws_url).ok()?;
        let host = parsed.host_str()?;
        let port = parsed
            .port_or_known_default()
            .map(|p| format!(":{p}"))
            .unwrap_or_default();
        Some(format!(
            "{}://{}{}/devtools/page/{}",
            parsed.scheme(),
            host,
            port,
            target_id
        ))
    }

    fn on_target_created(&mut self, event: EventTargetCreated, now: Instant) {
        let info = event.target_info;
        // pages opened by a competing client still need instrumentation
        if info.is_page() && !info.attached && !self.registry.contains(&info.target_id) {
            let params = AttachToTargetParams::new(info.target_id.clone());
            match serde_json::to_value(&params) {
                Ok(value) => {
                    self.submit_fire(None, AttachToTargetParams::IDENTIFIER.into(), value, now)
                }
                Err(err) => tracing::debug!("attachToTarget serialize failed: {err}"),
            }
        }
    }

    fn on_target_info_changed(&mut self, event: EventTargetInfoChanged, now: Instant) {
        let info = event.target_info;
        let Some(state) = self.registry.get_mut(&info.target_id) else {
            return;
        };
        if !state.is_page() {
            return;
        }
        let session = state.session_id.clone();
        state.reset_for_navigation(info.url.clone());

        // a navigation can drop the page-session auto-attach; re-apply it
        let (method, params) = AUTO_ATTACH_PARAMS.clone();
        self.submit_fire(Some(session.clone()), method, params, now);

        self.delayed.push((
            now + Duration::from_millis(200),
            DelayedAction::ReInject(info.target_id.clone()),
        ));
        self.solver
            .on_page_navigated(info.target_id, session, info.url);
    }

    fn on_target_destroyed(&mut self, event: EventTargetDestroyed, now: Instant) {
        if self.registry.contains(&event.target_id) {
            self.finalize_target(event.target_id.clone(), now);
        }
    }

    // ---- delayed actions ----------------------------------------------------

    fn run_due_actions(&mut self, now: Instant) {
        let queued = std::mem::take(&mut self.delayed);
        let mut due = Vec::new();
        for (at, action) in queued {
            if at <= now {
                due.push(action);
            } else {
                self.delayed.push((at, action));
            }
        }
        for action in due {
            self.run_action(action, now);
        }
    }

    fn run_action(&mut self, action: DelayedAction, now: Instant) {
        match action {
            DelayedAction::ReInject(target_id) => {
                let Some(state) = self.registry.get_mut(&target_id) else {
                    return;
                };
                if !state.is_page() {
                    return;
                }
                let session = state.session_id.clone();
                state.injected = true;
                let script = self.config.recording_script.clone();
                let hook = javascript::challenge_hook(
                    &self.config.session_id,
                    target_id.as_ref(),
                    &self.config.beacon_url,
                );
                self.fire_evaluate(&session, script, now);
                self.fire_evaluate(&session, hook, now);
            }
            DelayedAction::IframeFallback(target_id) => {
                let Some(state) = self.registry.get(&target_id) else {
                    return;
                };
                let session = state.session_id.clone();
                self.fire_evaluate(&session, javascript::IFRAME_RECORDER.to_string(), now);
                self.fire_evaluate(&session, javascript::IFRAME_STATE_OBSERVER.to_string(), now);
            }
            DelayedAction::SetupRetry { kind, attempt } => {
                self.submit_setup(kind, attempt, now);
            }
        }
    }

    // ---- drain loop ---------------------------------------------------------

    fn submit_drains(&mut self, now: Instant) {
        if self.closing {
            return;
        }
        let pages: Vec<(TargetId, SessionId)> = self
            .registry
            .pages()
            .filter(|p| !self.finalizer.is_started(&p.target_id))
            .map(|p| (p.target_id.clone(), p.session_id.clone()))
            .collect();
        for (target_id, session_id) in pages {
            self.submit_tracked_evaluate(
                &session_id,
                javascript::DRAIN_BUFFER,
                PendingKind::Drain(target_id),
                now,
            );
        }
    }

    fn evaluate_returns(resp: Response) -> Option<EvaluateReturns> {
        if resp.error.is_some() {
            return None;
        }
        resp.result
            .and_then(|value| serde_json::from_value::<EvaluateReturns>(value).ok())
    }

    fn handle_drain_response(&mut self, target_id: TargetId, resp: Response, now: Instant) {
        let Some(returns) = Self::evaluate_returns(resp) else {
            // drain failures are tolerated; the buffer is retried next tick
            return;
        };
        let events = drain::parse_drained_events(&returns);
        let action = match self.registry.get_mut(&target_id) {
            Some(state) => drain::apply_drain(state, events.len()),
            None => return,
        };
        if !events.is_empty() {
            self.forward_events(&target_id, events);
        }
        if action == DrainAction::Probe {
            if let Some(state) = self.registry.get(&target_id) {
                let session = state.session_id.clone();
                self.submit_tracked_evaluate(
                    &session,
                    javascript::SELF_HEAL_PROBE,
                    PendingKind::Probe(target_id),
                    now,
                );
            }
        }
    }

    fn handle_probe_response(&mut self, target_id: TargetId, resp: Response, now: Instant) {
        let report = Self::evaluate_returns(resp).and_then(|r| ProbeReport::parse(&r));
        let Some(state) = self.registry.get_mut(&target_id) else {
            return;
        };
        drain::mark_healed(state);
        let session = state.session_id.clone();
        if report.map(|r| r.needs_reinject()).unwrap_or(false) {
            tracing::debug!(target_id = %target_id, "self-healing: re-injecting recorder");
            self.fire_evaluate(&session, javascript::CLEAR_RESIDUAL.to_string(), now);
            self.fire_evaluate(&session, self.config.recording_script.clone(), now);
        }
    }

    fn forward_events(&mut self, target_id: &TargetId, events: Vec<serde_json::Value>) {
        let batch_bytes: u64 = events
            .iter()
            .map(|e| e.to_string().len() as u64)
            .sum();
        let current = self.stats.estimated_bytes.load(Ordering::Relaxed);
        if current + batch_bytes > MAX_REPLAY_BYTES {
            self.metrics.overflows_total.inc();
            if !self.overflowed {
                self.overflowed = true;
                tracing::warn!(
                    session_id = %self.config.session_id,
                    "replay byte budget exhausted; dropping further events"
                );
            }
            return;
        }
        self.stats
            .estimated_bytes
            .fetch_add(batch_bytes, Ordering::Relaxed);
        self.metrics.events_total.inc_by(events.len() as u64);

        let store = self.store.clone();
        let session_id = self.config.session_id.clone();
        let target = target_id.as_ref().to_string();
        tokio::spawn(async move {
            if let Err(err) = store.add_tab_events(&session_id, &target, &events).await {
                tracing::debug!("replay store write failed: {err}");
            }
        });
    }

    fn spawn_start_replay(&self, target_id: &TargetId, url: &str) {
        let store = self.store.clone();
        let session_id = self.config.session_id.clone();
        let target = target_id.as_ref().to_string();
        let url = url.to_string();
        tokio::spawn(async move {
            if let Err(err) = store.start_tab_replay(&session_id, &target, &url).await {
                tracing::debug!("replay store start failed: {err}");
            }
        });
    }

    // ---- finalization -------------------------------------------------------

    fn finalize_target(&mut self, target_id: TargetId, now: Instant) {
        if !self.finalizer.begin(&target_id) {
            return;
        }
        match self.registry.get(&target_id) {
            Some(state) if !self.closing => {
                let session = state.session_id.clone();
                self.submit_tracked_evaluate(
                    &session,
                    javascript::DRAIN_BUFFER,
                    PendingKind::FinalDrain(target_id),
                    now,
                );
            }
            _ => self.continue_finalize(target_id, now),
        }
    }

    fn continue_finalize(&mut self, target_id: TargetId, now: Instant) {
        let state = self.remove_target(&target_id);
        let (event_count, duration_ms) = match state {
            Some(state) => {
                if self.config.capture_video && !self.closing {
                    let params = serde_json::to_value(StopScreencastParams::default())
                        .unwrap_or_default();
                    self.submit_fire(
                        Some(state.session_id.clone()),
                        StopScreencastParams::IDENTIFIER.into(),
                        params,
                        now,
                    );
                }
                (
                    state.event_count,
                    state.started.elapsed().as_millis() as u64,
                )
            }
            None => (0, 0),
        };
        let frame_count = self
            .capture
            .as_mut()
            .map(|c| c.stop_target(&target_id))
            .unwrap_or(0);

        self.metrics
            .tab_duration
            .observe(duration_ms as f64 / 1000.0);

        let store = self.store.clone();
        let session = self.config.session_id.clone();
        let mut to_self = self.to_self.clone();
        let target = target_id.clone();
        tokio::spawn(async move {
            let result = match store
                .stop_tab_replay(&session, target.as_ref(), frame_count)
                .await
            {
                Ok(Some(stopped)) => Some(FinalizedTab {
                    replay_id: stopped.replay_id.clone(),
                    duration_ms: stopped.duration_ms,
                    event_count: stopped.event_count.max(event_count),
                    replay_url: format!("/replay/{}", stopped.replay_id),
                    frame_count,
                    encoding_status: if frame_count > 0 {
                        "pending".to_string()
                    } else {
                        "none".to_string()
                    },
                    video_url: (frame_count > 0)
                        .then(|| format!("/video/{}", stopped.replay_id)),
                }),
                Ok(None) => None,
                Err(err) => {
                    tracing::debug!("stop_tab_replay failed: {err}");
                    None
                }
            };
            let _ = to_self.try_send(CoordinatorMessage::FinalizeDone(target, result));
        });
        self.sync_stats();
    }

    /// Unregister the target from both indices and tear down its socket.
    fn remove_target(&mut self, target_id: &TargetId) -> Option<TargetState> {
        if let Some(mut channel) = self.page_channels.remove(target_id) {
            reject_all(&mut channel.pending);
        }
        let state = self.registry.remove(target_id);
        self.sync_stats();
        state
    }

    // ---- event dispatch -----------------------------------------------------

    fn on_event(&mut self, event: CdpEventMessage, now: Instant) {
        let CdpEventMessage {
            method: _,
            session_id,
            params,
        } = event;

        // target lifecycle events are handled wherever they arrive: with
        // flat auto-attach, a child's attachedToTarget carries the parent's
        // session id
        match params {
            CdpEvent::TargetTargetCreated(ev) => self.on_target_created(ev, now),
            CdpEvent::TargetAttachedToTarget(ev) => self.on_attached_to_target(ev, now),
            CdpEvent::TargetTargetInfoChanged(ev) => self.on_target_info_changed(ev, now),
            CdpEvent::TargetTargetDestroyed(ev) => self.on_target_destroyed(ev, now),
            CdpEvent::TargetDetachedFromTarget(_) => {}
            params => {
                let Some(session_raw) = session_id else {
                    return;
                };
                let session: SessionId = session_raw.into();
                if self.registry.iframe_link(&session).is_some() {
                    self.on_iframe_event(&session, params, now);
                    return;
                }
                if let Some(state) = self.registry.by_session(&session) {
                    let target_id = state.target_id.clone();
                    self.on_page_event(&target_id, &session, params, now);
                }
            }
        }
    }

    fn on_page_event(
        &mut self,
        target_id: &TargetId,
        session: &SessionId,
        params: CdpEvent,
        now: Instant,
    ) {
        match params {
            CdpEvent::RuntimeBindingCalled(ev) => match ev.name.as_str() {
                "__turnstileSolvedBinding" => {
                    self.solver
                        .on_solved_binding(target_id.clone(), session.clone(), ev.payload);
                }
                "__turnstileTargetBinding" => {
                    self.solver
                        .on_target_coords(target_id.clone(), ev.payload);
                }
                _ => {}
            },
            CdpEvent::PageScreencastFrame(frame) => {
                self.on_screencast_frame(target_id, session, *frame, now);
            }
            _ => {}
        }
    }

    fn on_screencast_frame(
        &mut self,
        target_id: &TargetId,
        session: &SessionId,
        frame: EventScreencastFrame,
        now: Instant,
    ) {
        let ack = ScreencastFrameAckParams::new(frame.session_id);
        match serde_json::to_value(&ack) {
            Ok(value) => self.submit_fire(
                Some(session.clone()),
                ScreencastFrameAckParams::IDENTIFIER.into(),
                value,
                now,
            ),
            Err(err) => tracing::debug!("screencast ack serialize failed: {err}"),
        }

        let Some(capture) = self.capture.as_mut() else {
            return;
        };
        let Some((path, _index)) = capture.record_frame(target_id) else {
            return;
        };
        tokio::spawn(async move {
            if let Err(err) = CaptureSession::write_frame(path, frame.data).await {
                tracing::debug!("screencast frame write failed: {err}");
            }
        });
    }

    fn on_iframe_event(&mut self, session: &SessionId, params: CdpEvent, now: Instant) {
        let Some(link) = self.registry.iframe_link(session).cloned() else {
            return;
        };
        match params {
            CdpEvent::NetworkRequestWillBeSent(ev) => {
                let bridged = bridge_request(&ev);
                self.fire_evaluate(
                    &link.parent_session,
                    javascript::push_recording_event(bridged.tag, &bridged.payload),
                    now,
                );
                if is_challenge_cdn(&ev, &self.config.challenge_host) {
                    self.fire_evaluate(&link.parent_session, javascript::bump_cf_activity(), now);
                }
            }
            CdpEvent::NetworkResponseReceived(ev) => {
                let bridged = bridge_response(&ev);
                self.fire_evaluate(
                    &link.parent_session,
                    javascript::push_recording_event(bridged.event.tag, &bridged.event.payload),
                    now,
                );
                if let Some(success) = bridged.pat {
                    self.fire_evaluate(
                        &link.parent_session,
                        javascript::bump_pat_counters(success),
                        now,
                    );
                }
            }
            CdpEvent::RuntimeConsoleApiCalled(ev) => {
                let payload = bridge_console(&ev);
                self.fire_evaluate(
                    &link.parent_session,
                    javascript::push_console_event(&payload),
                    now,
                );
            }
            CdpEvent::RuntimeBindingCalled(ev) if ev.name == "__turnstileStateBinding" => {
                let state = ev.payload;
                self.fire_evaluate(
                    &link.parent_session,
                    javascript::push_recording_event(
                        "cf.iframe_state",
                        &serde_json::json!({ "state": state }),
                    ),
                    now,
                );
                self.fire_evaluate(
                    &link.parent_session,
                    javascript::set_widget_state(&state),
                    now,
                );
                self.solver.on_iframe_state(link.parent_target.clone(), state);
            }
            _ => {}
        }
    }

    // ---- response dispatch --------------------------------------------------

    fn on_response(&mut self, resp: Response, now: Instant) {
        let Some(pending) = self.pending_commands.remove(&resp.id) else {
            return;
        };
        match pending.kind {
            PendingKind::External(tx) => {
                let _ = tx.send(Ok(resp));
            }
            PendingKind::Chain(target_id) => {
                if let Some(error) = resp.error.as_ref() {
                    tracing::debug!(
                        target_id = %target_id,
                        method = %pending.method,
                        code = error.code,
                        "attachment command failed: {}",
                        error.message
                    );
                }
                if let Some(state) = self.registry.get_mut(&target_id) {
                    if let Some(chain) = state.init.as_mut() {
                        chain.received_response(pending.method.as_ref());
                    }
                }
            }
            PendingKind::Drain(target_id) => {
                self.handle_drain_response(target_id, resp, now);
            }
            PendingKind::Probe(target_id) => {
                self.handle_probe_response(target_id, resp, now);
            }
            PendingKind::FinalDrain(target_id) => {
                if let Some(returns) = Self::evaluate_returns(resp) {
                    let events = drain::parse_drained_events(&returns);
                    if let Some(state) = self.registry.get_mut(&target_id) {
                        state.event_count += events.len() as u64;
                    }
                    if !events.is_empty() {
                        self.forward_events(&target_id, events);
                    }
                }
                self.continue_finalize(target_id, now);
            }
            PendingKind::Setup { kind, attempt } => {
                if let Some(error) = resp.error.as_ref() {
                    self.on_setup_failed(kind, attempt, &error.message, now);
                }
            }
            PendingKind::Fire => {
                if let Some(error) = resp.error.as_ref() {
                    tracing::debug!(
                        method = %pending.method,
                        code = error.code,
                        "command failed: {}",
                        error.message
                    );
                }
            }
        }
    }

    fn on_setup_failed(&mut self, kind: SetupKind, attempt: u32, reason: &str, now: Instant) {
        if attempt >= 3 {
            tracing::error!(?kind, "attachment setup failed after {attempt} attempts: {reason}");
            return;
        }
        let backoff = Duration::from_millis(250 * 2u64.pow(attempt - 1));
        self.delayed.push((
            now + backoff,
            DelayedAction::SetupRetry {
                kind,
                attempt: attempt + 1,
            },
        ));
    }

    // ---- housekeeping -------------------------------------------------------

    /// Remove all commands where `now` passed the deadline and notify the
    /// senders that their request timed out.
    fn evict_timed_out_commands(&mut self, now: Instant) {
        let timed_out: Vec<CallId> = self
            .pending_commands
            .iter()
            .filter(|(_, cmd)| now > cmd.deadline)
            .map(|(k, _)| *k)
            .collect();
        for call in timed_out {
            if let Some(pending) = self.pending_commands.remove(&call) {
                self.on_command_timeout(pending, now);
            }
        }

        let channel_ids: Vec<TargetId> = self.page_channels.keys().cloned().collect();
        for id in channel_ids {
            let expired: Vec<(CallId, PendingCommand)> = {
                let Some(channel) = self.page_channels.get_mut(&id) else {
                    continue;
                };
                let ids: Vec<CallId> = channel
                    .pending
                    .iter()
                    .filter(|(_, cmd)| now > cmd.deadline)
                    .map(|(k, _)| *k)
                    .collect();
                ids.into_iter()
                    .filter_map(|cid| channel.pending.remove(&cid).map(|p| (cid, p)))
                    .collect()
            };
            for (_, pending) in expired {
                self.on_command_timeout(pending, now);
            }
        }
        self.sync_stats();
    }

    fn on_command_timeout(&mut self, pending: PendingCommand, now: Instant) {
        match pending.kind {
            PendingKind::External(tx) => {
                let _ = tx.send(Err(CdpError::Timeout));
            }
            PendingKind::Chain(target_id) => {
                // unblock the chain; the next command proceeds
                if let Some(state) = self.registry.get_mut(&target_id) {
                    if let Some(chain) = state.init.as_mut() {
                        chain.received_response(pending.method.as_ref());
                    }
                }
            }
            PendingKind::FinalDrain(target_id) => {
                self.continue_finalize(target_id, now);
            }
            PendingKind::Setup { kind, attempt } => {
                self.on_setup_failed(kind, attempt, "timeout", now);
            }
            PendingKind::Drain(_) | PendingKind::Probe(_) | PendingKind::Fire => {}
        }
    }

    fn poll_page_channels(&mut self, cx: &mut Context<'_>) {
        let ids: Vec<TargetId> = self.page_channels.keys().cloned().collect();
        for id in ids {
            let mut dead = false;
            if let Some(channel) = self.page_channels.get_mut(&id) {
                loop {
                    match Pin::new(&mut channel.conn).poll_next(cx) {
                        Poll::Ready(Some(Ok(Message::Response(resp)))) => {
                            if let Some(pending) = channel.pending.remove(&resp.id) {
                                if let PendingKind::External(tx) = pending.kind {
                                    let _ = tx.send(Ok(resp));
                                }
                            }
                        }
                        Poll::Ready(Some(Ok(Message::Event(_)))) => {
                            // page sockets never enable event domains
                        }
                        Poll::Ready(Some(Err(err))) => {
                            tracing::debug!(target_id = %id, "page socket error: {err}");
                            dead = true;
                            break;
                        }
                        Poll::Ready(None) => {
                            dead = true;
                            break;
                        }
                        Poll::Pending => break,
                    }
                }
            }
            if dead {
                self.on_page_channel_dead(&id);
            }
        }
    }

    fn on_page_channel_dead(&mut self, target_id: &TargetId) {
        if let Some(mut channel) = self.page_channels.remove(target_id) {
            reject_all(&mut channel.pending);
        }
        let Some(state) = self.registry.get_mut(target_id) else {
            return;
        };
        if state.failed_reconnect {
            return;
        }
        if state.reconnect_attempted {
            state.failed_reconnect = true;
            tracing::debug!(target_id = %target_id, "page socket reconnect latched off");
            return;
        }
        state.reconnect_attempted = true;
        self.spawn_page_socket(target_id.clone());
        self.sync_stats();
    }

    fn on_page_socket_connected(
        &mut self,
        target_id: TargetId,
        result: Result<Connection<CdpEventMessage>>,
    ) {
        match result {
            Ok(conn) if !self.closing && self.registry.contains(&target_id) => {
                self.page_channels.insert(
                    target_id,
                    PageChannel {
                        conn,
                        pending: Default::default(),
                    },
                );
            }
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(target_id = %target_id, "page socket open failed: {err}");
                if let Some(state) = self.registry.get_mut(&target_id) {
                    if state.reconnect_attempted {
                        state.failed_reconnect = true;
                    }
                }
            }
        }
        self.sync_stats();
    }

    fn sync_stats(&self) {
        self.stats
            .tabs_open
            .store(self.registry.page_count() as i64, Ordering::Relaxed);
        self.stats
            .page_ws
            .store(self.page_channels.len() as i64, Ordering::Relaxed);
        let pending = self.pending_commands.len()
            + self
                .page_channels
                .values()
                .map(|c| c.pending.len())
                .sum::<usize>();
        self.stats
            .pending_commands
            .store(pending as i64, Ordering::Relaxed);
    }

    /// Ordered, idempotent teardown.
    fn cleanup(&mut self, source: &str) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;
        self.closing = true;
        tracing::debug!(session_id = %self.config.session_id, source, "session cleanup");

        // timers are gated off by `closing`; reject every pending command
        let mut pending = std::mem::take(&mut self.pending_commands);
        reject_all(&mut pending);
        let channels = std::mem::take(&mut self.page_channels);
        for (_, mut channel) in channels {
            reject_all(&mut channel.pending);
        }

        // challenge accounting must never be left dangling
        self.solver.emit_unresolved();
        self.solver.shutdown();

        // finalize every tracked tab (store writes happen on spawned tasks)
        let now = Instant::now();
        for target_id in self.registry.page_ids() {
            self.finalize_target(target_id, now);
        }

        if let Some(capture) = self.capture.as_mut() {
            capture.stop_all();
        }
        self.registry.clear();
        self.sync_stats();
        self.stats.estimated_bytes.store(0, Ordering::Relaxed);
        self.metrics
            .session_duration
            .observe(self.session_started.elapsed().as_secs_f64());
    }
}

fn reject_all(pending: &mut FnvHashMap<CallId, PendingCommand>) {
    for (_, cmd) in pending.drain() {
        if let PendingKind::External(tx) = cmd.kind {
            let _ = tx.send(Err(CdpError::SessionClosed));
        }
    }
}

fn cmd_value<C: replaymux_cdp::Command>(cmd: C) -> (MethodId, serde_json::Value) {
    (
        cmd.identifier(),
        serde_json::to_value(cmd).unwrap_or_default(),
    )
}

impl Stream for SessionCoordinator {
    type Item = Result<()>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let pin = self.get_mut();

        loop {
            if pin.cleaned {
                return Poll::Ready(None);
            }
            let now = Instant::now();
            let mut progress = false;

            while let Poll::Ready(Some(msg)) = Pin::new(&mut pin.from_service).poll_next(cx) {
                progress = true;
                match msg {
                    CoordinatorMessage::Command(cmd) => pin.submit_external_command(cmd, now),
                    CoordinatorMessage::PageSocketConnected(target_id, result) => {
                        pin.on_page_socket_connected(target_id, result)
                    }
                    CoordinatorMessage::Beacon {
                        target_id,
                        token_length,
                    } => {
                        let target: TargetId = target_id.into();
                        let known = pin.registry.contains(&target)
                            || pin.finalizer.is_started(&target);
                        pin.solver.on_beacon(target, token_length, known);
                    }
                    CoordinatorMessage::FinalizeDone(target_id, result) => {
                        if let (Some(sink), Some(finalized)) =
                            (pin.config.on_tab_finalized.as_ref(), result.as_ref())
                        {
                            let _ = sink.unbounded_send(finalized.clone());
                        }
                        pin.finalizer.complete(target_id, result);
                    }
                    CoordinatorMessage::Destroy { source, ack } => {
                        pin.cleanup(&source);
                        let _ = ack.send(());
                        return Poll::Ready(None);
                    }
                }
            }

            pin.poll_init_chains(now);

            if pin.timer_tick.poll_ready(cx) {
                pin.run_due_actions(now);
            }
            if pin.drain_tick.poll_ready(cx) {
                pin.submit_drains(now);
            }
            if pin.evict_tick.poll_ready(cx) {
                pin.evict_timed_out_commands(now);
            }

            pin.poll_page_channels(cx);

            loop {
                match Pin::new(&mut pin.conn).poll_next(cx) {
                    Poll::Ready(Some(Ok(Message::Response(resp)))) => {
                        pin.on_response(resp, now);
                        progress = true;
                    }
                    Poll::Ready(Some(Ok(Message::Event(event)))) => {
                        pin.on_event(event, now);
                        progress = true;
                    }
                    Poll::Ready(Some(Err(err))) => {
                        tracing::error!("WS connection error: {err}");
                        pin.cleanup("ws_error");
                        return Poll::Ready(Some(Err(err)));
                    }
                    Poll::Ready(None) => {
                        pin.cleanup("ws_closed");
                        return Poll::Ready(None);
                    }
                    Poll::Pending => break,
                }
            }

            pin.sync_stats();

            if !progress {
                return Poll::Pending;
            }
        }
    }
}
