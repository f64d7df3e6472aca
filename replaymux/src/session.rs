//! Session handles and the process-wide session registry.
//!
//! A [`SessionHandle`] is the cloneable front door to one coordinator: it
//! turns typed commands into channel messages carrying oneshot responders,
//! the same way pages talk to the browser handler loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::channel::mpsc::{channel, Sender};
use futures::channel::oneshot::channel as oneshot_channel;
use futures::SinkExt;

use replaymux_cdp::cdp::browser_protocol::target::{SessionId, TargetId};
use replaymux_cdp::cdp::js_protocol::runtime::{EvaluateParams, EvaluateReturns};
use replaymux_cdp::{Command, CommandResponse, Method};

use crate::cmd::{to_command_response, CommandMessage};
use crate::conn::Connection;
use crate::coordinator::{CoordinatorConfig, CoordinatorMessage, SessionCoordinator};
use crate::error::{CdpError, Result};
use crate::metrics::Metrics;
use crate::solver::{ChallengeEvent, ChallengeSolver, SolverConfig};
use crate::store::ReplayStore;

/// Live counters one coordinator maintains for scrape-time collection.
///
/// The coordinator stores absolute values after each mutation, so the gauges
/// built from these can never drift negative.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub tabs_open: AtomicI64,
    pub page_ws: AtomicI64,
    pub pending_commands: AtomicI64,
    pub estimated_bytes: AtomicU64,
}

/// Cloneable handle to a running session coordinator.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    session_id: String,
    sender: Sender<CoordinatorMessage>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Call a browser-wide method.
    pub async fn execute<T: Command>(&self, cmd: T) -> Result<CommandResponse<T::Response>> {
        let (tx, rx) = oneshot_channel();
        let method = cmd.identifier();
        let msg = CommandMessage::new(cmd, tx)?;
        self.sender
            .clone()
            .send(CoordinatorMessage::Command(msg))
            .await?;
        let resp = rx.await??;
        to_command_response::<T>(resp, method)
    }

    /// Call a method scoped to an attached session.
    pub async fn execute_on<T: Command>(
        &self,
        session_id: &SessionId,
        cmd: T,
    ) -> Result<CommandResponse<T::Response>> {
        let (tx, rx) = oneshot_channel();
        let method = cmd.identifier();
        let msg = CommandMessage::with_session(cmd, tx, Some(session_id.clone()))?;
        self.sender
            .clone()
            .send(CoordinatorMessage::Command(msg))
            .await?;
        let resp = rx.await??;
        to_command_response::<T>(resp, method)
    }

    /// Like [`execute_on`](Self::execute_on) with an explicit response
    /// deadline instead of the session default.
    pub async fn execute_with_timeout<T: Command>(
        &self,
        session_id: Option<&SessionId>,
        cmd: T,
        timeout: Duration,
    ) -> Result<CommandResponse<T::Response>> {
        let (tx, rx) = oneshot_channel();
        let method = cmd.identifier();
        let mut msg = CommandMessage::with_session(cmd, tx, session_id.cloned())?;
        msg.timeout = Some(timeout);
        self.sender
            .clone()
            .send(CoordinatorMessage::Command(msg))
            .await?;
        let resp = rx.await??;
        to_command_response::<T>(resp, method)
    }

    /// Evaluate on a page, preferring its dedicated socket when open.
    pub async fn evaluate_on_page(
        &self,
        target_id: &TargetId,
        session_id: &SessionId,
        params: EvaluateParams,
    ) -> Result<EvaluateReturns> {
        let (tx, rx) = oneshot_channel();
        let method = params.identifier();
        let mut msg = CommandMessage::with_session(params, tx, Some(session_id.clone()))?;
        msg.page_route = Some(target_id.clone());
        self.sender
            .clone()
            .send(CoordinatorMessage::Command(msg))
            .await?;
        let resp = rx.await??;
        Ok(to_command_response::<EvaluateParams>(resp, method)?.result)
    }

    /// Evaluate an expression expected to return json (possibly as a string)
    /// and hand back the decoded value.
    pub async fn evaluate_json(
        &self,
        target_id: &TargetId,
        session_id: &SessionId,
        expression: &str,
    ) -> Result<Option<serde_json::Value>> {
        let returns = self
            .evaluate_on_page(target_id, session_id, EvaluateParams::by_value(expression))
            .await?;
        if let Some(details) = returns.exception_details {
            return Err(CdpError::JavascriptException(Box::new(details)));
        }
        Ok(match returns.result.value {
            Some(serde_json::Value::String(raw)) => match serde_json::from_str(&raw) {
                Ok(decoded) => Some(decoded),
                Err(_) => Some(serde_json::Value::String(raw)),
            },
            other => other,
        })
    }

    /// Fire a session-scoped command without waiting for its response.
    pub fn fire_on<T: Command>(&self, session_id: &SessionId, cmd: T) {
        let (tx, _rx) = oneshot_channel();
        if let Ok(msg) = CommandMessage::with_session(cmd, tx, Some(session_id.clone())) {
            let _ = self
                .sender
                .clone()
                .try_send(CoordinatorMessage::Command(msg));
        }
    }

    /// Deliver a beacon result; returns `false` when the session is gone.
    pub async fn beacon(&self, target_id: String, token_length: u64) -> bool {
        self.sender
            .clone()
            .send(CoordinatorMessage::Beacon {
                target_id,
                token_length,
            })
            .await
            .is_ok()
    }

    /// Ask the coordinator to shut down and wait for the acknowledgment.
    pub async fn destroy(&self, source: &str) {
        let (tx, rx) = oneshot_channel();
        let sent = self
            .sender
            .clone()
            .send(CoordinatorMessage::Destroy {
                source: source.to_string(),
                ack: tx,
            })
            .await
            .is_ok();
        if sent {
            let _ = rx.await;
        }
    }
}

struct SessionEntry {
    handle: SessionHandle,
    stats: Arc<SessionStats>,
    started: Instant,
}

/// Aggregated view over every registered session, read at scrape time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregateStats {
    pub sessions: u64,
    pub tabs_open: u64,
    pub page_ws: u64,
    pub pending_commands: u64,
    pub estimated_bytes: u64,
}

/// Process-wide registry of live sessions.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<HashMap<String, SessionEntry>>>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .finish()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(
        &self,
        session_id: String,
        handle: SessionHandle,
        stats: Arc<SessionStats>,
    ) {
        let mut inner = self.inner.lock().expect("registry poisoned");
        inner.insert(
            session_id,
            SessionEntry {
                handle,
                stats,
                started: Instant::now(),
            },
        );
    }

    /// Drops the session; returns how long it lived.
    pub fn unregister(&self, session_id: &str) -> Option<Duration> {
        let mut inner = self.inner.lock().expect("registry poisoned");
        inner.remove(session_id).map(|e| e.started.elapsed())
    }

    pub fn get(&self, session_id: &str) -> Option<SessionHandle> {
        let inner = self.inner.lock().expect("registry poisoned");
        inner.get(session_id).map(|e| e.handle.clone())
    }

    pub fn handles(&self) -> Vec<SessionHandle> {
        let inner = self.inner.lock().expect("registry poisoned");
        inner.values().map(|e| e.handle.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot used by the metrics collector; pure reads of the per-session
    /// atomics, no locks held by coordinators.
    pub fn aggregate(&self) -> AggregateStats {
        let inner = self.inner.lock().expect("registry poisoned");
        let mut agg = AggregateStats {
            sessions: inner.len() as u64,
            ..Default::default()
        };
        for entry in inner.values() {
            agg.tabs_open += entry.stats.tabs_open.load(Ordering::Relaxed).max(0) as u64;
            agg.page_ws += entry.stats.page_ws.load(Ordering::Relaxed).max(0) as u64;
            agg.pending_commands +=
                entry.stats.pending_commands.load(Ordering::Relaxed).max(0) as u64;
            agg.estimated_bytes += entry.stats.estimated_bytes.load(Ordering::Relaxed);
        }
        agg
    }

    /// Destroy every session, used on process shutdown.
    pub async fn shutdown_all(&self, source: &str) {
        for handle in self.handles() {
            handle.destroy(source).await;
        }
    }
}

/// Connects to the browser endpoint and launches a coordinator for it.
///
/// The coordinator loop runs on a spawned task; the returned handle is the
/// only way to reach it. The session unregisters itself when the loop ends.
pub async fn launch_session(
    config: CoordinatorConfig,
    store: ReplayStore,
    registry: SessionRegistry,
    metrics: Metrics,
    challenge_sink: futures::channel::mpsc::UnboundedSender<ChallengeEvent>,
) -> Result<SessionHandle> {
    use futures::StreamExt;

    let conn = Connection::connect(&config.ws_url).await?;
    let (tx, rx) = channel(256);
    let handle = SessionHandle {
        session_id: config.session_id.clone(),
        sender: tx.clone(),
    };
    let stats = Arc::new(SessionStats::default());

    let solver = ChallengeSolver::new(
        handle.clone(),
        challenge_sink,
        SolverConfig {
            challenge_host: config.challenge_host.clone(),
            viewport: config.viewport,
            ..Default::default()
        },
    );

    let coordinator = SessionCoordinator::new(
        conn,
        rx,
        tx,
        config.clone(),
        store,
        stats.clone(),
        metrics,
        solver,
    );

    registry.register(config.session_id.clone(), handle.clone(), stats);

    let session_id = config.session_id.clone();
    let registry_for_loop = registry.clone();
    tokio::spawn(async move {
        let mut coordinator = coordinator;
        while let Some(result) = coordinator.next().await {
            if let Err(err) = result {
                tracing::error!(session_id = %session_id, "session loop error: {err}");
            }
        }
        registry_for_loop.unregister(&session_id);
        tracing::debug!(session_id = %session_id, "session ended");
    });

    Ok(handle)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Builds a handle around an arbitrary channel, for solver/emitter tests.
    pub(crate) fn handle(id: &str, sender: Sender<CoordinatorMessage>) -> SessionHandle {
        SessionHandle {
            session_id: id.to_string(),
            sender,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_handle(id: &str) -> (SessionHandle, futures::channel::mpsc::Receiver<CoordinatorMessage>)
    {
        let (tx, rx) = channel(8);
        (
            SessionHandle {
                session_id: id.to_string(),
                sender: tx,
            },
            rx,
        )
    }

    #[test]
    fn register_unregister_roundtrip() {
        let registry = SessionRegistry::new();
        let (handle, _rx) = dummy_handle("s1");
        registry.register("s1".to_string(), handle, Arc::new(SessionStats::default()));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("s1").is_some());
        assert!(registry.unregister("s1").is_some());
        assert!(registry.is_empty());
        assert!(registry.unregister("s1").is_none());
    }

    #[test]
    fn aggregate_sums_session_stats_and_never_goes_negative() {
        let registry = SessionRegistry::new();
        let stats_a = Arc::new(SessionStats::default());
        stats_a.tabs_open.store(3, Ordering::Relaxed);
        stats_a.page_ws.store(2, Ordering::Relaxed);
        stats_a.estimated_bytes.store(1024, Ordering::Relaxed);
        // a buggy writer storing a negative count must not underflow the sum
        let stats_b = Arc::new(SessionStats::default());
        stats_b.tabs_open.store(-5, Ordering::Relaxed);

        let (ha, _rxa) = dummy_handle("a");
        let (hb, _rxb) = dummy_handle("b");
        registry.register("a".to_string(), ha, stats_a);
        registry.register("b".to_string(), hb, stats_b);

        let agg = registry.aggregate();
        assert_eq!(agg.sessions, 2);
        assert_eq!(agg.tabs_open, 3);
        assert_eq!(agg.page_ws, 2);
        assert_eq!(agg.estimated_bytes, 1024);

        registry.unregister("a");
        registry.unregister("b");
        assert_eq!(registry.aggregate(), AggregateStats::default());
    }

    #[tokio::test]
    async fn beacon_fails_after_receiver_drops() {
        let (handle, rx) = dummy_handle("s1");
        drop(rx);
        assert!(!handle.beacon("t1".to_string(), 10).await);
    }
}
