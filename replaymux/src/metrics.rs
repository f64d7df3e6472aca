//! Prometheus metrics.
//!
//! The live gauges are scrape-time collectors over the session registry
//! snapshot; there are no inc/dec pairs that could drift negative. Counters
//! and histograms are plain inc-only series owned by this struct.

use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder};

use crate::session::SessionRegistry;

/// Gauge definitions: (name, help), in the order `collect` reads them.
const GAUGES: [(&str, &str); 5] = [
    (
        "browserless_replay_sessions_active",
        "Count of registered recording sessions",
    ),
    (
        "browserless_replay_ws_connections",
        "Per-page websocket connections across sessions",
    ),
    (
        "browserless_replay_pending_commands",
        "Pending CDP commands across all sockets",
    ),
    ("browserless_tabs_open", "Tracked page targets across sessions"),
    (
        "browserless_replay_estimated_bytes",
        "In-memory replay bytes across sessions",
    ),
];

#[derive(Debug)]
struct SessionsCollector {
    sessions: SessionRegistry,
    descs: Vec<Desc>,
}

impl SessionsCollector {
    fn new(sessions: SessionRegistry) -> Self {
        let descs = GAUGES
            .iter()
            .filter_map(|(name, help)| {
                Desc::new((*name).to_string(), (*help).to_string(), vec![], Default::default()).ok()
            })
            .collect();
        Self { sessions, descs }
    }
}

impl Collector for SessionsCollector {
    fn desc(&self) -> Vec<&Desc> {
        self.descs.iter().collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let agg = self.sessions.aggregate();
        let values = [
            agg.sessions,
            agg.page_ws,
            agg.pending_commands,
            agg.tabs_open,
            agg.estimated_bytes,
        ];
        let mut families = Vec::with_capacity(GAUGES.len());
        for ((name, help), value) in GAUGES.iter().zip(values) {
            if let Ok(gauge) = IntGauge::with_opts(Opts::new(*name, *help)) {
                gauge.set(value as i64);
                families.extend(gauge.collect());
            }
        }
        families
    }
}

/// Process-wide metrics handle; cheap to clone, registry-scoped for test
/// isolation.
#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    pub tab_duration: Histogram,
    pub session_duration: Histogram,
    pub events_total: IntCounter,
    pub overflows_total: IntCounter,
}

impl Metrics {
    pub fn new(sessions: SessionRegistry) -> Self {
        let registry = Registry::new();

        let tab_duration = Histogram::with_opts(
            HistogramOpts::new(
                "browserless_tab_duration_seconds",
                "Lifetime of a tab from attach to destroy",
            )
            .buckets(vec![1.0, 5.0, 15.0, 60.0, 300.0, 1800.0]),
        )
        .expect("valid histogram opts");
        let session_duration = Histogram::with_opts(
            HistogramOpts::new(
                "browserless_session_duration_seconds",
                "Lifetime of a recording session",
            )
            .buckets(vec![5.0, 30.0, 120.0, 600.0, 3600.0]),
        )
        .expect("valid histogram opts");
        let events_total = IntCounter::with_opts(Opts::new(
            "browserless_replay_events_total",
            "Recording events drained from pages",
        ))
        .expect("valid counter opts");
        let overflows_total = IntCounter::with_opts(Opts::new(
            "browserless_replay_overflows_total",
            "Event batches dropped after the size limit was exceeded",
        ))
        .expect("valid counter opts");

        let _ = registry.register(Box::new(SessionsCollector::new(sessions)));
        let _ = registry.register(Box::new(tab_duration.clone()));
        let _ = registry.register(Box::new(session_duration.clone()));
        let _ = registry.register(Box::new(events_total.clone()));
        let _ = registry.register(Box::new(overflows_total.clone()));

        Self {
            registry,
            tab_duration,
            session_duration,
            events_total,
            overflows_total,
        }
    }

    /// Text exposition for the management endpoint.
    pub fn render(&self) -> String {
        let families = self.registry.gather();
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&families, &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStats;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    #[test]
    fn gauges_follow_the_registry() {
        let sessions = SessionRegistry::new();
        let metrics = Metrics::new(sessions.clone());

        let rendered = metrics.render();
        assert!(rendered.contains("browserless_replay_sessions_active 0"));

        let stats = Arc::new(SessionStats::default());
        stats.tabs_open.store(4, Ordering::Relaxed);
        stats.estimated_bytes.store(2048, Ordering::Relaxed);
        let (tx, _rx) = futures::channel::mpsc::channel(1);
        sessions.register(
            "s1".to_string(),
            crate::session::test_support::handle("s1", tx),
            stats,
        );

        let rendered = metrics.render();
        assert!(rendered.contains("browserless_replay_sessions_active 1"));
        assert!(rendered.contains("browserless_tabs_open 4"));
        assert!(rendered.contains("browserless_replay_estimated_bytes 2048"));

        sessions.unregister("s1");
        let rendered = metrics.render();
        assert!(rendered.contains("browserless_replay_sessions_active 0"));
        assert!(rendered.contains("browserless_tabs_open 0"));
    }

    #[test]
    fn counters_and_histograms_render() {
        let metrics = Metrics::new(SessionRegistry::new());
        metrics.events_total.inc_by(12);
        metrics.overflows_total.inc();
        metrics.tab_duration.observe(3.5);
        let rendered = metrics.render();
        assert!(rendered.contains("browserless_replay_events_total 12"));
        assert!(rendered.contains("browserless_replay_overflows_total 1"));
        assert!(rendered.contains("browserless_tab_duration_seconds_count 1"));
    }

    #[test]
    fn separate_instances_are_isolated() {
        let a = Metrics::new(SessionRegistry::new());
        let b = Metrics::new(SessionRegistry::new());
        a.events_total.inc_by(7);
        assert!(a.render().contains("browserless_replay_events_total 7"));
        assert!(b.render().contains("browserless_replay_events_total 0"));
    }
}
