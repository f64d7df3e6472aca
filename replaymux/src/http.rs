//! The HTTP management surface: beacon receiver, metrics exposition and
//! video deletion.

use std::convert::Infallible;
use std::path::PathBuf;

use serde::Deserialize;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

use crate::metrics::Metrics;
use crate::session::SessionRegistry;
use crate::store::ReplayStore;

/// Beacon body: `{s?: sessionId, t: targetId, l: tokenLength}`. `sendBeacon`
/// posts this as json or text/plain; both are parsed the same way.
#[derive(Debug, Deserialize)]
struct BeaconBody {
    #[serde(default)]
    s: Option<String>,
    #[serde(default)]
    t: Option<String>,
    #[serde(default)]
    l: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct HttpState {
    pub sessions: SessionRegistry,
    pub metrics: Metrics,
    pub store: ReplayStore,
    pub videos_dir: PathBuf,
    /// Bearer token guarding the metrics endpoint, if configured.
    pub management_token: Option<String>,
}

pub fn routes(
    state: HttpState,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let beacon_state = state.clone();
    let beacon = warp::post()
        .and(warp::path!("management" / "cf-solved"))
        .and(warp::body::content_length_limit(16 * 1024))
        .and(warp::body::bytes())
        .and(warp::any().map(move || beacon_state.clone()))
        .and_then(handle_beacon);

    let metrics_state = state.clone();
    let metrics = warp::get()
        .and(warp::path!("management" / "metrics"))
        .and(warp::header::optional::<String>("authorization"))
        .and(warp::any().map(move || metrics_state.clone()))
        .and_then(handle_metrics);

    let video_state = state;
    let delete_video = warp::delete()
        .and(warp::path!("video" / String))
        .and(warp::any().map(move || video_state.clone()))
        .and_then(handle_delete_video);

    beacon.or(metrics).or(delete_video)
}

/// The beacon is fire-and-forget from the page's perspective: a missing
/// target id is the only 400; every other failure stays a 204 so nothing is
/// leaked back to page script.
async fn handle_beacon(
    body: bytes::Bytes,
    state: HttpState,
) -> Result<impl Reply, Infallible> {
    let parsed: Option<BeaconBody> = serde_json::from_slice(&body).ok();
    let Some(parsed) = parsed else {
        return Ok(StatusCode::BAD_REQUEST);
    };
    let Some(target_id) = parsed.t.filter(|t| !t.is_empty()) else {
        return Ok(StatusCode::BAD_REQUEST);
    };
    let token_length = parsed.l.unwrap_or(0);

    match parsed.s {
        Some(session_id) if !session_id.is_empty() => {
            if let Some(handle) = state.sessions.get(&session_id) {
                let _ = handle.beacon(target_id, token_length).await;
            }
        }
        _ => {
            // no session id: broadcast, each coordinator filters by target
            for handle in state.sessions.handles() {
                let _ = handle.beacon(target_id.clone(), token_length).await;
            }
        }
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_metrics(
    authorization: Option<String>,
    state: HttpState,
) -> Result<Box<dyn Reply>, Infallible> {
    if let Some(expected) = state.management_token.as_deref() {
        let authorized = authorization
            .as_deref()
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(|token| token == expected)
            .unwrap_or(false);
        if !authorized {
            return Ok(Box::new(StatusCode::UNAUTHORIZED));
        }
    }
    let body = state.metrics.render();
    Ok(Box::new(warp::reply::with_header(
        body,
        "content-type",
        "text/plain; version=0.0.4",
    )))
}

/// Removes a replay's video artifacts while preserving the DOM recording.
async fn handle_delete_video(
    replay_id: String,
    state: HttpState,
) -> Result<Box<dyn Reply>, Infallible> {
    let existed = match state.store.delete_video(&replay_id).await {
        Ok(existed) => existed,
        Err(err) => {
            tracing::debug!("video delete failed: {err}");
            false
        }
    };
    if !existed {
        return Ok(Box::new(StatusCode::NOT_FOUND));
    }
    let dir = state.videos_dir.join(&replay_id);
    if let Err(err) = tokio::fs::remove_dir_all(&dir).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::debug!("video dir cleanup failed: {err}");
        }
    }
    Ok(Box::new(warp::reply::json(&serde_json::json!({
        "deleted": true,
        "id": replay_id,
    }))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::CoordinatorMessage;
    use futures::StreamExt;

    async fn test_state() -> (
        HttpState,
        futures::channel::mpsc::Receiver<CoordinatorMessage>,
    ) {
        let sessions = SessionRegistry::new();
        let (tx, rx) = futures::channel::mpsc::channel(8);
        sessions.register(
            "sess1".to_string(),
            crate::session::test_support::handle("sess1", tx),
            std::sync::Arc::new(crate::session::SessionStats::default()),
        );
        let metrics = Metrics::new(sessions.clone());
        let store = ReplayStore::open_in_memory().await.unwrap();
        (
            HttpState {
                sessions,
                metrics,
                store,
                videos_dir: PathBuf::from("/tmp/replaymux-test-videos"),
                management_token: None,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn beacon_dispatches_to_the_named_session() {
        let (state, mut rx) = test_state().await;
        let resp = warp::test::request()
            .method("POST")
            .path("/management/cf-solved")
            .body(r#"{"s":"sess1","t":"tgt7","l":392}"#)
            .reply(&routes(state))
            .await;
        assert_eq!(resp.status(), 204);

        match rx.next().await.unwrap() {
            CoordinatorMessage::Beacon {
                target_id,
                token_length,
            } => {
                assert_eq!(target_id, "tgt7");
                assert_eq!(token_length, 392);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn beacon_without_session_broadcasts() {
        let (state, mut rx) = test_state().await;
        let resp = warp::test::request()
            .method("POST")
            .path("/management/cf-solved")
            .header("content-type", "text/plain")
            .body(r#"{"t":"tgt9","l":10}"#)
            .reply(&routes(state))
            .await;
        assert_eq!(resp.status(), 204);
        assert!(matches!(
            rx.next().await.unwrap(),
            CoordinatorMessage::Beacon { .. }
        ));
    }

    #[tokio::test]
    async fn beacon_without_target_is_rejected() {
        let (state, _rx) = test_state().await;
        let routes = routes(state);
        let resp = warp::test::request()
            .method("POST")
            .path("/management/cf-solved")
            .body(r#"{"s":"sess1","l":392}"#)
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), 400);

        let resp = warp::test::request()
            .method("POST")
            .path("/management/cf-solved")
            .body("not json at all")
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn metrics_requires_the_configured_token() {
        let (mut state, _rx) = test_state().await;
        state.management_token = Some("sekrit".to_string());
        let routes = routes(state);

        let resp = warp::test::request()
            .method("GET")
            .path("/management/metrics")
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), 401);

        let resp = warp::test::request()
            .method("GET")
            .path("/management/metrics")
            .header("authorization", "Bearer sekrit")
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), 200);
        let body = String::from_utf8_lossy(resp.body());
        assert!(body.contains("browserless_replay_sessions_active"));
    }

    #[tokio::test]
    async fn delete_video_is_404_without_a_video() {
        let (state, _rx) = test_state().await;
        let resp = warp::test::request()
            .method("DELETE")
            .path("/video/nope")
            .reply(&routes(state))
            .await;
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn delete_video_removes_only_the_video() {
        let (state, _rx) = test_state().await;
        let replay_id = state
            .store
            .start_tab_replay("sess1", "tgt1", "https://example.test/")
            .await
            .unwrap();
        let events = vec![serde_json::json!({"tag": "page.open"})];
        state
            .store
            .add_tab_events("sess1", "tgt1", &events)
            .await
            .unwrap();
        state
            .store
            .stop_tab_replay("sess1", "tgt1", 5)
            .await
            .unwrap()
            .unwrap();

        let path = format!("/video/{replay_id}");
        let store = state.store.clone();
        let routes = routes(state);
        let resp = warp::test::request()
            .method("DELETE")
            .path(&path)
            .reply(&routes)
            .await;
        assert_eq!(resp.status(), 200);
        assert_eq!(store.event_count(&replay_id).await.unwrap(), 1);
    }
}
