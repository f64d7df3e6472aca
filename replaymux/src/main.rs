use std::process::ExitCode;
use std::time::Duration;

use futures::StreamExt;

use replaymux::coordinator::CoordinatorConfig;
use replaymux::{launch_session, Config, Metrics, ReplayStore, SessionRegistry};

/// Hard deadline for graceful shutdown once a signal arrives.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);
/// Tighter deadline when shutdown was forced by a panic.
const PANIC_DEADLINE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let ws_url = match std::env::args().nth(1).or_else(|| {
        std::env::var("REPLAYMUX_WS_URL").ok().filter(|v| !v.is_empty())
    }) {
        Some(url) => url,
        None => {
            eprintln!("usage: replaymux <browser-debugger-ws-url>");
            eprintln!("  (or set REPLAYMUX_WS_URL)");
            return ExitCode::from(2);
        }
    };

    let config = Config::from_env();
    let store = match ReplayStore::open(&config.db_path).await {
        Ok(store) => store,
        Err(err) => {
            eprintln!("failed to open replay store: {err}");
            return ExitCode::FAILURE;
        }
    };

    let sessions = SessionRegistry::new();
    let metrics = Metrics::new(sessions.clone());

    // panics anywhere must not leave a half-recorded session lingering
    {
        let default_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            default_hook(info);
            std::thread::spawn(|| {
                std::thread::sleep(PANIC_DEADLINE);
                std::process::exit(70);
            });
        }));
    }

    let (challenge_tx, mut challenge_rx) =
        futures::channel::mpsc::unbounded::<replaymux::ChallengeEvent>();
    tokio::spawn(async move {
        while let Some(event) = challenge_rx.next().await {
            match serde_json::to_string(&event) {
                Ok(json) => log::info!("challenge event: {json}"),
                Err(_) => log::info!("challenge event for target {}", event.target_id()),
            }
        }
    });

    let session_config = CoordinatorConfig {
        session_id: uuid::Uuid::new_v4().to_string(),
        ws_url,
        challenge_host: config.challenge_host.clone(),
        recording_script: config.recording_script().await,
        capture_video: config.capture_video,
        videos_dir: config.videos_dir.clone(),
        beacon_url: config.beacon_url(),
        request_timeout: config.request_timeout,
        viewport: config.viewport,
        on_tab_finalized: None,
    };
    if let Err(err) = launch_session(
        session_config,
        store.clone(),
        sessions.clone(),
        metrics.clone(),
        challenge_tx,
    )
    .await
    {
        eprintln!("failed to connect to browser: {err}");
        return ExitCode::FAILURE;
    }

    let http_state = replaymux::http::HttpState {
        sessions: sessions.clone(),
        metrics,
        store,
        videos_dir: config.videos_dir.clone(),
        management_token: config.management_token.clone(),
    };
    let (_, server) = warp::serve(replaymux::http::routes(http_state))
        .bind_with_graceful_shutdown(config.listen, wait_for_signal());
    log::info!("management surface on {}", config.listen);
    server.await;

    // graceful shutdown with a hard ceiling
    let shutdown = sessions.shutdown_all("signal");
    if tokio::time::timeout(SHUTDOWN_DEADLINE, shutdown).await.is_err() {
        eprintln!("shutdown deadline exceeded");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

/// Resolves on the first of SIGTERM / SIGINT / SIGHUP / SIGUSR2.
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(_) => return,
    };
    let mut int = match signal(SignalKind::interrupt()) {
        Ok(sig) => sig,
        Err(_) => return,
    };
    let mut hup = match signal(SignalKind::hangup()) {
        Ok(sig) => sig,
        Err(_) => return,
    };
    let mut usr2 = match signal(SignalKind::user_defined2()) {
        Ok(sig) => sig,
        Err(_) => return,
    };

    tokio::select! {
        _ = term.recv() => log::info!("SIGTERM received"),
        _ = int.recv() => log::info!("SIGINT received"),
        _ = hup.recv() => log::info!("SIGHUP received"),
        _ = usr2.recv() => log::info!("SIGUSR2 received"),
    }
}
