use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::{env, process};

use anyhow::Result;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use veilsearch::server::{self, AppState};
use veilsearch::corpus;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let corpus_dir = PathBuf::from(env::args().nth(1).unwrap_or_else(|| ".".to_string()));
    let port: u16 = env::var("VEILSEARCH_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let reload_secs: u64 = env::var("VEILSEARCH_RELOAD_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(60);

    info!(corpus = %corpus_dir.display(), "loading corpus");
    let snapshot = match corpus::load_snapshot(&corpus_dir, 0, &mut rand::thread_rng()) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            error!(error = %e, "cannot serve without a corpus");
            process::exit(1);
        }
    };
    let state = Arc::new(AppState::new(snapshot));

    // Re-read whatever the external pipeline wrote to disk and swap the
    // snapshot whole. Cancellation lands at the tick.
    let reload_state = state.clone();
    let reload_dir = corpus_dir.clone();
    let reload_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(reload_secs));
        interval.tick().await;
        loop {
            interval.tick().await;
            match server::reload(&reload_state, &reload_dir).await {
                Ok(epoch) => info!(epoch, "corpus reloaded"),
                Err(e) => error!(error = %e, "corpus reload failed"),
            }
        }
    });

    let app = server::router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving private search API");
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    reload_task.abort();
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
