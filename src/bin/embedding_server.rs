use std::path::PathBuf;
use std::sync::Arc;
use std::{env, process};

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use veilsearch::corpus;
use veilsearch::server::AppState;
use veilsearch::tcp::{self, Endpoint};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let corpus_dir = PathBuf::from(env::args().nth(1).unwrap_or_else(|| ".".to_string()));
    let port: u16 = env::var("VEILSEARCH_EMBEDDING_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(tcp::DEFAULT_EMBEDDING_PORT);

    info!(corpus = %corpus_dir.display(), "loading corpus");
    let snapshot = match corpus::load_snapshot(&corpus_dir, 0, &mut rand::thread_rng()) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            error!(error = %e, "cannot serve without a corpus");
            process::exit(1);
        }
    };
    let state = Arc::new(AppState::new(snapshot));

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    info!(port, "serving embeddings endpoint");
    tcp::serve(listener, state, Endpoint::Embeddings).await?;
    Ok(())
}
