//! Length-prefixed TCP transport: each frame is its decimal byte length,
//! a newline, then that many bytes of JSON. A session gets the endpoint's
//! setup bundle on accept and then answers queries in arrival order. One
//! bad frame kills one session; everything else keeps serving.

use std::sync::Arc;

use ndarray::{Array1, Array2};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::corpus::{Metadata, PirInstance, Snapshot};
use crate::encoding;
use crate::error::{Error, Result};
use crate::pir::{self, Params};
use crate::server::{
    article_setup_message, embedding_setup_message, rows_to_matrix, AppState, ErrorBody,
    PirResponse, QueryRequest, SetupResponse,
};

pub const DEFAULT_EMBEDDING_PORT: u16 = 8888;
pub const DEFAULT_ARTICLE_PORT: u16 = 8889;

/// Frames larger than this are treated as protocol abuse, not payload.
const MAX_FRAME_BYTES: usize = 256 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Embeddings,
    Articles,
}

impl Endpoint {
    fn instance<'a>(&self, snapshot: &'a Snapshot) -> &'a PirInstance {
        match self {
            Endpoint::Embeddings => &snapshot.embeddings,
            Endpoint::Articles => &snapshot.articles,
        }
    }

    fn setup(&self, snapshot: &Snapshot) -> SetupResponse {
        match self {
            Endpoint::Embeddings => embedding_setup_message(snapshot),
            Endpoint::Articles => article_setup_message(snapshot),
        }
    }
}

async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let data = serde_json::to_vec(message)?;
    writer
        .write_all(format!("{}\n", data.len()).as_bytes())
        .await?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame; `None` means the peer closed cleanly between frames.
async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    let len: usize = line
        .trim()
        .parse()
        .map_err(|_| Error::Protocol(format!("bad frame length {:?}", line.trim())))?;
    if len > MAX_FRAME_BYTES {
        return Err(Error::Protocol(format!("frame of {len} bytes refused")));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(serde_json::from_slice(&buf)?))
}

/// Accept loop for one endpoint. Each session runs on its own task.
pub async fn serve(listener: TcpListener, state: Arc<AppState>, endpoint: Endpoint) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            info!(%peer, ?endpoint, "session opened");
            match handle_session(stream, state, endpoint).await {
                Ok(()) => info!(%peer, "session closed"),
                Err(e) => warn!(%peer, error = %e, "session closed with error"),
            }
        });
    }
}

async fn handle_session(
    stream: TcpStream,
    state: Arc<AppState>,
    endpoint: Endpoint,
) -> Result<()> {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let session_snapshot = state.current().await;
    write_frame(&mut writer, &endpoint.setup(&session_snapshot)).await?;
    let session_epoch = session_snapshot.epoch;
    drop(session_snapshot);

    while let Some(request) = read_frame::<_, QueryRequest>(&mut reader).await? {
        let snapshot = state.current().await;
        if snapshot.epoch != session_epoch {
            write_frame(
                &mut writer,
                &ErrorBody {
                    error: Error::SnapshotChanged.to_string(),
                },
            )
            .await?;
            return Err(Error::SnapshotChanged);
        }
        let cipher = Array1::from_vec(request.query);
        let result = tokio::task::spawn_blocking(move || {
            pir::answer(endpoint.instance(&snapshot).db_t.view(), cipher.view())
                .map(|answer| answer.to_vec())
        })
        .await
        .map_err(|e| Error::Transport(format!("answer task failed: {e}")))?;

        match result {
            Ok(answer) => write_frame(&mut writer, &PirResponse { answer }).await?,
            Err(e) => {
                write_frame(
                    &mut writer,
                    &ErrorBody {
                        error: e.to_string(),
                    },
                )
                .await?;
                return Err(e);
            }
        }
    }
    Ok(())
}

/// Client end of one TCP session. Holds the setup bundle for its lifetime;
/// every retrieval uses a fresh secret.
pub struct TcpSession {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    pub params: Params,
    pub hint: Array2<u64>,
    pub epoch: u64,
    pub num_articles: Option<usize>,
    pub embeddings: Option<Array2<u64>>,
    pub centroids: Option<Array2<f64>>,
    pub metadata: Option<Metadata>,
}

impl TcpSession {
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let setup: SetupResponse = read_frame(&mut reader)
            .await?
            .ok_or_else(|| Error::Transport("server closed before setup".into()))?;

        let params = setup.params.into_params()?;
        let hint = rows_to_matrix(&setup.hint)?;
        if hint.nrows() != params.n || hint.ncols() != params.m {
            return Err(Error::Protocol(format!(
                "hint shape {}x{} does not match params {}x{}",
                hint.nrows(),
                hint.ncols(),
                params.n,
                params.m
            )));
        }
        Ok(Self {
            reader,
            writer,
            params,
            hint,
            epoch: setup.epoch,
            num_articles: setup.num_articles,
            embeddings: setup.embeddings.as_deref().map(rows_to_matrix).transpose()?,
            centroids: setup.centroids.as_deref().map(rows_to_matrix).transpose()?,
            metadata: setup.metadata,
        })
    }

    /// One private retrieval: query, answer, recover.
    pub async fn retrieve_row<R: Rng + ?Sized>(
        &mut self,
        index: usize,
        rng: &mut R,
    ) -> Result<Array1<u64>> {
        let (secret, cipher) = pir::query(index, &self.params, rng)?;
        write_frame(
            &mut self.writer,
            &QueryRequest {
                query: cipher.to_vec(),
                epoch: Some(self.epoch),
            },
        )
        .await?;

        let value: serde_json::Value = read_frame(&mut self.reader)
            .await?
            .ok_or_else(|| Error::Transport("server closed mid-query".into()))?;
        if let Some(error) = value.get("error").and_then(|e| e.as_str()) {
            if error.contains("snapshot changed") {
                return Err(Error::SnapshotChanged);
            }
            return Err(Error::Protocol(error.to_string()));
        }
        let response: PirResponse = serde_json::from_value(value)?;
        if response.answer.len() != self.params.m {
            return Err(Error::Protocol(format!(
                "answer length {} does not match database side {}",
                response.answer.len(),
                self.params.m
            )));
        }
        let answer = Array1::from_vec(response.answer);
        Ok(pir::recover_row(
            secret.view(),
            self.hint.view(),
            answer.view(),
            cipher.view(),
            &self.params,
        ))
    }

    /// Retrieves and decodes one document; only valid on an articles
    /// session.
    pub async fn retrieve_article<R: Rng + ?Sized>(
        &mut self,
        index: usize,
        rng: &mut R,
    ) -> Result<String> {
        let len = self
            .num_articles
            .ok_or_else(|| Error::Protocol("endpoint serves no articles".into()))?;
        if index >= len {
            return Err(Error::Bounds { index, len });
        }
        let row = self.retrieve_row(index, rng).await?;
        encoding::row_to_string(row.view())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::{self, fixtures};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tempfile::tempdir;

    const TEXTS: [&str; 3] = ["first article", "second article", "third article"];

    async fn spawn_endpoint(texts: &[&str], endpoint: Endpoint) -> (Arc<AppState>, String) {
        let dir = tempdir().unwrap();
        fixtures::write_corpus(dir.path(), texts);
        let mut rng = StdRng::seed_from_u64(17);
        let snapshot = corpus::load_snapshot(dir.path(), 0, &mut rng).unwrap();
        let state = Arc::new(AppState::new(snapshot));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let serve_state = state.clone();
        tokio::spawn(async move {
            let _ = serve(listener, serve_state, endpoint).await;
        });
        (state, addr)
    }

    #[tokio::test]
    async fn articles_round_trip_over_tcp() {
        let (_state, addr) = spawn_endpoint(&TEXTS, Endpoint::Articles).await;
        let mut session = TcpSession::connect(&addr).await.unwrap();
        assert_eq!(session.num_articles, Some(3));

        let mut rng = StdRng::seed_from_u64(23);
        for (index, expected) in TEXTS.iter().enumerate() {
            let text = session.retrieve_article(index, &mut rng).await.unwrap();
            assert_eq!(&text, expected);
        }
    }

    #[tokio::test]
    async fn out_of_range_article_is_refused_client_side() {
        let (_state, addr) = spawn_endpoint(&TEXTS, Endpoint::Articles).await;
        let mut session = TcpSession::connect(&addr).await.unwrap();
        let mut rng = StdRng::seed_from_u64(29);
        assert!(matches!(
            session.retrieve_article(3, &mut rng).await,
            Err(Error::Bounds { index: 3, len: 3 })
        ));
    }

    #[tokio::test]
    async fn embedding_endpoint_ships_public_matrix() {
        let (state, addr) = spawn_endpoint(&TEXTS, Endpoint::Embeddings).await;
        let mut session = TcpSession::connect(&addr).await.unwrap();
        let embeddings = session.embeddings.clone().unwrap();
        assert_eq!(embeddings.nrows(), 3);
        assert!(session.metadata.is_some());
        assert!(session.centroids.is_some());

        let snapshot = state.current().await;
        let mut rng = StdRng::seed_from_u64(31);
        let row = session.retrieve_row(1, &mut rng).await.unwrap();
        assert_eq!(row, snapshot.embeddings.db.row(1).to_owned());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sessions_stay_independent() {
        let (_state, addr) = spawn_endpoint(&TEXTS, Endpoint::Articles).await;

        let addr_a = addr.clone();
        let task_a = tokio::spawn(async move {
            let mut session = TcpSession::connect(&addr_a).await.unwrap();
            let mut rng = StdRng::seed_from_u64(37);
            for _ in 0..3 {
                let text = session.retrieve_article(0, &mut rng).await.unwrap();
                assert_eq!(text, TEXTS[0]);
            }
        });
        let addr_b = addr.clone();
        let task_b = tokio::spawn(async move {
            let mut session = TcpSession::connect(&addr_b).await.unwrap();
            let mut rng = StdRng::seed_from_u64(41);
            for _ in 0..3 {
                let text = session.retrieve_article(TEXTS.len() - 1, &mut rng).await.unwrap();
                assert_eq!(text, TEXTS[TEXTS.len() - 1]);
            }
        });
        task_a.await.unwrap();
        task_b.await.unwrap();
    }

    #[tokio::test]
    async fn malformed_frame_kills_only_its_session() {
        let (_state, addr) = spawn_endpoint(&TEXTS, Endpoint::Articles).await;

        // A well-formed session to keep alive across the other's failure.
        let mut healthy = TcpSession::connect(&addr).await.unwrap();

        let stream = TcpStream::connect(&addr).await.unwrap();
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let _setup: SetupResponse = read_frame(&mut reader).await.unwrap().unwrap();
        writer.write_all(b"not a length\n").await.unwrap();
        writer.flush().await.unwrap();
        // Server drops the session; the read side reaches EOF or reset.
        let mut rest = Vec::new();
        let _ = reader.read_to_end(&mut rest).await;

        let mut rng = StdRng::seed_from_u64(43);
        let text = healthy.retrieve_article(1, &mut rng).await.unwrap();
        assert_eq!(text, TEXTS[1]);
    }

    #[tokio::test]
    async fn snapshot_swap_forces_reconnect() {
        let dir = tempdir().unwrap();
        fixtures::write_corpus(dir.path(), &TEXTS);
        let mut rng = StdRng::seed_from_u64(47);
        let snapshot = corpus::load_snapshot(dir.path(), 0, &mut rng).unwrap();
        let state = Arc::new(AppState::new(snapshot));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let serve_state = state.clone();
        tokio::spawn(async move {
            let _ = serve(listener, serve_state, Endpoint::Articles).await;
        });

        let mut session = TcpSession::connect(&addr).await.unwrap();
        assert_eq!(session.retrieve_article(0, &mut rng).await.unwrap(), TEXTS[0]);

        // Rebuild the corpus with different contents and publish it.
        let swapped = ["swapped zero", "swapped one", "swapped two"];
        fixtures::write_corpus(dir.path(), &swapped);
        let next = corpus::load_snapshot(dir.path(), 1, &mut rng).unwrap();
        state.publish(next).await;

        assert!(matches!(
            session.retrieve_article(0, &mut rng).await,
            Err(Error::SnapshotChanged)
        ));

        let mut fresh = TcpSession::connect(&addr).await.unwrap();
        assert_eq!(
            fresh.retrieve_article(0, &mut rng).await.unwrap(),
            swapped[0]
        );
    }
}
