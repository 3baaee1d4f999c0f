use std::fmt::{self, Display, Formatter};

pub type Result<T> = std::result::Result<T, Error>;

/// Failure categories of the retrieval service. Recovery happens at the
/// session boundary: a `Protocol` error closes one session, a `Config`
/// error is fatal at startup, and nothing retries a failed query
/// automatically.
#[derive(Debug)]
pub enum Error {
    /// Impossible parameters or a corpus that cannot be served.
    Config(String),
    /// Malformed frame, wrong ciphertext length, or an otherwise
    /// undecodable message.
    Protocol(String),
    /// Record index outside the corpus, caught before anything is sent.
    Bounds { index: usize, len: usize },
    /// The hint held by this session no longer matches the live snapshot.
    SnapshotChanged,
    /// Parameters too tight for the database; decoding would be silently
    /// wrong, so refuse to build them.
    NoiseOverflow,
    /// Connection-level failure. Retried at session granularity only.
    Transport(String),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "configuration error: {msg}"),
            Error::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Error::Bounds { index, len } => {
                write!(f, "index {index} out of range for {len} records")
            }
            Error::SnapshotChanged => {
                write!(f, "snapshot changed; reconnect for fresh setup data")
            }
            Error::NoiseOverflow => {
                write!(f, "noise budget exceeded for these parameters")
            }
            Error::Transport(msg) => write!(f, "transport error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Protocol(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Transport(e.to_string())
    }
}
