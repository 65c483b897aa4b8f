use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::error::{KbError, KbResult};
use crate::fact::NewFact;
use crate::query::{QueryFilters, ScoredFact};
use crate::store::AppendOutcome;

use super::protocol::{AdminAction, DaemonStatus, Request, Response, PING_ACK};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for one daemon endpoint. Each call opens a fresh connection.
#[derive(Debug, Clone)]
pub struct DaemonClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl DaemonClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Bound on connect plus the whole exchange.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn unreachable(&self, reason: impl Into<String>) -> KbError {
        KbError::DaemonUnreachable {
            socket: self.socket_path.clone(),
            reason: reason.into(),
        }
    }

    /// Send one request and read its response.
    ///
    /// Failing to connect is [`KbError::DaemonUnreachable`]: the request never
    /// reached a daemon and is safe to retry. Failures after the request was
    /// written are [`KbError::Io`].
    pub async fn send(&self, request: &Request) -> KbResult<Response> {
        let stream = match tokio::time::timeout(self.timeout, UnixStream::connect(&self.socket_path)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(self.unreachable(err.to_string())),
            Err(_) => return Err(self.unreachable("connect timed out")),
        };

        let mut payload = serde_json::to_vec(request)?;
        payload.push(b'\n');

        let exchange = async {
            let (read_half, mut write_half) = stream.into_split();
            write_half.write_all(&payload).await?;
            write_half.flush().await?;

            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            let bytes = reader.read_line(&mut line).await?;
            if bytes == 0 {
                return Err(KbError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "daemon closed the connection without a response",
                )));
            }
            Ok::<_, KbError>(serde_json::from_str::<Response>(line.trim())?)
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(KbError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("no response to {} within {:?}", request.name(), self.timeout),
            ))),
        }
    }

    async fn call<T: DeserializeOwned>(&self, request: Request) -> KbResult<T> {
        self.send(&request).await?.into_result()
    }

    /// Liveness check: succeeds only if the reply carries [`PING_ACK`].
    pub async fn ping(&self) -> KbResult<()> {
        let ack: String = self.call(Request::Ping).await?;
        if ack != PING_ACK {
            return Err(KbError::Protocol(format!("unexpected ping reply: {ack}")));
        }
        Ok(())
    }

    pub async fn append(&self, fact: NewFact) -> KbResult<AppendOutcome> {
        self.call(Request::Append { fact }).await
    }

    pub async fn query(
        &self,
        text: impl Into<String>,
        filters: QueryFilters,
        top_k: Option<usize>,
    ) -> KbResult<Vec<ScoredFact>> {
        self.call(Request::Query {
            text: text.into(),
            filters,
            top_k,
        })
        .await
    }

    pub async fn status(&self) -> KbResult<DaemonStatus> {
        self.call(Request::Status).await
    }

    pub async fn stop(&self) -> KbResult<()> {
        let _: String = self.call(Request::Stop).await?;
        Ok(())
    }

    /// Administrative command; the result shape depends on `action`.
    pub async fn admin(&self, action: AdminAction) -> KbResult<serde_json::Value> {
        self.call(Request::Admin { action }).await
    }
}
