//! Unprivileged side of the broker protocol.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::protocol::{to_line, BrokerRequest, BrokerResponse, ACTION_CREATE};
use crate::sandbox::CanonicalId;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// No candidate socket accepted a connection.
    #[error("privileged broker unavailable (tried {tried} socket(s))")]
    Unavailable { tried: usize },

    /// The request was delivered but no usable answer came back. The broker
    /// may still be acting on it, so it is never resent.
    #[error("broker at {} did not answer: {reason}", .socket.display())]
    NoResponse { socket: PathBuf, reason: String },

    /// The broker answered with an error code.
    #[error("broker rejected request ({code}): {}", .message.as_deref().unwrap_or("no message"))]
    Rejected {
        code: String,
        message: Option<String>,
    },

    #[error("failed to encode broker request: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Acknowledgement of a successful broker request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAck {
    pub sandbox_id: String,
    /// Broker-side log file for the sandbox.
    pub log: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct BrokerTimeouts {
    pub connect: Duration,
    pub response: Duration,
    /// Create replies only once the unit is provisioned.
    pub create_response: Duration,
    /// Connect attempts per socket, absorbing broker restarts.
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for BrokerTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_millis(500),
            response: Duration::from_secs(1),
            create_response: Duration::from_secs(120),
            attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrokerClient {
    sockets: Vec<PathBuf>,
    timeouts: BrokerTimeouts,
}

impl BrokerClient {
    /// `sockets` are tried in order; the first that answers wins.
    pub fn new(sockets: Vec<PathBuf>, timeouts: BrokerTimeouts) -> Self {
        Self { sockets, timeouts }
    }

    pub fn sockets(&self) -> &[PathBuf] {
        &self.sockets
    }

    /// Whether any candidate socket file exists.
    pub fn any_socket_present(&self) -> bool {
        self.sockets.iter().any(|p| p.exists())
    }

    pub async fn create(
        &self,
        id: &CanonicalId,
        original: &str,
        host_path: Option<&str>,
    ) -> Result<BrokerAck, BrokerError> {
        self.request(&BrokerRequest::create(id.as_str(), original, host_path))
            .await
    }

    /// Acknowledged on receipt; the command keeps running broker-side.
    pub async fn exec(
        &self,
        id: &CanonicalId,
        original: &str,
        command: &str,
        cwd: Option<&str>,
    ) -> Result<BrokerAck, BrokerError> {
        self.request(&BrokerRequest::exec(id.as_str(), original, command, cwd))
            .await
    }

    async fn request(&self, request: &BrokerRequest) -> Result<BrokerAck, BrokerError> {
        let response = self.send(request).await?;
        if response.ok {
            return Ok(BrokerAck {
                sandbox_id: response
                    .sandbox_id
                    .unwrap_or_else(|| request.sandbox_id.clone()),
                log: response.log,
            });
        }
        Err(BrokerError::Rejected {
            code: response.error.unwrap_or_else(|| "unknown".to_string()),
            message: response.message,
        })
    }

    /// Send one request, walking the candidate sockets.
    ///
    /// Only connection failures move on to another attempt or socket. Once
    /// the request is written the first socket to take it owns the answer.
    pub async fn send(&self, request: &BrokerRequest) -> Result<BrokerResponse, BrokerError> {
        let line = to_line(request)?;
        let wait = if request.action == ACTION_CREATE {
            self.timeouts.create_response
        } else {
            self.timeouts.response
        };

        let mut tried = 0;
        for path in &self.sockets {
            if !path.exists() {
                debug!("Broker socket {:?} not present", path);
                continue;
            }
            tried += 1;
            let Some(stream) = self.connect(path).await else {
                continue;
            };
            return match exchange(stream, &line, wait).await {
                Ok(response) => {
                    debug!("Broker at {:?} answered {} request", path, request.action);
                    Ok(response)
                }
                Err(e) => {
                    warn!("Broker at {:?} took {} request but: {}", path, request.action, e);
                    Err(BrokerError::NoResponse {
                        socket: path.clone(),
                        reason: e.to_string(),
                    })
                }
            };
        }
        info!("No broker socket answered ({} tried)", tried);
        Err(BrokerError::Unavailable { tried })
    }

    async fn connect(&self, path: &Path) -> Option<UnixStream> {
        let attempts = self.timeouts.attempts.max(1);
        for attempt in 1..=attempts {
            let result = timeout(self.timeouts.connect, UnixStream::connect(path))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))
                .and_then(|r| r);
            match result {
                Ok(stream) => return Some(stream),
                Err(e) => {
                    debug!(
                        "Broker {:?} connect {}/{} failed: {}",
                        path, attempt, attempts, e
                    );
                    if attempt < attempts {
                        sleep(self.timeouts.backoff * attempt).await;
                    }
                }
            }
        }
        None
    }
}

async fn exchange(stream: UnixStream, line: &str, wait: Duration) -> io::Result<BrokerResponse> {
    let (reader, mut writer) = stream.into_split();
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;

    let mut reader = BufReader::new(reader);
    let mut response = String::new();
    let n = timeout(wait, reader.read_line(&mut response))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "response timed out"))??;
    if n == 0 || response.trim().is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "empty response",
        ));
    }
    serde_json::from_str(response.trim())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
