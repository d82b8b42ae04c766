//! Server dispatcher.
//!
//! The well-known port socket does nothing but accept requests. Each valid
//! read or write request is handed to its own tokio task with a freshly
//! bound ephemeral socket for the data phase, as RFC 1350 requires, so one
//! slow or broken client never holds up another. The dispatcher keeps no
//! state about a session beyond having spawned it.

use crate::session::{RetryPolicy, Session};
use crate::tftp::{self, ErrorCode, Packet, SocketError, TftpResult, TftpSocket};
use crate::transfer::{BlockHandler, BlockReceiver, BlockSender, Step};
use std::io;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;

/// Accepts TFTP requests and runs one concurrent session per transfer,
/// serving files from (and accepting uploads into) `root`.
pub struct Dispatcher {
    sock: TftpSocket,
    root: Arc<PathBuf>,
    policy: RetryPolicy,
}

impl Dispatcher {
    pub fn bind(addr: SocketAddr, root: PathBuf, policy: RetryPolicy) -> TftpResult<Dispatcher> {
        Ok(Dispatcher {
            sock: TftpSocket::bind(addr)?,
            root: Arc::new(root),
            policy,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.local_addr()
    }

    /// Runs the request loop until the surrounding task is cancelled (the
    /// server binary races this against Ctrl-C).
    pub async fn serve(self) -> TftpResult<()> {
        log::info!(
            "Serving {} on {}",
            self.root.display(),
            self.local_addr()?
        );

        loop {
            match self.sock.recv().await {
                Ok((packet @ (Packet::ReadReq { .. } | Packet::WriteReq { .. }), src)) => {
                    log::info!("Accepted request from {src}: {packet:?}");
                    let root = Arc::clone(&self.root);
                    let policy = self.policy;
                    tokio::spawn(async move {
                        handle_request(&root, packet, src, policy).await;
                    });
                }
                Ok((packet, src)) => {
                    log::warn!("Non-request packet on the request port from {src}: {packet:?}");
                    self.reject(src, "only read and write requests are accepted here".to_string())
                        .await;
                }
                Err(SocketError::Decode { source, error }) => {
                    log::warn!("Malformed request from {source}: {error}");
                    self.reject(source, error.to_string()).await;
                }
                Err(SocketError::Timeout(_)) => unreachable!("request loop receives without a timeout"),
                Err(SocketError::Io(e)) => {
                    log::error!("Request socket receive failed: {e}");
                }
            }
        }
    }

    async fn reject(&self, dst: SocketAddr, message: String) {
        // Courtesy packet; nothing depends on its delivery.
        let _ = self
            .sock
            .send(
                &Packet::Error {
                    code: ErrorCode::IllegalOperation,
                    message,
                },
                dst,
            )
            .await;
    }
}

/// Runs one accepted request to completion on its own ephemeral socket.
async fn handle_request(root: &Path, request: Packet, src: SocketAddr, policy: RetryPolicy) {
    let sock = match tftp::bind_ephemeral() {
        Ok(sock) => sock,
        Err(e) => {
            log::error!("Couldn't bind a data-phase socket for {src}: {e}");
            return;
        }
    };

    let mut handler = match prepare_handler(root, &request).await {
        Ok(handler) => handler,
        Err((code, message)) => {
            log::warn!("Rejecting request from {src}: {message}");
            let _ = sock.send(&Packet::Error { code, message }, src).await;
            return;
        }
    };

    let first = match handler.start().await {
        Step::Send(packet) => packet,
        Step::SendAndFinish(packet, outcome) => {
            // The very first file read failed; no session to run.
            let _ = sock.send(&packet, src).await;
            log::warn!("Session with {src} ended before it began: {outcome}");
            return;
        }
        step => {
            log::error!("Unexpected opening step {step:?} for {src}");
            return;
        }
    };

    let session = Session::with_locked_peer(sock, src, handler, policy);
    let outcome = session.run(first).await;
    log::info!("Session with {src}: {outcome}");
}

async fn prepare_handler(
    root: &Path,
    request: &Packet,
) -> Result<BlockHandler, (ErrorCode, String)> {
    match request {
        Packet::ReadReq { path, .. } => {
            let full_path = resolve_in_root(root, path)?;
            match File::open(&full_path).await {
                Ok(file) => Ok(BlockHandler::Sender(BlockSender::new(file))),
                Err(e) => Err((e.kind().into(), format!("cannot open '{path}': {e}"))),
            }
        }
        Packet::WriteReq { path, .. } => {
            let full_path = resolve_in_root(root, path)?;
            match File::create(&full_path).await {
                Ok(file) => Ok(BlockHandler::Receiver(BlockReceiver::new(file))),
                Err(e) => Err((e.kind().into(), format!("cannot create '{path}': {e}"))),
            }
        }
        _ => Err((
            ErrorCode::IllegalOperation,
            "only read and write requests start a transfer".to_string(),
        )),
    }
}

/// Resolves a requested path strictly inside the server root. Leading
/// slashes are dropped; any parent-directory or otherwise non-normal
/// component is refused rather than resolved.
fn resolve_in_root(root: &Path, requested: &str) -> Result<PathBuf, (ErrorCode, String)> {
    let trimmed = requested.trim_start_matches('/');
    if trimmed.is_empty() {
        return Err((
            ErrorCode::FileNotFound,
            "request names no file".to_string(),
        ));
    }

    let relative = Path::new(trimmed);
    for component in relative.components() {
        match component {
            Component::Normal(_) => {}
            _ => {
                return Err((
                    ErrorCode::AccessViolation,
                    format!("'{requested}' escapes the served directory"),
                ));
            }
        }
    }

    Ok(root.join(relative))
}
