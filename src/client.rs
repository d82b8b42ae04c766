//! Client-side download engine.
//!
//! A fetch is one read request followed by a Receiver-mode session: bind a
//! fresh socket with a random TID, create the local file, send the RRQ to
//! the server's well-known port, then collect acknowledged data blocks
//! until the short final block arrives.

use crate::session::{RetryPolicy, Session};
use crate::tftp::{self, FileMode, Packet};
use crate::transfer::{BlockHandler, BlockReceiver, Failure, Outcome};
use std::net::SocketAddr;
use std::path::Path;
use tokio::fs::File;

/// Downloads `file_name` from the server into the current directory. The
/// local file is named by the request's base name, created or truncated at
/// transfer start, and left in place (possibly partial) on failure.
pub async fn fetch(file_name: &str, server: SocketAddr, policy: RetryPolicy) -> Outcome {
    fetch_into(file_name, server, Path::new("."), policy).await
}

/// Like [`fetch`], but writing into `dir` instead of the current directory.
pub async fn fetch_into(
    file_name: &str,
    server: SocketAddr,
    dir: &Path,
    policy: RetryPolicy,
) -> Outcome {
    let Some(local_name) = base_name(file_name) else {
        return Outcome::Failed(Failure::LocalIo(format!(
            "'{file_name}' does not name a file"
        )));
    };

    let sock = match tftp::bind_ephemeral() {
        Ok(sock) => sock,
        Err(e) => {
            return Outcome::Failed(Failure::LocalIo(format!("couldn't bind a socket: {e}")));
        }
    };

    let file = match File::create(dir.join(local_name)).await {
        Ok(file) => file,
        Err(e) => {
            return Outcome::Failed(Failure::LocalIo(format!(
                "couldn't create local file '{local_name}': {e}"
            )));
        }
    };

    log::info!("Requesting '{file_name}' from {server}");
    let session = Session::new(
        sock,
        server,
        BlockHandler::Receiver(BlockReceiver::new(file)),
        policy,
    );
    session
        .run(Packet::ReadReq {
            path: file_name.to_string(),
            mode: FileMode::Octet,
        })
        .await
}

/// Strips any directory components from a requested name so the download
/// always lands in the destination directory.
fn base_name(file_name: &str) -> Option<&str> {
    let base = file_name
        .rsplit(['/', '\\'])
        .next()
        .expect("rsplit yields at least one element");
    if base.is_empty() {
        None
    } else {
        Some(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_name_strips_directories() {
        assert_eq!(base_name("report.txt"), Some("report.txt"));
        assert_eq!(base_name("/srv/files/report.txt"), Some("report.txt"));
        assert_eq!(base_name("..\\..\\secrets.txt"), Some("secrets.txt"));
        assert_eq!(base_name("dir/"), None);
        assert_eq!(base_name(""), None);
    }
}
