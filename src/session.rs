//! Socket loop half of a transfer session.
//!
//! A [`Session`] owns one UDP socket and one [`BlockHandler`] for exactly
//! one transfer. It sends the current outgoing packet, waits for a reply
//! within the retry policy's timeout, retransmits on silence, and pins the
//! peer's transfer identifier (address and port) once the first reply
//! arrives. Every error is folded into the terminal [`Outcome`]; nothing
//! propagates to the session's owner as a plain `Err`.

use crate::tftp::{ErrorCode, Packet, SocketError, TftpSocket};
use crate::transfer::{BlockHandler, Failure, Outcome, Step};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;

/// Retransmission timeout and retry budget shared by client and server
/// sessions. The timeout is generous enough that LAN round-trips never
/// trigger a spurious retransmission.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// How long one blocking receive may wait before the last packet is
    /// retransmitted.
    pub timeout: Duration,
    /// How many retransmissions of one packet are attempted before the
    /// session gives up with [`Failure::Timeout`].
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_secs(5),
            max_retries: 5,
        }
    }
}

/// The state machine owning one in-progress file transfer.
pub struct Session {
    sock: TftpSocket,
    /// The peer's TID. For client sessions this starts as the server's
    /// well-known request address and is replaced by the source of the
    /// first reply, since the data phase uses a different port.
    peer: SocketAddr,
    peer_locked: bool,
    policy: RetryPolicy,
    handler: BlockHandler,
}

impl Session {
    /// A session whose peer TID is not yet known: the first packet from
    /// any source locks it. Used by the client, which only learns the
    /// server's data-phase port from the first data packet.
    pub fn new(sock: TftpSocket, peer: SocketAddr, handler: BlockHandler, policy: RetryPolicy) -> Session {
        Session {
            sock,
            peer,
            peer_locked: false,
            policy,
            handler,
        }
    }

    /// A session locked to the peer from the start. Used by the server,
    /// which knows the client's TID from the request datagram.
    pub fn with_locked_peer(
        sock: TftpSocket,
        peer: SocketAddr,
        handler: BlockHandler,
        policy: RetryPolicy,
    ) -> Session {
        Session {
            peer_locked: true,
            ..Session::new(sock, peer, handler, policy)
        }
    }

    /// Runs the transfer to completion, opening with `first` (a request
    /// packet for clients, the first data block or ack 0 for servers).
    /// The socket and file close when the session is dropped, on every
    /// exit path.
    pub async fn run(mut self, first: Packet) -> Outcome {
        let mut out = first;
        let mut retries: u32 = 0;

        loop {
            if let Err(e) = self.sock.send(&out, self.peer).await {
                return Outcome::Failed(Failure::LocalIo(format!("send failed: {e}")));
            }

            // One wait period per outgoing packet. Dropped foreign or
            // malformed datagrams consume the period rather than reset it.
            let deadline = Instant::now() + self.policy.timeout;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match self.sock.recv_with_timeout(remaining).await {
                    Ok((packet, src)) => {
                        if self.peer_locked && src != self.peer {
                            // A different transfer straying onto our port.
                            // Not fatal to either side; just drop it.
                            log::debug!("Dropping packet from foreign address {src}");
                            continue;
                        }
                        if !self.peer_locked {
                            log::debug!("Locking peer TID to {src}");
                            self.peer = src;
                            self.peer_locked = true;
                        }

                        match self.handler.handle(&packet).await {
                            Step::Send(packet) => {
                                out = packet;
                                retries = 0;
                                break;
                            }
                            Step::Resend => break,
                            Step::SendAndFinish(packet, outcome) => {
                                // Best effort; error packets in particular
                                // are never retransmitted.
                                let _ = self.sock.send(&packet, self.peer).await;
                                return outcome;
                            }
                            Step::Finish(outcome) => return outcome,
                            Step::Ignore => continue,
                        }
                    }
                    Err(SocketError::Timeout(_)) => {
                        if retries >= self.policy.max_retries {
                            log::warn!("Peer {} went silent, giving up", self.peer);
                            return Outcome::Failed(Failure::Timeout);
                        }
                        retries += 1;
                        log::debug!(
                            "Receive timed out, retransmission {retries} of {}",
                            self.policy.max_retries
                        );
                        break;
                    }
                    Err(SocketError::Decode { source, error }) => {
                        // Discard the datagram and tell its sender, but
                        // keep the transfer alive.
                        log::warn!("Malformed packet from {source}: {error}");
                        let _ = self
                            .sock
                            .send(
                                &Packet::Error {
                                    code: ErrorCode::IllegalOperation,
                                    message: error.to_string(),
                                },
                                source,
                            )
                            .await;
                        continue;
                    }
                    Err(SocketError::Io(e)) => {
                        return Outcome::Failed(Failure::LocalIo(format!("receive failed: {e}")));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tftp::{self, FileMode};
    use crate::transfer::BlockReceiver;
    use std::net::Ipv4Addr;
    use tempdir::TempDir;
    use tokio::fs::File;
    use tokio_test::assert_ok;

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(100),
            max_retries: 2,
        }
    }

    fn loopback_socket() -> TftpSocket {
        TftpSocket::bind((Ipv4Addr::LOCALHOST, 0).into()).unwrap()
    }

    async fn receiver_session(dir: &TempDir, peer: SocketAddr, policy: RetryPolicy) -> Session {
        let file = File::create(dir.path().join("out.bin")).await.unwrap();
        Session::new(
            loopback_socket(),
            peer,
            BlockHandler::Receiver(BlockReceiver::new(file)),
            policy,
        )
    }

    fn read_request() -> Packet {
        Packet::ReadReq {
            path: "out.bin".to_string(),
            mode: FileMode::Octet,
        }
    }

    #[tokio::test]
    async fn test_times_out_after_retry_budget() {
        let dir = TempDir::new("scratch").unwrap();
        // A bound socket that never answers.
        let silent_peer = loopback_socket();
        let peer_addr = silent_peer.local_addr().unwrap();

        let session = receiver_session(&dir, peer_addr, quick_policy()).await;
        assert_eq!(
            session.run(read_request()).await,
            Outcome::Failed(Failure::Timeout)
        );
    }

    #[tokio::test]
    async fn test_retransmits_request_when_reply_is_lost() {
        let dir = TempDir::new("scratch").unwrap();
        let peer = loopback_socket();
        let peer_addr = peer.local_addr().unwrap();

        let session = receiver_session(&dir, peer_addr, quick_policy()).await;
        let transfer = tokio::spawn(session.run(read_request()));

        // Swallow the first request, as if the network dropped our reply.
        let (first, client_addr) = assert_ok!(peer.recv().await);
        assert_eq!(first, read_request());

        // The client must retransmit the same request after its timeout.
        let (second, _) = assert_ok!(peer.recv_with_timeout(Duration::from_secs(2)).await);
        assert_eq!(second, read_request());

        // Answer from a fresh data-phase socket, as a real server would.
        let data_sock = loopback_socket();
        assert_ok!(
            data_sock
                .send(
                    &Packet::Data {
                        block: 1,
                        data: b"short".to_vec()
                    },
                    client_addr
                )
                .await
        );
        let (ack, _) = assert_ok!(data_sock.recv_with_timeout(Duration::from_secs(2)).await);
        assert_eq!(ack, Packet::Ack { block: 1 });

        assert_eq!(transfer.await.unwrap(), Outcome::Success);
        assert_eq!(
            tokio::fs::read(dir.path().join("out.bin")).await.unwrap(),
            b"short"
        );
    }

    #[tokio::test]
    async fn test_duplicate_data_after_lost_ack_is_not_written_twice() {
        let dir = TempDir::new("scratch").unwrap();
        let peer = loopback_socket();
        let peer_addr = peer.local_addr().unwrap();

        let session = receiver_session(&dir, peer_addr, quick_policy()).await;
        let transfer = tokio::spawn(session.run(read_request()));

        let (_, client_addr) = assert_ok!(peer.recv().await);

        let block_one = Packet::Data {
            block: 1,
            data: vec![0x52; 512],
        };
        assert_ok!(peer.send(&block_one, client_addr).await);
        let (ack, _) = assert_ok!(peer.recv_with_timeout(Duration::from_secs(2)).await);
        assert_eq!(ack, Packet::Ack { block: 1 });

        // Pretend the ack was lost and resend block 1. The client must
        // repeat its ack without appending the payload again.
        assert_ok!(peer.send(&block_one, client_addr).await);
        let (ack, _) = assert_ok!(peer.recv_with_timeout(Duration::from_secs(2)).await);
        assert_eq!(ack, Packet::Ack { block: 1 });

        assert_ok!(
            peer.send(
                &Packet::Data {
                    block: 2,
                    data: vec![0x53; 88]
                },
                client_addr
            )
            .await
        );
        let (ack, _) = assert_ok!(peer.recv_with_timeout(Duration::from_secs(2)).await);
        assert_eq!(ack, Packet::Ack { block: 2 });

        assert_eq!(transfer.await.unwrap(), Outcome::Success);
        let received = tokio::fs::read(dir.path().join("out.bin")).await.unwrap();
        assert_eq!(received.len(), 600);
    }

    #[tokio::test]
    async fn test_foreign_packets_are_dropped_after_peer_lock() {
        let dir = TempDir::new("scratch").unwrap();
        let peer = loopback_socket();
        let peer_addr = peer.local_addr().unwrap();

        let session = receiver_session(&dir, peer_addr, quick_policy()).await;
        let transfer = tokio::spawn(session.run(read_request()));

        let (_, client_addr) = assert_ok!(peer.recv().await);
        assert_ok!(
            peer.send(
                &Packet::Data {
                    block: 1,
                    data: vec![0x52; 512]
                },
                client_addr
            )
            .await
        );
        let (ack, _) = assert_ok!(peer.recv_with_timeout(Duration::from_secs(2)).await);
        assert_eq!(ack, Packet::Ack { block: 1 });

        // An unrelated party injecting a block 2 of its own must be
        // ignored now that the peer TID is locked.
        let intruder = loopback_socket();
        assert_ok!(
            intruder
                .send(
                    &Packet::Data {
                        block: 2,
                        data: vec![0xEE; 4]
                    },
                    client_addr
                )
                .await
        );

        assert_ok!(
            peer.send(
                &Packet::Data {
                    block: 2,
                    data: vec![0x53; 3]
                },
                client_addr
            )
            .await
        );
        let (ack, _) = assert_ok!(peer.recv_with_timeout(Duration::from_secs(2)).await);
        assert_eq!(ack, Packet::Ack { block: 2 });

        assert_eq!(transfer.await.unwrap(), Outcome::Success);
        let mut expected = vec![0x52; 512];
        expected.extend(vec![0x53; 3]);
        assert_eq!(
            tokio::fs::read(dir.path().join("out.bin")).await.unwrap(),
            expected
        );
    }

    #[tokio::test]
    async fn test_peer_error_packet_ends_session() {
        let dir = TempDir::new("scratch").unwrap();
        let peer = loopback_socket();
        let peer_addr = peer.local_addr().unwrap();

        let session = receiver_session(&dir, peer_addr, quick_policy()).await;
        let transfer = tokio::spawn(session.run(read_request()));

        let (_, client_addr) = assert_ok!(peer.recv().await);
        assert_ok!(
            peer.send(
                &Packet::Error {
                    code: tftp::ErrorCode::FileNotFound,
                    message: "no such file".to_string()
                },
                client_addr
            )
            .await
        );

        assert_eq!(
            transfer.await.unwrap(),
            Outcome::Failed(Failure::Peer(
                tftp::ErrorCode::FileNotFound,
                "no such file".to_string()
            ))
        );
    }
}
