//! Block-level half of a transfer session.
//!
//! A transfer moves a file one numbered 512-byte block at a time, each
//! block acknowledged before the next is sent. The two roles mirror each
//! other: a sender turns incoming acks into outgoing data blocks, a
//! receiver turns incoming data blocks into file writes and outgoing acks.
//! Both are driven by the socket loop in [`crate::session`], which acts on
//! the [`Step`] returned for each incoming packet.
//!
//! On the receiving side only the expected block and its predecessor are
//! ever acceptable: the predecessor means our last ack was lost in transit
//! and must be repeated, anything else means the peer has desynchronized
//! and the transfer cannot be salvaged.

use crate::tftp::{ErrorCode, Packet, DATA_BUFFER_SIZE};
use std::fmt;
use tokio::fs::File;
use tokio::io::{self, AsyncReadExt, AsyncWriteExt};

/// Terminal state of a transfer session.
#[derive(Debug, PartialEq)]
pub enum Outcome {
    Success,
    Failed(Failure),
}

/// The ways a transfer can fail. Every per-packet error is folded into one
/// of these and reported to the session's owner; nothing escapes as a
/// panic or a stray `Err`.
#[derive(Debug, PartialEq)]
pub enum Failure {
    /// The retry budget for one block was exhausted.
    Timeout,
    /// The peer ended the transfer with an Error packet.
    Peer(ErrorCode, String),
    /// The peer sent a packet the protocol does not allow at this point.
    Protocol(String),
    /// A local file or socket operation failed.
    LocalIo(String),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Outcome::Success => write!(f, "transfer complete"),
            Outcome::Failed(failure) => write!(f, "transfer failed: {failure}"),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Failure::Timeout => write!(f, "timed out after exhausting all retries"),
            Failure::Peer(code, message) => {
                write!(f, "peer reported {code:?}: {message}")
            }
            Failure::Protocol(message) => write!(f, "protocol violation: {message}"),
            Failure::LocalIo(message) => write!(f, "local I/O error: {message}"),
        }
    }
}

/// What the socket loop should do after a packet has been processed.
#[derive(Debug, PartialEq)]
pub enum Step {
    /// Send the packet and await a reply. Starts a fresh retry budget.
    Send(Packet),

    /// Retransmit the last outgoing packet without touching the retry
    /// budget. Used when the peer evidently missed it.
    Resend,

    /// Send the packet, then finish with the outcome. Covers both the
    /// final ack of a download and courtesy error packets.
    SendAndFinish(Packet, Outcome),

    /// Finish without sending anything.
    Finish(Outcome),

    /// Drop the packet and keep waiting on the current budget.
    Ignore,
}

fn protocol_abort(message: String) -> Step {
    let packet = Packet::Error {
        code: ErrorCode::IllegalOperation,
        message: message.clone(),
    };
    Step::SendAndFinish(packet, Outcome::Failed(Failure::Protocol(message)))
}

fn io_abort(e: &io::Error, context: &str) -> Step {
    let message = format!("{context}: {e}");
    let packet = Packet::Error {
        code: e.kind().into(),
        message: message.clone(),
    };
    Step::SendAndFinish(packet, Outcome::Failed(Failure::LocalIo(message)))
}

/// One side of an in-progress transfer, parameterized by role.
#[derive(Debug)]
pub enum BlockHandler {
    Sender(BlockSender),
    Receiver(BlockReceiver),
}

impl BlockHandler {
    /// Produces the opening packet for server-initiated sessions: the
    /// first data block when serving a read, ack 0 when accepting a write.
    /// Clients skip this and open with their request packet instead.
    pub async fn start(&mut self) -> Step {
        match self {
            BlockHandler::Sender(sender) => sender.next_block().await,
            BlockHandler::Receiver(_) => Step::Send(Packet::Ack { block: 0 }),
        }
    }

    pub async fn handle(&mut self, packet: &Packet) -> Step {
        match self {
            BlockHandler::Sender(sender) => sender.process_ack(packet).await,
            BlockHandler::Receiver(receiver) => receiver.process_data(packet).await,
        }
    }
}

/// Sends a file block by block, waiting for each block's ack.
#[derive(Debug)]
pub struct BlockSender {
    file: File,
    /// Number of the last data block sent; 0 before any data goes out.
    block: u16,
    /// Set once the short final block has been sent. Success is reached
    /// only when that block's ack arrives, never on merely sending it.
    final_sent: bool,
}

impl BlockSender {
    pub fn new(file: File) -> BlockSender {
        BlockSender {
            file,
            block: 0,
            final_sent: false,
        }
    }

    async fn next_block(&mut self) -> Step {
        match read_block(&mut self.file).await {
            Ok(data) => {
                self.block = self.block.wrapping_add(1);
                if data.len() < DATA_BUFFER_SIZE {
                    self.final_sent = true;
                }
                log::debug!("Sending block {} ({} bytes)", self.block, data.len());
                Step::Send(Packet::Data {
                    block: self.block,
                    data,
                })
            }
            Err(e) => io_abort(&e, "failed to read from file"),
        }
    }

    async fn process_ack(&mut self, packet: &Packet) -> Step {
        match packet {
            &Packet::Ack { block } if block == self.block => {
                if self.final_sent {
                    return Step::Finish(Outcome::Success);
                }
                self.next_block().await
            }
            &Packet::Ack { block } if block == self.block.wrapping_sub(1) => {
                // A duplicate of the previous ack. Answering it would send
                // the current block a second time and every packet after
                // it twice, so just keep waiting.
                log::debug!("Ignoring duplicate ack for block {block}");
                Step::Ignore
            }
            &Packet::Ack { block } => protocol_abort(format!(
                "ack for block {block} does not match any block in flight (current block is {})",
                self.block
            )),
            Packet::Error { code, message } => Step::Finish(Outcome::Failed(Failure::Peer(
                *code,
                message.clone(),
            ))),
            other => protocol_abort(format!(
                "expected an ack packet, but got {other:?} instead"
            )),
        }
    }
}

/// Receives a file block by block, acknowledging each block in turn.
#[derive(Debug)]
pub struct BlockReceiver {
    file: File,
    /// Block number the transfer is waiting for next; starts at 1.
    expected: u16,
    bytes_written: u64,
}

impl BlockReceiver {
    pub fn new(file: File) -> BlockReceiver {
        BlockReceiver {
            file,
            expected: 1,
            bytes_written: 0,
        }
    }

    async fn process_data(&mut self, packet: &Packet) -> Step {
        match packet {
            Packet::Data { block, data } if *block == self.expected => {
                if let Err(e) = self.file.write_all(data).await {
                    return io_abort(&e, "failed to write to file");
                }
                self.bytes_written += data.len() as u64;
                log::debug!(
                    "Wrote block {} ({} bytes, {} total)",
                    block,
                    data.len(),
                    self.bytes_written
                );

                let ack = Packet::Ack {
                    block: self.expected,
                };
                if data.len() < DATA_BUFFER_SIZE {
                    // Short block ends the transfer.
                    if let Err(e) = self.file.flush().await {
                        return io_abort(&e, "failed to flush file");
                    }
                    log::info!("Received {} bytes in {} blocks", self.bytes_written, block);
                    Step::SendAndFinish(ack, Outcome::Success)
                } else {
                    self.expected = self.expected.wrapping_add(1);
                    Step::Send(ack)
                }
            }
            Packet::Data { block, .. } if *block == self.expected.wrapping_sub(1) => {
                // Our ack for this block was lost and the peer resent the
                // block. Repeat the ack, but don't write the data twice.
                log::debug!("Repeating ack for duplicate block {block}");
                Step::Resend
            }
            Packet::Data { block, .. } => protocol_abort(format!(
                "data block {block} is out of sequence (expected block {})",
                self.expected
            )),
            Packet::Error { code, message } => Step::Finish(Outcome::Failed(Failure::Peer(
                *code,
                message.clone(),
            ))),
            other => protocol_abort(format!(
                "expected a data packet, but got {other:?} instead"
            )),
        }
    }
}

/// Reads up to one block from the file. A single read call may return less
/// than a full buffer, so keep reading until the buffer fills or the file
/// ends.
async fn read_block(file: &mut File) -> Result<Vec<u8>, io::Error> {
    let mut buf = vec![0_u8; DATA_BUFFER_SIZE];
    let mut cursor = 0;

    loop {
        let read = file.read(&mut buf[cursor..]).await?;
        cursor += read;
        if read == 0 || cursor == buf.len() {
            buf.truncate(cursor);
            return Ok(buf);
        }
    }
}
