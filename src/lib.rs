// An implementation of the Trivial File Transfer Protocol (RFC 1350),
// client and server, over UDP.
//
// UDP guarantees neither delivery, ordering, nor uniqueness, so all
// reliability lives in the protocol layer: every 512-byte data block is
// numbered and must be acknowledged before the next one moves, silence is
// answered by retransmitting the last packet, and duplicates created by
// lost acks are recognized by their block numbers and tolerated.
//
// A transfer starts with a read or write request sent to the server's
// well-known port (69). The server answers from a freshly chosen ephemeral
// port, and that address:port pair (the transfer identifier) pins the
// session: once observed, packets from anywhere else are dropped. A data
// block shorter than 512 bytes ends the transfer. Errors are signalled
// with an error packet that is sent once, never acknowledged and never
// retransmitted.

pub mod client;
pub mod server;
pub mod session;
pub mod tftp;
pub mod transfer;
