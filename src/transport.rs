//! Interfaces consumed from the STUN transaction layer and the raw socket.
use std::time::Instant;

use crate::attribute::Message;
use crate::{Error, Result};

/// Outcome of a STUN transaction: the decoded response, or the failure the
/// transaction layer observed (retransmit timeout, transport error, broken
/// response).
pub type TransactionResult = std::result::Result<Message, Error>;

/// Completion callback registered with [`StunTransport::request`].
pub type TransactionHandler = Box<dyn FnOnce(TransactionResult) + Send>;

/// Callback receiving every inbound datagram the transaction layer did not
/// consume: indications, ChannelData frames and unsolicited traffic.
pub type DemuxHandler = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Client-side surface of a STUN transaction engine.
///
/// Request/response correlation, retransmission policy and RTT estimation
/// all live behind this trait.
pub trait StunTransport: Send + Sync {
    /// Submits `request`.
    ///
    /// The transaction must be registered before this method returns.
    /// `handler` is invoked exactly once: with the response message, or with
    /// the error that ended the transaction.
    fn request(&self, request: Message, handler: TransactionHandler) -> Result<()>;

    /// Sends `indication` without correlation or retransmission.
    fn indicate(&self, indication: Message) -> Result<()>;

    /// Installs the callback for datagrams outside any transaction.
    ///
    /// Called once, when the client owning this transport is constructed.
    fn install_demux(&self, demux: DemuxHandler);
}

/// Connected datagram socket to the TURN server.
///
/// This is the path ChannelData frames take; STUN traffic reaches the same
/// socket through the transaction layer. Each `send` transmits one datagram
/// atomically, which keeps the two write paths from interleaving inside a
/// frame.
pub trait PacketSocket: Send + Sync {
    /// Writes one datagram, honoring `deadline` where the underlying socket
    /// supports write timeouts.
    fn send(&self, datagram: &[u8], deadline: Option<Instant>) -> Result<()>;
}
