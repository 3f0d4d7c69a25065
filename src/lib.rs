//! A TURN ([RFC 5766]) client library.
//!
//! The client obtains a relayed transport address on a TURN server
//! ([`Client::allocate`]), authorizes peers ([`Allocation::create`]) and
//! exchanges datagrams with each peer through a [`PeerConnection`], either
//! as Send/Data indications or, after [`PeerConnection::bind`], as compact
//! ChannelData frames.
//!
//! The STUN transaction engine and the server socket are supplied by the
//! caller through the [`StunTransport`] and [`PacketSocket`] traits.
//!
//! [RFC 5766]: https://tools.ietf.org/html/rfc5766
#[macro_use]
extern crate bytecodec;
#[macro_use]
extern crate stun_codec;
#[macro_use]
extern crate trackable;

pub use crate::allocation::Allocation;
pub use crate::client::{Client, Options};
pub use crate::error::{Error, ErrorKind};
pub use crate::peer::PeerConnection;
pub use crate::permission::Permission;
pub use crate::transport::{
    DemuxHandler, PacketSocket, StunTransport, TransactionHandler, TransactionResult,
};

pub mod attribute;
pub mod channel_data;
pub mod demux;
pub mod transport;

mod allocation;
mod auth;
mod client;
mod error;
mod peer;
mod permission;

/// This crate specific `Result` type.
pub type Result<T> = std::result::Result<T, Error>;

/// Allocation lifetime assumed when the server omits LIFETIME.
pub const DEFAULT_LIFETIME_SECONDS: u64 = 10 * 60;
