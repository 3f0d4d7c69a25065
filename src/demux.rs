//! Classification of inbound datagrams.
//!
//! STUN messages and ChannelData frames arrive interleaved on the same
//! socket. The two high bits of the first byte tell them apart: `00` is a
//! STUN message, `01` is a ChannelData frame (RFC 5764, section 5.1.2).
use bytecodec::DecodeExt;
use stun_codec::{BrokenMessage, MessageDecoder};

use crate::attribute::{Attribute, Message};
use crate::channel_data::{ChannelData, ChannelDataDecoder};
use crate::{Error, ErrorKind, Result};

/// One classified inbound datagram.
#[derive(Debug)]
pub enum InboundPacket {
    /// A well-formed STUN message.
    Stun(Message),

    /// A STUN-framed message whose attributes failed to decode.
    BrokenStun(BrokenMessage),

    /// A ChannelData frame.
    ChannelData(ChannelData),
}
impl InboundPacket {
    /// Classifies and decodes one complete datagram.
    ///
    /// Fails if the datagram is empty, carries an unknown leading-bit
    /// pattern, or does not decode as what its first byte claims.
    pub fn decode(datagram: &[u8]) -> Result<InboundPacket> {
        match datagram.first().map(|&b| b >> 6) {
            Some(0b00) => {
                let decoded = track!(MessageDecoder::<Attribute>::default()
                    .decode_from_bytes(datagram)
                    .map_err(Error::from))?;
                Ok(decoded
                    .map(InboundPacket::Stun)
                    .unwrap_or_else(InboundPacket::BrokenStun))
            }
            Some(0b01) => {
                let frame = track!(ChannelDataDecoder::default()
                    .decode_from_bytes(datagram)
                    .map_err(Error::from))?;
                Ok(InboundPacket::ChannelData(frame))
            }
            Some(prefix) => track_panic!(
                ErrorKind::Protocol,
                "Unknown leading bits: 0b{:02b}",
                prefix
            ),
            None => track_panic!(ErrorKind::Protocol, "Empty datagram"),
        }
    }
}
