//! ChannelData framing (RFC 5766, section 11.5).
//!
//! ChannelData frames share the server socket with STUN messages but are not
//! STUN: a 16-bit channel number, a 16-bit payload length, the payload, then
//! zero padding up to a 4-byte boundary. The padding is not counted in the
//! length field.
use bytecodec::bytes::{BytesDecoder, BytesEncoder};
use bytecodec::combinator::Peekable;
use bytecodec::fixnum::{U16beDecoder, U16beEncoder};
use bytecodec::{self, ByteCount, Decode, Encode, Eos, SizedEncode};

use crate::{ErrorKind, Result};

/// Smallest channel number usable for a channel binding.
pub const MIN_CHANNEL_NUMBER: u16 = 0x4000;

/// Largest channel number usable for a channel binding.
pub const MAX_CHANNEL_NUMBER: u16 = 0x7FFF;

fn padding_len(data_len: usize) -> usize {
    (4 - data_len % 4) % 4
}

/// A ChannelData frame: one datagram payload addressed by channel number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    channel_number: u16,
    data: Vec<u8>,
}
impl ChannelData {
    /// Makes a new frame.
    ///
    /// Fails if the channel number lies outside `0x4000..=0x7FFF` or the
    /// payload does not fit the 16-bit length field.
    pub fn new(channel_number: u16, data: Vec<u8>) -> Result<Self> {
        track_assert!(
            (MIN_CHANNEL_NUMBER..=MAX_CHANNEL_NUMBER).contains(&channel_number),
            ErrorKind::InvalidInput,
            "Channel number out of range: 0x{:04x}",
            channel_number
        );
        track_assert!(
            data.len() <= u16::max_value() as usize,
            ErrorKind::InvalidInput,
            "Too large payload: {} bytes",
            data.len()
        );
        Ok(ChannelData {
            channel_number,
            data,
        })
    }

    pub fn channel_number(&self) -> u16 {
        self.channel_number
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

/// Incremental [`ChannelData`] decoder.
#[derive(Debug, Default)]
pub struct ChannelDataDecoder {
    channel_number: Peekable<U16beDecoder>,
    data_len: Peekable<U16beDecoder>,
    data: BytesDecoder,
    padding: BytesDecoder,
}
impl Decode for ChannelDataDecoder {
    type Item = ChannelData;

    fn decode(&mut self, buf: &[u8], eos: Eos) -> bytecodec::Result<usize> {
        let mut offset = 0;
        if !self.channel_number.is_idle() {
            bytecodec_try_decode!(self.channel_number, offset, buf, eos);

            let n = *self.channel_number.peek().expect("never fails");
            track_assert!(
                (MIN_CHANNEL_NUMBER..=MAX_CHANNEL_NUMBER).contains(&n),
                bytecodec::ErrorKind::InvalidInput,
                "Channel number out of range: 0x{:04x}",
                n
            );
        }
        if !self.data_len.is_idle() {
            bytecodec_try_decode!(self.data_len, offset, buf, eos);

            let len = *self.data_len.peek().expect("never fails") as usize;
            self.data.set_bytes(vec![0; len]);
            self.padding.set_bytes(vec![0; padding_len(len)]);
        }
        bytecodec_try_decode!(self.data, offset, buf, eos);
        bytecodec_try_decode!(self.padding, offset, buf, eos);
        Ok(offset)
    }

    fn finish_decoding(&mut self) -> bytecodec::Result<Self::Item> {
        let channel_number = track!(self.channel_number.finish_decoding())?;
        let _ = track!(self.data_len.finish_decoding())?;
        let data = track!(self.data.finish_decoding())?;
        let _ = track!(self.padding.finish_decoding())?;
        Ok(ChannelData {
            channel_number,
            data,
        })
    }

    fn requiring_bytes(&self) -> ByteCount {
        self.channel_number
            .requiring_bytes()
            .add_for_decoding(self.data_len.requiring_bytes())
            .add_for_decoding(self.data.requiring_bytes())
            .add_for_decoding(self.padding.requiring_bytes())
    }

    fn is_idle(&self) -> bool {
        self.channel_number.is_idle()
            && self.data_len.is_idle()
            && self.data.is_idle()
            && self.padding.is_idle()
    }
}

/// Incremental [`ChannelData`] encoder.
#[derive(Debug, Default)]
pub struct ChannelDataEncoder {
    channel_number: U16beEncoder,
    data_len: U16beEncoder,
    data: BytesEncoder,
    padding: BytesEncoder,
}
impl Encode for ChannelDataEncoder {
    type Item = ChannelData;

    fn encode(&mut self, buf: &mut [u8], eos: Eos) -> bytecodec::Result<usize> {
        let mut offset = 0;
        bytecodec_try_encode!(self.channel_number, offset, buf, eos);
        bytecodec_try_encode!(self.data_len, offset, buf, eos);
        bytecodec_try_encode!(self.data, offset, buf, eos);
        bytecodec_try_encode!(self.padding, offset, buf, eos);
        Ok(offset)
    }

    fn start_encoding(&mut self, item: Self::Item) -> bytecodec::Result<()> {
        track!(self.channel_number.start_encoding(item.channel_number))?;
        track!(self.data_len.start_encoding(item.data.len() as u16))?;
        track!(self.padding.start_encoding(vec![0; padding_len(item.data.len())]))?;
        track!(self.data.start_encoding(item.data))?;
        Ok(())
    }

    fn requiring_bytes(&self) -> ByteCount {
        ByteCount::Finite(self.exact_requiring_bytes())
    }

    fn is_idle(&self) -> bool {
        self.channel_number.is_idle()
            && self.data_len.is_idle()
            && self.data.is_idle()
            && self.padding.is_idle()
    }
}
impl SizedEncode for ChannelDataEncoder {
    fn exact_requiring_bytes(&self) -> u64 {
        self.channel_number.exact_requiring_bytes()
            + self.data_len.exact_requiring_bytes()
            + self.data.exact_requiring_bytes()
            + self.padding.exact_requiring_bytes()
    }
}
