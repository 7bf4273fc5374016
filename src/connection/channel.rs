//! Channel framing inside DATA datagrams.
//!
//! Even channels go through the ARQ session; each message is prefixed with
//! its 2-byte channel. Odd channels skip ARQ:
//!
//! ```text
//! | "PLUN" | channel: u16 | seq: u32 | payload... |
//! ```
//!
//! and the receiver drops anything behind the last accepted sequence of that
//! channel.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

pub const CHANNEL_COUNT: u16 = 8;
pub const UNRELIABLE_MARKER: &[u8; 4] = b"PLUN";
const UNRELIABLE_HEAD_LEN: usize = 10;

pub fn check_channel(channel: u16) -> Result<()> {
    if channel >= CHANNEL_COUNT {
        return Err(Error::InvalidChannel(channel));
    }
    Ok(())
}

#[inline]
pub fn is_reliable(channel: u16) -> bool {
    channel % 2 == 0
}

pub fn is_unreliable_frame(buf: &[u8]) -> bool {
    buf.starts_with(UNRELIABLE_MARKER)
}

pub fn encode_reliable(channel: u16, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + payload.len());
    buf.put_u16(channel);
    buf.put_slice(payload);
    buf.freeze()
}

pub fn decode_reliable(mut message: Bytes) -> Result<(u16, Bytes)> {
    if message.len() < 2 {
        return Err(Error::Format("reliable message without channel".into()));
    }
    let channel = u16::from_be_bytes([message[0], message[1]]);
    check_channel(channel)?;
    Ok((channel, message.split_off(2)))
}

pub fn encode_unreliable(channel: u16, seq: u32, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(UNRELIABLE_HEAD_LEN + payload.len());
    buf.put_slice(UNRELIABLE_MARKER);
    buf.put_u16(channel);
    buf.put_u32(seq);
    buf.put_slice(payload);
    buf
}

pub fn decode_unreliable(buf: &[u8]) -> Result<(u16, u32, Bytes)> {
    if buf.len() < UNRELIABLE_HEAD_LEN || !is_unreliable_frame(buf) {
        return Err(Error::Format("short unreliable frame".into()));
    }
    let channel = u16::from_be_bytes([buf[4], buf[5]]);
    check_channel(channel)?;
    let seq = u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]);
    Ok((
        channel,
        seq,
        Bytes::copy_from_slice(&buf[UNRELIABLE_HEAD_LEN..]),
    ))
}

/// Per-channel sequence numbers of the unreliable channels.
#[derive(Default, Debug)]
pub struct ChannelSequences {
    send: [u32; CHANNEL_COUNT as usize],
    recv: [u32; CHANNEL_COUNT as usize],
}

impl ChannelSequences {
    pub fn next_send(&mut self, channel: u16) -> u32 {
        let slot = &mut self.send[channel as usize];
        let seq = *slot;
        *slot = slot.wrapping_add(1);
        seq
    }

    /// Accepts `seq` unless it is behind the last accepted one.
    pub fn accept(&mut self, channel: u16, seq: u32) -> bool {
        let slot = &mut self.recv[channel as usize];
        if seq < *slot {
            return false;
        }
        *slot = seq.wrapping_add(1);
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn channel_range() {
        assert!(check_channel(7).is_ok());
        assert!(matches!(check_channel(8), Err(Error::InvalidChannel(8))));
        assert!(is_reliable(0) && is_reliable(6));
        assert!(!is_reliable(1));
    }

    #[test]
    fn reliable_prefix() {
        let message = encode_reliable(4, b"abc");
        assert_eq!(&message[..], &[0, 4, b'a', b'b', b'c']);
        let (channel, payload) = decode_reliable(message).unwrap();
        assert_eq!(channel, 4);
        assert_eq!(&payload[..], b"abc");
        assert!(decode_reliable(Bytes::from_static(&[0, 9])).is_err());
    }

    #[test]
    fn unreliable_frame() {
        let frame = encode_unreliable(3, 0x01020304, b"z");
        assert_eq!(&frame[..10], b"PLUN\x00\x03\x01\x02\x03\x04");
        let (channel, seq, payload) = decode_unreliable(&frame).unwrap();
        assert_eq!((channel, seq, &payload[..]), (3, 0x01020304, &b"z"[..]));
        assert!(decode_unreliable(b"PLUN").is_err());
    }

    #[test]
    fn stale_sequences_dropped() {
        let mut seqs = ChannelSequences::default();
        assert!(seqs.accept(1, 0));
        assert!(seqs.accept(1, 5));
        assert!(!seqs.accept(1, 3));
        assert!(!seqs.accept(1, 5));
        assert!(seqs.accept(1, 6));
        // channels are independent
        assert!(seqs.accept(3, 0));
        assert_eq!(seqs.next_send(3), 0);
        assert_eq!(seqs.next_send(3), 1);
    }
}
