use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Marker at the start of every ARQ datagram.
pub const ARQ_MARKER: &[u8; 4] = b"PLRQ";
/// conv, kind, seq, ts: four big-endian u32.
pub const SEGMENT_HEAD_LEN: usize = 16;
/// Length prefix in front of each segment inside a datagram.
pub const SEGMENT_LEN_PREFIX: usize = 2;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum SegmentKind {
    Data = 0x5000,
    Ack = 0x5001,
}

impl TryFrom<u32> for SegmentKind {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0x5000 => Ok(SegmentKind::Data),
            0x5001 => Ok(SegmentKind::Ack),
            _ => Err(Error::InvalidFrame),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Segment {
    pub conv: u32,
    pub kind: SegmentKind,
    pub seq: u32,
    /// Sender clock for data; the echoed data timestamp for acks.
    pub ts: u32,
    pub payload: Bytes,
}

impl Segment {
    pub fn data(conv: u32, seq: u32, ts: u32, payload: Bytes) -> Self {
        Self {
            conv,
            kind: SegmentKind::Data,
            seq,
            ts,
            payload,
        }
    }
    pub fn ack(conv: u32, seq: u32, ts: u32) -> Self {
        Self {
            conv,
            kind: SegmentKind::Ack,
            seq,
            ts,
            payload: Bytes::new(),
        }
    }
    pub fn encoded_len(&self) -> usize {
        SEGMENT_HEAD_LEN + self.payload.len()
    }
    /// Appends the length prefix and the segment.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u16(self.encoded_len() as u16);
        buf.put_u32(self.conv);
        buf.put_u32(self.kind as u32);
        buf.put_u32(self.seq);
        buf.put_u32(self.ts);
        buf.put_slice(&self.payload);
    }
    /// Decodes one segment without its length prefix.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < SEGMENT_HEAD_LEN {
            return Err(Error::InvalidFrame);
        }
        let field = |i: usize| u32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Ok(Self {
            conv: field(0),
            kind: field(4).try_into()?,
            seq: field(8),
            ts: field(12),
            payload: Bytes::copy_from_slice(&buf[SEGMENT_HEAD_LEN..]),
        })
    }
}

/// Splits a datagram into its length-prefixed segments.
pub struct SegmentIter<'a> {
    buf: &'a [u8],
}

impl<'a> SegmentIter<'a> {
    /// Fails if the datagram does not start with [`ARQ_MARKER`].
    pub fn new(datagram: &'a [u8]) -> Result<Self> {
        match datagram.strip_prefix(ARQ_MARKER.as_slice()) {
            Some(buf) => Ok(Self { buf }),
            None => Err(Error::InvalidFrame),
        }
    }
}

impl Iterator for SegmentIter<'_> {
    type Item = Result<Segment>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.len() < SEGMENT_LEN_PREFIX {
            return None;
        }
        let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        let rest = &self.buf[SEGMENT_LEN_PREFIX..];
        if rest.len() < len {
            self.buf = &[];
            return Some(Err(Error::Truncated));
        }
        let (segment, rest) = rest.split_at(len);
        self.buf = rest;
        match Segment::decode(segment) {
            Ok(segment) => Some(Ok(segment)),
            Err(e) => {
                self.buf = &[];
                Some(Err(e))
            }
        }
    }
}

/// Packs segments into datagrams no longer than `mss` where possible.
pub(crate) struct Packer {
    buf: BytesMut,
    mss: usize,
}

impl Packer {
    pub(crate) fn new(mss: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            mss,
        }
    }

    pub(crate) fn push<F: FnMut(Bytes)>(&mut self, segment: &Segment, mut emit: F) {
        let need = SEGMENT_LEN_PREFIX + segment.encoded_len();
        if self.buf.len() > ARQ_MARKER.len() && self.buf.len() + need > self.mss {
            emit(self.buf.split().freeze());
        }
        if self.buf.is_empty() {
            self.buf.reserve(self.mss.max(ARQ_MARKER.len() + need));
            self.buf.put_slice(ARQ_MARKER);
        }
        segment.encode_into(&mut self.buf);
    }

    pub(crate) fn finish<F: FnMut(Bytes)>(&mut self, mut emit: F) {
        if self.buf.len() > ARQ_MARKER.len() {
            emit(self.buf.split().freeze());
        }
        self.buf.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn segment_layout() {
        let segment = Segment::data(0x01020304, 9, 77, Bytes::from_static(b"xy"));
        let mut buf = BytesMut::new();
        segment.encode_into(&mut buf);
        assert_eq!(&buf[..2], &[0, 18]);
        assert_eq!(&buf[2..6], &[1, 2, 3, 4]);
        assert_eq!(&buf[6..10], &[0, 0, 0x50, 0x00]);
        assert_eq!(Segment::decode(&buf[2..]).unwrap(), segment);
    }

    #[test]
    fn iter_requires_marker() {
        assert!(SegmentIter::new(b"XXXX").is_err());
        assert_eq!(SegmentIter::new(b"PLRQ").unwrap().count(), 0);
    }

    #[test]
    fn iter_stops_at_truncation() {
        let mut buf = BytesMut::from(&ARQ_MARKER[..]);
        Segment::ack(1, 0, 0).encode_into(&mut buf);
        Segment::ack(1, 1, 0).encode_into(&mut buf);
        buf.truncate(buf.len() - 3);
        let items: Vec<_> = SegmentIter::new(&buf).unwrap().collect();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], Ok(Segment::ack(1, 0, 0)));
        assert_eq!(items[1], Err(Error::Truncated));
    }

    #[test]
    fn packer_splits_on_budget() {
        let mut out = Vec::new();
        let mut packer = Packer::new(64);
        for seq in 0..4 {
            // 2 + 16 + 10 = 28 bytes per segment, two per datagram
            packer.push(
                &Segment::data(1, seq, 0, Bytes::from_static(&[0; 10])),
                |b| out.push(b),
            );
        }
        packer.finish(|b| out.push(b));
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|d| d.len() == 4 + 56));
        let seqs: Vec<u32> = out
            .iter()
            .flat_map(|d| SegmentIter::new(d).unwrap())
            .map(|s| s.unwrap().seq)
            .collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
    }
}
