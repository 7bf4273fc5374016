use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::config::ArqConfig;
use crate::error::{Error, Result};
use segment::{
    Packer, Segment, SegmentIter, SegmentKind, ARQ_MARKER, SEGMENT_HEAD_LEN, SEGMENT_LEN_PREFIX,
};

pub mod segment;

/// Sink for the datagrams an [`ArqSession`] produces.
pub trait ArqOutput {
    fn output(&mut self, datagram: Bytes);
}

impl<F: FnMut(Bytes)> ArqOutput for F {
    fn output(&mut self, datagram: Bytes) {
        self(datagram)
    }
}

struct InFlight {
    payload: Bytes,
    resend_at: Instant,
    enlarge: f64,
    xmit: u32,
}

/// One direction-pair of reliable, ordered message delivery.
///
/// Sequence numbers wrap at `u32::MAX`; windows are compared by wrapping
/// distance.
pub struct ArqSession {
    conv: u32,
    config: ArqConfig,
    snd_una: u32,
    snd_nxt: u32,
    rcv_nxt: u32,
    srtt: u32,
    rttval: u32,
    rto: u32,
    snd_queue: VecDeque<Bytes>,
    snd_buf: BTreeMap<u32, InFlight>,
    rcv_buf: BTreeMap<u32, Bytes>,
    rcv_queue: VecDeque<Bytes>,
    acks: Vec<(u32, u32)>,
    epoch: Option<Instant>,
    current: Option<Instant>,
    timestamp: u32,
    failed: bool,
}

impl ArqSession {
    pub fn new(conv: u32, config: ArqConfig) -> Self {
        let rto = duration_ms(config.rto_initial);
        Self {
            conv,
            config,
            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            srtt: 0,
            rttval: 0,
            rto,
            snd_queue: VecDeque::new(),
            snd_buf: BTreeMap::new(),
            rcv_buf: BTreeMap::new(),
            rcv_queue: VecDeque::new(),
            acks: Vec::new(),
            epoch: None,
            current: None,
            timestamp: 0,
            failed: false,
        }
    }

    pub fn conv(&self) -> u32 {
        self.conv
    }
    pub fn config(&self) -> &ArqConfig {
        &self.config
    }
    /// Current retransmission timeout.
    pub fn rto(&self) -> Duration {
        Duration::from_millis(self.rto as u64)
    }
    /// Smoothed round trip, zero until the first sample.
    pub fn srtt(&self) -> Duration {
        Duration::from_millis(self.srtt as u64)
    }
    /// Set once a segment exceeded the retry ceiling. Permanent.
    pub fn is_failed(&self) -> bool {
        self.failed
    }
    /// Messages queued or in flight, not yet acknowledged.
    pub fn pending(&self) -> usize {
        self.snd_queue.len() + self.snd_buf.len()
    }
    /// Messages ready for [`recv`](Self::recv).
    pub fn available(&self) -> usize {
        self.rcv_queue.len()
    }

    /// Largest message [`send`](Self::send) accepts: one segment alone in a
    /// datagram of `mss` bytes.
    pub fn max_message_len(&self) -> usize {
        self.config
            .mss()
            .saturating_sub(ARQ_MARKER.len() + SEGMENT_LEN_PREFIX + SEGMENT_HEAD_LEN)
    }

    /// Queues one message. It travels as a single segment.
    pub fn send(&mut self, message: Bytes) -> Result<()> {
        if message.len() > self.max_message_len() {
            return Err(Error::TooLarge(message.len()));
        }
        self.snd_queue.push_back(message);
        Ok(())
    }

    pub fn recv(&mut self) -> Option<Bytes> {
        self.rcv_queue.pop_front()
    }

    /// Feeds one received datagram, returning how many segments were taken.
    ///
    /// A missing marker rejects the whole datagram. A malformed segment stops
    /// parsing there; earlier segments of the same datagram stay applied.
    pub fn input(&mut self, datagram: &[u8]) -> Result<usize> {
        let mut count = 0;
        for segment in SegmentIter::new(datagram)? {
            let segment = segment?;
            if segment.conv != self.conv {
                return Err(Error::ConversationMismatch {
                    expected: self.conv,
                    got: segment.conv,
                });
            }
            match segment.kind {
                SegmentKind::Data => self.input_data(segment),
                SegmentKind::Ack => self.input_ack(&segment),
            }
            count += 1;
        }
        Ok(count)
    }

    fn input_data(&mut self, segment: Segment) {
        let offset = segment.seq.wrapping_sub(self.rcv_nxt);
        // behind rcv_nxt when the wrapping distance is negative
        let stale = (offset as i32) < 0;
        if !stale && offset >= self.config.window {
            log::trace!("conv {} drop seq {} beyond window", self.conv, segment.seq);
            return;
        }
        self.acks.push((segment.seq, segment.ts));
        if !stale {
            self.rcv_buf.entry(segment.seq).or_insert(segment.payload);
        }
        while let Some(payload) = self.rcv_buf.remove(&self.rcv_nxt) {
            self.rcv_queue.push_back(payload);
            self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
        }
    }

    fn input_ack(&mut self, segment: &Segment) {
        if !self.snd_buf.contains_key(&segment.seq) {
            return;
        }
        if segment.ts < self.timestamp {
            self.update_rtt(self.timestamp - segment.ts);
        }
        self.snd_buf.remove(&segment.seq);
        while self.snd_una != self.snd_nxt && !self.snd_buf.contains_key(&self.snd_una) {
            self.snd_una = self.snd_una.wrapping_add(1);
        }
    }

    fn update_rtt(&mut self, rtt: u32) {
        if self.srtt == 0 {
            self.srtt = rtt;
            self.rttval = rtt / 2;
        } else {
            let delta = rtt.abs_diff(self.srtt);
            self.rttval = (3 * self.rttval + delta) / 4;
            self.srtt = (7 * self.srtt + rtt) / 8;
        }
        let rto = self.srtt + (2 * self.rttval).max(1);
        self.rto = rto.clamp(
            duration_ms(self.config.rto_min),
            duration_ms(self.config.rto_max),
        );
    }

    /// Advances the clock to `now` and flushes.
    pub fn update<O: ArqOutput>(&mut self, now: Instant, output: &mut O) {
        let epoch = *self.epoch.get_or_insert(now);
        self.current = Some(now);
        self.timestamp = duration_ms(now.saturating_duration_since(epoch));
        self.flush(output);
    }

    /// Emits pending acks, admits queued messages into the window and
    /// (re)transmits every segment whose deadline passed.
    pub fn flush<O: ArqOutput>(&mut self, output: &mut O) {
        let Some(now) = self.current else {
            return;
        };
        let mut packer = Packer::new(self.config.mss());
        let mut emit = |datagram: Bytes| output.output(datagram);

        self.acks.sort_unstable();
        for (seq, ts) in self.acks.drain(..) {
            packer.push(&Segment::ack(self.conv, seq, ts), &mut emit);
        }

        while self.snd_nxt.wrapping_sub(self.snd_una) < self.config.window {
            let Some(payload) = self.snd_queue.pop_front() else {
                break;
            };
            self.snd_buf.insert(
                self.snd_nxt,
                InFlight {
                    payload,
                    resend_at: now,
                    enlarge: 1.0,
                    xmit: 0,
                },
            );
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
        }

        let rto = self.rto as f64;
        for (seq, inflight) in self.snd_buf.iter_mut() {
            if now < inflight.resend_at {
                continue;
            }
            inflight.resend_at = now + Duration::from_secs_f64(inflight.enlarge * rto / 1000.0);
            inflight.enlarge *= self.config.backoff;
            inflight.xmit += 1;
            if inflight.xmit - 1 >= self.config.max_retries && !self.failed {
                log::warn!(
                    "conv {} seq {} unacknowledged after {} retransmissions",
                    self.conv,
                    seq,
                    inflight.xmit - 1
                );
                self.failed = true;
            }
            let segment = Segment::data(self.conv, *seq, self.timestamp, inflight.payload.clone());
            packer.push(&segment, &mut emit);
        }
        packer.finish(&mut emit);
    }
}

fn duration_ms(duration: Duration) -> u32 {
    duration.as_millis().min(u32::MAX as u128) as u32
}
