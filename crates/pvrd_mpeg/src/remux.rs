use std::collections::{BTreeMap, VecDeque};

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use crate::pes::{PES_HEADER_LEN, is_video_stream, packet_size};
use crate::ts::{self, TS_SIZE, TS_SYNC_BYTE};

/// Default amount of PES data kept in a [`Remux`] before input is dropped.
pub const TRANSFER_BUFFER_SIZE: usize = 2 * 1024 * 1024;

const MAX_PES_LENGTH: usize = 0xFFFF;

/// Reassembles the transport packets of a set of PIDs into PES packets.
///
/// A PES packet is complete either when its declared length has been reached or when the
/// next payload unit of the same PID starts.
pub struct Remux {
    pids: Vec<u16>,
    accept_all: bool,
    pending: BTreeMap<u16, BytesMut>,
    ready: VecDeque<Bytes>,
    buffered: usize,
    capacity: usize,
    dropped: u64,
}

impl Remux {
    pub fn new(pids: impl IntoIterator<Item = u16>) -> Self {
        Self::with_capacity(pids, TRANSFER_BUFFER_SIZE)
    }

    pub fn with_capacity(pids: impl IntoIterator<Item = u16>, capacity: usize) -> Self {
        let mut pids = pids.into_iter().filter(|&pid| pid != 0).collect::<Vec<_>>();
        pids.sort_unstable();
        pids.dedup();

        Self {
            pids,
            accept_all: false,
            pending: BTreeMap::new(),
            ready: VecDeque::new(),
            buffered: 0,
            capacity,
            dropped: 0,
        }
    }

    /// A remux that takes every PID, for replaying recorded transport streams.
    pub fn accept_all(capacity: usize) -> Self {
        Self {
            accept_all: true,
            ..Self::with_capacity([], capacity)
        }
    }

    pub fn pids(&self) -> &[u16] {
        &self.pids
    }

    /// Octets dropped because the buffer was full.
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped
    }

    /// Feeds aligned transport packets. Trailing partial packets are ignored.
    pub fn put(&mut self, data: &[u8]) {
        let mut dropped = 0;

        for packet in data.chunks_exact(TS_SIZE) {
            if packet[0] != TS_SYNC_BYTE || ts::transport_error(packet) {
                continue;
            }

            let pid = ts::pid(packet);
            if pid == 0 || (!self.accept_all && self.pids.binary_search(&pid).is_err()) {
                continue;
            }

            let Some(payload) = ts::payload(packet) else {
                continue;
            };

            if self.buffered + payload.len() > self.capacity {
                dropped += payload.len();
                // The unit being assembled is broken now.
                if let Some(buf) = self.pending.remove(&pid) {
                    self.buffered -= buf.len();
                    dropped += buf.len();
                }
                continue;
            }

            if ts::payload_unit_start(packet) {
                self.finish(pid);
                self.pending.entry(pid).or_default().extend_from_slice(payload);
                self.buffered += payload.len();
            } else if let Some(buf) = self.pending.get_mut(&pid) {
                buf.extend_from_slice(payload);
                self.buffered += payload.len();
            } else {
                // Not synced on a payload unit yet.
                continue;
            }

            self.finish_if_complete(pid);
        }

        if dropped > 0 {
            self.dropped += dropped as u64;
            warn!("Remux buffer overflow, dropped {} octets", dropped);
        }
    }

    fn finish(&mut self, pid: u16) {
        let Some(buf) = self.pending.remove(&pid) else {
            return;
        };

        if buf.len() < PES_HEADER_LEN || buf[..3] != [0x00, 0x00, 0x01] {
            debug!(pid, "Discarding {} octets without a PES header", buf.len());
            self.buffered -= buf.len();
            return;
        }

        if buf[4] == 0 && buf[5] == 0 && is_video_stream(buf[3]) {
            self.push_unbounded(buf);
        } else {
            self.ready.push_back(buf.freeze());
        }
    }

    /// Gives an unbounded video unit real length fields, splitting it when it doesn't fit
    /// into a single packet. Downstream assemblers can't find the end of it otherwise.
    fn push_unbounded(&mut self, mut buf: BytesMut) {
        let stream_id = buf[3];
        let mpeg2 = buf.len() > PES_HEADER_LEN && buf[6] & 0xC0 == 0x80;

        let first_len = (buf.len() - PES_HEADER_LEN).min(MAX_PES_LENGTH);
        let mut first = buf.split_to(PES_HEADER_LEN + first_len);
        first[4..6].copy_from_slice(&(first_len as u16).to_be_bytes());
        self.ready.push_back(first.freeze());

        let (extension, added): (&[u8], usize) = if mpeg2 {
            (&[0x80, 0x00, 0x00], 3)
        } else {
            (&[0x0F], 1)
        };

        while !buf.is_empty() {
            let chunk = buf.split_to(buf.len().min(MAX_PES_LENGTH - added));
            let len = (chunk.len() + added) as u16;

            let mut packet = BytesMut::with_capacity(PES_HEADER_LEN + len as usize);
            packet.extend_from_slice(&[0x00, 0x00, 0x01, stream_id]);
            packet.extend_from_slice(&len.to_be_bytes());
            packet.extend_from_slice(extension);
            packet.extend_from_slice(&chunk);

            self.buffered += added + PES_HEADER_LEN;
            self.ready.push_back(packet.freeze());
        }
    }

    fn finish_if_complete(&mut self, pid: u16) {
        let Some(buf) = self.pending.get_mut(&pid) else {
            return;
        };

        let Some(expected) = packet_size(buf) else {
            return;
        };

        // A zero length field (unbounded video) is only terminated by the next unit.
        if expected > PES_HEADER_LEN && buf.len() >= expected {
            let excess = buf.len() - expected;
            buf.truncate(expected);
            self.buffered -= excess;

            self.finish(pid);
        }
    }

    /// Takes the next complete PES packet.
    pub fn get(&mut self) -> Option<Bytes> {
        let packet = self.ready.pop_front()?;
        self.buffered -= packet.len();
        Some(packet)
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.ready.clear();
        self.buffered = 0;
    }
}
