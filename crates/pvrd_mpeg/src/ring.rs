use tracing::{error, warn};

use crate::ts::{TS_SIZE, TS_SYNC_BYTE};

/// A fixed-capacity circular buffer of transport packets.
///
/// The writer appends raw octets with [`TsRingBuffer::put`]; the reader takes aligned
/// packets with [`TsRingBuffer::get`]. A delivered packet stays in the buffer until the
/// next call to `get`.
pub struct TsRingBuffer {
    description: String,
    buf: Box<[u8]>,
    head: usize,
    len: usize,
    delivered: bool,
    scratch: [u8; TS_SIZE],
    skipped: u64,
    overflowed: u64,
}

impl TsRingBuffer {
    pub fn new(capacity: usize, description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            buf: vec![0u8; capacity.max(TS_SIZE)].into_boxed_slice(),
            head: 0,
            len: 0,
            delivered: false,
            scratch: [0u8; TS_SIZE],
            skipped: 0,
            overflowed: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn available(&self) -> usize {
        self.len
    }

    pub fn free(&self) -> usize {
        self.capacity() - self.len
    }

    /// Total octets discarded while resynchronising.
    pub fn skipped_bytes(&self) -> u64 {
        self.skipped
    }

    /// Total octets that didn't fit into the buffer.
    pub fn overflowed_bytes(&self) -> u64 {
        self.overflowed
    }

    #[inline]
    fn byte_at(&self, i: usize) -> u8 {
        self.buf[(self.head + i) % self.buf.len()]
    }

    fn delete(&mut self, count: usize) {
        let count = count.min(self.len);
        self.head = (self.head + count) % self.buf.len();
        self.len -= count;
    }

    /// Appends as much of `data` as fits, returning the number of octets stored.
    pub fn put(&mut self, data: &[u8]) -> usize {
        let count = data.len().min(self.free());

        if count < data.len() {
            let dropped = data.len() - count;
            self.overflowed += dropped as u64;

            error!("{}: buffer overflow, dropped {} octets", self.description, dropped);
        }

        let cap = self.buf.len();
        let tail = (self.head + self.len) % cap;
        let first = count.min(cap - tail);

        self.buf[tail..tail + first].copy_from_slice(&data[..first]);
        self.buf[..count - first].copy_from_slice(&data[first..count]);
        self.len += count;

        count
    }

    /// Returns the next aligned packet, or `None` if less than one packet is available or
    /// the buffer had to be resynchronised. In the latter case the caller simply retries.
    pub fn get(&mut self) -> Option<&[u8]> {
        if self.delivered {
            self.delete(TS_SIZE);
            self.delivered = false;
        }

        if self.len < TS_SIZE {
            return None;
        }

        if self.byte_at(0) != TS_SYNC_BYTE {
            let count = (1..self.len)
                .find(|&i| self.byte_at(i) == TS_SYNC_BYTE)
                .unwrap_or(self.len);

            self.delete(count);
            self.skipped += count as u64;

            warn!("Skipped {} bytes to sync on TS packet on {}", count, self.description);

            return None;
        }

        self.delivered = true;

        let cap = self.buf.len();
        if self.head + TS_SIZE <= cap {
            Some(&self.buf[self.head..self.head + TS_SIZE])
        } else {
            let first = cap - self.head;
            self.scratch[..first].copy_from_slice(&self.buf[self.head..]);
            self.scratch[first..].copy_from_slice(&self.buf[..TS_SIZE - first]);
            Some(&self.scratch)
        }
    }

    /// Moves up to `max_packets` aligned packets into `out`, returning how many were moved.
    pub fn read_packets(&mut self, out: &mut Vec<u8>, max_packets: usize) -> usize {
        let mut count = 0;

        while count < max_packets {
            let Some(packet) = self.get() else {
                break;
            };

            out.extend_from_slice(packet);
            count += 1;
        }

        if self.delivered {
            self.delete(TS_SIZE);
            self.delivered = false;
        }

        count
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
        self.delivered = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(pid: u16, fill: u8) -> Vec<u8> {
        let mut packet = vec![fill; TS_SIZE];
        packet[0] = TS_SYNC_BYTE;
        packet[1] = (pid >> 8) as u8;
        packet[2] = pid as u8;
        packet[3] = 0x10;
        packet
    }

    #[test]
    fn test_sync_recovery() {
        let garbage = [0x00, 0x12, 0xFF, 0x34, 0x56];
        let valid = packet(0x100, 0xAB);

        let mut ring = TsRingBuffer::new(TS_SIZE * 4, "test");
        ring.put(&garbage);
        ring.put(&valid);

        assert!(ring.get().is_none());
        assert_eq!(ring.skipped_bytes(), garbage.len() as u64);
        assert_eq!(ring.get(), Some(valid.as_slice()));
        assert!(ring.get().is_none());
        assert_eq!(ring.available(), 0);
    }

    #[test]
    fn test_partial_packet_is_not_returned() {
        let mut ring = TsRingBuffer::new(TS_SIZE * 2, "test");
        let valid = packet(0x100, 0x01);

        ring.put(&valid[..100]);
        assert!(ring.get().is_none());

        ring.put(&valid[100..]);
        assert_eq!(ring.get(), Some(valid.as_slice()));
    }

    #[test]
    fn test_wrap_around() {
        let mut ring = TsRingBuffer::new(TS_SIZE * 2 + 50, "test");
        let first = packet(0x100, 0x01);
        let second = packet(0x101, 0x02);
        let third = packet(0x102, 0x03);

        ring.put(&first);
        ring.put(&second);
        assert_eq!(ring.get(), Some(first.as_slice()));

        // Frees the first packet, so the third one wraps around the end.
        assert_eq!(ring.get(), Some(second.as_slice()));
        assert_eq!(ring.put(&third), TS_SIZE);
        assert_eq!(ring.get(), Some(third.as_slice()));
    }

    #[test]
    fn test_overflow() {
        let mut ring = TsRingBuffer::new(TS_SIZE, "test");

        assert_eq!(ring.put(&packet(0x100, 0)), TS_SIZE);
        assert_eq!(ring.put(&packet(0x101, 0)), 0);
        assert_eq!(ring.overflowed_bytes(), TS_SIZE as u64);
    }

    #[test]
    fn test_read_packets() {
        let mut ring = TsRingBuffer::new(TS_SIZE * 8, "test");
        for pid in 0..5 {
            ring.put(&packet(pid, 0));
        }

        let mut out = Vec::new();
        assert_eq!(ring.read_packets(&mut out, 3), 3);
        assert_eq!(out.len(), TS_SIZE * 3);
        assert_eq!(ring.available(), TS_SIZE * 2);

        out.clear();
        assert_eq!(ring.read_packets(&mut out, 10), 2);
        assert_eq!(ring.available(), 0);
    }
}
