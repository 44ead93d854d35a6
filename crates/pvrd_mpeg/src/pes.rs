use tracing::{error, warn};

/// Number of octets needed before the size of a packet can be determined.
pub const PES_HEADER_LEN: usize = 6;

pub const PACK_HEADER: u8 = 0xBA;
pub const PRIVATE_STREAM_1: u8 = 0xBD;
pub const PADDING_STREAM: u8 = 0xBE;

const MIN_CAPACITY: usize = 2048;

#[inline]
pub fn is_video_stream(stream_id: u8) -> bool {
    (0xE0..=0xEF).contains(&stream_id)
}

#[inline]
pub fn is_audio_stream(stream_id: u8) -> bool {
    (0xC0..=0xDF).contains(&stream_id)
}

/// Returns the total size of the packet starting at `data`, including its header.
///
/// Video start codes, program end and stream map units have no length field and are
/// reported as bare 6 octet headers; the higher level has to resync on them.
pub fn packet_size(data: &[u8]) -> Option<usize> {
    let header = data.get(..PES_HEADER_LEN)?;

    Some(match header[3] {
        PACK_HEADER => {
            if header[4] & 0xC0 == 0x40 {
                // MPEG-2, without the stuffing octets.
                14
            } else {
                // MPEG-1
                12
            }
        }
        0xBB | 0xBD..=0xBF | 0xC0..=0xEF => {
            PES_HEADER_LEN + ((header[4] as usize) << 8 | header[5] as usize)
        }
        _ => PES_HEADER_LEN,
    })
}

/// Searches a `00 00 01` start code at or after `from`, leaving room for a complete header.
pub fn find_packet_header(data: &[u8], from: usize) -> Option<usize> {
    let end = data.len().checked_sub(PES_HEADER_LEN)?;

    (from..=end).find(|&i| data[i] == 0x00 && data[i + 1] == 0x00 && data[i + 2] == 0x01)
}

/// Offset of the payload in an MPEG-2 PES packet.
pub fn payload_offset(data: &[u8]) -> Option<usize> {
    let header_data_len = *data.get(8)? as usize;
    Some(9 + header_data_len)
}

fn read_timestamp(data: &[u8]) -> u64 {
    ((data[0] as u64 >> 1) & 0x07) << 30
        | (data[1] as u64) << 22
        | (data[2] as u64 >> 1) << 15
        | (data[3] as u64) << 7
        | (data[4] as u64 >> 1)
}

/// Extracts the PTS and DTS (in 90 kHz ticks) from an MPEG-2 PES header.
pub fn timestamps(data: &[u8]) -> (Option<u64>, Option<u64>) {
    if data.len() < 9 || data[6] & 0xC0 != 0x80 {
        return (None, None);
    }

    let flags = data[7] >> 6;
    let pts = (flags & 0x02 != 0)
        .then(|| data.get(9..14).map(read_timestamp))
        .flatten();
    let dts = (flags == 0x03)
        .then(|| data.get(14..19).map(read_timestamp))
        .flatten();

    (pts, dts)
}

/// Result of [`PesAssembler::fill`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Fill {
    /// The packet is still incomplete. Holds the number of consumed octets.
    Pending(usize),

    /// The assembler holds one complete packet. Holds the number of consumed octets.
    Complete(usize),

    /// The declared length was shorter than the octets already buffered.
    /// The assembler has been reset and the input dropped.
    Corrupt(usize),
}

/// Accumulates a byte stream into complete PES packets.
///
/// Until a `00 00 01` start code is seen, incoming octets only feed a rolling tag and are
/// counted (up to three) but not stored.
#[derive(Clone, Debug)]
pub struct PesAssembler {
    data: Vec<u8>,
    tag: u32,
    length: usize,
}

impl Default for PesAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl PesAssembler {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            tag: u32::MAX,
            length: 0,
        }
    }

    pub fn reset(&mut self) {
        self.tag = u32::MAX;
        self.length = 0;
        self.data.clear();
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// The assembled octets. Empty until a start code has been seen.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn expected_length(&self) -> Option<usize> {
        if self.length < PES_HEADER_LEN {
            return None;
        }

        packet_size(&self.data)
    }

    fn reserve(&mut self, additional: usize) -> bool {
        let wanted = (self.data.len() + additional).max(MIN_CAPACITY);
        if wanted <= self.data.capacity() {
            return true;
        }

        match self.data.try_reserve(wanted - self.data.len()) {
            Ok(()) => true,
            Err(e) => {
                error!("Can't allocate memory for the PES assembler: {}", e);

                self.data = Vec::new();
                self.reset();
                false
            }
        }
    }

    pub fn put(&mut self, c: u8) {
        if self.length < 4 {
            self.tag = (self.tag << 8) | c as u32;

            if self.tag & 0xFFFF_FF00 == 0x0000_0100 {
                if self.reserve(4) {
                    self.data.clear();
                    self.data.extend_from_slice(&self.tag.to_be_bytes());
                    self.length = 4;
                }
            } else if self.length < 3 {
                self.length += 1;
            }
        } else if self.reserve(1) {
            self.data.push(c);
            self.length += 1;
        }
    }

    pub fn put_slice(&mut self, mut data: &[u8]) {
        while self.length < 4 {
            let Some((&c, rest)) = data.split_first() else {
                return;
            };

            self.put(c);
            data = rest;
        }

        if !data.is_empty() && self.reserve(data.len()) {
            self.data.extend_from_slice(data);
            self.length += data.len();
        }
    }

    /// Continues a partially assembled packet with `data`, consuming at most what the
    /// packet still needs.
    pub fn fill(&mut self, data: &[u8]) -> Fill {
        let mut consumed = 0;

        // Make sure we have a complete header.
        while self.length < PES_HEADER_LEN && consumed < data.len() {
            self.put(data[consumed]);
            consumed += 1;
        }

        let Some(expected) = self.expected_length() else {
            return Fill::Pending(consumed);
        };

        if expected < self.length {
            warn!(
                "Dropping {} buffered octets, the PES header declares only {}",
                self.length, expected,
            );

            self.reset();
            return Fill::Corrupt(data.len());
        }

        let rest = (expected - self.length).min(data.len() - consumed);
        self.put_slice(&data[consumed..consumed + rest]);
        consumed += rest;

        if self.length < expected {
            Fill::Pending(consumed)
        } else {
            Fill::Complete(consumed)
        }
    }
}
