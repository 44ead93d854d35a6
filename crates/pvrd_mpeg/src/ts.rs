pub const TS_SIZE: usize = 188;
pub const TS_SYNC_BYTE: u8 = 0x47;

/// The highest valid PID. `0x2000` is used by demuxers to select all PIDs.
pub const MAX_PID: u16 = 0x1FFF;

const PID_MASK_HI: u8 = 0x1F;
const TEI_FLAG: u8 = 0x80;
const PUSI_FLAG: u8 = 0x40;
const ADAPTATION_FIELD: u8 = 0x20;
const PAYLOAD_PRESENT: u8 = 0x10;

#[inline]
pub fn pid(packet: &[u8]) -> u16 {
    ((packet[1] & PID_MASK_HI) as u16) << 8 | packet[2] as u16
}

#[inline]
pub fn payload_unit_start(packet: &[u8]) -> bool {
    packet[1] & PUSI_FLAG != 0
}

#[inline]
pub fn transport_error(packet: &[u8]) -> bool {
    packet[1] & TEI_FLAG != 0
}

/// The payload of a transport packet, skipping the adaptation field.
pub fn payload(packet: &[u8]) -> Option<&[u8]> {
    if packet.len() < TS_SIZE || packet[3] & PAYLOAD_PRESENT == 0 {
        return None;
    }

    let offset = if packet[3] & ADAPTATION_FIELD != 0 {
        5 + packet[4] as usize
    } else {
        4
    };

    packet.get(offset..TS_SIZE).filter(|payload| !payload.is_empty())
}

/// Whether a recording starts with transport packets rather than a PES stream.
/// TS recordings begin with a PAT and a PMT packet, both starting a payload unit.
pub fn is_ts_recording(head: &[u8]) -> bool {
    head.len() >= 2 * TS_SIZE
        && head[0] == TS_SYNC_BYTE
        && head[1] == PUSI_FLAG
        && head[TS_SIZE] == TS_SYNC_BYTE
        && head[TS_SIZE + 1] == PUSI_FLAG
}

/// Splits a buffer of aligned packets into runs of consecutive packets sharing a PID.
pub fn bursts(buf: &[u8]) -> Bursts<'_> {
    Bursts { buf }
}

pub struct Bursts<'a> {
    buf: &'a [u8],
}

impl<'a> Iterator for Bursts<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.len() < TS_SIZE {
            return None;
        }

        let first = pid(self.buf);
        let mut len = TS_SIZE;

        while self.buf.len() >= len + TS_SIZE && pid(&self.buf[len..]) == first {
            len += TS_SIZE;
        }

        let (burst, rest) = self.buf.split_at(len);
        self.buf = rest;

        Some((first, burst))
    }
}
