use std::cmp::min;
use std::collections::BTreeMap;
use std::io::Cursor;

use anyhow::{Context, bail};
use bytes::{Buf, Bytes};
use mpeg2ts::es::{StreamId, StreamType};
use mpeg2ts::pes::PesHeader;
use mpeg2ts::time::Timestamp;
use mpeg2ts::ts::payload::{Pat, Pes, Pmt};
use mpeg2ts::ts::{
    ContinuityCounter, EsInfo, Pid, ProgramAssociation, TransportScramblingControl, TsHeader,
    TsPacket, TsPacketWriter, TsPayload, VersionNumber, WriteTsPacket,
};
use tracing::{debug, trace};

use pvrd_mpeg::pes::{PRIVATE_STREAM_1, is_audio_stream, is_video_stream, timestamps};

const PROGRAM_NUM: u16 = 0x0001;
const TRANSPORT_STREAM_ID: u16 = 0x0001;
const PAT_PID: u16 = 0x0000;
const PMT_PID: u16 = 0x1000;

const VIDEO_PID_BASE: u16 = 0x0100;
const AUDIO_PID_BASE: u16 = 0x0110;
const PRIVATE_PID: u16 = 0x0130;

/// PAT and PMT are repeated every 100 ms of stream time.
const PAT_PMT_INTERVAL: u64 = 9000;

const TS_PAYLOAD_SIZE: usize = TsPacket::SIZE - 4;

fn ts_pid(value: u16) -> anyhow::Result<Pid> {
    Pid::new(value).with_context(|| format!("invalid PID {}", value))
}

struct M2tsStream {
    cc: ContinuityCounter,
    stream_id: StreamId,
    es_info: EsInfo,
}

fn next_cc(cc: &mut ContinuityCounter) -> ContinuityCounter {
    cc.increment();
    *cc
}

/// Collects serialized packets until they are taken.
#[derive(Default)]
pub struct PacketBuffer {
    buf: Vec<u8>,
}

impl PacketBuffer {
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

impl WriteTsPacket for PacketBuffer {
    fn write_ts_packet(&mut self, packet: &TsPacket) -> mpeg2ts::Result<()> {
        let mut bytes = [0u8; TsPacket::SIZE];
        let mut writer = TsPacketWriter::new(Cursor::new(&mut bytes[..]));
        writer.write_ts_packet(packet)?;

        self.buf.extend_from_slice(&bytes);
        Ok(())
    }
}

/// Where the elementary stream of a PES stream id goes.
fn route(stream_id: u8) -> Option<(u16, StreamType)> {
    match stream_id {
        c if is_video_stream(c) => Some((VIDEO_PID_BASE + u16::from(c - 0xE0), StreamType::Mpeg2Video)),
        c if is_audio_stream(c) => Some((AUDIO_PID_BASE + u16::from(c - 0xC0), StreamType::Mpeg1Audio)),
        PRIVATE_STREAM_1 => Some((PRIVATE_PID, StreamType::Mpeg2PacketizedData)),
        _ => None,
    }
}

/// Offset of the payload behind an MPEG-1 PES header, past stuffing, buffer size and
/// timestamps.
fn mpeg1_payload_offset(packet: &[u8]) -> Option<usize> {
    let mut i = 6;

    while *packet.get(i)? == 0xFF {
        i += 1;
    }

    if packet.get(i)? & 0xC0 == 0x40 {
        i += 2;
    }

    Some(match packet.get(i)? & 0xF0 {
        0x20 => i + 5,
        0x30 => i + 10,
        _ => i + 1,
    })
}

/// Packs played PES packets into a single program transport stream.
pub struct M2tsMuxer<W> {
    writer: W,
    pat_cc: ContinuityCounter,
    pmt_cc: ContinuityCounter,
    pmt_version: u8,
    streams: BTreeMap<u16, M2tsStream>,
    last_pat_pmt: Option<u64>,
}

impl<W: WriteTsPacket> M2tsMuxer<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            pat_cc: ContinuityCounter::new(),
            pmt_cc: ContinuityCounter::new(),
            pmt_version: 0,
            streams: BTreeMap::new(),
            last_pat_pmt: None,
        }
    }

    pub fn writer_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    /// PIDs of the elementary streams seen so far.
    pub fn pids(&self) -> Vec<u16> {
        self.streams.keys().copied().collect()
    }

    fn add_stream(&mut self, pid_value: u16, stream_id: u8, stream_type: StreamType) -> anyhow::Result<()> {
        let elementary_pid = ts_pid(pid_value)?;

        self.streams.insert(
            pid_value,
            M2tsStream {
                cc: ContinuityCounter::new(),
                stream_id: StreamId::new(stream_id),
                es_info: EsInfo {
                    elementary_pid,
                    stream_type,
                    descriptors: vec![],
                },
            },
        );

        self.pmt_version = (self.pmt_version + 1) % 32;
        // A changed program has to be announced right away.
        self.last_pat_pmt = None;

        debug!(pid = pid_value, stream_id, ?stream_type, "Added an elementary stream");
        Ok(())
    }

    /// Writes one complete PES packet. Stream ids without an elementary stream mapping
    /// are skipped.
    pub fn write_pes(&mut self, packet: &[u8]) -> anyhow::Result<()> {
        if packet.len() < 9 || packet[..3] != [0x00, 0x00, 0x01] {
            bail!("not a PES packet");
        }

        let stream_id = packet[3];
        let Some((pid_value, stream_type)) = route(stream_id) else {
            trace!(stream_id, "Skipping PES packet");
            return Ok(());
        };

        if !self.streams.contains_key(&pid_value) {
            self.add_stream(pid_value, stream_id, stream_type)?;
        }

        let mpeg2 = packet[6] & 0xC0 == 0x80;
        let (pts, dts) = if mpeg2 { timestamps(packet) } else { (None, None) };
        let offset = if mpeg2 {
            9 + packet[8] as usize
        } else {
            mpeg1_payload_offset(packet).context("truncated MPEG-1 PES header")?
        };
        let mut data = Bytes::copy_from_slice(packet.get(offset..).context("truncated PES packet")?);

        if let Some(now) = dts.or(pts) {
            let due = self
                .last_pat_pmt
                .is_none_or(|last| now.wrapping_sub(last) % Timestamp::MAX >= PAT_PMT_INTERVAL);

            if due {
                self.emit_pat_pmt()?;
                self.last_pat_pmt = Some(now);
            }
        } else if self.last_pat_pmt.is_none() {
            self.emit_pat_pmt()?;
            self.last_pat_pmt = Some(0);
        }

        let mut header_len = 9;
        let pts = pts
            .map(|pts| {
                header_len += 5;
                Timestamp::new(pts)
            })
            .transpose()?;
        let dts = dts
            .map(|dts| {
                header_len += 5;
                Timestamp::new(dts)
            })
            .transpose()?;

        let declared = header_len - 6 + data.len();
        let pes_packet_len = if is_video_stream(stream_id) || declared > 0xFFFF {
            0
        } else {
            declared as u16
        };

        let elementary_pid = ts_pid(pid_value)?;
        let Some(stream) = self.streams.get_mut(&pid_value) else {
            bail!("no stream for PID {}", pid_value);
        };

        let payload = data.split_to(min(data.remaining(), TS_PAYLOAD_SIZE - header_len));

        self.writer.write_ts_packet(&TsPacket {
            header: TsHeader {
                pid: elementary_pid,
                continuity_counter: next_cc(&mut stream.cc),
                transport_error_indicator: false,
                transport_priority: false,
                transport_scrambling_control: TransportScramblingControl::NotScrambled,
            },
            payload: Some(TsPayload::Pes(Pes {
                header: PesHeader {
                    stream_id: stream.stream_id,
                    priority: false,
                    data_alignment_indicator: false,
                    copyright: false,
                    original_or_copy: false,
                    pts,
                    dts,
                    escr: None,
                },
                pes_packet_len,
                data: mpeg2ts::ts::payload::Bytes::new(&payload)?,
            })),
            adaptation_field: None,
        })?;

        while data.has_remaining() {
            let payload = data.split_to(min(data.remaining(), TS_PAYLOAD_SIZE));

            self.writer.write_ts_packet(&TsPacket {
                header: TsHeader {
                    pid: elementary_pid,
                    continuity_counter: next_cc(&mut stream.cc),
                    transport_error_indicator: false,
                    transport_priority: false,
                    transport_scrambling_control: TransportScramblingControl::NotScrambled,
                },
                payload: Some(TsPayload::Raw(mpeg2ts::ts::payload::Bytes::new(&payload)?)),
                adaptation_field: None,
            })?;
        }

        Ok(())
    }

    fn emit_pat_pmt(&mut self) -> anyhow::Result<()> {
        let pmt_pid = ts_pid(PMT_PID)?;
        let es_info = self
            .streams
            .values()
            .map(|stream| stream.es_info.clone())
            .collect::<Vec<_>>();
        let pcr_pid = self
            .streams
            .keys()
            .find(|&&pid| (VIDEO_PID_BASE..AUDIO_PID_BASE).contains(&pid))
            .map(|&value| ts_pid(value))
            .transpose()?;

        self.writer.write_ts_packet(&TsPacket {
            header: TsHeader {
                pid: ts_pid(PAT_PID)?,
                continuity_counter: next_cc(&mut self.pat_cc),
                transport_error_indicator: false,
                transport_priority: false,
                transport_scrambling_control: TransportScramblingControl::NotScrambled,
            },
            payload: Some(TsPayload::Pat(Pat {
                transport_stream_id: TRANSPORT_STREAM_ID,
                version_number: VersionNumber::default(),
                table: vec![ProgramAssociation {
                    program_num: PROGRAM_NUM,
                    program_map_pid: pmt_pid,
                }],
            })),
            adaptation_field: None,
        })?;

        self.writer.write_ts_packet(&TsPacket {
            header: TsHeader {
                pid: pmt_pid,
                continuity_counter: next_cc(&mut self.pmt_cc),
                transport_error_indicator: false,
                transport_priority: false,
                transport_scrambling_control: TransportScramblingControl::NotScrambled,
            },
            payload: Some(TsPayload::Pmt(Pmt {
                program_num: PROGRAM_NUM,
                version_number: VersionNumber::from_u8(self.pmt_version)?,
                pcr_pid,
                es_info,
                program_info: vec![],
            })),
            adaptation_field: None,
        })?;

        Ok(())
    }

    /// Forgets the streams, so that the next packet starts a new program.
    pub fn clear(&mut self) {
        self.streams.clear();
        self.last_pat_pmt = None;
    }
}

#[cfg(test)]
mod tests {
    use mpeg2ts::ts::{ReadTsPacket, TsPacketReader};

    use super::*;

    fn pes(stream_id: u8, pts: Option<u64>, payload_len: usize) -> Vec<u8> {
        let mut header = vec![0x80, 0x00, 0x00];
        if let Some(pts) = pts {
            header[1] = 0x80;
            header[2] = 5;
            header.extend_from_slice(&[
                0x21 | ((pts >> 29) & 0x0E) as u8,
                (pts >> 22) as u8,
                0x01 | ((pts >> 14) & 0xFE) as u8,
                (pts >> 7) as u8,
                0x01 | ((pts << 1) & 0xFE) as u8,
            ]);
        }

        let mut packet = vec![0x00, 0x00, 0x01, stream_id];
        packet.extend_from_slice(&((header.len() + payload_len) as u16).to_be_bytes());
        packet.extend(header);
        packet.extend((0..payload_len).map(|i| i as u8));
        packet
    }

    fn read_all(buf: Vec<u8>) -> Vec<TsPacket> {
        let mut reader = TsPacketReader::new(Cursor::new(buf));
        let mut packets = Vec::new();

        while let Some(packet) = reader.read_ts_packet().unwrap() {
            packets.push(packet);
        }

        packets
    }

    #[test]
    fn test_mux_video_and_audio() {
        let mut muxer = M2tsMuxer::new(PacketBuffer::default());

        muxer.write_pes(&pes(0xE0, Some(90_000), 1000)).unwrap();
        muxer.write_pes(&pes(0xC0, Some(90_100), 100)).unwrap();
        // Not carried.
        muxer.write_pes(&pes(0xBE, None, 10)).unwrap();

        assert_eq!(muxer.pids(), vec![0x100, 0x110]);

        let packets = read_all(muxer.writer_mut().take());
        let pids = packets
            .iter()
            .map(|packet| packet.header.pid.as_u16())
            .collect::<Vec<_>>();

        // The audio stream changes the program, so PAT and PMT are repeated before it.
        assert_eq!(&pids[..3], &[PAT_PID, PMT_PID, 0x100]);
        assert_eq!(pids.iter().filter(|&&pid| pid == 0x100).count(), 6);
        assert_eq!(&pids[pids.len() - 3..], &[PAT_PID, PMT_PID, 0x110]);

        match &packets[pids.len() - 2].payload {
            Some(TsPayload::Pmt(pmt)) => {
                assert_eq!(pmt.es_info.len(), 2);
                assert_eq!(pmt.pcr_pid.map(|pid| pid.as_u16()), Some(0x100));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_pat_pmt_interval() {
        let mut muxer = M2tsMuxer::new(PacketBuffer::default());

        for i in 0..10 {
            muxer.write_pes(&pes(0xE0, Some(i * 3600), 100)).unwrap();
        }

        let packets = read_all(muxer.writer_mut().take());
        let pats = packets
            .iter()
            .filter(|packet| packet.header.pid.as_u16() == PAT_PID)
            .count();

        // At 0, 10800, 21600 and 32400 ticks.
        assert_eq!(pats, 4);
    }

    #[test]
    fn test_mpeg1_payload_offset() {
        assert_eq!(mpeg1_payload_offset(&[0, 0, 1, 0xC0, 0, 10, 0xFF, 0xFF, 0x0F, 0xAA]), Some(9));
        assert_eq!(
            mpeg1_payload_offset(&[0, 0, 1, 0xE0, 0, 10, 0x40, 0x00, 0x21, 0, 0, 0, 0, 0xAA]),
            Some(13),
        );
        assert_eq!(mpeg1_payload_offset(&[0, 0, 1, 0xE0, 0, 10]), None);
    }
}
