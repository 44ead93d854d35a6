use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use tracing::{debug, error, info};

use pvrd_mpeg::pes::{find_packet_header, packet_size};

use crate::channel::Source;
use crate::device::pid::{FilterMode, PidFilter, SlotId, SlotType};
use crate::device::{DeviceBackend, PlayMode};
use crate::m2ts::{M2tsMuxer, PacketBuffer};

/// A device whose "decoder" writes everything it is given as an MPEG-TS program, to a
/// file or stdout.
pub struct OutputBackend {
    muxer: M2tsMuxer<PacketBuffer>,
    out: BufWriter<Box<dyn Write + Send>>,
    play_mode: PlayMode,
    frozen: bool,
    muted: bool,
    trick_speed: Option<i32>,
}

impl OutputBackend {
    pub fn create(path: &Path) -> anyhow::Result<Self> {
        let writer: Box<dyn Write + Send> = if path.as_os_str() == "-" {
            Box::new(io::stdout())
        } else {
            Box::new(
                File::create(path).with_context(|| format!("Couldn't create {}", path.display()))?,
            )
        };

        info!("Writing played streams to {}", path.display());

        Ok(Self::with_writer(writer))
    }

    pub fn with_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            muxer: M2tsMuxer::new(PacketBuffer::default()),
            out: BufWriter::new(writer),
            play_mode: PlayMode::None,
            frozen: false,
            muted: false,
            trick_speed: None,
        }
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.frozen || self.play_mode == PlayMode::None {
            return Ok(0);
        }

        self.write_pes(data)?;
        Ok(data.len())
    }

    fn write_pes(&mut self, packet: &[u8]) -> io::Result<()> {
        let result = self.muxer.write_pes(packet);

        // Whatever was muxed before a failure still goes out.
        self.out.write_all(&self.muxer.writer_mut().take())?;
        result.map_err(io::Error::other)
    }

    fn flush_writer(&mut self) -> bool {
        match self.out.flush() {
            Ok(()) => true,
            Err(e) => {
                error!("Couldn't flush the output: {}", e);
                false
            }
        }
    }
}

impl PidFilter for OutputBackend {
    fn set_pid(
        &mut self,
        _slot: SlotId,
        _pid: u16,
        _slot_type: SlotType,
        _mode: FilterMode,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn clear_pid(&mut self, _slot: SlotId, _pid: u16, _slot_type: SlotType) -> anyhow::Result<()> {
        Ok(())
    }
}

impl DeviceBackend for OutputBackend {
    fn provides_source(&self, _source: &Source) -> bool {
        false
    }

    fn has_decoder(&self) -> bool {
        true
    }

    fn open_stream(&mut self) -> anyhow::Result<Box<dyn Read + Send>> {
        bail!("output devices don't receive anything");
    }

    fn set_play_mode(&mut self, mode: PlayMode) -> anyhow::Result<()> {
        debug!(%mode, "Play mode");

        if mode == PlayMode::None {
            self.flush_writer();
        }

        self.play_mode = mode;
        self.frozen = false;
        self.trick_speed = None;
        self.muxer.clear();
        Ok(())
    }

    fn play_video(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.play_mode == PlayMode::AudioOnly || self.play_mode == PlayMode::AudioOnlyBlack {
            return Ok(data.len());
        }

        self.write(data)
    }

    fn play_audio(&mut self, data: &[u8], _id: u8) -> io::Result<usize> {
        // Nobody listens at trick speeds.
        if self.muted || self.trick_speed.is_some() || self.play_mode == PlayMode::VideoOnly {
            return Ok(data.len());
        }

        self.write(data)
    }

    fn poll(&mut self, _timeout: Duration) -> bool {
        !self.frozen
    }

    fn flush(&mut self, _timeout: Duration) -> bool {
        self.flush_writer()
    }

    fn clear(&mut self) {
        self.flush_writer();
        self.muxer.clear();
    }

    fn play(&mut self) {
        self.frozen = false;
        self.muted = false;
        self.trick_speed = None;
    }

    fn freeze(&mut self) {
        self.frozen = true;
    }

    fn mute(&mut self) {
        self.muted = true;
    }

    fn trick_speed(&mut self, speed: i32) {
        debug!(speed, "Trick speed");

        self.frozen = false;
        self.trick_speed = Some(speed);
    }

    fn still_picture(&mut self, data: &[u8]) {
        let mut i = 0;

        while let Some(start) = find_packet_header(data, i) {
            let Some(size) = packet_size(&data[start..]) else {
                break;
            };
            let end = (start + size).min(data.len());

            if let Err(e) = self.write_pes(&data[start..end]) {
                error!("Couldn't write the still picture: {}", e);
                return;
            }

            i = end;
        }

        self.flush_writer();
    }
}
