use std::io::{self, Cursor, Read};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::device::pid::{FilterMode, PidFilter, SlotId, SlotType};
use crate::device::{DeviceBackend, PlayMode};
use crate::tuner::simulated::SimulatedFrontend;
use crate::tuner::{Frontend, FrontendKind};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MockCall {
    SetPid(u16, FilterMode),
    ClearPid(u16),
    Clear,
    Play,
    Freeze,
    Mute,
    TrickSpeed(i32),
    StillPicture(usize),
}

#[derive(Default)]
pub struct MockState {
    pub calls: Vec<MockCall>,
    pub fail_pids: Vec<u16>,
    pub play_modes: Vec<PlayMode>,
    pub video: Vec<u8>,
    pub audio: Vec<u8>,

    /// Makes the decoder refuse all data.
    pub busy: bool,

    /// Makes the decoder busy once this much video has been written.
    pub busy_after: Option<usize>,

    /// Largest write the decoder takes at once.
    pub max_write: Option<usize>,

    /// Writes to turn away with 0 octets before taking data again.
    pub refused_writes: usize,

    /// Makes every other poll time out.
    pub flaky_poll: bool,
    polls: usize,

    pub stream: Vec<u8>,
}

impl MockState {
    pub fn is_busy(&self) -> bool {
        self.busy || self.busy_after.is_some_and(|limit| self.video.len() >= limit)
    }
}

/// A device backend that records what is done to it.
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
    decoder: bool,
    frontend: Option<FrontendKind>,
    num_cams: usize,
    ca_ids: Vec<u16>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            decoder: false,
            frontend: None,
            num_cams: 0,
            ca_ids: Vec::new(),
        }
    }

    pub fn with_decoder(mut self) -> Self {
        self.decoder = true;
        self
    }

    pub fn with_frontend(mut self) -> Self {
        self.frontend = Some(FrontendKind::Satellite);
        self
    }

    pub fn with_cams(mut self, num_cams: usize, ca_ids: Vec<u16>) -> Self {
        self.num_cams = num_cams;
        self.ca_ids = ca_ids;
        self
    }

    pub fn state(&self) -> Arc<Mutex<MockState>> {
        self.state.clone()
    }

    fn write(&self, data: &[u8], audio: bool) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.is_busy() {
            return Ok(0);
        }

        if state.refused_writes > 0 {
            state.refused_writes -= 1;
            return Ok(0);
        }

        let n = state.max_write.map_or(data.len(), |max| max.min(data.len()));
        if audio {
            state.audio.extend_from_slice(&data[..n]);
        } else {
            state.video.extend_from_slice(&data[..n]);
        }

        Ok(n)
    }

    fn record(&self, call: MockCall) {
        self.state.lock().calls.push(call);
    }
}

impl PidFilter for MockBackend {
    fn set_pid(
        &mut self,
        _slot: SlotId,
        pid: u16,
        _slot_type: SlotType,
        mode: FilterMode,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if state.fail_pids.contains(&pid) {
            anyhow::bail!("filter for PID {} is broken", pid);
        }

        state.calls.push(MockCall::SetPid(pid, mode));
        Ok(())
    }

    fn clear_pid(&mut self, _slot: SlotId, pid: u16, _slot_type: SlotType) -> anyhow::Result<()> {
        self.record(MockCall::ClearPid(pid));
        Ok(())
    }
}

impl DeviceBackend for MockBackend {
    fn has_decoder(&self) -> bool {
        self.decoder
    }

    fn num_cams(&self) -> usize {
        self.num_cams
    }

    fn ca_ids(&self) -> &[u16] {
        &self.ca_ids
    }

    fn take_frontend(&mut self) -> Option<Box<dyn Frontend>> {
        self.frontend
            .take()
            .map(|kind| Box::new(SimulatedFrontend::new(kind, Duration::ZERO)) as Box<dyn Frontend>)
    }

    fn open_stream(&mut self) -> anyhow::Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(self.state.lock().stream.clone())))
    }

    fn set_play_mode(&mut self, mode: PlayMode) -> anyhow::Result<()> {
        self.state.lock().play_modes.push(mode);
        Ok(())
    }

    fn play_video(&mut self, data: &[u8]) -> io::Result<usize> {
        self.write(data, false)
    }

    fn play_audio(&mut self, data: &[u8], _id: u8) -> io::Result<usize> {
        self.write(data, true)
    }

    fn poll(&mut self, timeout: Duration) -> bool {
        let busy = {
            let mut state = self.state.lock();
            state.polls += 1;
            state.is_busy() || (state.flaky_poll && state.polls % 2 == 1)
        };
        if busy {
            std::thread::sleep(timeout.min(Duration::from_millis(10)));
        }

        !busy
    }

    fn clear(&mut self) {
        self.record(MockCall::Clear);
    }

    fn play(&mut self) {
        self.record(MockCall::Play);
    }

    fn freeze(&mut self) {
        self.record(MockCall::Freeze);
    }

    fn mute(&mut self) {
        self.record(MockCall::Mute);
    }

    fn trick_speed(&mut self, speed: i32) {
        self.record(MockCall::TrickSpeed(speed));
    }

    fn still_picture(&mut self, data: &[u8]) {
        self.record(MockCall::StillPicture(data.len()));
    }
}
