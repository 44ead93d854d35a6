pub mod delivery;
#[cfg(feature = "dvb")]
pub mod dvb;
pub mod file;
#[cfg(test)]
pub(crate) mod mock;
pub mod output;
pub mod pid;
pub mod playback;

use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use pvrd_mpeg::pes::{Fill, PES_HEADER_LEN, PesAssembler, find_packet_header, packet_size};
use pvrd_mpeg::remux::{Remux, TRANSFER_BUFFER_SIZE};
use pvrd_mpeg::ts;

use crate::channel::{Channel, Source};
use crate::config::{DeviceConfig, SetupConfig};
use crate::device::delivery::Delivery;
use crate::device::pid::{PidError, PidFilter, PidSlotTable, SlotType};
use crate::device::playback::{Dispatcher, Route, Track, TrackType};
use crate::diseqc::DiseqcTable;
use crate::tuner::{Frontend, Tuner, TunerSettings};
use crate::worker::DEFAULT_STOP_DEADLINE;

pub const MAX_RECEIVERS: usize = 16;
pub const MAX_PRIORITY: i32 = 99;

/// Priority of a device nobody is receiving with.
const IDLE_PRIORITY: i32 = -1;
const NOT_ATTACHED: usize = usize::MAX;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, strum::Display)]
pub enum PlayMode {
    #[default]
    None,
    AudioVideo,
    AudioOnly,
    AudioOnlyBlack,
    VideoOnly,
}

/// The capabilities of one kind of device hardware.
///
/// Filters are programmed through [`PidFilter`]. The playback methods only matter for
/// devices with a decoder; their defaults discard everything.
pub trait DeviceBackend: PidFilter + Send {
    /// Further restricts the sources the tuner of the device can receive.
    fn provides_source(&self, _source: &Source) -> bool {
        true
    }

    fn has_decoder(&self) -> bool {
        false
    }

    fn num_cams(&self) -> usize {
        0
    }

    /// Conditional access systems the CAMs of the device can decrypt.
    fn ca_ids(&self) -> &[u16] {
        &[]
    }

    /// Hands out the tuning part of the device. Called once when the device is opened.
    fn take_frontend(&mut self) -> Option<Box<dyn Frontend>> {
        None
    }

    /// Opens the endpoint delivering the filtered transport stream.
    fn open_stream(&mut self) -> anyhow::Result<Box<dyn Read + Send>>;

    fn set_play_mode(&mut self, _mode: PlayMode) -> anyhow::Result<()> {
        Ok(())
    }

    /// Writes video PES data, returning how much was taken. `Ok(0)` means the decoder is busy.
    fn play_video(&mut self, data: &[u8]) -> io::Result<usize> {
        Ok(data.len())
    }

    /// Writes audio PES data of the stream `id`, like [`DeviceBackend::play_video`].
    fn play_audio(&mut self, data: &[u8], _id: u8) -> io::Result<usize> {
        Ok(data.len())
    }

    /// Waits up to `timeout` until the decoder takes more data.
    fn poll(&mut self, _timeout: Duration) -> bool {
        true
    }

    /// Waits up to `timeout` until the decoder has played everything it was given.
    fn flush(&mut self, _timeout: Duration) -> bool {
        true
    }

    fn clear(&mut self) {}

    fn play(&mut self) {}

    fn freeze(&mut self) {}

    fn mute(&mut self) {}

    fn trick_speed(&mut self, _speed: i32) {}

    fn still_picture(&mut self, _data: &[u8]) {}
}

/// Opens the backend described by a `[[devices]]` entry.
pub fn open_backend(config: &DeviceConfig) -> anyhow::Result<Box<dyn DeviceBackend>> {
    Ok(match config {
        DeviceConfig::File {
            path,
            sources,
            frontend,
            lock_delay_ms,
        } => Box::new(file::FileBackend::new(
            path.clone(),
            sources.clone(),
            *frontend,
            Duration::from_millis(*lock_delay_ms),
        )),

        DeviceConfig::Output { path } => Box::new(output::OutputBackend::create(path)?),

        #[cfg(feature = "dvb")]
        DeviceConfig::Dvb {
            adapter_num,
            frontend_num,
            cams,
            ca_ids,
        } => Box::new(dvb::DvbBackend::open(
            *adapter_num,
            *frontend_num,
            *cams,
            ca_ids.clone(),
        )?),

        #[cfg(not(feature = "dvb"))]
        DeviceConfig::Dvb { .. } => {
            anyhow::bail!("DVB devices need pvrd to be built with the `dvb` feature");
        }
    })
}

/// Consumes the transport packets of a [`Receiver`].
pub trait Receive: Send + Sync {
    /// Called from the delivery thread with one or more packets of the same PID.
    fn receive(&self, data: &[u8]);

    fn activate(&self, _on: bool) {}
}

/// Something that wants a set of PIDs from whatever device it gets attached to.
pub struct Receiver {
    pids: Vec<u16>,
    priority: i32,
    device: AtomicUsize,
    sink: Arc<dyn Receive>,
}

impl Receiver {
    pub fn new(
        pids: impl IntoIterator<Item = u16>,
        priority: i32,
        sink: Arc<dyn Receive>,
    ) -> Arc<Self> {
        let mut pids = pids.into_iter().filter(|&pid| pid != 0).collect::<Vec<_>>();
        pids.sort_unstable();
        pids.dedup();

        Arc::new(Self {
            pids,
            priority: priority.clamp(-MAX_PRIORITY, MAX_PRIORITY),
            device: AtomicUsize::new(NOT_ATTACHED),
            sink,
        })
    }

    pub fn pids(&self) -> &[u16] {
        &self.pids
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Number of the device this receiver is attached to.
    pub fn device_number(&self) -> Option<usize> {
        match self.device.load(Ordering::Acquire) {
            NOT_ATTACHED => None,
            index => Some(index + 1),
        }
    }

    pub fn wants_pid(&self, pid: u16) -> bool {
        self.pids.binary_search(&pid).is_ok()
    }
}

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum ReceiverError {
    #[error("receiver is not attached to this device")]
    NotAttached,

    #[error("receiver is already attached to device {0}")]
    AttachedElsewhere(usize),

    #[error("no free receiver slot")]
    NoFreeSlot,

    #[error(transparent)]
    Pid(#[from] PidError),
}

/// Plays a stream on a device with a decoder.
pub trait Player: Send + Sync {
    fn play_mode(&self) -> PlayMode {
        PlayMode::AudioVideo
    }

    /// Starts or stops feeding the device.
    fn activate(&self, on: bool);

    fn is_transfer(&self) -> bool {
        false
    }
}

fn same_player(a: &Arc<dyn Player>, b: &Arc<dyn Player>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// What [`Device::set_channel_device`] did.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChannelOutcome {
    Tuned,

    /// Recordings already hold the PIDs of the channel on this primary device, so live
    /// view has to be transferred from this very device.
    StartTransfer,
}

struct DeviceState {
    pids: PidSlotTable,
    receivers: Vec<Arc<Receiver>>,
}

struct Playback {
    player: Option<Arc<dyn Player>>,
    play_mode: PlayMode,
    assembler: PesAssembler,
    ts_remux: Remux,
    ts_pending: Option<(Bytes, usize)>,
    dispatcher: Dispatcher,
}

/// One receiving unit.
///
/// The PID table and the receivers share one lock, which is taken before the backend's.
/// Receivers and players are activated only after every device lock is released.
pub struct Device {
    index: usize,
    setup: Arc<SetupConfig>,
    diseqc: Option<Arc<DiseqcTable>>,
    primary: AtomicBool,
    has_decoder: bool,
    num_cams: usize,
    ca_ids: Vec<u16>,
    backend: Mutex<Box<dyn DeviceBackend>>,
    tuner: Option<Tuner>,
    state: Mutex<DeviceState>,
    playback: Mutex<Playback>,
    delivery: Mutex<Option<Delivery>>,
}

impl Device {
    pub fn open(
        index: usize,
        mut backend: Box<dyn DeviceBackend>,
        setup: Arc<SetupConfig>,
        diseqc: Option<Arc<DiseqcTable>>,
    ) -> anyhow::Result<Arc<Self>> {
        let tuner = backend
            .take_frontend()
            .map(|frontend| {
                let settings = TunerSettings::from_setup(&setup, diseqc.clone());
                Tuner::spawn(index + 1, frontend, settings)
            })
            .transpose()?;

        let device = Self {
            index,
            primary: AtomicBool::new(false),
            has_decoder: backend.has_decoder(),
            num_cams: backend.num_cams(),
            ca_ids: backend.ca_ids().to_vec(),
            diseqc,
            backend: Mutex::new(backend),
            tuner,
            state: Mutex::new(DeviceState {
                pids: PidSlotTable::new(),
                receivers: Vec::new(),
            }),
            playback: Mutex::new(Playback {
                player: None,
                play_mode: PlayMode::None,
                assembler: PesAssembler::new(),
                ts_remux: Remux::accept_all(TRANSFER_BUFFER_SIZE),
                ts_pending: None,
                dispatcher: Dispatcher::new(setup.use_dolby_digital),
            }),
            delivery: Mutex::new(None),
            setup,
        };

        info!(
            device = device.number(),
            tuner = ?device.tuner.as_ref().map(|tuner| tuner.kind()),
            decoder = device.has_decoder,
            "Device opened",
        );

        Ok(Arc::new(device))
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// The 1-based number of the device, as used in logs and the configuration.
    pub fn number(&self) -> usize {
        self.index + 1
    }

    pub fn is_primary(&self) -> bool {
        self.primary.load(Ordering::Acquire)
    }

    pub fn set_primary(&self, primary: bool) {
        self.primary.store(primary, Ordering::Release);
    }

    pub fn has_decoder(&self) -> bool {
        self.has_decoder
    }

    pub fn can_replay(&self) -> bool {
        self.has_decoder
    }

    pub fn tuner(&self) -> Option<&Tuner> {
        self.tuner.as_ref()
    }

    /// The highest priority of the attached receivers, or a baseline that keeps the
    /// primary device below the primary limit.
    pub fn priority(&self) -> i32 {
        let baseline = if self.is_primary() {
            self.setup.primary_limit - 1
        } else {
            IDLE_PRIORITY
        };

        self.state
            .lock()
            .receivers
            .iter()
            .map(|receiver| receiver.priority())
            .fold(baseline, i32::max)
    }

    /// Whether receivers are attached. Transfer receivers (negative priority) only count
    /// with `any`.
    pub fn receiving(&self, any: bool) -> bool {
        self.state
            .lock()
            .receivers
            .iter()
            .any(|receiver| any || receiver.priority() >= 0)
    }

    pub fn provides_source(&self, source: &Source) -> bool {
        let Some(tuner) = &self.tuner else {
            return false;
        };

        if !tuner.kind().provides(source) || !self.backend.lock().provides_source(source) {
            return false;
        }

        if source.is_satellite() && self.setup.diseqc {
            return self
                .diseqc
                .as_ref()
                .is_some_and(|diseqc| diseqc.provides_source(self.number(), *source));
        }

        true
    }

    /// How many conditional access methods receiving `channel` would use up. 0 means the
    /// device can't decrypt the channel.
    pub fn provides_ca(&self, channel: &Channel) -> usize {
        if channel.is_encrypted() {
            let decryptable = channel.ca.iter().any(|ca| self.ca_ids.contains(ca));

            return if decryptable { self.num_cams + 1 } else { 0 };
        }

        let provided = match channel.ca.iter().copied().find(|&ca| ca != 0) {
            None => true,
            // Ids below the encrypted range pick a device.
            Some(ca) => ca as usize == self.number(),
        };

        if provided { self.num_cams + 1 } else { 0 }
    }

    /// Whether the device could receive `channel` with `priority`, and whether that would
    /// need the current receivers to be detached.
    pub fn provides_channel(&self, channel: &Channel, priority: i32) -> (bool, bool) {
        if !self.provides_source(&channel.source) || self.provides_ca(channel) == 0 {
            return (false, false);
        }

        let mut result = priority < 0 || priority > self.priority();
        let mut needs_detach = false;

        if priority >= 0 && self.receiving(true) {
            let tuned = self
                .tuner
                .as_ref()
                .is_some_and(|tuner| tuner.is_tuned_to(channel));

            if tuned {
                // Recordings may share the transponder, but the primary device only gives
                // its live view up for priorities beyond the limit.
                result = !self.is_primary() || priority >= self.setup.primary_limit;
            } else {
                needs_detach = true;
            }
        }

        (result, needs_detach)
    }

    pub fn has_pid(&self, pid: u16) -> bool {
        self.state.lock().pids.has_pid(pid)
    }

    pub fn add_pid(&self, pid: u16, slot_type: SlotType) -> Result<(), PidError> {
        let mut detached = Vec::new();

        let result = {
            let mut state = self.state.lock();
            let mut backend = self.backend.lock();
            let state = &mut *state;

            let result = state.pids.add_pid(&mut **backend, pid, slot_type);
            if let Err(PidError::Hardware { pid }) = result {
                error!(device = self.number(), pid, "Can't set PID");

                if slot_type.is_special() {
                    detached = take_receivers(state, &mut **backend, |r| r.wants_pid(pid));
                }
            }

            result
        };

        deactivate(detached);
        result
    }

    pub fn del_pid(&self, pid: u16, slot_type: SlotType) {
        let mut state = self.state.lock();
        let mut backend = self.backend.lock();

        state.pids.del_pid(&mut **backend, pid, slot_type);
    }

    /// Switches the device to `channel`. A transfer to start is left to the caller.
    pub fn set_channel_device(
        &self,
        channel: &Channel,
        live_view: bool,
    ) -> Result<ChannelOutcome, PidError> {
        let do_tune = !self
            .tuner
            .as_ref()
            .is_some_and(|tuner| tuner.is_tuned_to(channel));
        let primary = self.is_primary();
        let vpid = channel.vpid;
        let apid = channel.apid(0);
        let dpid = channel.dpid(0);

        let (pid_handles_video, pid_handles_audio, start_transfer) = {
            let state = self.state.lock();
            let video = state.pids.pid_of(SlotType::Video).unwrap_or(0);
            let audio = state.pids.pid_of(SlotType::Audio).unwrap_or(0);

            let pid_handles_video = video == vpid;
            let pid_handles_audio = audio == apid;

            let start_transfer = primary
                && !do_tune
                && ((live_view
                    && state.pids.has_pid(if vpid != 0 { vpid } else { apid })
                    && (!pid_handles_video
                        || (!pid_handles_audio && (dpid == 0 || audio != dpid))))
                    || (!live_view && (pid_handles_video || pid_handles_audio)));

            (pid_handles_video, pid_handles_audio, start_transfer)
        };

        let turn_off_live =
            self.has_decoder && (do_tune || !primary || live_view || pid_handles_video);
        let turn_on_live = self.has_decoder && !start_transfer && live_view;

        debug!(
            device = self.number(),
            %channel,
            do_tune,
            pid_handles_video,
            pid_handles_audio,
            start_transfer,
            "Setting channel",
        );

        if turn_off_live {
            self.turn_off_live_mode(live_view);
        }

        if let Some(tuner) = &self.tuner {
            tuner.set(channel, do_tune);
        }

        if turn_on_live {
            self.add_pid(channel.ppid, SlotType::Pcr)?;
            self.add_pid(vpid, SlotType::Video)?;
            self.add_pid(apid, SlotType::Audio)?;

            if primary {
                if let Err(e) = self.add_pid(channel.tpid, SlotType::Teletext) {
                    warn!(device = self.number(), "No teletext: {}", e);
                }
            }
        } else if start_transfer {
            return Ok(ChannelOutcome::StartTransfer);
        }

        Ok(ChannelOutcome::Tuned)
    }

    /// Releases the live PIDs, detaching every receiver that uses them.
    pub fn turn_off_live_mode(&self, live_view: bool) {
        let detached = {
            let mut state = self.state.lock();
            let mut backend = self.backend.lock();
            let state = &mut *state;

            if live_view {
                backend.mute();
                backend.clear();
            }

            let live = [
                SlotType::Audio,
                SlotType::Video,
                SlotType::Pcr,
                SlotType::Teletext,
            ]
            .iter()
            .filter_map(|&slot_type| state.pids.pid_of(slot_type))
            .collect::<Vec<_>>();

            let detached = take_receivers(state, &mut **backend, |r| {
                live.iter().any(|&pid| r.wants_pid(pid))
            });

            for slot_type in [
                SlotType::Audio,
                SlotType::Video,
                SlotType::Pcr,
                SlotType::Teletext,
                SlotType::Dolby,
            ] {
                if let Some(pid) = state.pids.pid_of(slot_type) {
                    let lookup = if slot_type == SlotType::Pcr {
                        SlotType::Pcr
                    } else {
                        SlotType::Other
                    };
                    state.pids.del_pid(&mut **backend, pid, lookup);
                }
            }

            detached
        };

        deactivate(detached);
    }

    pub fn has_lock(&self, timeout: Duration) -> bool {
        self.tuner
            .as_ref()
            .is_none_or(|tuner| tuner.wait_for_lock(timeout))
    }

    pub fn attach_receiver(self: &Arc<Self>, receiver: &Arc<Receiver>) -> Result<(), ReceiverError> {
        if let Err(current) = receiver.device.compare_exchange(
            NOT_ATTACHED,
            self.index,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            return if current == self.index {
                Ok(())
            } else {
                Err(ReceiverError::AttachedElsewhere(current + 1))
            };
        }

        let result = {
            let mut state = self.state.lock();

            if state.receivers.len() >= MAX_RECEIVERS {
                error!(device = self.number(), "No free receiver slot");
                Err(ReceiverError::NoFreeSlot)
            } else {
                let mut backend = self.backend.lock();
                let state = &mut *state;

                let added = add_receiver_pids(state, &mut **backend, receiver);
                if added.is_ok() {
                    state.receivers.push(receiver.clone());
                }

                added.map_err(ReceiverError::from)
            }
        };

        if let Err(e) = result {
            receiver.device.store(NOT_ATTACHED, Ordering::Release);
            return Err(e);
        }

        debug!(device = self.number(), pids = ?receiver.pids(), "Receiver attached");

        receiver.sink.activate(true);
        self.ensure_delivery();
        Ok(())
    }

    pub fn detach_receiver(&self, receiver: &Arc<Receiver>) -> Result<(), ReceiverError> {
        if receiver.device.load(Ordering::Acquire) != self.index {
            return Err(ReceiverError::NotAttached);
        }

        let detached = {
            let mut state = self.state.lock();
            let mut backend = self.backend.lock();

            take_receivers(&mut state, &mut **backend, |r| std::ptr::eq(r, &**receiver))
        };

        if detached.is_empty() {
            return Err(ReceiverError::NotAttached);
        }

        debug!(device = self.number(), pids = ?receiver.pids(), "Receiver detached");

        deactivate(detached);
        self.stop_delivery_if_idle();
        Ok(())
    }

    /// Detaches every receiver that wants `pid`.
    pub fn detach_all(&self, pid: u16) {
        if pid == 0 {
            return;
        }

        let detached = {
            let mut state = self.state.lock();
            let mut backend = self.backend.lock();

            take_receivers(&mut state, &mut **backend, |r| r.wants_pid(pid))
        };

        deactivate(detached);
        self.stop_delivery_if_idle();
    }

    pub fn detach_all_receivers(&self) {
        let detached = {
            let mut state = self.state.lock();
            let mut backend = self.backend.lock();

            take_receivers(&mut state, &mut **backend, |_| true)
        };

        deactivate(detached);
        self.stop_delivery_if_idle();
    }

    fn ensure_delivery(self: &Arc<Self>) {
        let mut delivery = self.delivery.lock();
        if delivery.as_ref().is_some_and(|delivery| delivery.is_running()) {
            return;
        }

        if let Some(finished) = delivery.take() {
            finished.stop(DEFAULT_STOP_DEADLINE);
        }

        let stream = match self.backend.lock().open_stream() {
            Ok(stream) => stream,
            Err(e) => {
                error!(device = self.number(), "Couldn't open the stream: {}", e);
                return;
            }
        };

        match Delivery::start(self, stream) {
            Ok(started) => *delivery = Some(started),
            Err(e) => error!(device = self.number(), "Couldn't start the delivery: {}", e),
        }
    }

    fn stop_delivery_if_idle(&self) {
        if !self.state.lock().receivers.is_empty() {
            return;
        }

        let delivery = self.delivery.lock().take();
        if let Some(delivery) = delivery {
            delivery.stop(DEFAULT_STOP_DEADLINE);
        }
    }

    /// Hands a buffer of aligned packets to the receivers, one burst of a PID at a time.
    pub fn distribute(&self, packets: &[u8]) {
        let state = self.state.lock();

        for (pid, burst) in ts::bursts(packets) {
            for receiver in &state.receivers {
                if receiver.wants_pid(pid) {
                    receiver.sink.receive(burst);
                }
            }
        }
    }

    pub fn attach_player(&self, player: Arc<dyn Player>) -> bool {
        if !self.can_replay() {
            return false;
        }

        self.detach_player();

        {
            let mut playback = self.playback.lock();
            let playback = &mut *playback;

            playback.assembler.reset();
            playback.ts_remux.clear();
            playback.ts_pending = None;
            if !player.is_transfer() {
                playback.dispatcher.reset();
            }

            let mode = player.play_mode();
            if let Err(e) = self.backend.lock().set_play_mode(mode) {
                error!(device = self.number(), %mode, "Couldn't set the play mode: {}", e);
            }

            playback.play_mode = mode;
            playback.player = Some(player.clone());
        }

        player.activate(true);
        true
    }

    /// Detaches the current player.
    pub fn detach_player(&self) {
        let Some(player) = self.playback.lock().player.take() else {
            return;
        };

        player.activate(false);

        let mut playback = self.playback.lock();
        if let Err(e) = self.backend.lock().set_play_mode(PlayMode::None) {
            error!(device = self.number(), "Couldn't stop playing: {}", e);
        }

        playback.play_mode = PlayMode::None;
        playback.assembler.reset();
        playback.ts_remux.clear();
        playback.ts_pending = None;
    }

    /// Detaches `player`, unless another one has taken its place.
    pub fn detach_player_if(&self, player: &Arc<dyn Player>) {
        let current = self.playback.lock().player.clone();

        if current.is_some_and(|current| same_player(&current, player)) {
            self.detach_player();
        }
    }

    pub fn play_mode(&self) -> PlayMode {
        self.playback.lock().play_mode
    }

    pub fn is_replaying(&self) -> bool {
        self.playback.lock().player.is_some()
    }

    pub fn is_transferring(&self) -> bool {
        self.playback
            .lock()
            .player
            .as_ref()
            .is_some_and(|player| player.is_transfer())
    }

    /// Discards a partially assembled packet.
    pub fn reset_pes(&self) {
        self.playback.lock().assembler.reset();
    }

    /// Plays a stream of PES packets, returning how many octets were taken. `Ok(0)` means
    /// the decoder is busy and the data has to be offered again.
    pub fn play_pes(&self, data: &[u8], video_only: bool) -> io::Result<usize> {
        let mut playback = self.playback.lock();
        let mut backend = self.backend.lock();

        play_pes(&mut playback, &mut **backend, data, video_only)
    }

    /// Plays aligned transport packets by remultiplexing them into PES packets.
    pub fn play_ts(&self, data: &[u8], video_only: bool) -> io::Result<usize> {
        let mut playback = self.playback.lock();
        let mut backend = self.backend.lock();
        let playback = &mut *playback;

        // Whatever is left over from the last call goes first.
        if !flush_ts_pending(playback, &mut **backend, video_only)? {
            return Ok(0);
        }

        playback.ts_remux.put(data);

        while let Some(packet) = playback.ts_remux.get() {
            playback.ts_pending = Some((packet, 0));

            if !flush_ts_pending(playback, &mut **backend, video_only)? {
                break;
            }
        }

        Ok(data.len())
    }

    pub fn reset_ts(&self) {
        let mut playback = self.playback.lock();

        playback.ts_remux.clear();
        playback.ts_pending = None;
        playback.assembler.reset();
    }

    pub fn poll(&self, timeout: Duration) -> bool {
        self.backend.lock().poll(timeout)
    }

    pub fn flush(&self, timeout: Duration) -> bool {
        self.backend.lock().flush(timeout)
    }

    pub fn clear(&self) {
        self.backend.lock().clear();
    }

    pub fn play(&self) {
        self.backend.lock().play();
    }

    pub fn freeze(&self) {
        self.backend.lock().freeze();
    }

    pub fn mute(&self) {
        self.backend.lock().mute();
    }

    pub fn trick_speed(&self, speed: i32) {
        self.backend.lock().trick_speed(speed);
    }

    pub fn still_picture(&self, data: &[u8]) {
        self.backend.lock().still_picture(data);
    }

    pub fn clear_tracks(&self) {
        self.playback.lock().dispatcher.tracks.clear();
    }

    pub fn set_available_track(&self, track_type: TrackType, id: u16, language: Option<&str>) -> bool {
        let missing = self
            .playback
            .lock()
            .dispatcher
            .tracks
            .set_available(track_type, id, language);

        if missing {
            self.ensure_audio_track(false);
        }

        missing
    }

    /// Selects an audio track if forced or if the current one isn't available.
    pub fn ensure_audio_track(&self, force: bool) {
        let selected = self.playback.lock().dispatcher.tracks.ensure(force);

        if let Some(track_type) = selected {
            debug!(device = self.number(), ?track_type, "Selected audio track");
            self.apply_audio_track(track_type);
        }
    }

    pub fn set_current_audio_track(&self, track_type: TrackType) -> bool {
        if !self.playback.lock().dispatcher.tracks.set_current(track_type) {
            return false;
        }

        self.apply_audio_track(track_type);
        true
    }

    pub fn current_audio_track(&self) -> TrackType {
        self.playback.lock().dispatcher.tracks.current()
    }

    pub fn available_tracks(&self) -> Vec<(TrackType, Track)> {
        self.playback.lock().dispatcher.tracks.available()
    }

    /// Points the live audio filter at the track, unless a player decides what is heard.
    fn apply_audio_track(&self, track_type: TrackType) {
        let id = {
            let playback = self.playback.lock();
            if playback.player.is_some() {
                return;
            }

            match playback.dispatcher.tracks.get(track_type) {
                Some(track) => track.id,
                None => return,
            }
        };

        let detached = {
            let mut state = self.state.lock();
            let mut backend = self.backend.lock();
            let state = &mut *state;

            let Some(current) = state.pids.pid_of(SlotType::Audio) else {
                return;
            };
            if current == id {
                return;
            }

            let detached = take_receivers(state, &mut **backend, |r| r.wants_pid(current));
            state.pids.del_pid(&mut **backend, current, SlotType::Audio);
            if let Err(e) = state.pids.add_pid(&mut **backend, id, SlotType::Audio) {
                error!(device = self.number(), pid = id, "Couldn't switch audio: {}", e);
            }

            detached
        };

        deactivate(detached);
    }

    /// Detaches everything and stops the threads of the device.
    pub fn shutdown(&self) {
        self.detach_player();
        self.detach_all_receivers();

        let delivery = self.delivery.lock().take();
        if let Some(delivery) = delivery {
            delivery.stop(DEFAULT_STOP_DEADLINE);
        }

        debug!(device = self.number(), "Device shut down");
    }
}

/// Adds the PIDs of a receiver, removing the ones already added if one fails.
fn add_receiver_pids(
    state: &mut DeviceState,
    backend: &mut dyn DeviceBackend,
    receiver: &Receiver,
) -> Result<(), PidError> {
    for (n, &pid) in receiver.pids().iter().enumerate() {
        if let Err(e) = state.pids.add_pid(&mut *backend, pid, SlotType::Other) {
            for &added in &receiver.pids()[..n] {
                state.pids.del_pid(&mut *backend, added, SlotType::Other);
            }

            return Err(e);
        }
    }

    Ok(())
}

/// Removes the matching receivers and their PIDs. They still have to be deactivated.
fn take_receivers(
    state: &mut DeviceState,
    backend: &mut dyn DeviceBackend,
    predicate: impl Fn(&Receiver) -> bool,
) -> Vec<Arc<Receiver>> {
    let (taken, kept) = std::mem::take(&mut state.receivers)
        .into_iter()
        .partition::<Vec<_>, _>(|receiver| predicate(&**receiver));
    state.receivers = kept;

    for receiver in &taken {
        receiver.device.store(NOT_ATTACHED, Ordering::Release);

        for &pid in receiver.pids() {
            state.pids.del_pid(&mut *backend, pid, SlotType::Other);
        }
    }

    taken
}

fn deactivate(receivers: Vec<Arc<Receiver>>) {
    for receiver in receivers {
        receiver.sink.activate(false);
    }
}

fn play_pes(
    playback: &mut Playback,
    backend: &mut dyn DeviceBackend,
    data: &[u8],
    video_only: bool,
) -> io::Result<usize> {
    if data.is_empty() {
        return Ok(0);
    }

    if playback.assembler.length() > 0 {
        match playback.assembler.fill(data) {
            Fill::Pending(n) | Fill::Corrupt(n) => return Ok(n),
            Fill::Complete(n) => {
                let w = play_pes_packet(
                    &mut *backend,
                    &mut playback.dispatcher,
                    playback.assembler.data(),
                    video_only,
                )?;

                if w == 0 {
                    return Ok(n);
                }

                playback.assembler.reset();
                if n > 0 {
                    return Ok(n);
                }
            }
        }
    }

    let length = data.len();
    let mut i = 0;

    while let Some(start) = find_packet_header(data, i) {
        i = start;

        let Some(size) = packet_size(&data[i..]) else {
            break;
        };

        if i + size > length {
            // Completed by the next call.
            playback.assembler.put_slice(&data[i..]);
            return Ok(length);
        }

        let w = play_pes_packet(
            &mut *backend,
            &mut playback.dispatcher,
            &data[i..i + size],
            video_only,
        )?;
        if w == 0 {
            return Ok(i);
        }

        i += size;
    }

    // A start code may hide in the last few octets.
    let tail = i.max(length.saturating_sub(PES_HEADER_LEN - 1));
    playback.assembler.put_slice(&data[tail..]);

    Ok(length)
}

fn play_pes_packet(
    backend: &mut dyn DeviceBackend,
    dispatcher: &mut Dispatcher,
    packet: &[u8],
    video_only: bool,
) -> io::Result<usize> {
    let route = dispatcher.route(packet, video_only);
    let mut start = 0;

    while start < packet.len() {
        let rest = &packet[start..];
        let w = match route {
            Route::Video => backend.play_video(rest)?,
            Route::Audio(id) => backend.play_audio(rest, id)?,
            Route::Skip => rest.len(),
        };

        if w == 0 {
            if start > 0 {
                error!("Incomplete PES packet write");
            }
            return Ok(start);
        }

        start += w;
    }

    Ok(packet.len())
}

/// Plays the pending remultiplexed packet. Returns whether it went out completely.
fn flush_ts_pending(
    playback: &mut Playback,
    backend: &mut dyn DeviceBackend,
    video_only: bool,
) -> io::Result<bool> {
    let Some((packet, mut offset)) = playback.ts_pending.take() else {
        return Ok(true);
    };

    while offset < packet.len() {
        let w = play_pes(playback, &mut *backend, &packet[offset..], video_only)?;
        if w == 0 {
            playback.ts_pending = Some((packet, offset));
            return Ok(false);
        }

        offset += w;
    }

    Ok(true)
}
