mod backtrace;
mod reader;

use std::collections::VecDeque;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, bail};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use pvrd_mpeg::index::{
    FRAMES_PER_SEC, FrameLocation, IndexFile, MAX_FILE_NUMBER, MAX_FRAME_SIZE, PictureType,
    data_file_name, index_to_hmsf,
};
use pvrd_mpeg::still::{append_sequence_end, set_broken_link};
use pvrd_mpeg::ts::{TS_SIZE, TS_SYNC_BYTE, is_ts_recording};

use crate::device::{Device, Player};
use crate::replay::backtrace::BackTrace;
use crate::replay::reader::{NonBlockingReader, read_at};
use crate::worker::{DEFAULT_STOP_DEADLINE, Worker};

/// How much read-ahead data is queued for the decoder.
const PLAYER_BUFFER_SIZE: usize = 1024 * 1024;

/// How far before the last played frame an interrupted replay resumes.
const RESUME_BACKUP: usize = 10 * FRAMES_PER_SEC;

/// Trick speeds, slow ones negative. Both ends are sentinels.
const SPEEDS: [i32; 9] = [0, -2, -4, -8, 1, 2, 4, 12, 0];
const NORMAL_SPEED: usize = 4;
const MAX_SPEEDS: usize = 3;
const SPEED_MULT: i32 = 12;
const MAX_VIDEO_SLOWMOTION: i32 = 63;

const POLL_TIMEOUT: Duration = Duration::from_millis(100);
const FLUSH_TIMEOUT: Duration = Duration::from_millis(100);
const IDLE_INTERVAL: Duration = Duration::from_millis(3);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TrickMode {
    Play,
    Pause,
    Slow,
    Fast,
    Still,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    Forward,
    Backward,
}

/// What the replay looks like to the user.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ReplayMode {
    pub play: bool,
    pub forward: bool,

    /// Steps away from the normal speed while playing fast or slow.
    pub speed: Option<usize>,
}

#[derive(Clone, Debug)]
struct Frame {
    data: Bytes,
    index: Option<usize>,
}

/// Frames read ahead of the decoder, bounded by their total size.
struct FrameRing {
    frames: VecDeque<Frame>,
    size: usize,
    capacity: usize,
}

impl FrameRing {
    fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            size: 0,
            capacity,
        }
    }

    /// Queues `frame`, handing it back if there is no room. A single frame always fits.
    fn put(&mut self, frame: Frame) -> Result<(), Frame> {
        if !self.frames.is_empty() && self.size + frame.data.len() > self.capacity {
            return Err(frame);
        }

        self.size += frame.data.len();
        self.frames.push_back(frame);
        Ok(())
    }

    fn get(&mut self) -> Option<Frame> {
        let frame = self.frames.pop_front()?;
        self.size -= frame.data.len();
        Some(frame)
    }

    fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    fn clear(&mut self) {
        self.frames.clear();
        self.size = 0;
    }
}

/// The data file currently read from.
struct DataFile {
    number: u8,
    file: Arc<File>,
    offset: u64,
}

fn open_data_file(dir: &Path, number: u8) -> io::Result<DataFile> {
    let file = File::open(data_file_name(dir, number))?;

    Ok(DataFile {
        number,
        file: Arc::new(file),
        offset: 0,
    })
}

/// The frame on its way into the decoder.
struct PlayFrame {
    frame: Frame,
    offset: usize,
}

struct EngineState {
    index: Option<IndexFile>,
    file: Option<DataFile>,
    eof: bool,
    first_packet: bool,
    mode: TrickMode,
    direction: Direction,
    trick_speed: usize,
    read_index: Option<usize>,
    write_index: Option<usize>,
    frames: FrameRing,
    back_trace: BackTrace,
    read_frame: Option<Frame>,
    play_frame: Option<PlayFrame>,

    /// Bumped whenever queued data is thrown away, so that writes started before that
    /// don't count.
    generation: u64,
}

impl EngineState {
    fn new(index: Option<IndexFile>, file: DataFile) -> Self {
        Self {
            index,
            file: Some(file),
            eof: false,
            first_packet: true,
            mode: TrickMode::Play,
            direction: Direction::Forward,
            trick_speed: NORMAL_SPEED,
            read_index: None,
            write_index: None,
            frames: FrameRing::new(PLAYER_BUFFER_SIZE),
            back_trace: BackTrace::default(),
            read_frame: None,
            play_frame: None,
            generation: 0,
        }
    }

    fn is_slow_backward(&self) -> bool {
        self.mode == TrickMode::Slow && self.direction == Direction::Backward
    }

    /// Positions the replay at `offset` in data file `number`.
    fn seek_file(&mut self, dir: &Path, number: u8, offset: u64) -> bool {
        if self.file.as_ref().is_none_or(|file| file.number != number) {
            self.file = match open_data_file(dir, number) {
                Ok(file) => Some(file),
                Err(e) => {
                    error!("Couldn't open data file #{}: {}", number, e);
                    None
                }
            };
        }

        if let Some(file) = &mut self.file {
            file.offset = offset;
        }

        self.eof = false;
        self.file.is_some()
    }

    /// Moves on to the next data file once the current one is exhausted. Returns whether
    /// there is a file to read from.
    fn next_file(&mut self, dir: &Path) -> bool {
        if self.eof {
            if let Some(current) = self.file.take() {
                self.file = current
                    .number
                    .checked_add(1)
                    .filter(|&number| number <= MAX_FILE_NUMBER)
                    .and_then(|number| match open_data_file(dir, number) {
                        Ok(file) => Some(file),
                        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
                        Err(e) => {
                            error!("Couldn't open data file #{}: {}", number, e);
                            None
                        }
                    });
            }
            self.eof = false;
        }

        self.file.is_some()
    }

    fn has_more(&mut self, dir: &Path) -> bool {
        self.next_file(dir)
            || self.read_index.is_some()
            || self.read_frame.is_some()
            || !self.frames.is_empty()
            || self.play_frame.is_some()
    }
}

/// The first I-frame strictly after (or before) `from`, where `None` is before the start.
fn next_i_frame(
    index: &IndexFile,
    from: Option<usize>,
    forward: bool,
    stay_off_end: bool,
) -> Option<(usize, FrameLocation)> {
    match from {
        Some(from) => index.next_i_frame(from, forward, stay_off_end),
        None if forward => index
            .get(0)
            .filter(|location| location.picture_type == PictureType::I)
            .map(|location| (0, location))
            .or_else(|| index.next_i_frame(0, true, stay_off_end)),
        None => None,
    }
}

#[derive(Default)]
struct LoopFlags {
    sleep: bool,
    waiting_for_data: bool,
}

enum Step {
    Proceed,
    Retry,
    Stop,
}

/// A chunk handed to the device outside the state lock.
struct Write {
    data: Bytes,
    video_only: bool,
    first_packet: bool,
    generation: u64,
}

struct Shared {
    dir: PathBuf,
    ts_header: Option<Bytes>,
    multi_speed_mode: bool,
    still_recording: Arc<AtomicBool>,
    reader: NonBlockingReader,
    device: Weak<Device>,
    state: Mutex<EngineState>,
    worker: Mutex<Option<Worker>>,
}

/// The playing side of a replay, attached to the primary device.
struct ReplayPlayer(Arc<Shared>);

impl Player for ReplayPlayer {
    fn activate(&self, on: bool) {
        let mut worker = self.0.worker.lock();

        if on {
            if worker.is_some() {
                return;
            }

            let shared = self.0.clone();
            match Worker::spawn("replay", move |token| shared.run(&token)) {
                Ok(spawned) => *worker = Some(spawned),
                Err(e) => error!("Couldn't start the replay: {}", e),
            }
        } else if let Some(mut stopped) = worker.take() {
            stopped.stop(DEFAULT_STOP_DEADLINE);
        }
    }
}

impl Shared {
    fn run(&self, token: &CancellationToken) {
        let Some(device) = self.device.upgrade() else {
            return;
        };

        let mut flags = LoopFlags::default();
        let mut last_index = None;
        let mut last_generation = 0;

        while !token.is_cancelled() {
            if flags.sleep {
                if flags.waiting_for_data {
                    self.reader.wait_for_data(IDLE_INTERVAL);
                } else {
                    std::thread::sleep(IDLE_INTERVAL);
                }
                flags.sleep = false;
            }

            if !device.poll(POLL_TIMEOUT) {
                continue;
            }

            let write = {
                let mut state = self.state.lock();

                if !state.has_more(&self.dir) {
                    drop(state);
                    if device.flush(FLUSH_TIMEOUT) {
                        break;
                    }
                    continue;
                }

                match self.read_next(&mut state, &device, &mut flags) {
                    Step::Proceed => {}
                    Step::Retry => continue,
                    Step::Stop => break,
                }

                match self.next_write(&mut state) {
                    Some(write) => write,
                    None => {
                        flags.sleep = true;
                        continue;
                    }
                }
            };

            if write.first_packet {
                match &self.ts_header {
                    Some(header) => {
                        device.reset_ts();
                        if let Err(e) = device.play_ts(header, false) {
                            error!("Couldn't play the stream header: {}", e);
                        }
                    }
                    None => device.reset_pes(),
                }
            }

            let result = match self.ts_header {
                Some(_) => device.play_ts(&write.data, write.video_only),
                None => device.play_pes(&write.data, write.video_only),
            };

            let written = match result {
                Ok(written) => written,
                Err(e) => {
                    error!(device = device.number(), "Replay write failed: {}", e);
                    break;
                }
            };

            let delay = {
                let mut state = self.state.lock();
                if state.generation != write.generation {
                    continue;
                }

                if last_generation != state.generation {
                    last_generation = state.generation;
                    last_index = None;
                }

                let Some(play) = &mut state.play_frame else {
                    continue;
                };

                play.offset += written;
                if play.offset < play.frame.data.len() {
                    continue;
                }

                let Some(PlayFrame { frame, .. }) = state.play_frame.take() else {
                    continue;
                };

                state.write_index = frame.index;
                if let Some(index) = frame.index {
                    state.back_trace.add(index, frame.data.len());
                }

                let delay = self.pacing(&state, frame.index, last_index);
                last_index = frame.index;
                delay
            };

            if let Some(delay) = delay {
                std::thread::sleep(delay);
            }
        }

        debug!("Replay finished");
    }

    /// Reads ahead of the decoder, one frame at a time.
    fn read_next(&self, state: &mut EngineState, device: &Device, flags: &mut LoopFlags) -> Step {
        if matches!(state.mode, TrickMode::Still | TrickMode::Pause) {
            flags.sleep = true;
            return Step::Proceed;
        }

        if state.read_frame.is_none() && (state.file.is_some() || state.read_index.is_some()) {
            if !self.reader.is_reading() {
                let length = match self.locate_next(state, device, flags) {
                    Ok(length) => length,
                    Err(step) => return step,
                };

                let Some(file) = &state.file else {
                    return Step::Retry;
                };
                self.reader.request(file.file.clone(), file.offset, length);
            }

            match self.reader.take() {
                Some(Ok(data)) if data.is_empty() => state.eof = true,
                Some(Ok(data)) => {
                    flags.waiting_for_data = false;
                    if let Some(file) = &mut state.file {
                        file.offset += data.len() as u64;
                    }
                    state.read_frame = Some(Frame {
                        data: Bytes::from(data),
                        index: state.read_index,
                    });
                }
                Some(Err(_)) => return Step::Stop,
                None => flags.waiting_for_data = true,
            }
        }

        if let Some(frame) = state.read_frame.take() {
            if let Err(frame) = state.frames.put(frame) {
                state.read_frame = Some(frame);
            }
        }

        Step::Proceed
    }

    /// Picks the next frame to read and positions the file at it. Returns how much to read.
    fn locate_next(
        &self,
        state: &mut EngineState,
        device: &Device,
        flags: &mut LoopFlags,
    ) -> Result<usize, Step> {
        let still_recording = self.still_recording.load(Ordering::Acquire);
        let trick = state.mode == TrickMode::Fast || state.is_slow_backward();
        let forward = state.direction == Direction::Forward;
        let read_index = state.read_index;

        let found = {
            let Some(index) = state.index.as_mut() else {
                return Ok(MAX_FRAME_SIZE);
            };

            if still_recording {
                if let Err(e) = index.catch_up() {
                    warn!("Couldn't catch up with the index: {}", e);
                }
            }

            if trick {
                next_i_frame(index, read_index, forward, still_recording)
            } else {
                let next = read_index.map_or(0, |index| index + 1);
                index.get(next).map(|location| (next, location))
            }
        };

        let Some((next, location)) = found else {
            if trick && (!forward || still_recording) {
                // At the beginning, or too close to the end of a growing recording.
                if device.flush(FLUSH_TIMEOUT) {
                    device.play();
                    state.mode = TrickMode::Play;
                    state.direction = Direction::Forward;
                }
                return Err(Step::Retry);
            }

            if !trick && still_recording {
                flags.sleep = true;
                return Err(Step::Proceed);
            }

            state.read_index = None;
            state.eof = true;
            return Err(Step::Retry);
        };

        state.read_index = Some(next);
        if !state.seek_file(&self.dir, location.file_number, location.offset) {
            if !trick {
                state.read_index = None;
                state.eof = true;
            }
            return Err(Step::Retry);
        }

        Ok(match location.length {
            Some(length) if length <= MAX_FRAME_SIZE => length,
            Some(length) => {
                error!(index = next, length, "Frame too large, reading only part of it");
                MAX_FRAME_SIZE
            }
            None => MAX_FRAME_SIZE,
        })
    }

    fn next_write(&self, state: &mut EngineState) -> Option<Write> {
        if state.play_frame.is_none() {
            let frame = state.frames.get()?;
            state.play_frame = Some(PlayFrame { frame, offset: 0 });
        }

        let first_packet = state.first_packet;
        state.first_packet = false;

        let video_only = state.mode != TrickMode::Play;
        let generation = state.generation;
        let play = state.play_frame.as_mut()?;

        if first_packet && play.offset == 0 {
            let mut data = BytesMut::from(&play.frame.data[..]);
            if set_broken_link(&mut data) {
                play.frame.data = data.freeze();
            }
        }

        Some(Write {
            data: play.frame.data.slice(play.offset..),
            video_only,
            first_packet,
            generation,
        })
    }

    /// How long to wait after a frame, so that fast and slow modes keep their speed.
    fn pacing(
        &self,
        state: &EngineState,
        index: Option<usize>,
        last_index: Option<usize>,
    ) -> Option<Duration> {
        let speed = i64::from(SPEEDS[state.trick_speed]);

        let micros = match state.mode {
            TrickMode::Fast if speed > 0 => {
                let frames = match (self.ts_header.is_some(), index, last_index) {
                    (true, Some(index), Some(last)) => index.abs_diff(last) as i64,
                    (true, _, _) => 0,
                    (false, _, _) => 1,
                };

                frames * 1_000_000 / (FRAMES_PER_SEC as i64 * speed * 2)
            }
            TrickMode::Slow if state.direction == Direction::Backward && speed < 0 => {
                2 * speed * 1_000_000 / -8
            }
            _ => return None,
        };

        u64::try_from(micros)
            .ok()
            .filter(|&micros| micros > 0)
            .map(Duration::from_micros)
    }

    /// Where an interrupted replay of this recording left off.
    fn resume(&self, state: &mut EngineState) -> Option<usize> {
        let index = IndexFile::read_resume(&self.dir)?;
        let location = state.index.as_ref()?.get(index)?;

        state
            .seek_file(&self.dir, location.file_number, location.offset)
            .then_some(index)
    }

    fn save(&self) -> bool {
        let state = self.state.lock();
        let (Some(index), Some(write_index)) = (&state.index, state.write_index) else {
            return false;
        };

        let resume = match write_index.checked_sub(RESUME_BACKUP) {
            Some(backup) if backup > 0 => match index.next_i_frame(backup, false, false) {
                Some((resume, _)) => resume,
                None => 0,
            },
            _ => 0,
        };

        match IndexFile::store_resume(&self.dir, resume) {
            Ok(()) => {
                debug!(index = resume, "Resume position saved");
                true
            }
            Err(e) => {
                error!("Couldn't save the resume position: {}", e);
                false
            }
        }
    }

    /// Throws away everything between the disk and the screen. Reading restarts at the
    /// frame the decoder most likely shows.
    fn empty(&self, state: &mut EngineState, device: &Device) {
        self.reader.clear();

        let forward = state.direction == Direction::Forward;
        state.read_index = state.back_trace.get(forward).or(state.write_index);
        state.read_frame = None;
        state.play_frame = None;
        state.frames.clear();
        state.back_trace.clear();
        state.first_packet = true;
        state.generation += 1;

        device.clear();
    }

    fn play(&self, state: &mut EngineState, device: &Device) {
        if state.mode == TrickMode::Play {
            return;
        }

        if matches!(state.mode, TrickMode::Still | TrickMode::Fast) || state.is_slow_backward() {
            self.empty(state, device);
        }

        device.play();
        state.mode = TrickMode::Play;
        state.direction = Direction::Forward;
    }

    fn pause(&self, state: &mut EngineState, device: &Device) {
        if matches!(state.mode, TrickMode::Pause | TrickMode::Still) {
            self.play(state, device);
            return;
        }

        if state.mode == TrickMode::Fast || state.is_slow_backward() {
            self.empty(state, device);
        }

        device.freeze();
        state.mode = TrickMode::Pause;
    }

    fn trick_speed(&self, state: &mut EngineState, device: &Device, increment: isize) {
        let Some(next) = state
            .trick_speed
            .checked_add_signed(increment)
            .filter(|&next| next < SPEEDS.len())
        else {
            return;
        };

        match SPEEDS[next] {
            0 => {}
            1 => {
                state.trick_speed = next;
                if state.mode == TrickMode::Fast {
                    self.play(state, device);
                } else {
                    self.pause(state, device);
                }
            }
            speed => {
                state.trick_speed = next;

                let mult = if state.mode == TrickMode::Slow && state.direction == Direction::Forward
                {
                    1
                } else {
                    SPEED_MULT
                };
                let speed = if speed > 0 { mult / speed } else { -speed * mult };

                device.trick_speed(speed.min(MAX_VIDEO_SLOWMOTION));
            }
        }
    }

    fn start_trick(
        &self,
        state: &mut EngineState,
        device: &Device,
        mode: TrickMode,
        direction: Direction,
    ) {
        if mode == TrickMode::Fast || direction == Direction::Backward {
            self.empty(state, device);
        }

        device.mute();
        state.mode = mode;
        state.direction = direction;
        state.trick_speed = NORMAL_SPEED;

        let steps = if self.multi_speed_mode { 1 } else { MAX_SPEEDS as isize };
        let increment = if mode == TrickMode::Fast { steps } else { -steps };
        self.trick_speed(state, device, increment);
    }

    fn step(&self, state: &mut EngineState, device: &Device, direction: Direction) {
        if state.index.is_none() {
            return;
        }

        let same = state.direction == direction;
        let toward = if same { 1 } else { -1 };

        match state.mode {
            TrickMode::Fast if self.multi_speed_mode => self.trick_speed(state, device, toward),
            TrickMode::Fast if same => self.play(state, device),
            TrickMode::Play | TrickMode::Fast => {
                self.start_trick(state, device, TrickMode::Fast, direction)
            }
            TrickMode::Slow if self.multi_speed_mode => self.trick_speed(state, device, -toward),
            TrickMode::Slow if same => self.pause(state, device),
            TrickMode::Slow | TrickMode::Still | TrickMode::Pause => {
                self.start_trick(state, device, TrickMode::Slow, direction)
            }
        }
    }

    /// Reads the frame at `location` through a handle of its own.
    fn read_frame_at(&self, location: &FrameLocation) -> Option<Vec<u8>> {
        let length = location.length.unwrap_or(MAX_FRAME_SIZE).min(MAX_FRAME_SIZE);

        let result = File::open(data_file_name(&self.dir, location.file_number))
            .and_then(|file| read_at(&file, location.offset, length));

        match result {
            Ok(data) if !data.is_empty() => Some(data),
            Ok(_) => None,
            Err(e) => {
                error!("Couldn't read frame at {}: {}", location.offset, e);
                None
            }
        }
    }

    fn show_still(&self, state: &EngineState, device: &Device, mut frame: Vec<u8>) {
        if state.mode == TrickMode::Pause {
            device.play();
        }

        append_sequence_end(&mut frame);

        if frame.first() == Some(&TS_SYNC_BYTE) {
            let Some(header) = &self.ts_header else {
                return;
            };

            device.reset_ts();
            for data in [&header[..], &frame[..]] {
                if let Err(e) = device.play_ts(data, true) {
                    error!("Couldn't play the still picture: {}", e);
                    return;
                }
            }
        } else {
            device.still_picture(&frame);
        }
    }
}

/// Reads the head of a recording. Transport stream recordings keep their PAT and PMT
/// there, which has to be played before any other data.
fn ts_header(file: &File) -> io::Result<Option<Bytes>> {
    let head = read_at(file, 0, 2 * TS_SIZE)?;

    Ok(is_ts_recording(&head).then(|| Bytes::from(head)))
}

/// Plays a recording on the primary device, with fast and slow motion in both directions,
/// pausing and jumping around.
pub struct TrickPlayEngine {
    shared: Arc<Shared>,
    device: Arc<Device>,
    player: Arc<dyn Player>,
}

impl TrickPlayEngine {
    /// Starts replaying the recording in `dir`. `still_recording` tells whether the
    /// recording is still being written to.
    pub fn start(
        device: Arc<Device>,
        dir: &Path,
        multi_speed_mode: bool,
        still_recording: Arc<AtomicBool>,
    ) -> anyhow::Result<Self> {
        let file = open_data_file(dir, 1)
            .with_context(|| format!("Couldn't open the recording {}", dir.display()))?;

        let index = match IndexFile::open(dir) {
            Ok(index) => Some(index),
            Err(e) => {
                warn!("No index for {}, trick modes are off: {}", dir.display(), e);
                None
            }
        };

        let ts_header = ts_header(&file.file)
            .with_context(|| format!("Couldn't read the recording {}", dir.display()))?;

        let shared = Arc::new(Shared {
            dir: dir.to_path_buf(),
            ts_header,
            multi_speed_mode,
            still_recording,
            reader: NonBlockingReader::start()?,
            device: Arc::downgrade(&device),
            state: Mutex::new(EngineState::new(index, file)),
            worker: Mutex::new(None),
        });

        {
            let mut state = shared.state.lock();
            if let Some(index) = shared.resume(&mut state) {
                state.read_index = Some(index);
                info!(index, "Resuming replay at {}", index_to_hmsf(index));
            }
        }

        let player: Arc<dyn Player> = Arc::new(ReplayPlayer(shared.clone()));
        if !device.attach_player(player.clone()) {
            bail!("Device {} can't replay", device.number());
        }

        info!(
            device = device.number(),
            ts = shared.ts_header.is_some(),
            "Replaying {}",
            dir.display(),
        );

        Ok(Self {
            shared,
            device,
            player,
        })
    }

    /// Whether frames are still being played.
    pub fn is_active(&self) -> bool {
        self.shared
            .worker
            .lock()
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
    }

    pub fn play(&self) {
        let mut state = self.shared.state.lock();
        self.shared.play(&mut state, &self.device);
    }

    /// Pauses, or resumes if already paused.
    pub fn pause(&self) {
        let mut state = self.shared.state.lock();
        self.shared.pause(&mut state, &self.device);
    }

    pub fn forward(&self) {
        let mut state = self.shared.state.lock();
        self.shared.step(&mut state, &self.device, Direction::Forward);
    }

    pub fn backward(&self) {
        let mut state = self.shared.state.lock();
        self.shared.step(&mut state, &self.device, Direction::Backward);
    }

    /// The I-frame `frames` frames away from the current one.
    pub fn skip_frames(&self, frames: i32) -> Option<usize> {
        if frames == 0 {
            return None;
        }

        let (current, _) = self.get_index(true)?;

        let state = self.shared.state.lock();
        let index = state.index.as_ref()?;

        let target = current as i64 + i64::from(frames) - i64::from(frames.signum());
        let target = usize::try_from(target).unwrap_or(0);

        Some(
            index
                .next_i_frame(target, frames > 0, false)
                .map_or(current, |(found, _)| found),
        )
    }

    /// Jumps `seconds` forward (or backward) and plays from there.
    pub fn skip_seconds(&self, seconds: i32) {
        let mut state = self.shared.state.lock();
        if seconds == 0 || state.index.is_none() {
            return;
        }

        self.shared.empty(&mut state, &self.device);

        if let Some(write_index) = state.write_index {
            let offset = i64::from(seconds) * FRAMES_PER_SEC as i64;
            let target = usize::try_from(write_index as i64 + offset).unwrap_or(0);

            let found = match target {
                0 => Some(0),
                target => state
                    .index
                    .as_ref()
                    .and_then(|index| index.next_i_frame(target, false, true))
                    .map(|(found, _)| found),
            };

            if let Some(found) = found {
                state.read_index = found.checked_sub(1);
                state.write_index = state.read_index;
            }
        }

        self.shared.play(&mut state, &self.device);
    }

    /// Moves to the I-frame at or before `position`, showing it as a still picture if
    /// `still` is set.
    pub fn goto(&self, position: usize, still: bool) {
        let mut state = self.shared.state.lock();
        if state.index.is_none() {
            return;
        }

        self.shared.empty(&mut state, &self.device);

        let found = state
            .index
            .as_ref()
            .and_then(|index| index.next_i_frame(position.saturating_add(1), false, false));

        if let Some((_, location)) = found {
            let positioned =
                state.seek_file(&self.shared.dir, location.file_number, location.offset);

            if positioned && still {
                if let Some(frame) = self.shared.read_frame_at(&location) {
                    self.shared.show_still(&state, &self.device, frame);
                }
                state.mode = TrickMode::Still;
            }
        }

        state.read_index = found.map(|(index, _)| index);
        state.write_index = state.read_index;
    }

    /// The current frame and the last one of the recording. With `snap`, the current
    /// frame is the closest I-frame.
    pub fn get_index(&self, snap: bool) -> Option<(usize, usize)> {
        let state = self.shared.state.lock();
        let index = state.index.as_ref()?;

        let current = if state.mode == TrickMode::Still {
            state.read_index.unwrap_or(0)
        } else {
            let current = state.write_index.unwrap_or(0);
            if snap {
                let before = index.next_i_frame(current + 1, false, false);
                let after = index.next_i_frame(current, true, false);

                match (before, after) {
                    (Some((before, _)), Some((after, _))) => {
                        if current - before <= after - current {
                            before
                        } else {
                            after
                        }
                    }
                    (Some((found, _)), None) | (None, Some((found, _))) => found,
                    (None, None) => current,
                }
            } else {
                current
            }
        };

        Some((current, index.last().unwrap_or(0)))
    }

    pub fn get_replay_mode(&self) -> ReplayMode {
        let state = self.shared.state.lock();

        let speed = matches!(state.mode, TrickMode::Fast | TrickMode::Slow)
            .then(|| state.trick_speed.abs_diff(NORMAL_SPEED));

        ReplayMode {
            play: !matches!(state.mode, TrickMode::Pause | TrickMode::Still),
            forward: state.direction == Direction::Forward,
            speed,
        }
    }
}

impl Drop for TrickPlayEngine {
    fn drop(&mut self) {
        self.device.detach_player_if(&self.player);

        // A player replaced by another one was stopped when it was detached.
        if let Some(mut worker) = self.shared.worker.lock().take() {
            worker.stop(DEFAULT_STOP_DEADLINE);
        }

        self.shared.save();
        info!(device = self.device.number(), "Replay stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;
    use std::io::Write as _;

    use pvrd_mpeg::index::{INDEX_FILE_NAME, IndexRecord};

    use super::*;
    use crate::config::SetupConfig;
    use crate::device::mock::{MockBackend, MockCall, MockState};

    const FRAME_SIZE: usize = 200;

    fn video_pes(index: usize) -> Vec<u8> {
        let mut packet = vec![0x00, 0x00, 0x01, 0xE0];
        packet.extend_from_slice(&((FRAME_SIZE - 6) as u16).to_be_bytes());
        packet.extend_from_slice(&[0x80, 0x00, 0x00]);
        packet.resize(FRAME_SIZE, (index as u8).wrapping_add(0x10));
        packet
    }

    /// Writes a recording with an I-frame every third frame.
    fn recording(dir: &Path, frames: usize) -> Vec<u8> {
        let mut data = Vec::new();
        let mut index = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(dir.join(INDEX_FILE_NAME))
            .unwrap();

        for i in 0..frames {
            IndexRecord {
                offset: data.len() as u32,
                picture_type: if i % 3 == 0 {
                    PictureType::I
                } else {
                    PictureType::P
                },
                file_number: 1,
            }
            .write(&mut index)
            .unwrap();

            data.extend(video_pes(i));
        }

        File::create(data_file_name(dir, 1))
            .unwrap()
            .write_all(&data)
            .unwrap();

        data
    }

    fn replay_device() -> (Arc<Device>, Arc<Mutex<MockState>>) {
        let backend = MockBackend::new().with_decoder();
        let mock = backend.state();
        let device = Device::open(0, Box::new(backend), Arc::new(SetupConfig::default()), None)
            .unwrap();

        (device, mock)
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..500 {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        false
    }

    #[test]
    fn test_frame_ring_budget() {
        let frame = |size: usize| Frame {
            data: Bytes::from(vec![0; size]),
            index: None,
        };

        let mut ring = FrameRing::new(100);
        assert!(ring.put(frame(150)).is_ok());
        assert!(ring.put(frame(10)).is_err());

        assert_eq!(ring.get().map(|frame| frame.data.len()), Some(150));
        assert!(ring.put(frame(60)).is_ok());
        assert!(ring.put(frame(40)).is_ok());
        assert!(ring.put(frame(1)).is_err());
    }

    #[test]
    fn test_replay_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let data = recording(dir.path(), 6);
        let (device, mock) = replay_device();

        let engine =
            TrickPlayEngine::start(device.clone(), dir.path(), true, Arc::default()).unwrap();
        assert!(device.is_replaying());

        assert!(wait_until(|| mock.lock().video == data));
        assert!(wait_until(|| engine.get_index(false) == Some((5, 5))));
        assert!(wait_until(|| !engine.is_active()));
        assert_eq!(
            engine.get_replay_mode(),
            ReplayMode {
                play: true,
                forward: true,
                speed: None,
            },
        );

        drop(engine);
        assert!(!device.is_replaying());
        assert_eq!(IndexFile::read_resume(dir.path()), Some(0));
    }

    #[test]
    fn test_goto_still_picture() {
        let dir = tempfile::tempdir().unwrap();
        recording(dir.path(), 9);
        let (device, mock) = replay_device();
        mock.lock().busy = true;

        let engine = TrickPlayEngine::start(device, dir.path(), true, Arc::default()).unwrap();
        engine.goto(4, true);

        assert!(mock.lock().calls.contains(&MockCall::StillPicture(FRAME_SIZE + 13)));
        assert_eq!(engine.get_index(false), Some((3, 8)));
        assert_eq!(
            engine.get_replay_mode(),
            ReplayMode {
                play: false,
                forward: true,
                speed: None,
            },
        );

        engine.play();
        assert!(engine.get_replay_mode().play);
        assert_eq!(mock.lock().calls.last(), Some(&MockCall::Play));
    }

    #[test]
    fn test_trick_speeds() {
        let dir = tempfile::tempdir().unwrap();
        recording(dir.path(), 9);
        let (device, mock) = replay_device();
        mock.lock().busy = true;

        let engine = TrickPlayEngine::start(device, dir.path(), true, Arc::default()).unwrap();

        for _ in 0..4 {
            engine.forward();
        }

        let speeds = mock
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                MockCall::TrickSpeed(speed) => Some(*speed),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(speeds, vec![6, 3, 1]);
        assert_eq!(engine.get_replay_mode().speed, Some(3));

        engine.pause();
        assert_eq!(mock.lock().calls.last(), Some(&MockCall::Freeze));
        assert!(!engine.get_replay_mode().play);

        engine.forward();
        assert_eq!(mock.lock().calls.last(), Some(&MockCall::TrickSpeed(8)));
        assert_eq!(
            engine.get_replay_mode(),
            ReplayMode {
                play: true,
                forward: true,
                speed: Some(1),
            },
        );
    }

    #[test]
    fn test_fast_backward_restarts_behind_decoder() {
        let dir = tempfile::tempdir().unwrap();
        recording(dir.path(), 30);
        let (device, mock) = replay_device();
        mock.lock().busy_after = Some(10 * FRAME_SIZE);

        let engine = TrickPlayEngine::start(device, dir.path(), true, Arc::default()).unwrap();
        assert!(wait_until(|| engine.get_index(false) == Some((9, 29))));

        engine.backward();
        assert!(mock.lock().calls.contains(&MockCall::Mute));
        assert!(mock.lock().calls.contains(&MockCall::TrickSpeed(6)));
        assert_eq!(
            engine.get_replay_mode(),
            ReplayMode {
                play: true,
                forward: false,
                speed: Some(1),
            },
        );

        std::thread::sleep(Duration::from_millis(50));
        mock.lock().busy_after = None;

        assert!(wait_until(|| mock.lock().video.len() > 10 * FRAME_SIZE));
        let first = mock.lock().video[10 * FRAME_SIZE + 9] - 0x10;
        assert!(first <= 9);
    }

    #[test]
    fn test_skip_seconds() {
        let dir = tempfile::tempdir().unwrap();
        recording(dir.path(), 300);
        let (device, mock) = replay_device();
        mock.lock().busy = true;

        let engine = TrickPlayEngine::start(device, dir.path(), true, Arc::default()).unwrap();
        engine.goto(100, false);
        assert_eq!(engine.get_index(false), Some((99, 299)));

        // Lands just before the I-frame preceding the target, so that frame is next.
        engine.skip_seconds(4);
        assert_eq!(engine.get_index(false), Some((197, 299)));

        engine.goto(100, false);
        engine.skip_seconds(-2);
        assert_eq!(engine.get_index(false), Some((47, 299)));

        engine.skip_seconds(0);
        assert_eq!(engine.get_index(false), Some((47, 299)));

        engine.skip_seconds(-100);
        assert_eq!(engine.get_index(false), Some((0, 299)));
        assert!(engine.get_replay_mode().play);
    }

    #[test]
    fn test_skip_frames() {
        let dir = tempfile::tempdir().unwrap();
        recording(dir.path(), 300);
        let (device, mock) = replay_device();
        mock.lock().busy = true;

        let engine = TrickPlayEngine::start(device, dir.path(), true, Arc::default()).unwrap();
        engine.goto(100, false);

        assert_eq!(engine.skip_frames(0), None);
        assert_eq!(engine.skip_frames(5), Some(105));
        assert_eq!(engine.skip_frames(-5), Some(93));
        assert_eq!(engine.skip_frames(-1000), Some(99));

        // No I-frame after 297, so it stays put.
        engine.goto(297, false);
        assert_eq!(engine.skip_frames(1000), Some(297));

        // Skipping doesn't move the replay.
        assert_eq!(engine.get_index(false), Some((297, 299)));
    }

    #[test]
    fn test_skip_without_index() {
        let dir = tempfile::tempdir().unwrap();
        recording(dir.path(), 30);
        std::fs::remove_file(dir.path().join(INDEX_FILE_NAME)).unwrap();
        let (device, mock) = replay_device();
        mock.lock().busy = true;

        let engine = TrickPlayEngine::start(device, dir.path(), true, Arc::default()).unwrap();
        assert_eq!(engine.skip_frames(3), None);
        assert_eq!(engine.skip_frames(-3), None);

        engine.skip_seconds(5);
        engine.skip_seconds(-5);
        assert_eq!(engine.get_index(true), None);
    }

    #[test]
    fn test_skip_with_empty_index() {
        let dir = tempfile::tempdir().unwrap();
        recording(dir.path(), 30);
        File::create(dir.path().join(INDEX_FILE_NAME)).unwrap();
        let (device, mock) = replay_device();
        mock.lock().busy = true;

        let engine = TrickPlayEngine::start(device, dir.path(), true, Arc::default()).unwrap();
        assert_eq!(engine.get_index(true), Some((0, 0)));
        assert_eq!(engine.skip_frames(3), Some(0));
        assert_eq!(engine.skip_frames(-3), Some(0));

        engine.skip_seconds(5);
        engine.skip_seconds(-5);
        assert_eq!(engine.get_index(false), Some((0, 0)));
    }

    #[test]
    fn test_resume_position() {
        let dir = tempfile::tempdir().unwrap();
        recording(dir.path(), 300);
        IndexFile::store_resume(dir.path(), 290).unwrap();

        let (device, mock) = replay_device();
        mock.lock().busy = true;

        let engine = TrickPlayEngine::start(device, dir.path(), true, Arc::default()).unwrap();
        engine.goto(280, false);
        assert_eq!(engine.get_index(false), Some((279, 299)));

        // Ten seconds back, then the I-frame before that.
        drop(engine);
        assert_eq!(IndexFile::read_resume(dir.path()), Some(27));
    }
}
