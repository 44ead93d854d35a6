#[cfg(feature = "dvb")]
pub mod dvb;
pub mod simulated;

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::{Channel, Source, TuningParams};
use crate::config::SetupConfig;
use crate::diseqc::{DiseqcAction, DiseqcCommands, DiseqcTable};
use crate::worker::{DEFAULT_STOP_DEADLINE, Worker};

const STATUS_POLL: Duration = Duration::from_millis(10);
const IDLE_WAIT: Duration = Duration::from_millis(1000);
const TIMEOUT_REPORT_INTERVAL: Duration = Duration::from_secs(60);

pub const DEFAULT_TUNE_TIMEOUT: Duration = Duration::from_millis(9000);
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(2000);

#[derive(Copy, Clone, Debug, Deserialize, Eq, PartialEq, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum FrontendKind {
    Satellite,
    Cable,
    Terrestrial,
}

impl FrontendKind {
    pub fn provides(&self, source: &Source) -> bool {
        match self {
            Self::Satellite => source.is_satellite(),
            Self::Cable => source.is_cable(),
            Self::Terrestrial => source.is_terrestrial(),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct FrontendStatus {
    pub has_lock: bool,

    /// The frontend lost its settings and has to be programmed again.
    pub reinit: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Voltage {
    V13,
    V18,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Tone {
    Off,
    On,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Burst {
    A,
    B,
}

/// What the frontend is programmed with. Frequencies are kHz (satellite IF) or Hz.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FrontendParams {
    pub frequency: u32,
    pub symbol_rate: u32,
    pub tuning: TuningParams,
}

/// The tuning part of a receiving device.
pub trait Frontend: Send {
    fn kind(&self) -> FrontendKind;

    /// Waits up to `timeout` for a status change and reports the current status.
    fn read_status(&mut self, timeout: Duration) -> anyhow::Result<FrontendStatus>;

    fn set_frontend(&mut self, params: &FrontendParams) -> anyhow::Result<()>;

    fn set_voltage(&mut self, voltage: Voltage) -> anyhow::Result<()>;

    fn set_tone(&mut self, tone: Tone) -> anyhow::Result<()>;

    fn send_burst(&mut self, burst: Burst) -> anyhow::Result<()>;

    fn send_master_cmd(&mut self, cmd: &[u8]) -> anyhow::Result<()>;
}

#[derive(Copy, Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum TunerStatus {
    Idle,
    Set,
    Tuned,
    Locked,
}

#[derive(Copy, Clone, Debug)]
pub struct Lnb {
    pub slof: u32,
    pub lo: u32,
    pub hi: u32,
}

#[derive(Clone, Debug)]
pub struct TunerSettings {
    pub lnb: Lnb,

    /// Set when the dish is switched through DiSEqC.
    pub diseqc: Option<Arc<DiseqcTable>>,
    pub tune_timeout: Duration,
    pub lock_timeout: Duration,
}

impl TunerSettings {
    pub fn from_setup(setup: &SetupConfig, diseqc: Option<Arc<DiseqcTable>>) -> Self {
        Self {
            lnb: Lnb {
                slof: setup.lnb_slof,
                lo: setup.lnb_frequ_lo,
                hi: setup.lnb_frequ_hi,
            },
            diseqc: diseqc.filter(|_| setup.diseqc),
            tune_timeout: DEFAULT_TUNE_TIMEOUT,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

struct State {
    status: TunerStatus,
    channel: Option<Channel>,
    diseqc_cmd: Option<Vec<u8>>,
}

struct Shared {
    state: Mutex<State>,
    new_set: Condvar,
    locked: Condvar,
}

/// Drives a frontend from its own thread, keeping it tuned to the requested channel.
pub struct Tuner {
    device: usize,
    kind: FrontendKind,
    shared: Arc<Shared>,
    worker: Worker,
}

impl Tuner {
    /// Starts driving `frontend` for the device with the given number.
    pub fn spawn(
        device: usize,
        frontend: Box<dyn Frontend>,
        settings: TunerSettings,
    ) -> anyhow::Result<Self> {
        let kind = frontend.kind();
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                status: TunerStatus::Idle,
                channel: None,
                diseqc_cmd: None,
            }),
            new_set: Condvar::new(),
            locked: Condvar::new(),
        });

        let driver = Driver {
            device,
            frontend,
            settings,
            shared: shared.clone(),
            diseqc_commands: None,
            last_timeout_report: None,
            lost_lock: false,
        };

        let worker = Worker::spawn(format!("tuner-{}", device), move |token| driver.run(token))?;

        Ok(Self {
            device,
            kind,
            shared,
            worker,
        })
    }

    pub fn kind(&self) -> FrontendKind {
        self.kind
    }

    pub fn status(&self) -> TunerStatus {
        self.shared.state.lock().status
    }

    /// Whether the frontend has a lock on the transponder of `channel`.
    pub fn is_tuned_to(&self, channel: &Channel) -> bool {
        let state = self.shared.state.lock();

        state.status == TunerStatus::Locked
            && state
                .channel
                .as_ref()
                .is_some_and(|current| current.has_same_tuning(channel))
    }

    /// Makes `channel` the current one. The frontend is only reprogrammed with `tune`.
    pub fn set(&self, channel: &Channel, tune: bool) {
        let mut state = self.shared.state.lock();

        if tune {
            state.status = TunerStatus::Set;
        }

        state.channel = Some(channel.clone());
        self.shared.new_set.notify_all();
    }

    /// Blocks up to `timeout` until the frontend reports a lock.
    pub fn wait_for_lock(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();

        while state.status != TunerStatus::Locked {
            if self
                .shared
                .locked
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.status == TunerStatus::Locked;
            }
        }

        true
    }

    /// Queues a raw DiSEqC master command. Refused while another one is pending.
    pub fn send_diseqc_cmd(&self, cmd: &[u8]) -> bool {
        if self.kind != FrontendKind::Satellite {
            return false;
        }

        let mut state = self.shared.state.lock();
        if state.diseqc_cmd.is_some() {
            return false;
        }

        state.diseqc_cmd = Some(cmd.to_vec());
        self.shared.new_set.notify_all();
        true
    }
}

impl Drop for Tuner {
    fn drop(&mut self) {
        self.shared.state.lock().status = TunerStatus::Idle;
        self.worker.token().cancel();
        self.shared.new_set.notify_all();

        if !self.worker.stop(DEFAULT_STOP_DEADLINE) {
            warn!("Frontend {} didn't shut down", self.device);
        }
    }
}

struct Driver {
    device: usize,
    frontend: Box<dyn Frontend>,
    settings: TunerSettings,
    shared: Arc<Shared>,
    diseqc_commands: Option<String>,
    last_timeout_report: Option<Instant>,
    lost_lock: bool,
}

impl Driver {
    /// Logs a tune timeout, at most once per [`TIMEOUT_REPORT_INTERVAL`].
    fn report_timeout(&mut self, number: u32, transponder: u32) {
        if self
            .last_timeout_report
            .is_some_and(|last| last.elapsed() <= TIMEOUT_REPORT_INTERVAL)
        {
            return;
        }

        warn!(
            "Frontend {} timed out while tuning to channel {}, tp {}",
            self.device, number, transponder,
        );
        self.last_timeout_report = Some(Instant::now());
    }

    fn run(mut self, token: CancellationToken) {
        if self.frontend.kind() == FrontendKind::Satellite {
            if let Err(e) = self.frontend.set_voltage(Voltage::V13) {
                error!("Frontend {} couldn't set the voltage: {}", self.device, e);
            }
        }

        let shared = self.shared.clone();
        let mut timer = Instant::now();

        while !token.is_cancelled() {
            let status = match self.frontend.read_status(STATUS_POLL) {
                Ok(status) => status,
                Err(e) => {
                    debug!("Frontend {} status unavailable: {}", self.device, e);
                    FrontendStatus::default()
                }
            };

            let mut state = shared.state.lock();

            if let Some(cmd) = state.diseqc_cmd.take() {
                if let Err(e) = self.frontend.send_master_cmd(&cmd) {
                    error!("Frontend {} couldn't send DiSEqC command: {}", self.device, e);
                }
            }

            let (number, transponder) = state
                .channel
                .as_ref()
                .map(|channel| (channel.number, channel.transponder()))
                .unwrap_or_default();

            match state.status {
                TunerStatus::Idle => {}
                TunerStatus::Set => {
                    let tuned = match state.channel.clone() {
                        Some(channel) => self.set_frontend(&channel),
                        None => false,
                    };

                    state.status = if tuned {
                        TunerStatus::Tuned
                    } else {
                        TunerStatus::Idle
                    };
                    timer = Instant::now() + self.settings.tune_timeout;
                    continue;
                }
                TunerStatus::Tuned if Instant::now() >= timer => {
                    state.status = TunerStatus::Set;
                    self.diseqc_commands = None;

                    self.report_timeout(number, transponder);
                    continue;
                }
                TunerStatus::Tuned | TunerStatus::Locked => {
                    if status.reinit {
                        state.status = TunerStatus::Set;
                        self.diseqc_commands = None;
                        self.last_timeout_report = None;

                        info!("Frontend {} was reinitialized", self.device);
                        continue;
                    } else if status.has_lock {
                        if self.lost_lock {
                            info!(
                                "Frontend {} regained lock on channel {}, tp {}",
                                self.device, number, transponder,
                            );
                            self.lost_lock = false;
                        }

                        state.status = TunerStatus::Locked;
                        self.last_timeout_report = None;
                        shared.locked.notify_all();
                    } else if state.status == TunerStatus::Locked {
                        self.lost_lock = true;
                        info!(
                            "Frontend {} lost lock on channel {}, tp {}",
                            self.device, number, transponder,
                        );

                        state.status = TunerStatus::Tuned;
                        timer = Instant::now() + self.settings.lock_timeout;
                        self.last_timeout_report = None;
                        continue;
                    }
                }
            }

            if state.status != TunerStatus::Tuned && !token.is_cancelled() {
                shared.new_set.wait_for(&mut state, IDLE_WAIT);
            }
        }
    }

    fn set_frontend(&mut self, channel: &Channel) -> bool {
        let kind = self.frontend.kind();

        let params = match kind {
            FrontendKind::Satellite => {
                let mut frequency = channel.frequency;

                if let Some(table) = self.settings.diseqc.clone() {
                    let diseqc = table
                        .get(self.device, channel.source, frequency, channel.polarization)
                        .or_else(|| {
                            table.get(
                                self.device,
                                Source::Satellite(None),
                                frequency,
                                channel.polarization,
                            )
                        });

                    let Some(diseqc) = diseqc else {
                        error!(
                            "No DiSEqC parameters found for channel {} on frontend {}",
                            channel, self.device,
                        );
                        return false;
                    };

                    if self.diseqc_commands.as_deref() != Some(diseqc.commands.as_str()) {
                        self.execute_diseqc(&diseqc.commands);
                        self.diseqc_commands = Some(diseqc.commands.to_string());
                    }

                    frequency = frequency.abs_diff(diseqc.lof);
                } else {
                    let lnb = self.settings.lnb;
                    let tone = if frequency < lnb.slof {
                        frequency = frequency.abs_diff(lnb.lo);
                        Tone::Off
                    } else {
                        frequency = frequency.abs_diff(lnb.hi);
                        Tone::On
                    };
                    let voltage = if channel.polarization.is_low_voltage() {
                        Voltage::V13
                    } else {
                        Voltage::V18
                    };

                    if let Err(e) = self.frontend.set_tone(tone) {
                        error!("Frontend {} couldn't set the tone: {}", self.device, e);
                    }
                    if let Err(e) = self.frontend.set_voltage(voltage) {
                        error!("Frontend {} couldn't set the voltage: {}", self.device, e);
                    }
                }

                FrontendParams {
                    frequency: frequency * 1000,
                    symbol_rate: channel.symbol_rate * 1000,
                    tuning: channel.tuning,
                }
            }
            FrontendKind::Cable | FrontendKind::Terrestrial => FrontendParams {
                frequency: frequency_to_hz(channel.frequency),
                symbol_rate: channel.symbol_rate * 1000,
                tuning: channel.tuning,
            },
        };

        debug!(
            frequency = params.frequency,
            symbol_rate = params.symbol_rate,
            "Tuning frontend {} ({}) to channel {}",
            self.device,
            kind,
            channel,
        );

        if let Err(e) = self.frontend.set_frontend(&params) {
            error!("Frontend {} couldn't tune: {}", self.device, e);
            return false;
        }

        true
    }

    fn execute_diseqc(&mut self, commands: &DiseqcCommands) {
        debug!("Frontend {} executing DiSEqC '{}'", self.device, commands);

        for action in commands.actions() {
            let result = match action {
                DiseqcAction::ToneOff => self.frontend.set_tone(Tone::Off),
                DiseqcAction::ToneOn => self.frontend.set_tone(Tone::On),
                DiseqcAction::Voltage13 => self.frontend.set_voltage(Voltage::V13),
                DiseqcAction::Voltage18 => self.frontend.set_voltage(Voltage::V18),
                DiseqcAction::MiniA => self.frontend.send_burst(Burst::A),
                DiseqcAction::MiniB => self.frontend.send_burst(Burst::B),
                DiseqcAction::Wait(duration) => {
                    std::thread::sleep(*duration);
                    Ok(())
                }
                DiseqcAction::Command(cmd) => self.frontend.send_master_cmd(cmd),
            };

            if let Err(e) = result {
                error!("Frontend {} DiSEqC action {:?} failed: {}", self.device, action, e);
            }
        }
    }
}

/// Cable and terrestrial frequencies may be given in MHz, kHz or Hz.
pub fn frequency_to_hz(mut frequency: u32) -> u32 {
    if frequency == 0 {
        return 0;
    }

    while frequency < 1_000_000 {
        frequency *= 1000;
    }

    frequency
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Polarization;
    use crate::channel::tests::satellite_channel;
    use crate::diseqc::Diseqc;
    use crate::tuner::simulated::SimulatedFrontend;

    #[derive(Clone, Debug, Eq, PartialEq)]
    enum Call {
        Voltage(Voltage),
        Tone(Tone),
        Burst(Burst),
        Command(Vec<u8>),
        Tune(FrontendParams),
    }

    /// Records every call and never locks.
    struct RecordingFrontend {
        calls: Arc<Mutex<Vec<Call>>>,
    }

    impl Frontend for RecordingFrontend {
        fn kind(&self) -> FrontendKind {
            FrontendKind::Satellite
        }

        fn read_status(&mut self, timeout: Duration) -> anyhow::Result<FrontendStatus> {
            std::thread::sleep(timeout);
            Ok(FrontendStatus::default())
        }

        fn set_frontend(&mut self, params: &FrontendParams) -> anyhow::Result<()> {
            self.calls.lock().push(Call::Tune(*params));
            Ok(())
        }

        fn set_voltage(&mut self, voltage: Voltage) -> anyhow::Result<()> {
            self.calls.lock().push(Call::Voltage(voltage));
            Ok(())
        }

        fn set_tone(&mut self, tone: Tone) -> anyhow::Result<()> {
            self.calls.lock().push(Call::Tone(tone));
            Ok(())
        }

        fn send_burst(&mut self, burst: Burst) -> anyhow::Result<()> {
            self.calls.lock().push(Call::Burst(burst));
            Ok(())
        }

        fn send_master_cmd(&mut self, cmd: &[u8]) -> anyhow::Result<()> {
            self.calls.lock().push(Call::Command(cmd.to_vec()));
            Ok(())
        }
    }

    fn settings(diseqc: Option<Arc<DiseqcTable>>) -> TunerSettings {
        TunerSettings {
            lnb: Lnb {
                slof: 11700,
                lo: 9750,
                hi: 10600,
            },
            diseqc,
            tune_timeout: DEFAULT_TUNE_TIMEOUT,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_lock_acquisition() {
        let frontend = SimulatedFrontend::new(FrontendKind::Satellite, Duration::from_millis(500));
        let tuner = Tuner::spawn(1, Box::new(frontend), settings(None)).unwrap();
        let channel = satellite_channel(1, 11_837, Polarization::Horizontal);

        assert_eq!(tuner.status(), TunerStatus::Idle);

        tuner.set(&channel, true);
        assert!(!tuner.is_tuned_to(&channel));

        assert!(wait_until(|| tuner.status() == TunerStatus::Tuned));
        assert!(!tuner.is_tuned_to(&channel));

        assert!(tuner.wait_for_lock(Duration::from_millis(2000)));
        assert_eq!(tuner.status(), TunerStatus::Locked);
        assert!(tuner.is_tuned_to(&channel));

        let other = satellite_channel(2, 12_188, Polarization::Horizontal);
        assert!(!tuner.is_tuned_to(&other));
    }

    #[test]
    fn test_wait_for_lock_times_out() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let frontend = RecordingFrontend {
            calls: calls.clone(),
        };
        let tuner = Tuner::spawn(1, Box::new(frontend), settings(None)).unwrap();

        tuner.set(&satellite_channel(1, 11_837, Polarization::Horizontal), true);
        assert!(!tuner.wait_for_lock(Duration::from_millis(100)));
    }

    #[test]
    fn test_retries_after_tune_timeout() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let frontend = RecordingFrontend {
            calls: calls.clone(),
        };
        let mut settings = settings(None);
        settings.tune_timeout = Duration::from_millis(50);

        let tuner = Tuner::spawn(1, Box::new(frontend), settings).unwrap();
        tuner.set(&satellite_channel(1, 11_837, Polarization::Horizontal), true);

        assert!(wait_until(|| {
            calls
                .lock()
                .iter()
                .filter(|call| matches!(call, Call::Tune(_)))
                .count()
                >= 3
        }));
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_tune_timeout_warns_once_per_interval() {
        let mut driver = Driver {
            device: 1,
            frontend: Box::new(RecordingFrontend {
                calls: Arc::new(Mutex::new(Vec::new())),
            }),
            settings: settings(None),
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    status: TunerStatus::Idle,
                    channel: None,
                    diseqc_cmd: None,
                }),
                new_set: Condvar::new(),
                locked: Condvar::new(),
            }),
            diseqc_commands: None,
            last_timeout_report: None,
            lost_lock: false,
        };

        let logs = LogBuffer::default();
        let subscriber = {
            let logs = logs.clone();
            tracing_subscriber::fmt()
                .with_writer(move || logs.clone())
                .with_ansi(false)
                .with_max_level(tracing::Level::WARN)
                .finish()
        };

        tracing::subscriber::with_default(subscriber, || {
            driver.report_timeout(7, 11_837);
            driver.report_timeout(7, 11_837);
        });

        let output = String::from_utf8(logs.0.lock().clone()).unwrap();
        assert_eq!(output.matches("timed out while tuning to channel 7").count(), 1);
        assert!(output.contains("WARN"));
    }

    #[test]
    fn test_lnb_switching() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let frontend = RecordingFrontend {
            calls: calls.clone(),
        };
        let tuner = Tuner::spawn(1, Box::new(frontend), settings(None)).unwrap();

        tuner.set(&satellite_channel(1, 12_188, Polarization::Horizontal), true);
        assert!(wait_until(|| tuner.status() == TunerStatus::Tuned));

        let calls = calls.lock().clone();
        assert_eq!(calls[0], Call::Voltage(Voltage::V13));
        assert_eq!(calls[1], Call::Tone(Tone::On));
        assert_eq!(calls[2], Call::Voltage(Voltage::V18));
        assert!(matches!(
            calls[3],
            Call::Tune(FrontendParams {
                frequency: 1_588_000,
                symbol_rate: 27_500_000,
                ..
            }),
        ));
    }

    #[test]
    fn test_diseqc_commands_are_cached() {
        let table = DiseqcTable::new(vec![Diseqc {
            source: "S19.2E".parse().unwrap(),
            slof: 11700,
            polarization: Polarization::Vertical,
            lof: 9750,
            commands: DiseqcCommands::parse("t v [E0 10 38 F0] A").unwrap(),
            devices: vec![],
        }]);

        let calls = Arc::new(Mutex::new(Vec::new()));
        let frontend = RecordingFrontend {
            calls: calls.clone(),
        };
        let tuner = Tuner::spawn(1, Box::new(frontend), settings(Some(Arc::new(table)))).unwrap();

        let first = satellite_channel(1, 11_000, Polarization::Vertical);
        let second = satellite_channel(2, 11_300, Polarization::Vertical);

        tuner.set(&first, true);
        assert!(wait_until(|| tuner.status() == TunerStatus::Tuned));
        tuner.set(&second, true);
        assert!(wait_until(|| {
            calls
                .lock()
                .iter()
                .any(|call| matches!(call, Call::Tune(params) if params.frequency == 1_550_000))
        }));

        let calls = calls.lock().clone();
        let bursts = calls.iter().filter(|call| **call == Call::Burst(Burst::A)).count();
        assert_eq!(bursts, 1);
        assert!(calls.contains(&Call::Command(vec![0xE0, 0x10, 0x38, 0xF0])));
        assert!(calls.contains(&Call::Tune(FrontendParams {
            frequency: 1_250_000,
            symbol_rate: 27_500_000,
            tuning: TuningParams::default(),
        })));
    }

    #[test]
    fn test_missing_diseqc_entry_leaves_tuner_idle() {
        let table = DiseqcTable::new(vec![]);
        let frontend = SimulatedFrontend::new(FrontendKind::Satellite, Duration::ZERO);
        let tuner = Tuner::spawn(1, Box::new(frontend), settings(Some(Arc::new(table)))).unwrap();

        tuner.set(&satellite_channel(1, 11_000, Polarization::Vertical), true);
        assert!(!tuner.wait_for_lock(Duration::from_millis(200)));
        assert_eq!(tuner.status(), TunerStatus::Idle);
    }

    #[test]
    fn test_send_diseqc_cmd() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let frontend = RecordingFrontend {
            calls: calls.clone(),
        };
        let tuner = Tuner::spawn(1, Box::new(frontend), settings(None)).unwrap();

        assert!(tuner.send_diseqc_cmd(&[0xE0, 0x31, 0x6B, 0x00]));
        assert!(wait_until(|| {
            calls
                .lock()
                .contains(&Call::Command(vec![0xE0, 0x31, 0x6B, 0x00]))
        }));

        let cable = SimulatedFrontend::new(FrontendKind::Cable, Duration::ZERO);
        let tuner = Tuner::spawn(2, Box::new(cable), settings(None)).unwrap();
        assert!(!tuner.send_diseqc_cmd(&[0xE0]));
    }

    #[test]
    fn test_frequency_to_hz() {
        assert_eq!(frequency_to_hz(394), 394_000_000);
        assert_eq!(frequency_to_hz(394_000), 394_000_000);
        assert_eq!(frequency_to_hz(474_000_000), 474_000_000);
        assert_eq!(frequency_to_hz(0), 0);
    }
}
