use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, bail};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::channel::Channel;
use crate::config::{Config, SetupConfig};
use crate::device::playback::TrackType;
use crate::device::{ChannelOutcome, Device, MAX_PRIORITY, open_backend};
use crate::diseqc::DiseqcTable;
use crate::replay::TrickPlayEngine;
use crate::transfer::TransferPipe;

const SWITCH_ATTEMPTS: usize = 3;

#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum SwitchError {
    #[error("channel not available")]
    NotAvailable,

    #[error("can't start transfer mode")]
    NoTransfer,

    #[error("channel switch failed")]
    Failed,
}

/// What currently plays on the primary device.
pub enum Control {
    Transfer(TransferPipe),
    Replay(TrickPlayEngine),
}

/// The cost of using a device for a channel, compared field by field. Lower is better.
#[derive(Copy, Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct Impact {
    /// Idle, or receiving something that would have to be detached.
    pub cannot_share: bool,
    pub receiving: bool,

    /// Feeds the live view through a transfer, or is the primary device.
    pub actual: bool,
    pub primary: bool,
    pub decoder: bool,

    /// Priority offset by [`MAX_PRIORITY`] so that every valid value is positive.
    pub priority: u8,
    pub ca_methods: u8,
}

impl Impact {
    fn of(device: &Device, channel: &Channel, needs_detach: bool, actual: bool) -> Self {
        Self {
            cannot_share: !device.receiving(true) || needs_detach,
            receiving: device.receiving(false),
            actual,
            primary: device.is_primary(),
            decoder: device.has_decoder(),
            priority: (device.priority() + MAX_PRIORITY).clamp(0, u8::MAX as i32) as u8,
            ca_methods: device.provides_ca(channel).min(u8::MAX as usize) as u8,
        }
    }
}

/// Owns every device and decides which of them serves a channel.
pub struct DeviceRegistry {
    devices: Vec<Arc<Device>>,
    primary: Mutex<usize>,
    setup: Arc<SetupConfig>,
    channels: Vec<Channel>,
    control: Mutex<Option<Control>>,
    current_channel: Mutex<Option<u32>>,
}

impl DeviceRegistry {
    pub fn new(devices: Vec<Arc<Device>>, setup: Arc<SetupConfig>, channels: Vec<Channel>) -> Self {
        let registry = Self {
            devices,
            primary: Mutex::new(0),
            setup,
            channels,
            control: Mutex::new(None),
            current_channel: Mutex::new(None),
        };

        if !registry.set_primary_device(registry.setup.primary_device) {
            registry.set_primary_device(1);
        }

        registry
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        if config.devices.is_empty() {
            bail!("No devices are configured");
        }

        let setup = Arc::new(config.setup.clone());
        let diseqc = Arc::new(DiseqcTable::from_config(&config.diseqc)?);
        let diseqc = (!diseqc.is_empty()).then_some(diseqc);

        let devices = config
            .devices
            .iter()
            .enumerate()
            .map(|(index, device)| {
                let backend = open_backend(device)
                    .with_context(|| format!("Couldn't open device {}", index + 1))?;

                Device::open(index, backend, setup.clone(), diseqc.clone())
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let channels = config.channels.iter().map(Channel::from).collect();

        Ok(Self::new(devices, setup, channels))
    }

    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    /// Looks a device up by its 1-based number.
    pub fn device(&self, number: usize) -> Option<&Arc<Device>> {
        number.checked_sub(1).and_then(|index| self.devices.get(index))
    }

    pub fn channel(&self, number: u32) -> Option<&Channel> {
        self.channels.iter().find(|channel| channel.number == number)
    }

    pub fn current_channel(&self) -> Option<u32> {
        *self.current_channel.lock()
    }

    pub fn primary(&self) -> &Arc<Device> {
        &self.devices[*self.primary.lock()]
    }

    pub fn set_primary_device(&self, number: usize) -> bool {
        let Some(device) = self.device(number) else {
            error!("Invalid primary device number: {}", number);
            return false;
        };

        info!("Setting primary device to {}", number);

        let mut primary = self.primary.lock();
        self.devices[*primary].set_primary(false);
        device.set_primary(true);
        *primary = device.index();

        true
    }

    /// The device the live view comes from: the source of a running transfer, or the
    /// primary device.
    pub fn actual_device(&self) -> Arc<Device> {
        actual_device(self.control.lock().as_ref()).unwrap_or_else(|| self.primary().clone())
    }

    /// Finds the device that can receive `channel` with the least impact on everything
    /// else, and whether its receivers have to be detached for that.
    pub fn get_device(&self, channel: &Channel, priority: i32) -> Option<(Arc<Device>, bool)> {
        self.select_device(channel, priority, &self.actual_device())
    }

    fn select_device(
        &self,
        channel: &Channel,
        priority: i32,
        actual: &Arc<Device>,
    ) -> Option<(Arc<Device>, bool)> {
        let mut best: Option<(Impact, &Arc<Device>, bool)> = None;

        for device in &self.devices {
            let (provided, needs_detach) = device.provides_channel(channel, priority);
            if !provided {
                continue;
            }

            let impact = Impact::of(device, channel, needs_detach, Arc::ptr_eq(device, actual));
            trace!(device = device.number(), ?impact, "Device impact");

            if best.as_ref().is_none_or(|(least, _, _)| impact < *least) {
                best = Some((impact, device, needs_detach));
            }
        }

        best.map(|(_, device, needs_detach)| (device.clone(), needs_detach))
    }

    /// Switches the live view of the primary device, retrying failed attempts.
    pub fn switch_channel(&self, channel: &Channel, live_view: bool) -> Result<(), SwitchError> {
        if live_view {
            info!("Switching to channel {}", channel);
        }

        let primary = self.primary().clone();
        let mut result = Err(SwitchError::Failed);

        for attempt in 1..=SWITCH_ATTEMPTS {
            result = self.set_channel(&primary, channel, live_view);
            match result {
                Err(SwitchError::Failed) if attempt < SWITCH_ATTEMPTS => error!("Retrying"),
                _ => break,
            }
        }

        if let Err(e) = result {
            warn!(%channel, "Switching failed: {}", e);
        }

        result
    }

    /// Switches one device to `channel`, starting a transfer when the live view can't be
    /// served by the device itself.
    pub fn set_channel(
        &self,
        device: &Arc<Device>,
        channel: &Channel,
        live_view: bool,
    ) -> Result<(), SwitchError> {
        // The previous transfer still counts while the new source is chosen.
        let previous = if live_view { self.stop_replay() } else { None };

        let (provided, needs_detach) = device.provides_channel(channel, self.setup.primary_limit);
        let needs_transfer = live_view && device.is_primary() && (!provided || needs_detach);

        let result = if needs_transfer {
            let actual = actual_device(previous.as_ref()).unwrap_or_else(|| self.primary().clone());

            match self.select_device(channel, 0, &actual) {
                Some((source, needs_detach)) if device.can_replay() => {
                    debug!(from = source.number(), to = device.number(), "Transfer needed");

                    if self.set_channel(&source, channel, false).is_ok() {
                        if needs_detach {
                            source.detach_all_receivers();
                        }

                        drop(previous);
                        self.launch_transfer(&source, device, channel)
                    } else {
                        Err(SwitchError::NoTransfer)
                    }
                }
                _ => Err(SwitchError::NotAvailable),
            }
        } else {
            drop(previous);

            if needs_detach {
                device.detach_all_receivers();
            }

            match device.set_channel_device(channel, live_view) {
                Ok(ChannelOutcome::Tuned) => Ok(()),
                Ok(ChannelOutcome::StartTransfer) => self.launch_transfer(device, device, channel),
                Err(e) => {
                    error!(device = device.number(), %channel, "Couldn't set channel: {}", e);
                    Err(SwitchError::Failed)
                }
            }
        };

        if result.is_ok() && live_view && device.is_primary() {
            *self.current_channel.lock() = Some(channel.number);
            self.set_tracks(device, channel, needs_transfer);
        }

        result
    }

    fn set_tracks(&self, device: &Device, channel: &Channel, transferring: bool) {
        device.clear_tracks();

        for (i, &pid) in channel.apids.iter().enumerate() {
            let language = channel.alangs.get(i).map(String::as_str);
            device.set_available_track(TrackType::Audio(i as u8), pid, language);
        }

        if self.setup.use_dolby_digital {
            for (i, &pid) in channel.dpids.iter().enumerate() {
                let language = channel.dlangs.get(i).map(String::as_str);
                device.set_available_track(TrackType::Dolby(i as u8), pid, language);
            }
        }

        if !transferring {
            device.ensure_audio_track(true);
        }
    }

    fn launch_transfer(
        &self,
        source: &Arc<Device>,
        destination: &Arc<Device>,
        channel: &Channel,
    ) -> Result<(), SwitchError> {
        // The old transfer has to let go of the decoder first.
        drop(self.control.lock().take());

        match TransferPipe::start(source, destination, channel) {
            Ok(transfer) => {
                *self.control.lock() = Some(Control::Transfer(transfer));
                Ok(())
            }
            Err(e) => {
                error!(%channel, "Couldn't start transfer mode: {}", e);
                Err(SwitchError::NoTransfer)
            }
        }
    }

    /// Replays a recording on the primary device, ending whatever played there.
    /// `still_recording` is raised while the recorder keeps appending to it.
    pub fn start_replay(
        &self,
        dir: &Path,
        still_recording: Arc<AtomicBool>,
    ) -> anyhow::Result<()> {
        let primary = self.primary().clone();
        if !primary.can_replay() {
            bail!("Device {} can't replay", primary.number());
        }

        drop(self.stop_replay());

        let engine =
            TrickPlayEngine::start(primary, dir, self.setup.multi_speed_mode, still_recording)?;
        *self.control.lock() = Some(Control::Replay(engine));

        Ok(())
    }

    /// Ends a replay. A running transfer is handed back to the caller.
    pub fn stop_replay(&self) -> Option<Control> {
        let control = self.control.lock().take();

        match control {
            Some(Control::Replay(engine)) => {
                drop(engine);
                None
            }
            other => other,
        }
    }

    /// Runs `f` on the current replay, if there is one.
    pub fn with_replay<R>(&self, f: impl FnOnce(&TrickPlayEngine) -> R) -> Option<R> {
        match self.control.lock().as_ref() {
            Some(Control::Replay(engine)) => Some(f(engine)),
            _ => None,
        }
    }

    pub fn is_transferring(&self) -> bool {
        matches!(*self.control.lock(), Some(Control::Transfer(_)))
    }

    pub fn shutdown(&self) {
        drop(self.control.lock().take());

        for device in &self.devices {
            device.shutdown();
        }

        info!("All devices shut down");
    }
}

fn actual_device(control: Option<&Control>) -> Option<Arc<Device>> {
    match control {
        Some(Control::Transfer(transfer)) => Some(transfer.source().clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::tests::satellite_channel;
    use crate::channel::{Polarization, Source};
    use crate::device::mock::MockBackend;

    fn registry(backends: Vec<MockBackend>) -> DeviceRegistry {
        let setup = Arc::new(SetupConfig::default());
        let devices = backends
            .into_iter()
            .enumerate()
            .map(|(index, backend)| {
                Device::open(index, Box::new(backend), setup.clone(), None).unwrap()
            })
            .collect();

        DeviceRegistry::new(devices, setup, vec![])
    }

    #[test]
    fn test_replay_on_primary() {
        use pvrd_mpeg::index::{INDEX_FILE_NAME, IndexRecord, PictureType, data_file_name};

        let dir = tempfile::tempdir().unwrap();
        let mut frame = vec![0x00, 0x00, 0x01, 0xE0, 0x00, 0x05, 0x80, 0x00, 0x00, 0x10, 0x11];
        std::fs::write(data_file_name(dir.path(), 1), &frame).unwrap();

        frame.clear();
        IndexRecord {
            offset: 0,
            picture_type: PictureType::I,
            file_number: 1,
        }
        .write(&mut frame)
        .unwrap();
        std::fs::write(dir.path().join(INDEX_FILE_NAME), &frame).unwrap();

        let registry = registry(vec![
            MockBackend::new().with_frontend(),
            MockBackend::new().with_decoder(),
        ]);
        assert_eq!(registry.devices().len(), 2);
        assert!(registry.start_replay(dir.path(), Arc::default()).is_err());

        assert!(registry.set_primary_device(2));
        registry.start_replay(dir.path(), Arc::default()).unwrap();
        assert!(registry.primary().is_replaying());
        assert_eq!(registry.with_replay(|engine| engine.get_index(false)), Some(Some((0, 0))));

        assert!(registry.stop_replay().is_none());
        assert!(!registry.primary().is_replaying());
        assert!(registry.with_replay(|_| ()).is_none());

        registry.shutdown();
    }

    fn impact() -> Impact {
        Impact {
            cannot_share: false,
            receiving: false,
            actual: false,
            primary: false,
            decoder: false,
            priority: 98,
            ca_methods: 1,
        }
    }

    #[test]
    fn test_impact_order() {
        let base = impact();

        let higher_priority = Impact { priority: 149, ..base };
        assert!(base < higher_priority);

        let decoder = Impact { decoder: true, priority: 0, ..base };
        assert!(base < decoder);

        let primary = Impact { primary: true, decoder: false, ..base };
        assert!(Impact { decoder: true, ..base } < primary);

        let receiving = Impact { receiving: true, ..base };
        assert!(Impact { actual: true, primary: true, ..base } < receiving);

        let cannot_share = Impact { cannot_share: true, ..base };
        assert!(Impact { receiving: true, priority: 198, ..base } < cannot_share);

        let more_cams = Impact { ca_methods: 3, ..base };
        assert!(base < more_cams);
        assert!(more_cams < higher_priority);
    }

    #[test]
    fn test_get_device_avoids_decoder_and_primary() {
        let registry = registry(vec![
            MockBackend::new().with_frontend(),
            MockBackend::new().with_frontend().with_decoder(),
            MockBackend::new().with_frontend(),
        ]);
        assert_eq!(registry.primary().number(), 1);

        let channel = satellite_channel(1, 11_836, Polarization::Horizontal);
        let (device, needs_detach) = registry.get_device(&channel, 50).unwrap();
        assert_eq!(device.number(), 3);
        assert!(!needs_detach);

        registry.shutdown();
    }

    #[test]
    fn test_get_device_prefers_first_on_ties() {
        let registry = registry(vec![
            MockBackend::new().with_decoder(),
            MockBackend::new().with_frontend(),
            MockBackend::new().with_frontend(),
        ]);

        let channel = satellite_channel(1, 11_836, Polarization::Horizontal);
        let (device, _) = registry.get_device(&channel, 0).unwrap();
        assert_eq!(device.number(), 2);

        let mut cable = channel.clone();
        cable.source = Source::Cable;
        assert!(registry.get_device(&cable, 0).is_none());

        registry.shutdown();
    }

    #[test]
    fn test_live_view_on_primary() {
        let registry = registry(vec![MockBackend::new().with_frontend().with_decoder()]);
        let channel = satellite_channel(1, 11_836, Polarization::Horizontal);

        registry.switch_channel(&channel, true).unwrap();

        let primary = registry.primary();
        assert!(primary.has_pid(channel.vpid));
        assert!(primary.has_pid(channel.apid(0)));
        assert!(!registry.is_transferring());
        assert_eq!(registry.current_channel(), Some(1));

        registry.shutdown();
    }

    #[test]
    fn test_live_view_through_transfer() {
        let registry = registry(vec![
            MockBackend::new().with_decoder(),
            MockBackend::new().with_frontend(),
        ]);
        let channel = satellite_channel(1, 11_836, Polarization::Horizontal);

        registry.switch_channel(&channel, true).unwrap();

        assert!(registry.is_transferring());
        assert_eq!(registry.actual_device().number(), 2);
        assert!(registry.primary().is_transferring());

        let source = registry.device(2).unwrap();
        assert!(source.has_pid(channel.vpid));
        assert!(source.receiving(true));

        registry.shutdown();
        assert!(!source.has_pid(channel.vpid));
    }

    #[test]
    fn test_channel_not_available() {
        let registry = registry(vec![
            MockBackend::new().with_decoder(),
            MockBackend::new().with_frontend(),
        ]);
        let mut channel = satellite_channel(1, 11_836, Polarization::Horizontal);
        channel.source = Source::Terrestrial;

        assert_eq!(registry.switch_channel(&channel, true), Err(SwitchError::NotAvailable));
        assert_eq!(registry.current_channel(), None);

        registry.shutdown();
    }

    #[test]
    fn test_no_transfer_without_decoder() {
        let registry = registry(vec![MockBackend::new(), MockBackend::new().with_frontend()]);
        let channel = satellite_channel(1, 11_836, Polarization::Horizontal);

        assert_eq!(registry.switch_channel(&channel, true), Err(SwitchError::NotAvailable));
        assert!(!registry.is_transferring());

        registry.shutdown();
    }

    #[test]
    fn test_set_primary_device() {
        let registry = registry(vec![MockBackend::new(), MockBackend::new()]);

        assert!(registry.set_primary_device(2));
        assert!(!registry.device(1).unwrap().is_primary());
        assert!(registry.device(2).unwrap().is_primary());

        assert!(!registry.set_primary_device(3));
        assert_eq!(registry.primary().number(), 2);
    }
}
