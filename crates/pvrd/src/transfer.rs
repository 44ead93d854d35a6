use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use pvrd_mpeg::remux::{Remux, TRANSFER_BUFFER_SIZE};

use crate::channel::Channel;
use crate::device::{Device, Player, Receive, Receiver, ReceiverError};
use crate::worker::{DEFAULT_STOP_DEADLINE, Worker};

/// Receivers feeding a transfer yield to every recording.
pub const TRANSFER_PRIORITY: i32 = -1;

const POLL_TIMEOUT: Duration = Duration::from_millis(100);
const POLL_TIMEOUTS_BEFORE_CLEAR: usize = 6;
const WAIT_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("device {0} can't play anything")]
    NoDecoder(usize),

    #[error(transparent)]
    Receiver(#[from] ReceiverError),
}

struct Shared {
    remux: Mutex<Remux>,
    ready: Condvar,
    destination: Weak<Device>,
    worker: Mutex<Option<Worker>>,
}

impl Receive for Shared {
    fn receive(&self, data: &[u8]) {
        self.remux.lock().put(data);
        self.ready.notify_one();
    }
}

/// The playing side of a transfer, attached to the destination device.
struct TransferPlayer(Arc<Shared>);

impl Player for TransferPlayer {
    fn activate(&self, on: bool) {
        let mut worker = self.0.worker.lock();

        if on {
            if worker.is_some() {
                return;
            }

            self.0.remux.lock().clear();

            let shared = self.0.clone();
            match Worker::spawn("transfer", move |token| shared.run(&token)) {
                Ok(spawned) => *worker = Some(spawned),
                Err(e) => error!("Couldn't start the transfer: {}", e),
            }
        } else if let Some(mut stopped) = worker.take() {
            stopped.token().cancel();
            self.0.ready.notify_all();
            stopped.stop(DEFAULT_STOP_DEADLINE);
        }
    }

    fn is_transfer(&self) -> bool {
        true
    }
}

impl Shared {
    fn run(&self, token: &CancellationToken) {
        let mut poll_timeouts = 0;

        while !token.is_cancelled() {
            let packet = {
                let mut remux = self.remux.lock();
                match remux.get() {
                    Some(packet) => packet,
                    None => {
                        self.ready.wait_for(&mut remux, WAIT_INTERVAL);
                        continue;
                    }
                }
            };

            let Some(destination) = self.destination.upgrade() else {
                break;
            };

            let mut offset = 0;
            while offset < packet.len() && !token.is_cancelled() {
                match destination.play_pes(&packet[offset..], false) {
                    Ok(0) => {
                        if destination.poll(POLL_TIMEOUT) {
                            poll_timeouts = 0;
                            continue;
                        }

                        poll_timeouts += 1;
                        if poll_timeouts == POLL_TIMEOUTS_BEFORE_CLEAR {
                            warn!(
                                device = destination.number(),
                                "Clearing device because of consecutive poll timeouts",
                            );

                            destination.clear();
                            self.remux.lock().clear();
                            destination.reset_pes();
                            poll_timeouts = 0;
                            break;
                        }
                    }
                    Ok(w) => {
                        offset += w;
                        poll_timeouts = 0;
                    }
                    Err(e) => {
                        error!(device = destination.number(), "Transfer write failed: {}", e);
                        break;
                    }
                }
            }
        }

        debug!("Transfer finished");
    }
}

/// Plays a channel received on one device through the decoder of another one.
pub struct TransferPipe {
    source: Arc<Device>,
    destination: Arc<Device>,
    receiver: Arc<Receiver>,
    player: Arc<dyn Player>,
}

impl TransferPipe {
    pub fn start(
        source: &Arc<Device>,
        destination: &Arc<Device>,
        channel: &Channel,
    ) -> Result<Self, TransferError> {
        let pids = std::iter::once(channel.vpid)
            .chain(channel.apids.iter().copied())
            .chain(channel.dpids.iter().copied())
            .chain(channel.spids.iter().copied())
            .collect::<Vec<_>>();

        let shared = Arc::new(Shared {
            remux: Mutex::new(Remux::with_capacity(pids.iter().copied(), TRANSFER_BUFFER_SIZE)),
            ready: Condvar::new(),
            destination: Arc::downgrade(destination),
            worker: Mutex::new(None),
        });

        let receiver = Receiver::new(pids, TRANSFER_PRIORITY, shared.clone());
        let player: Arc<dyn Player> = Arc::new(TransferPlayer(shared));

        if !destination.attach_player(player.clone()) {
            return Err(TransferError::NoDecoder(destination.number()));
        }

        if let Err(e) = source.attach_receiver(&receiver) {
            destination.detach_player_if(&player);
            return Err(e.into());
        }

        info!(
            from = source.number(),
            to = destination.number(),
            %channel,
            "Transfer started",
        );

        Ok(Self {
            source: source.clone(),
            destination: destination.clone(),
            receiver,
            player,
        })
    }

    pub fn source(&self) -> &Arc<Device> {
        &self.source
    }

    pub fn destination(&self) -> &Arc<Device> {
        &self.destination
    }

    /// Whether both ends are still in place.
    pub fn is_active(&self) -> bool {
        self.receiver.device_number() == Some(self.source.number())
            && self.destination.is_transferring()
    }
}

impl Drop for TransferPipe {
    fn drop(&mut self) {
        if let Err(e) = self.source.detach_receiver(&self.receiver) {
            debug!(device = self.source.number(), "Transfer receiver already gone: {}", e);
        }

        self.destination.detach_player_if(&self.player);

        debug!(
            from = self.source.number(),
            to = self.destination.number(),
            "Transfer stopped",
        );
    }
}

#[cfg(test)]
mod tests {
    use pvrd_mpeg::ts::{TS_SIZE, TS_SYNC_BYTE};

    use super::*;
    use crate::channel::Polarization;
    use crate::channel::tests::satellite_channel;
    use crate::config::SetupConfig;
    use crate::device::mock::{MockBackend, MockCall};

    fn ts_packets(pid: u16, pes: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();

        for (i, chunk) in pes.chunks(TS_SIZE - 4).enumerate() {
            let mut packet = vec![0xFF; TS_SIZE];
            packet[0] = TS_SYNC_BYTE;
            packet[1] = if i == 0 { 0x40 } else { 0x00 } | (pid >> 8) as u8;
            packet[2] = pid as u8;

            if chunk.len() == TS_SIZE - 4 {
                packet[3] = 0x10 | (i as u8 & 0x0F);
                packet[4..].copy_from_slice(chunk);
            } else {
                // Stuffing through the adaptation field.
                let stuffing = TS_SIZE - 4 - chunk.len();
                packet[3] = 0x30 | (i as u8 & 0x0F);
                packet[4] = (stuffing - 1) as u8;
                if stuffing > 1 {
                    packet[5] = 0x00;
                }
                packet[4 + stuffing..].copy_from_slice(chunk);
            }

            out.extend(packet);
        }

        out
    }

    fn audio_pes(payload_len: usize) -> Vec<u8> {
        let mut packet = vec![0x00, 0x00, 0x01, 0xC0];
        packet.extend_from_slice(&((3 + payload_len) as u16).to_be_bytes());
        packet.extend_from_slice(&[0x80, 0x00, 0x00]);
        packet.extend((0..payload_len).map(|i| i as u8));
        packet
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        false
    }

    #[test]
    fn test_transfer_between_devices() {
        let setup = Arc::new(SetupConfig::default());
        let source = Device::open(0, Box::new(MockBackend::new()), setup.clone(), None).unwrap();

        let backend = MockBackend::new().with_decoder();
        let mock = backend.state();
        let destination = Device::open(1, Box::new(backend), setup, None).unwrap();

        let channel = satellite_channel(1, 11_836, Polarization::Horizontal);
        let transfer = TransferPipe::start(&source, &destination, &channel).unwrap();

        assert!(transfer.is_active());
        assert!(destination.is_transferring());
        assert!(source.has_pid(channel.apid(0)));
        assert!(source.receiving(true));
        assert!(!source.receiving(false));

        let pes = audio_pes(300);
        let packets = ts_packets(channel.apid(0), &pes);
        source.distribute(&packets);

        assert!(wait_until(|| mock.lock().audio == pes));

        drop(transfer);
        assert!(!destination.is_replaying());
        assert!(!source.has_pid(channel.apid(0)));
    }

    #[test]
    fn test_intermittent_poll_timeouts_keep_device() {
        let setup = Arc::new(SetupConfig::default());
        let source = Device::open(0, Box::new(MockBackend::new()), setup.clone(), None).unwrap();

        let backend = MockBackend::new().with_decoder();
        let mock = backend.state();
        let destination = Device::open(1, Box::new(backend), setup, None).unwrap();

        let channel = satellite_channel(1, 11_836, Polarization::Horizontal);
        let transfer = TransferPipe::start(&source, &destination, &channel).unwrap();

        let clears = || {
            mock.lock()
                .calls
                .iter()
                .filter(|call| **call == MockCall::Clear)
                .count()
        };
        let cleared = clears();

        {
            let mut state = mock.lock();
            state.refused_writes = 4 * POLL_TIMEOUTS_BEFORE_CLEAR;
            state.flaky_poll = true;
        }

        let pes = audio_pes(300);
        source.distribute(&ts_packets(channel.apid(0), &pes));

        assert!(wait_until(|| mock.lock().audio == pes));
        assert_eq!(mock.lock().refused_writes, 0);
        assert_eq!(clears(), cleared);

        drop(transfer);
    }

    #[test]
    fn test_transfer_needs_decoder() {
        let setup = Arc::new(SetupConfig::default());
        let source = Device::open(0, Box::new(MockBackend::new()), setup.clone(), None).unwrap();
        let destination = Device::open(1, Box::new(MockBackend::new()), setup, None).unwrap();

        let channel = satellite_channel(1, 11_836, Polarization::Horizontal);
        assert!(matches!(
            TransferPipe::start(&source, &destination, &channel),
            Err(TransferError::NoDecoder(2)),
        ));
        assert!(!source.has_pid(channel.vpid));
    }
}
