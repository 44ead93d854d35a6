use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace};

use pvrd_mpeg::ring::TsRingBuffer;
use pvrd_mpeg::ts::TS_SIZE;

use crate::device::Device;
use crate::worker::Worker;

pub const DELIVERY_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// Packets handed to the receivers in one go.
const MAX_BURST_PACKETS: usize = 1024;
const READ_CHUNK_SIZE: usize = 64 * TS_SIZE;
const WAIT_INTERVAL: Duration = Duration::from_millis(100);

struct TsBuffer {
    ring: Mutex<TsRingBuffer>,
    ready: Condvar,
    space: Condvar,
    eof: AtomicBool,
}

/// Moves the transport stream of a device to its receivers.
///
/// One thread reads the stream endpoint into a ring buffer, another one takes aligned
/// packets out of it and distributes them.
pub struct Delivery {
    buffer: Arc<TsBuffer>,
    reader: Worker,
    distributor: Worker,
}

impl Delivery {
    pub fn start(device: &Arc<Device>, stream: Box<dyn Read + Send>) -> anyhow::Result<Self> {
        let number = device.number();
        let buffer = Arc::new(TsBuffer {
            ring: Mutex::new(TsRingBuffer::new(
                DELIVERY_BUFFER_SIZE,
                format!("TS buffer on device {}", number),
            )),
            ready: Condvar::new(),
            space: Condvar::new(),
            eof: AtomicBool::new(false),
        });

        let reader = {
            let buffer = buffer.clone();
            Worker::spawn(format!("ts-reader-{}", number), move |token| {
                read_stream(stream, &buffer, || token.is_cancelled())
            })?
        };

        let distributor = {
            let buffer = buffer.clone();
            let device = Arc::downgrade(device);
            Worker::spawn(format!("ts-distributor-{}", number), move |token| {
                distribute(device, &buffer, || token.is_cancelled())
            })?
        };

        Ok(Self {
            buffer,
            reader,
            distributor,
        })
    }

    pub fn is_running(&self) -> bool {
        !self.distributor.is_finished()
    }

    /// Stops both threads, waking them first.
    pub fn stop(mut self, deadline: Duration) {
        self.reader.token().cancel();
        self.distributor.token().cancel();
        self.buffer.ready.notify_all();
        self.buffer.space.notify_all();

        self.distributor.stop(deadline);
        // The reader may sit in a blocking read until the next packet arrives.
        self.reader.stop(deadline);
    }
}

fn read_stream(mut stream: Box<dyn Read + Send>, buffer: &TsBuffer, cancelled: impl Fn() -> bool) {
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    while !cancelled() {
        let n = match stream.read(&mut chunk) {
            Ok(0) => {
                debug!("End of transport stream");
                break;
            }
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("Couldn't read the transport stream: {}", e);
                break;
            }
        };

        let mut ring = buffer.ring.lock();
        while ring.free() < n && !cancelled() {
            buffer.space.wait_for(&mut ring, WAIT_INTERVAL);
        }

        ring.put(&chunk[..n]);
        drop(ring);

        buffer.ready.notify_one();
    }

    buffer.eof.store(true, Ordering::Release);
    buffer.ready.notify_all();
}

fn distribute(device: Weak<Device>, buffer: &TsBuffer, cancelled: impl Fn() -> bool) {
    let mut packets = Vec::with_capacity(MAX_BURST_PACKETS * TS_SIZE);

    while !cancelled() {
        packets.clear();

        {
            let mut ring = buffer.ring.lock();
            if ring.available() < TS_SIZE {
                if buffer.eof.load(Ordering::Acquire) {
                    break;
                }

                buffer.ready.wait_for(&mut ring, WAIT_INTERVAL);
            }

            ring.read_packets(&mut packets, MAX_BURST_PACKETS);
        }
        buffer.space.notify_one();

        if packets.is_empty() {
            continue;
        }

        let Some(device) = device.upgrade() else {
            break;
        };

        trace!(device = device.number(), "Distributing {} packets", packets.len() / TS_SIZE);
        device.distribute(&packets);
    }
}
