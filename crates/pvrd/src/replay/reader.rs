use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::error;

use crate::worker::Worker;

const IDLE_INTERVAL: Duration = Duration::from_secs(1);

/// Reads `length` octets at `offset`, fewer at the end of the file.
pub fn read_at(file: &File, offset: u64, length: usize) -> io::Result<Vec<u8>> {
    let mut file = file;
    file.seek(SeekFrom::Start(offset))?;

    let mut data = Vec::with_capacity(length);
    file.take(length as u64).read_to_end(&mut data)?;

    Ok(data)
}

struct Job {
    file: Arc<File>,
    offset: u64,
    length: usize,
    result: Option<io::Result<Vec<u8>>>,
}

#[derive(Default)]
struct ReaderState {
    job: Option<Job>,
    generation: u64,
}

#[derive(Default)]
struct Shared {
    state: Mutex<ReaderState>,
    new_job: Condvar,
    new_data: Condvar,
}

/// Reads frames on its own thread, so that replay never blocks on the disk.
///
/// A read is requested once and its result taken once it is there; only one read is in
/// flight at a time.
pub struct NonBlockingReader {
    shared: Arc<Shared>,
    worker: Worker,
}

impl NonBlockingReader {
    pub fn start() -> anyhow::Result<Self> {
        let shared = Arc::new(Shared::default());

        let worker = {
            let shared = shared.clone();
            Worker::spawn("replay-reader", move |token| {
                while !token.is_cancelled() {
                    shared.work();
                }
            })?
        };

        Ok(Self { shared, worker })
    }

    /// Whether a read has been requested and its result not yet taken.
    pub fn is_reading(&self) -> bool {
        self.shared.state.lock().job.is_some()
    }

    pub fn request(&self, file: Arc<File>, offset: u64, length: usize) {
        let mut state = self.shared.state.lock();
        if state.job.is_some() {
            return;
        }

        state.job = Some(Job {
            file,
            offset,
            length,
            result: None,
        });
        self.shared.new_job.notify_one();
    }

    /// Takes the result of the current read if it has completed. An empty buffer means the
    /// end of the file.
    pub fn take(&self) -> Option<io::Result<Vec<u8>>> {
        let mut state = self.shared.state.lock();
        if state.job.as_ref().is_none_or(|job| job.result.is_none()) {
            return None;
        }

        state.job.take().and_then(|job| job.result)
    }

    /// Drops the current read, even if it is still in progress.
    pub fn clear(&self) {
        let mut state = self.shared.state.lock();
        state.job = None;
        state.generation += 1;
    }

    /// Waits until the current read has completed. Returns whether it did.
    pub fn wait_for_data(&self, timeout: Duration) -> bool {
        let mut state = self.shared.state.lock();
        if has_data(&state) {
            return true;
        }

        !self.shared.new_data.wait_for(&mut state, timeout).timed_out() && has_data(&state)
    }
}

impl Drop for NonBlockingReader {
    fn drop(&mut self) {
        self.worker.token().cancel();
        self.shared.new_job.notify_all();
    }
}

fn has_data(state: &ReaderState) -> bool {
    state.job.as_ref().is_some_and(|job| job.result.is_some())
}

impl Shared {
    fn work(&self) {
        let (file, offset, length, generation) = {
            let mut state = self.state.lock();
            let pending = state
                .job
                .as_ref()
                .filter(|job| job.result.is_none())
                .map(|job| (job.file.clone(), job.offset, job.length));

            match pending {
                Some((file, offset, length)) => (file, offset, length, state.generation),
                None => {
                    self.new_job.wait_for(&mut state, IDLE_INTERVAL);
                    return;
                }
            }
        };

        let result = read_at(&file, offset, length);
        if let Err(e) = &result {
            error!("Couldn't read frame at {}: {}", offset, e);
        }

        let mut state = self.state.lock();
        if state.generation != generation {
            return;
        }

        if let Some(job) = &mut state.job {
            job.result = Some(result);
            self.new_data.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_read_in_background() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&(0..=255).collect::<Vec<u8>>()).unwrap();
        let file = Arc::new(file);

        let reader = NonBlockingReader::start().unwrap();
        assert!(!reader.is_reading());

        reader.request(file.clone(), 16, 32);
        assert!(reader.is_reading());
        assert!(reader.wait_for_data(Duration::from_secs(5)));

        let data = reader.take().unwrap().unwrap();
        assert_eq!(data, (16..48).collect::<Vec<u8>>());
        assert!(!reader.is_reading());
        assert!(reader.take().is_none());

        // Past the end of the file.
        reader.request(file, 240, 32);
        assert!(reader.wait_for_data(Duration::from_secs(5)));
        assert_eq!(reader.take().unwrap().unwrap().len(), 16);
    }

    #[test]
    fn test_clear_drops_request() {
        let file = Arc::new(tempfile::tempfile().unwrap());
        let reader = NonBlockingReader::start().unwrap();

        reader.request(file, 0, 10);
        reader.clear();
        assert!(!reader.is_reading());
        assert!(!reader.wait_for_data(Duration::from_millis(20)));
    }
}
