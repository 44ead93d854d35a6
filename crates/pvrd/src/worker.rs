use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long dropping a [`Worker`] waits for the thread to finish.
pub const DEFAULT_STOP_DEADLINE: Duration = Duration::from_secs(3);

/// A named background thread that is stopped through a cancellation token.
pub struct Worker {
    name: String,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn<F>(name: impl Into<String>, f: F) -> anyhow::Result<Self>
    where
        F: FnOnce(CancellationToken) + Send + 'static,
    {
        let name = name.into();
        let token = CancellationToken::new();
        let child = token.clone();

        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || f(child))?;

        debug!("{} thread started", name);

        Ok(Self {
            name,
            token,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|handle| handle.is_finished())
    }

    /// Cancels the thread and joins it, giving up after `deadline`.
    ///
    /// A thread that doesn't finish in time is detached. Everything its closure owns,
    /// shared buffers included, stays alive until the thread returns on its own, so
    /// callers must not expect those to be released when this returns `false`.
    /// Returns whether the thread was joined.
    pub fn stop(&mut self, deadline: Duration) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };

        self.token.cancel();

        let started = Instant::now();
        while !handle.is_finished() {
            if started.elapsed() >= deadline {
                warn!(
                    "{} thread didn't stop within {} ms, detaching it",
                    self.name,
                    deadline.as_millis(),
                );
                return false;
            }

            std::thread::sleep(Duration::from_millis(10));
        }

        if handle.join().is_err() {
            warn!("{} thread panicked", self.name);
        }

        debug!("{} thread stopped", self.name);
        true
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop(DEFAULT_STOP_DEADLINE);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn test_stop_joins_cooperative_thread() {
        let iterations = Arc::new(AtomicUsize::new(0));
        let counter = iterations.clone();

        let mut worker = Worker::spawn("test", move |token| {
            while !token.is_cancelled() {
                counter.fetch_add(1, Ordering::Relaxed);
                std::thread::sleep(Duration::from_millis(1));
            }
        })
        .unwrap();

        std::thread::sleep(Duration::from_millis(20));
        assert!(!worker.is_finished());
        assert!(worker.stop(Duration::from_secs(1)));
        assert!(worker.is_finished());

        let stopped_at = iterations.load(Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(iterations.load(Ordering::Relaxed), stopped_at);
    }

    #[test]
    fn test_stop_gives_up_after_deadline() {
        let mut worker = Worker::spawn("stuck", |_| {
            std::thread::sleep(Duration::from_millis(300));
        })
        .unwrap();

        let started = Instant::now();
        assert!(!worker.stop(Duration::from_millis(50)));
        assert!(started.elapsed() < Duration::from_millis(250));

        // Stopping again is a no-op.
        assert!(worker.stop(Duration::from_millis(50)));
    }

    #[test]
    fn test_detached_thread_keeps_its_buffers() {
        let buffer = Arc::new(vec![0u8; 1024]);
        let held = buffer.clone();

        let mut worker = Worker::spawn("stuck", move |_| {
            std::thread::sleep(Duration::from_millis(200));
            drop(held);
        })
        .unwrap();

        assert!(!worker.stop(Duration::from_millis(20)));
        assert_eq!(Arc::strong_count(&buffer), 2);

        let started = Instant::now();
        while Arc::strong_count(&buffer) > 1 {
            assert!(started.elapsed() < Duration::from_secs(2));
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
