use std::time::{Duration, Instant};

use tracing::trace;

use super::{Burst, Frontend, FrontendKind, FrontendParams, FrontendStatus, Tone, Voltage};

/// A frontend without hardware behind it, which reports a lock some time after tuning.
pub struct SimulatedFrontend {
    kind: FrontendKind,
    lock_delay: Duration,
    tuned_at: Option<Instant>,
}

impl SimulatedFrontend {
    pub fn new(kind: FrontendKind, lock_delay: Duration) -> Self {
        Self {
            kind,
            lock_delay,
            tuned_at: None,
        }
    }
}

impl Frontend for SimulatedFrontend {
    fn kind(&self) -> FrontendKind {
        self.kind
    }

    fn read_status(&mut self, timeout: Duration) -> anyhow::Result<FrontendStatus> {
        std::thread::sleep(timeout);

        Ok(FrontendStatus {
            has_lock: self
                .tuned_at
                .is_some_and(|tuned_at| tuned_at.elapsed() >= self.lock_delay),
            reinit: false,
        })
    }

    fn set_frontend(&mut self, params: &FrontendParams) -> anyhow::Result<()> {
        trace!(
            frequency = params.frequency,
            symbol_rate = params.symbol_rate,
            "Simulated frontend tuned"
        );

        self.tuned_at = Some(Instant::now());
        Ok(())
    }

    fn set_voltage(&mut self, voltage: Voltage) -> anyhow::Result<()> {
        trace!(?voltage, "Simulated frontend voltage");
        Ok(())
    }

    fn set_tone(&mut self, tone: Tone) -> anyhow::Result<()> {
        trace!(?tone, "Simulated frontend tone");
        Ok(())
    }

    fn send_burst(&mut self, burst: Burst) -> anyhow::Result<()> {
        trace!(?burst, "Simulated frontend burst");
        Ok(())
    }

    fn send_master_cmd(&mut self, cmd: &[u8]) -> anyhow::Result<()> {
        trace!(?cmd, "Simulated frontend DiSEqC command");
        Ok(())
    }
}
