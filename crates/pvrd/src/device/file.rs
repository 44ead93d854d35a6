use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use tracing::debug;

use crate::channel::Source;
use crate::device::DeviceBackend;
use crate::device::pid::{FilterMode, PidFilter, SlotId, SlotType};
use crate::tuner::simulated::SimulatedFrontend;
use crate::tuner::{Frontend, FrontendKind};

/// A device receiving a prerecorded transport stream from a file or stdin.
///
/// Tuning is simulated and the filters are no-ops: every receiver sees the PIDs it asks
/// for as long as the stream carries them.
pub struct FileBackend {
    path: PathBuf,
    sources: Vec<Source>,
    frontend: Option<SimulatedFrontend>,
}

impl FileBackend {
    pub fn new(path: PathBuf, sources: Vec<Source>, kind: FrontendKind, lock_delay: Duration) -> Self {
        Self {
            path,
            sources,
            frontend: Some(SimulatedFrontend::new(kind, lock_delay)),
        }
    }

    fn is_stdin(path: &Path) -> bool {
        path.as_os_str() == "-"
    }
}

impl PidFilter for FileBackend {
    fn set_pid(
        &mut self,
        _slot: SlotId,
        pid: u16,
        slot_type: SlotType,
        mode: FilterMode,
    ) -> anyhow::Result<()> {
        debug!(pid, %slot_type, ?mode, "Filter set");
        Ok(())
    }

    fn clear_pid(&mut self, _slot: SlotId, pid: u16, slot_type: SlotType) -> anyhow::Result<()> {
        debug!(pid, %slot_type, "Filter cleared");
        Ok(())
    }
}

impl DeviceBackend for FileBackend {
    fn provides_source(&self, source: &Source) -> bool {
        self.sources.iter().any(|provided| {
            provided == source || (provided.is_generic_satellite() && source.is_satellite())
        })
    }

    fn take_frontend(&mut self) -> Option<Box<dyn Frontend>> {
        self.frontend
            .take()
            .map(|frontend| Box::new(frontend) as Box<dyn Frontend>)
    }

    fn open_stream(&mut self) -> anyhow::Result<Box<dyn Read + Send>> {
        if Self::is_stdin(&self.path) {
            return Ok(Box::new(std::io::stdin()));
        }

        let file = File::open(&self.path)
            .with_context(|| format!("Couldn't open {}", self.path.display()))?;

        Ok(Box::new(BufReader::new(file)))
    }
}
