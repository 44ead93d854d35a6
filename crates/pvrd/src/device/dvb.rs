use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::io::Read;
use std::sync::Arc;

use tracing::{debug, info};

use crate::device::DeviceBackend;
use crate::device::pid::{FilterMode, PidFilter, SlotId, SlotType};
use crate::tuner::Frontend;
use crate::tuner::dvb::{DvbAdapter, DvbDemux, DvbFrontend};

/// A DVB adapter without a decoder. Every PID slot gets a demux filter of its own.
pub struct DvbBackend {
    adapter: Arc<DvbAdapter>,
    filters: BTreeMap<SlotId, DvbDemux>,
    frontend: Option<DvbFrontend>,
    num_cams: usize,
    ca_ids: Vec<u16>,
}

impl DvbBackend {
    pub fn open(
        adapter_num: u8,
        frontend_num: u8,
        num_cams: usize,
        ca_ids: Vec<u16>,
    ) -> anyhow::Result<Self> {
        let adapter = Arc::new(DvbAdapter::open(adapter_num as u32, frontend_num as u32)?);
        let frontend = DvbFrontend::new(adapter.clone());

        if num_cams > 0 {
            info!(adapter_num, num_cams, ca_ids = ?ca_ids, "Conditional access configured");
        }

        Ok(Self {
            adapter,
            filters: BTreeMap::new(),
            frontend: Some(frontend),
            num_cams,
            ca_ids,
        })
    }
}

impl PidFilter for DvbBackend {
    fn set_pid(
        &mut self,
        slot: SlotId,
        pid: u16,
        slot_type: SlotType,
        mode: FilterMode,
    ) -> anyhow::Result<()> {
        let demux = match self.filters.entry(slot) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(self.adapter.open_demux()?),
        };

        demux.set_pid(pid, slot_type, mode == FilterMode::Decoder)?;
        debug!(pid, %slot_type, ?mode, "Demux filter set");
        Ok(())
    }

    fn clear_pid(&mut self, slot: SlotId, pid: u16, slot_type: SlotType) -> anyhow::Result<()> {
        if let Some(demux) = self.filters.remove(&slot) {
            demux.stop();
            debug!(pid, %slot_type, "Demux filter closed");
        }

        Ok(())
    }
}

impl DeviceBackend for DvbBackend {
    fn num_cams(&self) -> usize {
        self.num_cams
    }

    fn ca_ids(&self) -> &[u16] {
        &self.ca_ids
    }

    fn take_frontend(&mut self) -> Option<Box<dyn Frontend>> {
        self.frontend
            .take()
            .map(|frontend| Box::new(frontend) as Box<dyn Frontend>)
    }

    fn open_stream(&mut self) -> anyhow::Result<Box<dyn Read + Send>> {
        Ok(Box::new(self.adapter.open_dvr()?))
    }
}
