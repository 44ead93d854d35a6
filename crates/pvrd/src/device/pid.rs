use std::collections::BTreeMap;

use pvrd_mpeg::ts::MAX_PID;
use tracing::{debug, error, trace};

/// Number of hardware filters a device is expected to provide.
pub const MAX_PID_HANDLES: usize = 64;

/// What a PID is used for. Audio through Teletext are decoded by the device itself.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, strum::Display)]
pub enum SlotType {
    Audio,
    Video,
    Pcr,
    Teletext,
    Dolby,
    Other,
}

impl SlotType {
    /// Special PIDs have their own slot and feed the decoder while nobody else needs them.
    pub fn is_special(&self) -> bool {
        *self <= Self::Teletext
    }

    const FIXED: [SlotType; 5] = [
        Self::Audio,
        Self::Video,
        Self::Pcr,
        Self::Teletext,
        Self::Dolby,
    ];
}

#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum SlotId {
    Fixed(SlotType),
    Generic(usize),
}

/// Where the data of a programmed filter goes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FilterMode {
    /// Straight into the device's decoder.
    Decoder,

    /// Into the transport stream delivered to receivers.
    Tap,
}

/// Programs the hardware filters of a device.
pub trait PidFilter {
    fn set_pid(
        &mut self,
        slot: SlotId,
        pid: u16,
        slot_type: SlotType,
        mode: FilterMode,
    ) -> anyhow::Result<()>;

    fn clear_pid(&mut self, slot: SlotId, pid: u16, slot_type: SlotType) -> anyhow::Result<()>;
}

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum PidError {
    #[error("invalid PID {0}")]
    InvalidPid(u16),

    #[error("no free slot for PID {0}")]
    NoFreeSlot(u16),

    #[error("couldn't set PID {pid}")]
    Hardware { pid: u16 },
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
struct PidSlot {
    pid: u16,
    used: u32,
}

/// Reference counted hardware filters of one device.
pub struct PidSlotTable {
    fixed: BTreeMap<SlotType, PidSlot>,
    generic: Vec<PidSlot>,
}

impl Default for PidSlotTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PidSlotTable {
    pub fn new() -> Self {
        Self {
            fixed: SlotType::FIXED
                .iter()
                .map(|&slot_type| (slot_type, PidSlot::default()))
                .collect(),
            generic: vec![PidSlot::default(); MAX_PID_HANDLES - SlotType::FIXED.len()],
        }
    }

    fn slot(&self, id: SlotId) -> PidSlot {
        match id {
            SlotId::Fixed(slot_type) => self.fixed.get(&slot_type).copied().unwrap_or_default(),
            SlotId::Generic(i) => self.generic.get(i).copied().unwrap_or_default(),
        }
    }

    fn slot_mut(&mut self, id: SlotId) -> Option<&mut PidSlot> {
        match id {
            SlotId::Fixed(slot_type) => self.fixed.get_mut(&slot_type),
            SlotId::Generic(i) => self.generic.get_mut(i),
        }
    }

    /// The slot currently holding `pid`. PCR PIDs only ever live in their own slot.
    fn find(&self, pid: u16, slot_type: SlotType) -> Option<SlotId> {
        if slot_type == SlotType::Pcr {
            let id = SlotId::Fixed(SlotType::Pcr);
            let slot = self.slot(id);

            return (slot.used > 0 && slot.pid == pid).then_some(id);
        }

        let fixed = self
            .fixed
            .iter()
            .filter(|(slot_type, _)| **slot_type != SlotType::Pcr)
            .map(|(slot_type, slot)| (SlotId::Fixed(*slot_type), *slot));
        let generic = self
            .generic
            .iter()
            .enumerate()
            .map(|(i, slot)| (SlotId::Generic(i), *slot));

        fixed
            .chain(generic)
            .find(|(_, slot)| slot.used > 0 && slot.pid == pid)
            .map(|(id, _)| id)
    }

    fn mode(id: SlotId, used: u32) -> FilterMode {
        match id {
            SlotId::Fixed(slot_type) if slot_type.is_special() && used <= 1 => FilterMode::Decoder,
            _ => FilterMode::Tap,
        }
    }

    pub fn has_pid(&self, pid: u16) -> bool {
        self.fixed
            .values()
            .chain(self.generic.iter())
            .any(|slot| slot.used > 0 && slot.pid == pid)
    }

    /// The PID held by the fixed slot of `slot_type`, if any.
    pub fn pid_of(&self, slot_type: SlotType) -> Option<u16> {
        self.fixed
            .get(&slot_type)
            .filter(|slot| slot.used > 0)
            .map(|slot| slot.pid)
    }

    /// How many users `pid` has.
    pub fn usage(&self, pid: u16) -> u32 {
        self.fixed
            .values()
            .chain(self.generic.iter())
            .filter(|slot| slot.pid == pid)
            .map(|slot| slot.used)
            .sum()
    }

    /// Adds a user to `pid`, programming the hardware when the slot becomes used or
    /// when a special PID gets its second user and has to be tapped.
    ///
    /// PID 0 is ignored. A hardware failure leaves the table as it was.
    pub fn add_pid<F: PidFilter + ?Sized>(
        &mut self,
        filter: &mut F,
        pid: u16,
        slot_type: SlotType,
    ) -> Result<(), PidError> {
        if pid == 0 {
            return Ok(());
        }
        if pid > MAX_PID {
            return Err(PidError::InvalidPid(pid));
        }

        if let Some(id) = self.find(pid, slot_type) {
            let Some(slot) = self.slot_mut(id) else {
                return Err(PidError::NoFreeSlot(pid));
            };

            slot.used += 1;
            let used = slot.used;
            trace!(pid, ?id, used, "PID gained a user");

            if used == 2 && matches!(id, SlotId::Fixed(t) if t.is_special()) {
                if let Err(e) = filter.set_pid(id, pid, slot_type, Self::mode(id, used)) {
                    error!(pid, "Couldn't switch PID to tap mode: {}", e);

                    if let Some(slot) = self.slot_mut(id) {
                        slot.used -= 1;
                    }
                    return Err(PidError::Hardware { pid });
                }
            }

            return Ok(());
        }

        let id = if slot_type != SlotType::Other {
            SlotId::Fixed(slot_type)
        } else {
            let Some(i) = self.generic.iter().position(|slot| slot.used == 0) else {
                error!(pid, "No free slot for PID");
                return Err(PidError::NoFreeSlot(pid));
            };

            SlotId::Generic(i)
        };

        let Some(slot) = self.slot_mut(id) else {
            return Err(PidError::NoFreeSlot(pid));
        };

        if slot.used > 0 {
            debug!(pid, old = slot.pid, "Replacing PID in slot {:?}", id);
        }

        let previous = *slot;
        *slot = PidSlot { pid, used: 1 };

        if let Err(e) = filter.set_pid(id, pid, slot_type, Self::mode(id, 1)) {
            error!(pid, "Couldn't set PID: {}", e);

            if let Some(slot) = self.slot_mut(id) {
                *slot = if previous.used > 0 {
                    previous
                } else {
                    PidSlot::default()
                };
            }
            return Err(PidError::Hardware { pid });
        }

        Ok(())
    }

    /// Removes a user from `pid`, releasing the hardware filter with the last one.
    pub fn del_pid<F: PidFilter + ?Sized>(&mut self, filter: &mut F, pid: u16, slot_type: SlotType) {
        if pid == 0 {
            return;
        }

        let Some(id) = self.find(pid, slot_type) else {
            return;
        };
        let Some(slot) = self.slot_mut(id) else {
            return;
        };

        slot.used -= 1;
        trace!(pid, ?id, used = slot.used, "PID lost a user");

        if slot.used == 0 {
            *slot = PidSlot::default();

            if let Err(e) = filter.clear_pid(id, pid, slot_type) {
                error!(pid, "Couldn't clear PID: {}", e);
            }
        }
    }
}
