use std::ffi::c_void;
use std::io::{ErrorKind, Read};
use std::ptr::{null, null_mut};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use dvbv5_sys::dvb_dev_type::{DVB_DEVICE_DEMUX, DVB_DEVICE_DVR, DVB_DEVICE_FRONTEND};
use dvbv5_sys::{
    DTV_BANDWIDTH_HZ, DTV_CODE_RATE_HP, DTV_CODE_RATE_LP, DTV_FREQUENCY, DTV_GUARD_INTERVAL,
    DTV_HIERARCHY, DTV_INNER_FEC, DTV_INVERSION, DTV_MODULATION, DTV_STATUS, DTV_SYMBOL_RATE,
    DTV_TRANSMISSION_MODE, dmx_output, dmx_ts_pes, dvb_dev_alloc, dvb_dev_close,
    dvb_dev_dmx_set_pesfilter, dvb_dev_dmx_stop, dvb_dev_find, dvb_dev_free, dvb_dev_list,
    dvb_dev_open, dvb_dev_read, dvb_dev_seek_by_adapter, dvb_dev_set_log, dvb_device,
    dvb_fe_diseqc_burst, dvb_fe_diseqc_cmd, dvb_fe_get_stats, dvb_fe_retrieve_stats,
    dvb_fe_sec_tone, dvb_fe_sec_voltage, dvb_fe_set_parms, dvb_fe_store_parm,
    dvb_open_descriptor, dvb_set_compat_delivery_system, dvb_v5_fe_parms, fe_delivery_system,
    fe_sec_tone_mode,
};
use libc::{EOVERFLOW, O_RDONLY, O_RDWR};
use tracing::{error, info};

use crate::device::pid::SlotType;

use super::{Burst, Frontend, FrontendKind, FrontendParams, FrontendStatus, Tone, Voltage};

const FE_HAS_LOCK: u32 = 0x10;
const FE_REINIT: u32 = 0x40;

/// The device nodes of one DVB adapter/frontend pair.
pub struct DvbAdapter {
    dvb: *mut dvb_device,
    demux_dev: *mut dvb_dev_list,
    dvr_dev: *mut dvb_dev_list,
    fe_parms: *mut dvb_v5_fe_parms,
    kind: FrontendKind,
}

impl DvbAdapter {
    pub fn open(adapter: u32, num: u32) -> anyhow::Result<Self> {
        unsafe {
            let dvb = dvb_dev_alloc();

            dvb_dev_set_log(dvb, 3, None);
            dvb_dev_find(dvb, None, null_mut());

            let demux_dev = dvb_dev_seek_by_adapter(dvb, adapter, num, DVB_DEVICE_DEMUX);
            if demux_dev.is_null() {
                dvb_dev_free(dvb);
                bail!("Couldn't find demux device node");
            }

            let dvr_dev = dvb_dev_seek_by_adapter(dvb, adapter, num, DVB_DEVICE_DVR);
            if dvr_dev.is_null() {
                dvb_dev_free(dvb);
                bail!("Couldn't find dvr device node");
            }

            let fe_dev = dvb_dev_seek_by_adapter(dvb, adapter, num, DVB_DEVICE_FRONTEND);
            if fe_dev.is_null() {
                dvb_dev_free(dvb);
                bail!("Couldn't find frontend device node");
            }

            let fe_fd = dvb_dev_open(dvb, (*fe_dev).sysname, O_RDWR);
            if fe_fd.is_null() {
                dvb_dev_free(dvb);
                bail!("Couldn't open the frontend device");
            }

            let fe_parms = (*dvb).fe_parms;
            let system = (*fe_parms).current_sys as u32;

            let kind = if system == fe_delivery_system::SYS_DVBS as u32
                || system == fe_delivery_system::SYS_DVBS2 as u32
            {
                FrontendKind::Satellite
            } else if system == fe_delivery_system::SYS_DVBC_ANNEX_A as u32 {
                FrontendKind::Cable
            } else if system == fe_delivery_system::SYS_DVBT as u32
                || system == fe_delivery_system::SYS_DVBT2 as u32
            {
                FrontendKind::Terrestrial
            } else {
                dvb_dev_free(dvb);
                bail!("Unsupported delivery system {}", system);
            };

            info!("Opened DVB adapter {} frontend {} ({})", adapter, num, kind);

            Ok(Self {
                dvb,
                demux_dev,
                dvr_dev,
                fe_parms,
                kind,
            })
        }
    }

    pub fn kind(&self) -> FrontendKind {
        self.kind
    }

    pub fn open_demux(&self) -> anyhow::Result<DvbDemux> {
        unsafe {
            let fd = dvb_dev_open(self.dvb, (*self.demux_dev).sysname, O_RDWR);
            if fd.is_null() {
                bail!("Couldn't open the demux device");
            }

            Ok(DvbDemux { fd })
        }
    }

    pub fn open_dvr(&self) -> anyhow::Result<DvbDvr> {
        unsafe {
            let fd = dvb_dev_open(self.dvb, (*self.dvr_dev).sysname, O_RDONLY);
            if fd.is_null() {
                bail!("Couldn't open the dvr device");
            }

            Ok(DvbDvr { fd })
        }
    }
}

impl Drop for DvbAdapter {
    fn drop(&mut self) {
        unsafe {
            dvb_dev_free(self.dvb);
        }
    }
}

unsafe impl Send for DvbAdapter {}
unsafe impl Sync for DvbAdapter {}

/// One hardware PID filter.
pub struct DvbDemux {
    fd: *mut dvb_open_descriptor,
}

impl DvbDemux {
    /// Routes `pid` either to the decoder or to the dvr tap.
    pub fn set_pid(&self, pid: u16, slot_type: SlotType, decoder: bool) -> anyhow::Result<()> {
        let output = if decoder {
            dmx_output::DMX_OUT_DECODER
        } else {
            dmx_output::DMX_OUT_TS_TAP
        };

        let ret = unsafe {
            dvb_dev_dmx_set_pesfilter(self.fd, pid, pes_type(slot_type), output, 0)
        };
        if ret < 0 {
            bail!("Couldn't set the PES filter for PID {}", pid);
        }

        Ok(())
    }

    pub fn stop(&self) {
        unsafe {
            dvb_dev_dmx_stop(self.fd);
        }
    }
}

/// The stream type the decoder expects on a filter.
fn pes_type(slot_type: SlotType) -> dmx_ts_pes {
    match slot_type {
        SlotType::Audio => dmx_ts_pes::DMX_PES_AUDIO0,
        SlotType::Video => dmx_ts_pes::DMX_PES_VIDEO0,
        SlotType::Pcr => dmx_ts_pes::DMX_PES_PCR0,
        SlotType::Teletext => dmx_ts_pes::DMX_PES_TELETEXT0,
        SlotType::Dolby | SlotType::Other => dmx_ts_pes::DMX_PES_OTHER,
    }
}

impl Drop for DvbDemux {
    fn drop(&mut self) {
        unsafe {
            dvb_dev_close(self.fd);
        }
    }
}

unsafe impl Send for DvbDemux {}
unsafe impl Sync for DvbDemux {}

pub struct DvbDvr {
    fd: *mut dvb_open_descriptor,
}

impl Read for DvbDvr {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let ret = unsafe { dvb_dev_read(self.fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
            if ret == (-EOVERFLOW as isize) {
                // The driver dropped data, but the stream goes on.
                error!("DVR buffer overrun");
                continue;
            }
            if ret < 0 {
                Err(ErrorKind::Other)?
            }

            return Ok(ret as usize);
        }
    }
}

impl Drop for DvbDvr {
    fn drop(&mut self) {
        unsafe {
            dvb_dev_close(self.fd);
        }
    }
}

unsafe impl Send for DvbDvr {}
unsafe impl Sync for DvbDvr {}

pub struct DvbFrontend {
    adapter: Arc<DvbAdapter>,
}

impl DvbFrontend {
    pub fn new(adapter: Arc<DvbAdapter>) -> Self {
        Self { adapter }
    }
}

impl Frontend for DvbFrontend {
    fn kind(&self) -> FrontendKind {
        self.adapter.kind
    }

    fn read_status(&mut self, timeout: Duration) -> anyhow::Result<FrontendStatus> {
        std::thread::sleep(timeout);

        let mut status = 0u32;
        unsafe {
            let p = self.adapter.fe_parms;

            if dvb_fe_get_stats(p) < 0 {
                bail!("Couldn't read the frontend status");
            }
            if dvb_fe_retrieve_stats(p, DTV_STATUS, &mut status) < 0 {
                bail!("Couldn't retrieve the frontend status");
            }
        }

        Ok(FrontendStatus {
            has_lock: status & FE_HAS_LOCK != 0,
            reinit: status & FE_REINIT != 0,
        })
    }

    fn set_frontend(&mut self, params: &FrontendParams) -> anyhow::Result<()> {
        unsafe {
            let p = self.adapter.fe_parms;

            // LNB handling is done by the tuner, the frequency is the IF already.
            (*p).lnb = null();

            match self.adapter.kind {
                FrontendKind::Satellite => {
                    dvb_set_compat_delivery_system(p, fe_delivery_system::SYS_DVBS as u32);
                    dvb_fe_store_parm(p, DTV_FREQUENCY, params.frequency);
                    dvb_fe_store_parm(p, DTV_SYMBOL_RATE, params.symbol_rate);
                    dvb_fe_store_parm(p, DTV_INVERSION, params.tuning.inversion);
                    dvb_fe_store_parm(p, DTV_INNER_FEC, params.tuning.code_rate_hp);
                }
                FrontendKind::Cable => {
                    dvb_set_compat_delivery_system(
                        p,
                        fe_delivery_system::SYS_DVBC_ANNEX_A as u32,
                    );
                    dvb_fe_store_parm(p, DTV_FREQUENCY, params.frequency);
                    dvb_fe_store_parm(p, DTV_SYMBOL_RATE, params.symbol_rate);
                    dvb_fe_store_parm(p, DTV_INVERSION, params.tuning.inversion);
                    dvb_fe_store_parm(p, DTV_INNER_FEC, params.tuning.code_rate_hp);
                    dvb_fe_store_parm(p, DTV_MODULATION, params.tuning.modulation);
                }
                FrontendKind::Terrestrial => {
                    dvb_set_compat_delivery_system(p, fe_delivery_system::SYS_DVBT as u32);
                    dvb_fe_store_parm(p, DTV_FREQUENCY, params.frequency);
                    dvb_fe_store_parm(p, DTV_INVERSION, params.tuning.inversion);
                    dvb_fe_store_parm(p, DTV_BANDWIDTH_HZ, params.tuning.bandwidth_hz);
                    dvb_fe_store_parm(p, DTV_CODE_RATE_HP, params.tuning.code_rate_hp);
                    dvb_fe_store_parm(p, DTV_CODE_RATE_LP, params.tuning.code_rate_lp);
                    dvb_fe_store_parm(p, DTV_MODULATION, params.tuning.modulation);
                    dvb_fe_store_parm(p, DTV_TRANSMISSION_MODE, params.tuning.transmission_mode);
                    dvb_fe_store_parm(p, DTV_GUARD_INTERVAL, params.tuning.guard_interval);
                    dvb_fe_store_parm(p, DTV_HIERARCHY, params.tuning.hierarchy);
                }
            }

            if dvb_fe_set_parms(p) < 0 {
                bail!("Couldn't set the frontend parameters");
            }
        }

        Ok(())
    }

    fn set_voltage(&mut self, voltage: Voltage) -> anyhow::Result<()> {
        let v18 = (voltage == Voltage::V18) as i32;

        if unsafe { dvb_fe_sec_voltage(self.adapter.fe_parms, 1, v18) } < 0 {
            bail!("Couldn't set the LNB voltage");
        }

        Ok(())
    }

    fn set_tone(&mut self, tone: Tone) -> anyhow::Result<()> {
        let mode = match tone {
            Tone::Off => fe_sec_tone_mode::SEC_TONE_OFF,
            Tone::On => fe_sec_tone_mode::SEC_TONE_ON,
        };

        if unsafe { dvb_fe_sec_tone(self.adapter.fe_parms, mode) } < 0 {
            bail!("Couldn't set the 22 kHz tone");
        }

        Ok(())
    }

    fn send_burst(&mut self, burst: Burst) -> anyhow::Result<()> {
        let mini_b = (burst == Burst::B) as i32;

        if unsafe { dvb_fe_diseqc_burst(self.adapter.fe_parms, mini_b) } < 0 {
            bail!("Couldn't send the mini DiSEqC burst");
        }

        Ok(())
    }

    fn send_master_cmd(&mut self, cmd: &[u8]) -> anyhow::Result<()> {
        let ret =
            unsafe { dvb_fe_diseqc_cmd(self.adapter.fe_parms, cmd.len() as u32, cmd.as_ptr()) };
        if ret < 0 {
            bail!("Couldn't send the DiSEqC command");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pes_type_per_slot() {
        assert!(matches!(pes_type(SlotType::Audio), dmx_ts_pes::DMX_PES_AUDIO0));
        assert!(matches!(pes_type(SlotType::Video), dmx_ts_pes::DMX_PES_VIDEO0));
        assert!(matches!(pes_type(SlotType::Pcr), dmx_ts_pes::DMX_PES_PCR0));
        assert!(matches!(pes_type(SlotType::Teletext), dmx_ts_pes::DMX_PES_TELETEXT0));
        assert!(matches!(pes_type(SlotType::Dolby), dmx_ts_pes::DMX_PES_OTHER));
        assert!(matches!(pes_type(SlotType::Other), dmx_ts_pes::DMX_PES_OTHER));
    }
}
