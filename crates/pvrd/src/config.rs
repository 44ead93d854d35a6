use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::channel::{Polarization, Source, TuningParams};
use crate::tuner::FrontendKind;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SetupConfig {
    /// 1-based number of the device used for live view and replay.
    pub primary_device: usize,

    /// Minimum priority a recording needs to take over the primary device.
    pub primary_limit: i32,
    pub default_priority: i32,

    pub diseqc: bool,

    /// Switch frequency between the low and high LNB bands, in MHz.
    pub lnb_slof: u32,
    pub lnb_frequ_lo: u32,
    pub lnb_frequ_hi: u32,

    pub multi_speed_mode: bool,
    pub use_dolby_digital: bool,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            primary_device: 1,
            primary_limit: 0,
            default_priority: 50,
            diseqc: false,
            lnb_slof: 11700,
            lnb_frequ_lo: 9750,
            lnb_frequ_hi: 10600,
            multi_speed_mode: true,
            use_dolby_digital: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceConfig {
    Dvb {
        adapter_num: u8,
        frontend_num: u8,

        #[serde(default)]
        cams: usize,

        #[serde(default)]
        ca_ids: Vec<u16>,
    },
    File {
        /// A transport stream file, or `-` for stdin.
        path: PathBuf,
        sources: Vec<Source>,

        #[serde(default = "default_frontend")]
        frontend: FrontendKind,

        #[serde(default)]
        lock_delay_ms: u64,
    },
    Output {
        /// Where the played stream is written as MPEG-TS, or `-` for stdout.
        path: PathBuf,
    },
}

fn default_frontend() -> FrontendKind {
    FrontendKind::Satellite
}

#[derive(Clone, Debug, Deserialize)]
pub struct DiseqcConfig {
    pub source: Source,
    pub slof: u32,
    pub polarization: Polarization,
    pub lof: u32,
    pub commands: String,

    /// Restricts the entry to these device numbers. Empty means all devices.
    #[serde(default)]
    pub devices: Vec<usize>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ChannelConfig {
    pub number: u32,
    pub name: String,
    pub source: Source,
    pub frequency: u32,

    #[serde(default)]
    pub polarization: Polarization,

    #[serde(default)]
    pub symbol_rate: u32,

    #[serde(flatten)]
    pub tuning: TuningParams,

    #[serde(default)]
    pub vpid: u16,

    /// Defaults to the video PID.
    #[serde(default)]
    pub ppid: Option<u16>,

    #[serde(default)]
    pub apids: Vec<u16>,

    #[serde(default)]
    pub alangs: Vec<String>,

    #[serde(default)]
    pub dpids: Vec<u16>,

    #[serde(default)]
    pub dlangs: Vec<String>,

    #[serde(default)]
    pub spids: Vec<u16>,

    #[serde(default)]
    pub tpid: u16,

    #[serde(default)]
    pub ca: Vec<u16>,

    #[serde(default)]
    pub sid: u16,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub setup: SetupConfig,

    #[serde(default)]
    pub devices: Vec<DeviceConfig>,

    #[serde(default)]
    pub diseqc: Vec<DiseqcConfig>,

    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let file = std::fs::read_to_string(path)?;
        let config = toml::from_str(&file)?;

        Ok(config)
    }
}
