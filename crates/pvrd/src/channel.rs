use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::Deserialize;

use crate::config::ChannelConfig;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("invalid source: '{0}'")]
    InvalidSource(String),

    #[error("invalid polarization: '{0}'")]
    InvalidPolarization(String),
}

/// Where a channel is broadcast from.
#[derive(Copy, Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[serde(try_from = "String")]
pub enum Source {
    /// A satellite at the given orbital position in tenths of a degree, east positive.
    /// `None` stands for any satellite.
    Satellite(Option<i16>),
    Cable,
    Terrestrial,
}

impl Source {
    pub fn is_satellite(&self) -> bool {
        matches!(self, Self::Satellite(_))
    }

    pub fn is_cable(&self) -> bool {
        matches!(self, Self::Cable)
    }

    pub fn is_terrestrial(&self) -> bool {
        matches!(self, Self::Terrestrial)
    }

    /// Whether this is the generic satellite source that stands for every position.
    pub fn is_generic_satellite(&self) -> bool {
        matches!(self, Self::Satellite(None))
    }
}

impl FromStr for Source {
    type Err = SourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SourceError::InvalidSource(s.to_string());

        match s.trim() {
            "C" => Ok(Self::Cable),
            "T" => Ok(Self::Terrestrial),
            "S" => Ok(Self::Satellite(None)),
            s if s.starts_with('S') && s.len() > 2 => {
                let (degrees, east_west) = s[1..].split_at(s.len() - 2);
                let degrees = degrees.parse::<f32>().map_err(|_| invalid())?;
                let position = (degrees * 10.0).round() as i16;

                match east_west {
                    "E" => Ok(Self::Satellite(Some(position))),
                    "W" => Ok(Self::Satellite(Some(-position))),
                    _ => Err(invalid()),
                }
            }
            _ => Err(invalid()),
        }
    }
}

impl TryFrom<String> for Source {
    type Error = SourceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl Display for Source {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Satellite(None) => write!(f, "S"),
            Self::Satellite(Some(position)) => {
                let east_west = if *position < 0 { 'W' } else { 'E' };
                let position = position.unsigned_abs();
                write!(f, "S{}.{}{}", position / 10, position % 10, east_west)
            }
            Self::Cable => write!(f, "C"),
            Self::Terrestrial => write!(f, "T"),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(try_from = "String")]
pub enum Polarization {
    #[default]
    Horizontal,
    Vertical,
    CircularLeft,
    CircularRight,
}

impl Polarization {
    /// LNBs select vertical and circular right polarization with 13 V.
    pub fn is_low_voltage(&self) -> bool {
        matches!(self, Self::Vertical | Self::CircularRight)
    }

    fn transponder_offset(&self) -> u32 {
        match self {
            Self::Horizontal => 100_000,
            Self::Vertical => 200_000,
            Self::CircularLeft => 300_000,
            Self::CircularRight => 400_000,
        }
    }
}

impl FromStr for Polarization {
    type Err = SourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "H" => Ok(Self::Horizontal),
            "V" => Ok(Self::Vertical),
            "L" => Ok(Self::CircularLeft),
            "R" => Ok(Self::CircularRight),
            _ => Err(SourceError::InvalidPolarization(s.to_string())),
        }
    }
}

impl TryFrom<String> for Polarization {
    type Error = SourceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Modulation parameters for cable and terrestrial frontends, as the raw enumeration
/// values of the Linux DVB API.
#[derive(Copy, Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct TuningParams {
    pub inversion: u32,
    pub code_rate_hp: u32,
    pub code_rate_lp: u32,
    pub modulation: u32,
    pub bandwidth_hz: u32,
    pub transmission_mode: u32,
    pub guard_interval: u32,
    pub hierarchy: u32,
}

impl Default for TuningParams {
    fn default() -> Self {
        Self {
            inversion: 2,
            code_rate_hp: 9,
            code_rate_lp: 9,
            modulation: 6,
            bandwidth_hz: 8_000_000,
            transmission_mode: 2,
            guard_interval: 4,
            hierarchy: 4,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Channel {
    pub number: u32,
    pub name: String,
    pub source: Source,

    /// MHz for satellite channels, kHz or Hz for the others.
    pub frequency: u32,
    pub polarization: Polarization,

    /// kSym/s
    pub symbol_rate: u32,
    pub tuning: TuningParams,

    pub vpid: u16,
    pub ppid: u16,
    pub apids: Vec<u16>,
    pub alangs: Vec<String>,
    pub dpids: Vec<u16>,
    pub dlangs: Vec<String>,
    pub spids: Vec<u16>,
    pub tpid: u16,

    /// Conditional access ids. Values below 0x100 select a CAM slot directly.
    pub ca: Vec<u16>,
    pub sid: u16,
}

impl Channel {
    /// Identifies the carrier, so that channels on the same transponder compare equal.
    pub fn transponder(&self) -> u32 {
        let mut transponder = self.frequency;
        while transponder > 20_000 {
            transponder /= 1000;
        }

        if self.source.is_satellite() {
            transponder += self.polarization.transponder_offset();
        }

        transponder
    }

    pub fn apid(&self, i: usize) -> u16 {
        self.apids.get(i).copied().unwrap_or_default()
    }

    pub fn dpid(&self, i: usize) -> u16 {
        self.dpids.get(i).copied().unwrap_or_default()
    }

    pub fn is_free_to_air(&self) -> bool {
        self.ca.iter().all(|&ca| ca == 0)
    }

    pub fn is_encrypted(&self) -> bool {
        self.ca.iter().any(|&ca| ca >= 0x100)
    }

    pub fn has_same_tuning(&self, other: &Self) -> bool {
        self.source == other.source
            && self.transponder() == other.transponder()
            && self.frequency == other.frequency
            && self.symbol_rate == other.symbol_rate
    }
}

impl Display for Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.number, self.name)
    }
}

impl From<&ChannelConfig> for Channel {
    fn from(value: &ChannelConfig) -> Self {
        Self {
            number: value.number,
            name: value.name.clone(),
            source: value.source,
            frequency: value.frequency,
            polarization: value.polarization,
            symbol_rate: value.symbol_rate,
            tuning: value.tuning,
            vpid: value.vpid,
            ppid: value.ppid.unwrap_or(value.vpid),
            apids: value.apids.clone(),
            alangs: value.alangs.clone(),
            dpids: value.dpids.clone(),
            dlangs: value.dlangs.clone(),
            spids: value.spids.clone(),
            tpid: value.tpid,
            ca: value.ca.clone(),
            sid: value.sid,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn satellite_channel(number: u32, frequency: u32, polarization: Polarization) -> Channel {
        Channel {
            number,
            name: format!("Channel {}", number),
            source: Source::Satellite(Some(192)),
            frequency,
            polarization,
            symbol_rate: 27500,
            tuning: TuningParams::default(),
            vpid: 0x100 + number as u16 * 0x10,
            ppid: 0x100 + number as u16 * 0x10,
            apids: vec![0x101 + number as u16 * 0x10],
            alangs: vec!["deu".to_string()],
            dpids: vec![],
            dlangs: vec![],
            spids: vec![],
            tpid: 0,
            ca: vec![],
            sid: number as u16,
        }
    }

    #[test]
    fn test_parse_source() {
        assert_eq!("S19.2E".parse::<Source>().unwrap(), Source::Satellite(Some(192)));
        assert_eq!("S61.5W".parse::<Source>().unwrap(), Source::Satellite(Some(-615)));
        assert_eq!("S".parse::<Source>().unwrap(), Source::Satellite(None));
        assert_eq!("C".parse::<Source>().unwrap(), Source::Cable);
        assert_eq!("T".parse::<Source>().unwrap(), Source::Terrestrial);
        assert!("S19.2X".parse::<Source>().is_err());
        assert!("X".parse::<Source>().is_err());

        assert_eq!(Source::Satellite(Some(-615)).to_string(), "S61.5W");
        assert_eq!(Source::Satellite(Some(130)).to_string(), "S13.0E");
    }

    #[test]
    fn test_transponder() {
        let horizontal = satellite_channel(1, 11_837, Polarization::Horizontal);
        let vertical = satellite_channel(2, 11_837, Polarization::Vertical);

        assert_eq!(horizontal.transponder(), 111_837);
        assert_eq!(vertical.transponder(), 211_837);
        assert!(!horizontal.has_same_tuning(&vertical));

        let mut sibling = satellite_channel(3, 11_837, Polarization::Horizontal);
        sibling.sid = 42;
        assert!(horizontal.has_same_tuning(&sibling));

        let mut cable = satellite_channel(4, 394_000, Polarization::Horizontal);
        cable.source = Source::Cable;
        assert_eq!(cable.transponder(), 394);
    }

    #[test]
    fn test_conditional_access() {
        let mut channel = satellite_channel(1, 12_000, Polarization::Vertical);
        assert!(channel.is_free_to_air());
        assert!(!channel.is_encrypted());

        channel.ca = vec![0x1702];
        assert!(!channel.is_free_to_air());
        assert!(channel.is_encrypted());

        channel.ca = vec![2];
        assert!(!channel.is_free_to_air());
        assert!(!channel.is_encrypted());
    }
}
