use std::fmt::{self, Display, Formatter};
use std::time::Duration;

use crate::channel::{Polarization, Source};
use crate::config::DiseqcConfig;

pub const MAX_DISEQC_CMD_LEN: usize = 6;

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum DiseqcError {
    #[error("unknown action '{0}' at position {1}")]
    UnknownAction(char, usize),

    #[error("missing wait time at position {0}")]
    MissingWaitTime(usize),

    #[error("unterminated command at position {0}")]
    UnterminatedCommand(usize),

    #[error("invalid command byte '{0}'")]
    InvalidCommandByte(String),

    #[error("command longer than {} bytes", MAX_DISEQC_CMD_LEN)]
    CommandTooLong,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DiseqcAction {
    ToneOff,
    ToneOn,
    Voltage13,
    Voltage18,
    MiniA,
    MiniB,
    Wait(Duration),
    Command(Vec<u8>),
}

/// A sequence of DiSEqC actions, as written in the configuration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiseqcCommands {
    text: String,
    actions: Vec<DiseqcAction>,
}

impl DiseqcCommands {
    pub fn parse(text: &str) -> Result<Self, DiseqcError> {
        let chars = text.char_indices().collect::<Vec<_>>();
        let mut actions = Vec::new();
        let mut i = 0;

        while i < chars.len() {
            let (position, c) = chars[i];
            i += 1;

            match c {
                c if c.is_whitespace() => {}
                't' => actions.push(DiseqcAction::ToneOff),
                'T' => actions.push(DiseqcAction::ToneOn),
                'v' => actions.push(DiseqcAction::Voltage13),
                'V' => actions.push(DiseqcAction::Voltage18),
                'A' => actions.push(DiseqcAction::MiniA),
                'B' => actions.push(DiseqcAction::MiniB),
                'W' => {
                    let digits = chars[i..]
                        .iter()
                        .take_while(|(_, c)| c.is_ascii_digit())
                        .map(|(_, c)| *c)
                        .collect::<String>();

                    let millis = digits
                        .parse::<u64>()
                        .map_err(|_| DiseqcError::MissingWaitTime(position))?;

                    i += digits.len();
                    actions.push(DiseqcAction::Wait(Duration::from_millis(millis)));
                }
                '[' => {
                    let Some(end) = chars[i..].iter().position(|(_, c)| *c == ']') else {
                        return Err(DiseqcError::UnterminatedCommand(position));
                    };

                    let body = chars[i..i + end].iter().map(|(_, c)| *c).collect::<String>();
                    let bytes = body
                        .split_whitespace()
                        .map(|byte| {
                            u8::from_str_radix(byte, 16)
                                .map_err(|_| DiseqcError::InvalidCommandByte(byte.to_string()))
                        })
                        .collect::<Result<Vec<_>, _>>()?;

                    if bytes.len() > MAX_DISEQC_CMD_LEN {
                        return Err(DiseqcError::CommandTooLong);
                    }

                    i += end + 1;
                    actions.push(DiseqcAction::Command(bytes));
                }
                c => return Err(DiseqcError::UnknownAction(c, position)),
            }
        }

        Ok(Self {
            text: text.trim().to_string(),
            actions,
        })
    }

    pub fn actions(&self) -> &[DiseqcAction] {
        &self.actions
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl Display for DiseqcCommands {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[derive(Clone, Debug)]
pub struct Diseqc {
    pub source: Source,
    pub slof: u32,
    pub polarization: Polarization,
    pub lof: u32,
    pub commands: DiseqcCommands,
    pub devices: Vec<usize>,
}

impl Diseqc {
    fn matches(
        &self,
        device: usize,
        source: Source,
        frequency: u32,
        polarization: Polarization,
    ) -> bool {
        self.source == source
            && self.slof > frequency
            && self.polarization == polarization
            && (self.devices.is_empty() || self.devices.contains(&device))
    }
}

impl TryFrom<&DiseqcConfig> for Diseqc {
    type Error = DiseqcError;

    fn try_from(value: &DiseqcConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            source: value.source,
            slof: value.slof,
            polarization: value.polarization,
            lof: value.lof,
            commands: DiseqcCommands::parse(&value.commands)?,
            devices: value.devices.clone(),
        })
    }
}

/// The DiSEqC setup of the dish, shared by every satellite device.
#[derive(Clone, Debug, Default)]
pub struct DiseqcTable {
    entries: Vec<Diseqc>,
}

impl DiseqcTable {
    pub fn new(entries: Vec<Diseqc>) -> Self {
        Self { entries }
    }

    pub fn from_config(config: &[DiseqcConfig]) -> anyhow::Result<Self> {
        let entries = config
            .iter()
            .map(|entry| {
                Diseqc::try_from(entry).map_err(|e| {
                    anyhow::anyhow!("invalid DiSEqC commands '{}': {}", entry.commands, e)
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self::new(entries))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Finds the entry for a transponder as seen by the given device number.
    pub fn get(
        &self,
        device: usize,
        source: Source,
        frequency: u32,
        polarization: Polarization,
    ) -> Option<&Diseqc> {
        self.entries
            .iter()
            .find(|entry| entry.matches(device, source, frequency, polarization))
    }

    /// Whether the dish can be pointed at `source` for the given device number.
    pub fn provides_source(&self, device: usize, source: Source) -> bool {
        self.entries.iter().any(|entry| {
            entry.source == source && (entry.devices.is_empty() || entry.devices.contains(&device))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        let commands = DiseqcCommands::parse("t v W15 [E0 10 38 F0] W15 A W15 t").unwrap();

        assert_eq!(
            commands.actions(),
            &[
                DiseqcAction::ToneOff,
                DiseqcAction::Voltage13,
                DiseqcAction::Wait(Duration::from_millis(15)),
                DiseqcAction::Command(vec![0xE0, 0x10, 0x38, 0xF0]),
                DiseqcAction::Wait(Duration::from_millis(15)),
                DiseqcAction::MiniA,
                DiseqcAction::Wait(Duration::from_millis(15)),
                DiseqcAction::ToneOff,
            ],
        );
        assert_eq!(commands.to_string(), "t v W15 [E0 10 38 F0] W15 A W15 t");
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            DiseqcCommands::parse("t X"),
            Err(DiseqcError::UnknownAction('X', 2)),
        );
        assert_eq!(
            DiseqcCommands::parse("W t"),
            Err(DiseqcError::MissingWaitTime(0)),
        );
        assert_eq!(
            DiseqcCommands::parse("[E0 10"),
            Err(DiseqcError::UnterminatedCommand(0)),
        );
        assert_eq!(
            DiseqcCommands::parse("[E0 1G]"),
            Err(DiseqcError::InvalidCommandByte("1G".to_string())),
        );
        assert_eq!(
            DiseqcCommands::parse("[E0 10 38 F0 00 00 00]"),
            Err(DiseqcError::CommandTooLong),
        );
    }

    fn entry(source: &str, slof: u32, polarization: Polarization, devices: Vec<usize>) -> Diseqc {
        Diseqc {
            source: source.parse().unwrap(),
            slof,
            polarization,
            lof: if slof == 11700 { 9750 } else { 10600 },
            commands: DiseqcCommands::parse("t v").unwrap(),
            devices,
        }
    }

    #[test]
    fn test_lookup() {
        let table = DiseqcTable::new(vec![
            entry("S19.2E", 11700, Polarization::Vertical, vec![]),
            entry("S19.2E", 99999, Polarization::Vertical, vec![]),
            entry("S13.0E", 11700, Polarization::Horizontal, vec![2]),
        ]);
        let astra = Source::Satellite(Some(192));
        let hotbird = Source::Satellite(Some(130));

        let low = table.get(1, astra, 11_000, Polarization::Vertical).unwrap();
        assert_eq!(low.lof, 9750);

        let high = table.get(1, astra, 12_000, Polarization::Vertical).unwrap();
        assert_eq!(high.lof, 10600);

        assert!(table.get(1, astra, 11_000, Polarization::Horizontal).is_none());
        assert!(table.get(1, hotbird, 11_000, Polarization::Horizontal).is_none());
        assert!(table.get(2, hotbird, 11_000, Polarization::Horizontal).is_some());

        assert!(table.provides_source(1, astra));
        assert!(!table.provides_source(1, hotbird));
        assert!(table.provides_source(2, hotbird));
    }
}
