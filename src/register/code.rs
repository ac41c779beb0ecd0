//! Register codes: six-byte measurement channel identifiers ("1.0.1.8.0.255").
//!
//! Classification is driven by byte-range match tables, so a code never needs
//! to be one of the named constants to be recognised as, say, cumulative.
//! The sixth byte doubles as a marker for fictive (derived) codes:
//! - `100`: delta of the cumulative register with the same first five bytes
//! - `200`: interim (period total) of that register

use core::fmt;
use std::error::Error;
use std::ops::RangeInclusive;
use std::str::FromStr;

const DELTA_MARKER: u8 = 100;
const INTERIM_MARKER: u8 = 200;
const PHYSICAL_MARKER: u8 = 255;
const MAX_PACKED: i64 = (1 << 48) - 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterCodeError {
    /// Text was not six dot-separated byte values.
    Format(String),
    /// Packed integer outside 0..2^48.
    OutOfRange(i64),
}

impl fmt::Display for RegisterCodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterCodeError::Format(s) => write!(f, "malformed register code '{}'", s),
            RegisterCodeError::OutOfRange(v) => write!(f, "packed register code {} is outside 48 bits", v),
        }
    }
}

impl Error for RegisterCodeError {}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegisterCode([u8; 6]);

type CodePattern = [RangeInclusive<u8>; 6];

const ANY: RangeInclusive<u8> = 0..=255;
const CHANNEL: RangeInclusive<u8> = 0..=64;

// Active energy import/export, total and per phase (C = 1/2, 21/22, 41/42, 61/62).
static CUMULATIVE: [CodePattern; 6] = [
    [1..=1, CHANNEL, 1..=2, 8..=8, 0..=63, PHYSICAL_MARKER..=PHYSICAL_MARKER],
    [1..=1, CHANNEL, 21..=22, 8..=8, 0..=63, PHYSICAL_MARKER..=PHYSICAL_MARKER],
    [1..=1, CHANNEL, 41..=42, 8..=8, 0..=63, PHYSICAL_MARKER..=PHYSICAL_MARKER],
    [1..=1, CHANNEL, 61..=62, 8..=8, 0..=63, PHYSICAL_MARKER..=PHYSICAL_MARKER],
    // cold/hot water volume
    [8..=9, CHANNEL, 1..=1, 0..=0, 0..=0, PHYSICAL_MARKER..=PHYSICAL_MARKER],
    // heat energy and heat volume
    [6..=6, CHANNEL, 1..=2, 0..=0, 0..=0, PHYSICAL_MARKER..=PHYSICAL_MARKER],
];

static IMPORT: [CodePattern; 4] = [
    [1..=1, CHANNEL, 1..=1, 7..=8, ANY, ANY],
    [1..=1, CHANNEL, 21..=21, 7..=8, ANY, ANY],
    [1..=1, CHANNEL, 41..=41, 7..=8, ANY, ANY],
    [1..=1, CHANNEL, 61..=61, 7..=8, ANY, ANY],
];

static EXPORT: [CodePattern; 4] = [
    [1..=1, CHANNEL, 2..=2, 7..=8, ANY, ANY],
    [1..=1, CHANNEL, 22..=22, 7..=8, ANY, ANY],
    [1..=1, CHANNEL, 42..=42, 7..=8, ANY, ANY],
    [1..=1, CHANNEL, 62..=62, 7..=8, ANY, ANY],
];

static DISCONNECT_CONTROL: [CodePattern; 1] = [[0..=0, CHANNEL, 96..=96, 3..=3, 10..=10, PHYSICAL_MARKER..=PHYSICAL_MARKER]];

fn matches_any(patterns: &[CodePattern], bytes: &[u8; 6]) -> bool {
    patterns
        .iter()
        .any(|pattern| pattern.iter().zip(bytes.iter()).all(|(range, b)| range.contains(b)))
}

impl RegisterCode {
    pub const ELECTR_ACTIVE_ENERGY_IMPORT: RegisterCode = RegisterCode([1, 0, 1, 8, 0, 255]);
    pub const ELECTR_ACTIVE_ENERGY_EXPORT: RegisterCode = RegisterCode([1, 0, 2, 8, 0, 255]);
    pub const ELECTR_ACTIVE_ENERGY_L1_IMPORT: RegisterCode = RegisterCode([1, 0, 21, 8, 0, 255]);
    pub const ELECTR_ACTIVE_ENERGY_L2_IMPORT: RegisterCode = RegisterCode([1, 0, 41, 8, 0, 255]);
    pub const ELECTR_ACTIVE_ENERGY_L3_IMPORT: RegisterCode = RegisterCode([1, 0, 61, 8, 0, 255]);
    pub const ELECTR_ACTUAL_POWER_IMPORT: RegisterCode = RegisterCode([1, 0, 1, 7, 0, 255]);
    pub const ELECTR_ACTUAL_POWER_EXPORT: RegisterCode = RegisterCode([1, 0, 2, 7, 0, 255]);
    pub const ELECTR_ACTUAL_POWER_L1_IMPORT: RegisterCode = RegisterCode([1, 0, 21, 7, 0, 255]);
    pub const ELECTR_ACTUAL_POWER_L2_IMPORT: RegisterCode = RegisterCode([1, 0, 41, 7, 0, 255]);
    pub const ELECTR_ACTUAL_POWER_L3_IMPORT: RegisterCode = RegisterCode([1, 0, 61, 7, 0, 255]);
    /// Import minus export; only ever produced as a delta or interim value.
    pub const ELECTR_ACTIVE_ENERGY_NET_DELTA: RegisterCode = RegisterCode([1, 0, 16, 8, 0, DELTA_MARKER]);
    pub const ELECTR_ACTIVE_ENERGY_NET_INTERIM: RegisterCode = RegisterCode([1, 0, 16, 8, 0, INTERIM_MARKER]);

    pub const COLD_WATER_VOLUME: RegisterCode = RegisterCode([8, 0, 1, 0, 0, 255]);
    pub const COLD_WATER_FLOW: RegisterCode = RegisterCode([8, 0, 2, 0, 0, 255]);
    pub const HOT_WATER_VOLUME: RegisterCode = RegisterCode([9, 0, 1, 0, 0, 255]);
    pub const HOT_WATER_FLOW: RegisterCode = RegisterCode([9, 0, 2, 0, 0, 255]);

    pub const HEAT_ENERGY: RegisterCode = RegisterCode([6, 0, 1, 0, 0, 255]);
    pub const HEAT_VOLUME: RegisterCode = RegisterCode([6, 0, 2, 0, 0, 255]);
    pub const HEAT_POWER: RegisterCode = RegisterCode([6, 0, 8, 0, 0, 255]);
    pub const HEAT_FLOW: RegisterCode = RegisterCode([6, 0, 9, 0, 0, 255]);
    pub const HEAT_FLOW_TEMPERATURE: RegisterCode = RegisterCode([6, 0, 10, 0, 0, 255]);
    pub const HEAT_RETURN_TEMPERATURE: RegisterCode = RegisterCode([6, 0, 11, 0, 0, 255]);

    pub const DISCONNECT_CONTROL: RegisterCode = RegisterCode([0, 0, 96, 3, 10, 255]);

    pub const fn new(a: u8, b: u8, c: u8, d: u8, e: u8, f: u8) -> Self {
        RegisterCode([a, b, c, d, e, f])
    }

    pub fn bytes(&self) -> [u8; 6] {
        self.0
    }

    pub fn is_cumulative(&self) -> bool {
        matches_any(&CUMULATIVE, &self.0)
    }

    pub fn is_import(&self) -> bool {
        matches_any(&IMPORT, &self.0)
    }

    pub fn is_export(&self) -> bool {
        matches_any(&EXPORT, &self.0)
    }

    pub fn is_delta(&self) -> bool {
        self.0[5] == DELTA_MARKER
    }

    pub fn is_interim(&self) -> bool {
        self.0[5] == INTERIM_MARKER
    }

    pub fn is_fictive(&self) -> bool {
        self.is_delta() || self.is_interim()
    }

    pub fn is_disconnect_control(&self) -> bool {
        matches_any(&DISCONNECT_CONTROL, &self.0)
    }

    pub fn is_electricity(&self) -> bool {
        self.0[0] == 1
    }

    pub fn is_water(&self) -> bool {
        matches!(self.0[0], 8 | 9)
    }

    pub fn is_heat(&self) -> bool {
        self.0[0] == 6
    }

    pub const fn to_delta_variant(self) -> Self {
        self.with_marker(DELTA_MARKER)
    }

    pub const fn to_interim_variant(self) -> Self {
        self.with_marker(INTERIM_MARKER)
    }

    const fn with_marker(self, marker: u8) -> Self {
        let mut bytes = self.0;
        bytes[5] = marker;
        RegisterCode(bytes)
    }

    /// Big-endian packing into the low 48 bits.
    pub fn to_i64(self) -> i64 {
        self.0.iter().fold(0i64, |acc, b| (acc << 8) | i64::from(*b))
    }

    pub fn from_i64(packed: i64) -> Result<Self, RegisterCodeError> {
        if !(0..=MAX_PACKED).contains(&packed) {
            return Err(RegisterCodeError::OutOfRange(packed));
        }
        let mut bytes = [0u8; 6];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = ((packed >> (8 * (5 - i))) & 0xff) as u8;
        }
        Ok(RegisterCode(bytes))
    }

    /// Registry name for named codes and their delta/interim variants.
    pub fn name(&self) -> Option<String> {
        if let Some((_, name)) = KNOWN_REGISTERS.iter().find(|(code, _)| code == self) {
            return Some((*name).to_string());
        }
        let physical = self.with_marker(PHYSICAL_MARKER);
        let (_, base) = KNOWN_REGISTERS.iter().find(|(code, _)| *code == physical && code.is_cumulative())?;
        if self.is_delta() {
            Some(format!("{}_delta", base))
        } else if self.is_interim() {
            Some(format!("{}_interim", base))
        } else {
            None
        }
    }

    /// Every named code plus the delta and interim variant of each cumulative one.
    pub fn all_known() -> Vec<RegisterCode> {
        let mut codes = Vec::with_capacity(KNOWN_REGISTERS.len() * 2);
        for (code, _) in KNOWN_REGISTERS {
            codes.push(*code);
            if code.is_cumulative() {
                codes.push(code.to_delta_variant());
                codes.push(code.to_interim_variant());
            }
        }
        codes
    }
}

pub static KNOWN_REGISTERS: &[(RegisterCode, &str)] = &[
    (RegisterCode::ELECTR_ACTIVE_ENERGY_IMPORT, "electr_active_energy_import"),
    (RegisterCode::ELECTR_ACTIVE_ENERGY_EXPORT, "electr_active_energy_export"),
    (RegisterCode::ELECTR_ACTIVE_ENERGY_L1_IMPORT, "electr_active_energy_l1_import"),
    (RegisterCode::ELECTR_ACTIVE_ENERGY_L2_IMPORT, "electr_active_energy_l2_import"),
    (RegisterCode::ELECTR_ACTIVE_ENERGY_L3_IMPORT, "electr_active_energy_l3_import"),
    (RegisterCode::ELECTR_ACTUAL_POWER_IMPORT, "electr_actual_power_import"),
    (RegisterCode::ELECTR_ACTUAL_POWER_EXPORT, "electr_actual_power_export"),
    (RegisterCode::ELECTR_ACTUAL_POWER_L1_IMPORT, "electr_actual_power_l1_import"),
    (RegisterCode::ELECTR_ACTUAL_POWER_L2_IMPORT, "electr_actual_power_l2_import"),
    (RegisterCode::ELECTR_ACTUAL_POWER_L3_IMPORT, "electr_actual_power_l3_import"),
    (RegisterCode::ELECTR_ACTIVE_ENERGY_NET_DELTA, "electr_active_energy_net_delta"),
    (RegisterCode::ELECTR_ACTIVE_ENERGY_NET_INTERIM, "electr_active_energy_net_interim"),
    (RegisterCode::COLD_WATER_VOLUME, "cold_water_volume"),
    (RegisterCode::COLD_WATER_FLOW, "cold_water_flow"),
    (RegisterCode::HOT_WATER_VOLUME, "hot_water_volume"),
    (RegisterCode::HOT_WATER_FLOW, "hot_water_flow"),
    (RegisterCode::HEAT_ENERGY, "heat_energy"),
    (RegisterCode::HEAT_VOLUME, "heat_volume"),
    (RegisterCode::HEAT_POWER, "heat_power"),
    (RegisterCode::HEAT_FLOW, "heat_flow"),
    (RegisterCode::HEAT_FLOW_TEMPERATURE, "heat_flow_temperature"),
    (RegisterCode::HEAT_RETURN_TEMPERATURE, "heat_return_temperature"),
    (RegisterCode::DISCONNECT_CONTROL, "disconnect_control"),
];

fn parse_component(part: &str) -> Option<u8> {
    let canonical = !part.is_empty()
        && part.len() <= 3
        && part.bytes().all(|b| b.is_ascii_digit())
        && (part == "0" || !part.starts_with('0'));
    if canonical { part.parse().ok() } else { None }
}

impl FromStr for RegisterCode {
    type Err = RegisterCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split('.');
        for b in bytes.iter_mut() {
            *b = parts
                .next()
                .and_then(parse_component)
                .ok_or_else(|| RegisterCodeError::Format(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(RegisterCodeError::Format(s.to_string()));
        }
        Ok(RegisterCode(bytes))
    }
}

impl fmt::Display for RegisterCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{}.{}.{}.{}.{}.{}", a, b, c, d, e, g)
    }
}

impl serde::Serialize for RegisterCode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for RegisterCode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;
        impl serde::de::Visitor<'_> for V {
            type Value = RegisterCode;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "a register code such as \"1.0.1.8.0.255\"")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                value.parse().map_err(E::custom)
            }
        }
        deserializer.deserialize_str(V)
    }
}
