use crate::prelude::*;

use num_enum::TryFromPrimitive;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Raw register values collected during one cycle, keyed by address.
pub type RegisterMap = HashMap<u16, u16>;

// ReadBlock {{{
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ReadBlock {
    pub start: u16,
    pub count: u16,
}

impl ReadBlock {
    pub const fn new(start: u16, count: u16) -> Self {
        Self { start, count }
    }

    pub fn addresses(&self) -> impl Iterator<Item = u16> {
        let start = self.start;
        (0..self.count).map(move |i| start.wrapping_add(i))
    }
}

impl From<(u16, u16)> for ReadBlock {
    fn from((start, count): (u16, u16)) -> Self {
        Self::new(start, count)
    }
} // }}}

// telemetry blocks: 59-113 (status, energy, temps, PV) and 150-194 (grid, load, battery)
pub const INPUT_READ_PLAN: [ReadBlock; 2] = [ReadBlock::new(59, 55), ReadBlock::new(150, 45)];
// configuration blocks, read as holding registers
pub const HOLDING_READ_PLAN: [ReadBlock; 2] = [ReadBlock::new(100, 15), ReadBlock::new(148, 42)];
pub const DEVICE_INFO_BLOCK: ReadBlock = ReadBlock::new(0, 16);

// Encoding {{{
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Encoding {
    Unsigned,
    /// two's complement 16-bit
    Signed,
    /// raw value minus a fixed offset before scaling
    Offset(u16),
} // }}}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RegisterDefinition {
    pub address: u16,
    pub name: &'static str,
    pub unit: Option<&'static str>,
    pub scale: f64,
    pub precision: u32,
    pub encoding: Encoding,
}

impl RegisterDefinition {
    pub fn signed(&self) -> bool {
        self.encoding == Encoding::Signed
    }
}

/// A 32-bit value split across a low and a high register.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CompositeDefinition {
    pub low: u16,
    pub high: u16,
    pub name: &'static str,
    pub unit: Option<&'static str>,
    pub scale: f64,
    pub precision: u32,
}

const fn def(
    address: u16,
    name: &'static str,
    unit: Option<&'static str>,
    scale: f64,
    precision: u32,
    encoding: Encoding,
) -> RegisterDefinition {
    RegisterDefinition {
        address,
        name,
        unit,
        scale,
        precision,
        encoding,
    }
}

const fn total(low: u16, high: u16, name: &'static str) -> CompositeDefinition {
    CompositeDefinition {
        low,
        high,
        name,
        unit: Some(KWH),
        scale: 0.1,
        precision: 1,
    }
}

use Encoding::{Offset, Signed, Unsigned};

const VOLT: &str = "V";
const AMP: &str = "A";
const WATT: &str = "W";
const HERTZ: &str = "Hz";
const CELSIUS: &str = "°C";
const KWH: &str = "kWh";
const PERCENT: &str = "%";

// Telemetry names {{{
pub const RUNNING_STATE: &str = "Running State";
pub const GRID_CONNECTED_STATUS: &str = "Grid Connected Status";
pub const BATTERY_TEMPERATURE: &str = "Battery Temperature";
pub const DAILY_PV_ENERGY: &str = "Daily PV Energy";
pub const TOTAL_PV_ENERGY: &str = "Total PV Energy";
pub const TOTAL_BATTERY_DISCHARGE_ENERGY: &str = "Total Battery Discharge Energy";
pub const DAILY_CO2_SAVED: &str = "Daily CO2 Saved";
pub const TOTAL_CO2_SAVED: &str = "Total CO2 Saved";
pub const BATTERY_CYCLES: &str = "Battery Cycles";
pub const BATTERY_HEALTH: &str = "Battery Health";
// }}}

pub const REGISTERS_PV: &[RegisterDefinition] = &[
    def(109, "PV1 Voltage", Some(VOLT), 0.1, 1, Unsigned),
    def(110, "PV1 Current", Some(AMP), 0.1, 1, Unsigned),
    def(186, "PV1 Power", Some(WATT), 1.0, 0, Unsigned),
    def(111, "PV2 Voltage", Some(VOLT), 0.1, 1, Unsigned),
    def(112, "PV2 Current", Some(AMP), 0.1, 1, Unsigned),
    def(187, "PV2 Power", Some(WATT), 1.0, 0, Unsigned),
];

pub const REGISTERS_BATTERY: &[RegisterDefinition] = &[
    def(184, "Battery SOC", Some(PERCENT), 1.0, 0, Unsigned),
    def(183, "Battery Voltage", Some(VOLT), 0.01, 2, Unsigned),
    def(190, "Battery Current", Some(AMP), 0.01, 2, Signed),
    def(191, "Battery Power", Some(WATT), 1.0, 0, Signed),
    // stored as tenths of a degree above -100.0
    def(182, BATTERY_TEMPERATURE, Some(CELSIUS), 0.1, 1, Offset(1000)),
];

pub const REGISTERS_GRID: &[RegisterDefinition] = &[
    def(150, "Grid Voltage", Some(VOLT), 0.1, 1, Unsigned),
    def(160, "Grid Current", Some(AMP), 0.01, 2, Signed),
    def(169, "Grid Power", Some(WATT), 1.0, 0, Signed),
    def(79, "Grid Frequency", Some(HERTZ), 0.01, 2, Unsigned),
    def(172, "Grid CT Power", Some(WATT), 1.0, 0, Signed),
];

pub const REGISTERS_LOAD: &[RegisterDefinition] = &[
    def(178, "Load Power", Some(WATT), 1.0, 0, Unsigned),
    def(192, "Load Frequency", Some(HERTZ), 0.01, 2, Unsigned),
];

pub const REGISTERS_INVERTER: &[RegisterDefinition] = &[
    def(175, "Inverter Power", Some(WATT), 1.0, 0, Signed),
    def(154, "Inverter Voltage", Some(VOLT), 0.1, 1, Unsigned),
    def(164, "Inverter Current", Some(AMP), 0.01, 2, Unsigned),
    def(193, "Inverter Frequency", Some(HERTZ), 0.01, 2, Unsigned),
];

pub const REGISTERS_TEMPERATURE: &[RegisterDefinition] = &[
    def(90, "DC Transformer Temperature", Some(CELSIUS), 0.1, 1, Signed),
    def(91, "Radiator Temperature", Some(CELSIUS), 0.1, 1, Signed),
    def(95, "Ambient Temperature", Some(CELSIUS), 0.1, 1, Signed),
];

pub const REGISTERS_ENERGY_DAILY: &[RegisterDefinition] = &[
    def(108, DAILY_PV_ENERGY, Some(KWH), 0.1, 1, Unsigned),
    def(70, "Daily Battery Charge Energy", Some(KWH), 0.1, 1, Unsigned),
    def(71, "Daily Battery Discharge Energy", Some(KWH), 0.1, 1, Unsigned),
    def(76, "Daily Grid Import Energy", Some(KWH), 0.1, 1, Unsigned),
    def(77, "Daily Grid Export Energy", Some(KWH), 0.1, 1, Unsigned),
    def(84, "Daily Load Energy", Some(KWH), 0.1, 1, Unsigned),
];

pub const REGISTERS_STATUS: &[RegisterDefinition] = &[
    def(59, RUNNING_STATE, None, 1.0, 0, Unsigned),
    def(194, GRID_CONNECTED_STATUS, None, 1.0, 0, Unsigned),
    def(60, "Daily Active Energy", Some(KWH), 0.1, 1, Unsigned),
];

pub const REGISTERS_ENERGY_TOTAL: &[CompositeDefinition] = &[
    total(96, 97, TOTAL_PV_ENERGY),
    total(72, 73, "Total Battery Charge Energy"),
    total(74, 75, TOTAL_BATTERY_DISCHARGE_ENERGY),
    total(78, 79, "Total Grid Import Energy"),
    total(81, 82, "Total Grid Export Energy"),
    total(85, 86, "Total Load Energy"),
];

pub fn single_registers() -> Vec<RegisterDefinition> {
    [
        REGISTERS_PV,
        REGISTERS_BATTERY,
        REGISTERS_GRID,
        REGISTERS_LOAD,
        REGISTERS_INVERTER,
        REGISTERS_TEMPERATURE,
        REGISTERS_ENERGY_DAILY,
        REGISTERS_STATUS,
    ]
    .concat()
}

// RunningState {{{
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u16)]
pub enum RunningState {
    Standby = 0,
    SelfCheck = 1,
    Normal = 2,
    Alarm = 3,
    Fault = 4,
}

impl RunningState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunningState::Standby => "Standby",
            RunningState::SelfCheck => "Self-check",
            RunningState::Normal => "Normal",
            RunningState::Alarm => "Alarm",
            RunningState::Fault => "Fault",
        }
    }

    pub fn describe(raw: u16) -> String {
        match Self::try_from(raw) {
            Ok(state) => state.as_str().to_owned(),
            Err(_) => format!("Unknown ({})", raw),
        }
    }
} // }}}

pub struct DeviceTypeString;
impl DeviceTypeString {
    pub fn from_value(code: u16) -> String {
        match code {
            0x0002 => "String Inverter".to_owned(),
            0x0003 => "Single-phase Hybrid Inverter".to_owned(),
            0x0004 => "Microinverter".to_owned(),
            0x0005 => "Low-voltage Three-phase Hybrid Inverter".to_owned(),
            0x0006 => "High-voltage Three-phase Hybrid Inverter".to_owned(),
            _ => format!("Type {}", code),
        }
    }
}
