use crate::prelude::*;

use crate::register::{
    CompositeDefinition, Encoding, RegisterDefinition, RunningState, BATTERY_CYCLES,
    BATTERY_HEALTH, DAILY_CO2_SAVED, DAILY_PV_ENERGY, GRID_CONNECTED_STATUS, RUNNING_STATE,
    TOTAL_BATTERY_DISCHARGE_ENERGY, TOTAL_CO2_SAVED, TOTAL_PV_ENERGY,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// CalibrationConfig {{{
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
pub struct CalibrationConfig {
    /// kg CO2 avoided per kWh of PV generation
    #[serde(default = "CalibrationConfig::default_co2_factor")]
    pub co2_factor: f64,
    /// kWh; zero disables cycle tracking
    #[serde(default = "CalibrationConfig::default_battery_capacity")]
    pub battery_capacity: f64,
    #[serde(default = "CalibrationConfig::default_battery_rated_cycles")]
    pub battery_rated_cycles: u32,
}

impl CalibrationConfig {
    // average Italian grid intensity, ~256 g CO2/kWh
    fn default_co2_factor() -> f64 {
        0.256
    }

    fn default_battery_capacity() -> f64 {
        5.12
    }

    // typical LiFePO4 rating
    fn default_battery_rated_cycles() -> u32 {
        6000
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            co2_factor: Self::default_co2_factor(),
            battery_capacity: Self::default_battery_capacity(),
            battery_rated_cycles: Self::default_battery_rated_cycles(),
        }
    }
} // }}}

// Value {{{
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Text(String),
}

impl Value {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            Value::Number(_) => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{}", n),
            Value::Text(s) => write!(f, "{}", s),
        }
    }
} // }}}

// TelemetrySnapshot {{{
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct TelemetrySnapshot(BTreeMap<String, Value>);

impl TelemetrySnapshot {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Value::as_number)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_text)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    fn set_number(&mut self, name: &str, value: f64) {
        self.0.insert(name.to_owned(), Value::Number(value));
    }

    fn set_text(&mut self, name: &str, value: String) {
        self.0.insert(name.to_owned(), Value::Text(value));
    }
} // }}}

pub fn to_signed(value: u16) -> i32 {
    value as i16 as i32
}

pub fn combine_u32(low: u16, high: u16) -> u32 {
    ((high as u32) << 16) | low as u32
}

/// Rounds to `precision` decimal places, exact ties going to the even digit.
pub fn round(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (value * factor).round_ties_even() / factor
}

#[derive(Clone, Debug)]
pub struct RegisterDecoder {
    singles: Vec<RegisterDefinition>,
    composites: Vec<CompositeDefinition>,
    calibration: CalibrationConfig,
}

impl RegisterDecoder {
    pub fn new(calibration: CalibrationConfig) -> Self {
        Self::with_tables(
            register::single_registers(),
            register::REGISTERS_ENERGY_TOTAL.to_vec(),
            calibration,
        )
    }

    pub fn with_tables(
        singles: Vec<RegisterDefinition>,
        composites: Vec<CompositeDefinition>,
        calibration: CalibrationConfig,
    ) -> Self {
        Self {
            singles,
            composites,
            calibration,
        }
    }

    pub fn calibration(&self) -> &CalibrationConfig {
        &self.calibration
    }

    /// Turns whatever registers are present into named values. Definitions
    /// and derived metrics whose inputs are missing are left out.
    pub fn decode(&self, regs: &RegisterMap) -> TelemetrySnapshot {
        let mut data = TelemetrySnapshot::default();

        for d in &self.singles {
            if let Some(raw) = regs.get(&d.address) {
                data.set_number(d.name, Self::scale_single(d, *raw));
            }
        }

        for d in &self.composites {
            if let (Some(low), Some(high)) = (regs.get(&d.low), regs.get(&d.high)) {
                let combined = combine_u32(*low, *high) as f64;
                data.set_number(d.name, round(combined * d.scale, d.precision));
            }
        }

        if let Some(raw) = data.number(RUNNING_STATE) {
            data.set_text(RUNNING_STATE, RunningState::describe(raw as u16));
        }

        if let Some(raw) = data.number(GRID_CONNECTED_STATUS) {
            let status = if raw as u16 == 1 { "Connected" } else { "Disconnected" };
            data.set_text(GRID_CONNECTED_STATUS, status.to_owned());
        }

        self.derive_co2(&mut data);
        self.derive_battery_cycles(&mut data);

        data
    }

    fn scale_single(d: &RegisterDefinition, raw: u16) -> f64 {
        let value = match d.encoding {
            Encoding::Unsigned => raw as f64,
            Encoding::Signed => to_signed(raw) as f64,
            Encoding::Offset(offset) => raw as f64 - offset as f64,
        };

        round(value * d.scale, d.precision)
    }

    fn derive_co2(&self, data: &mut TelemetrySnapshot) {
        let co2 = self.calibration.co2_factor;

        if let Some(daily) = data.number(DAILY_PV_ENERGY) {
            data.set_number(DAILY_CO2_SAVED, round(daily * co2, 2));
        }
        if let Some(total) = data.number(TOTAL_PV_ENERGY) {
            data.set_number(TOTAL_CO2_SAVED, round(total * co2, 1));
        }
    }

    fn derive_battery_cycles(&self, data: &mut TelemetrySnapshot) {
        let capacity = self.calibration.battery_capacity;
        let rated = self.calibration.battery_rated_cycles;

        let Some(discharged) = data.number(TOTAL_BATTERY_DISCHARGE_ENERGY) else {
            return;
        };
        if capacity <= 0.0 {
            return;
        }

        let cycles = discharged / capacity;
        data.set_number(BATTERY_CYCLES, round(cycles, 1));

        // 100% when new, 0% at the rated cycle life
        if rated > 0 {
            let health = (100.0 * (1.0 - cycles / rated as f64)).max(0.0);
            data.set_number(BATTERY_HEALTH, round(health, 1));
        }
    }
}
