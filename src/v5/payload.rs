//! Register extraction from pushed data-report payloads.
//!
//! A data report starts with a fixed 15 byte prefix followed by a Modbus read
//! response (slave, function, byte count, data). The response does not say
//! which register it starts at, so the start address is inferred from the
//! number of values using [`START_ADDRESS_HEURISTIC`]. This is a table of the
//! block sizes seen from the device family, not a guarantee; new logger
//! firmware may need new rows.

use crate::prelude::*;

use crate::v5::modbus::{self, ModbusFunction};
use nom_derive::{Nom, Parse};

pub const PREFIX_SIZE: usize = 15;

#[derive(Debug, Nom)]
#[nom(LittleEndian)]
pub struct ReportPrefix {
    pub status: u8,
    pub sensor_type: u16,
    pub delivery_time: u32,
    pub power_on_time: u32,
    pub offset_time: u32,
}

/// (minimum register count, start address), checked in order.
pub const START_ADDRESS_HEURISTIC: &[(usize, u16)] = &[
    // one block spanning both telemetry ranges
    (90, 59),
    // 55 registers from 59
    (50, 59),
    // 45 registers from 150
    (40, 150),
];

/// Used when no row of the table matches.
pub const DEFAULT_START_ADDRESS: u16 = 59;

pub fn infer_start_address(count: usize) -> u16 {
    START_ADDRESS_HEURISTIC
        .iter()
        .find(|(min, _)| count >= *min)
        .map(|(_, start)| *start)
        .unwrap_or(DEFAULT_START_ADDRESS)
}

/// Extracts registers from a data-report payload. An empty map means
/// nothing usable was found.
pub fn extract_registers(payload: &[u8]) -> RegisterMap {
    if payload.len() <= PREFIX_SIZE {
        return RegisterMap::new();
    }

    let envelope = match ReportPrefix::parse(payload) {
        Ok((rest, prefix)) => {
            trace!("data report prefix: {:?}", prefix);
            rest
        }
        Err(err) => {
            debug!("unparseable data report prefix: {:?}", err);
            return RegisterMap::new();
        }
    };

    if envelope.len() < 5 {
        return RegisterMap::new();
    }

    let function = envelope[1];
    let byte_count = envelope[2] as usize;

    if ModbusFunction::try_from(function).is_err() {
        debug!(
            "unexpected modbus function {:#04x} in data push, trying raw register dump",
            function
        );
        return raw_registers(envelope);
    }

    let data = &envelope[3..];
    if data.len() < byte_count {
        debug!(
            "data push truncated - byte_count={}, have {}",
            byte_count,
            data.len()
        );
        return RegisterMap::new();
    }

    let values = modbus::words(&data[..byte_count]);
    let start = infer_start_address(values.len());

    values
        .into_iter()
        .enumerate()
        .map(|(i, value)| (start.wrapping_add(i as u16), value))
        .collect()
}

/// Some loggers skip the Modbus framing and push plain big-endian words
/// starting at register 0.
pub fn raw_registers(data: &[u8]) -> RegisterMap {
    if data.len() < 4 {
        return RegisterMap::new();
    }

    modbus::words(data)
        .into_iter()
        .enumerate()
        .map(|(i, value)| (i as u16, value))
        .collect()
}
