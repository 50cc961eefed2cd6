use crate::prelude::*;

use nom::{multi::many0, number::complete::be_u16};
use num_enum::{IntoPrimitive, TryFromPrimitive};

pub const EXCEPTION_FLAG: u8 = 0x80;

// read responses carry at most 125 registers (250 data bytes)
pub const MAX_READ_COUNT: u16 = 125;

#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ModbusFunction {
    ReadHolding = 3,
    ReadInput = 4,
}

pub fn crc(data: &[u8]) -> [u8; 2] {
    crc16::State::<crc16::MODBUS>::calculate(data).to_le_bytes()
}

/// Big-endian register words; a trailing odd byte is ignored.
pub fn words(data: &[u8]) -> Vec<u16> {
    let r: nom::IResult<&[u8], Vec<u16>> = many0(be_u16)(data);
    r.map(|(_, values)| values).unwrap_or_default()
}

/// Modbus RTU read request: slave, function, start, count, crc.
pub fn read_request(slave_id: u8, function: ModbusFunction, start: u16, count: u16) -> Vec<u8> {
    let mut r = vec![slave_id, function.into()];
    r.extend_from_slice(&start.to_be_bytes());
    r.extend_from_slice(&count.to_be_bytes());
    let crc = crc(&r);
    r.extend_from_slice(&crc);
    r
}

/// Unpacks an RTU read response, checking function, length and crc.
pub fn parse_read_response(
    frame: &[u8],
    slave_id: u8,
    function: ModbusFunction,
    count: u16,
) -> Result<Vec<u16>> {
    if frame.len() < 5 {
        bail!("modbus response too short ({} bytes)", frame.len());
    }

    let function_code: u8 = function.into();

    if frame[1] == function_code | EXCEPTION_FLAG {
        bail!(
            "modbus exception {:#04x} for function {:?}",
            frame[2],
            function
        );
    }
    if frame[1] != function_code {
        bail!(
            "modbus function mismatch - got {:#04x}, expected {:#04x}",
            frame[1],
            function_code
        );
    }
    if frame[0] != slave_id {
        bail!(
            "modbus slave id mismatch - got {}, expected {}",
            frame[0],
            slave_id
        );
    }

    let byte_count = frame[2] as usize;
    if frame.len() < 3 + byte_count + 2 {
        bail!(
            "modbus response truncated - byte_count={}, have {} bytes",
            byte_count,
            frame.len()
        );
    }

    let body = &frame[..3 + byte_count];
    let got = &frame[3 + byte_count..3 + byte_count + 2];
    if crc(body) != got {
        bail!(
            "modbus crc mismatch - got {:?}, expected {:?}",
            got,
            crc(body)
        );
    }

    let values = words(&body[3..]);
    if values.len() != count as usize {
        bail!(
            "modbus register count mismatch - got {}, expected {}",
            values.len(),
            count
        );
    }

    Ok(values)
}
