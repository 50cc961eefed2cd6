use crate::prelude::*;

use bytes::{Buf, BytesMut};
use nom_derive::{Nom, Parse};
use num_enum::{FromPrimitive, IntoPrimitive};
use std::collections::VecDeque;
use tokio_util::codec::Decoder;

pub const START: u8 = 0xA5;
pub const END: u8 = 0x15;

// start(1) + length(2) + control(2) + sequence(2) + serial(4) + type(1)
pub const HEADER_SIZE: usize = 12;
// header + checksum(1) + end(1)
pub const MIN_FRAME_SIZE: usize = HEADER_SIZE + 2;
// pushed frames: the length field covers control, sequence, serial and type as well as the payload
pub const LENGTH_OVERHEAD: usize = 9;
// anything claiming to be longer than this is a false start marker
pub const MAX_LENGTH: usize = 2048;

pub const STATUS_OK: u8 = 0x01;
// status + padding
pub const ACK_SIZE: usize = MIN_FRAME_SIZE + 2;

// ControlCode {{{
pub struct ControlCode;
impl ControlCode {
    /// client -> logger request carrying a Modbus RTU frame
    pub const REQUEST: u16 = 0x4510;
    /// logger -> client reply to REQUEST
    pub const RESPONSE: u16 = 0x1510;
    /// server -> logger acknowledgement of a pushed frame
    pub const ACK: u16 = 0x1010;
} // }}}

// FrameType {{{
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum FrameType {
    Modbus = 0x02,
    Hello = 0x41,
    Data = 0x42,
    Heartbeat = 0x47,
    #[num_enum(catch_all)]
    Other(u8),
}

impl FrameType {
    pub fn is_keepalive(&self) -> bool {
        matches!(self, FrameType::Hello | FrameType::Heartbeat)
    }
} // }}}

// Framing {{{
/// How the length field and checksum of a frame are laid out. Pushed reports
/// and the Modbus request/response tunnel disagree on both.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Framing {
    /// length counts control code through payload; checksum includes the start marker
    #[default]
    Push,
    /// length counts frame type and payload only; checksum skips the start marker
    Tunnel,
}

impl Framing {
    pub fn length_overhead(self) -> usize {
        match self {
            Framing::Push => LENGTH_OVERHEAD,
            Framing::Tunnel => 1,
        }
    }

    /// Checksum over everything before the checksum byte.
    pub fn checksum(self, frame: &[u8]) -> u8 {
        match self {
            Framing::Push => checksum(frame),
            Framing::Tunnel => checksum(frame.get(1..).unwrap_or_default()),
        }
    }

    fn frame_size(self, length: usize) -> usize {
        length + MIN_FRAME_SIZE - self.length_overhead()
    }
} // }}}

#[derive(Debug, Nom)]
#[nom(LittleEndian)]
struct FrameHeader {
    _start: u8,
    _length: u16,
    control_code: u16,
    sequence: u16,
    logger_serial: u32,
    frame_type: u8,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RawFrame {
    pub control_code: u16,
    pub sequence: u16,
    pub logger_serial: u32,
    pub frame_type: FrameType,
    pub payload: Vec<u8>,
}

impl RawFrame {
    pub fn is_ack(&self) -> bool {
        self.control_code == ControlCode::ACK
    }

    pub fn is_response(&self) -> bool {
        self.control_code == ControlCode::RESPONSE
    }

    /// Size of the frame as it appeared on the wire.
    pub fn wire_size(&self) -> usize {
        MIN_FRAME_SIZE + self.payload.len()
    }
}

pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// Scans `input` for complete pushed frames. See [`decode_framed`].
pub fn decode(input: &[u8]) -> (Vec<RawFrame>, usize) {
    decode_framed(input, Framing::Push)
}

/// Scans `input` for complete frames laid out as `framing` says.
///
/// Returns the frames in stream order together with the number of leading
/// bytes the caller may discard. Bytes from an incomplete trailing frame are
/// never counted as consumed, so the remainder can be prefixed to the next read.
/// Corrupt candidates (wrong end marker, bad checksum, absurd length) are
/// skipped one byte at a time.
pub fn decode_framed(input: &[u8], framing: Framing) -> (Vec<RawFrame>, usize) {
    let mut frames = Vec::new();
    let mut pos = 0;

    loop {
        let start = match input[pos..].iter().position(|b| *b == START) {
            Some(offset) => pos + offset,
            None => return (frames, input.len()),
        };

        if start + MIN_FRAME_SIZE > input.len() {
            return (frames, start);
        }

        let length = u16::from_le_bytes([input[start + 1], input[start + 2]]) as usize;
        if !(framing.length_overhead()..=MAX_LENGTH).contains(&length) {
            trace!("implausible V5 length {} at offset {}, resyncing", length, start);
            pos = start + 1;
            continue;
        }

        let frame_size = framing.frame_size(length);
        if start + frame_size > input.len() {
            return (frames, start);
        }

        let frame = &input[start..start + frame_size];

        if frame[frame_size - 1] != END {
            pos = start + 1;
            continue;
        }

        let expected = framing.checksum(&frame[..frame_size - 2]);
        if frame[frame_size - 2] != expected {
            debug!(
                "V5 checksum mismatch - got {:#04x}, expected {:#04x}; skipping",
                frame[frame_size - 2],
                expected
            );
            pos = start + 1;
            continue;
        }

        match FrameHeader::parse(frame) {
            Ok((_, header)) => frames.push(RawFrame {
                control_code: header.control_code,
                sequence: header.sequence,
                logger_serial: header.logger_serial,
                frame_type: FrameType::from(header.frame_type),
                payload: frame[HEADER_SIZE..frame_size - 2].to_vec(),
            }),
            Err(err) => {
                debug!("V5 header parse failed: {:?}", err);
                pos = start + 1;
                continue;
            }
        }

        pos = start + frame_size;
    }
}

/// Builds a complete pushed-style frame around `payload`.
pub fn encode(
    control_code: u16,
    sequence: u16,
    logger_serial: u32,
    frame_type: FrameType,
    payload: &[u8],
) -> Vec<u8> {
    encode_framed(
        Framing::Push,
        control_code,
        sequence,
        logger_serial,
        frame_type,
        payload,
    )
}

pub fn encode_framed(
    framing: Framing,
    control_code: u16,
    sequence: u16,
    logger_serial: u32,
    frame_type: FrameType,
    payload: &[u8],
) -> Vec<u8> {
    let length = (framing.length_overhead() + payload.len()) as u16;

    let mut r = Vec::with_capacity(MIN_FRAME_SIZE + payload.len());
    r.push(START);
    r.extend_from_slice(&length.to_le_bytes());
    r.extend_from_slice(&control_code.to_le_bytes());
    r.extend_from_slice(&sequence.to_le_bytes());
    r.extend_from_slice(&logger_serial.to_le_bytes());
    r.push(frame_type.into());
    r.extend_from_slice(payload);
    r.push(framing.checksum(&r));
    r.push(END);

    r
}

/// The reply every well-formed inbound frame gets, whatever its type.
pub fn build_ack(frame_type: FrameType, logger_serial: u32, sequence: u16) -> Vec<u8> {
    encode(
        ControlCode::ACK,
        sequence,
        logger_serial,
        frame_type,
        &[STATUS_OK, 0x00],
    )
}

// FrameDecoder {{{
/// Stream adapter over [`decode`] for use with a `BytesMut` read buffer.
#[derive(Default)]
pub struct FrameDecoder {
    framing: Framing,
    pending: VecDeque<RawFrame>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_framing(framing: Framing) -> Self {
        Self {
            framing,
            ..Self::default()
        }
    }
}

impl Decoder for FrameDecoder {
    type Item = RawFrame;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if let Some(frame) = self.pending.pop_front() {
            return Ok(Some(frame));
        }

        let (frames, consumed) = decode_framed(src, self.framing);
        src.advance(consumed);
        self.pending.extend(frames);

        Ok(self.pending.pop_front())
    }
} // }}}

#[cfg(test)]
mod tests {
    use super::*;

    const SERIAL: u32 = 2_712_345_678;

    fn heartbeat() -> Vec<u8> {
        encode(0x4710, 7, SERIAL, FrameType::Heartbeat, &[0x00])
    }

    #[test]
    fn ack_layout() {
        let ack = build_ack(FrameType::Data, SERIAL, 0x0102);

        assert_eq!(ack.len(), ACK_SIZE);
        assert_eq!(ACK_SIZE, 16);
        assert_eq!(ack[0], START);
        assert_eq!(&ack[1..3], &11u16.to_le_bytes());
        assert_eq!(&ack[3..5], &ControlCode::ACK.to_le_bytes());
        assert_eq!(&ack[5..7], &[0x02, 0x01]);
        assert_eq!(&ack[7..11], &SERIAL.to_le_bytes());
        assert_eq!(ack[11], 0x42);
        assert_eq!(&ack[12..14], &[STATUS_OK, 0x00]);
        assert_eq!(ack[14], checksum(&ack[..14]));
        assert_eq!(ack[15], END);
    }

    #[test]
    fn ack_decodes_as_ack() {
        let ack = build_ack(FrameType::Heartbeat, SERIAL, 3);
        let (frames, consumed) = decode(&ack);

        assert_eq!(consumed, ack.len());
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_ack());
        assert_eq!(frames[0].wire_size(), ack.len());
        assert_eq!(frames[0].logger_serial, SERIAL);
        assert_eq!(frames[0].sequence, 3);
        assert_eq!(frames[0].frame_type, FrameType::Heartbeat);
        assert_eq!(frames[0].payload, vec![STATUS_OK, 0x00]);
    }

    #[test]
    fn frame_type_catch_all() {
        assert_eq!(FrameType::from(0x42), FrameType::Data);
        assert_eq!(FrameType::from(0x99), FrameType::Other(0x99));
        assert_eq!(u8::from(FrameType::Other(0x99)), 0x99);
        assert!(FrameType::Hello.is_keepalive());
        assert!(!FrameType::Data.is_keepalive());
    }

    #[test]
    fn partial_frame_is_retained() {
        let hb = heartbeat();
        let (frames, consumed) = decode(&hb[..hb.len() - 3]);
        assert!(frames.is_empty());
        assert_eq!(consumed, 0);
    }

    #[test]
    fn leading_garbage_is_consumed() {
        let mut input = vec![0x00, 0x01, 0x02];
        input.extend(heartbeat());

        let (frames, consumed) = decode(&input);
        assert_eq!(frames.len(), 1);
        assert_eq!(consumed, input.len());
    }

    #[test]
    fn garbage_only() {
        let (frames, consumed) = decode(&[0x01, 0x02, 0x03]);
        assert!(frames.is_empty());
        assert_eq!(consumed, 3);
    }

    #[test]
    fn bad_end_marker_resyncs() {
        let mut bad = heartbeat();
        let last = bad.len() - 1;
        bad[last] = 0x00;
        bad.extend(heartbeat());

        let (frames, _) = decode(&bad);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn corrupt_byte_loses_only_that_frame() {
        let mut input = encode(0x4210, 1, SERIAL, FrameType::Data, &[0x10, 0x20, 0x30]);
        input[13] ^= 0x01;
        let good = encode(0x4210, 2, SERIAL, FrameType::Data, &[0x10, 0x20, 0x30]);
        input.extend_from_slice(&good);

        let (frames, consumed) = decode(&input);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].sequence, 2);
        assert_eq!(consumed, input.len());
    }

    // a read-input request for (59, 55) as pysolarmanv5 sends it
    const TUNNEL_REQUEST: [u8; 36] = [
        0xa5, 0x17, 0x00, 0x10, 0x45, 0x01, 0x00, 0x4e, 0x1c, 0xab, 0xa1, 0x02, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x04, 0x00, 0x3b,
        0x00, 0x37, 0xc0, 0x11, 0x6d, 0x15,
    ];

    // the logger's answer carrying 3 registers
    const TUNNEL_RESPONSE: [u8; 38] = [
        0xa5, 0x19, 0x00, 0x10, 0x15, 0x01, 0x00, 0x4e, 0x1c, 0xab, 0xa1, 0x02, 0x01, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x04, 0x06, 0x00, 0x02,
        0x01, 0x00, 0xff, 0xff, 0x19, 0x1f, 0x3c, 0x15,
    ];

    #[test]
    fn tunnel_request_matches_logger_format() {
        let modbus_frame = [0x01, 0x04, 0x00, 0x3b, 0x00, 0x37, 0xc0, 0x11];
        let mut payload = vec![0u8; 14];
        payload.extend_from_slice(&modbus_frame);

        let bytes = encode_framed(
            Framing::Tunnel,
            ControlCode::REQUEST,
            1,
            SERIAL,
            FrameType::Modbus,
            &payload,
        );
        assert_eq!(bytes, TUNNEL_REQUEST.to_vec());
    }

    #[test]
    fn tunnel_response_decodes() {
        let (frames, consumed) = decode_framed(&TUNNEL_RESPONSE, Framing::Tunnel);

        assert_eq!(consumed, TUNNEL_RESPONSE.len());
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_response());
        assert_eq!(frames[0].logger_serial, SERIAL);
        assert_eq!(frames[0].frame_type, FrameType::Modbus);
        assert_eq!(frames[0].wire_size(), TUNNEL_RESPONSE.len());
        assert_eq!(&frames[0].payload[13..16], &[0x01, 0x04, 0x06]);
    }

    #[test]
    fn framings_do_not_cross() {
        let (frames, _) = decode(&TUNNEL_RESPONSE);
        assert!(frames.is_empty());

        let (frames, _) = decode_framed(&heartbeat(), Framing::Tunnel);
        assert!(frames.is_empty());
    }

    #[test]
    fn frame_decoder_yields_one_at_a_time() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&heartbeat());
        buf.extend_from_slice(&heartbeat());

        let mut decoder = FrameDecoder::new();
        assert!(decoder.decode(&mut buf).unwrap().is_some());
        assert!(decoder.decode(&mut buf).unwrap().is_some());
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }
}
