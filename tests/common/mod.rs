#![allow(dead_code)]

use solarman_bridge::prelude::*;
use solarman_bridge::v5::client::{Connector, RegisterTransport};
use solarman_bridge::v5::frame::{self, ControlCode, Framing};
use solarman_bridge::v5::modbus::{self, ModbusFunction};

use async_trait::async_trait;
use std::sync::{Arc, Mutex};

pub const SERIAL: u32 = 2_712_345_678;

pub fn common_setup() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct Factory();
impl Factory {
    pub fn yaml(extra: &str) -> String {
        format!(
            "logger:\n  host: 127.0.0.1\n  serial: {}\n{}",
            SERIAL, extra
        )
    }

    pub fn config() -> ConfigWrapper {
        Self::config_with("")
    }

    pub fn config_with(extra: &str) -> ConfigWrapper {
        let config = Config::from_yaml(&Self::yaml(extra)).expect("valid test config");
        ConfigWrapper::from_config(config)
    }

    /// Push mode, no polling host, server on an ephemeral loopback port.
    pub fn push_config() -> ConfigWrapper {
        Self::push_config_with("")
    }

    /// As `push_config`, with extra keys under `server:`.
    pub fn push_config_with(server_extra: &str) -> ConfigWrapper {
        let yaml = format!(
            "logger:\n  serial: {}\nmode: push\nserver:\n  bind: 127.0.0.1\n  port: 0\n{}",
            SERIAL, server_extra
        );
        ConfigWrapper::from_config(Config::from_yaml(&yaml).expect("valid test config"))
    }

    /// Polls a logger on loopback `port`, giving up on a request after 1s.
    pub fn logger_config(port: u16) -> ConfigWrapper {
        let yaml = format!(
            "logger:\n  host: 127.0.0.1\n  port: {}\n  serial: {}\n  socket_timeout: 1\n",
            port, SERIAL
        );
        ConfigWrapper::from_config(Config::from_yaml(&yaml).expect("valid test config"))
    }

    pub fn regs(pairs: &[(u16, u16)]) -> RegisterMap {
        pairs.iter().copied().collect()
    }

    /// Data-report payload: 15 byte prefix then a Modbus read response.
    pub fn data_payload(function: u8, values: &[u16]) -> Vec<u8> {
        let mut r = vec![0x01, 0x02, 0x00];
        r.extend_from_slice(&[0; 12]);
        r.extend_from_slice(&[0x01, function, (values.len() * 2) as u8]);
        for v in values {
            r.extend_from_slice(&v.to_be_bytes());
        }
        r
    }

    pub fn data_frame(serial: u32, sequence: u16, values: &[u16]) -> Vec<u8> {
        frame::encode(
            0x4210,
            sequence,
            serial,
            FrameType::Data,
            &Self::data_payload(0x04, values),
        )
    }

    pub fn heartbeat_frame(serial: u32, sequence: u16) -> Vec<u8> {
        frame::encode(0x4710, sequence, serial, FrameType::Heartbeat, &[0x00])
    }

    /// Heartbeat as a logger sends it inside a polling session.
    pub fn tunnel_heartbeat(serial: u32, sequence: u16) -> Vec<u8> {
        frame::encode_framed(
            Framing::Tunnel,
            0x4710,
            sequence,
            serial,
            FrameType::Heartbeat,
            &[0x00],
        )
    }

    /// Logger reply to a polling request: 13 byte prefix then a Modbus RTU
    /// read response.
    pub fn response_frame(
        serial: u32,
        sequence: u16,
        slave_id: u8,
        function: u8,
        values: &[u16],
    ) -> Vec<u8> {
        let mut rtu = vec![slave_id, function, (values.len() * 2) as u8];
        for v in values {
            rtu.extend_from_slice(&v.to_be_bytes());
        }
        let crc = modbus::crc(&rtu);
        rtu.extend_from_slice(&crc);

        let mut payload = vec![0x01];
        payload.extend_from_slice(&[0; 12]);
        payload.extend_from_slice(&rtu);

        frame::encode_framed(
            Framing::Tunnel,
            ControlCode::RESPONSE,
            sequence,
            serial,
            FrameType::Modbus,
            &payload,
        )
    }

    pub fn ack(frame_type: FrameType, serial: u32, sequence: u16) -> Vec<u8> {
        frame::build_ack(frame_type, serial, sequence)
    }

    pub fn is_ack(bytes: &[u8]) -> bool {
        let (frames, _) = frame::decode(bytes);
        frames.len() == 1 && frames[0].control_code == ControlCode::ACK
    }
}

// MockConnector {{{
#[derive(Default)]
struct MockState {
    device: RegisterMap,
    refuse_connects: usize,
    fail_reads: usize,
    fail_blocks: Vec<u16>,
    connects: usize,
    closes: usize,
    reads: Vec<(ModbusFunction, u16, u16)>,
}

/// A fake logger. Every register it is asked for reads from `device`,
/// defaulting to 0. Failures are scripted up front.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn new(device: RegisterMap) -> Self {
        let r = Self::default();
        r.state.lock().unwrap().device = device;
        r
    }

    /// The next `n` connection attempts are refused.
    pub fn refuse_connects(&self, n: usize) {
        self.state.lock().unwrap().refuse_connects = n;
    }

    /// The next `n` reads fail (on an otherwise good connection).
    pub fn fail_reads(&self, n: usize) {
        self.state.lock().unwrap().fail_reads = n;
    }

    /// Reads of blocks starting at `start` always fail.
    pub fn fail_block(&self, start: u16) {
        self.state.lock().unwrap().fail_blocks.push(start);
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    pub fn closes(&self) -> usize {
        self.state.lock().unwrap().closes
    }

    pub fn reads(&self) -> Vec<(ModbusFunction, u16, u16)> {
        self.state.lock().unwrap().reads.clone()
    }

    pub fn arc(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn RegisterTransport>> {
        let mut state = self.state.lock().unwrap();
        state.connects += 1;

        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            bail!("connection refused");
        }

        Ok(Box::new(MockTransport {
            state: self.state.clone(),
        }))
    }
}

struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl RegisterTransport for MockTransport {
    async fn read_registers(
        &mut self,
        function: ModbusFunction,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        let mut state = self.state.lock().unwrap();
        state.reads.push((function, start, count));

        if state.fail_reads > 0 {
            state.fail_reads -= 1;
            bail!("timed out");
        }
        if state.fail_blocks.contains(&start) {
            bail!("modbus exception 0x02");
        }

        Ok((start..start + count)
            .map(|a| state.device.get(&a).copied().unwrap_or(0))
            .collect())
    }

    async fn close(&mut self) -> Result<()> {
        self.state.lock().unwrap().closes += 1;
        Ok(())
    }
} // }}}
