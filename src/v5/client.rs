use crate::prelude::*;

use crate::v5::frame::{self, ControlCode, FrameDecoder, Framing};
use crate::v5::modbus::{self, ModbusFunction};

use {
    async_trait::async_trait,
    bytes::BytesMut,
    net2::TcpStreamExt,
    std::sync::Arc,
    std::time::Duration,
    tokio::io::{AsyncReadExt, AsyncWriteExt},
    tokio::net::TcpStream,
    tokio_util::codec::Decoder,
    tokio_util::sync::CancellationToken,
};

// sensor type(2) + total working time(4) + power on time(4) + offset time(4)
pub const REQUEST_PREFIX_SIZE: usize = 14;
// status(1) + total working time(4) + power on time(4) + offset time(4)
pub const RESPONSE_PREFIX_SIZE: usize = 13;

const TCP_KEEPALIVE_SECS: u64 = 60;
const READ_BUFFER_SIZE: usize = 1024;

// RegisterTransport {{{
/// One open session with the logger.
#[async_trait]
pub trait RegisterTransport: Send {
    async fn read_registers(
        &mut self,
        function: ModbusFunction,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>>;

    async fn read_input_registers(&mut self, start: u16, count: u16) -> Result<Vec<u16>> {
        self.read_registers(ModbusFunction::ReadInput, start, count)
            .await
    }

    async fn read_holding_registers(&mut self, start: u16, count: u16) -> Result<Vec<u16>> {
        self.read_registers(ModbusFunction::ReadHolding, start, count)
            .await
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Opens a new session per call; the logger only serves one at a time.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn RegisterTransport>>;
} // }}}

// TcpConnector {{{
#[derive(Clone, Debug)]
pub struct TcpConnector {
    host: String,
    port: u16,
    serial: u32,
    slave_id: u8,
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(config: &config::Logger) -> Self {
        Self {
            host: config.host().to_owned(),
            port: config.port(),
            serial: config.serial(),
            slave_id: config.slave_id(),
            timeout: config.socket_timeout(),
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Box<dyn RegisterTransport>> {
        debug!("connecting to logger at {}:{}", self.host, self.port);

        let stream = match tokio::time::timeout(
            self.timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => bail!("failed to connect to {}:{}: {}", self.host, self.port, e),
            Err(_) => bail!(
                "connection to {}:{} timed out after {:?}",
                self.host,
                self.port,
                self.timeout
            ),
        };

        let std_stream = stream.into_std()?;
        if let Err(e) = std_stream.set_keepalive(Some(Duration::from_secs(TCP_KEEPALIVE_SECS))) {
            warn!("Failed to set TCP keepalive: {}", e);
        }
        let stream = TcpStream::from_std(std_stream)?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }

        Ok(Box::new(V5Transport::new(
            stream,
            self.serial,
            self.slave_id,
            self.timeout,
        )))
    }
} // }}}

// V5Transport {{{
/// Modbus RTU requests tunnelled through V5 request frames.
pub struct V5Transport {
    stream: TcpStream,
    serial: u32,
    slave_id: u8,
    sequence: u16,
    timeout: Duration,
    buf: BytesMut,
    decoder: FrameDecoder,
}

impl V5Transport {
    pub fn new(stream: TcpStream, serial: u32, slave_id: u8, timeout: Duration) -> Self {
        Self {
            stream,
            serial,
            slave_id,
            sequence: 0,
            timeout,
            buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            decoder: FrameDecoder::with_framing(Framing::Tunnel),
        }
    }

    fn request_frame(&mut self, modbus_frame: &[u8]) -> Vec<u8> {
        self.sequence = self.sequence.wrapping_add(1);

        let mut payload = Vec::with_capacity(REQUEST_PREFIX_SIZE + modbus_frame.len());
        payload.extend_from_slice(&[0; REQUEST_PREFIX_SIZE]);
        payload.extend_from_slice(modbus_frame);

        frame::encode_framed(
            Framing::Tunnel,
            ControlCode::REQUEST,
            self.sequence,
            self.serial,
            FrameType::Modbus,
            &payload,
        )
    }

    async fn exchange(&mut self, request: &[u8]) -> Result<RawFrame> {
        self.stream.write_all(request).await?;
        self.stream.flush().await?;

        loop {
            while let Some(frame) = self.decoder.decode(&mut self.buf)? {
                if frame.is_response() {
                    return Ok(frame);
                }
                // loggers interleave their own heartbeats
                debug!(
                    "ignoring {:?} frame (control {:#06x}) while waiting for response",
                    frame.frame_type, frame.control_code
                );
            }

            if self.stream.read_buf(&mut self.buf).await? == 0 {
                bail!("connection closed by logger");
            }
        }
    }
}

#[async_trait]
impl RegisterTransport for V5Transport {
    async fn read_registers(
        &mut self,
        function: ModbusFunction,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>> {
        let request = modbus::read_request(self.slave_id, function, start, count);
        let request = self.request_frame(&request);

        let response = match tokio::time::timeout(self.timeout, self.exchange(&request)).await {
            Ok(r) => r?,
            Err(_) => bail!(
                "no response reading {} registers from {} after {:?}",
                count,
                start,
                self.timeout
            ),
        };

        if response.logger_serial != self.serial {
            debug!(
                "response from logger {} while talking to {}",
                response.logger_serial, self.serial
            );
        }

        let envelope = response
            .payload
            .get(RESPONSE_PREFIX_SIZE..)
            .ok_or_else(|| anyhow!("V5 response payload too short ({} bytes)", response.payload.len()))?;

        modbus::parse_read_response(envelope, self.slave_id, function, count)
    }

    async fn close(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
} // }}}

// Backoff {{{
/// Retry bookkeeping for one polling cycle.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Backoff {
    attempt: u32,
    max_attempts: u32,
    delay: Duration,
}

impl Backoff {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            delay,
        }
    }

    /// Failed attempts recorded so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Records a failed attempt. Returns how long to wait before the next
    /// one, or `None` once every attempt has been used.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt += 1;
        if self.attempt >= self.max_attempts {
            None
        } else {
            Some(self.delay)
        }
    }
} // }}}

/// Reads every block of `plan` over one session into a single map.
pub async fn read_blocks(
    transport: &mut dyn RegisterTransport,
    plan: &[ReadBlock],
    function: ModbusFunction,
) -> Result<RegisterMap> {
    let mut regs = RegisterMap::new();

    for block in plan {
        let values = transport
            .read_registers(function, block.start, block.count)
            .await?;
        regs.extend(block.addresses().zip(values));
    }

    Ok(regs)
}

// PollingClient {{{
#[derive(Clone)]
pub struct PollingClient {
    connector: Arc<dyn Connector>,
    attempts: u32,
    backoff: Duration,
}

impl PollingClient {
    pub fn new(connector: Arc<dyn Connector>, attempts: u32, backoff: Duration) -> Self {
        Self {
            connector,
            attempts: attempts.max(1),
            backoff,
        }
    }

    pub fn from_config(config: &ConfigWrapper) -> Self {
        let polling = config.polling();
        Self::new(
            Arc::new(TcpConnector::new(&config.logger())),
            polling.attempts(),
            polling.backoff(),
        )
    }

    /// Reads the whole plan, starting over on a fresh connection after any
    /// failure. The wait between attempts ends early if `cancel` fires;
    /// an attempt already on the wire always runs to completion.
    pub async fn poll(
        &self,
        plan: &[ReadBlock],
        function: ModbusFunction,
        cancel: &CancellationToken,
    ) -> Result<RegisterMap> {
        let mut backoff = Backoff::new(self.attempts, self.backoff);

        loop {
            let err = match self.read_session(plan, function).await {
                Ok(regs) => return Ok(regs),
                Err(err) => err,
            };

            let Some(delay) = backoff.next_delay() else {
                bail!(
                    "logger not responding after {} attempts: {:#}",
                    backoff.attempt(),
                    err
                );
            };

            debug!(
                "read attempt {}/{} failed: {:#} - retrying in {:?}",
                backoff.attempt(),
                backoff.max_attempts(),
                err,
                delay
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    bail!("polling cancelled after {} attempts: {:#}", backoff.attempt(), err);
                }
            }
        }
    }

    /// One block on its own session, no retries.
    pub async fn read_once(&self, block: ReadBlock, function: ModbusFunction) -> Result<Vec<u16>> {
        let mut transport = self.connector.connect().await?;
        let result = transport
            .read_registers(function, block.start, block.count)
            .await;
        Self::close(transport.as_mut()).await;
        result
    }

    /// Reads what it can of `plan` on one session. Blocks that fail are
    /// left out of the map.
    pub async fn read_available(
        &self,
        plan: &[ReadBlock],
        function: ModbusFunction,
    ) -> Result<RegisterMap> {
        let mut transport = self.connector.connect().await?;
        let mut regs = RegisterMap::new();

        for block in plan {
            match transport
                .read_registers(function, block.start, block.count)
                .await
            {
                Ok(values) => regs.extend(block.addresses().zip(values)),
                Err(e) => debug!(
                    "skipping block ({}, {}): {:#}",
                    block.start, block.count, e
                ),
            }
        }

        Self::close(transport.as_mut()).await;
        Ok(regs)
    }

    async fn read_session(&self, plan: &[ReadBlock], function: ModbusFunction) -> Result<RegisterMap> {
        let mut transport = self.connector.connect().await?;
        let result = read_blocks(transport.as_mut(), plan, function).await;
        Self::close(transport.as_mut()).await;
        result
    }

    async fn close(transport: &mut dyn RegisterTransport) {
        if let Err(e) = transport.close().await {
            debug!("error closing logger session: {}", e);
        }
    }
} // }}}
