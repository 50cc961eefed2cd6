use crate::prelude::*;

use crate::coordinator::arbiter::PushSlot;
use crate::v5::{frame, payload};

use {
    bytes::{Buf, BytesMut},
    chrono::{DateTime, Local},
    std::net::SocketAddr,
    std::sync::{Arc, Mutex},
    std::time::Duration,
    tokio::io::{AsyncReadExt, AsyncWriteExt},
    tokio::net::{TcpListener, TcpStream},
    tokio::task::JoinSet,
    tokio_util::sync::CancellationToken,
};

// ServerStats {{{
#[derive(Clone, Debug, Default)]
pub struct ServerStats {
    pub listening: bool,
    pub connections: u64,
    /// valid frames from the configured logger
    pub frames_received: u64,
    /// valid frames from any other logger; acknowledged and dropped
    pub foreign_frames: u64,
    pub data_reports: u64,
    pub bytes_discarded: u64,
    pub last_frame_time: Option<DateTime<Local>>,
}

impl ServerStats {
    pub fn status(&self) -> &'static str {
        if self.listening {
            "listening"
        } else {
            "stopped"
        }
    }

    pub fn print_summary(&self) {
        info!("Push Server Statistics:");
        info!("  Status: {}", self.status());
        info!("  Connections accepted: {}", self.connections);
        info!("  Frames received: {}", self.frames_received);
        info!("  Data reports: {}", self.data_reports);
        info!("  Frames from other loggers: {}", self.foreign_frames);
        info!("  Bytes discarded while resyncing: {}", self.bytes_discarded);
        match self.last_frame_time {
            Some(t) => info!("  Last data report: {}", t.format("%Y-%m-%d %H:%M:%S")),
            None => info!("  Last data report: never"),
        }
    }
} // }}}

/// Accepts connections from loggers configured to push to us.
pub struct IngestionServer {
    listener: TcpListener,
    session: Session,
}

impl IngestionServer {
    pub async fn bind(config: &ConfigWrapper, slot: PushSlot) -> Result<Self> {
        let server = config.server();
        let addr = (server.bind(), server.port());

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow!("failed to bind push server on {}:{}: {}", server.bind(), server.port(), e))?;

        Ok(Self {
            listener,
            session: Session {
                serial: config.logger().serial(),
                idle_timeout: server.idle_timeout(),
                read_buffer: server.read_buffer(),
                slot,
                stats: Arc::new(Mutex::new(ServerStats::default())),
            },
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn stats(&self) -> Arc<Mutex<ServerStats>> {
        self.session.stats.clone()
    }

    /// Accepts until `cancel` fires, then closes the listener and every
    /// open connection before returning.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let Self { listener, session } = self;
        let mut connections = JoinSet::new();

        info!("push server listening on {}", listener.local_addr()?);
        session.update_stats(|s| s.listening = true);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        info!("logger connected from {}", peer);
                        session.update_stats(|s| s.connections += 1);
                        connections.spawn(session.clone().handle(socket, peer, cancel.clone()));
                    }
                    Err(e) => warn!("push server accept failed: {}", e),
                },

                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        drop(listener);
        while connections.join_next().await.is_some() {}

        session.update_stats(|s| s.listening = false);
        info!("push server stopped");

        Ok(())
    }
}

#[derive(Clone)]
struct Session {
    serial: u32,
    idle_timeout: Duration,
    read_buffer: usize,
    slot: PushSlot,
    stats: Arc<Mutex<ServerStats>>,
}

impl Session {
    async fn handle(self, mut socket: TcpStream, peer: SocketAddr, cancel: CancellationToken) {
        let mut buf = BytesMut::with_capacity(self.read_buffer);
        let mut chunk = vec![0u8; self.read_buffer];

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("closing connection from {} for shutdown", peer);
                    break;
                }

                read = tokio::time::timeout(self.idle_timeout, socket.read(&mut chunk)) => match read {
                    Ok(Ok(0)) => {
                        info!("logger {} disconnected", peer);
                        break;
                    }
                    Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
                    Ok(Err(e)) => {
                        info!("connection from {} failed: {}", peer, e);
                        break;
                    }
                    Err(_) => {
                        info!("no data from {} for {:?}, closing", peer, self.idle_timeout);
                        break;
                    }
                },
            }

            let (frames, consumed) = frame::decode(&buf);
            let framed: usize = frames.iter().map(RawFrame::wire_size).sum();
            buf.advance(consumed);

            if consumed > framed {
                let discarded = consumed - framed;
                debug!("discarded {} bytes from {} while resyncing", discarded, peer);
                self.update_stats(|s| s.bytes_discarded += discarded as u64);
            }

            for frame in frames {
                if let Err(e) = self.handle_frame(&mut socket, peer, frame, &cancel).await {
                    warn!("closing connection from {}: {:#}", peer, e);
                    return;
                }
            }
        }
    }

    async fn handle_frame(
        &self,
        socket: &mut TcpStream,
        peer: SocketAddr,
        frame: RawFrame,
        cancel: &CancellationToken,
    ) -> Result<()> {
        // ack before anything else; the logger drops the session without it
        let ack = frame::build_ack(frame.frame_type, frame.logger_serial, frame.sequence);

        // a peer that stops reading must not hold up shutdown
        tokio::select! {
            _ = cancel.cancelled() => bail!("shutting down before ack was sent"),
            sent = tokio::time::timeout(self.idle_timeout, socket.write_all(&ack)) => match sent {
                Ok(Ok(())) => {}
                Ok(Err(e)) => bail!("failed to acknowledge frame: {}", e),
                Err(_) => bail!("ack not accepted within {:?}", self.idle_timeout),
            },
        }

        if frame.logger_serial != self.serial {
            debug!(
                "ignoring {:?} frame from logger {} (expecting {})",
                frame.frame_type, frame.logger_serial, self.serial
            );
            self.update_stats(|s| s.foreign_frames += 1);
            return Ok(());
        }

        self.update_stats(|s| s.frames_received += 1);

        match frame.frame_type {
            FrameType::Data => {
                let regs = payload::extract_registers(&frame.payload);
                if regs.is_empty() {
                    debug!("data report from {} carried no usable registers", peer);
                    return Ok(());
                }

                debug!("stored {} pushed registers for next refresh", regs.len());
                self.slot.store(regs);
                self.update_stats(|s| {
                    s.data_reports += 1;
                    s.last_frame_time = Some(Local::now());
                });
            }
            t if t.is_keepalive() => trace!("{:?} from {}", t, peer),
            t => debug!("ignoring {:?} frame from {}", t, peer),
        }

        Ok(())
    }

    fn update_stats(&self, f: impl FnOnce(&mut ServerStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }
}
