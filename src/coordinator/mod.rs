pub mod arbiter;
pub mod identity;

use crate::prelude::*;

use crate::v5::client::{Connector, PollingClient};
use crate::v5::modbus::ModbusFunction;
use arbiter::{DataArbiter, PushSlot, Source};
use identity::{DeviceIdentity, IdentityCache, IdentityState};

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, Default)]
pub struct RefreshStats {
    cycles: u64,
    push_cycles: u64,
    poll_cycles: u64,
    poll_failures: u64,
    empty_cycles: u64,
}

impl RefreshStats {
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn push_cycles(&self) -> u64 {
        self.push_cycles
    }

    pub fn poll_cycles(&self) -> u64 {
        self.poll_cycles
    }

    pub fn poll_failures(&self) -> u64 {
        self.poll_failures
    }

    pub fn print_summary(&self) {
        info!("Refresh Statistics:");
        info!("  Snapshots produced: {}", self.cycles);
        info!("    From pushed data: {}", self.push_cycles);
        info!("    From polling: {}", self.poll_cycles);
        info!("    Empty (logger asleep): {}", self.empty_cycles);
        info!("  Failed polls: {}", self.poll_failures);
    }
}

/// One refresh cycle's output.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Refresh {
    pub source: Source,
    pub snapshot: TelemetrySnapshot,
}

#[derive(Clone)]
pub struct Coordinator {
    config: ConfigWrapper,
    channels: Channels,
    arbiter: DataArbiter,
    poller: Option<PollingClient>,
    decoder: RegisterDecoder,
    identity: IdentityCache,
    produced: Arc<AtomicBool>,
    pub stats: Arc<Mutex<RefreshStats>>,
}

impl Coordinator {
    pub fn new(config: ConfigWrapper, channels: Channels) -> Self {
        let poller = if config.logger().host().is_empty() {
            None
        } else {
            Some(PollingClient::from_config(&config))
        };

        Self::with_poller(config, channels, poller)
    }

    /// Polls through `connector` instead of TCP.
    pub fn with_connector(
        config: ConfigWrapper,
        channels: Channels,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let polling = config.polling();
        let poller = PollingClient::new(connector, polling.attempts(), polling.backoff());

        Self::with_poller(config, channels, Some(poller))
    }

    fn with_poller(config: ConfigWrapper, channels: Channels, poller: Option<PollingClient>) -> Self {
        Self {
            decoder: RegisterDecoder::new(config.calibration()),
            config,
            channels,
            arbiter: DataArbiter::new(PushSlot::new()),
            poller,
            identity: IdentityCache::new(),
            produced: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(Mutex::new(RefreshStats::default())),
        }
    }

    /// Where the push server drops register maps for the next cycle.
    pub fn push_slot(&self) -> PushSlot {
        self.arbiter.slot().clone()
    }

    pub fn identity(&self) -> Option<DeviceIdentity> {
        self.identity.identity()
    }

    pub fn identity_state(&self) -> IdentityState {
        self.identity.state()
    }

    /// Produces the next snapshot from pushed data if any arrived, else by
    /// polling. `Ok(None)` means there was nothing to do (nothing pushed and
    /// no logger host to poll).
    ///
    /// Until the first snapshot has been produced a failed poll yields an
    /// empty snapshot instead of an error; the logger may just be asleep.
    pub async fn refresh(&self, cancel: &CancellationToken) -> Result<Option<Refresh>> {
        let plan = self.config.polling().read_plan();

        let selected = match &self.poller {
            Some(poller) => {
                self.arbiter
                    .next(|| poller.poll(&plan, ModbusFunction::ReadInput, cancel))
                    .await
            }
            None => match self.arbiter.take_pushed() {
                Some(regs) => Ok((regs, Source::Push)),
                None => {
                    debug!("no pushed data and no logger host to poll");
                    return Ok(None);
                }
            },
        };

        let (regs, source) = match selected {
            Ok(r) => r,
            Err(err) => {
                self.update_stats(|s| s.poll_failures += 1);

                if self.produced.load(Ordering::SeqCst) {
                    return Err(err.context("error communicating with logger"));
                }

                warn!(
                    "logger not responding (probably standby) - values will update when data arrives: {:#}",
                    err
                );
                self.update_stats(|s| s.empty_cycles += 1);
                return Ok(Some(self.publish(Source::Poll, TelemetrySnapshot::default())));
            }
        };

        if !regs.is_empty() {
            self.ensure_identity().await;
        }

        let snapshot = self.decoder.decode(&regs);
        debug!(
            "decoded {} values from {} registers ({:?})",
            snapshot.len(),
            regs.len(),
            source
        );

        self.update_stats(|s| match source {
            Source::Push => s.push_cycles += 1,
            Source::Poll => s.poll_cycles += 1,
        });

        Ok(Some(self.publish(source, snapshot)))
    }

    /// Best-effort read of the holding (configuration) registers on a fresh
    /// session. Blocks that fail are left out.
    pub async fn read_configuration(&self) -> Result<RegisterMap> {
        let Some(poller) = &self.poller else {
            bail!("no logger host configured");
        };

        let plan = self.config.polling().holding_plan();
        poller.read_available(&plan, ModbusFunction::ReadHolding).await
    }

    /// Forget per-session state, so identity is read again on the next
    /// successful cycle.
    pub fn reset_session(&self) {
        info!("logger session reset");
        self.identity.reset();
    }

    async fn ensure_identity(&self) {
        let identity = match &self.poller {
            Some(poller) => {
                self.identity
                    .ensure(|| poller.read_once(register::DEVICE_INFO_BLOCK, ModbusFunction::ReadInput))
                    .await
            }
            // nothing to read it from
            None => self.identity.ensure(|| async { Err(anyhow!("no logger host")) }).await,
        };

        if let Some(identity) = identity {
            let _ = self.channels.to_mqtt.send(mqtt::ChannelData::Identity(identity));
        }
    }

    fn publish(&self, source: Source, snapshot: TelemetrySnapshot) -> Refresh {
        self.produced.store(true, Ordering::SeqCst);
        self.update_stats(|s| s.cycles += 1);

        let refresh = Refresh { source, snapshot };
        // no subscribers is fine
        let _ = self
            .channels
            .to_mqtt
            .send(mqtt::ChannelData::Snapshot(refresh.clone()));

        refresh
    }

    fn update_stats(&self, f: impl FnOnce(&mut RefreshStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }
}
