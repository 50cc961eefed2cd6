use crate::prelude::*;

use crate::coordinator::{identity::DeviceIdentity, Refresh};
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, QoS};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

const PUBLISH_ATTEMPTS: u32 = 3;

#[derive(Clone, Debug)]
pub enum ChannelData {
    Snapshot(Refresh),
    Identity(DeviceIdentity),
}

// Message {{{
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub retain: bool,
    pub payload: String,
}

impl Message {
    pub fn for_snapshot(serial: u32, refresh: &Refresh) -> Result<Message> {
        Ok(Message {
            topic: format!("{}/telemetry", serial),
            retain: false,
            payload: serde_json::to_string(&refresh.snapshot)?,
        })
    }

    pub fn for_identity(serial: u32, identity: &DeviceIdentity) -> Result<Message> {
        Ok(Message {
            topic: format!("{}/identity", serial),
            retain: true,
            payload: serde_json::to_string(identity)?,
        })
    }
} // }}}

#[derive(Clone, Debug, Default)]
pub struct MqttStats {
    pub messages_sent: u64,
    pub errors: u64,
}

impl MqttStats {
    pub fn print_summary(&self) {
        info!("MQTT Statistics:");
        info!("  Messages sent: {}", self.messages_sent);
        info!("  Errors: {}", self.errors);
    }
}

#[derive(Clone)]
pub struct Mqtt {
    config: ConfigWrapper,
    channels: Channels,
    pub stats: Arc<Mutex<MqttStats>>,
}

impl Mqtt {
    pub fn new(config: ConfigWrapper, channels: Channels) -> Self {
        Self {
            config,
            channels,
            stats: Arc::new(Mutex::new(MqttStats::default())),
        }
    }

    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let c = self.config.mqtt();

        if !c.enabled() {
            info!("mqtt disabled, skipping");
            return Ok(());
        }

        let mut options = MqttOptions::new("solarman-bridge", c.host(), c.port());

        let will = LastWill {
            topic: self.lwt_topic(),
            message: bytes::Bytes::from("offline"),
            qos: QoS::AtLeastOnce,
            retain: true,
        };
        options.set_last_will(will);

        options.set_keep_alive(Duration::from_secs(60));
        if let (Some(u), Some(p)) = (c.username(), c.password()) {
            options.set_credentials(u, p);
        }

        info!("initializing mqtt at {}:{}", c.host(), c.port());

        let (client, eventloop) = AsyncClient::new(options, 10);

        futures::try_join!(
            self.setup(client.clone()),
            self.receiver(eventloop, cancel.clone()),
            self.sender(client, cancel)
        )?;

        Ok(())
    }

    async fn setup(&self, client: AsyncClient) -> Result<()> {
        client
            .publish(self.lwt_topic(), QoS::AtLeastOnce, true, "online")
            .await?;

        Ok(())
    }

    // drives the connection; nothing is subscribed so incoming events are only logged
    async fn receiver(&self, mut eventloop: EventLoop, cancel: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(packet)) => trace!("mqtt RX: {:?}", packet),
                    Ok(Event::Outgoing(_)) => {}
                    Err(e) => {
                        error!("{}", e);
                        info!("reconnecting in 5s");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                        }
                    }
                },
            }
        }

        info!("MQTT receiver loop exiting");
        Ok(())
    }

    // coordinator -> mqtt
    async fn sender(&self, client: AsyncClient, cancel: CancellationToken) -> Result<()> {
        let mut receiver = self.channels.to_mqtt.subscribe();
        let serial = self.config.logger().serial();

        loop {
            let data = tokio::select! {
                _ = cancel.cancelled() => break,
                data = receiver.recv() => data,
            };

            let message = match data {
                Ok(ChannelData::Snapshot(refresh)) => Message::for_snapshot(serial, &refresh)?,
                Ok(ChannelData::Identity(identity)) => Message::for_identity(serial, &identity)?,
                Err(RecvError::Closed) => break,
                Err(RecvError::Lagged(n)) => {
                    warn!("mqtt sender lagging, {} messages dropped", n);
                    continue;
                }
            };

            self.publish(&client, message).await;
        }

        // a clean disconnect suppresses the LWT, so say offline ourselves.
        // the event loop may already be gone; never wait on it here
        let _ = client.try_publish(self.lwt_topic(), QoS::AtLeastOnce, true, "offline");
        let _ = client.try_disconnect();

        info!("MQTT sender loop exiting");
        Ok(())
    }

    async fn publish(&self, client: &AsyncClient, message: Message) {
        let topic = format!("{}/{}", self.config.mqtt().namespace(), message.topic);
        debug!("publishing: {} = {}", topic, message.payload);

        for attempt in 1..=PUBLISH_ATTEMPTS {
            match client
                .publish(&topic, QoS::AtLeastOnce, message.retain, message.payload.as_bytes())
                .await
            {
                Ok(_) => {
                    self.update_stats(|s| s.messages_sent += 1);
                    return;
                }
                Err(err) => {
                    error!(
                        "MQTT publish failed: {:?} (attempt {}/{})",
                        err, attempt, PUBLISH_ATTEMPTS
                    );
                    self.update_stats(|s| s.errors += 1);
                    if attempt < PUBLISH_ATTEMPTS {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }

    fn update_stats(&self, f: impl FnOnce(&mut MqttStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }

    fn lwt_topic(&self) -> String {
        format!("{}/LWT", self.config.mqtt().namespace())
    }
}
