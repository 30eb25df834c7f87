//! MQTT bus client
//!
//! Thin wrapper over `rumqttc`. `connect` waits for the broker's CONNACK so
//! an unreachable broker is reported at startup; after that a background
//! task drives the event loop (keep-alive, outbound flush, reconnects).
//!
//! Publishing never waits for the broker: when the request queue is full
//! the message is refused with [`BusError::Publish`].

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet,
};
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{Publisher, Qos};
use crate::config::BrokerConfig;
use crate::error::BusError;

/// Outbound request queue between the client handle and the event loop
const REQUEST_QUEUE_CAPACITY: usize = 1024;

/// Delay before polling again after a transport error
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Connected MQTT client
pub struct MqttBus {
    client: AsyncClient,
    event_task: JoinHandle<()>,
    addr: String,
}

impl MqttBus {
    /// Connect to the broker and start the background event loop
    pub async fn connect(config: &BrokerConfig) -> Result<Self, BusError> {
        let addr = config.addr();
        let client_id = format!(
            "{}-{}",
            config.client_id,
            &Uuid::new_v4().simple().to_string()[..8]
        );

        let mut options = MqttOptions::new(client_id.clone(), config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(config.keepalive_secs.max(5)));

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_QUEUE_CAPACITY);

        let timeout = Duration::from_secs(config.connect_timeout_secs);
        tokio::time::timeout(timeout, wait_for_connack(&mut eventloop, &addr))
            .await
            .map_err(|_| BusError::Timeout(addr.clone()))??;

        tracing::info!(broker = %addr, client_id = %client_id, "MQTT connected");

        let event_task = tokio::spawn(drive_event_loop(eventloop, addr.clone()));

        Ok(Self {
            client,
            event_task,
            addr,
        })
    }

    /// Send DISCONNECT and stop the background event loop.
    ///
    /// Never waits on a full request queue; the event loop is aborted if it
    /// does not stop on its own.
    pub async fn disconnect(self) {
        if let Err(e) = self.client.try_disconnect() {
            tracing::warn!(broker = %self.addr, error = %e, "MQTT disconnect request failed");
        }

        let mut event_task = self.event_task;
        if tokio::time::timeout(Duration::from_secs(2), &mut event_task)
            .await
            .is_err()
        {
            event_task.abort();
        }

        tracing::info!(broker = %self.addr, "MQTT disconnected");
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop, addr: &str) -> Result<(), BusError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    return Ok(());
                }
                return Err(BusError::Connect {
                    addr: addr.to_string(),
                    error: format!("{:?}", ack.code),
                });
            }
            Ok(_) => continue,
            Err(e) => {
                return Err(BusError::Connect {
                    addr: addr.to_string(),
                    error: e.to_string(),
                })
            }
        }
    }
}

async fn drive_event_loop(mut eventloop: EventLoop, addr: String) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                tracing::debug!(broker = %addr, "MQTT event loop stopped");
                break;
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                tracing::info!(broker = %addr, "MQTT reconnected");
            }
            Ok(_) => {}
            Err(e) => {
                // rumqttc reconnects on the next poll
                tracing::warn!(broker = %addr, error = %e, "MQTT connection error");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

#[async_trait]
impl Publisher for MqttBus {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: Qos,
        retain: bool,
    ) -> Result<(), BusError> {
        // A full queue (broker gone) is a refused message, not a wait
        self.client
            .try_publish(topic, qos.into(), retain, payload)
            .map_err(|e| BusError::Publish {
                topic: topic.to_string(),
                error: e.to_string(),
            })
    }
}
