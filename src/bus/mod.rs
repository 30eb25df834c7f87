//! Message Bus
//!
//! The forwarders only see the [`Publisher`] trait. Publishing is
//! fire-and-forget: a call either queues the message or refuses it, it
//! never waits for the broker and delivery is never confirmed.
//!
//! - **MqttBus**: rumqttc client with a background event-loop task
//! - **MemoryBus**: records messages in memory (tests, `inspect`)

mod memory;
mod mqtt;

pub use memory::MemoryBus;
pub use mqtt::MqttBus;

use async_trait::async_trait;

use crate::error::BusError;

/// MQTT quality of service level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Qos {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for Qos {
    type Error = u8;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(other),
        }
    }
}

impl From<Qos> for rumqttc::QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => rumqttc::QoS::AtMostOnce,
            Qos::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            Qos::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

/// A message handed to the bus
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub retain: bool,
}

impl PublishedMessage {
    /// Payload as UTF-8 text (both forwarders publish text)
    pub fn payload_str(&self) -> &str {
        std::str::from_utf8(&self.payload).unwrap_or("<binary>")
    }
}

/// Outbound side of a bus connection
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Queue one message for sending
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: Qos,
        retain: bool,
    ) -> Result<(), BusError>;
}
