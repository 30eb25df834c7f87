//! In-memory bus
//!
//! Keeps every published message in order. Used as the bus double in
//! tests and by the `inspect` command to show what would be sent.

use async_trait::async_trait;
use std::sync::Mutex;

use super::{PublishedMessage, Publisher, Qos};
use crate::error::BusError;

#[derive(Debug, Default)]
pub struct MemoryBus {
    messages: Mutex<Vec<PublishedMessage>>,
    reject: bool,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus that refuses every publish, as if the broker were gone
    pub fn rejecting() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            reject: true,
        }
    }

    /// Snapshot of the messages published so far
    pub fn messages(&self) -> Vec<PublishedMessage> {
        self.lock().clone()
    }

    /// Remove and return the messages published so far
    pub fn take(&self) -> Vec<PublishedMessage> {
        std::mem::take(&mut *self.lock())
    }

    /// Payloads as text, in publish order
    pub fn payloads(&self) -> Vec<String> {
        self.lock()
            .iter()
            .map(|m| m.payload_str().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<PublishedMessage>> {
        // A panic while holding the lock leaves the Vec intact
        self.messages.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Publisher for MemoryBus {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: Qos,
        retain: bool,
    ) -> Result<(), BusError> {
        if self.reject {
            return Err(BusError::Publish {
                topic: topic.to_string(),
                error: "bus rejected message".to_string(),
            });
        }

        self.lock().push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }
}
