//! Glue for a message-bus gateway.
//!
//! The gateway subscribes to one `set` topic per writable register and
//! forwards every command it receives as a [`WriteRequest`]. Requests are
//! executed one at a time by [`serve_writes`], each as exactly one bus write.

use std::fmt::{Display, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::core::device::Device;
use crate::core::error::WriteError;
use crate::core::modbus::{Address, Value};
use crate::core::supervisor::Supervisor;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Topic {0} is not a set command")]
    NotACommand(String),

    #[error("Invalid {field} in topic {topic}")]
    InvalidTopic { topic: String, field: &'static str },

    #[error("Payload {0:?} is not a 16 bit decimal value")]
    InvalidPayload(String),
}

/// `{prefix}/{device_id}/{address}/set` with a decimal payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetCommand {
    pub device_id: u8,
    pub address: Address,
    pub value: Value,
}

impl SetCommand {
    pub fn topic(prefix: &str, device_id: u8, address: Address) -> String {
        format!("{prefix}/{device_id}/{address}/set")
    }

    pub fn parse(prefix: &str, topic: &str, payload: &[u8]) -> Result<SetCommand, CommandError> {
        let not_a_command = || CommandError::NotACommand(topic.to_string());

        let rest = topic
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .and_then(|rest| rest.strip_suffix("/set"))
            .ok_or_else(not_a_command)?;

        let (device, address) = rest.split_once('/').ok_or_else(not_a_command)?;

        let device_id = device.parse().map_err(|_| CommandError::InvalidTopic {
            topic: topic.to_string(),
            field: "device id",
        })?;
        let address = address.parse().map_err(|_| CommandError::InvalidTopic {
            topic: topic.to_string(),
            field: "address",
        })?;

        let payload = String::from_utf8_lossy(payload);
        let value = payload
            .trim()
            .parse()
            .map_err(|_| CommandError::InvalidPayload(payload.to_string()))?;

        Ok(SetCommand {
            device_id,
            address,
            value,
        })
    }
}

impl Display for SetCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "set {} on device {} to {}",
            self.address, self.device_id, self.value
        )
    }
}

/// Topics a gateway should subscribe to, one per writable register.
pub fn writable_topics(prefix: &str, devices: &[Device]) -> Vec<String> {
    devices
        .iter()
        .flat_map(|device| {
            device
                .registers
                .iter()
                .filter(|r| r.writable && r.kind.is_writable_kind())
                .map(move |r| SetCommand::topic(prefix, device.device_id, r.address))
        })
        .collect()
}

/// Executes on-demand writes.
#[async_trait]
pub trait WriteHandler: Send + Sync {
    async fn handle_write(&self, device_id: u8, address: Address, value: Value) -> Result<(), WriteError>;
}

#[async_trait]
impl WriteHandler for Supervisor {
    async fn handle_write(&self, device_id: u8, address: Address, value: Value) -> Result<(), WriteError> {
        self.write(device_id, address, value).await
    }
}

#[derive(Debug)]
pub struct WriteRequest {
    pub command: SetCommand,
    pub reply: Option<oneshot::Sender<Result<(), WriteError>>>,
}

impl WriteRequest {
    /// A request whose outcome is awaited through the returned receiver.
    pub fn new(command: SetCommand) -> (WriteRequest, oneshot::Receiver<Result<(), WriteError>>) {
        let (tx, rx) = oneshot::channel();
        (
            WriteRequest {
                command,
                reply: Some(tx),
            },
            rx,
        )
    }

    /// Fire and forget.
    pub fn detached(command: SetCommand) -> WriteRequest {
        WriteRequest {
            command,
            reply: None,
        }
    }
}

/// Drains `requests` until every sender is gone.
pub async fn serve_writes(handler: Arc<dyn WriteHandler>, mut requests: mpsc::Receiver<WriteRequest>) {
    while let Some(WriteRequest { command, reply }) = requests.recv().await {
        debug!("Bridge command: {command}");

        let result = handler
            .handle_write(command.device_id, command.address, command.value)
            .await;

        if let Err(err) = &result {
            warn!("Bridge command {command} failed: {err}");
        }

        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }

    debug!("Write channel closed");
}

impl Supervisor {
    pub fn writable_topics(&self, prefix: &str) -> Vec<String> {
        writable_topics(prefix, &self.list_devices())
    }
}
