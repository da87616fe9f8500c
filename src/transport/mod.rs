//! Byte transports.
//!
//! The session layer never assumes a physical link. A [`TransportProvider`]
//! turns a [`TransportDescriptor`] into a boxed [`Transport`]; the crate ships
//! TCP (console servers, reverse telnet), SSH (interactive PTY shell) and an
//! in-memory scripted transport. Serial ports are served by external
//! providers implementing the same traits.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

mod scripted;
mod ssh;
mod tcp;

pub use scripted::ScriptedTransport;
pub use ssh::SshTransport;
pub use tcp::TcpTransport;

/// A connected, exclusively owned byte stream.
#[async_trait]
pub trait Transport: Send {
    /// Reads up to `max_bytes`. Returns [`TransportError::Timeout`] if nothing
    /// arrives within `timeout`; a zero timeout polls once.
    async fn read(&mut self, max_bytes: usize, timeout: Duration)
    -> Result<Vec<u8>, TransportError>;

    /// Writes all of `data`.
    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Releases the link. Reads and writes fail with `Closed` afterwards.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Human readable peer description without secrets.
    fn describe(&self) -> String {
        "transport".to_string()
    }
}

/// Opens transports from descriptors.
#[async_trait]
pub trait TransportProvider: Send + Sync {
    async fn connect(
        &self,
        descriptor: &TransportDescriptor,
    ) -> Result<Box<dyn Transport>, TransportError>;
}

fn default_ssh_port() -> u16 {
    22
}

fn default_baud_rate() -> u32 {
    9600
}

/// Where and how to reach a device.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportDescriptor {
    /// Raw TCP, e.g. a console server port.
    Tcp { host: String, port: u16 },
    /// SSH with an interactive shell.
    Ssh {
        host: String,
        #[serde(default = "default_ssh_port")]
        port: u16,
        username: String,
        #[serde(default, skip_serializing)]
        password: String,
        /// Offer legacy key exchange and CBC ciphers.
        #[serde(default)]
        legacy_algorithms: bool,
        /// Verify the host key against the known hosts file.
        #[serde(default)]
        strict_host_key: bool,
    },
    /// Local serial console. Requires an external provider.
    Serial {
        port: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },
    /// Anything an external provider understands by name.
    Named { name: String },
}

impl TransportDescriptor {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::Named { name: name.into() }
    }

    /// Label used in session records and logs. Never contains secrets.
    pub fn label(&self) -> String {
        match self {
            Self::Tcp { host, port } => format!("tcp://{host}:{port}"),
            Self::Ssh {
                host,
                port,
                username,
                ..
            } => format!("ssh://{username}@{host}:{port}"),
            Self::Serial { port, baud_rate } => format!("serial://{port}@{baud_rate}"),
            Self::Named { name } => format!("named://{name}"),
        }
    }
}

impl fmt::Debug for TransportDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TransportDescriptor")
            .field(&self.label())
            .finish()
    }
}

/// Provider for the transports implemented in this crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTransportProvider;

#[async_trait]
impl TransportProvider for DefaultTransportProvider {
    async fn connect(
        &self,
        descriptor: &TransportDescriptor,
    ) -> Result<Box<dyn Transport>, TransportError> {
        debug!("connecting {}", descriptor.label());
        match descriptor {
            TransportDescriptor::Tcp { host, port } => {
                Ok(Box::new(TcpTransport::connect(host, *port).await?))
            }
            TransportDescriptor::Ssh {
                host,
                port,
                username,
                password,
                legacy_algorithms,
                strict_host_key,
            } => Ok(Box::new(
                SshTransport::connect(
                    host,
                    *port,
                    username,
                    password,
                    *legacy_algorithms,
                    *strict_host_key,
                )
                .await?,
            )),
            other => Err(TransportError::Connect(format!(
                "no built-in provider for {}",
                other.label()
            ))),
        }
    }
}
