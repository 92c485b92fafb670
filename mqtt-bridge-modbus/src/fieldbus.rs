//! Fieldbus sessions.
//!
//! [`FieldbusConnector`] / [`FieldbusSession`] are what the supervisor and
//! poller are written against. [`ModbusTcpConnector`] implements them with
//! `tokio-modbus`.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::{debug, info};

use crate::catalog::{RegisterKind, registers_to_bytes};

/// Error type for fieldbus operations.
#[derive(Debug, Error)]
pub enum FieldbusError {
    #[error("Cannot resolve {addr}: {message}")]
    Resolve { addr: String, message: String },
    #[error("Connection to {addr} failed: {message}")]
    Connect { addr: String, message: String },
    #[error("Connection to {addr} timed out after {timeout_ms}ms")]
    ConnectTimeout { addr: String, timeout_ms: u64 },
    #[error("Read of {quantity} {kind} register(s) at {address} failed: {message}")]
    Read {
        kind: RegisterKind,
        address: u16,
        quantity: u16,
        message: String,
    },
    #[error("Write to register {address} failed: {message}")]
    Write { address: u16, message: String },
    #[error("Call timed out after {0}ms")]
    Timeout(u64),
    #[error("Session closed")]
    Closed,
}

/// Where and how to reach one device unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldbusEndpoint {
    pub host: String,
    pub port: u16,
    pub device_id: u8,
    /// Bound applied to connect and to every read/write.
    pub call_timeout: Duration,
}

impl FieldbusEndpoint {
    /// `host:port` for logging.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// An open connection to a device unit.
#[async_trait]
pub trait FieldbusSession: Send {
    /// Read `quantity` registers starting at `address`, concatenated big-endian.
    async fn read_registers(
        &mut self,
        kind: RegisterKind,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u8>, FieldbusError>;

    /// Write a single holding register.
    async fn write_register(&mut self, address: u16, value: u16) -> Result<(), FieldbusError>;

    /// Close the connection. Later calls fail with [`FieldbusError::Closed`].
    async fn close(&mut self);
}

/// Factory for [`FieldbusSession`]s.
#[async_trait]
pub trait FieldbusConnector: Send + Sync {
    type Session: FieldbusSession + 'static;

    async fn connect(&self, endpoint: &FieldbusEndpoint) -> Result<Self::Session, FieldbusError>;
}

/// Connects to Modbus/TCP devices.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModbusTcpConnector;

#[async_trait]
impl FieldbusConnector for ModbusTcpConnector {
    type Session = ModbusTcpSession;

    async fn connect(&self, endpoint: &FieldbusEndpoint) -> Result<ModbusTcpSession, FieldbusError> {
        ModbusTcpSession::connect(endpoint).await
    }
}

/// A Modbus/TCP connection to one unit.
pub struct ModbusTcpSession {
    ctx: Option<Context>,
    addr: String,
    call_timeout: Duration,
}

impl std::fmt::Debug for ModbusTcpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusTcpSession")
            .field("addr", &self.addr)
            .field("open", &self.ctx.is_some())
            .finish()
    }
}

impl ModbusTcpSession {
    /// Resolve the host and connect, bounded by the call timeout.
    pub async fn connect(endpoint: &FieldbusEndpoint) -> Result<Self, FieldbusError> {
        let addr = endpoint.addr();
        let timeout_ms = endpoint.call_timeout.as_millis() as u64;

        let ctx = tokio::time::timeout(endpoint.call_timeout, async {
            let socket = resolve(endpoint).await?;
            debug!(addr = %addr, resolved = %socket, "Connecting to Modbus device");
            tcp::connect_slave(socket, Slave(endpoint.device_id))
                .await
                .map_err(|e| FieldbusError::Connect {
                    addr: addr.clone(),
                    message: e.to_string(),
                })
        })
        .await
        .map_err(|_| FieldbusError::ConnectTimeout {
            addr: addr.clone(),
            timeout_ms,
        })??;

        info!(addr = %addr, unit = endpoint.device_id, "Connected to Modbus device");

        Ok(Self {
            ctx: Some(ctx),
            addr,
            call_timeout: endpoint.call_timeout,
        })
    }

    fn context(&mut self) -> Result<&mut Context, FieldbusError> {
        self.ctx.as_mut().ok_or(FieldbusError::Closed)
    }
}

async fn resolve(endpoint: &FieldbusEndpoint) -> Result<SocketAddr, FieldbusError> {
    let mut addrs = tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port))
        .await
        .map_err(|e| FieldbusError::Resolve {
            addr: endpoint.addr(),
            message: e.to_string(),
        })?;

    addrs.next().ok_or_else(|| FieldbusError::Resolve {
        addr: endpoint.addr(),
        message: "no addresses found".to_string(),
    })
}

#[async_trait]
impl FieldbusSession for ModbusTcpSession {
    async fn read_registers(
        &mut self,
        kind: RegisterKind,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u8>, FieldbusError> {
        let call_timeout = self.call_timeout;
        let read_error = |message: String| FieldbusError::Read {
            kind,
            address,
            quantity,
            message,
        };

        let ctx = self.context()?;
        let result = match kind {
            RegisterKind::Input => {
                tokio::time::timeout(call_timeout, ctx.read_input_registers(address, quantity))
                    .await
            }
            RegisterKind::Holding => {
                tokio::time::timeout(call_timeout, ctx.read_holding_registers(address, quantity))
                    .await
            }
        };

        let words = result
            .map_err(|_| FieldbusError::Timeout(call_timeout.as_millis() as u64))?
            .map_err(|e| read_error(e.to_string()))?
            .map_err(|e| read_error(format!("Exception: {:?}", e)))?;

        Ok(registers_to_bytes(&words))
    }

    async fn write_register(&mut self, address: u16, value: u16) -> Result<(), FieldbusError> {
        let call_timeout = self.call_timeout;
        let write_error = |message: String| FieldbusError::Write { address, message };

        let ctx = self.context()?;
        tokio::time::timeout(call_timeout, ctx.write_single_register(address, value))
            .await
            .map_err(|_| FieldbusError::Timeout(call_timeout.as_millis() as u64))?
            .map_err(|e| write_error(e.to_string()))?
            .map_err(|e| write_error(format!("Exception: {:?}", e)))
    }

    async fn close(&mut self) {
        if self.ctx.take().is_some() {
            debug!(addr = %self.addr, "Closed Modbus connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(port: u16) -> FieldbusEndpoint {
        FieldbusEndpoint {
            host: "127.0.0.1".to_string(),
            port,
            device_id: 1,
            call_timeout: Duration::from_millis(500),
        }
    }

    #[test]
    fn test_endpoint_addr() {
        assert_eq!(endpoint(5020).addr(), "127.0.0.1:5020");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Grab a free port and release it so nothing listens there.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = ModbusTcpConnector.connect(&endpoint(port)).await;
        assert!(matches!(
            result,
            Err(FieldbusError::Connect { .. }) | Err(FieldbusError::ConnectTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_unresolvable_host() {
        let endpoint = FieldbusEndpoint {
            host: "host.invalid".to_string(),
            ..endpoint(502)
        };
        let result = ModbusTcpConnector.connect(&endpoint).await;
        assert!(matches!(
            result,
            Err(FieldbusError::Resolve { .. }) | Err(FieldbusError::ConnectTimeout { .. })
        ));
    }
}
