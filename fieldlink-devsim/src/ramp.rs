//! Register ramps written to a Modbus device.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fieldlink_common::sleep_or_cancelled;
use mqtt_bridge_modbus::{FieldbusConnector, FieldbusEndpoint, FieldbusSession};

use crate::config::WriterConfig;

/// Direction of a ramp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RampMode {
    /// `1, 2, …, max-1`, then back to 1.
    #[default]
    Up,
    /// `max, max-1, …, 1`, then back to max.
    Down,
}

impl RampMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RampMode::Up => "up",
            RampMode::Down => "down",
        }
    }

    /// Smallest `max` that yields a non-empty ramp.
    pub fn min_max(&self) -> u16 {
        match self {
            RampMode::Up => 2,
            RampMode::Down => 1,
        }
    }
}

impl fmt::Display for RampMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Endless ramp of register values.
///
/// ```
/// use fieldlink_devsim::ramp::{Ramp, RampMode};
///
/// let up: Vec<u16> = Ramp::new(RampMode::Up, 4).take(5).collect();
/// assert_eq!(up, vec![1, 2, 3, 1, 2]);
///
/// let down: Vec<u16> = Ramp::new(RampMode::Down, 3).take(5).collect();
/// assert_eq!(down, vec![3, 2, 1, 3, 2]);
/// ```
#[derive(Debug, Clone)]
pub struct Ramp {
    mode: RampMode,
    max: u16,
    next: u16,
}

impl Ramp {
    pub fn new(mode: RampMode, max: u16) -> Self {
        let next = match mode {
            RampMode::Up => 1,
            RampMode::Down => max,
        };
        Self { mode, max, next }
    }
}

impl Iterator for Ramp {
    type Item = u16;

    fn next(&mut self) -> Option<u16> {
        let value = self.next;
        self.next = match self.mode {
            RampMode::Up if value.saturating_add(1) >= self.max => 1,
            RampMode::Up => value + 1,
            RampMode::Down if value <= 1 => self.max,
            RampMode::Down => value - 1,
        };
        Some(value)
    }
}

/// Why a writer session ended.
enum SessionEnd {
    Cancelled,
    Failed,
}

/// Writes a ramp to one holding register, reconnecting on failure.
///
/// Each connection starts the ramp over.
pub struct RampWriter<C> {
    connector: C,
    endpoint: FieldbusEndpoint,
    config: WriterConfig,
}

impl<C: FieldbusConnector> RampWriter<C> {
    pub fn new(connector: C, endpoint: FieldbusEndpoint, config: WriterConfig) -> Self {
        Self {
            connector,
            endpoint,
            config,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let address = self.config.address;

        loop {
            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.connector.connect(&self.endpoint) => result,
            };

            match connected {
                Ok(mut session) => {
                    info!(
                        addr = %self.endpoint.addr(),
                        address,
                        mode = %self.config.mode,
                        "Ramp writer connected"
                    );

                    let end = self.write_ramp(&mut session, &cancel).await;
                    session.close().await;
                    if let SessionEnd::Cancelled = end {
                        break;
                    }
                }
                Err(e) => {
                    warn!(addr = %self.endpoint.addr(), address, error = %e, "Ramp writer connect failed");
                }
            }

            if !sleep_or_cancelled(self.config.restart_delay(), &cancel).await {
                break;
            }
        }

        debug!(address, "Ramp writer stopped");
    }

    async fn write_ramp(&self, session: &mut C::Session, cancel: &CancellationToken) -> SessionEnd {
        let address = self.config.address;

        for value in Ramp::new(self.config.mode, self.config.max) {
            let written = tokio::select! {
                _ = cancel.cancelled() => return SessionEnd::Cancelled,
                result = session.write_register(address, value) => result,
            };

            if let Err(e) = written {
                warn!(address, value, error = %e, "Register write failed");
                return SessionEnd::Failed;
            }
            debug!(address, value, "Wrote register");

            if !sleep_or_cancelled(self.config.period(), cancel).await {
                return SessionEnd::Cancelled;
            }
        }

        SessionEnd::Failed
    }
}
