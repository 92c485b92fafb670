//! Scriptable in-memory Modbus device for tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::catalog::{RegisterKind, registers_to_bytes};
use crate::fieldbus::{FieldbusConnector, FieldbusEndpoint, FieldbusError, FieldbusSession};

/// One register read served by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadCall {
    pub kind: RegisterKind,
    pub address: u16,
    pub quantity: u16,
    pub at: Instant,
}

#[derive(Default)]
struct DeviceState {
    registers: HashMap<(RegisterKind, u16), u16>,
    raw: HashMap<(RegisterKind, u16), Vec<u8>>,
    refuse_connects: usize,
    failing_reads: usize,
    failing_writes: usize,
    connects: Vec<Instant>,
    reads: Vec<ReadCall>,
    writes: Vec<(u16, u16)>,
    open_sessions: usize,
}

/// Shared handle to an in-memory device.
#[derive(Clone, Default)]
pub struct MockDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> MockConnector {
        MockConnector {
            device: self.clone(),
        }
    }

    pub fn set_register(&self, kind: RegisterKind, address: u16, value: u16) {
        self.state.lock().registers.insert((kind, address), value);
    }

    pub fn register(&self, kind: RegisterKind, address: u16) -> u16 {
        self.state
            .lock()
            .registers
            .get(&(kind, address))
            .copied()
            .unwrap_or(0)
    }

    /// Serve `bytes` verbatim for any read starting at `address`.
    pub fn set_raw_response(&self, kind: RegisterKind, address: u16, bytes: Vec<u8>) {
        self.state.lock().raw.insert((kind, address), bytes);
    }

    pub fn refuse_next_connects(&self, count: usize) {
        self.state.lock().refuse_connects = count;
    }

    pub fn fail_next_reads(&self, count: usize) {
        self.state.lock().failing_reads = count;
    }

    pub fn fail_next_writes(&self, count: usize) {
        self.state.lock().failing_writes = count;
    }

    pub fn connect_times(&self) -> Vec<Instant> {
        self.state.lock().connects.clone()
    }

    pub fn reads(&self) -> Vec<ReadCall> {
        self.state.lock().reads.clone()
    }

    pub fn writes(&self) -> Vec<(u16, u16)> {
        self.state.lock().writes.clone()
    }

    pub fn open_sessions(&self) -> usize {
        self.state.lock().open_sessions
    }
}

/// [`FieldbusConnector`] for a [`MockDevice`].
#[derive(Clone)]
pub struct MockConnector {
    device: MockDevice,
}

#[async_trait]
impl FieldbusConnector for MockConnector {
    type Session = MockSession;

    async fn connect(&self, endpoint: &FieldbusEndpoint) -> Result<MockSession, FieldbusError> {
        let mut state = self.device.state.lock();
        state.connects.push(Instant::now());

        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(FieldbusError::Connect {
                addr: endpoint.addr(),
                message: "connection refused".to_string(),
            });
        }

        state.open_sessions += 1;
        Ok(MockSession {
            device: self.device.clone(),
            open: true,
        })
    }
}

/// A session on a [`MockDevice`].
pub struct MockSession {
    device: MockDevice,
    open: bool,
}

#[async_trait]
impl FieldbusSession for MockSession {
    async fn read_registers(
        &mut self,
        kind: RegisterKind,
        address: u16,
        quantity: u16,
    ) -> Result<Vec<u8>, FieldbusError> {
        if !self.open {
            return Err(FieldbusError::Closed);
        }

        let mut state = self.device.state.lock();
        state.reads.push(ReadCall {
            kind,
            address,
            quantity,
            at: Instant::now(),
        });

        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(FieldbusError::Read {
                kind,
                address,
                quantity,
                message: "Exception: GatewayTargetDevice".to_string(),
            });
        }

        if let Some(bytes) = state.raw.get(&(kind, address)) {
            return Ok(bytes.clone());
        }

        let words: Vec<u16> = (0..quantity)
            .map(|offset| {
                state
                    .registers
                    .get(&(kind, address.wrapping_add(offset)))
                    .copied()
                    .unwrap_or(0)
            })
            .collect();
        Ok(registers_to_bytes(&words))
    }

    async fn write_register(&mut self, address: u16, value: u16) -> Result<(), FieldbusError> {
        if !self.open {
            return Err(FieldbusError::Closed);
        }

        let mut state = self.device.state.lock();
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(FieldbusError::Write {
                address,
                message: "Exception: ServerDeviceFailure".to_string(),
            });
        }

        state.writes.push((address, value));
        state
            .registers
            .insert((RegisterKind::Holding, address), value);
        Ok(())
    }

    async fn close(&mut self) {
        if std::mem::replace(&mut self.open, false) {
            self.device.state.lock().open_sessions -= 1;
        }
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        if self.open {
            self.device.state.lock().open_sessions -= 1;
        }
    }
}
