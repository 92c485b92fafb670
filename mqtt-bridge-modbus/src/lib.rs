//! MQTT bridge for Modbus/TCP devices.
//!
//! The bridge keeps one MQTT session and one Modbus/TCP session alive,
//! polls the configured tags in order and publishes each value as JSON.
//!
//! # Topics
//!
//! ```text
//! devs/<client_id>/tags/<tag_name>   {"srcNmae", "tagNmae", "value", "timestamp"}
//! devs/<client_id>/status            {"value": 0|1}, retained
//! ```
//!
//! When `mqtt.topic` is set every record goes to that single topic instead.
//! The status topic carries the last will, so subscribers see `{"value":0}`
//! even when the bridge dies without disconnecting.

pub mod catalog;
pub mod config;
pub mod fieldbus;
pub mod poller;
pub mod supervisor;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use catalog::{RegisterKind, Tag, TagCatalog, ValueType};
pub use config::{FieldbusConfig, ModbusBridgeConfig, ReadErrorPolicy};
pub use fieldbus::{
    FieldbusConnector, FieldbusEndpoint, FieldbusError, FieldbusSession, ModbusTcpConnector,
};
pub use poller::{PollExit, TagPoller};
pub use supervisor::{ConnectionSupervisor, SupervisorExit, SupervisorState};
