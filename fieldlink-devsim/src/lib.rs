//! Test-bench simulator for FieldLink.
//!
//! Two kinds of workers, each with its own session and reconnect loop:
//!
//! - [`RampWriter`] drives a holding register through an endless ramp so a
//!   bridge polling that register always has changing data.
//! - [`LivenessWatchdog`] watches a device's tag topics and publishes a
//!   retained `{"value":0}` on its status topic when they go quiet.

pub mod config;
pub mod ramp;
pub mod watchdog;

pub use config::{DevsimConfig, WatchdogConfig, WriterConfig};
pub use ramp::{Ramp, RampMode, RampWriter};
pub use watchdog::LivenessWatchdog;
