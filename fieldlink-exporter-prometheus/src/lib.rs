//! Prometheus exporter for FieldLink device telemetry.
//!
//! Subscribes to the MQTT broker and turns every observed topic into one
//! gauge, exposed via an HTTP `/metrics` endpoint.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │   MQTT broker   │────>│    Registry     │────>│   HTTP Server   │
//! │ (devs/+/tags/+) │     │ (topic → gauge) │     │   (/metrics)    │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘
//! ```
//!
//! A message on `devs/dev1/tags/t1` with payload `{"value":42}` is exposed as
//! `devs_dev1_tags_t1 42.0`.
//!
//! # Usage
//!
//! ```bash
//! fieldlink-exporter-prometheus --config exporter.json5
//! ```
//!
//! See [`config::ExporterConfig`] for configuration options.

pub mod config;
pub mod http;
pub mod registry;
pub mod subscriber;

pub use config::ExporterConfig;
pub use http::{HttpError, HttpServer};
pub use registry::{DynamicMetricRegistry, MessageOutcome, RegistryStats, SharedRegistry};
pub use subscriber::TelemetrySubscriber;
