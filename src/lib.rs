//! # Nexus Edge Data Plane
//!
//! Two industrial data-plane services over one library:
//!
//! ```text
//! Field devices ── protocol clients ── pools ── scheduler ──┐
//!   (Modbus/OPC UA/S7)                                      ├─ MQTT broker
//!                       command handler ◄── $nexus/cmd ─────┘      │
//!                                                                  ▼
//!                 shared subscription ── queue ── batcher ── bulk writers ── TimescaleDB
//! ```
//!
//! - **Gateway** (`nexus-gateway`): polls device tags on per-device
//!   cadences, normalizes raw bytes into typed engineering values,
//!   publishes them into the unified namespace, and executes write
//!   commands back to devices with correlated responses.
//! - **Ingestion** (`nexus-ingestion`): consumes the data topics through
//!   a load-balanced shared subscription and persists them through
//!   bounded batching into the time-series store.

pub mod breaker;
pub mod codec;
pub mod commands;
pub mod config;
pub mod error;
pub mod gateway;
pub mod health;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod pool;
pub mod protocols;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod sim;
