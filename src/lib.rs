//! # meshsync - connection and configuration engine for Meshtastic radios
//!
//! meshsync keeps a live, typed mirror of one or more Meshtastic devices and lets a client
//! edit their configuration locally before writing it back in acknowledged batches.
//!
//! ## Features
//!
//! - **Transports**: USB/UART serial (feature `serial`) and TCP, or any async byte stream.
//! - **Stream codec**: `0x94 0xC3` framed protobuf with resynchronisation after noise.
//! - **Device mirror**: nodes with bounded position/telemetry history, channels, radio and
//!   module config, waypoints and received text, published as cheap immutable snapshots.
//! - **Edit overlay**: sparse per-section edits, merged over the device's values only when
//!   committed.
//! - **Commits**: per group (radio, module, channel) inside the device's edit transaction,
//!   every write acknowledged, stored values read back afterwards.
//! - **Bulk documents**: export / import of whole configurations as JSON.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshsync::config::Config;
//! use meshsync::connection::{ConnectionManager, SessionSettings};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("meshsync.toml").await?;
//!     let manager = ConnectionManager::new(SessionSettings::from(&config));
//!     let handle = manager.connect(config.connection.transport_target(), true).await?;
//!     let node = manager.wait_connected(&handle, Duration::from_secs(10)).await?;
//!     println!("connected to !{:08x}", node);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`transport`] - serial / TCP / stream links
//! - [`meshtastic`] - framing and protobuf decode/encode
//! - [`device`] - device state store and config section addressing
//! - [`overlay`] - local edits and the merge rules
//! - [`commit`] - commit planning and acknowledgement tracking
//! - [`connection`] - connection manager and per-connection tasks
//! - [`bulk`] - bulk configuration documents
//! - [`config`] - TOML configuration
//! - [`errors`] - error taxonomy
//! - [`protobuf`] - Meshtastic wire types

pub mod bulk;
pub mod commit;
pub mod config;
pub mod connection;
pub mod device;
pub mod errors;
pub mod logutil;
pub mod meshtastic;
pub mod metrics;
pub mod overlay;
pub mod protobuf;
pub mod transport;
