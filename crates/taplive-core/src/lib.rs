//! # taplive-core
//!
//! Core types for the taplive live-event dashboard.
//!
//! Two sources feed a dashboard:
//!
//! - **Snapshots** pulled periodically from the backend (aggregate totals and a
//!   ranked top-products list). These are the authoritative numbers.
//! - **Live events** pushed over a persistent channel (sales, POS state and
//!   traffic, low-stock alerts). These are layered on top of the last snapshot
//!   until the next one arrives.
//!
//! This crate only holds the shared vocabulary: the data model, the wire
//! event shapes, the unified error type and the configuration file.

mod config;
mod error;
mod events;
mod types;

pub use config::{
    BackendConfig, FeedConfig, LiveConfig, ReconnectPolicy, RefreshConfig, DEFAULT_CONFIG_FILE,
};
pub use error::{LiveError, Result};
pub use events::{
    parse_frame, AlertCreated, ClientMessage, DeviceMetricsUpdate, DeviceStateUpdate,
    InboundFrame, LiveEvent, PosSaleCompleted, SaleCreated,
};
pub use types::*;
