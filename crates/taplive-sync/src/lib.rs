//! # taplive-sync
//!
//! State synchronization engine for live bar dashboards.
//!
//! Two independent sources feed each mounted dashboard:
//! - Periodic snapshots of the authoritative read models (totals, top products)
//! - Push events over one shared, reference-counted connection
//!
//! Push events accumulate as incremental counters on top of the last snapshot
//! and are reset whenever a newer snapshot is accepted, so the displayed
//! totals self-correct at every refresh.
//!
//! ## Architecture
//!
//! ```text
//!  SnapshotFetcher ──(pollers)──┐
//!                               ▼
//!  ConnectionManager ──▶ StoreActor(LiveStore) ──compose()──▶ watch<DashboardView>
//!        ▲                      ▲
//!        └──── LiveDashboard::start / stop ────┘
//! ```

mod composer;
mod connection;
mod dashboard;
mod feed;
mod fetcher;
pub mod memory;
mod reducer;
mod store;
pub mod transport;

pub use composer::{bar_label, compose, resolve_name, AlertRow, DashboardView, SaleRow};
pub use connection::{ConnectionHandle, ConnectionManager, LinkStatus, Subscription};
pub use dashboard::{LiveDashboard, SyncContext};
pub use feed::Feed;
pub use fetcher::{HttpSnapshotSource, QueryKey, SnapshotFetcher, SnapshotSource};
pub use memory::{MemoryConnector, MemoryServer};
pub use reducer::{EventReducer, Reduction, SubscriptionPhase};
pub use store::{DashboardMode, FetchStatus, LiveStore};
pub use transport::{Connector, Transport, WsConnector, WsTransport};
