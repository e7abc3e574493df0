//! Per-dashboard live store
//!
//! Owns everything one mounted dashboard accumulates: the last accepted
//! snapshots, the reducer's incremental state, fetch status flags, the name
//! table and the connection signal. All mutation goes through `&mut self`, so
//! a snapshot swap and the counter reset it implies happen in one step.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use taplive_core::{
    BarId, ConnectionState, FeedConfig, LiveError, LiveEvent, NameTable, RankedList, Snapshot,
    SubjectId,
};
use tracing::debug;

use crate::reducer::{EventReducer, Reduction, SubscriptionPhase};

/// Whether the dashboard receives push events at all
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DashboardMode {
    /// Snapshots plus push events
    Live,
    /// Snapshots only (no credential, or the channel could not be opened)
    PullOnly,
}

/// Status of one pull query
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchStatus {
    /// A result (or failure) for the current mount is still outstanding
    pub loading: bool,
    /// Error of the most recent attempt, cleared on success
    pub last_error: Option<String>,
    pub last_success: Option<DateTime<Utc>>,
}

impl FetchStatus {
    fn pending() -> Self {
        Self {
            loading: true,
            ..Self::default()
        }
    }

    fn succeeded(&mut self, at: DateTime<Utc>) {
        self.loading = false;
        self.last_error = None;
        self.last_success = Some(at);
    }

    fn failed(&mut self, error: &LiveError) {
        self.loading = false;
        self.last_error = Some(error.to_string());
    }
}

/// Mutable state behind one dashboard view
#[derive(Debug, Clone)]
pub struct LiveStore {
    subject: SubjectId,
    snapshot: Option<Snapshot>,
    top_products: Option<RankedList>,
    totals_status: FetchStatus,
    top_products_status: FetchStatus,
    reducer: EventReducer,
    names: NameTable,
    connection: ConnectionState,
    mode: DashboardMode,
}

impl LiveStore {
    pub fn new(subject: SubjectId, feeds: &FeedConfig) -> Self {
        Self {
            subject,
            snapshot: None,
            top_products: None,
            totals_status: FetchStatus::pending(),
            top_products_status: FetchStatus::pending(),
            reducer: EventReducer::from_config(feeds),
            names: NameTable::default(),
            connection: ConnectionState::default(),
            mode: DashboardMode::PullOnly,
        }
    }

    /// Seed from previously cached results. Fetch flags stay pending.
    pub fn seed(&mut self, snapshot: Option<Snapshot>, top_products: Option<RankedList>) {
        if let Some(snapshot) = snapshot {
            self.snapshot = Some(snapshot);
            self.reducer.reset_counters();
        }
        if let Some(list) = top_products {
            self.top_products = Some(list);
        }
    }

    /// Swap in a new snapshot and zero the counters.
    ///
    /// Returns false when the store is unsubscribed or the snapshot is older
    /// than the one already displayed.
    pub fn accept_snapshot(&mut self, snapshot: Snapshot) -> bool {
        if self.is_torn_down() {
            return false;
        }
        if let Some(current) = &self.snapshot {
            if snapshot.fetched_at < current.fetched_at {
                debug!(
                    "Discarding out-of-order snapshot for event {} ({} < {})",
                    self.subject, snapshot.fetched_at, current.fetched_at
                );
                return false;
            }
        }

        let fetched_at = snapshot.fetched_at;
        self.snapshot = Some(snapshot);
        self.reducer.reset_counters();
        self.totals_status.succeeded(fetched_at);
        true
    }

    /// Replace the ranking. Counters are untouched.
    pub fn accept_top_products(&mut self, list: RankedList) -> bool {
        if self.is_torn_down() {
            return false;
        }
        if let Some(current) = &self.top_products {
            if list.fetched_at < current.fetched_at {
                return false;
            }
        }

        let fetched_at = list.fetched_at;
        self.top_products = Some(list);
        self.top_products_status.succeeded(fetched_at);
        true
    }

    /// Record a failed totals fetch. Displayed data is kept.
    pub fn totals_failed(&mut self, error: &LiveError) -> bool {
        if self.is_torn_down() {
            return false;
        }
        self.totals_status.failed(error);
        true
    }

    /// Record a failed ranking fetch. Displayed data is kept.
    pub fn top_products_failed(&mut self, error: &LiveError) -> bool {
        if self.is_torn_down() {
            return false;
        }
        self.top_products_status.failed(error);
        true
    }

    pub fn apply_event(&mut self, event: LiveEvent) -> Reduction {
        self.reducer.apply(event)
    }

    pub fn update_names(&mut self, names: HashMap<BarId, String>) {
        self.names.replace(names);
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connection.connected = connected;
    }

    pub fn set_mode(&mut self, mode: DashboardMode) {
        self.mode = mode;
    }

    /// Start accepting events
    pub fn subscribe(&mut self) -> bool {
        self.reducer.subscribe()
    }

    /// Stop accepting events and fetch results
    pub fn unsubscribe(&mut self) {
        self.reducer.unsubscribe();
        self.connection.connected = false;
    }

    fn is_torn_down(&self) -> bool {
        self.reducer.phase() == SubscriptionPhase::Unsubscribed
    }

    pub fn subject(&self) -> SubjectId {
        self.subject
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    pub fn top_products(&self) -> Option<&RankedList> {
        self.top_products.as_ref()
    }

    pub fn totals_status(&self) -> &FetchStatus {
        &self.totals_status
    }

    pub fn top_products_status(&self) -> &FetchStatus {
        &self.top_products_status
    }

    pub fn reducer(&self) -> &EventReducer {
        &self.reducer
    }

    pub fn names(&self) -> &NameTable {
        &self.names
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn mode(&self) -> DashboardMode {
        self.mode
    }
}
