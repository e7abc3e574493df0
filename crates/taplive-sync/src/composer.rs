//! View state composer
//!
//! Pure derivation from a [`LiveStore`] to the read-only structure handed to
//! presentation. Owns no state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use taplive_core::{
    AlertEntry, AlertSeverity, BarId, DeviceId, DeviceMetric, IncrementalCounters, NameTable,
    RankedProduct, SaleEntry, SaleSource, SubjectId, Totals,
};

use crate::store::{DashboardMode, LiveStore};

/// Sales feed row with a resolved bar label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleRow {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub bar_id: BarId,
    pub bar_label: String,
    pub amount_cents: u64,
    pub units: u64,
    pub source: SaleSource,
    pub pos_id: Option<DeviceId>,
    pub product_name: Option<String>,
}

/// Alerts feed row with a resolved bar label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRow {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub bar_id: BarId,
    pub bar_label: String,
    pub drink_name: Option<String>,
    pub message: String,
    pub severity: AlertSeverity,
}

/// Everything the presentation layer renders for one dashboard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardView {
    pub subject: SubjectId,
    /// Snapshot totals plus incremental counters
    pub totals: Totals,
    /// Snapshot ranking, never adjusted by live events
    pub top_products: Vec<RankedProduct>,
    pub recent_sales: Vec<SaleRow>,
    pub pos_metrics: BTreeMap<DeviceId, DeviceMetric>,
    pub alerts: Vec<AlertRow>,
    pub connected: bool,
    /// No data yet and the first fetch is outstanding
    pub is_loading: bool,
    /// The last fetch failed; older data is still shown
    pub stale: bool,
    pub mode: DashboardMode,
    pub snapshot_at: Option<DateTime<Utc>>,
    /// Deltas currently layered on the snapshot
    pub pending: IncrementalCounters,
}

impl DashboardView {
    /// View of a dashboard that has received nothing yet
    pub fn empty(subject: SubjectId) -> Self {
        Self {
            subject,
            totals: Totals::default(),
            top_products: Vec::new(),
            recent_sales: Vec::new(),
            pos_metrics: BTreeMap::new(),
            alerts: Vec::new(),
            connected: false,
            is_loading: true,
            stale: false,
            mode: DashboardMode::PullOnly,
            snapshot_at: None,
            pending: IncrementalCounters::default(),
        }
    }
}

/// Look up a bar's display name in the table
pub fn resolve_name(names: &NameTable, bar_id: BarId) -> Option<&str> {
    names.get(bar_id)
}

/// Label for a feed row: the name the event carried, then the table, then the id
pub fn bar_label(names: &NameTable, bar_id: BarId, carried: Option<&str>) -> String {
    carried
        .filter(|name| !name.trim().is_empty())
        .or_else(|| resolve_name(names, bar_id))
        .map(str::to_string)
        .unwrap_or_else(|| format!("Bar #{}", bar_id))
}

fn sale_row(names: &NameTable, entry: &SaleEntry) -> SaleRow {
    SaleRow {
        id: entry.id,
        timestamp: entry.timestamp,
        bar_id: entry.bar_id,
        bar_label: bar_label(names, entry.bar_id, entry.bar_name.as_deref()),
        amount_cents: entry.amount_cents,
        units: entry.units,
        source: entry.source,
        pos_id: entry.pos_id,
        product_name: entry.product_name.clone(),
    }
}

fn alert_row(names: &NameTable, entry: &AlertEntry) -> AlertRow {
    AlertRow {
        id: entry.id,
        timestamp: entry.timestamp,
        bar_id: entry.bar_id,
        bar_label: bar_label(names, entry.bar_id, entry.bar_name.as_deref()),
        drink_name: entry.drink_name.clone(),
        message: entry.message.clone(),
        severity: entry.severity,
    }
}

/// Derive the presentation view from the store
pub fn compose(store: &LiveStore) -> DashboardView {
    let reducer = store.reducer();
    let names = store.names();
    let counters = *reducer.counters();

    let base = store
        .snapshot()
        .map(|snapshot| snapshot.totals.clone())
        .unwrap_or_default();

    let top_products = store
        .top_products()
        .map(|list| list.items.clone())
        .unwrap_or_default();

    let totals_status = store.totals_status();
    let top_status = store.top_products_status();
    let is_loading = (store.snapshot().is_none() && totals_status.loading)
        || (store.top_products().is_none() && top_status.loading);
    let stale = totals_status.last_error.is_some() || top_status.last_error.is_some();

    DashboardView {
        subject: store.subject(),
        totals: base.with_increments(&counters),
        top_products,
        recent_sales: reducer.sales().iter().map(|e| sale_row(names, e)).collect(),
        pos_metrics: reducer
            .devices()
            .iter()
            .map(|(id, metric)| (*id, *metric))
            .collect(),
        alerts: reducer.alerts().iter().map(|e| alert_row(names, e)).collect(),
        connected: store.connection().connected,
        is_loading,
        stale,
        mode: store.mode(),
        snapshot_at: store.snapshot().map(|s| s.fetched_at),
        pending: counters,
    }
}
