//! Core type definitions for live dashboards

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Identifier of a dashboard subject (a live event)
pub type SubjectId = u64;

/// Identifier of a bar inside an event
pub type BarId = u64;

/// Identifier of a POS terminal
pub type DeviceId = u64;

/// Sales aggregate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SalesTotals {
    pub amount_cents: u64,
    pub units: u64,
    pub order_count: u64,
}

/// Consumed volume for a single drink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrinkConsumption {
    pub drink_id: u64,
    pub name: String,
    pub total_ml: u64,
}

/// Consumption aggregate
///
/// The per-drink breakdown only ever comes from snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumptionTotals {
    pub total_ml: u64,
    #[serde(default)]
    pub by_drink: Vec<DrinkConsumption>,
}

/// Aggregate totals for one event, as served by the totals endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub sales: SalesTotals,
    pub consumption: ConsumptionTotals,
}

impl Totals {
    /// Field-wise addition of client-side deltas
    pub fn with_increments(&self, counters: &IncrementalCounters) -> Totals {
        Totals {
            sales: SalesTotals {
                amount_cents: self.sales.amount_cents.saturating_add(counters.amount_cents),
                units: self.sales.units.saturating_add(counters.units),
                order_count: self.sales.order_count.saturating_add(counters.order_count),
            },
            consumption: ConsumptionTotals {
                total_ml: self.consumption.total_ml.saturating_add(counters.consumption_ml),
                by_drink: self.consumption.by_drink.clone(),
            },
        }
    }
}

/// Authoritative read of aggregate truth. Replaced wholesale, never edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub totals: Totals,
    pub fetched_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(totals: Totals) -> Self {
        Self {
            totals,
            fetched_at: Utc::now(),
        }
    }
}

/// One row of the top-products ranking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedProduct {
    pub product_id: u64,
    pub name: String,
    pub units: u64,
    pub amount_cents: u64,
}

/// Top-N ranking. Snapshot-only: live events never reorder it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedList {
    pub items: Vec<RankedProduct>,
    pub fetched_at: DateTime<Utc>,
}

impl RankedList {
    pub fn new(items: Vec<RankedProduct>) -> Self {
        Self {
            items,
            fetched_at: Utc::now(),
        }
    }
}

/// Client-accumulated deltas layered on the last snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementalCounters {
    pub amount_cents: u64,
    pub units: u64,
    pub order_count: u64,
    pub consumption_ml: u64,
}

impl IncrementalCounters {
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    /// Count one sale
    pub fn record_sale(&mut self, amount_cents: u64, units: u64, volume_ml: Option<u64>) {
        self.amount_cents = self.amount_cents.saturating_add(amount_cents);
        self.units = self.units.saturating_add(units);
        self.order_count = self.order_count.saturating_add(1);
        if let Some(ml) = volume_ml {
            self.consumption_ml = self.consumption_ml.saturating_add(ml);
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Where a sale was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaleSource {
    /// Bar-side sale registration
    Legacy,
    /// Completed at a POS terminal
    Pos,
}

/// Sales feed entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleEntry {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub bar_id: BarId,
    pub bar_name: Option<String>,
    pub amount_cents: u64,
    pub units: u64,
    pub source: SaleSource,
    pub pos_id: Option<DeviceId>,
    pub product_name: Option<String>,
}

/// Alert severity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    #[default]
    Warning,
    Critical,
}

/// Alerts feed entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEntry {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub bar_id: BarId,
    pub bar_name: Option<String>,
    pub drink_name: Option<String>,
    pub message: String,
    pub severity: AlertSeverity,
}

/// POS terminal status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceStatus {
    Open,
    Congested,
    Closed,
    #[serde(other)]
    Unknown,
}

/// Live reading for one POS terminal
///
/// Both fields are optional: status and traffic arrive through different
/// events and each one only overwrites what it carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetric {
    pub status: Option<DeviceStatus>,
    pub traffic_score: Option<f64>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl DeviceMetric {
    /// Merge a status-only reading
    pub fn merge_status(&mut self, status: DeviceStatus, at: DateTime<Utc>) {
        self.status = Some(status);
        self.updated_at = Some(at);
    }

    /// Merge a sampled reading carrying both status and traffic
    pub fn merge_sample(&mut self, status: DeviceStatus, traffic_score: f64, at: DateTime<Utc>) {
        self.status = Some(status);
        self.traffic_score = Some(traffic_score);
        self.updated_at = Some(at);
    }
}

/// Connection signal published to the presentation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub connected: bool,
}

/// Lookup table from bar id to display name, supplied by a sibling data source
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameTable {
    names: HashMap<BarId, String>,
}

impl NameTable {
    pub fn new(names: HashMap<BarId, String>) -> Self {
        Self { names }
    }

    /// Replace the whole table
    pub fn replace(&mut self, names: HashMap<BarId, String>) {
        self.names = names;
    }

    pub fn get(&self, id: BarId) -> Option<&str> {
        self.names.get(&id).map(String::as_str)
    }
}
