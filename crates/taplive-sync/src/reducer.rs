//! Event reducer: folds typed push events into counters, feeds and device metrics
//!
//! Pure state with no I/O. Events are applied one at a time in arrival order;
//! the caller decides what to do with the returned [`Reduction`].

use std::collections::HashMap;

use taplive_core::{
    AlertEntry, DeviceId, DeviceMetric, FeedConfig, IncrementalCounters, LiveEvent, SaleEntry,
};
use tracing::debug;

use crate::feed::Feed;

/// Lifecycle of a reducer bound to one subject subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionPhase {
    /// Created, not yet listening
    Idle,
    /// Receiving events
    Subscribed,
    /// Torn down; further events are ignored
    Unsubscribed,
}

/// Outcome of applying one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    /// Not applied (reducer not subscribed)
    Ignored,
    /// Applied to local state
    Applied,
    /// Applied, and snapshots should be refreshed early
    Revalidate,
}

/// Incremental live state for one mounted dashboard
#[derive(Debug, Clone)]
pub struct EventReducer {
    phase: SubscriptionPhase,
    counters: IncrementalCounters,
    sales: Feed<SaleEntry>,
    alerts: Feed<AlertEntry>,
    devices: HashMap<DeviceId, DeviceMetric>,
}

impl EventReducer {
    pub fn new(sales_capacity: usize, alerts_capacity: usize) -> Self {
        Self {
            phase: SubscriptionPhase::Idle,
            counters: IncrementalCounters::default(),
            sales: Feed::with_capacity(sales_capacity),
            alerts: Feed::with_capacity(alerts_capacity),
            devices: HashMap::new(),
        }
    }

    pub fn from_config(config: &FeedConfig) -> Self {
        Self::new(config.sales_capacity, config.alerts_capacity)
    }

    pub fn phase(&self) -> SubscriptionPhase {
        self.phase
    }

    /// Idle -> Subscribed. Returns false from any other phase.
    pub fn subscribe(&mut self) -> bool {
        if self.phase == SubscriptionPhase::Idle {
            self.phase = SubscriptionPhase::Subscribed;
            true
        } else {
            false
        }
    }

    /// Any phase -> Unsubscribed
    pub fn unsubscribe(&mut self) {
        self.phase = SubscriptionPhase::Unsubscribed;
    }

    /// Fold one event into local state
    pub fn apply(&mut self, event: LiveEvent) -> Reduction {
        if self.phase != SubscriptionPhase::Subscribed {
            debug!("Ignoring {} in phase {:?}", event.kind(), self.phase);
            return Reduction::Ignored;
        }

        match event {
            LiveEvent::SaleCreated(sale) => {
                self.counters
                    .record_sale(sale.amount_cents, sale.units, sale.volume_ml);
                self.sales.push(sale.to_entry());
                Reduction::Applied
            }
            LiveEvent::PosSaleCompleted(sale) => {
                // No volume: per-drink consumption only exists in snapshots
                self.counters.record_sale(sale.amount_cents, sale.units, None);
                self.sales.push(sale.to_entry());
                Reduction::Revalidate
            }
            LiveEvent::DeviceState(update) => {
                self.devices
                    .entry(update.pos_id)
                    .or_default()
                    .merge_status(update.status, update.timestamp);
                Reduction::Applied
            }
            LiveEvent::DeviceMetrics(update) => {
                self.devices.entry(update.pos_id).or_default().merge_sample(
                    update.status,
                    update.traffic_score,
                    update.timestamp,
                );
                Reduction::Applied
            }
            LiveEvent::AlertCreated(alert) => {
                self.alerts.push(alert.to_entry());
                Reduction::Applied
            }
        }
    }

    /// Zero the counters. Must happen together with a snapshot swap.
    pub fn reset_counters(&mut self) {
        self.counters.reset();
    }

    pub fn counters(&self) -> &IncrementalCounters {
        &self.counters
    }

    pub fn sales(&self) -> &Feed<SaleEntry> {
        &self.sales
    }

    pub fn alerts(&self) -> &Feed<AlertEntry> {
        &self.alerts
    }

    pub fn devices(&self) -> &HashMap<DeviceId, DeviceMetric> {
        &self.devices
    }
}

impl Default for EventReducer {
    fn default() -> Self {
        Self::from_config(&FeedConfig::default())
    }
}
