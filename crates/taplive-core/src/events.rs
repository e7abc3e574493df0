//! Push-channel wire types
//!
//! Every inbound frame is scoped to one subject and carries exactly one typed
//! event. Anything that does not parse into one of the known shapes is a
//! [`LiveError::MalformedEvent`] and is dropped by the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    AlertEntry, AlertSeverity, BarId, DeviceId, DeviceStatus, SaleEntry, SaleSource, SubjectId,
};
use crate::{LiveError, Result};

/// Legacy bar-side sale registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleCreated {
    pub sale_id: u64,
    pub bar_id: BarId,
    #[serde(default)]
    pub bar_name: Option<String>,
    #[serde(default)]
    pub product_name: Option<String>,
    pub amount_cents: u64,
    pub units: u64,
    /// Poured volume, when the bar reports it
    #[serde(default)]
    pub volume_ml: Option<u64>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl SaleCreated {
    pub fn to_entry(&self) -> SaleEntry {
        SaleEntry {
            id: self.sale_id,
            timestamp: self.timestamp,
            bar_id: self.bar_id,
            bar_name: self.bar_name.clone(),
            amount_cents: self.amount_cents,
            units: self.units,
            source: SaleSource::Legacy,
            pos_id: None,
            product_name: self.product_name.clone(),
        }
    }
}

/// Sale completed at a POS terminal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PosSaleCompleted {
    pub sale_id: u64,
    pub pos_id: DeviceId,
    pub bar_id: BarId,
    #[serde(default)]
    pub bar_name: Option<String>,
    pub amount_cents: u64,
    pub units: u64,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl PosSaleCompleted {
    pub fn to_entry(&self) -> SaleEntry {
        SaleEntry {
            id: self.sale_id,
            timestamp: self.timestamp,
            bar_id: self.bar_id,
            bar_name: self.bar_name.clone(),
            amount_cents: self.amount_cents,
            units: self.units,
            source: SaleSource::Pos,
            pos_id: Some(self.pos_id),
            product_name: None,
        }
    }
}

/// POS terminal changed state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStateUpdate {
    pub pos_id: DeviceId,
    pub status: DeviceStatus,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// Periodic server-side sample of a POS terminal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMetricsUpdate {
    pub pos_id: DeviceId,
    pub status: DeviceStatus,
    pub traffic_score: f64,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// Low-stock (or other) alert raised for a bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertCreated {
    pub alert_id: u64,
    pub bar_id: BarId,
    #[serde(default)]
    pub bar_name: Option<String>,
    #[serde(default)]
    pub drink_name: Option<String>,
    pub message: String,
    #[serde(default)]
    pub severity: AlertSeverity,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl AlertCreated {
    pub fn to_entry(&self) -> AlertEntry {
        AlertEntry {
            id: self.alert_id,
            timestamp: self.timestamp,
            bar_id: self.bar_id,
            bar_name: self.bar_name.clone(),
            drink_name: self.drink_name.clone(),
            message: self.message.clone(),
            severity: self.severity,
        }
    }
}

/// Typed push event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LiveEvent {
    #[serde(rename = "sale:created")]
    SaleCreated(SaleCreated),
    #[serde(rename = "pos:sale:completed")]
    PosSaleCompleted(PosSaleCompleted),
    #[serde(rename = "pos:state:update")]
    DeviceState(DeviceStateUpdate),
    #[serde(rename = "pos:metrics:update")]
    DeviceMetrics(DeviceMetricsUpdate),
    #[serde(rename = "alert:created")]
    AlertCreated(AlertCreated),
}

impl LiveEvent {
    /// Wire name of the event kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SaleCreated(_) => "sale:created",
            Self::PosSaleCompleted(_) => "pos:sale:completed",
            Self::DeviceState(_) => "pos:state:update",
            Self::DeviceMetrics(_) => "pos:metrics:update",
            Self::AlertCreated(_) => "alert:created",
        }
    }
}

/// Server to client frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundFrame {
    pub event_id: SubjectId,
    pub event: LiveEvent,
}

/// Client to server control message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ClientMessage {
    Subscribe {
        #[serde(rename = "eventId")]
        event_id: SubjectId,
    },
    Unsubscribe {
        #[serde(rename = "eventId")]
        event_id: SubjectId,
    },
}

impl ClientMessage {
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Parse one text frame from the push channel
pub fn parse_frame(text: &str) -> Result<InboundFrame> {
    serde_json::from_str(text).map_err(|e| LiveError::MalformedEvent(e.to_string()))
}
