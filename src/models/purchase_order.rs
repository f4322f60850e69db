//! Purchase order snapshot, its lines and its receive ledger, as the
//! inventory API serves them.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use crate::errors::ServiceError;

/// Purchase order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseOrderStatus {
    Open,
    PartiallyReceived,
    Received,
    Cancelled,
    Closed,
}

impl PurchaseOrderStatus {
    /// Cancelled and closed orders accept neither receipts nor reversals.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Closed)
    }
}

impl fmt::Display for PurchaseOrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::PartiallyReceived => write!(f, "partially_received"),
            Self::Received => write!(f, "received"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

impl FromStr for PurchaseOrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "open" => Ok(Self::Open),
            "partially_received" => Ok(Self::PartiallyReceived),
            "received" => Ok(Self::Received),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            "closed" => Ok(Self::Closed),
            _ => Err(format!("Unknown purchase order status: {}", s)),
        }
    }
}

/// Opaque optimistic-concurrency token.
///
/// The remote emits fixed-width RFC 3339 timestamps, so lexicographic order
/// matches write order when two stamps need comparing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionStamp(pub String);

impl VersionStamp {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLine {
    pub id: i64,
    pub product_id: i64,
    pub quantity: Decimal,
    /// Per-line destination sublocation.
    #[serde(default)]
    pub location_id: Option<i64>,
}

/// One recorded receipt, including fields the server computes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiveEntry {
    pub id: i64,
    pub product_id: i64,
    pub quantity: Decimal,
    #[serde(default)]
    pub serial_numbers: Vec<String>,
    pub received_date: DateTime<Utc>,
    #[serde(default)]
    pub location_id: Option<i64>,
    pub version: VersionStamp,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ReceiveEntry {
    /// The writable subset, for resubmission in a full-ledger write.
    pub fn to_input(&self) -> ReceiveEntryInput {
        ReceiveEntryInput {
            id: Some(self.id),
            product_id: self.product_id,
            quantity: self.quantity,
            serial_numbers: self.serial_numbers.clone(),
            received_date: self.received_date,
            location_id: self.location_id,
        }
    }

    /// Writable fields with the quantity reduced to `quantity`.
    ///
    /// A serialized entry keeps its first `quantity` serial numbers.
    pub fn reduced_to(&self, quantity: Decimal) -> ReceiveEntryInput {
        let mut input = self.to_input();
        input.quantity = quantity;
        if Decimal::from(input.serial_numbers.len()) == self.quantity {
            let keep = quantity.trunc().to_usize().unwrap_or(0);
            input.serial_numbers.truncate(keep);
        }
        input
    }
}

/// Writable fields of a ledger entry. `id` is absent for new entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiveEntryInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub product_id: i64,
    pub quantity: Decimal,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub serial_numbers: Vec<String>,
    pub received_date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_id: Option<i64>,
}

/// Body of the full-replacement ledger write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptsWrite {
    pub version: VersionStamp,
    pub receipts: Vec<ReceiveEntryInput>,
}

/// What the remote reports back after accepting a ledger write.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReceiptsWriteAck {
    #[serde(default)]
    pub status: Option<PurchaseOrderStatus>,
    #[serde(default)]
    pub version: Option<VersionStamp>,
}

impl ReceiptsWriteAck {
    /// Reads whatever the remote reported after a committed write.
    ///
    /// Returns `None` when the body is not an object. Unknown status values
    /// are dropped rather than failing the whole ack.
    pub fn from_body(body: &str) -> Option<Self> {
        let value: serde_json::Value = serde_json::from_str(body).ok()?;
        let object = value.as_object()?;

        Some(Self {
            status: object
                .get("status")
                .and_then(|status| status.as_str())
                .and_then(|status| status.parse().ok()),
            version: object
                .get("version")
                .and_then(|version| version.as_str())
                .map(VersionStamp::new),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseOrder {
    pub id: i64,
    #[serde(default)]
    pub order_no: Option<String>,
    pub status: PurchaseOrderStatus,
    #[serde(default)]
    pub lines: Vec<OrderLine>,
    #[serde(default)]
    pub receipts: Vec<ReceiveEntry>,
    pub version: VersionStamp,
    /// Destination location for the whole order.
    #[serde(default)]
    pub location_id: Option<i64>,
}

impl PurchaseOrder {
    pub fn line(&self, line_id: i64) -> Option<&OrderLine> {
        self.lines.iter().find(|line| line.id == line_id)
    }

    pub fn entry(&self, entry_id: i64) -> Option<&ReceiveEntry> {
        self.receipts.iter().find(|entry| entry.id == entry_id)
    }

    /// Ordered quantity per product, summed across lines.
    pub fn ordered_by_product(&self) -> BTreeMap<i64, Decimal> {
        let mut totals = BTreeMap::new();
        for line in &self.lines {
            *totals.entry(line.product_id).or_insert(Decimal::ZERO) += line.quantity;
        }
        totals
    }

    /// Received quantity per product, summed across the ledger.
    pub fn received_by_product(&self) -> BTreeMap<i64, Decimal> {
        let mut totals = BTreeMap::new();
        for entry in &self.receipts {
            *totals.entry(entry.product_id).or_insert(Decimal::ZERO) += entry.quantity;
        }
        totals
    }

    /// Rejects orders in a terminal status.
    pub fn ensure_open(&self) -> Result<(), ServiceError> {
        if self.status.is_terminal() {
            return Err(ServiceError::StateConflict(format!(
                "purchase order {} is {}",
                self.id, self.status
            )));
        }
        Ok(())
    }

    /// Checks that ledger entry identities are unique within the order.
    pub fn validate_ledger(&self) -> Result<(), ServiceError> {
        let mut seen = HashSet::new();
        for entry in &self.receipts {
            if !seen.insert(entry.id) {
                return Err(ServiceError::ValidationError(format!(
                    "purchase order {} has duplicate receipt id {}",
                    self.id, entry.id
                )));
            }
        }
        Ok(())
    }
}
