use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::{
    errors::ServiceError,
    models::{
        OrderLine, PurchaseOrder, PurchaseOrderStatus, ReceiptsWrite, ReceiveEntryInput,
    },
    services::purchase_orders::PurchaseOrderStore,
};

/// What an explicit receive item points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiveTarget {
    Line(i64),
    Product(i64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiveItem {
    pub target: ReceiveTarget,
    pub quantity: Decimal,
    #[serde(default)]
    pub serial_numbers: Vec<String>,
    /// Overrides the line or order destination.
    #[serde(default)]
    pub location_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReceiveRequest {
    pub purchase_order_id: i64,
    #[serde(default)]
    pub receive_all: bool,
    #[serde(default)]
    pub items: Vec<ReceiveItem>,
    /// Receive date for new entries; defaults to now.
    #[serde(default)]
    pub received_date: Option<DateTime<Utc>>,
    /// Skip the over-receive guard.
    #[serde(default)]
    pub allow_over_receive: bool,
}

impl ReceiveRequest {
    pub fn all(purchase_order_id: i64) -> Self {
        Self {
            purchase_order_id,
            receive_all: true,
            ..Default::default()
        }
    }

    pub fn items(purchase_order_id: i64, items: Vec<ReceiveItem>) -> Self {
        Self {
            purchase_order_id,
            items,
            ..Default::default()
        }
    }

    /// Exactly one of `receive_all` and `items` must be given.
    pub fn validate(&self) -> Result<(), ServiceError> {
        match (self.receive_all, self.items.is_empty()) {
            (true, false) => Err(ServiceError::ValidationError(
                "receive_all cannot be combined with explicit items".to_string(),
            )),
            (false, true) => Err(ServiceError::ValidationError(
                "either receive_all or at least one item is required".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// An explicit item that could not be received.
#[derive(Debug, Clone, Serialize)]
pub struct ItemFailure {
    /// Zero-based position in the request's item list.
    pub index: usize,
    pub error: ServiceError,
}

impl ItemFailure {
    pub fn message(&self) -> String {
        format!("item {}: {}", self.index + 1, self.error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReceivedLineSummary {
    pub product_id: i64,
    pub ordered: Decimal,
    pub previously_received: Decimal,
    pub received_now: Decimal,
    pub total_received: Decimal,
    pub fully_received: bool,
}

/// New ledger entries computed from one snapshot, before anything is written.
#[derive(Debug, Clone)]
pub struct ReceivePlan {
    pub entries: Vec<ReceiveEntryInput>,
    pub lines: Vec<ReceivedLineSummary>,
    pub failures: Vec<ItemFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReceiveSummary {
    pub purchase_order_id: i64,
    /// Status reported by the remote after the write.
    pub status: Option<PurchaseOrderStatus>,
    pub lines: Vec<ReceivedLineSummary>,
    pub warnings: Vec<String>,
    pub entries_written: usize,
}

impl ReceiveSummary {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Purchase order {}: {} new receipt(s)",
            self.purchase_order_id, self.entries_written
        );
        for line in &self.lines {
            let _ = writeln!(
                out,
                "  product {}: ordered {}, previously received {}, received now {}, total {}{}",
                line.product_id,
                line.ordered,
                line.previously_received,
                line.received_now,
                line.total_received,
                if line.fully_received { " (fully received)" } else { "" }
            );
        }
        if let Some(status) = self.status {
            let _ = writeln!(out, "Status: {}", status);
        }
        if !self.warnings.is_empty() {
            let _ = writeln!(out, "Warnings:");
            for warning in &self.warnings {
                let _ = writeln!(out, "  {}", warning);
            }
        }
        out
    }
}

/// Running per-product totals while walking an explicit item batch.
struct ItemBatch {
    received: BTreeMap<i64, Decimal>,
    entries: Vec<ReceiveEntryInput>,
    failures: Vec<ItemFailure>,
}

/// Computes the entries a receive request appends to `order`'s ledger.
///
/// Pure: depends only on the snapshot, the request and `now`.
pub fn plan_receive(
    order: &PurchaseOrder,
    request: &ReceiveRequest,
    now: DateTime<Utc>,
) -> Result<ReceivePlan, ServiceError> {
    request.validate()?;
    order.ensure_open()?;

    let received_date = request.received_date.unwrap_or(now);
    let (entries, failures) = if request.receive_all {
        (plan_remaining(order, received_date), Vec::new())
    } else {
        let batch = plan_items(order, request, received_date);
        (batch.entries, batch.failures)
    };

    if entries.is_empty() {
        if failures.is_empty() {
            return Err(ServiceError::ValidationError(format!(
                "nothing left to receive on purchase order {}",
                order.id
            )));
        }
        return Err(ServiceError::from_failures(
            failures.into_iter().map(|failure| failure.error).collect(),
        ));
    }

    let lines = summarize(order, &entries);
    Ok(ReceivePlan {
        entries,
        lines,
        failures,
    })
}

/// One entry per line for whatever the ledger has not yet covered.
///
/// Received quantity of a product is allocated to its lines in line order.
fn plan_remaining(order: &PurchaseOrder, received_date: DateTime<Utc>) -> Vec<ReceiveEntryInput> {
    let mut unallocated = order.received_by_product();
    let mut entries = Vec::new();

    for line in &order.lines {
        let available = unallocated.entry(line.product_id).or_insert(Decimal::ZERO);
        let allocated = (*available).min(line.quantity).max(Decimal::ZERO);
        *available -= allocated;

        let remaining = line.quantity - allocated;
        if remaining <= Decimal::ZERO {
            continue;
        }

        entries.push(ReceiveEntryInput {
            id: None,
            product_id: line.product_id,
            quantity: remaining,
            serial_numbers: Vec::new(),
            received_date,
            location_id: line.location_id.or(order.location_id),
        });
    }

    entries
}

fn plan_items(order: &PurchaseOrder, request: &ReceiveRequest, received_date: DateTime<Utc>) -> ItemBatch {
    let ordered = order.ordered_by_product();
    let start = ItemBatch {
        received: order.received_by_product(),
        entries: Vec::new(),
        failures: Vec::new(),
    };

    request
        .items
        .iter()
        .enumerate()
        .fold(start, |mut batch, (index, item)| {
            match build_entry(order, &ordered, &batch.received, item, request.allow_over_receive, received_date) {
                Ok(entry) => {
                    *batch.received.entry(entry.product_id).or_insert(Decimal::ZERO) += entry.quantity;
                    batch.entries.push(entry);
                }
                Err(error) => {
                    warn!(purchase_order_id = order.id, item = index + 1, error = %error, "Receive item rejected");
                    batch.failures.push(ItemFailure { index, error });
                }
            }
            batch
        })
}

fn resolve_target(order: &PurchaseOrder, target: ReceiveTarget) -> Result<&OrderLine, ServiceError> {
    match target {
        ReceiveTarget::Line(line_id) => order.line(line_id).ok_or_else(|| {
            ServiceError::NotFound(format!("line {} is not on purchase order {}", line_id, order.id))
        }),
        ReceiveTarget::Product(product_id) => order
            .lines
            .iter()
            .find(|line| line.product_id == product_id)
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "product {} is not on purchase order {}",
                    product_id, order.id
                ))
            }),
    }
}

fn build_entry(
    order: &PurchaseOrder,
    ordered: &BTreeMap<i64, Decimal>,
    received: &BTreeMap<i64, Decimal>,
    item: &ReceiveItem,
    allow_over_receive: bool,
    received_date: DateTime<Utc>,
) -> Result<ReceiveEntryInput, ServiceError> {
    let line = resolve_target(order, item.target)?;
    let product_id = line.product_id;

    if item.quantity <= Decimal::ZERO {
        return Err(ServiceError::ValidationError(format!(
            "quantity must be positive, got {}",
            item.quantity
        )));
    }

    let ordered_qty = ordered.get(&product_id).copied().unwrap_or(Decimal::ZERO);
    let already_received = received.get(&product_id).copied().unwrap_or(Decimal::ZERO);
    if !allow_over_receive && already_received + item.quantity > ordered_qty {
        return Err(ServiceError::OverReceive {
            product_id,
            ordered: ordered_qty,
            already_received,
            requested: item.quantity,
        });
    }

    if !item.serial_numbers.is_empty() && Decimal::from(item.serial_numbers.len()) != item.quantity {
        return Err(ServiceError::QuantityMismatch {
            quantity: item.quantity,
            serials: item.serial_numbers.len(),
        });
    }

    Ok(ReceiveEntryInput {
        id: None,
        product_id,
        quantity: item.quantity,
        serial_numbers: item.serial_numbers.clone(),
        received_date,
        location_id: item.location_id.or(line.location_id).or(order.location_id),
    })
}

/// Per-product totals for every product the new entries touch.
fn summarize(order: &PurchaseOrder, entries: &[ReceiveEntryInput]) -> Vec<ReceivedLineSummary> {
    let ordered = order.ordered_by_product();
    let previously = order.received_by_product();

    let mut products: Vec<i64> = Vec::new();
    let mut received_now: BTreeMap<i64, Decimal> = BTreeMap::new();
    for entry in entries {
        if !received_now.contains_key(&entry.product_id) {
            products.push(entry.product_id);
        }
        *received_now.entry(entry.product_id).or_insert(Decimal::ZERO) += entry.quantity;
    }

    products
        .into_iter()
        .map(|product_id| {
            let ordered = ordered.get(&product_id).copied().unwrap_or(Decimal::ZERO);
            let previously_received = previously.get(&product_id).copied().unwrap_or(Decimal::ZERO);
            let now = received_now.get(&product_id).copied().unwrap_or(Decimal::ZERO);
            let total_received = previously_received + now;
            ReceivedLineSummary {
                product_id,
                ordered,
                previously_received,
                received_now: now,
                total_received,
                fully_received: total_received >= ordered,
            }
        })
        .collect()
}

/// Records receipts against a purchase order.
#[derive(Clone)]
pub struct ReceiveService {
    store: Arc<dyn PurchaseOrderStore>,
}

impl ReceiveService {
    pub fn new(store: Arc<dyn PurchaseOrderStore>) -> Self {
        Self { store }
    }

    /// Fetches the order, appends the new entries and writes the full ledger back.
    #[instrument(skip(self))]
    pub async fn receive(&self, request: ReceiveRequest) -> Result<ReceiveSummary, ServiceError> {
        request.validate()?;

        let order = self.store.fetch(request.purchase_order_id).await?;
        let plan = plan_receive(&order, &request, Utc::now())?;

        let receipts: Vec<ReceiveEntryInput> = order
            .receipts
            .iter()
            .map(|entry| entry.to_input())
            .chain(plan.entries.iter().cloned())
            .collect();

        let ack = self
            .store
            .replace_receipts(
                order.id,
                ReceiptsWrite {
                    version: order.version.clone(),
                    receipts,
                },
            )
            .await?;

        info!(
            purchase_order_id = order.id,
            new_entries = plan.entries.len(),
            rejected_items = plan.failures.len(),
            "Purchase order received"
        );

        Ok(ReceiveSummary {
            purchase_order_id: order.id,
            status: ack.status,
            lines: plan.lines,
            warnings: plan.failures.iter().map(ItemFailure::message).collect(),
            entries_written: plan.entries.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ReceiptsWriteAck, ReceiveEntry, VersionStamp};
    use crate::services::purchase_orders::MockPurchaseOrderStore;
    use assert_matches::assert_matches;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn line(id: i64, product_id: i64, quantity: Decimal) -> OrderLine {
        OrderLine {
            id,
            product_id,
            quantity,
            location_id: None,
        }
    }

    fn receipt(id: i64, product_id: i64, quantity: Decimal) -> ReceiveEntry {
        ReceiveEntry {
            id,
            product_id,
            quantity,
            serial_numbers: vec![],
            received_date: Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
            location_id: Some(1),
            version: VersionStamp::new("2024-05-01T08:00:00.000Z"),
            created_at: None,
            updated_at: None,
        }
    }

    fn order(lines: Vec<OrderLine>, receipts: Vec<ReceiveEntry>) -> PurchaseOrder {
        PurchaseOrder {
            id: 42,
            order_no: None,
            status: PurchaseOrderStatus::PartiallyReceived,
            lines,
            receipts,
            version: VersionStamp::new("v7"),
            location_id: Some(1),
        }
    }

    fn item(target: ReceiveTarget, quantity: Decimal) -> ReceiveItem {
        ReceiveItem {
            target,
            quantity,
            serial_numbers: vec![],
            location_id: None,
        }
    }

    #[test]
    fn receive_all_covers_the_remainder() {
        let po = order(vec![line(1, 100, dec!(10))], vec![receipt(5, 100, dec!(4))]);

        let plan = plan_receive(&po, &ReceiveRequest::all(42), now()).unwrap();

        assert_eq!(plan.entries.len(), 1);
        assert_eq!(plan.entries[0].quantity, dec!(6));
        assert_eq!(plan.entries[0].id, None);
        assert_eq!(plan.entries[0].received_date, now());
        assert_eq!(
            plan.lines,
            vec![ReceivedLineSummary {
                product_id: 100,
                ordered: dec!(10),
                previously_received: dec!(4),
                received_now: dec!(6),
                total_received: dec!(10),
                fully_received: true,
            }]
        );
    }

    #[test]
    fn receive_all_skips_complete_lines_and_allocates_across_duplicates() {
        let po = order(
            vec![
                line(1, 100, dec!(10)),
                line(2, 100, dec!(5)),
                line(3, 200, dec!(2)),
            ],
            vec![receipt(5, 100, dec!(12)), receipt(6, 200, dec!(2))],
        );

        let plan = plan_receive(&po, &ReceiveRequest::all(42), now()).unwrap();

        assert_eq!(plan.entries.len(), 1);
        assert_eq!(plan.entries[0].product_id, 100);
        assert_eq!(plan.entries[0].quantity, dec!(3));
    }

    #[test]
    fn receive_all_on_a_complete_order_fails() {
        let po = order(vec![line(1, 100, dec!(10))], vec![receipt(5, 100, dec!(10))]);
        let err = plan_receive(&po, &ReceiveRequest::all(42), now()).unwrap_err();
        assert_matches!(err, ServiceError::ValidationError(_));
    }

    #[test]
    fn receive_all_uses_supplied_date_and_line_location() {
        let mut first = line(1, 100, dec!(3));
        first.location_id = Some(9);
        let po = order(vec![first], vec![]);
        let date = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();

        let mut request = ReceiveRequest::all(42);
        request.received_date = Some(date);
        let plan = plan_receive(&po, &request, now()).unwrap();

        assert_eq!(plan.entries[0].received_date, date);
        assert_eq!(plan.entries[0].location_id, Some(9));
    }

    #[test]
    fn over_receive_is_rejected_without_override() {
        let po = order(vec![line(1, 100, dec!(10))], vec![receipt(5, 100, dec!(8))]);
        let request = ReceiveRequest::items(42, vec![item(ReceiveTarget::Line(1), dec!(5))]);

        let err = plan_receive(&po, &request, now()).unwrap_err();

        assert_matches!(
            err,
            ServiceError::OverReceive {
                product_id: 100,
                ..
            }
        );
    }

    #[test]
    fn override_allows_over_receive() {
        let po = order(vec![line(1, 100, dec!(10))], vec![receipt(5, 100, dec!(8))]);
        let mut request = ReceiveRequest::items(42, vec![item(ReceiveTarget::Product(100), dec!(5))]);
        request.allow_over_receive = true;

        let plan = plan_receive(&po, &request, now()).unwrap();

        assert_eq!(plan.entries[0].quantity, dec!(5));
        assert_eq!(plan.lines[0].total_received, dec!(13));
        assert!(plan.lines[0].fully_received);
    }

    #[test]
    fn running_total_applies_within_one_batch() {
        let po = order(vec![line(1, 100, dec!(10))], vec![receipt(5, 100, dec!(4))]);
        let request = ReceiveRequest::items(
            42,
            vec![
                item(ReceiveTarget::Line(1), dec!(5)),
                item(ReceiveTarget::Product(100), dec!(2)),
            ],
        );

        let plan = plan_receive(&po, &request, now()).unwrap();

        assert_eq!(plan.entries.len(), 1);
        assert_eq!(plan.failures.len(), 1);
        assert_eq!(plan.failures[0].index, 1);
        assert_matches!(
            plan.failures[0].error,
            ServiceError::OverReceive {
                already_received,
                ..
            } if already_received == dec!(9)
        );
    }

    #[test]
    fn partial_batches_keep_valid_items() {
        let po = order(
            vec![line(1, 100, dec!(10)), line(2, 200, dec!(3))],
            vec![],
        );
        let mut serialized = item(ReceiveTarget::Line(2), dec!(2));
        serialized.serial_numbers = vec!["SN-1".into()];
        let request = ReceiveRequest::items(
            42,
            vec![
                item(ReceiveTarget::Line(99), dec!(1)),
                serialized,
                item(ReceiveTarget::Line(1), dec!(4)),
            ],
        );

        let plan = plan_receive(&po, &request, now()).unwrap();

        assert_eq!(plan.entries.len(), 1);
        assert_eq!(plan.entries[0].product_id, 100);
        assert_eq!(plan.failures.len(), 2);
        assert_matches!(plan.failures[0].error, ServiceError::NotFound(_));
        assert_matches!(plan.failures[1].error, ServiceError::QuantityMismatch { serials: 1, .. });
        assert!(!plan.lines[0].fully_received);
    }

    #[test]
    fn matching_serials_are_recorded() {
        let po = order(vec![line(1, 100, dec!(2))], vec![]);
        let mut serialized = item(ReceiveTarget::Line(1), dec!(2));
        serialized.serial_numbers = vec!["SN-1".into(), "SN-2".into()];

        let plan = plan_receive(&po, &ReceiveRequest::items(42, vec![serialized]), now()).unwrap();

        assert_eq!(plan.entries[0].serial_numbers, vec!["SN-1", "SN-2"]);
    }

    #[test]
    fn every_item_failing_aggregates_messages() {
        let po = order(vec![line(1, 100, dec!(10))], vec![]);
        let request = ReceiveRequest::items(
            42,
            vec![
                item(ReceiveTarget::Product(555), dec!(1)),
                item(ReceiveTarget::Line(1), dec!(0)),
            ],
        );

        let err = plan_receive(&po, &request, now()).unwrap_err();
        assert_matches!(err, ServiceError::ValidationErrors(messages) if messages.len() == 2);
    }

    #[test]
    fn terminal_orders_are_rejected() {
        let mut po = order(vec![line(1, 100, dec!(10))], vec![]);
        po.status = PurchaseOrderStatus::Closed;
        let err = plan_receive(&po, &ReceiveRequest::all(42), now()).unwrap_err();
        assert_matches!(err, ServiceError::StateConflict(_));
    }

    #[test]
    fn request_needs_exactly_one_mode() {
        let mut both = ReceiveRequest::all(42);
        both.items.push(item(ReceiveTarget::Line(1), dec!(1)));
        assert_matches!(both.validate(), Err(ServiceError::ValidationError(_)));

        let neither = ReceiveRequest {
            purchase_order_id: 42,
            ..Default::default()
        };
        assert_matches!(neither.validate(), Err(ServiceError::ValidationError(_)));
    }

    #[tokio::test]
    async fn invalid_request_never_touches_the_store() {
        let mut store = MockPurchaseOrderStore::new();
        store.expect_fetch().times(0);
        store.expect_replace_receipts().times(0);

        let service = ReceiveService::new(Arc::new(store));
        let err = service
            .receive(ReceiveRequest {
                purchase_order_id: 42,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::ValidationError(_));
    }

    #[tokio::test]
    async fn over_receive_issues_no_write() {
        let mut store = MockPurchaseOrderStore::new();
        store
            .expect_fetch()
            .times(1)
            .returning(|_| Ok(order(vec![line(1, 100, dec!(10))], vec![receipt(5, 100, dec!(8))])));
        store.expect_replace_receipts().times(0);

        let service = ReceiveService::new(Arc::new(store));
        let err = service
            .receive(ReceiveRequest::items(42, vec![item(ReceiveTarget::Line(1), dec!(5))]))
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::OverReceive { .. });
    }

    #[tokio::test]
    async fn writes_existing_plus_new_entries_with_version() {
        let mut store = MockPurchaseOrderStore::new();
        store.expect_fetch().times(1).returning(|_| {
            let mut existing = receipt(5, 100, dec!(4));
            existing.updated_at = Some(Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap());
            Ok(order(vec![line(1, 100, dec!(10))], vec![existing]))
        });
        store
            .expect_replace_receipts()
            .withf(|id, write| {
                *id == 42
                    && write.version == VersionStamp::new("v7")
                    && write.receipts.len() == 2
                    && write.receipts[0].id == Some(5)
                    && write.receipts[0].quantity == dec!(4)
                    && write.receipts[1].id.is_none()
                    && write.receipts[1].quantity == dec!(6)
            })
            .times(1)
            .returning(|_, _| {
                Ok(ReceiptsWriteAck {
                    status: Some(PurchaseOrderStatus::Received),
                    version: Some(VersionStamp::new("v8")),
                })
            });

        let service = ReceiveService::new(Arc::new(store));
        let summary = service.receive(ReceiveRequest::all(42)).await.unwrap();

        assert_eq!(summary.entries_written, 1);
        assert_eq!(summary.status, Some(PurchaseOrderStatus::Received));
        assert!(summary.warnings.is_empty());
        assert!(summary.render().contains("fully received"));
    }

    #[tokio::test]
    async fn version_conflict_on_write_is_surfaced() {
        let mut store = MockPurchaseOrderStore::new();
        store
            .expect_fetch()
            .returning(|_| Ok(order(vec![line(1, 100, dec!(10))], vec![])));
        store.expect_replace_receipts().times(1).returning(|_, _| {
            Err(ServiceError::VersionConflict {
                code: None,
                message: "purchase order was modified".into(),
            })
        });

        let service = ReceiveService::new(Arc::new(store));
        let err = service.receive(ReceiveRequest::all(42)).await.unwrap_err();
        assert_matches!(err, ServiceError::VersionConflict { .. });
    }
}
