use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::{
    errors::ServiceError,
    models::{PurchaseOrder, ReceiptsWrite, ReceiveEntry, ReceiveEntryInput},
    services::purchase_orders::PurchaseOrderStore,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRemoval {
    pub product_id: i64,
    pub quantity: Decimal,
}

/// Reverses prior receipts. Exactly one of `entry_ids`, `products` and `all`
/// selects the mode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnreceiveRequest {
    pub purchase_order_id: i64,
    #[serde(default)]
    pub entry_ids: Vec<i64>,
    #[serde(default)]
    pub products: Vec<ProductRemoval>,
    #[serde(default)]
    pub all: bool,
    #[serde(default)]
    pub dry_run: bool,
}

impl UnreceiveRequest {
    pub fn all(purchase_order_id: i64) -> Self {
        Self {
            purchase_order_id,
            all: true,
            ..Default::default()
        }
    }

    pub fn entries(purchase_order_id: i64, entry_ids: Vec<i64>) -> Self {
        Self {
            purchase_order_id,
            entry_ids,
            ..Default::default()
        }
    }

    pub fn products(purchase_order_id: i64, products: Vec<ProductRemoval>) -> Self {
        Self {
            purchase_order_id,
            products,
            ..Default::default()
        }
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn validate(&self) -> Result<(), ServiceError> {
        let modes = [self.all, !self.entry_ids.is_empty(), !self.products.is_empty()]
            .iter()
            .filter(|selected| **selected)
            .count();
        match modes {
            1 => Ok(()),
            0 => Err(ServiceError::ValidationError(
                "one of all, entry ids or product quantities is required".to_string(),
            )),
            _ => Err(ServiceError::ValidationError(
                "all, entry ids and product quantities are mutually exclusive".to_string(),
            )),
        }
    }
}

/// What happens to one ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryAction {
    Remove,
    ReduceTo(Decimal),
}

/// One step of a LIFO walk over a product's entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifoStep {
    pub entry_id: i64,
    /// Quantity taken off this entry.
    pub removed: Decimal,
    pub action: EntryAction,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemovedEntry {
    pub entry_id: i64,
    pub product_id: i64,
    pub quantity: Decimal,
    pub serial_numbers: Vec<String>,
    pub received_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModifiedEntry {
    pub entry_id: i64,
    pub product_id: i64,
    pub previous_quantity: Decimal,
    pub new_quantity: Decimal,
    /// Serial numbers dropped by the reduction.
    pub removed_serials: Vec<String>,
}

/// The retained ledger and what was taken out of it.
#[derive(Debug, Clone)]
pub struct UnreceivePlan {
    pub retained: Vec<ReceiveEntryInput>,
    pub removed: Vec<RemovedEntry>,
    pub modified: Vec<ModifiedEntry>,
}

impl UnreceivePlan {
    pub fn remaining_quantity_by_product(&self) -> BTreeMap<i64, Decimal> {
        let mut totals = BTreeMap::new();
        for entry in &self.retained {
            *totals.entry(entry.product_id).or_insert(Decimal::ZERO) += entry.quantity;
        }
        totals
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UnreceiveSummary {
    pub purchase_order_id: i64,
    pub dry_run: bool,
    pub removed: Vec<RemovedEntry>,
    pub modified: Vec<ModifiedEntry>,
    pub remaining_entries: usize,
    pub remaining_quantity_by_product: BTreeMap<i64, Decimal>,
}

impl UnreceiveSummary {
    pub fn render(&self) -> String {
        let mut out = String::new();
        let (removed_verb, modified_verb) = if self.dry_run {
            ("Would remove", "Would reduce")
        } else {
            ("Removed", "Reduced")
        };

        let _ = writeln!(out, "Purchase order {}:", self.purchase_order_id);
        for entry in &self.removed {
            let _ = writeln!(
                out,
                "  {} entry {} (product {}, quantity {}, received {})",
                removed_verb,
                entry.entry_id,
                entry.product_id,
                entry.quantity,
                entry.received_date.to_rfc3339()
            );
        }
        for entry in &self.modified {
            let _ = writeln!(
                out,
                "  {} entry {} (product {}) from {} to {}",
                modified_verb, entry.entry_id, entry.product_id, entry.previous_quantity, entry.new_quantity
            );
            if !entry.removed_serials.is_empty() {
                let _ = writeln!(out, "    serials: {}", entry.removed_serials.join(", "));
            }
        }
        let _ = writeln!(out, "Remaining entries: {}", self.remaining_entries);
        for (product_id, quantity) in &self.remaining_quantity_by_product {
            let _ = writeln!(out, "  product {}: {}", product_id, quantity);
        }
        if self.dry_run {
            let _ = writeln!(out, "Dry run: nothing was written");
        }
        out
    }
}

/// Walks `product_id`'s entries newest first until `quantity` is consumed.
///
/// Order: receive date desc, then version stamp desc, then entry id desc.
pub fn plan_lifo(
    order: &PurchaseOrder,
    product_id: i64,
    quantity: Decimal,
) -> Result<Vec<LifoStep>, ServiceError> {
    if quantity <= Decimal::ZERO {
        return Err(ServiceError::ValidationError(format!(
            "quantity to unreceive for product {} must be positive, got {}",
            product_id, quantity
        )));
    }

    let mut entries: Vec<&ReceiveEntry> = order
        .receipts
        .iter()
        .filter(|entry| entry.product_id == product_id)
        .collect();
    if entries.is_empty() {
        return Err(ServiceError::NotFound(format!(
            "product {} has no receipts on purchase order {}",
            product_id, order.id
        )));
    }

    let received: Decimal = entries.iter().map(|entry| entry.quantity).sum();
    if quantity > received {
        return Err(ServiceError::ValidationError(format!(
            "cannot unreceive {} of product {}: only {} received",
            quantity, product_id, received
        )));
    }

    entries.sort_by_key(|entry| Reverse((entry.received_date, entry.version.clone(), entry.id)));

    let mut remaining = quantity;
    let mut steps = Vec::new();
    for entry in entries {
        if remaining <= Decimal::ZERO {
            break;
        }
        if entry.quantity <= remaining {
            remaining -= entry.quantity;
            steps.push(LifoStep {
                entry_id: entry.id,
                removed: entry.quantity,
                action: EntryAction::Remove,
            });
        } else {
            steps.push(LifoStep {
                entry_id: entry.id,
                removed: remaining,
                action: EntryAction::ReduceTo(entry.quantity - remaining),
            });
            break;
        }
    }

    Ok(steps)
}

/// Computes the retained ledger for `request` against one snapshot.
pub fn plan_unreceive(order: &PurchaseOrder, request: &UnreceiveRequest) -> Result<UnreceivePlan, ServiceError> {
    request.validate()?;
    order.ensure_open()?;
    if order.receipts.is_empty() {
        return Err(ServiceError::ValidationError(format!(
            "purchase order {} has nothing received",
            order.id
        )));
    }

    let mut actions: BTreeMap<i64, EntryAction> = BTreeMap::new();
    let mut errors = Vec::new();

    if request.all {
        actions.extend(order.receipts.iter().map(|entry| (entry.id, EntryAction::Remove)));
    } else if !request.entry_ids.is_empty() {
        let unique: BTreeSet<i64> = request.entry_ids.iter().copied().collect();
        for entry_id in unique {
            match order.entry(entry_id) {
                Some(_) => {
                    actions.insert(entry_id, EntryAction::Remove);
                }
                None => errors.push(ServiceError::NotFound(format!(
                    "receipt {} is not on purchase order {}",
                    entry_id, order.id
                ))),
            }
        }
    } else {
        for removal in merge_removals(&request.products) {
            match plan_lifo(order, removal.product_id, removal.quantity) {
                Ok(steps) => actions.extend(steps.into_iter().map(|step| (step.entry_id, step.action))),
                Err(error) => errors.push(error),
            }
        }
    }

    if !errors.is_empty() {
        for error in &errors {
            warn!(purchase_order_id = order.id, error = %error, "Unreceive rejected");
        }
        return Err(ServiceError::from_failures(errors));
    }

    let mut plan = UnreceivePlan {
        retained: Vec::with_capacity(order.receipts.len()),
        removed: Vec::new(),
        modified: Vec::new(),
    };
    for entry in &order.receipts {
        match actions.get(&entry.id) {
            None => plan.retained.push(entry.to_input()),
            Some(EntryAction::Remove) => plan.removed.push(RemovedEntry {
                entry_id: entry.id,
                product_id: entry.product_id,
                quantity: entry.quantity,
                serial_numbers: entry.serial_numbers.clone(),
                received_date: entry.received_date,
            }),
            Some(EntryAction::ReduceTo(quantity)) => {
                let reduced = entry.reduced_to(*quantity);
                plan.modified.push(ModifiedEntry {
                    entry_id: entry.id,
                    product_id: entry.product_id,
                    previous_quantity: entry.quantity,
                    new_quantity: *quantity,
                    removed_serials: entry.serial_numbers[reduced.serial_numbers.len()..].to_vec(),
                });
                plan.retained.push(reduced);
            }
        }
    }

    Ok(plan)
}

/// Sums repeated products so each is walked once, in first-seen order.
fn merge_removals(removals: &[ProductRemoval]) -> Vec<ProductRemoval> {
    let mut merged: Vec<ProductRemoval> = Vec::with_capacity(removals.len());
    for removal in removals {
        match merged.iter_mut().find(|m| m.product_id == removal.product_id) {
            Some(existing) => existing.quantity += removal.quantity,
            None => merged.push(*removal),
        }
    }
    merged
}

/// Removes or reduces receipts on a purchase order.
#[derive(Clone)]
pub struct UnreceiveService {
    store: Arc<dyn PurchaseOrderStore>,
}

impl UnreceiveService {
    pub fn new(store: Arc<dyn PurchaseOrderStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self))]
    pub async fn unreceive(&self, request: UnreceiveRequest) -> Result<UnreceiveSummary, ServiceError> {
        request.validate()?;

        let order = self.store.fetch(request.purchase_order_id).await?;
        let plan = plan_unreceive(&order, &request)?;

        if request.dry_run {
            info!(
                purchase_order_id = order.id,
                would_remove = plan.removed.len(),
                would_modify = plan.modified.len(),
                "Unreceive preview"
            );
        } else {
            self.store
                .replace_receipts(
                    order.id,
                    ReceiptsWrite {
                        version: order.version.clone(),
                        receipts: plan.retained.clone(),
                    },
                )
                .await?;
            info!(
                purchase_order_id = order.id,
                removed = plan.removed.len(),
                modified = plan.modified.len(),
                "Receipts reversed"
            );
        }

        Ok(UnreceiveSummary {
            purchase_order_id: order.id,
            dry_run: request.dry_run,
            remaining_entries: plan.retained.len(),
            remaining_quantity_by_product: plan.remaining_quantity_by_product(),
            removed: plan.removed,
            modified: plan.modified,
        })
    }
}
