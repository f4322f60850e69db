// Order snapshot reads and full-ledger writes
pub mod purchase_orders;

// Receipt reconciliation
pub mod receiving;
pub mod unreceiving;
