// Remote inventory API resources
pub mod purchase_order;

pub use purchase_order::{
    OrderLine, PurchaseOrder, PurchaseOrderStatus, ReceiptsWrite, ReceiptsWriteAck, ReceiveEntry,
    ReceiveEntryInput, VersionStamp,
};
