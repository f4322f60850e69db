//! Inventory Tools Library
//!
//! Rate-limited, retrying access to a remote inventory API and the purchase
//! order receive/unreceive reconciliation built on top of it.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod client;
pub mod clock;
pub mod config;
pub mod errors;
pub mod models;
pub mod rate_limiter;
pub mod services;

use std::sync::Arc;

pub use client::{ApiRequest, ExecutorConfig, HttpTransport, RequestExecutor, ReqwestTransport};
pub use config::AppConfig;
pub use errors::ServiceError;
pub use rate_limiter::{RateLimitConfig, RateLimiter};
pub use services::purchase_orders::{PurchaseOrderStore, RemotePurchaseOrders};
pub use services::receiving::{ReceiveItem, ReceiveRequest, ReceiveService, ReceiveSummary, ReceiveTarget};
pub use services::unreceiving::{ProductRemoval, UnreceiveRequest, UnreceiveService, UnreceiveSummary};

/// Everything one process needs to run receive and unreceive operations,
/// sharing a single rate limiter.
#[derive(Clone)]
pub struct InventoryTools {
    pub executor: Arc<RequestExecutor>,
    pub purchase_orders: Arc<RemotePurchaseOrders>,
    pub receiving: ReceiveService,
    pub unreceiving: UnreceiveService,
}

impl InventoryTools {
    /// Wires the reqwest transport from configuration.
    pub fn from_config(config: &AppConfig) -> Result<Self, ServiceError> {
        let transport = ReqwestTransport::new(&config.api_base_url, &config.api_key)?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    pub fn with_transport(config: &AppConfig, transport: Arc<dyn HttpTransport>) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.rate_limit_config()));
        let executor = Arc::new(RequestExecutor::new(transport, limiter, config.executor_config()));
        let purchase_orders = Arc::new(RemotePurchaseOrders::new(executor.clone()));

        Self {
            receiving: ReceiveService::new(purchase_orders.clone()),
            unreceiving: UnreceiveService::new(purchase_orders.clone()),
            executor,
            purchase_orders,
        }
    }
}
