#![allow(dead_code)]

use serde_json::{json, Value};
use wiremock::MockServer;

use inventory_tools::{AppConfig, InventoryTools};

pub const API_KEY: &str = "test-key";

/// Harness pointing a fully wired client at a mock inventory API.
pub struct TestApi {
    pub server: MockServer,
    pub config: AppConfig,
}

impl TestApi {
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        let mut config = AppConfig::new(server.uri(), API_KEY);
        config.rate_limit_requests_per_minute = 600;
        config.request_timeout_ms = 2_000;
        config.max_retries = 2;
        config.retry_base_delay_ms = 10;
        Self { server, config }
    }

    pub fn tools(&self) -> InventoryTools {
        InventoryTools::from_config(&self.config).expect("client should build")
    }

    /// Bodies of every request the server saw with the given HTTP method.
    pub async fn bodies_for(&self, method: &str) -> Vec<Value> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|request| request.method.as_str() == method)
            .map(|request| serde_json::from_slice(&request.body).unwrap_or(Value::Null))
            .collect()
    }
}

pub fn receipt(id: i64, product_id: i64, quantity: &str, date: &str) -> Value {
    json!({
        "id": id,
        "product_id": product_id,
        "quantity": quantity,
        "serial_numbers": [],
        "received_date": date,
        "location_id": 3,
        "version": date,
        "created_at": date,
        "updated_at": date
    })
}

/// Order 42: line 1 orders 10 of product 100, line 2 orders 4 of product 200.
pub fn order_json(status: &str, receipts: Vec<Value>) -> Value {
    json!({
        "id": 42,
        "order_no": "PO-42",
        "status": status,
        "version": "2024-06-01T00:00:00.000Z",
        "location_id": 3,
        "lines": [
            {"id": 1, "product_id": 100, "quantity": "10"},
            {"id": 2, "product_id": 200, "quantity": "4", "location_id": 8}
        ],
        "receipts": receipts
    })
}
