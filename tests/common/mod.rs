#![allow(dead_code)]

use std::time::Duration;

use lindas_commerce::config::AppConfig;
use lindas_commerce::events::Event;
use lindas_commerce::models::{IdValue, Product, ProductVariant};
use lindas_commerce::Storefront;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::mpsc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// A storefront wired against a wiremock API, with cart storage in a
/// throwaway directory.
pub struct TestStore {
    pub server: MockServer,
    pub store: Storefront,
    pub events: mpsc::Receiver<Event>,
    pub config: AppConfig,
    _storage: TempDir,
}

impl TestStore {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Builds a store after letting the caller adjust the test config.
    pub async fn with_config(adjust: impl FnOnce(&mut AppConfig)) -> Self {
        let server = MockServer::start().await;
        let storage = TempDir::new().expect("temp dir");

        let mut config = AppConfig::new(format!("{}/api", server.uri()));
        config.storage_dir = storage.path().to_path_buf();
        config.request_timeout_secs = 2;
        config.max_retries = 1;
        config.retry_backoff_ms = 10;
        config.sync_cooldown_secs = 300;
        adjust(&mut config);

        let (store, events) = Storefront::from_config(&config)
            .await
            .expect("storefront should build");

        Self {
            server,
            store,
            events,
            config,
            _storage: storage,
        }
    }

    /// Opens a second storefront over the same storage directory.
    pub async fn reopen(&self) -> Storefront {
        let (store, _events) = Storefront::from_config(&self.config)
            .await
            .expect("storefront should build");
        store
    }

    /// Serves `products` from `GET /api/products`.
    pub async fn serve_catalog(&self, products: Value) {
        Mock::given(method("GET"))
            .and(path("/api/products"))
            .respond_with(ResponseTemplate::new(200).set_body_json(products))
            .mount(&self.server)
            .await;
    }

    /// Every event published so far.
    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }
}

pub fn product(id: i64, name: &str, price: i64, stock: i64) -> Product {
    Product {
        id: Some(IdValue::Number(id)),
        name: name.to_string(),
        price: Decimal::from(price),
        stock_quantity: Some(stock),
        in_stock: Some(stock > 0),
        ..Product::default()
    }
}

pub fn product_with_variant(id: i64, name: &str, size: &str, price: i64, stock: i64) -> Product {
    Product {
        selected_variant: Some(ProductVariant {
            size: Some(size.to_string()),
            price: Some(Decimal::from(price)),
            stock_quantity: Some(stock),
            in_stock: Some(stock > 0),
            ..ProductVariant::default()
        }),
        ..product(id, name, price, stock)
    }
}

pub fn product_json(id: i64, name: &str, price: i64, stock: i64) -> Value {
    json!({
        "id": id,
        "name": name,
        "price": price,
        "stockQuantity": stock,
        "inStock": stock > 0,
    })
}

/// An accepted STK push acknowledgement.
pub fn stk_accepted(checkout_request_id: &str) -> Value {
    json!({
        "MerchantRequestID": "29115-34620561-1",
        "CheckoutRequestID": checkout_request_id,
        "ResponseCode": "0",
        "ResponseDescription": "Success. Request accepted for processing",
        "CustomerMessage": "Success. Request accepted for processing"
    })
}

pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}
