use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::errors::ServiceError;
use crate::models::Product;
use crate::transport::{ApiRequest, ResilientClient};

/// Authoritative product data, as served by the storefront API.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProductCatalog: Send + Sync {
    /// `GET /products`, optionally filtered by category.
    async fn list_products(&self, category: Option<String>) -> Result<Vec<Product>, ServiceError>;

    /// `GET /products/:id`. An unknown id is `Ok(None)`, not an error.
    async fn get_product(&self, id: &str) -> Result<Option<Product>, ServiceError>;
}

/// [`ProductCatalog`] over the REST API.
#[derive(Clone)]
pub struct HttpProductCatalog {
    client: Arc<ResilientClient>,
}

impl HttpProductCatalog {
    pub fn new(client: Arc<ResilientClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ProductCatalog for HttpProductCatalog {
    #[instrument(skip(self))]
    async fn list_products(&self, category: Option<String>) -> Result<Vec<Product>, ServiceError> {
        let mut request = ApiRequest::get("/products");
        if let Some(category) = category.filter(|c| !c.trim().is_empty()) {
            request = request.with_query("category", category);
        }

        let response = self.client.execute(&request).await?;
        let products = parse_product_list(&response.body)?;
        debug!(count = products.len(), "Fetched product list");
        Ok(products)
    }

    #[instrument(skip(self))]
    async fn get_product(&self, id: &str) -> Result<Option<Product>, ServiceError> {
        let request = ApiRequest::get(format!("/products/{}", id));
        match self.client.execute(&request).await {
            Ok(response) => parse_product(&response.body).map(Some),
            Err(ServiceError::ProviderError { status: 404, .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Accepts a bare array or one wrapped in `products` / `data`.
pub(crate) fn parse_product_list(body: &Value) -> Result<Vec<Product>, ServiceError> {
    let list = match body {
        Value::Array(_) => body,
        Value::Object(map) => map
            .get("products")
            .or_else(|| map.get("data").and_then(|d| d.get("products")))
            .or_else(|| map.get("data"))
            .filter(|v| v.is_array())
            .ok_or_else(|| {
                ServiceError::SerializationError("Product list response has no products".into())
            })?,
        _ => {
            return Err(ServiceError::SerializationError(
                "Unexpected product list response".into(),
            ))
        }
    };

    let Value::Array(entries) = list else {
        return Ok(Vec::new());
    };

    // One malformed record should not hide the rest of the catalog.
    Ok(entries
        .iter()
        .filter_map(|entry| match serde_json::from_value::<Product>(entry.clone()) {
            Ok(product) => Some(product),
            Err(e) => {
                warn!("Skipping malformed product record: {}", e);
                None
            }
        })
        .collect())
}

fn parse_product(body: &Value) -> Result<Product, ServiceError> {
    let record = body
        .get("product")
        .or_else(|| body.get("data").filter(|d| d.is_object()))
        .unwrap_or(body);
    Ok(serde_json::from_value(record.clone())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{HttpTransport, RetryPolicy};
    use rust_decimal_macros::dec;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn catalog(server: &MockServer) -> HttpProductCatalog {
        let transport = HttpTransport::new(server.uri(), Duration::from_secs(2), None)
            .expect("client should build");
        HttpProductCatalog::new(Arc::new(ResilientClient::new(
            Arc::new(transport),
            RetryPolicy::none(),
        )))
    }

    #[test]
    fn list_envelopes() {
        let bare = json!([{"id": 1, "name": "A", "price": 10}]);
        let wrapped = json!({"products": [{"id": 1, "name": "A", "price": 10}]});
        let data = json!({"data": [{"id": 1, "name": "A", "price": 10}]});
        for body in [bare, wrapped, data] {
            let products = parse_product_list(&body).expect("list should parse");
            assert_eq!(products.len(), 1);
            assert_eq!(products[0].price, dec!(10));
        }
        assert!(parse_product_list(&json!({"message": "ok"})).is_err());
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let body = json!([{"id": 1, "name": "A", "price": 10}, {"id": 2, "price": "abc"}]);
        assert_eq!(parse_product_list(&body).expect("parse").len(), 1);
    }

    #[tokio::test]
    async fn category_filter_is_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/products"))
            .and(query_param("category", "honey"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "products": [{"numericId": 42, "name": "Baobab Honey", "price": 1000}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let products = catalog(&server)
            .await
            .list_products(Some("honey".into()))
            .await
            .expect("list should succeed");
        assert_eq!(products[0].raw_id().as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn missing_product_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/products/404"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"message": "Product not found"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/products/42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"numericId": 42, "name": "Baobab Honey", "price": 1000}
            })))
            .mount(&server)
            .await;

        let catalog = catalog(&server).await;
        assert_eq!(catalog.get_product("404").await.expect("lookup"), None);
        let found = catalog
            .get_product("42")
            .await
            .expect("lookup")
            .expect("product should exist");
        assert_eq!(found.name, "Baobab Honey");
    }
}
