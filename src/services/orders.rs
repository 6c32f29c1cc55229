use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reqwest::Method;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::errors::ServiceError;
use crate::models::{CreateOrderRequest, Order, OrderPaymentStatus, PaymentDetails};
use crate::transport::{ApiRequest, ResilientClient};

#[derive(Debug, Clone)]
struct AppliedUpdate {
    order: Order,
    applied_at: DateTime<Utc>,
}

type UpdateSlot = Arc<Mutex<Option<AppliedUpdate>>>;

/// What [`OrderService::update_payment`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum PaymentUpdateOutcome {
    /// This call sent the update and the Order Service accepted it.
    Applied(Order),
    /// An earlier call with the same idempotency key already applied it.
    AlreadyApplied(Order),
}

impl PaymentUpdateOutcome {
    pub fn order(&self) -> &Order {
        match self {
            Self::Applied(order) | Self::AlreadyApplied(order) => order,
        }
    }

    pub fn into_order(self) -> Order {
        match self {
            Self::Applied(order) | Self::AlreadyApplied(order) => order,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Client for the Order Service, which owns order records.
pub struct OrderService {
    client: Arc<ResilientClient>,
    /// Results of payment updates, by idempotency key.
    payment_updates: DashMap<String, UpdateSlot>,
}

impl OrderService {
    pub fn new(client: Arc<ResilientClient>) -> Self {
        Self {
            client,
            payment_updates: DashMap::new(),
        }
    }

    /// Creates an order. A fresh idempotency key is used when none is given,
    /// so transport retries cannot create duplicates.
    #[instrument(skip(self, request), fields(items = request.items.len(), total = %request.total_amount))]
    pub async fn create_order(
        &self,
        request: &CreateOrderRequest,
        idempotency_key: Option<String>,
    ) -> Result<Order, ServiceError> {
        request.validate()?;

        let key = idempotency_key.unwrap_or_else(|| Uuid::new_v4().to_string());
        let api_request =
            ApiRequest::post("/orders", serde_json::to_value(request)?).with_idempotency_key(key);

        let response = self.client.execute(&api_request).await.map_err(|e| {
            error!(error = %e, "Failed to create order");
            e
        })?;
        let order = parse_order(&response.body)?;
        info!(order_id = %order.id, "Order created");
        Ok(order)
    }

    #[instrument(skip(self))]
    pub async fn get_order(&self, order_id: &str) -> Result<Option<Order>, ServiceError> {
        let request = ApiRequest::get(format!("/orders/{}", order_id));
        match self.client.execute(&request).await {
            Ok(response) => parse_order(&response.body).map(Some),
            Err(ServiceError::ProviderError { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Attaches confirmed payment details to an order and marks it paid.
    ///
    /// Calls sharing an idempotency key are applied once: concurrent callers
    /// wait for the first, later callers get its stored result without
    /// another request. A failed attempt stores nothing and may be retried.
    /// Stored results are kept until [`OrderService::prune_applied`] drops them.
    #[instrument(skip(self, details), fields(checkout_request_id = %details.checkout_request_id))]
    pub async fn update_payment(
        &self,
        order_id: &str,
        details: &PaymentDetails,
        idempotency_key: &str,
    ) -> Result<PaymentUpdateOutcome, ServiceError> {
        details.validate()?;

        let slot = self
            .payment_updates
            .entry(idempotency_key.to_string())
            .or_default()
            .clone();
        let mut applied = slot.lock().await;
        if let Some(update) = applied.as_ref() {
            debug!(order_id, "Payment update already applied for this key");
            return Ok(PaymentUpdateOutcome::AlreadyApplied(update.order.clone()));
        }

        let body = json!({
            "paymentStatus": OrderPaymentStatus::Paid,
            "paymentDetails": details,
        });
        let primary = ApiRequest::patch(format!("/orders/{}/payment", order_id), body)
            .with_idempotency_key(idempotency_key);
        let legacy = primary.rerouted(Method::PUT, format!("/orders/{}", order_id));

        let response = self
            .client
            .execute_with_fallback(&primary, Some(&legacy))
            .await?;

        let mut order = parse_order(&response.body).unwrap_or_else(|e| {
            debug!("Order update returned no order record ({}), using request data", e);
            Order {
                id: order_id.to_string(),
                order_number: None,
                payment_status: OrderPaymentStatus::Paid,
                total_amount: None,
                payment_details: None,
                extra: Default::default(),
            }
        });
        if order.payment_details.is_none() {
            order.payment_details = Some(details.clone());
        }

        info!(order_id = %order.id, status = %order.payment_status, "Order payment updated");
        *applied = Some(AppliedUpdate {
            order: order.clone(),
            applied_at: Utc::now(),
        });
        Ok(PaymentUpdateOutcome::Applied(order))
    }

    /// Forgets stored update results older than `max_age`, and slots left
    /// empty by failed attempts. Slots with an update in flight are kept.
    /// Returns how many keys were dropped.
    pub fn prune_applied(&self, max_age: Duration) -> usize {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return 0;
        };
        let cutoff = Utc::now() - max_age;
        let mut dropped = 0;
        self.payment_updates.retain(|_, slot| {
            let keep = match slot.try_lock() {
                Ok(applied) => applied
                    .as_ref()
                    .is_some_and(|update| update.applied_at > cutoff),
                Err(_) => true,
            };
            if !keep {
                dropped += 1;
            }
            keep
        });
        if dropped > 0 {
            debug!(dropped, "Pruned stored order payment updates");
        }
        dropped
    }

    /// Number of idempotency keys with a stored or pending update.
    pub fn remembered_updates(&self) -> usize {
        self.payment_updates.len()
    }
}

/// Accepts a bare order or one wrapped in `order` / `data`.
fn parse_order(body: &Value) -> Result<Order, ServiceError> {
    let record = body
        .get("order")
        .or_else(|| body.get("data").and_then(|d| d.get("order")))
        .or_else(|| body.get("data").filter(|d| d.is_object()))
        .unwrap_or(body);
    Ok(serde_json::from_value(record.clone())?)
}
