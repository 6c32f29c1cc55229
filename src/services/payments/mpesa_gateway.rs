use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::Value;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::payment_status::PaymentStatusService;
use super::updates::{field_deep, text};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::models::{PaymentRequest, StkPushReceipt};
use crate::notifications::{notify, Notification, NotificationService};
use crate::transport::{provider_message, ApiRequest, ResilientClient};

static KENYAN_MSISDN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^254\d{9}$").expect("valid regex"));

/// Normalizes a Kenyan phone number to `254XXXXXXXXX`.
///
/// Separators and a leading `+` are dropped and a local `0` prefix becomes
/// `254`.
pub fn normalize_phone(phone: &str) -> Result<String, ServiceError> {
    let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
    let normalized = match digits.strip_prefix('0') {
        Some(rest) => format!("254{}", rest),
        None => digits,
    };

    if KENYAN_MSISDN.is_match(&normalized) {
        Ok(normalized)
    } else {
        Err(ServiceError::ValidationError(format!(
            "Invalid phone number '{}'. Use the format 07XXXXXXXX or 2547XXXXXXXX",
            phone.trim()
        )))
    }
}

/// Rounds to whole shillings, half away from zero. Anything below one
/// shilling after rounding is rejected.
pub fn normalize_amount(amount: Decimal) -> Result<u64, ServiceError> {
    let rounded = amount.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    rounded
        .to_u64()
        .filter(|whole| *whole >= 1)
        .ok_or_else(|| {
            ServiceError::ValidationError(format!(
                "Payment amount must be at least KES 1 (got {})",
                amount
            ))
        })
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Starts M-Pesa STK push payments. One initiation runs at a time per
/// gateway; accepted pushes are handed to the status service for tracking.
pub struct MpesaGateway {
    client: Arc<ResilientClient>,
    status: Arc<PaymentStatusService>,
    notifier: Arc<dyn NotificationService>,
    events: Option<EventSender>,
    in_flight: AtomicBool,
}

impl MpesaGateway {
    pub fn new(
        client: Arc<ResilientClient>,
        status: Arc<PaymentStatusService>,
        notifier: Arc<dyn NotificationService>,
    ) -> Self {
        Self {
            client,
            status,
            notifier,
            events: None,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    pub fn status_service(&self) -> &Arc<PaymentStatusService> {
        &self.status
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Sends an STK push to the shopper's phone.
    ///
    /// Input is validated before any network call. A second call while one
    /// is outstanding fails with `ConcurrencyError`. Every failure is also
    /// reported through the notifier.
    #[instrument(skip(self, phone, description), fields(order_reference = %order_reference))]
    pub async fn initiate(
        &self,
        phone: &str,
        amount: Decimal,
        order_reference: &str,
        description: &str,
    ) -> Result<StkPushReceipt, ServiceError> {
        let result = self
            .try_initiate(phone, amount, order_reference, description)
            .await;
        if let Err(e) = &result {
            if e.is_local() {
                warn!("Payment initiation rejected: {}", e)
            } else {
                error!("Payment initiation failed: {}", e)
            }
            notify(self.notifier.as_ref(), Notification::error(e.user_message())).await;
        }
        result
    }

    async fn try_initiate(
        &self,
        phone: &str,
        amount: Decimal,
        order_reference: &str,
        description: &str,
    ) -> Result<StkPushReceipt, ServiceError> {
        let phone_number = normalize_phone(phone)?;
        let amount = normalize_amount(amount)?;
        let order_reference = order_reference.trim();
        if order_reference.is_empty() {
            return Err(ServiceError::ValidationError(
                "Order reference is required".to_string(),
            ));
        }

        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ServiceError::ConcurrencyError("Payment request".to_string()));
        }
        let _guard = InFlight(&self.in_flight);

        let description = match description.trim() {
            "" => format!("Payment for order {}", order_reference),
            given => given.to_string(),
        };
        let request = PaymentRequest {
            idempotency_key: Uuid::new_v4().to_string(),
            phone_number,
            amount,
            order_reference: order_reference.to_string(),
            description,
        };

        let primary = ApiRequest::post("/mpesa/stk-push", serde_json::to_value(&request)?)
            .with_idempotency_key(request.idempotency_key.clone());
        let legacy = primary.rerouted(primary.method.clone(), "/mpesa/stkpush");

        let response = self
            .client
            .execute_with_fallback(&primary, Some(&legacy))
            .await?;
        let receipt = parse_receipt(&response.body, &request)?;

        info!(
            checkout_request_id = %receipt.checkout_request_id,
            amount = receipt.amount,
            "STK push accepted"
        );
        self.status.track(&receipt, order_reference);
        if let Some(events) = &self.events {
            events
                .send_or_log(Event::PaymentInitiated {
                    checkout_request_id: receipt.checkout_request_id.clone(),
                    order_reference: order_reference.to_string(),
                    amount: receipt.amount,
                })
                .await;
        }
        let prompt = receipt
            .customer_message
            .clone()
            .unwrap_or_else(|| "Check your phone and enter your M-Pesa PIN to pay.".to_string());
        notify(self.notifier.as_ref(), Notification::info(prompt)).await;

        Ok(receipt)
    }
}

/// Reads the provider's acknowledgement. A non-zero `ResponseCode`,
/// `success: false` or a missing checkout id means the push was refused.
fn parse_receipt(body: &Value, request: &PaymentRequest) -> Result<StkPushReceipt, ServiceError> {
    let refused = || {
        ServiceError::provider(
            200,
            provider_message(body).unwrap_or_else(|| "Payment request was not accepted".to_string()),
        )
    };

    if field_deep(body, &["success"]).and_then(Value::as_bool) == Some(false) {
        return Err(refused());
    }
    if let Some(code) = field_deep(body, &["ResponseCode", "responseCode"]).and_then(text) {
        if code != "0" {
            return Err(refused());
        }
    }

    let checkout_request_id = field_deep(body, &["CheckoutRequestID", "checkoutRequestId"])
        .and_then(text)
        .ok_or_else(refused)?;

    Ok(StkPushReceipt {
        checkout_request_id,
        idempotency_key: request.idempotency_key.clone(),
        merchant_request_id: field_deep(body, &["MerchantRequestID", "merchantRequestId"])
            .and_then(text),
        customer_message: field_deep(body, &["CustomerMessage", "customerMessage"]).and_then(text),
        phone_number: request.phone_number.clone(),
        amount: request.amount,
    })
}
