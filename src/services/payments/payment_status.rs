use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use reqwest::Method;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::updates::{interpret_report, parse_stk_callback, PaymentSubscription, PaymentUpdateHub};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::models::{
    Order, PaymentDetails, PaymentPhase, PaymentStatus, PaymentStatusReport, PaymentUpdate,
    StkPushReceipt, TrackedPayment,
};
use crate::notifications::{notify, Notification, NotificationService};
use crate::services::orders::{OrderService, PaymentUpdateOutcome};
use crate::transport::{ApiRequest, ResilientClient};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// How a [`PaymentStatusService::wait_for_completion`] call ended.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    /// The payment reached a terminal status.
    Resolved(PaymentStatusReport),
    /// The caller stopped waiting. The payment itself may still complete.
    Cancelled,
}

/// Tracks outstanding STK pushes, answers status queries and records
/// confirmed payments against orders.
pub struct PaymentStatusService {
    client: Arc<ResilientClient>,
    orders: Arc<OrderService>,
    hub: PaymentUpdateHub,
    notifier: Arc<dyn NotificationService>,
    events: Option<EventSender>,
    tracked: DashMap<String, TrackedPayment>,
    poll_interval: Duration,
}

impl PaymentStatusService {
    pub fn new(
        client: Arc<ResilientClient>,
        orders: Arc<OrderService>,
        hub: PaymentUpdateHub,
        notifier: Arc<dyn NotificationService>,
    ) -> Self {
        Self {
            client,
            orders,
            hub,
            notifier,
            events: None,
            tracked: DashMap::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    /// Period of the status poll in [`PaymentStatusService::wait_for_completion`].
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Push updates for one checkout request.
    pub fn subscribe(&self, checkout_request_id: &str) -> PaymentSubscription {
        self.hub.subscribe(checkout_request_id)
    }

    /// Starts tracking a freshly accepted STK push.
    pub fn track(&self, receipt: &StkPushReceipt, order_reference: &str) {
        let now = Utc::now();
        self.tracked.insert(
            receipt.checkout_request_id.clone(),
            TrackedPayment {
                checkout_request_id: receipt.checkout_request_id.clone(),
                order_reference: order_reference.to_string(),
                idempotency_key: receipt.idempotency_key.clone(),
                amount: receipt.amount,
                phase: PaymentPhase::Initiated,
                cancelled: false,
                last_report: None,
                created_at: now,
                updated_at: now,
            },
        );
        debug!(checkout_request_id = %receipt.checkout_request_id, "Tracking payment");
    }

    pub fn tracked(&self, checkout_request_id: &str) -> Option<TrackedPayment> {
        self.tracked
            .get(checkout_request_id)
            .map(|entry| entry.value().clone())
    }

    /// Forgets payments with no activity for `max_age`. An STK push expires
    /// on the handset within minutes, so an entry that old is settled or
    /// abandoned. Returns how many were dropped.
    pub fn prune_tracked(&self, max_age: Duration) -> usize {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return 0;
        };
        let cutoff = Utc::now() - max_age;
        let before = self.tracked.len();
        self.tracked.retain(|_, tracked| tracked.updated_at > cutoff);
        let dropped = before.saturating_sub(self.tracked.len());
        if dropped > 0 {
            debug!(dropped, "Pruned tracked payments");
        }
        dropped
    }

    /// Normalized status of a checkout request.
    pub async fn check_status(
        &self,
        checkout_request_id: &str,
        idempotency_key: Option<String>,
    ) -> Result<PaymentStatus, ServiceError> {
        Ok(self
            .query_status(checkout_request_id, idempotency_key)
            .await?
            .status)
    }

    /// Queries the provider and records the answer.
    ///
    /// Uses `GET /mpesa/status/:id`, falling back to the legacy
    /// `POST /mpesa/query` with the same idempotency key.
    #[instrument(skip(self, idempotency_key))]
    pub async fn query_status(
        &self,
        checkout_request_id: &str,
        idempotency_key: Option<String>,
    ) -> Result<PaymentStatusReport, ServiceError> {
        if checkout_request_id.trim().is_empty() {
            return Err(ServiceError::ValidationError(
                "Checkout request id is required".to_string(),
            ));
        }

        let key = idempotency_key.unwrap_or_else(|| Uuid::new_v4().to_string());
        let primary = ApiRequest::get(format!("/mpesa/status/{}", checkout_request_id))
            .with_idempotency_key(key.clone());
        let legacy = ApiRequest::new(Method::POST, "/mpesa/query")
            .with_body(json!({
                "checkoutRequestId": checkout_request_id,
                "CheckoutRequestID": checkout_request_id,
            }))
            .with_idempotency_key(key);

        let report = match self.client.execute_with_fallback(&primary, Some(&legacy)).await {
            Ok(response) => interpret_report(checkout_request_id, &response.body),
            // Daraja answers a query for an unfinished push with an error status.
            Err(ServiceError::ProviderError { message, .. }) if is_still_processing(&message) => {
                interpret_report(checkout_request_id, &json!({ "status": "processing" }))
            }
            Err(e) => {
                warn!(checkout_request_id, "Payment status query failed: {}", e);
                return Err(e);
            }
        };

        self.record(&report).await;
        Ok(report)
    }

    /// Handles an STK callback body delivered by the provider: records it
    /// and forwards it to push subscribers.
    #[instrument(skip(self, payload))]
    pub async fn handle_callback(&self, payload: &Value) -> Result<PaymentUpdate, ServiceError> {
        let update = parse_stk_callback(payload)?;
        info!(
            checkout_request_id = %update.report.checkout_request_id,
            status = %update.report.status,
            "Payment callback received"
        );
        self.record(&update.report).await;
        self.hub.publish(update.clone());
        Ok(update)
    }

    /// Waits for a terminal status, combining push updates with a status
    /// poll at the configured interval. There is no built-in deadline: flip
    /// `cancel` to `true` to stop waiting.
    #[instrument(skip(self, cancel))]
    pub async fn wait_for_completion(
        &self,
        checkout_request_id: &str,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<WaitOutcome, ServiceError> {
        let mut updates = self.subscribe(checkout_request_id);

        if let Some(report) = self
            .tracked(checkout_request_id)
            .and_then(|tracked| tracked.last_report)
            .filter(|report| report.status.is_terminal())
        {
            return Ok(WaitOutcome::Resolved(report));
        }
        if *cancel.borrow() {
            return Ok(WaitOutcome::Cancelled);
        }

        let mut ticker = tokio::time::interval(self.poll_interval.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut push_open = true;
        let mut cancel_open = true;

        loop {
            tokio::select! {
                update = updates.next(), if push_open => match update {
                    Some(update) if update.report.status.is_terminal() => {
                        return Ok(WaitOutcome::Resolved(update.report));
                    }
                    Some(_) => {}
                    None => push_open = false,
                },
                _ = ticker.tick() => {
                    match self.query_status(checkout_request_id, None).await {
                        Ok(report) if report.status.is_terminal() => {
                            return Ok(WaitOutcome::Resolved(report));
                        }
                        Ok(_) => {}
                        Err(e) if e.is_retryable() => {
                            debug!("Status poll failed, will retry: {}", e);
                        }
                        Err(e) => return Err(e),
                    }
                }
                changed = cancel.changed(), if cancel_open => match changed {
                    Ok(()) if *cancel.borrow() => return Ok(WaitOutcome::Cancelled),
                    Ok(()) => {}
                    Err(_) => cancel_open = false,
                },
            }
        }
    }

    /// Marks a pending payment as abandoned on this side. The provider is not
    /// told; a completion that arrives later is still recorded.
    #[instrument(skip(self))]
    pub async fn cancel(&self, checkout_request_id: &str) -> bool {
        let cancelled = match self.tracked.get_mut(checkout_request_id) {
            Some(mut tracked) if !tracked.phase.is_terminal() && !tracked.cancelled => {
                tracked.cancelled = true;
                tracked.updated_at = Utc::now();
                true
            }
            _ => false,
        };

        if cancelled {
            self.emit(Event::PaymentCancelled {
                checkout_request_id: checkout_request_id.to_string(),
            })
            .await;
            notify(
                self.notifier.as_ref(),
                Notification::info(
                    "Payment cancelled. If you already approved it on your phone, it will still be recorded.",
                ),
            )
            .await;
        }
        cancelled
    }

    /// Attaches confirmed payment details to an order.
    ///
    /// Without an explicit key, one is derived from the checkout request id so
    /// that repeated reconciliation of the same payment is applied once; only
    /// the call that applies it announces it.
    /// Failures here mean money may have moved without the order showing it;
    /// they are logged at error level and returned as `ReconciliationError`.
    #[instrument(skip(self, details, idempotency_key), fields(checkout_request_id = %details.checkout_request_id))]
    pub async fn reconcile(
        &self,
        order_id: &str,
        details: PaymentDetails,
        idempotency_key: Option<String>,
    ) -> Result<Order, ServiceError> {
        let key = idempotency_key
            .unwrap_or_else(|| format!("reconcile-{}", details.checkout_request_id));

        match self.orders.update_payment(order_id, &details, &key).await {
            Ok(PaymentUpdateOutcome::Applied(order)) => {
                self.emit(Event::OrderUpdated {
                    order_id: order.id.clone(),
                    payment_status: order.payment_status.to_string(),
                    amount_paid: Some(details.amount),
                })
                .await;
                notify(
                    self.notifier.as_ref(),
                    Notification::success(format!("Payment confirmed for order {}", order_id)),
                )
                .await;
                Ok(order)
            }
            Ok(PaymentUpdateOutcome::AlreadyApplied(order)) => {
                debug!(order_id, idempotency_key = %key, "Payment already reconciled");
                Ok(order)
            }
            Err(e @ ServiceError::ValidationError(_)) => Err(e),
            Err(e) => {
                let err = ServiceError::ReconciliationError {
                    order_id: order_id.to_string(),
                    message: e.to_string(),
                };
                error!(
                    order_id,
                    checkout_request_id = %details.checkout_request_id,
                    idempotency_key = %key,
                    "Payment received but order update failed: {}",
                    e
                );
                notify(self.notifier.as_ref(), Notification::error(err.user_message())).await;
                Err(err)
            }
        }
    }

    /// Applies a report to the tracked payment and announces status changes.
    async fn record(&self, report: &PaymentStatusReport) {
        let previous = match self.tracked.get_mut(&report.checkout_request_id) {
            Some(mut tracked) => {
                let previous = tracked.phase;
                if previous.is_terminal() {
                    return;
                }
                if previous.can_advance_to(report.phase) {
                    tracked.phase = report.phase;
                }
                tracked.last_report = Some(report.clone());
                tracked.updated_at = Utc::now();
                Some(previous)
            }
            None => None,
        };

        let changed = previous.map_or(true, |p| p.status() != report.status);
        if !changed {
            return;
        }

        self.emit(Event::PaymentStatusChanged {
            checkout_request_id: report.checkout_request_id.clone(),
            status: report.status,
        })
        .await;

        if previous.is_none() {
            return;
        }
        match report.status {
            PaymentStatus::Completed => {
                info!(checkout_request_id = %report.checkout_request_id, "Payment completed");
                notify(self.notifier.as_ref(), Notification::success("Payment received. Thank you!"))
                    .await;
            }
            PaymentStatus::Failed => {
                let message = report
                    .result_desc
                    .clone()
                    .unwrap_or_else(|| "Payment was not completed. Please try again.".to_string());
                warn!(checkout_request_id = %report.checkout_request_id, reason = %message, "Payment failed");
                notify(self.notifier.as_ref(), Notification::error(message)).await;
            }
            PaymentStatus::Pending => {}
        }
    }

    async fn emit(&self, event: Event) {
        if let Some(events) = &self.events {
            events.send_or_log(event).await;
        }
    }
}

fn is_still_processing(message: &str) -> bool {
    message.to_ascii_lowercase().contains("being processed")
}
