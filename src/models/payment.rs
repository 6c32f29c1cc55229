use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Normalized payment status handed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
}

impl PaymentStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

/// Full lifecycle of an STK push as tracked on the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentPhase {
    Initiated,
    Processing,
    Completed,
    Failed,
    Timeout,
}

impl PaymentPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PaymentPhase::Completed | PaymentPhase::Failed | PaymentPhase::Timeout
        )
    }

    pub fn status(self) -> PaymentStatus {
        match self {
            PaymentPhase::Initiated | PaymentPhase::Processing => PaymentStatus::Pending,
            PaymentPhase::Completed => PaymentStatus::Completed,
            PaymentPhase::Failed | PaymentPhase::Timeout => PaymentStatus::Failed,
        }
    }

    /// Phases only move forward; a terminal phase is never left.
    pub fn can_advance_to(self, next: PaymentPhase) -> bool {
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (PaymentPhase::Initiated, _) => next != PaymentPhase::Initiated,
            (PaymentPhase::Processing, to) => to != PaymentPhase::Initiated,
            _ => false,
        }
    }
}

/// What is sent to the provider for one STK push attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    pub idempotency_key: String,
    /// Normalized to `254XXXXXXXXX`.
    pub phone_number: String,
    /// Whole shillings.
    pub amount: u64,
    pub order_reference: String,
    pub description: String,
}

/// Provider acknowledgement of an accepted STK push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StkPushReceipt {
    pub checkout_request_id: String,
    pub idempotency_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merchant_request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_message: Option<String>,
    pub phone_number: String,
    pub amount: u64,
}

/// Result of one status query or push update, already normalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentStatusReport {
    pub checkout_request_id: String,
    pub status: PaymentStatus,
    pub phase: PaymentPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_desc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_number: Option<String>,
}

/// Asynchronous update delivered on the real-time channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentUpdate {
    pub report: PaymentStatusReport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// Client-side record of an outstanding STK push.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedPayment {
    pub checkout_request_id: String,
    pub order_reference: String,
    pub idempotency_key: String,
    pub amount: u64,
    pub phase: PaymentPhase,
    /// Set by `cancel`; the provider may still complete the payment.
    pub cancelled: bool,
    pub last_report: Option<PaymentStatusReport>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
