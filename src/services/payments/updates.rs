//! Provider vocabulary, STK callback parsing and the push-update channel.

use chrono::Utc;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::errors::ServiceError;
use crate::models::{PaymentPhase, PaymentStatus, PaymentStatusReport, PaymentUpdate};

/// Known M-Pesa `ResultCode`s.
pub mod result_codes {
    pub const SUCCESS: &str = "0";
    pub const INSUFFICIENT_FUNDS: &str = "1";
    pub const EXPIRED: &str = "1019";
    pub const CANCELLED_BY_USER: &str = "1032";
    pub const USER_UNREACHABLE: &str = "1037";
    pub const STILL_PROCESSING: &str = "4999";
    pub const QUERY_PROCESSING: &str = "500.001.1001";
}

/// Looks up the first of `names` on `body`, ignoring key case.
pub(crate) fn field<'a>(body: &'a Value, names: &[&str]) -> Option<&'a Value> {
    let map = body.as_object()?;
    names.iter().find_map(|name| {
        map.iter()
            .find(|(key, value)| key.eq_ignore_ascii_case(name) && !value.is_null())
            .map(|(_, value)| value)
    })
}

/// Like [`field`], but also looks inside a `data` envelope.
pub(crate) fn field_deep<'a>(body: &'a Value, names: &[&str]) -> Option<&'a Value> {
    field(body, names).or_else(|| field(body, &["data"]).and_then(|data| field(data, names)))
}

const STATUS_FIELDS: &[&str] = &["status", "paymentStatus", "state"];

/// Payment fields of a status body: a `data` envelope is read first, the
/// top level second.
fn payment_field<'a>(body: &'a Value, names: &[&str]) -> Option<&'a Value> {
    envelope(body)
        .and_then(|data| field(data, names))
        .or_else(|| field(body, names))
}

fn envelope(body: &Value) -> Option<&Value> {
    field(body, &["data"]).filter(|data| data.is_object())
}

/// String form of a string or number value; blank strings are `None`.
pub(crate) fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Maps an M-Pesa `ResultCode` to a phase. Unknown codes give `None`.
pub fn phase_for_result_code(code: &str) -> Option<PaymentPhase> {
    use result_codes::*;
    match code.trim() {
        SUCCESS => Some(PaymentPhase::Completed),
        INSUFFICIENT_FUNDS | CANCELLED_BY_USER => Some(PaymentPhase::Failed),
        EXPIRED | USER_UNREACHABLE => Some(PaymentPhase::Timeout),
        STILL_PROCESSING | QUERY_PROCESSING => Some(PaymentPhase::Processing),
        _ => None,
    }
}

/// Maps the status words different API generations use. Anything not
/// recognised is treated as still in progress.
pub fn phase_for_status_text(status: &str) -> PaymentPhase {
    match status.trim().to_ascii_lowercase().as_str() {
        "completed" | "complete" | "success" | "successful" | "succeeded" | "paid" => {
            PaymentPhase::Completed
        }
        "failed" | "failure" | "cancelled" | "canceled" | "declined" | "rejected" | "error" => {
            PaymentPhase::Failed
        }
        "timeout" | "timed_out" | "expired" => PaymentPhase::Timeout,
        "initiated" => PaymentPhase::Initiated,
        other => {
            if !matches!(other, "pending" | "processing" | "in_progress" | "queued") {
                debug!(status = other, "Unrecognised payment status, treating as pending");
            }
            PaymentPhase::Processing
        }
    }
}

/// Builds a normalized report from a status-query response or callback body.
///
/// A recognised `ResultCode` wins over a status word, since the code is the
/// provider's own verdict. When the body wraps its payload in `data`, the
/// top-level `status` describes the API call, not the payment, and is
/// ignored.
pub fn interpret_report(checkout_request_id: &str, body: &Value) -> PaymentStatusReport {
    let result_code =
        payment_field(body, &["ResultCode", "result_code", "errorCode"]).and_then(text);
    let result_desc = payment_field(
        body,
        &["ResultDesc", "result_desc", "errorMessage", "message"],
    )
    .and_then(text);
    let status_text = match envelope(body) {
        Some(data) => field(data, STATUS_FIELDS),
        None => field(body, STATUS_FIELDS),
    }
    .and_then(text);
    let receipt_number = payment_field(
        body,
        &["MpesaReceiptNumber", "mpesaReceiptNumber", "receiptNumber"],
    )
    .and_then(text);

    let phase = result_code
        .as_deref()
        .and_then(phase_for_result_code)
        .or_else(|| status_text.as_deref().map(phase_for_status_text))
        .unwrap_or_else(|| {
            if let Some(code) = &result_code {
                debug!(code = %code, "Unrecognised result code, treating as pending");
            }
            PaymentPhase::Processing
        });

    PaymentStatusReport {
        checkout_request_id: checkout_request_id.to_string(),
        status: phase.status(),
        phase,
        result_code,
        result_desc,
        receipt_number,
    }
}

/// Parses the provider's STK callback (`Body.stkCallback`) into an update.
pub fn parse_stk_callback(payload: &Value) -> Result<PaymentUpdate, ServiceError> {
    let callback = payload
        .pointer("/Body/stkCallback")
        .or_else(|| field(payload, &["stkCallback"]))
        .unwrap_or(payload);

    let checkout_request_id = field(callback, &["CheckoutRequestID", "checkoutRequestId"])
        .and_then(text)
        .ok_or_else(|| {
            ServiceError::ValidationError("Callback has no CheckoutRequestID".to_string())
        })?;

    let mut report = interpret_report(&checkout_request_id, callback);
    let mut amount = None;
    let mut phone_number = None;

    let items = field(callback, &["CallbackMetadata"])
        .and_then(|meta| field(meta, &["Item"]))
        .and_then(Value::as_array);
    for item in items.into_iter().flatten() {
        let name = field(item, &["Name"]).and_then(Value::as_str).unwrap_or_default();
        let value = field(item, &["Value"]);
        match name {
            "MpesaReceiptNumber" => report.receipt_number = value.and_then(text),
            "Amount" => {
                amount = value
                    .and_then(Value::as_f64)
                    .filter(|a| *a >= 0.0)
                    .map(|a| a.round() as u64)
            }
            "PhoneNumber" => phone_number = value.and_then(text),
            _ => {}
        }
    }

    Ok(PaymentUpdate {
        report,
        amount,
        phone_number,
        received_at: Utc::now(),
    })
}

/// Fan-out channel for asynchronous payment updates.
#[derive(Clone)]
pub struct PaymentUpdateHub {
    sender: broadcast::Sender<PaymentUpdate>,
}

impl PaymentUpdateHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns the number of subscribers that received the update.
    pub fn publish(&self, update: PaymentUpdate) -> usize {
        self.sender.send(update).unwrap_or(0)
    }

    /// Updates for one checkout request only.
    pub fn subscribe(&self, checkout_request_id: &str) -> PaymentSubscription {
        PaymentSubscription {
            checkout_request_id: checkout_request_id.to_string(),
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for PaymentUpdateHub {
    fn default() -> Self {
        Self::new(64)
    }
}

pub struct PaymentSubscription {
    checkout_request_id: String,
    receiver: broadcast::Receiver<PaymentUpdate>,
}

impl PaymentSubscription {
    /// Next update for this checkout request; `None` once the hub is gone.
    pub async fn next(&mut self) -> Option<PaymentUpdate> {
        loop {
            match self.receiver.recv().await {
                Ok(update) if update.report.checkout_request_id == self.checkout_request_id => {
                    return Some(update)
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Payment update subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case(json!({"ResultCode": "0", "ResultDesc": "Success"}), PaymentStatus::Completed)]
    #[case(json!({"ResultCode": 0}), PaymentStatus::Completed)]
    #[case(json!({"ResultCode": "1032", "ResultDesc": "Request cancelled by user"}), PaymentStatus::Failed)]
    #[case(json!({"ResultCode": 1037}), PaymentStatus::Failed)]
    #[case(json!({"errorCode": "500.001.1001"}), PaymentStatus::Pending)]
    #[case(json!({"status": "COMPLETED"}), PaymentStatus::Completed)]
    #[case(json!({"data": {"status": "failed"}}), PaymentStatus::Failed)]
    #[case(json!({"status": "success", "data": {"status": "pending"}}), PaymentStatus::Pending)]
    #[case(json!({"status": "success", "data": {"checkoutRequestId": "ws_CO_1"}}), PaymentStatus::Pending)]
    #[case(json!({"status": "success", "data": {"paymentStatus": "completed"}}), PaymentStatus::Completed)]
    #[case(json!({"success": true, "data": {"ResultCode": "1032"}}), PaymentStatus::Failed)]
    #[case(json!({"status": "awaiting_pin_entry"}), PaymentStatus::Pending)]
    #[case(json!({"ResultCode": "77777"}), PaymentStatus::Pending)]
    #[case(json!({}), PaymentStatus::Pending)]
    fn normalizes_provider_vocabulary(#[case] body: Value, #[case] expected: PaymentStatus) {
        assert_eq!(interpret_report("ws_CO_1", &body).status, expected);
    }

    #[test]
    fn timeout_codes_keep_their_phase() {
        let report = interpret_report("ws_CO_1", &json!({"ResultCode": "1019"}));
        assert_eq!(report.phase, PaymentPhase::Timeout);
        assert_eq!(report.status, PaymentStatus::Failed);
    }

    #[test]
    fn parses_successful_callback() {
        let payload = json!({
            "Body": {"stkCallback": {
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": "ws_CO_191220191020363925",
                "ResultCode": 0,
                "ResultDesc": "The service request is processed successfully.",
                "CallbackMetadata": {"Item": [
                    {"Name": "Amount", "Value": 2300.00},
                    {"Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV"},
                    {"Name": "TransactionDate", "Value": 20191219102115u64},
                    {"Name": "PhoneNumber", "Value": 254700000000u64}
                ]}
            }}
        });

        let update = parse_stk_callback(&payload).expect("callback should parse");
        assert_eq!(update.report.checkout_request_id, "ws_CO_191220191020363925");
        assert_eq!(update.report.status, PaymentStatus::Completed);
        assert_eq!(update.report.receipt_number.as_deref(), Some("NLJ7RT61SV"));
        assert_eq!(update.amount, Some(2300));
        assert_eq!(update.phone_number.as_deref(), Some("254700000000"));
    }

    #[test]
    fn cancelled_callback_has_no_metadata() {
        let payload = json!({"Body": {"stkCallback": {
            "CheckoutRequestID": "ws_CO_2",
            "ResultCode": 1032,
            "ResultDesc": "Request cancelled by user"
        }}});
        let update = parse_stk_callback(&payload).expect("callback should parse");
        assert_eq!(update.report.status, PaymentStatus::Failed);
        assert_eq!(update.amount, None);
    }

    #[test]
    fn callback_without_checkout_id_is_rejected() {
        assert!(parse_stk_callback(&json!({"Body": {"stkCallback": {"ResultCode": 0}}})).is_err());
    }

    #[tokio::test]
    async fn subscription_filters_by_checkout_id() {
        let hub = PaymentUpdateHub::new(8);
        let mut subscription = hub.subscribe("ws_CO_2");

        for id in ["ws_CO_1", "ws_CO_2"] {
            hub.publish(PaymentUpdate {
                report: interpret_report(id, &json!({"ResultCode": "0"})),
                amount: None,
                phone_number: None,
                received_at: Utc::now(),
            });
        }

        let update = subscription.next().await.expect("update");
        assert_eq!(update.report.checkout_request_id, "ws_CO_2");
    }
}
