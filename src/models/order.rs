use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use validator::Validate;

/// Payment state of an order as the Order Service reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum OrderPaymentStatus {
    #[default]
    Pending,
    Processing,
    #[serde(alias = "completed")]
    #[strum(to_string = "paid", serialize = "completed")]
    Paid,
    Failed,
}

/// Order record, owned by the Order Service. Only the fields this crate
/// reads are modelled; everything else is kept verbatim in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_number: Option<String>,
    #[serde(default)]
    pub payment_status: OrderPaymentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_amount: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_details: Option<PaymentDetails>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Confirmed payment attached to an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PaymentDetails {
    #[validate(length(min = 1))]
    pub checkout_request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mpesa_receipt_number: Option<String>,
    pub amount: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default = "default_payment_method")]
    pub payment_method: String,
    #[serde(default = "default_paid_status")]
    pub status: OrderPaymentStatus,
    pub paid_at: DateTime<Utc>,
}

fn default_payment_method() -> String {
    "mpesa".to_string()
}

fn default_paid_status() -> OrderPaymentStatus {
    OrderPaymentStatus::Paid
}

impl PaymentDetails {
    pub fn mpesa(checkout_request_id: impl Into<String>, amount: Decimal) -> Self {
        Self {
            checkout_request_id: checkout_request_id.into(),
            mpesa_receipt_number: None,
            amount,
            phone_number: None,
            payment_method: default_payment_method(),
            status: OrderPaymentStatus::Paid,
            paid_at: Utc::now(),
        }
    }
}

/// Line sent to `POST /orders`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLine {
    pub product_id: String,
    pub name: String,
    pub quantity: u32,
    pub price: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

/// Body of `POST /orders`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    #[validate(length(min = 1))]
    pub items: Vec<OrderLine>,
    pub subtotal: Decimal,
    pub shipping_fee: Decimal,
    pub total_amount: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(default = "default_payment_method")]
    pub payment_method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shipping_address: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::str::FromStr;

    #[test]
    fn order_accepts_mongo_id_and_keeps_extra_fields() {
        let order: Order = serde_json::from_value(json!({
            "_id": "66aa",
            "orderNumber": "ORD-1",
            "paymentStatus": "completed",
            "totalAmount": 2300,
            "customer": {"name": "Wanjiku"}
        }))
        .expect("order should deserialize");

        assert_eq!(order.id, "66aa");
        assert_eq!(order.payment_status, OrderPaymentStatus::Paid);
        assert!(order.extra.contains_key("customer"));
    }

    #[test]
    fn payment_status_parses_case_insensitively() {
        assert_eq!(
            OrderPaymentStatus::from_str("PAID").expect("parse"),
            OrderPaymentStatus::Paid
        );
        assert_eq!(OrderPaymentStatus::Paid.to_string(), "paid");
    }

    #[test]
    fn empty_order_request_fails_validation() {
        let request = CreateOrderRequest {
            items: vec![],
            subtotal: Decimal::ZERO,
            shipping_fee: Decimal::ZERO,
            total_amount: Decimal::ZERO,
            phone_number: None,
            payment_method: "mpesa".into(),
            shipping_address: None,
        };
        assert!(request.validate().is_err());
    }
}
