//! M-Pesa payments: STK push initiation, status tracking and order
//! reconciliation.

pub mod mpesa_gateway;
pub mod payment_status;
pub mod updates;

pub use mpesa_gateway::{normalize_amount, normalize_phone, MpesaGateway};
pub use payment_status::{PaymentStatusService, WaitOutcome};
pub use updates::{
    interpret_report, parse_stk_callback, result_codes, PaymentSubscription, PaymentUpdateHub,
};
