//! Data shapes shared by the cart, catalog and payment services.

pub mod cart_item;
pub mod order;
pub mod payment;
pub mod product;

pub use cart_item::{CartLineItem, WishlistItem};
pub use order::{CreateOrderRequest, Order, OrderLine, OrderPaymentStatus, PaymentDetails};
pub use payment::{
    PaymentPhase, PaymentRequest, PaymentStatus, PaymentStatusReport, PaymentUpdate,
    StkPushReceipt, TrackedPayment,
};
pub use product::{IdValue, Product, ProductVariant};
