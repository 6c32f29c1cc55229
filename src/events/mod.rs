use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::models::payment::PaymentStatus;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Creates a sender together with the receiving end of its channel.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when nobody is listening.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.sender.try_send(event) {
            warn!("Dropping storefront event: {}", e);
        }
    }
}

/// Things that happened to the cart, the catalog view or a payment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Event {
    // Cart events
    CartItemAdded {
        cart_item_id: String,
        product_id: String,
        quantity: u32,
    },
    CartItemUpdated {
        cart_item_id: String,
        quantity: u32,
    },
    CartItemRemoved {
        cart_item_id: String,
        product_id: String,
    },
    CartCleared,
    WishlistUpdated {
        item_count: usize,
    },

    // Catalog sync events
    CartSynced {
        updated: usize,
        missing: usize,
        at: DateTime<Utc>,
    },
    ItemOutOfStock {
        cart_item_id: String,
        name: String,
    },

    // Payment events
    PaymentInitiated {
        checkout_request_id: String,
        order_reference: String,
        amount: u64,
    },
    PaymentStatusChanged {
        checkout_request_id: String,
        status: PaymentStatus,
    },
    PaymentCancelled {
        checkout_request_id: String,
    },

    // Order events
    OrderUpdated {
        order_id: String,
        payment_status: String,
        amount_paid: Option<Decimal>,
    },
}

/// Drains an event channel, logging each event. Hosts that need to react to
/// events run their own loop over the receiver instead.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::OrderUpdated { order_id, .. } => {
                info!(order_id = %order_id, "Order updated after payment");
            }
            Event::ItemOutOfStock { name, .. } => {
                warn!(item = %name, "Cart item went out of stock");
            }
            other => debug!("Received event: {:?}", other),
        }
    }

    info!("Event channel closed");
}
