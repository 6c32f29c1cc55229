//! Lindas storefront core
//!
//! Client-side commerce state for the Lindas shop: the cart and wishlist,
//! catalog reconciliation, and M-Pesa STK push checkout against the Lindas
//! order and payment APIs.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod circuit_breaker;
pub mod config;
pub mod errors;
pub mod events;
pub mod models;
pub mod notifications;
pub mod services;
pub mod transport;

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::notifications::{BroadcastNotificationService, NotificationService};
use crate::services::commerce::{
    spawn_background_sync, CartStore, CatalogSyncEngine, FileCartStorage, HttpProductCatalog,
    ProductCatalog, StorefrontPricing,
};
use crate::services::orders::OrderService;
use crate::services::payments::{MpesaGateway, PaymentStatusService, PaymentUpdateHub};
use crate::transport::{HttpTransport, ResilientClient};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Every storefront service, wired against one API deployment.
pub struct Storefront {
    pub config: AppConfig,
    pub cart: Arc<CartStore>,
    pub catalog: Arc<dyn ProductCatalog>,
    pub sync: Arc<CatalogSyncEngine>,
    pub orders: Arc<OrderService>,
    pub payment_status: Arc<PaymentStatusService>,
    pub payments: Arc<MpesaGateway>,
    pub notifications: Arc<BroadcastNotificationService>,
    pub event_sender: EventSender,
    shutdown: watch::Sender<bool>,
}

impl Storefront {
    /// Builds the service graph from `config` and rehydrates the cart from
    /// `config.storage_dir`. Returns the receiving end of the event channel;
    /// pass it to [`events::process_events`] or drain it yourself.
    pub async fn from_config(
        config: &AppConfig,
    ) -> Result<(Self, mpsc::Receiver<Event>), ServiceError> {
        let transport = HttpTransport::from_config(config)?;
        let client = Arc::new(ResilientClient::from_config(Arc::new(transport), config));

        let (event_sender, event_rx) = EventSender::channel(EVENT_CHANNEL_CAPACITY);
        let notifications = Arc::new(BroadcastNotificationService::default());
        let notifier: Arc<dyn NotificationService> = notifications.clone();

        let catalog: Arc<dyn ProductCatalog> = Arc::new(HttpProductCatalog::new(client.clone()));
        let cart = Arc::new(
            CartStore::open(
                Arc::new(FileCartStorage::new(config.storage_dir.clone())),
                Arc::new(StorefrontPricing::from_config(config)),
                notifier.clone(),
            )
            .await
            .with_catalog(catalog.clone())
            .with_events(event_sender.clone())
            .with_stock_policy(config.stock_policy),
        );
        let sync = Arc::new(
            CatalogSyncEngine::new(
                cart.clone(),
                catalog.clone(),
                notifier.clone(),
                config.sync_cooldown(),
            )
            .with_events(event_sender.clone()),
        );

        let orders = Arc::new(OrderService::new(client.clone()));
        let payment_status = Arc::new(
            PaymentStatusService::new(
                client.clone(),
                orders.clone(),
                PaymentUpdateHub::default(),
                notifier.clone(),
            )
            .with_events(event_sender.clone())
            .with_poll_interval(config.payment_poll_interval()),
        );
        let payments = Arc::new(
            MpesaGateway::new(client, payment_status.clone(), notifier)
                .with_events(event_sender.clone()),
        );

        let (shutdown, _) = watch::channel(false);
        info!(api = %config.api_base_url, environment = %config.environment, "Storefront ready");

        Ok((
            Self {
                config: config.clone(),
                cart,
                catalog,
                sync,
                orders,
                payment_status,
                payments,
                notifications,
                event_sender,
                shutdown,
            },
            event_rx,
        ))
    }

    /// Starts the periodic catalog sync. It stops on [`Storefront::shutdown`].
    pub fn spawn_background_sync(&self) -> JoinHandle<()> {
        spawn_background_sync(
            self.sync.clone(),
            self.config.sync_interval(),
            self.shutdown.subscribe(),
        )
    }

    /// Forgets tracked payments and stored order updates older than
    /// `settled_payment_ttl_secs`. Returns how many records were dropped.
    pub fn prune_payment_records(&self) -> usize {
        prune_payment_records(
            &self.payment_status,
            &self.orders,
            self.config.settled_payment_ttl(),
        )
    }

    /// Starts the periodic sweep of expired payment records. It stops on
    /// [`Storefront::shutdown`].
    pub fn spawn_housekeeping(&self) -> JoinHandle<()> {
        let payment_status = self.payment_status.clone();
        let orders = self.orders.clone();
        let ttl = self.config.settled_payment_ttl();
        let period = self.config.housekeeping_interval();
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        prune_payment_records(&payment_status, &orders, ttl);
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Housekeeping stopped");
        })
    }

    /// A receiver that flips to `true` on shutdown; hand it to
    /// [`PaymentStatusService::wait_for_completion`] to stop waiting with
    /// the rest of the storefront.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn shutdown(&self) {
        info!("Storefront shutting down");
        self.shutdown.send_replace(true);
    }
}

fn prune_payment_records(
    payment_status: &PaymentStatusService,
    orders: &OrderService,
    ttl: std::time::Duration,
) -> usize {
    let dropped = payment_status.prune_tracked(ttl) + orders.prune_applied(ttl);
    if dropped > 0 {
        debug!(dropped, "Expired payment records pruned");
    }
    dropped
}
