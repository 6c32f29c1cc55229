use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use super::cart_service::{CartStore, RefreshReport};
use super::product_catalog_service::ProductCatalog;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::notifications::{notify, Notification, NotificationService};

/// Why a sync request did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    EmptyCart,
    InFlight,
    Cooldown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub forced: bool,
    pub fetched: usize,
    pub refresh: RefreshReport,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    Skipped { reason: SkipReason },
    Completed(SyncReport),
}

impl SyncOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, SyncOutcome::Skipped { .. })
    }
}

/// Releases the single-flight flag however the sync ends.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Keeps cart rows in line with the catalog's prices and stock.
pub struct CatalogSyncEngine {
    cart: Arc<CartStore>,
    catalog: Arc<dyn ProductCatalog>,
    notifier: Arc<dyn NotificationService>,
    events: Option<EventSender>,
    cooldown: Duration,
    in_flight: AtomicBool,
    last_attempt: Mutex<Option<Instant>>,
    fetches: AtomicUsize,
}

impl CatalogSyncEngine {
    pub fn new(
        cart: Arc<CartStore>,
        catalog: Arc<dyn ProductCatalog>,
        notifier: Arc<dyn NotificationService>,
        cooldown: Duration,
    ) -> Self {
        Self {
            cart,
            catalog,
            notifier,
            events: None,
            cooldown,
            in_flight: AtomicBool::new(false),
            last_attempt: Mutex::new(None),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    /// Number of catalog fetches performed so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Refreshes cart rows from the catalog.
    ///
    /// Unforced syncs run at most once per cooldown window; the window starts
    /// when an attempt starts, so a failed fetch also counts. Nothing runs
    /// while another sync is in flight or the cart is empty. A failed fetch
    /// leaves the cart untouched and is returned as an error.
    #[instrument(skip(self))]
    pub async fn sync(&self, force: bool) -> Result<SyncOutcome, ServiceError> {
        if self.cart.is_empty().await {
            return Ok(SyncOutcome::Skipped {
                reason: SkipReason::EmptyCart,
            });
        }

        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Catalog sync already running");
            return Ok(SyncOutcome::Skipped {
                reason: SkipReason::InFlight,
            });
        }
        let _flight = FlightGuard(&self.in_flight);

        if !self.start_attempt(force) {
            debug!("Catalog sync within cooldown window");
            return Ok(SyncOutcome::Skipped {
                reason: SkipReason::Cooldown,
            });
        }

        self.fetches.fetch_add(1, Ordering::Relaxed);
        let products = match self.catalog.list_products(None).await {
            Ok(products) => products,
            Err(e) => {
                warn!("Catalog sync aborted, cart left unchanged: {}", e);
                if force {
                    notify(
                        self.notifier.as_ref(),
                        Notification::error(e.user_message()),
                    )
                    .await;
                }
                return Err(e);
            }
        };

        let refresh = self.cart.refresh_from_catalog(&products, force).await?;
        let report = SyncReport {
            forced: force,
            fetched: products.len(),
            refresh,
            completed_at: Utc::now(),
        };

        self.emit(Event::CartSynced {
            updated: report.refresh.updated,
            missing: report.refresh.missing.len(),
            at: report.completed_at,
        })
        .await;

        for line in &report.refresh.newly_out_of_stock {
            self.emit(Event::ItemOutOfStock {
                cart_item_id: line.cart_item_id.clone(),
                name: line.name.clone(),
            })
            .await;
            notify(
                self.notifier.as_ref(),
                Notification::warning(format!("{} is now out of stock", line.name)),
            )
            .await;
        }

        if force {
            notify(
                self.notifier.as_ref(),
                Notification::success("Cart updated with the latest prices and stock"),
            )
            .await;
        }

        info!(
            checked = report.refresh.checked,
            updated = report.refresh.updated,
            missing = report.refresh.missing.len(),
            forced = force,
            "Catalog sync completed"
        );
        Ok(SyncOutcome::Completed(report))
    }

    /// Records the start of an attempt, or refuses it inside the cooldown.
    fn start_attempt(&self, force: bool) -> bool {
        let mut last = match self.last_attempt.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !force {
            if let Some(previous) = *last {
                if previous.elapsed() < self.cooldown {
                    return false;
                }
            }
        }
        *last = Some(Instant::now());
        true
    }

    async fn emit(&self, event: Event) {
        if let Some(events) = &self.events {
            events.send_or_log(event).await;
        }
    }
}

/// Runs unforced syncs every `period` until `shutdown` flips to `true` or
/// its sender is dropped.
pub fn spawn_background_sync(
    engine: Arc<CatalogSyncEngine>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(?period, "Starting background catalog sync");
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = engine.sync(false).await {
                        debug!("Background catalog sync failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Background catalog sync stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{IdValue, Product};
    use crate::notifications::{NotificationLevel, RecordingNotificationService};
    use crate::services::commerce::pricing_service::StorefrontPricing;
    use crate::services::commerce::product_catalog_service::MockProductCatalog;
    use crate::services::commerce::storage::InMemoryCartStorage;
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;

    fn honey(stock: i64) -> Product {
        Product {
            numeric_id: Some(IdValue::Number(42)),
            name: "Baobab Honey".into(),
            price: dec!(1000),
            stock_quantity: Some(stock),
            ..Default::default()
        }
    }

    async fn cart_with_honey(notifier: &RecordingNotificationService) -> Arc<CartStore> {
        let cart = CartStore::open(
            Arc::new(InMemoryCartStorage::new()),
            Arc::new(StorefrontPricing::flat(dec!(300))),
            Arc::new(notifier.clone()),
        )
        .await;
        assert!(cart.add_item(&honey(5), 1).await);
        Arc::new(cart)
    }

    fn catalog_returning(products: Vec<Product>, times: usize) -> MockProductCatalog {
        let mut catalog = MockProductCatalog::new();
        catalog
            .expect_list_products()
            .times(times)
            .returning(move |_| Ok(products.clone()));
        catalog
    }

    #[tokio::test]
    async fn second_unforced_sync_hits_cooldown() {
        let notifier = RecordingNotificationService::new();
        let cart = cart_with_honey(&notifier).await;
        let engine = CatalogSyncEngine::new(
            cart,
            Arc::new(catalog_returning(vec![honey(5)], 1)),
            Arc::new(notifier.clone()),
            Duration::from_secs(300),
        );

        assert_matches!(engine.sync(false).await, Ok(SyncOutcome::Completed(_)));
        assert_matches!(
            engine.sync(false).await,
            Ok(SyncOutcome::Skipped { reason: SkipReason::Cooldown })
        );
        assert_eq!(engine.fetch_count(), 1);
    }

    #[tokio::test]
    async fn forced_sync_ignores_cooldown_and_notifies() {
        let notifier = RecordingNotificationService::new();
        let cart = cart_with_honey(&notifier).await;
        let before = notifier.count_at(NotificationLevel::Success);
        let engine = CatalogSyncEngine::new(
            cart,
            Arc::new(catalog_returning(vec![honey(5)], 2)),
            Arc::new(notifier.clone()),
            Duration::from_secs(300),
        );

        engine.sync(false).await.expect("first sync");
        assert_eq!(notifier.count_at(NotificationLevel::Success), before);
        engine.sync(true).await.expect("forced sync");
        assert_eq!(notifier.count_at(NotificationLevel::Success), before + 1);
    }

    #[tokio::test]
    async fn empty_cart_skips_without_fetching() {
        let notifier = RecordingNotificationService::new();
        let cart = Arc::new(
            CartStore::open(
                Arc::new(InMemoryCartStorage::new()),
                Arc::new(StorefrontPricing::flat(dec!(300))),
                Arc::new(notifier.clone()),
            )
            .await,
        );
        let engine = CatalogSyncEngine::new(
            cart,
            Arc::new(catalog_returning(vec![], 0)),
            Arc::new(notifier),
            Duration::ZERO,
        );
        assert_matches!(
            engine.sync(true).await,
            Ok(SyncOutcome::Skipped { reason: SkipReason::EmptyCart })
        );
    }

    #[tokio::test]
    async fn fetch_failure_leaves_cart_untouched() {
        let notifier = RecordingNotificationService::new();
        let cart = cart_with_honey(&notifier).await;
        let before = cart.items().await;

        let mut catalog = MockProductCatalog::new();
        catalog
            .expect_list_products()
            .returning(|_| Err(ServiceError::transport("offline")));
        let engine = CatalogSyncEngine::new(
            cart.clone(),
            Arc::new(catalog),
            Arc::new(notifier),
            Duration::ZERO,
        );

        assert!(engine.sync(false).await.is_err());
        assert_eq!(cart.items().await, before);
    }

    #[tokio::test]
    async fn out_of_stock_transition_is_announced() {
        let notifier = RecordingNotificationService::new();
        let cart = cart_with_honey(&notifier).await;
        let (events, mut rx) = EventSender::channel(8);
        let engine = CatalogSyncEngine::new(
            cart.clone(),
            Arc::new(catalog_returning(vec![honey(0)], 1)),
            Arc::new(notifier.clone()),
            Duration::ZERO,
        )
        .with_events(events);

        let warnings_before = notifier.count_at(NotificationLevel::Warning);
        engine.sync(false).await.expect("sync");
        assert_eq!(notifier.count_at(NotificationLevel::Warning), warnings_before + 1);
        assert!(!cart.items().await[0].in_stock);

        assert_matches!(rx.recv().await, Some(Event::CartSynced { updated: 1, .. }));
        assert_matches!(rx.recv().await, Some(Event::ItemOutOfStock { .. }));
    }

    #[tokio::test]
    async fn background_loop_stops_on_shutdown() {
        let notifier = RecordingNotificationService::new();
        let cart = cart_with_honey(&notifier).await;
        let mut catalog = MockProductCatalog::new();
        catalog.expect_list_products().returning(|_| Ok(vec![]));
        let engine = Arc::new(CatalogSyncEngine::new(
            cart,
            Arc::new(catalog),
            Arc::new(notifier),
            Duration::ZERO,
        ));

        let (tx, rx) = watch::channel(false);
        let handle = spawn_background_sync(engine.clone(), Duration::from_millis(10), rx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).expect("loop should be listening");
        handle.await.expect("loop should exit cleanly");
        assert!(engine.fetch_count() >= 1);
    }
}
