use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::identity::{
    matches_line, normalize, product_key, refers_to, refers_to_key, ItemRef, StoredIdentity,
};
use super::pricing_service::{compute_totals, CartTotals, PricingPolicy};
use super::product_catalog_service::ProductCatalog;
use super::storage::{CartStorage, CART_STORAGE_KEY, WISHLIST_STORAGE_KEY};
use crate::config::StockPolicy;
use crate::errors::{ServiceError, Severity};
use crate::events::{Event, EventSender};
use crate::models::{CartLineItem, Product, WishlistItem};
use crate::notifications::{notify, Notification, NotificationService};

/// What a catalog refresh did to the cart.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshReport {
    pub checked: usize,
    pub updated: usize,
    /// `cartItemId`s of rows the catalog no longer lists. They are kept as-is.
    pub missing: Vec<String>,
    /// Rows that were in stock before this refresh and are not any more.
    pub newly_out_of_stock: Vec<CartLineItem>,
}

/// Result of checking a requested quantity against known stock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StockCheck {
    Within(u32),
    /// Quantity lowered to the stock ceiling.
    Clamped(u32),
    /// Quantity kept above known stock; only a warning is raised.
    Exceeds { quantity: u32, stock: i64 },
}

impl StockCheck {
    fn evaluate(wanted: u32, stock: Option<i64>, policy: StockPolicy) -> Self {
        let Some(stock) = stock else {
            return StockCheck::Within(wanted);
        };
        if i64::from(wanted) <= stock {
            return StockCheck::Within(wanted);
        }
        match policy {
            StockPolicy::Enforce => {
                StockCheck::Clamped(u32::try_from(stock.max(1)).unwrap_or(u32::MAX))
            }
            StockPolicy::Warn => StockCheck::Exceeds {
                quantity: wanted,
                stock,
            },
        }
    }

    fn quantity(self) -> u32 {
        match self {
            StockCheck::Within(q) | StockCheck::Clamped(q) => q,
            StockCheck::Exceeds { quantity, .. } => quantity,
        }
    }
}

#[derive(Debug, Default)]
struct CartState {
    items: Vec<CartLineItem>,
    wishlist: Vec<WishlistItem>,
}

fn items_of(state: &mut CartState) -> &mut Vec<CartLineItem> {
    &mut state.items
}

fn wishlist_of(state: &mut CartState) -> &mut Vec<WishlistItem> {
    &mut state.wishlist
}

/// The shopper's cart and wishlist.
///
/// All mutation goes through this type. Each mutation is applied to a copy of
/// the collection, persisted, and only then made visible, so a storage failure
/// leaves the cart exactly as it was. Business-rule failures (unknown product,
/// zero quantity, item not in cart) are reported through the notification
/// service and a `false` return, never as errors.
pub struct CartStore {
    state: RwLock<CartState>,
    storage: Arc<dyn CartStorage>,
    pricing: Arc<dyn PricingPolicy>,
    notifier: Arc<dyn NotificationService>,
    catalog: Option<Arc<dyn ProductCatalog>>,
    events: Option<EventSender>,
    stock_policy: StockPolicy,
}

impl CartStore {
    /// Rehydrates the cart and wishlist from `storage`. Missing or unreadable
    /// documents give an empty collection.
    pub async fn open(
        storage: Arc<dyn CartStorage>,
        pricing: Arc<dyn PricingPolicy>,
        notifier: Arc<dyn NotificationService>,
    ) -> Self {
        let items = sanitize_items(load_collection(storage.as_ref(), CART_STORAGE_KEY).await);
        let wishlist =
            sanitize_wishlist(load_collection(storage.as_ref(), WISHLIST_STORAGE_KEY).await);
        info!(
            items = items.len(),
            wishlist = wishlist.len(),
            "Cart rehydrated from storage"
        );

        Self {
            state: RwLock::new(CartState { items, wishlist }),
            storage,
            pricing,
            notifier,
            catalog: None,
            events: None,
            stock_policy: StockPolicy::default(),
        }
    }

    /// Product source used to refresh an item as it is added.
    pub fn with_catalog(mut self, catalog: Arc<dyn ProductCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_stock_policy(mut self, policy: StockPolicy) -> Self {
        self.stock_policy = policy;
        self
    }

    // ---------------------------------------------------------------------
    // Cart mutations
    // ---------------------------------------------------------------------

    /// Adds `quantity` of `product`, merging into an existing row that holds
    /// the same product: same canonical key, or a shared raw id under the same
    /// package size.
    ///
    /// The row is written with the caller's data straight away; fresher data
    /// from the catalog is then backfilled into it when the lookup succeeds.
    #[instrument(skip(self, product), fields(product = %product.name))]
    pub async fn add_item(&self, product: &Product, quantity: u32) -> bool {
        if quantity == 0 {
            self.send(Notification::warning("Quantity must be at least 1.")).await;
            return false;
        }

        let Some(key) = product_key(product) else {
            warn!("Product has no usable identity, refusing to add it");
            self.send(Notification::error(format!(
                "{} cannot be added to the cart right now.",
                display_name(&product.name)
            )))
            .await;
            return false;
        };

        if !product.is_available() {
            if self.stock_policy == StockPolicy::Enforce {
                self.send(Notification::warning(format!(
                    "{} is out of stock.",
                    display_name(&product.name)
                )))
                .await;
                return false;
            }
            warn!(product_id = %key, "Adding an item reported out of stock");
        }

        let policy = self.stock_policy;
        let line_key = key.clone();
        let result = self
            .mutate_items(move |items| {
                let now = Utc::now();
                let existing = items
                    .iter()
                    .position(|line| line.product_id == line_key)
                    .or_else(|| {
                        items
                            .iter()
                            .position(|line| refers_to(line, product, &line_key))
                    });
                let line = match existing {
                    Some(index) => {
                        let line = &mut items[index];
                        line.remember_ids(product);
                        line.absorb(product);
                        line.quantity = line.quantity.saturating_add(quantity);
                        line.updated_at = now;
                        line
                    }
                    None => {
                        items.push(CartLineItem::from_product(product, line_key, quantity));
                        let last = items.len() - 1;
                        &mut items[last]
                    }
                };
                let check = StockCheck::evaluate(line.quantity, line.stock_quantity, policy);
                line.quantity = check.quantity();
                Ok((line.clone(), check))
            })
            .await;

        let (line, check) = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                self.report_failure("add item to cart", &e).await;
                return false;
            }
        };

        self.emit(Event::CartItemAdded {
            cart_item_id: line.cart_item_id.clone(),
            product_id: line.product_id.clone(),
            quantity: line.quantity,
        })
        .await;
        info!(
            cart_item_id = %line.cart_item_id,
            product_id = %line.product_id,
            quantity = line.quantity,
            "Added item to cart"
        );

        self.backfill_from_catalog(product, &line.cart_item_id).await;
        self.notify_stock(&line.name, check).await;
        self.send(Notification::success(format!(
            "{} added to cart",
            display_name(&line.name)
        )))
        .await;
        true
    }

    /// Removes the row `reference` points at.
    #[instrument(skip(self, reference))]
    pub async fn remove_item<'a>(&self, reference: impl Into<ItemRef<'a>>) -> bool {
        let reference = reference.into();
        let Some(key) = normalize(reference) else {
            self.reject_reference().await;
            return false;
        };

        let result = self
            .mutate_items(|items| {
                let index = find_row(items, reference, &key)
                    .ok_or_else(|| ServiceError::NotFound(format!("Cart item {}", key)))?;
                Ok(items.remove(index))
            })
            .await;

        match result {
            Ok(removed) => {
                self.emit(Event::CartItemRemoved {
                    cart_item_id: removed.cart_item_id.clone(),
                    product_id: removed.product_id.clone(),
                })
                .await;
                info!(cart_item_id = %removed.cart_item_id, "Removed item from cart");
                self.send(Notification::info(format!(
                    "{} removed from cart",
                    display_name(&removed.name)
                )))
                .await;
                true
            }
            Err(ServiceError::NotFound(_)) => {
                debug!(key = %key, "Remove requested for an item not in the cart");
                self.send(Notification::info("That item is no longer in your cart."))
                    .await;
                false
            }
            Err(e) => {
                self.report_failure("remove item from cart", &e).await;
                false
            }
        }
    }

    /// Sets the quantity of a row. Zero or less removes it; a known stock
    /// level caps it (or only warns, under [`StockPolicy::Warn`]).
    #[instrument(skip(self, reference))]
    pub async fn update_quantity<'a>(
        &self,
        reference: impl Into<ItemRef<'a>>,
        new_quantity: i64,
    ) -> bool {
        let reference = reference.into();
        if new_quantity <= 0 {
            return self.remove_item(reference).await;
        }

        let Some(key) = normalize(reference) else {
            self.reject_reference().await;
            return false;
        };

        let wanted = u32::try_from(new_quantity).unwrap_or(u32::MAX);
        let policy = self.stock_policy;
        let result = self
            .mutate_items(|items| {
                let index = find_row(items, reference, &key)
                    .ok_or_else(|| ServiceError::NotFound(format!("Cart item {}", key)))?;
                let line = &mut items[index];
                let check = StockCheck::evaluate(wanted, line.stock_quantity, policy);
                line.quantity = check.quantity();
                line.updated_at = Utc::now();
                Ok((line.clone(), check))
            })
            .await;

        match result {
            Ok((line, check)) => {
                self.emit(Event::CartItemUpdated {
                    cart_item_id: line.cart_item_id.clone(),
                    quantity: line.quantity,
                })
                .await;
                self.notify_stock(&line.name, check).await;
                true
            }
            Err(ServiceError::NotFound(_)) => {
                self.send(Notification::info("That item is no longer in your cart."))
                    .await;
                false
            }
            Err(e) => {
                self.report_failure("update cart quantity", &e).await;
                false
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn clear_cart(&self) -> bool {
        match self.discard(CART_STORAGE_KEY, items_of).await {
            Ok(()) => {
                self.emit(Event::CartCleared).await;
                info!("Cart cleared");
                self.send(Notification::info("Cart cleared")).await;
                true
            }
            Err(e) => {
                self.report_failure("clear cart", &e).await;
                false
            }
        }
    }

    /// Applies authoritative product data to every row. This is the only
    /// path by which catalog sync touches the cart.
    ///
    /// Rows whose product is absent from `products` are left untouched and
    /// listed in the report. With `force`, every found row is rewritten and
    /// re-stamped even when nothing changed.
    pub async fn refresh_from_catalog(
        &self,
        products: &[Product],
        force: bool,
    ) -> Result<RefreshReport, ServiceError> {
        let index = ProductIndex::build(products);
        self.mutate_items(|items| {
            let now = Utc::now();
            let mut report = RefreshReport::default();
            for line in items.iter_mut() {
                report.checked += 1;
                let Some(fresh) = index.lookup(line) else {
                    warn!(
                        cart_item_id = %line.cart_item_id,
                        product_id = %line.product_id,
                        "Cart item not found in catalog, leaving it unchanged"
                    );
                    report.missing.push(line.cart_item_id.clone());
                    continue;
                };

                let was_in_stock = line.in_stock;
                if line.absorb(fresh) {
                    report.updated += 1;
                } else if force {
                    line.updated_at = now;
                }
                if was_in_stock && !line.in_stock {
                    report.newly_out_of_stock.push(line.clone());
                }
            }
            Ok(report)
        })
        .await
    }

    // ---------------------------------------------------------------------
    // Wishlist
    // ---------------------------------------------------------------------

    #[instrument(skip(self, product), fields(product = %product.name))]
    pub async fn add_to_wishlist(&self, product: &Product) -> bool {
        let Some(key) = product_key(product) else {
            self.send(Notification::error(format!(
                "{} cannot be saved right now.",
                display_name(&product.name)
            )))
            .await;
            return false;
        };

        let result = self
            .mutate_wishlist(|wishlist| {
                if wishlist.iter().any(|entry| refers_to(entry, product, &key)) {
                    return Ok((false, wishlist.len()));
                }
                wishlist.push(WishlistItem::from_product(product, key.clone()));
                Ok((true, wishlist.len()))
            })
            .await;

        match result {
            Ok((added, count)) => {
                if added {
                    self.emit(Event::WishlistUpdated { item_count: count }).await;
                    self.send(Notification::success(format!(
                        "{} saved to your wishlist",
                        display_name(&product.name)
                    )))
                    .await;
                } else {
                    self.send(Notification::info("Already in your wishlist")).await;
                }
                true
            }
            Err(e) => {
                self.report_failure("add to wishlist", &e).await;
                false
            }
        }
    }

    #[instrument(skip(self, reference))]
    pub async fn remove_from_wishlist<'a>(&self, reference: impl Into<ItemRef<'a>>) -> bool {
        let Some(key) = normalize(reference.into()) else {
            self.reject_reference().await;
            return false;
        };
        match self.take_from_wishlist(&key).await {
            Ok(_) => true,
            Err(ServiceError::NotFound(_)) => {
                self.send(Notification::info("That item is not in your wishlist."))
                    .await;
                false
            }
            Err(e) => {
                self.report_failure("remove from wishlist", &e).await;
                false
            }
        }
    }

    pub async fn is_in_wishlist<'a>(&self, reference: impl Into<ItemRef<'a>>) -> bool {
        let reference = reference.into();
        let Some(key) = normalize(reference) else {
            return false;
        };
        let state = self.state.read().await;
        match reference {
            ItemRef::Product(product) => state
                .wishlist
                .iter()
                .any(|entry| refers_to(entry, product, &key)),
            _ => locate_wishlist(&state.wishlist, &key).is_some(),
        }
    }

    #[instrument(skip(self))]
    pub async fn clear_wishlist(&self) -> bool {
        match self.discard(WISHLIST_STORAGE_KEY, wishlist_of).await {
            Ok(()) => {
                self.emit(Event::WishlistUpdated { item_count: 0 }).await;
                true
            }
            Err(e) => {
                self.report_failure("clear wishlist", &e).await;
                false
            }
        }
    }

    /// Moves a wishlist entry into the cart with quantity 1.
    #[instrument(skip(self, reference))]
    pub async fn move_to_cart<'a>(&self, reference: impl Into<ItemRef<'a>>) -> bool {
        let Some(key) = normalize(reference.into()) else {
            self.reject_reference().await;
            return false;
        };

        let entry = {
            let state = self.state.read().await;
            locate_wishlist(&state.wishlist, &key).map(|index| state.wishlist[index].clone())
        };
        let Some(entry) = entry else {
            self.send(Notification::info("That item is not in your wishlist."))
                .await;
            return false;
        };

        if !self.add_item(&entry.to_product(), 1).await {
            return false;
        }
        if let Err(e) = self.take_from_wishlist(&entry.product_id).await {
            warn!("Item moved to cart but could not be dropped from wishlist: {}", e);
        }
        true
    }

    async fn take_from_wishlist(&self, key: &str) -> Result<WishlistItem, ServiceError> {
        let (removed, count) = self
            .mutate_wishlist(|wishlist| {
                let index = locate_wishlist(wishlist, key)
                    .ok_or_else(|| ServiceError::NotFound(format!("Wishlist item {}", key)))?;
                let removed = wishlist.remove(index);
                Ok((removed, wishlist.len()))
            })
            .await?;
        self.emit(Event::WishlistUpdated { item_count: count }).await;
        Ok(removed)
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    pub async fn items(&self) -> Vec<CartLineItem> {
        self.state.read().await.items.clone()
    }

    pub async fn wishlist(&self) -> Vec<WishlistItem> {
        self.state.read().await.wishlist.clone()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.items.is_empty()
    }

    /// Total number of units across all rows.
    pub async fn item_count(&self) -> u32 {
        self.state
            .read()
            .await
            .items
            .iter()
            .map(|line| line.quantity)
            .sum()
    }

    pub async fn is_in_cart<'a>(&self, reference: impl Into<ItemRef<'a>>) -> bool {
        self.item_quantity(reference).await > 0
    }

    /// Quantity of the row `reference` points at, or 0.
    pub async fn item_quantity<'a>(&self, reference: impl Into<ItemRef<'a>>) -> u32 {
        let reference = reference.into();
        let Some(key) = normalize(reference) else {
            return 0;
        };
        let state = self.state.read().await;
        find_row(&state.items, reference, &key)
            .map(|index| state.items[index].quantity)
            .unwrap_or(0)
    }

    /// Totals for the current cart. Tax and discount are whatever the
    /// configured [`PricingPolicy`] makes of them.
    pub async fn cart_totals(&self, discount_code: Option<&str>) -> CartTotals {
        let state = self.state.read().await;
        compute_totals(self.pricing.as_ref(), &state.items, discount_code)
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    async fn backfill_from_catalog(&self, product: &Product, cart_item_id: &str) {
        let (Some(catalog), Some(id)) = (&self.catalog, product.raw_id()) else {
            return;
        };

        let fresh = match catalog.get_product(&id).await {
            Ok(Some(fresh)) => fresh,
            Ok(None) => {
                debug!(product_id = %id, "Catalog has no record for added item");
                return;
            }
            Err(e) => {
                debug!(product_id = %id, "Catalog refresh failed, keeping caller data: {}", e);
                return;
            }
        };

        let policy = self.stock_policy;
        let result = self
            .mutate_items(|items| {
                if let Some(line) = items
                    .iter_mut()
                    .find(|line| line.cart_item_id == cart_item_id)
                {
                    line.absorb(&fresh);
                    if let StockCheck::Clamped(q) =
                        StockCheck::evaluate(line.quantity, line.stock_quantity, policy)
                    {
                        line.quantity = q;
                    }
                }
                Ok(())
            })
            .await;
        if let Err(e) = result {
            warn!(product_id = %id, "Could not store refreshed catalog data: {}", e);
        }
    }

    async fn mutate_items<R, F>(&self, f: F) -> Result<R, ServiceError>
    where
        F: FnOnce(&mut Vec<CartLineItem>) -> Result<R, ServiceError>,
    {
        self.mutate(CART_STORAGE_KEY, items_of, f).await
    }

    async fn mutate_wishlist<R, F>(&self, f: F) -> Result<R, ServiceError>
    where
        F: FnOnce(&mut Vec<WishlistItem>) -> Result<R, ServiceError>,
    {
        self.mutate(WISHLIST_STORAGE_KEY, wishlist_of, f).await
    }

    async fn mutate<T, R, F>(
        &self,
        key: &str,
        select: fn(&mut CartState) -> &mut Vec<T>,
        f: F,
    ) -> Result<R, ServiceError>
    where
        T: Clone + PartialEq + Serialize,
        F: FnOnce(&mut Vec<T>) -> Result<R, ServiceError>,
    {
        let mut state = self.state.write().await;
        let current = select(&mut *state);
        let mut draft = current.clone();
        let result = f(&mut draft)?;

        if draft != *current {
            let json = serde_json::to_string(&draft)?;
            self.storage.save(key, &json).await?;
            *current = draft;
        }
        Ok(result)
    }

    /// Drops the stored document under `key`, then empties the collection.
    async fn discard<T>(
        &self,
        key: &str,
        select: fn(&mut CartState) -> &mut Vec<T>,
    ) -> Result<(), ServiceError> {
        let mut state = self.state.write().await;
        self.storage.remove(key).await?;
        select(&mut *state).clear();
        Ok(())
    }

    async fn notify_stock(&self, name: &str, check: StockCheck) {
        match check {
            StockCheck::Within(_) => {}
            StockCheck::Clamped(q) => {
                self.send(Notification::warning(format!(
                    "Only {} of {} available",
                    q,
                    display_name(name)
                )))
                .await
            }
            StockCheck::Exceeds { stock, .. } => {
                warn!(item = %name, stock, "Quantity exceeds known stock");
                self.send(Notification::warning(format!(
                    "Only {} of {} in stock; your order may be delayed",
                    stock.max(0),
                    display_name(name)
                )))
                .await
            }
        }
    }

    async fn reject_reference(&self) {
        warn!("Cart operation with an unresolvable item reference");
        self.send(Notification::error("That item could not be found.")).await;
    }

    async fn report_failure(&self, action: &str, err: &ServiceError) {
        match err.severity() {
            Severity::Recoverable => warn!("Failed to {}: {}", action, err),
            Severity::Degraded | Severity::Critical => error!("Failed to {}: {}", action, err),
        }
        self.send(Notification::error(err.user_message())).await;
    }

    async fn send(&self, notification: Notification) {
        notify(self.notifier.as_ref(), notification).await;
    }

    async fn emit(&self, event: Event) {
        if let Some(events) = &self.events {
            events.send_or_log(event).await;
        }
    }
}

/// Row lookup for a reference: a product record matches by shared identity,
/// anything else goes through [`locate`].
fn find_row(items: &[CartLineItem], reference: ItemRef<'_>, key: &str) -> Option<usize> {
    let by_product = match reference {
        ItemRef::Product(product) => items.iter().position(|line| refers_to(line, product, key)),
        _ => None,
    };
    by_product.or_else(|| locate(items, key))
}

/// Row lookup by `cartItemId`, product key under any known raw id, then a
/// unique catalog id.
fn locate(items: &[CartLineItem], key: &str) -> Option<usize> {
    items
        .iter()
        .position(|line| matches_line(line, key))
        .or_else(|| unique_position(items, key))
}

fn locate_wishlist(wishlist: &[WishlistItem], key: &str) -> Option<usize> {
    wishlist
        .iter()
        .position(|entry| refers_to_key(entry, key))
        .or_else(|| unique_position(wishlist, key))
}

/// A bare catalog id only selects a row when exactly one row carries it;
/// otherwise it would be ambiguous between package sizes.
fn unique_position<T: StoredIdentity>(stored: &[T], key: &str) -> Option<usize> {
    let mut hits = stored
        .iter()
        .enumerate()
        .filter(|(_, entry)| entry.known_ids().contains(&key))
        .map(|(index, _)| index);
    match (hits.next(), hits.next()) {
        (Some(index), None) => Some(index),
        _ => None,
    }
}

struct ProductIndex<'a> {
    by_id: HashMap<String, &'a Product>,
    by_sku: HashMap<String, &'a Product>,
}

impl<'a> ProductIndex<'a> {
    fn build(products: &'a [Product]) -> Self {
        let mut by_id = HashMap::new();
        let mut by_sku = HashMap::new();
        for product in products {
            for id in product.all_ids() {
                by_id.entry(id).or_insert(product);
            }
            if let Some(sku) = product.sku.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                by_sku.entry(sku.to_string()).or_insert(product);
            }
        }
        Self { by_id, by_sku }
    }

    fn lookup(&self, line: &CartLineItem) -> Option<&'a Product> {
        line.known_ids()
            .into_iter()
            .find_map(|id| self.by_id.get(id))
            .or_else(|| line.sku.as_deref().and_then(|sku| self.by_sku.get(sku)))
            .copied()
    }
}

async fn load_collection<T: DeserializeOwned>(storage: &dyn CartStorage, key: &str) -> Vec<T> {
    let raw = match storage.load(key).await {
        Ok(Some(raw)) => raw,
        Ok(None) => return Vec::new(),
        Err(e) => {
            warn!(key, "Could not read stored collection, starting empty: {}", e);
            return Vec::new();
        }
    };

    match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Array(entries)) => entries
            .into_iter()
            .filter_map(|entry| match serde_json::from_value(entry) {
                Ok(item) => Some(item),
                Err(e) => {
                    warn!(key, "Dropping unreadable stored entry: {}", e);
                    None
                }
            })
            .collect(),
        Ok(_) | Err(_) => {
            warn!(key, "Stored collection is corrupt, starting empty");
            Vec::new()
        }
    }
}

/// Restores the one-row-per-identity invariant on data read back from storage.
fn sanitize_items(items: Vec<CartLineItem>) -> Vec<CartLineItem> {
    let mut out: Vec<CartLineItem> = Vec::with_capacity(items.len());
    for mut item in items {
        if item.quantity == 0 || item.product_id.trim().is_empty() {
            continue;
        }
        if item.cart_item_id.trim().is_empty() {
            item.cart_item_id = Uuid::new_v4().to_string();
        }
        match out.iter_mut().find(|line| line.product_id == item.product_id) {
            Some(existing) => existing.quantity = existing.quantity.saturating_add(item.quantity),
            None => out.push(item),
        }
    }
    out
}

fn sanitize_wishlist(wishlist: Vec<WishlistItem>) -> Vec<WishlistItem> {
    let mut out: Vec<WishlistItem> = Vec::with_capacity(wishlist.len());
    for entry in wishlist {
        if entry.product_id.trim().is_empty()
            || out.iter().any(|existing| existing.product_id == entry.product_id)
        {
            continue;
        }
        out.push(entry);
    }
    out
}

fn display_name(name: &str) -> &str {
    if name.trim().is_empty() {
        "Item"
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::{NotificationLevel, RecordingNotificationService};
    use crate::services::commerce::pricing_service::StorefrontPricing;
    use crate::services::commerce::product_catalog_service::MockProductCatalog;
    use crate::services::commerce::storage::{InMemoryCartStorage, MockCartStorage};
    use crate::models::{IdValue, ProductVariant};
    use rust_decimal_macros::dec;

    fn honey() -> Product {
        Product {
            numeric_id: Some(IdValue::Number(42)),
            name: "Baobab Honey".into(),
            price: dec!(1000),
            stock_quantity: Some(10),
            ..Default::default()
        }
    }

    fn sized(size: &str, price: rust_decimal::Decimal) -> Product {
        let mut product = honey();
        product.selected_variant = Some(ProductVariant {
            size: Some(size.into()),
            price: Some(price),
            ..Default::default()
        });
        product
    }

    async fn store_with(
        storage: Arc<dyn CartStorage>,
    ) -> (CartStore, RecordingNotificationService) {
        let notifier = RecordingNotificationService::new();
        let store = CartStore::open(
            storage,
            Arc::new(StorefrontPricing::flat(dec!(300))),
            Arc::new(notifier.clone()),
        )
        .await;
        (store, notifier)
    }

    async fn store() -> (CartStore, RecordingNotificationService) {
        store_with(Arc::new(InMemoryCartStorage::new())).await
    }

    #[tokio::test]
    async fn adding_twice_merges_into_one_row() {
        let (store, _) = store().await;
        assert!(store.add_item(&honey(), 1).await);
        assert!(store.add_item(&honey(), 2).await);

        let items = store.items().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].quantity, 3);
        assert_eq!(items[0].product_id, "42");
    }

    #[tokio::test]
    async fn package_sizes_stay_separate() {
        let (store, _) = store().await;
        assert!(store.add_item(&sized("250g", dec!(400)), 1).await);
        assert!(store.add_item(&sized("1kg", dec!(1500)), 1).await);

        let items = store.items().await;
        assert_eq!(items.len(), 2);
        assert_eq!(store.cart_totals(None).await.subtotal, dec!(1900));
    }

    #[tokio::test]
    async fn unidentifiable_product_is_rejected_with_notification() {
        let (store, notifier) = store().await;
        let nameless = Product {
            name: "Mystery".into(),
            price: dec!(10),
            ..Default::default()
        };
        assert!(!store.add_item(&nameless, 1).await);
        assert!(store.is_empty().await);
        assert_eq!(notifier.count_at(NotificationLevel::Error), 1);
    }

    #[tokio::test]
    async fn zero_quantity_add_is_rejected() {
        let (store, _) = store().await;
        assert!(!store.add_item(&honey(), 0).await);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn update_to_zero_removes() {
        let (store, _) = store().await;
        store.add_item(&honey(), 2).await;
        assert!(store.update_quantity("42", 0).await);
        assert!(store.is_empty().await);

        store.add_item(&honey(), 2).await;
        assert!(store.update_quantity("42", -3).await);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn update_clamps_to_known_stock() {
        let (store, notifier) = store().await;
        store.add_item(&honey(), 1).await;
        assert!(store.update_quantity(42_i64, 25).await);
        assert_eq!(store.item_quantity("42").await, 10);
        assert_eq!(notifier.count_at(NotificationLevel::Warning), 1);
    }

    #[tokio::test]
    async fn warn_policy_keeps_requested_quantity() {
        let (store, notifier) = store().await;
        let store = store.with_stock_policy(StockPolicy::Warn);
        store.add_item(&honey(), 1).await;
        assert!(store.update_quantity("42", 25).await);
        assert_eq!(store.item_quantity("42").await, 25);
        assert_eq!(notifier.count_at(NotificationLevel::Warning), 1);
    }

    #[tokio::test]
    async fn row_found_by_cart_item_id() {
        let (store, _) = store().await;
        store.add_item(&honey(), 1).await;
        let line = store.items().await.remove(0);
        assert!(store.update_quantity(&line, 4).await);
        assert_eq!(store.item_quantity(&line.cart_item_id).await, 4);
        assert!(store.remove_item(&line).await);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn bare_id_is_ambiguous_across_sizes() {
        let (store, notifier) = store().await;
        store.add_item(&sized("250g", dec!(400)), 1).await;
        store.add_item(&sized("1kg", dec!(1500)), 1).await;

        assert!(!store.remove_item("42").await);
        assert_eq!(store.items().await.len(), 2);
        assert!(notifier
            .sent()
            .iter()
            .any(|n| n.message.contains("no longer in your cart")));
    }

    #[tokio::test]
    async fn remove_missing_item_is_a_noop() {
        let (store, _) = store().await;
        store.add_item(&honey(), 1).await;
        assert!(!store.remove_item("does-not-exist").await);
        assert_eq!(store.item_count().await, 1);
    }

    #[tokio::test]
    async fn failed_persist_leaves_cart_unchanged() {
        let mut storage = MockCartStorage::new();
        storage.expect_load().returning(|_| Ok(None));
        storage
            .expect_save()
            .returning(|_, _| Err(ServiceError::StorageError("disk full".into())));

        let (store, notifier) = store_with(Arc::new(storage)).await;
        assert!(!store.add_item(&honey(), 1).await);
        assert!(store.is_empty().await);
        assert_eq!(notifier.count_at(NotificationLevel::Error), 1);
    }

    #[tokio::test]
    async fn rehydrates_and_tolerates_corruption() {
        let storage = Arc::new(InMemoryCartStorage::new());
        {
            let (store, _) = store_with(storage.clone()).await;
            store.add_item(&honey(), 2).await;
            store.add_to_wishlist(&sized("1kg", dec!(1500))).await;
        }

        let (reopened, _) = store_with(storage.clone()).await;
        assert_eq!(reopened.item_count().await, 2);
        assert_eq!(reopened.wishlist().await.len(), 1);

        storage.insert_raw(CART_STORAGE_KEY, "{not json").await;
        storage
            .insert_raw(WISHLIST_STORAGE_KEY, r#"[{"bogus": true}]"#)
            .await;
        let (corrupt, _) = store_with(storage).await;
        assert!(corrupt.is_empty().await);
        assert!(corrupt.wishlist().await.is_empty());
    }

    #[tokio::test]
    async fn totals_follow_pricing_policy() {
        let (store, _) = store().await;
        assert_eq!(store.cart_totals(None).await.total, dec!(0));
        store.add_item(&honey(), 2).await;
        let totals = store.cart_totals(None).await;
        assert_eq!(totals.subtotal, dec!(2000));
        assert_eq!(totals.shipping, dec!(300));
        assert_eq!(totals.total, dec!(2300));
    }

    #[tokio::test]
    async fn add_backfills_from_catalog() {
        let mut catalog = MockProductCatalog::new();
        catalog
            .expect_get_product()
            .withf(|id| id == "42")
            .returning(|_| {
                let mut fresh = honey();
                fresh.price = dec!(1100);
                fresh.stock_quantity = Some(3);
                Ok(Some(fresh))
            });

        let (store, _) = store().await;
        let store = store.with_catalog(Arc::new(catalog));
        assert!(store.add_item(&honey(), 5).await);

        let line = store.items().await.remove(0);
        assert_eq!(line.unit_price, dec!(1100));
        assert_eq!(line.stock_quantity, Some(3));
        assert_eq!(line.quantity, 3);
    }

    #[tokio::test]
    async fn catalog_failure_keeps_caller_data() {
        let mut catalog = MockProductCatalog::new();
        catalog
            .expect_get_product()
            .returning(|_| Err(ServiceError::transport("offline")));

        let (store, _) = store().await;
        let store = store.with_catalog(Arc::new(catalog));
        assert!(store.add_item(&honey(), 1).await);
        assert_eq!(store.items().await[0].unit_price, dec!(1000));
    }

    #[tokio::test]
    async fn out_of_stock_add_is_refused_when_enforced() {
        let (store, _) = store().await;
        let mut gone = honey();
        gone.stock_quantity = Some(0);
        assert!(!store.add_item(&gone, 1).await);

        let store = store.with_stock_policy(StockPolicy::Warn);
        assert!(store.add_item(&gone, 1).await);
    }

    #[tokio::test]
    async fn refresh_reports_changes_and_missing_rows() {
        let (store, _) = store().await;
        store.add_item(&honey(), 1).await;
        let mut other = honey();
        other.numeric_id = Some(IdValue::Number(7));
        other.name = "Moringa Powder".into();
        store.add_item(&other, 1).await;

        let mut fresh = honey();
        fresh.stock_quantity = Some(0);
        let report = store
            .refresh_from_catalog(&[fresh], false)
            .await
            .expect("refresh should succeed");

        assert_eq!(report.checked, 2);
        assert_eq!(report.updated, 1);
        assert_eq!(report.missing.len(), 1);
        assert_eq!(report.newly_out_of_stock.len(), 1);
        assert_eq!(store.items().await.len(), 2);
    }

    #[tokio::test]
    async fn wishlist_moves_into_cart() {
        let (store, _) = store().await;
        let product = sized("1kg", dec!(1500));
        assert!(store.add_to_wishlist(&product).await);
        assert!(store.add_to_wishlist(&product).await);
        assert_eq!(store.wishlist().await.len(), 1);
        assert!(store.is_in_wishlist(&product).await);

        assert!(store.move_to_cart(&product).await);
        assert!(store.wishlist().await.is_empty());
        assert_eq!(store.item_quantity(&product).await, 1);
        assert_eq!(store.cart_totals(None).await.subtotal, dec!(1500));
    }

    #[tokio::test]
    async fn clear_operations_empty_collections() {
        let (store, _) = store().await;
        store.add_item(&honey(), 1).await;
        store.add_to_wishlist(&honey()).await;
        assert!(store.clear_cart().await);
        assert!(store.clear_wishlist().await);
        assert!(store.is_empty().await);
        assert!(store.wishlist().await.is_empty());
    }

    #[tokio::test]
    async fn clearing_drops_the_stored_documents() {
        let storage = Arc::new(InMemoryCartStorage::new());
        let (store, _) = store_with(storage.clone()).await;
        store.add_item(&honey(), 1).await;
        store.add_to_wishlist(&sized("1kg", dec!(1500))).await;
        assert!(storage.load(CART_STORAGE_KEY).await.expect("load").is_some());

        assert!(store.clear_cart().await);
        assert!(store.clear_wishlist().await);
        assert_eq!(storage.load(CART_STORAGE_KEY).await.expect("load"), None);
        assert_eq!(storage.load(WISHLIST_STORAGE_KEY).await.expect("load"), None);
    }

    #[tokio::test]
    async fn failed_clear_keeps_the_cart() {
        let mut storage = MockCartStorage::new();
        storage.expect_load().returning(|_| Ok(None));
        storage.expect_save().returning(|_, _| Ok(()));
        storage
            .expect_remove()
            .returning(|_| Err(ServiceError::StorageError("read-only".into())));

        let (store, notifier) = store_with(Arc::new(storage)).await;
        assert!(store.add_item(&honey(), 1).await);
        assert!(!store.clear_cart().await);
        assert_eq!(store.item_count().await, 1);
        assert_eq!(notifier.count_at(NotificationLevel::Error), 1);
    }

    #[tokio::test]
    async fn mixed_id_shapes_merge_into_one_row() {
        let (store, _) = store().await;
        let mut with_object_id = honey();
        with_object_id.object_id = Some(IdValue::Text("65f0c0ffee".into()));

        assert!(store.add_item(&with_object_id, 1).await);
        assert!(store.add_item(&honey(), 1).await);

        let items = store.items().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].quantity, 2);
        assert_eq!(store.item_quantity("42").await, 2);
        assert_eq!(store.item_quantity(&honey()).await, 2);
        assert!(store.update_quantity(&honey(), 5).await);
        assert_eq!(store.item_quantity("65f0c0ffee").await, 5);
    }

    #[tokio::test]
    async fn mixed_id_shapes_keep_package_sizes_apart() {
        let (store, _) = store().await;
        let mut large = sized("1kg", dec!(1500));
        large.object_id = Some(IdValue::Text("65f0c0ffee".into()));
        assert!(store.add_item(&large, 1).await);
        assert!(store.add_item(&sized("250g", dec!(400)), 1).await);
        assert!(store.add_item(&sized("1kg", dec!(1500)), 1).await);

        let items = store.items().await;
        assert_eq!(items.len(), 2);
        assert_eq!(store.item_quantity("42::1kg").await, 2);
        assert_eq!(store.item_quantity("42::250g").await, 1);
    }

    #[tokio::test]
    async fn events_are_published() {
        let (events, mut rx) = EventSender::channel(8);
        let (store, _) = store().await;
        let store = store.with_events(events);
        store.add_item(&honey(), 1).await;
        store.clear_cart().await;

        assert!(matches!(rx.recv().await, Some(Event::CartItemAdded { quantity: 1, .. })));
        assert_eq!(rx.recv().await, Some(Event::CartCleared));
    }

    #[test]
    fn sanitize_merges_duplicates_and_drops_empty_rows() {
        let a = CartLineItem::from_product(&honey(), "42".into(), 1);
        let b = CartLineItem::from_product(&honey(), "42".into(), 2);
        let mut zero = CartLineItem::from_product(&honey(), "7".into(), 1);
        zero.quantity = 0;
        let cleaned = sanitize_items(vec![a, b, zero]);
        assert_eq!(cleaned.len(), 1);
        assert_eq!(cleaned[0].quantity, 3);
    }
}
