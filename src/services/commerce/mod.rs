//! Storefront commerce: the cart and wishlist, pricing, and keeping cart
//! rows in step with the product catalog.

pub mod cart_service;
pub mod catalog_sync;
pub mod identity;
pub mod pricing_service;
pub mod product_catalog_service;
pub mod storage;

pub use cart_service::{CartStore, RefreshReport};
pub use catalog_sync::{spawn_background_sync, CatalogSyncEngine, SkipReason, SyncOutcome, SyncReport};
pub use identity::{normalize, product_key, ItemRef};
pub use pricing_service::{compute_totals, CartTotals, PricingPolicy, StorefrontPricing};
pub use product_catalog_service::{HttpProductCatalog, ProductCatalog};
pub use storage::{CartStorage, FileCartStorage, InMemoryCartStorage, CART_STORAGE_KEY, WISHLIST_STORAGE_KEY};
