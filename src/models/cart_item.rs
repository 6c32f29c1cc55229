use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::product::{Product, ProductVariant};

/// One row of the shopping cart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartLineItem {
    /// Opaque row key, generated when the row is created and never changed.
    pub cart_item_id: String,
    /// Canonical product+variant identity.
    pub product_id: String,
    /// Identifier used to look the product up in the catalog.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_id: Option<String>,
    /// Every raw id the product has been seen under.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub catalog_ids: Vec<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
    pub unit_price: Decimal,
    pub quantity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_variant: Option<ProductVariant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stock_quantity: Option<i64>,
    #[serde(default = "default_in_stock")]
    pub in_stock: bool,
    pub added_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_in_stock() -> bool {
    true
}

impl CartLineItem {
    /// Builds a fresh row for `product` under the canonical key `product_id`.
    pub fn from_product(product: &Product, product_id: String, quantity: u32) -> Self {
        let now = Utc::now();
        Self {
            cart_item_id: Uuid::new_v4().to_string(),
            product_id,
            catalog_id: product.raw_id(),
            catalog_ids: product.all_ids(),
            name: product.name.clone(),
            sku: product.sku.clone(),
            unit_price: product.effective_price(),
            quantity,
            selected_variant: product.selected_variant.clone(),
            size: product.size_label(),
            image: product.primary_image(),
            category: product.category.clone(),
            stock_quantity: product.effective_stock(),
            in_stock: product.is_available(),
            added_at: now,
            updated_at: now,
        }
    }

    pub fn line_total(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }

    /// Records any raw ids of `product` this row has not been seen under yet.
    pub fn remember_ids(&mut self, product: &Product) {
        for id in product.all_ids() {
            if !self.catalog_ids.contains(&id) {
                self.catalog_ids.push(id);
            }
        }
    }

    /// Overwrites the mutable, catalog-owned fields with fresher values.
    /// Returns `true` when anything actually changed.
    ///
    /// A variant row whose variant the record no longer lists keeps its own
    /// price and stock; base-product figures only apply to rows without one.
    pub fn absorb(&mut self, product: &Product) -> bool {
        let (price, stock, flag) = match &self.selected_variant {
            Some(selected) => {
                let fresh = product.find_variant(selected).or_else(|| {
                    product
                        .selected_variant
                        .as_ref()
                        .filter(|v| v.discriminator() == selected.discriminator())
                });
                match fresh {
                    Some(variant) => (
                        variant.price.unwrap_or(product.price),
                        variant.stock_quantity.or(product.stock_quantity),
                        variant.in_stock.or(product.in_stock),
                    ),
                    None => (self.unit_price, self.stock_quantity, Some(self.in_stock)),
                }
            }
            None => (
                product.effective_price(),
                product.effective_stock(),
                product.in_stock,
            ),
        };
        let in_stock = match (flag, stock) {
            (Some(flag), _) => flag,
            (None, Some(stock)) => stock > 0,
            (None, None) => self.in_stock,
        };
        let image = product.primary_image().or_else(|| self.image.clone());

        let changed = price != self.unit_price
            || stock != self.stock_quantity
            || in_stock != self.in_stock
            || image != self.image;

        if changed {
            self.unit_price = price;
            self.stock_quantity = stock;
            self.in_stock = in_stock;
            self.image = image;
            self.updated_at = Utc::now();
        }
        changed
    }
}

/// Saved-for-later entry. Same shape as a cart row without a quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WishlistItem {
    pub product_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub catalog_ids: Vec<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
    pub unit_price: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_variant: Option<ProductVariant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stock_quantity: Option<i64>,
    #[serde(default = "default_in_stock")]
    pub in_stock: bool,
    pub added_at: DateTime<Utc>,
}

impl WishlistItem {
    pub fn from_product(product: &Product, product_id: String) -> Self {
        Self {
            product_id,
            catalog_id: product.raw_id(),
            catalog_ids: product.all_ids(),
            name: product.name.clone(),
            sku: product.sku.clone(),
            unit_price: product.effective_price(),
            selected_variant: product.selected_variant.clone(),
            size: product.size_label(),
            image: product.primary_image(),
            category: product.category.clone(),
            stock_quantity: product.effective_stock(),
            in_stock: product.is_available(),
            added_at: Utc::now(),
        }
    }

    /// Rebuilds a product record so the entry can go through the cart's add path.
    pub fn to_product(&self) -> Product {
        Product {
            product_id: self.catalog_id.clone().map(Into::into),
            sku: self.sku.clone(),
            name: self.name.clone(),
            price: self.unit_price,
            image: self.image.clone(),
            category: self.category.clone(),
            size: self.size.clone(),
            stock_quantity: self.stock_quantity,
            in_stock: Some(self.in_stock),
            selected_variant: self.selected_variant.clone(),
            ..Default::default()
        }
    }
}
