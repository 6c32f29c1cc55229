//! Canonical identity for products and cart rows.
//!
//! The API hands out products under several id fields, sometimes as numbers
//! and sometimes as strings, and the same product can sit in the cart in more
//! than one package size. Everything that deduplicates or looks up cart rows
//! goes through [`normalize`] so that all of those shapes agree on one key.

use crate::models::product::non_blank;
use crate::models::{CartLineItem, Product, ProductVariant, WishlistItem};

/// Separator between the parts of a composite key.
pub const KEY_SEPARATOR: &str = "::";

/// Anything a caller may use to point at a product or a cart row.
#[derive(Debug, Clone, Copy)]
pub enum ItemRef<'a> {
    Text(&'a str),
    Number(i64),
    Product(&'a Product),
    CartItem(&'a CartLineItem),
    Wishlist(&'a WishlistItem),
}

impl<'a> From<&'a str> for ItemRef<'a> {
    fn from(value: &'a str) -> Self {
        ItemRef::Text(value)
    }
}

impl<'a> From<&'a String> for ItemRef<'a> {
    fn from(value: &'a String) -> Self {
        ItemRef::Text(value.as_str())
    }
}

impl From<i64> for ItemRef<'_> {
    fn from(value: i64) -> Self {
        ItemRef::Number(value)
    }
}

impl<'a> From<&'a Product> for ItemRef<'a> {
    fn from(value: &'a Product) -> Self {
        ItemRef::Product(value)
    }
}

impl<'a> From<&'a CartLineItem> for ItemRef<'a> {
    fn from(value: &'a CartLineItem) -> Self {
        ItemRef::CartItem(value)
    }
}

impl<'a> From<&'a WishlistItem> for ItemRef<'a> {
    fn from(value: &'a WishlistItem) -> Self {
        ItemRef::Wishlist(value)
    }
}

/// Resolves a reference to its canonical key, or `None` when nothing usable
/// is present. Callers must reject the operation on `None`.
///
/// Precedence, first match wins:
/// 1. a bare string or number, stringified;
/// 2. a cart row's `cartItemId`;
/// 3. base id plus the selected variant's id, size or mass;
/// 4. base id plus name and size, for records that carry a size but no variant;
/// 5. the raw id fields (`productId`, `_id`, `id`, `numericId`);
/// 6. the SKU.
///
/// Name and size never identify a product on their own: without a base id,
/// two unrelated products that share a name would collapse into one row.
pub fn normalize(reference: ItemRef<'_>) -> Option<String> {
    match reference {
        ItemRef::Text(text) => non_blank(Some(text)),
        ItemRef::Number(n) => Some(n.to_string()),
        ItemRef::CartItem(item) => non_blank(Some(&item.cart_item_id))
            .or_else(|| non_blank(Some(&item.product_id))),
        ItemRef::Wishlist(item) => non_blank(Some(&item.product_id)),
        ItemRef::Product(product) => product_key(product),
    }
}

/// Canonical key for a product record (steps 3 to 6 of [`normalize`]).
pub fn product_key(product: &Product) -> Option<String> {
    let base = product.raw_id();

    if let Some(base) = &base {
        if let Some(discriminator) = product
            .selected_variant
            .as_ref()
            .and_then(|variant| variant.discriminator())
        {
            return Some(compose(&[base, &discriminator]));
        }

        if let Some(size) = product.size_label() {
            let name = slug(&product.name);
            let parts: Vec<&str> = [base.as_str(), name.as_str(), size.as_str()]
                .into_iter()
                .filter(|part| !part.is_empty())
                .collect();
            return Some(compose(&parts).to_lowercase());
        }
    }

    base.or_else(|| non_blank(product.sku.as_deref()))
}

/// Whether `key` points at `line`, either by row id or by product identity.
pub fn matches_line(line: &CartLineItem, key: &str) -> bool {
    line.cart_item_id == key || refers_to_key(line, key)
}

/// Package-size part of an identity: the selected variant's id, size or
/// mass, else the record's own size label.
pub fn discriminator(variant: Option<&ProductVariant>, size: Option<&str>) -> Option<String> {
    variant
        .and_then(ProductVariant::discriminator)
        .or_else(|| non_blank(size).map(|s| s.to_lowercase()))
}

/// A stored cart row or wishlist entry, seen through its identity.
pub trait StoredIdentity {
    fn identity_key(&self) -> &str;
    /// Raw ids the stored product is known under.
    fn known_ids(&self) -> Vec<&str>;
    fn discriminator(&self) -> Option<String>;
}

impl StoredIdentity for CartLineItem {
    fn identity_key(&self) -> &str {
        &self.product_id
    }

    fn known_ids(&self) -> Vec<&str> {
        known_ids(&self.catalog_ids, self.catalog_id.as_deref(), &self.product_id)
    }

    fn discriminator(&self) -> Option<String> {
        discriminator(self.selected_variant.as_ref(), self.size.as_deref())
    }
}

impl StoredIdentity for WishlistItem {
    fn identity_key(&self) -> &str {
        &self.product_id
    }

    fn known_ids(&self) -> Vec<&str> {
        known_ids(&self.catalog_ids, self.catalog_id.as_deref(), &self.product_id)
    }

    fn discriminator(&self) -> Option<String> {
        discriminator(self.selected_variant.as_ref(), self.size.as_deref())
    }
}

/// Whether `stored` holds the product `product` (whose key is `key`). Equal
/// keys match; so does one shared raw id under the same package size, which
/// covers a product that arrives with `_id` and `numericId` one time and
/// with only `numericId` the next.
pub fn refers_to<T: StoredIdentity>(stored: &T, product: &Product, key: &str) -> bool {
    if stored.identity_key() == key {
        return true;
    }
    let ids = product.all_ids();
    let known = stored.known_ids();
    ids.iter().any(|id| known.contains(&id.as_str()))
        && stored.discriminator()
            == discriminator(
                product.selected_variant.as_ref(),
                product.size_label().as_deref(),
            )
}

/// Textual form of [`refers_to`]: a composite key matches when its base is
/// one of the stored raw ids and the rest of the key agrees.
pub fn refers_to_key<T: StoredIdentity>(stored: &T, key: &str) -> bool {
    if stored.identity_key() == key {
        return true;
    }
    let Some((base, rest)) = key.split_once(KEY_SEPARATOR) else {
        return false;
    };
    stored
        .identity_key()
        .split_once(KEY_SEPARATOR)
        .is_some_and(|(_, stored_rest)| stored_rest.eq_ignore_ascii_case(rest))
        && stored.known_ids().contains(&base)
}

fn known_ids<'a>(ids: &'a [String], catalog_id: Option<&'a str>, key: &'a str) -> Vec<&'a str> {
    let base = key.split(KEY_SEPARATOR).next().unwrap_or(key);
    let mut known: Vec<&str> = ids.iter().map(String::as_str).collect();
    for id in catalog_id.into_iter().chain(Some(base)) {
        if !known.contains(&id) {
            known.push(id);
        }
    }
    known
}

fn compose(parts: &[&str]) -> String {
    parts.join(KEY_SEPARATOR)
}

fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.trim().chars() {
        if c.is_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.extend(c.to_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out
}
