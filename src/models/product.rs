use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An identifier as the API hands it out: sometimes a number, sometimes a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdValue {
    Number(i64),
    Text(String),
}

impl IdValue {
    /// Stringified, trimmed form; `None` for blank strings.
    pub fn as_key(&self) -> Option<String> {
        match self {
            IdValue::Number(n) => Some(n.to_string()),
            IdValue::Text(s) => {
                let trimmed = s.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
        }
    }
}

impl fmt::Display for IdValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdValue::Number(n) => write!(f, "{}", n),
            IdValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for IdValue {
    fn from(value: i64) -> Self {
        IdValue::Number(value)
    }
}

impl From<&str> for IdValue {
    fn from(value: &str) -> Self {
        IdValue::Text(value.to_string())
    }
}

impl From<String> for IdValue {
    fn from(value: String) -> Self {
        IdValue::Text(value)
    }
}

/// A purchasable package size of a product.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductVariant {
    #[serde(default, alias = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<IdValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mass: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stock_quantity: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_stock: Option<bool>,
}

impl ProductVariant {
    /// The value that tells two variants of the same product apart.
    pub fn discriminator(&self) -> Option<String> {
        self.id
            .as_ref()
            .and_then(IdValue::as_key)
            .or_else(|| non_blank(self.size.as_deref()))
            .or_else(|| non_blank(self.mass.as_deref()))
            .map(|d| d.to_lowercase())
    }
}

/// Product record as served by `GET /products`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<IdValue>,
    #[serde(default, rename = "_id", skip_serializing_if = "Option::is_none")]
    pub object_id: Option<IdValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<IdValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numeric_id: Option<IdValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub price: Decimal,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mass: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stock_quantity: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_stock: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variants: Vec<ProductVariant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_variant: Option<ProductVariant>,
}

impl Product {
    /// Raw identifier in priority order: `productId`, `_id`, `id`, `numericId`.
    pub fn raw_id(&self) -> Option<String> {
        [&self.product_id, &self.object_id, &self.id, &self.numeric_id]
            .into_iter()
            .flatten()
            .find_map(IdValue::as_key)
    }

    /// Every identifier this record can be looked up by.
    pub fn all_ids(&self) -> Vec<String> {
        [&self.product_id, &self.object_id, &self.id, &self.numeric_id]
            .into_iter()
            .flatten()
            .filter_map(IdValue::as_key)
            .collect()
    }

    /// Price of the selected variant when it carries one, otherwise the base price.
    pub fn effective_price(&self) -> Decimal {
        self.selected_variant
            .as_ref()
            .and_then(|v| v.price)
            .unwrap_or(self.price)
    }

    /// Stock level of the selected variant when known, otherwise the product's.
    pub fn effective_stock(&self) -> Option<i64> {
        self.selected_variant
            .as_ref()
            .and_then(|v| v.stock_quantity)
            .or(self.stock_quantity)
    }

    pub fn primary_image(&self) -> Option<String> {
        self.images.first().cloned().or_else(|| self.image.clone())
    }

    /// Availability: an explicit flag wins, otherwise derived from stock.
    pub fn is_available(&self) -> bool {
        let flag = self
            .selected_variant
            .as_ref()
            .and_then(|v| v.in_stock)
            .or(self.in_stock);
        match (flag, self.effective_stock()) {
            (Some(flag), _) => flag,
            (None, Some(stock)) => stock > 0,
            (None, None) => true,
        }
    }

    /// Finds the catalog's copy of a variant the shopper selected earlier.
    pub fn find_variant(&self, selected: &ProductVariant) -> Option<&ProductVariant> {
        let wanted = selected.discriminator()?;
        self.variants
            .iter()
            .find(|v| v.discriminator().as_deref() == Some(wanted.as_str()))
    }

    /// Size label used for the legacy composite identity.
    pub fn size_label(&self) -> Option<String> {
        non_blank(self.size.as_deref()).or_else(|| non_blank(self.mass.as_deref()))
    }
}

pub(crate) fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn deserializes_mixed_id_shapes() {
        let product: Product = serde_json::from_value(json!({
            "_id": "65f0c0ffee",
            "numericId": 42,
            "name": "Baobab Honey",
            "price": 1000,
            "images": ["/img/honey.jpg"],
            "stockQuantity": 7,
            "inStock": true
        }))
        .expect("product should deserialize");

        assert_eq!(product.raw_id().as_deref(), Some("65f0c0ffee"));
        assert_eq!(product.all_ids(), vec!["65f0c0ffee", "42"]);
        assert_eq!(product.price, dec!(1000));
        assert_eq!(product.primary_image().as_deref(), Some("/img/honey.jpg"));
    }

    #[test]
    fn product_id_outranks_other_ids() {
        let product = Product {
            product_id: Some("p-1".into()),
            id: Some(IdValue::Number(9)),
            ..Default::default()
        };
        assert_eq!(product.raw_id().as_deref(), Some("p-1"));
    }

    #[test]
    fn blank_ids_are_ignored() {
        let product = Product {
            product_id: Some("   ".into()),
            id: Some(IdValue::Number(3)),
            ..Default::default()
        };
        assert_eq!(product.raw_id().as_deref(), Some("3"));
    }

    #[test]
    fn variant_price_and_stock_win() {
        let product = Product {
            price: dec!(500),
            stock_quantity: Some(10),
            selected_variant: Some(ProductVariant {
                size: Some("1kg".into()),
                price: Some(dec!(900)),
                stock_quantity: Some(2),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(product.effective_price(), dec!(900));
        assert_eq!(product.effective_stock(), Some(2));
    }

    #[test]
    fn availability_rules() {
        let mut product = Product::default();
        assert!(product.is_available());
        product.stock_quantity = Some(0);
        assert!(!product.is_available());
        product.in_stock = Some(true);
        assert!(product.is_available());
    }

    #[test]
    fn variant_discriminator_is_case_insensitive() {
        let a = ProductVariant {
            size: Some("500G".into()),
            ..Default::default()
        };
        let b = ProductVariant {
            size: Some(" 500g ".into()),
            ..Default::default()
        };
        assert_eq!(a.discriminator(), b.discriminator());
    }
}
