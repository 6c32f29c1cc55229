use std::collections::HashMap;
use std::fmt::Debug;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use tracing::debug;

use crate::config::AppConfig;
use crate::models::CartLineItem;

/// Derived cart totals, in whole KES. Never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CartTotals {
    pub subtotal: Decimal,
    pub shipping: Decimal,
    pub tax: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
    /// Sum of quantities across all rows.
    pub item_count: u32,
}

/// Pluggable pricing rules. Turning tax or discounts on is a matter of
/// swapping or configuring the policy, not editing the cart.
pub trait PricingPolicy: Send + Sync + Debug {
    fn shipping(&self, subtotal: Decimal, item_count: u32) -> Decimal;

    fn tax(&self, taxable: Decimal) -> Decimal;

    /// Amount taken off the subtotal for `code`. Unknown codes give zero.
    fn discount(&self, subtotal: Decimal, code: Option<&str>) -> Decimal;
}

/// Computes totals for `items` under `policy`.
///
/// `total = subtotal + shipping - discount + tax`, where tax is charged on the
/// discounted subtotal.
pub fn compute_totals(
    policy: &dyn PricingPolicy,
    items: &[CartLineItem],
    discount_code: Option<&str>,
) -> CartTotals {
    let subtotal: Decimal = items.iter().map(CartLineItem::line_total).sum();
    let item_count: u32 = items.iter().map(|item| item.quantity).sum();

    let shipping = policy.shipping(subtotal, item_count);
    let discount = policy.discount(subtotal, discount_code).min(subtotal);
    let tax = policy.tax(subtotal - discount);
    let total = subtotal + shipping - discount + tax;

    debug!(
        "Cart totals: subtotal={}, shipping={}, discount={}, tax={}, total={}",
        subtotal, shipping, discount, tax, total
    );

    CartTotals {
        subtotal,
        shipping,
        tax,
        discount,
        total,
        item_count,
    }
}

/// The shop's pricing: a flat shipping fee, with VAT and discount codes
/// available behind configuration switches (both off by default).
#[derive(Debug, Clone)]
pub struct StorefrontPricing {
    pub flat_shipping_fee: Decimal,
    pub charge_shipping_on_empty_cart: bool,
    pub tax_enabled: bool,
    pub tax_rate: Decimal,
    pub discounts_enabled: bool,
    /// Uppercased code → percentage off.
    discount_codes: HashMap<String, Decimal>,
}

impl StorefrontPricing {
    /// Flat shipping only; tax and discounts disabled.
    pub fn flat(shipping_fee: Decimal) -> Self {
        Self {
            flat_shipping_fee: shipping_fee,
            charge_shipping_on_empty_cart: false,
            tax_enabled: false,
            tax_rate: Decimal::ZERO,
            discounts_enabled: false,
            discount_codes: HashMap::new(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            flat_shipping_fee: config.flat_shipping_fee,
            charge_shipping_on_empty_cart: config.charge_shipping_on_empty_cart,
            tax_enabled: config.tax_enabled,
            tax_rate: config.tax_rate_decimal(),
            discounts_enabled: config.discounts_enabled,
            discount_codes: config
                .discount_codes
                .iter()
                .map(|(code, pct)| (code.trim().to_uppercase(), *pct))
                .collect(),
        }
    }

    pub fn with_tax(mut self, rate: Decimal) -> Self {
        self.tax_enabled = true;
        self.tax_rate = rate;
        self
    }

    pub fn with_discount_code(mut self, code: &str, percentage: Decimal) -> Self {
        self.discounts_enabled = true;
        self.discount_codes
            .insert(code.trim().to_uppercase(), percentage);
        self
    }
}

impl PricingPolicy for StorefrontPricing {
    fn shipping(&self, subtotal: Decimal, _item_count: u32) -> Decimal {
        if subtotal.is_zero() && !self.charge_shipping_on_empty_cart {
            Decimal::ZERO
        } else {
            self.flat_shipping_fee
        }
    }

    fn tax(&self, taxable: Decimal) -> Decimal {
        if !self.tax_enabled || taxable <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        whole_shillings(taxable * self.tax_rate)
    }

    fn discount(&self, subtotal: Decimal, code: Option<&str>) -> Decimal {
        if !self.discounts_enabled {
            return Decimal::ZERO;
        }
        let Some(code) = code.map(str::trim).filter(|c| !c.is_empty()) else {
            return Decimal::ZERO;
        };
        match self.discount_codes.get(&code.to_uppercase()) {
            Some(pct) => {
                let pct = (*pct).clamp(Decimal::ZERO, Decimal::ONE_HUNDRED);
                whole_shillings(subtotal * pct / Decimal::ONE_HUNDRED).min(subtotal)
            }
            None => {
                debug!(code, "Unknown discount code");
                Decimal::ZERO
            }
        }
    }
}

fn whole_shillings(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Product;
    use rust_decimal_macros::dec;

    fn line(price: Decimal, quantity: u32) -> CartLineItem {
        let product = Product {
            id: Some(1.into()),
            name: "Item".into(),
            price,
            ..Default::default()
        };
        CartLineItem::from_product(&product, "1".into(), quantity)
    }

    #[test]
    fn flat_shipping_added_to_subtotal() {
        let totals = compute_totals(&StorefrontPricing::flat(dec!(300)), &[line(dec!(1000), 2)], None);
        assert_eq!(totals.subtotal, dec!(2000));
        assert_eq!(totals.shipping, dec!(300));
        assert_eq!(totals.total, dec!(2300));
        assert_eq!(totals.item_count, 2);
    }

    #[test]
    fn empty_cart_is_free_by_default() {
        let totals = compute_totals(&StorefrontPricing::flat(dec!(300)), &[], None);
        assert_eq!(totals.total, Decimal::ZERO);
        assert_eq!(totals.shipping, Decimal::ZERO);
    }

    #[test]
    fn empty_cart_shipping_when_configured() {
        let mut pricing = StorefrontPricing::flat(dec!(300));
        pricing.charge_shipping_on_empty_cart = true;
        let totals = compute_totals(&pricing, &[], None);
        assert_eq!(totals.total, dec!(300));
    }

    #[test]
    fn tax_and_discount_are_zero_unless_enabled() {
        let pricing = StorefrontPricing::flat(dec!(300));
        let totals = compute_totals(&pricing, &[line(dec!(1000), 1)], Some("KARIBU10"));
        assert_eq!(totals.tax, Decimal::ZERO);
        assert_eq!(totals.discount, Decimal::ZERO);
    }

    #[test]
    fn enabled_tax_applies_to_discounted_subtotal() {
        let pricing = StorefrontPricing::flat(dec!(300))
            .with_tax(dec!(0.16))
            .with_discount_code("karibu10", dec!(10));
        let totals = compute_totals(&pricing, &[line(dec!(1000), 1)], Some(" KARIBU10 "));
        assert_eq!(totals.discount, dec!(100));
        assert_eq!(totals.tax, dec!(144));
        assert_eq!(totals.total, dec!(1344));
    }

    #[test]
    fn discount_never_exceeds_subtotal() {
        let pricing = StorefrontPricing::flat(Decimal::ZERO).with_discount_code("ALL", dec!(250));
        let totals = compute_totals(&pricing, &[line(dec!(999), 1)], Some("all"));
        assert_eq!(totals.discount, dec!(999));
        assert_eq!(totals.total, Decimal::ZERO);
    }

    #[test]
    fn tax_rounds_to_whole_shillings() {
        let pricing = StorefrontPricing::flat(Decimal::ZERO).with_tax(dec!(0.16));
        let totals = compute_totals(&pricing, &[line(dec!(999), 1)], None);
        // 159.84
        assert_eq!(totals.tax, dec!(160));
    }
}
