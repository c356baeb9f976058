//! Platform pricing rules
//!
//! All amounts are integer minor units. The requester pays the provider's
//! base price plus a tiered platform fee; the tier is chosen from the base
//! price on the way in and from `threshold + small_fee` on the way back so
//! the two directions always agree.
//!
//! Arithmetic is checked: an amount that would overflow is an error, never a
//! wrapped or panicking result.

use crate::config::PricingConfig;
use anyhow::{anyhow, Result};
use serde::Serialize;

/// Pricing calculator built from the configured fee tiers
#[derive(Debug, Clone)]
pub struct Pricing {
    small_fee: i64,
    large_fee: i64,
    threshold: i64,
    provider_payout_bps: i64,
    max_amount: i64,
}

/// Breakdown of a client-visible price
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriceQuote {
    /// Provider's base price
    pub base: i64,
    /// Platform fee for this tier
    pub fee: i64,
    /// What the requester pays
    pub client_price: i64,
    /// What the provider is eventually paid out
    pub provider_payout: i64,
}

impl Pricing {
    /// Create a calculator from configuration
    pub fn new(config: &PricingConfig) -> Self {
        Self {
            small_fee: config.small_fee,
            large_fee: config.large_fee,
            threshold: config.threshold,
            provider_payout_bps: config.provider_payout_bps,
            max_amount: config.max_amount,
        }
    }

    /// Largest base or client price accepted
    pub fn max_amount(&self) -> i64 {
        self.max_amount
    }

    /// Platform fee charged on top of a base price
    pub fn platform_fee(&self, base: i64) -> i64 {
        if base <= self.threshold {
            self.small_fee
        } else {
            self.large_fee
        }
    }

    /// Requester-visible price for a base price
    pub fn client_price(&self, base: i64) -> Result<i64> {
        base.checked_add(self.platform_fee(base))
            .ok_or_else(|| anyhow!("Client price for base {} overflows", base))
    }

    /// Recover the provider's base price from a client price
    pub fn recover_base(&self, client_price: i64) -> Result<i64> {
        let small_tier_max = self.threshold.saturating_add(self.small_fee);
        let fee = if client_price <= small_tier_max {
            self.small_fee
        } else {
            self.large_fee
        };
        client_price
            .checked_sub(fee)
            .ok_or_else(|| anyhow!("Base price for {} underflows", client_price))
    }

    /// Provider payout for a base price (floored)
    pub fn provider_payout(&self, base: i64) -> Result<i64> {
        apply_bps(base, self.provider_payout_bps)
    }

    /// Full breakdown for a base price
    pub fn quote(&self, base: i64) -> Result<PriceQuote> {
        Ok(PriceQuote {
            base,
            fee: self.platform_fee(base),
            client_price: self.client_price(base)?,
            provider_payout: self.provider_payout(base)?,
        })
    }

    /// Full breakdown for a client price, recovering the base first.
    ///
    /// Fails when no base price maps onto `client_price`, which happens for
    /// prices that fall between the two tiers or below the small fee.
    pub fn quote_client_price(&self, client_price: i64) -> Result<PriceQuote> {
        let base = self.recover_base(client_price)?;
        if base <= 0 || self.client_price(base)? != client_price {
            return Err(anyhow!("{} is not a valid client price", client_price));
        }
        self.quote(base)
    }
}

/// Apply a basis-point rate to an amount (floored)
pub fn apply_bps(amount: i64, bps: i64) -> Result<i64> {
    let scaled = i128::from(amount) * i128::from(bps) / 10_000;
    i64::try_from(scaled).map_err(|_| anyhow!("{} at {} bps overflows", amount, bps))
}

/// Convert a minor-unit local amount into the settlement asset at `rate`
/// (local units per asset unit), rounded up to four decimal places.
pub fn asset_amount(minor: i64, rate: f64) -> anyhow::Result<f64> {
    if !(rate.is_finite() && rate > 0.0) {
        return Err(anyhow::anyhow!("Invalid exchange rate: {}", rate));
    }
    // minor / 100 / rate, expressed in ten-thousandths of the asset
    let ten_thousandths = (minor as f64 * 100.0 / rate - 1e-9).ceil();
    Ok(ten_thousandths.max(0.0) / 10_000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pricing() -> Pricing {
        Pricing::new(&PricingConfig::default())
    }

    #[test]
    fn test_fee_tiers() {
        let p = pricing();
        assert_eq!(p.platform_fee(150_000), 20_000);
        assert_eq!(p.client_price(150_000).unwrap(), 170_000);
        assert_eq!(p.platform_fee(300_000), 50_000);
        assert_eq!(p.client_price(300_000).unwrap(), 350_000);
    }

    #[test]
    fn test_recover_base_round_trip() {
        let p = pricing();
        for base in [0, 1, 50_000, 199_999, 200_000, 200_001, 250_000, 1_000_000] {
            let client = p.client_price(base).unwrap();
            assert_eq!(p.recover_base(client).unwrap(), base, "base={}", base);
        }
    }

    #[test]
    fn test_threshold_boundary() {
        let p = pricing();
        // exactly at the threshold stays in the small tier
        assert_eq!(p.client_price(200_000).unwrap(), 220_000);
        assert_eq!(p.recover_base(220_000).unwrap(), 200_000);
        assert_eq!(p.client_price(200_001).unwrap(), 250_001);
        assert_eq!(p.recover_base(250_001).unwrap(), 200_001);
    }

    #[test]
    fn test_provider_payout() {
        let p = pricing();
        assert_eq!(p.provider_payout(100_000).unwrap(), 95_000);
        assert_eq!(p.provider_payout(33).unwrap(), 31);
        assert_eq!(p.quote(150_000).unwrap().provider_payout, 142_500);
    }

    #[test]
    fn test_asset_amount_rounds_up() {
        // KES 1500 at 130 KES/USDT = 11.538461... -> 11.5385
        assert_eq!(asset_amount(150_000, 130.0).unwrap(), 11.5385);
        // exact division is not bumped
        assert_eq!(asset_amount(130_000, 130.0).unwrap(), 10.0);
        assert!(asset_amount(100, 0.0).is_err());
        assert!(asset_amount(100, -3.0).is_err());
    }

    #[test]
    fn test_apply_bps() {
        assert_eq!(apply_bps(170_000, 500).unwrap(), 8_500);
        assert_eq!(apply_bps(19, 500).unwrap(), 0);
    }

    #[test]
    fn test_huge_amounts_error_instead_of_overflowing() {
        let p = pricing();
        assert!(p.client_price(i64::MAX - 10).is_err());
        assert!(p.quote(i64::MAX - 10).is_err());
        assert!(p.recover_base(i64::MIN).is_err());
        // the intermediate product overflows i64 but the result fits
        assert_eq!(apply_bps(i64::MAX / 100, 500).unwrap(), i64::MAX / 100 / 20);
        assert!(apply_bps(i64::MAX, 20_000).is_err());
    }

    #[test]
    fn test_quote_from_client_price() {
        let p = pricing();
        let quote = p.quote_client_price(170_000).unwrap();
        assert_eq!(quote.base, 150_000);
        assert_eq!(quote.fee, 20_000);
        assert_eq!(p.quote_client_price(250_001).unwrap().base, 200_001);
        // between the tiers: 230_000 - 50_000 = 180_000, which is small tier
        assert!(p.quote_client_price(230_000).is_err());
        assert!(p.quote_client_price(20_000).is_err());
    }
}
