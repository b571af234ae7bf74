//! Cross-asset valuation.
//!
//! The price source itself is an external collaborator; the engine only
//! needs a deterministic conversion into base-denomination minor units.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use treasury_types::{Amount, Balance, Coin, Denom, TreasuryError, TreasuryResult};

/// Value of one minor unit of a denomination, in base minor units, as an
/// exact ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Price {
    pub numerator: u128,
    pub denominator: u128,
}

impl Price {
    pub fn new(numerator: u128, denominator: u128) -> TreasuryResult<Self> {
        if numerator == 0 || denominator == 0 {
            return Err(TreasuryError::InvalidInput(
                "price ratio terms must be non-zero".to_string(),
            ));
        }
        Ok(Self {
            numerator,
            denominator,
        })
    }

    pub fn unit() -> Self {
        Self {
            numerator: 1,
            denominator: 1,
        }
    }
}

pub trait PriceFeed: Send + Sync {
    fn price(&self, denom: &Denom) -> TreasuryResult<Price>;

    /// Value of `coin` in base minor units, rounded down.
    fn value_of(&self, coin: &Coin) -> TreasuryResult<u128> {
        let price = self.price(&coin.denom)?;
        u128::from(coin.amount)
            .checked_mul(price.numerator)
            .map(|v| v / price.denominator)
            .ok_or_else(|| TreasuryError::InvariantViolation(format!("valuation overflow for {}", coin)))
    }

    fn balance_value(&self, balance: &Balance) -> TreasuryResult<u128> {
        balance.coins().iter().try_fold(0u128, |acc, coin| {
            let value = self.value_of(coin)?;
            acc.checked_add(value)
                .ok_or_else(|| TreasuryError::InvariantViolation("valuation overflow".to_string()))
        })
    }

    /// Amount of `denom` worth `value` base minor units, rounded down.
    fn amount_for_value(&self, denom: &Denom, value: u128) -> TreasuryResult<Amount> {
        let price = self.price(denom)?;
        let amount = value
            .checked_mul(price.denominator)
            .map(|v| v / price.numerator)
            .ok_or_else(|| TreasuryError::InvariantViolation("valuation overflow".to_string()))?;
        Amount::try_from(amount).map_err(|_| {
            TreasuryError::InvariantViolation(format!("{} amount exceeds range", denom))
        })
    }
}

/// Fixed price table. The base denomination is always priced at one.
#[derive(Debug, Clone)]
pub struct StaticPriceFeed {
    base: Denom,
    prices: BTreeMap<Denom, Price>,
}

impl StaticPriceFeed {
    pub fn new(base: Denom) -> Self {
        Self {
            base,
            prices: BTreeMap::new(),
        }
    }

    pub fn with_price(mut self, denom: Denom, price: Price) -> Self {
        self.prices.insert(denom, price);
        self
    }
}

impl PriceFeed for StaticPriceFeed {
    fn price(&self, denom: &Denom) -> TreasuryResult<Price> {
        if *denom == self.base {
            return Ok(Price::unit());
        }
        self.prices
            .get(denom)
            .copied()
            .ok_or_else(|| TreasuryError::NotFound(format!("no price for {}", denom)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_cross_asset_balances_in_base_units() {
        let usdc = Denom::new("usdc").unwrap();
        let feed = StaticPriceFeed::new(Denom::base()).with_price(usdc.clone(), Price::new(83, 1).unwrap());
        let balance = Balance::from_coins([
            Coin::new(Denom::base(), 1_000),
            Coin::new(usdc.clone(), 10),
        ])
        .unwrap();

        assert_eq!(feed.balance_value(&balance).unwrap(), 1_830);
        assert_eq!(feed.amount_for_value(&usdc, 830).unwrap(), 10);
        assert!(feed.price(&Denom::new("unknown").unwrap()).is_err());
    }
}
