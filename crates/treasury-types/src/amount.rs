use crate::error::{TreasuryError, TreasuryResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Integer amount in minor units of a denomination.
pub type Amount = u64;

/// Accounting denomination of the treasury.
pub const BASE_DENOM: &str = "namo";

/// Minor units per whole base token.
pub const MINOR_UNITS: Amount = 1_000_000;

/// Asset denomination, e.g. `namo` or `ibc/usdc`.
///
/// Deserialization does not validate; writes through the pool registry do.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Denom(String);

impl Denom {
    pub fn new(value: impl Into<String>) -> TreasuryResult<Self> {
        let value = value.into();
        if !Self::is_well_formed(&value) {
            return Err(TreasuryError::InvalidInput(format!(
                "malformed denomination '{}'",
                value
            )));
        }
        Ok(Self(value))
    }

    /// `[a-z][a-z0-9/]{2,127}`
    pub fn is_well_formed(value: &str) -> bool {
        let bytes = value.as_bytes();
        if bytes.len() < 3 || bytes.len() > 128 {
            return false;
        }
        if !bytes[0].is_ascii_lowercase() {
            return false;
        }
        bytes[1..]
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'/')
    }

    /// The treasury accounting denomination.
    pub fn base() -> Self {
        Self(BASE_DENOM.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Denom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single-denomination amount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub denom: Denom,
    pub amount: Amount,
}

impl Coin {
    pub fn new(denom: Denom, amount: Amount) -> Self {
        Self { denom, amount }
    }

    pub fn is_zero(&self) -> bool {
        self.amount == 0
    }
}

impl fmt::Display for Coin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.amount, self.denom)
    }
}

/// Multi-asset balance ordered by denomination. Zero entries are pruned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Balance(BTreeMap<Denom, Amount>);

impl Balance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(coin: Coin) -> Self {
        let mut balance = Self::new();
        if coin.amount > 0 {
            balance.0.insert(coin.denom, coin.amount);
        }
        balance
    }

    pub fn from_coins(coins: impl IntoIterator<Item = Coin>) -> TreasuryResult<Self> {
        let mut balance = Self::new();
        for coin in coins {
            balance.add(&coin)?;
        }
        Ok(balance)
    }

    pub fn amount_of(&self, denom: &Denom) -> Amount {
        self.0.get(denom).copied().unwrap_or(0)
    }

    pub fn contains_denom(&self, denom: &Denom) -> bool {
        self.0.contains_key(denom)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Denom, &Amount)> {
        self.0.iter()
    }

    pub fn coins(&self) -> Vec<Coin> {
        self.0
            .iter()
            .map(|(denom, amount)| Coin::new(denom.clone(), *amount))
            .collect()
    }

    pub fn add(&mut self, coin: &Coin) -> TreasuryResult<()> {
        if coin.amount == 0 {
            return Ok(());
        }
        let slot = self.0.entry(coin.denom.clone()).or_insert(0);
        *slot = slot.checked_add(coin.amount).ok_or_else(|| {
            TreasuryError::InvariantViolation(format!("balance overflow adding {}", coin))
        })?;
        Ok(())
    }

    pub fn sub(&mut self, coin: &Coin) -> TreasuryResult<()> {
        if coin.amount == 0 {
            return Ok(());
        }
        let held = self.amount_of(&coin.denom);
        let remaining = held.checked_sub(coin.amount).ok_or_else(|| {
            TreasuryError::InvariantViolation(format!(
                "insufficient {}: holds {}, needs {}",
                coin.denom, held, coin.amount
            ))
        })?;
        if remaining == 0 {
            self.0.remove(&coin.denom);
        } else {
            self.0.insert(coin.denom.clone(), remaining);
        }
        Ok(())
    }

    pub fn merge(&mut self, other: &Balance) -> TreasuryResult<()> {
        for coin in other.coins() {
            self.add(&coin)?;
        }
        Ok(())
    }

    /// True when every denomination in `floor` is held in at least that amount.
    pub fn covers(&self, floor: &Balance) -> bool {
        floor
            .iter()
            .all(|(denom, amount)| self.amount_of(denom) >= *amount)
    }

    /// First denomination whose held amount exceeds `ceiling`. Denominations
    /// absent from the ceiling are unbounded.
    pub fn first_excess_over(&self, ceiling: &Balance) -> Option<(Denom, Amount, Amount)> {
        ceiling.iter().find_map(|(denom, cap)| {
            let held = self.amount_of(denom);
            (held > *cap).then(|| (denom.clone(), held, *cap))
        })
    }

    pub fn denoms(&self) -> impl Iterator<Item = &Denom> {
        self.0.keys()
    }
}

impl fmt::Display for Balance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("0");
        }
        let parts = self
            .0
            .iter()
            .map(|(denom, amount)| format!("{}{}", amount, denom))
            .collect::<Vec<_>>();
        f.write_str(&parts.join(","))
    }
}
