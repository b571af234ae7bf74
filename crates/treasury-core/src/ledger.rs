//! Ledger collaborator boundary.
//!
//! The ledger holds the authoritative balances and serializes state
//! transitions. Each call is assumed atomic and fail-closed: an error means
//! nothing moved. Pool accounts are addressed by pool id; external accounts
//! (depositors, withdrawal recipients) by their own identifiers.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use treasury_types::{Amount, Balance, Coin, Denom, Pool, TreasuryError, TreasuryResult};

#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn transfer(&self, from: &str, to: &str, coin: &Coin) -> TreasuryResult<()>;
    async fn mint(&self, account: &str, coin: &Coin) -> TreasuryResult<()>;
    async fn burn(&self, account: &str, coin: &Coin) -> TreasuryResult<()>;
    async fn balance_of(&self, account: &str) -> TreasuryResult<Balance>;
    async fn total_supply(&self, denom: &Denom) -> TreasuryResult<Amount>;
}

/// Process-local ledger used by tests and the default service wiring.
#[derive(Default)]
pub struct InMemoryLedger {
    accounts: RwLock<HashMap<String, Balance>>,
    supply: RwLock<BTreeMap<Denom, Amount>>,
    halted: AtomicBool,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirror pool balances into ledger accounts.
    pub fn from_pools(pools: &[Pool]) -> TreasuryResult<Self> {
        let ledger = Self::new();
        for pool in pools {
            for coin in pool.balance.coins() {
                ledger.credit(pool.id.as_str(), &coin)?;
            }
        }
        Ok(ledger)
    }

    /// Credit an account out of thin air, counting toward supply.
    pub fn credit(&self, account: &str, coin: &Coin) -> TreasuryResult<()> {
        let mut accounts = self.accounts.write().map_err(|_| poisoned())?;
        let mut supply = self.supply.write().map_err(|_| poisoned())?;
        let total = supply.entry(coin.denom.clone()).or_insert(0);
        *total = total
            .checked_add(coin.amount)
            .ok_or_else(|| TreasuryError::Ledger("supply overflow".to_string()))?;
        accounts
            .entry(account.to_string())
            .or_default()
            .add(coin)
            .map_err(|e| TreasuryError::Ledger(e.reason().to_string()))
    }

    /// While halted every call fails without effect.
    pub fn set_halted(&self, halted: bool) {
        self.halted.store(halted, Ordering::SeqCst);
    }

    fn ensure_running(&self) -> TreasuryResult<()> {
        if self.halted.load(Ordering::SeqCst) {
            return Err(TreasuryError::Ledger("ledger unavailable".to_string()));
        }
        Ok(())
    }
}

fn poisoned() -> TreasuryError {
    TreasuryError::Ledger("ledger lock poisoned".to_string())
}

#[async_trait]
impl LedgerClient for InMemoryLedger {
    async fn transfer(&self, from: &str, to: &str, coin: &Coin) -> TreasuryResult<()> {
        self.ensure_running()?;
        let mut accounts = self.accounts.write().map_err(|_| poisoned())?;
        let mut source = accounts.get(from).cloned().unwrap_or_default();
        source
            .sub(coin)
            .map_err(|e| TreasuryError::Ledger(format!("{}: {}", from, e.reason())))?;
        let mut dest = accounts.get(to).cloned().unwrap_or_default();
        dest.add(coin)
            .map_err(|e| TreasuryError::Ledger(format!("{}: {}", to, e.reason())))?;
        accounts.insert(from.to_string(), source);
        accounts.insert(to.to_string(), dest);
        Ok(())
    }

    async fn mint(&self, account: &str, coin: &Coin) -> TreasuryResult<()> {
        self.ensure_running()?;
        self.credit(account, coin)
    }

    async fn burn(&self, account: &str, coin: &Coin) -> TreasuryResult<()> {
        self.ensure_running()?;
        let mut accounts = self.accounts.write().map_err(|_| poisoned())?;
        let mut supply = self.supply.write().map_err(|_| poisoned())?;
        let mut held = accounts.get(account).cloned().unwrap_or_default();
        held.sub(coin)
            .map_err(|e| TreasuryError::Ledger(format!("{}: {}", account, e.reason())))?;
        let total = supply.entry(coin.denom.clone()).or_insert(0);
        *total = total.saturating_sub(coin.amount);
        accounts.insert(account.to_string(), held);
        Ok(())
    }

    async fn balance_of(&self, account: &str) -> TreasuryResult<Balance> {
        self.ensure_running()?;
        let accounts = self.accounts.read().map_err(|_| poisoned())?;
        Ok(accounts.get(account).cloned().unwrap_or_default())
    }

    async fn total_supply(&self, denom: &Denom) -> TreasuryResult<Amount> {
        self.ensure_running()?;
        let supply = self.supply.read().map_err(|_| poisoned())?;
        Ok(supply.get(denom).copied().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transfer_is_all_or_nothing() {
        let ledger = InMemoryLedger::new();
        let coin = Coin::new(Denom::base(), 100);
        ledger.credit("reserve", &coin).unwrap();

        let too_much = Coin::new(Denom::base(), 101);
        assert!(ledger.transfer("reserve", "ops", &too_much).await.is_err());
        assert_eq!(ledger.balance_of("reserve").await.unwrap().amount_of(&Denom::base()), 100);
        assert!(ledger.balance_of("ops").await.unwrap().is_empty());

        ledger.transfer("reserve", "ops", &coin).await.unwrap();
        assert_eq!(ledger.balance_of("ops").await.unwrap().amount_of(&Denom::base()), 100);
        assert_eq!(ledger.total_supply(&Denom::base()).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn halted_ledger_fails_closed() {
        let ledger = InMemoryLedger::new();
        ledger.credit("reserve", &Coin::new(Denom::base(), 10)).unwrap();
        ledger.set_halted(true);
        let err = ledger
            .burn("reserve", &Coin::new(Denom::base(), 5))
            .await
            .unwrap_err();
        assert!(matches!(err, TreasuryError::Ledger(_)));
        ledger.set_halted(false);
        assert_eq!(ledger.total_supply(&Denom::base()).await.unwrap(), 10);
    }
}
