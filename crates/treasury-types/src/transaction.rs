use crate::amount::Balance;
use crate::pool::PoolId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Deposit,
    Withdrawal,
    Revenue,
    Rebalance,
    Mint,
    Burn,
    Swap,
}

impl TransactionKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Deposit => "deposit",
            Self::Withdrawal => "withdrawal",
            Self::Revenue => "revenue",
            Self::Rebalance => "rebalance",
            Self::Mint => "mint",
            Self::Burn => "burn",
            Self::Swap => "swap",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "deposit" => Some(Self::Deposit),
            "withdrawal" => Some(Self::Withdrawal),
            "revenue" => Some(Self::Revenue),
            "rebalance" => Some(Self::Rebalance),
            "mint" => Some(Self::Mint),
            "burn" => Some(Self::Burn),
            "swap" => Some(Self::Swap),
            _ => None,
        }
    }

    /// Value entering the treasury from outside.
    pub fn is_inflow(self) -> bool {
        matches!(self, Self::Deposit | Self::Revenue | Self::Mint)
    }

    /// Value leaving the treasury.
    pub fn is_outflow(self) -> bool {
        matches!(self, Self::Withdrawal | Self::Burn)
    }
}

/// Transaction append payload. Sequence and hashes are assigned by storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionAppend {
    pub kind: TransactionKind,
    pub source: Option<PoolId>,
    pub destination: Option<PoolId>,
    pub amount: Balance,
    /// Value in base-denomination minor units at commit time.
    pub value: u64,
    /// Plan action, proposal or external reference.
    pub reference: Option<String>,
    pub memo: String,
    pub timestamp: DateTime<Utc>,
}

/// Persisted, hash-linked record of a committed fund movement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub tx_id: String,
    pub sequence: u64,
    pub kind: TransactionKind,
    pub source: Option<PoolId>,
    pub destination: Option<PoolId>,
    pub amount: Balance,
    pub value: u64,
    pub reference: Option<String>,
    pub memo: String,
    pub timestamp: DateTime<Utc>,
    pub previous_hash: Option<String>,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub pool_id: PoolId,
    pub balance: Balance,
    pub recorded_at: DateTime<Utc>,
}
