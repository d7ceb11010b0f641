//! Interfaces to the node processes under test.
//!
//! The harness never reaches into a node directly. Everything it knows about a node is
//! learned through [Rpc] (the control surface of a running instance), everything it does
//! to a node's lifetime goes through [Lifecycle], and peering goes through [Linker].
//! Implementations live outside of this crate (or in [crate::mocks] for tests).

use commonware_utils::hex;
use std::{
    collections::BTreeSet,
    fmt::{Debug, Display, Formatter},
    future::Future,
    str::FromStr,
};
use thiserror::Error;

/// Number of base units in one coin.
pub const COIN: u64 = 100_000_000;

/// Number of bytes a [FeeRate] is quoted over.
const FEE_RATE_BYTES: u128 = 1_000;

/// Errors returned by a node collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("invalid flag: {0}")]
    InvalidFlag(String),
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("unknown block: {0}")]
    UnknownBlock(BlockHash),
    #[error("node stopped")]
    Stopped,
}

/// A quantity of coins, in base units.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(u64);

impl Amount {
    pub const ZERO: Self = Self(0);

    pub const fn from_base(units: u64) -> Self {
        Self(units)
    }

    pub const fn from_coins(coins: u64) -> Self {
        Self(coins * COIN)
    }

    pub const fn base(&self) -> u64 {
        self.0
    }

    pub const fn saturating_mul(&self, factor: u64) -> Self {
        Self(self.0.saturating_mul(factor))
    }
}

impl FromStr for Amount {
    type Err = Error;

    /// Parse a decimal coin amount (i.e. `"0.001"`) with at most 8 fractional digits.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidAmount(s.to_string());
        let (whole, fraction) = s.split_once('.').unwrap_or((s, ""));
        if whole.is_empty() && fraction.is_empty() {
            return Err(invalid());
        }
        if fraction.len() > 8 || !fraction.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let whole = match whole {
            "" => 0,
            whole => whole.parse::<u64>().map_err(|_| invalid())?,
        };
        let fraction = format!("{fraction:0<8}").parse::<u64>().map_err(|_| invalid())?;
        whole
            .checked_mul(COIN)
            .and_then(|base| base.checked_add(fraction))
            .map(Self)
            .ok_or_else(invalid)
    }
}

impl Display for Amount {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:08}", self.0 / COIN, self.0 % COIN)
    }
}

impl Debug for Amount {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

/// A fee quoted per 1000 bytes of transaction size.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FeeRate(Amount);

impl FeeRate {
    pub const ZERO: Self = Self(Amount::ZERO);

    pub const fn per_kb(amount: Amount) -> Self {
        Self(amount)
    }

    pub const fn per_kb_amount(&self) -> Amount {
        self.0
    }

    /// Fee owed by a transaction of `size` bytes (rounded up).
    pub fn fee(&self, size: usize) -> Amount {
        let fee = (self.0.base() as u128 * size as u128).div_ceil(FEE_RATE_BYTES);
        Amount(u64::try_from(fee).unwrap_or(u64::MAX))
    }

    /// Rate implied by paying `fee` for `size` bytes (rounded down).
    ///
    /// An empty transaction is treated as paying the maximum rate.
    pub fn of(fee: Amount, size: usize) -> Self {
        if size == 0 {
            return Self(Amount(u64::MAX));
        }
        let rate = fee.base() as u128 * FEE_RATE_BYTES / size as u128;
        Self(Amount(u64::try_from(rate).unwrap_or(u64::MAX)))
    }

    pub const fn saturating_mul(&self, factor: u64) -> Self {
        Self(self.0.saturating_mul(factor))
    }

    pub const fn saturating_add(&self, other: Self) -> Self {
        Self(Amount(self.0 .0.saturating_add(other.0 .0)))
    }
}

impl Display for FeeRate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/kB", self.0)
    }
}

impl Debug for FeeRate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

macro_rules! digest {
    ($name:ident) => {
        #[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name([u8; 32]);

        impl $name {
            pub const fn new(bytes: [u8; 32]) -> Self {
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", hex(&self.0))
            }
        }

        impl Debug for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", hex(&self.0))
            }
        }
    };
}

digest!(TxId);
digest!(BlockHash);

/// A receiving address handed out by a node's wallet.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(pub String);

/// A signed transaction, ready to broadcast.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub id: TxId,
    pub to: Address,
    pub amount: Amount,
    pub fee: Amount,
    pub size: usize,
}

impl Transaction {
    pub fn fee_rate(&self) -> FeeRate {
        FeeRate::of(self.fee, self.size)
    }
}

/// The best block known to a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChainTip {
    pub height: u64,
    pub hash: BlockHash,
}

impl Display for ChainTip {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.height, self.hash)
    }
}

/// Aggregate view of a node's mempool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MempoolInfo {
    /// Number of pending transactions.
    pub size: usize,
    /// Total size of pending transactions in bytes.
    pub bytes: usize,
}

/// Network-level policy reported by a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetworkInfo {
    /// Minimum fee rate the node requires to relay a transaction.
    pub relay_fee: FeeRate,
}

/// Control surface of a single running node.
pub trait Rpc: Send + Sync + 'static {
    /// Generate a new receiving address in the node's wallet.
    fn new_address(&self) -> impl Future<Output = Result<Address, Error>> + Send;

    /// Pay `amount` to `address`, pricing the fee with the wallet's own policy.
    fn send_to_address(
        &self,
        address: &Address,
        amount: Amount,
    ) -> impl Future<Output = Result<TxId, Error>> + Send;

    /// Construct, fund and sign a transaction of `size` bytes paying `fee_rate`.
    ///
    /// The transaction is not broadcast.
    fn create_transaction(
        &self,
        address: &Address,
        amount: Amount,
        fee_rate: FeeRate,
        size: usize,
    ) -> impl Future<Output = Result<Transaction, Error>> + Send;

    /// Submit a signed transaction to the node's mempool (and, if admitted, to its peers).
    fn send_raw_transaction(
        &self,
        transaction: &Transaction,
    ) -> impl Future<Output = Result<TxId, Error>> + Send;

    /// Produce `blocks` blocks on top of the node's best chain.
    fn generate(&self, blocks: u64) -> impl Future<Output = Result<Vec<BlockHash>, Error>> + Send;

    /// Return the transactions included in a block known to the node.
    fn block_transactions(
        &self,
        block: &BlockHash,
    ) -> impl Future<Output = Result<BTreeSet<TxId>, Error>> + Send;

    /// Return the node's best block.
    fn chain_tip(&self) -> impl Future<Output = Result<ChainTip, Error>> + Send;

    /// Return the ids of all pending transactions.
    fn raw_mempool(&self) -> impl Future<Output = Result<BTreeSet<TxId>, Error>> + Send;

    /// Return aggregate mempool statistics.
    fn mempool_info(&self) -> impl Future<Output = Result<MempoolInfo, Error>> + Send;

    /// Return the node's network policy.
    fn network_info(&self) -> impl Future<Output = Result<NetworkInfo, Error>> + Send;
}

/// Starts and stops node processes.
pub trait Lifecycle: Send {
    /// Handle used to control a started node.
    type Handle: Rpc;

    /// Start a node configured with `flags` (interpreted only by the node itself).
    fn start_node(
        &mut self,
        flags: &[String],
    ) -> impl Future<Output = Result<Self::Handle, Error>> + Send;

    /// Stop a node, releasing every resource it holds.
    fn stop_node(&mut self, handle: Self::Handle) -> impl Future<Output = Result<(), Error>> + Send;
}

/// Establishes peer connections between started nodes.
pub trait Linker<H>: Send {
    /// Connect `a` and `b` so that each can exchange transactions and blocks with the other.
    fn link_peers(&mut self, a: &H, b: &H) -> impl Future<Output = Result<(), Error>> + Send;
}
