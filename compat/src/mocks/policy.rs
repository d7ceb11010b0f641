use crate::node::{Amount, Error, FeeRate};

/// Bytes per unit of `-maxmempool`.
const MEGABYTE: usize = 1_000_000;

/// Admission policy of a simulated node, derived from its startup flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Policy {
    /// `-minrelaytxfee`: minimum rate accepted from (and forwarded to) peers.
    pub relay_fee: FeeRate,
    /// `-blockmintxfee`: minimum rate for inclusion in a produced block.
    pub block_min_fee: FeeRate,
    /// `-paytxfee`: rate the wallet pays (zero defers to `wallet_min_fee`).
    pub pay_fee: FeeRate,
    /// `-mintxfee`: lowest rate the wallet will ever pay.
    pub wallet_min_fee: FeeRate,
    /// `-dustlimit`: smallest output accepted.
    pub dust_limit: Amount,
    /// `-maxmempool`: mempool capacity in bytes.
    pub max_mempool: usize,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            relay_fee: FeeRate::per_kb(Amount::from_base(100_000)),
            block_min_fee: FeeRate::per_kb(Amount::from_base(100_000)),
            pay_fee: FeeRate::ZERO,
            wallet_min_fee: FeeRate::per_kb(Amount::from_coins(1)),
            dust_limit: Amount::from_coins(1),
            max_mempool: 300 * MEGABYTE,
        }
    }
}

impl Policy {
    /// Apply `flags` on top of the defaults.
    ///
    /// Flags this policy does not know about are ignored.
    pub fn parse(flags: &[String]) -> Result<Self, Error> {
        let mut policy = Self::default();
        for flag in flags {
            let Some(flag) = flag.strip_prefix('-') else {
                return Err(Error::InvalidFlag(flag.clone()));
            };
            let (key, value) = match flag.split_once('=') {
                Some((key, value)) => (key, Some(value)),
                None => (flag, None),
            };
            let amount = || -> Result<Amount, Error> {
                value
                    .ok_or_else(|| Error::InvalidFlag(flag.to_string()))?
                    .parse()
                    .map_err(|_| Error::InvalidFlag(flag.to_string()))
            };
            match key {
                "minrelaytxfee" => policy.relay_fee = FeeRate::per_kb(amount()?),
                "blockmintxfee" => policy.block_min_fee = FeeRate::per_kb(amount()?),
                "paytxfee" => policy.pay_fee = FeeRate::per_kb(amount()?),
                "mintxfee" => policy.wallet_min_fee = FeeRate::per_kb(amount()?),
                "dustlimit" => policy.dust_limit = amount()?,
                "maxmempool" => {
                    let megabytes = value
                        .and_then(|value| value.parse::<usize>().ok())
                        .ok_or_else(|| Error::InvalidFlag(flag.to_string()))?;
                    policy.max_mempool = megabytes.saturating_mul(MEGABYTE);
                }
                _ => {}
            }
        }
        Ok(policy)
    }

    /// Rate the wallet pays when it prices its own transactions.
    pub fn wallet_fee(&self) -> FeeRate {
        self.pay_fee.max(self.wallet_min_fee).max(self.relay_fee)
    }
}
