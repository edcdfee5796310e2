use std::{collections::BTreeSet, str::FromStr};

use anyhow::{anyhow, Result};
use url::Url;

/// Runtime configuration of the voting loop, assembled from CLI arguments.
#[derive(Debug, Clone)]
pub struct FeederConfig {
    pub lcd: Url,
    pub chain_id: String,
    pub sources: Vec<Url>,
    /// Validator operator addresses, in submission order.
    pub validators: Vec<String>,
    pub denoms: DenomFilter,
    pub gas: GasPolicy,
    pub memo: String,
}

/// Which currencies the feeder votes on. Anything outside the filter is
/// dropped from the sampled prices before messages are built.
#[derive(Debug, Clone)]
pub enum DenomFilter {
    All,
    Only(BTreeSet<String>),
}

impl DenomFilter {
    pub fn allows(&self, currency: &str) -> bool {
        match self {
            DenomFilter::All => true,
            DenomFilter::Only(set) => set.contains(currency),
        }
    }
}

impl FromStr for DenomFilter {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("all") {
            return Ok(DenomFilter::All);
        }
        let set = s
            .split(',')
            .map(|c| {
                let c = c.trim().to_ascii_lowercase();
                if c.is_empty() {
                    Err(anyhow!("empty currency in denom list"))
                } else {
                    Ok(c)
                }
            })
            .collect::<Result<BTreeSet<_>>>()?;
        if set.is_empty() {
            return Err(anyhow!("denom list must not be empty"));
        }
        Ok(DenomFilter::Only(set))
    }
}

/// Chain-policy constants for transaction gas and fees. The defaults are the
/// values the chain publishes; both are overridable per deployment.
#[derive(Debug, Clone)]
pub struct GasPolicy {
    pub base_gas: u64,
    pub gas_per_msg: u64,
    /// Fee per gas unit, in thousandths of the fee denom (15 = 0.015).
    pub fee_rate_milli: u64,
    pub fee_denom: String,
}

impl Default for GasPolicy {
    fn default() -> Self {
        GasPolicy {
            base_gas: 50_000,
            gas_per_msg: 7_500,
            fee_rate_milli: 15,
            fee_denom: "uluna".to_owned(),
        }
    }
}

impl GasPolicy {
    pub fn gas_for(&self, msg_count: usize) -> u64 {
        self.base_gas + self.gas_per_msg * msg_count as u64
    }

    /// Fee for `gas` units, rounded up to a whole fee-denom unit.
    pub fn fee_for(&self, gas: u64) -> u64 {
        (gas * self.fee_rate_milli).div_ceil(1000)
    }
}

/// Normalizes the validator list given on the command line: order is kept,
/// duplicates are dropped.
pub fn normalize_validators(validators: Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    validators
        .into_iter()
        .filter(|v| seen.insert(v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{normalize_validators, DenomFilter, GasPolicy};

    #[test]
    fn denom_filter_all() {
        let filter: DenomFilter = "all".parse().unwrap();
        assert!(filter.allows("krw"));
        assert!(filter.allows("anything"));
    }

    #[test]
    fn denom_filter_csv() {
        let filter: DenomFilter = "krw,usd,SDR".parse().unwrap();
        assert!(filter.allows("krw"));
        assert!(filter.allows("sdr"));
        assert!(!filter.allows("mnt"));
    }

    #[test]
    fn denom_filter_rejects_empty_entries() {
        assert!("krw,,usd".parse::<DenomFilter>().is_err());
        assert!("".parse::<DenomFilter>().is_err());
    }

    #[test]
    fn gas_and_fee_defaults() {
        let policy = GasPolicy::default();
        assert_eq!(policy.gas_for(2), 65_000);
        assert_eq!(policy.fee_for(65_000), 975);
    }

    #[test]
    fn fee_rounds_up() {
        let policy = GasPolicy::default();
        // 1 gas * 0.015 = 0.015, charged as a whole unit.
        assert_eq!(policy.fee_for(1), 1);
        assert_eq!(policy.fee_for(1000), 15);
    }

    #[test]
    fn validators_deduplicated_in_order() {
        let normalized = normalize_validators(vec![
            "valoper1".to_owned(),
            "valoper2".to_owned(),
            "valoper1".to_owned(),
        ]);
        assert_eq!(normalized, vec!["valoper1", "valoper2"]);
    }
}
