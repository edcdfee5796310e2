//! The voting loop: a single sequential task that aligns prevote and reveal
//! submission with on-chain vote periods.
//!
//! Prevote memory is only ever written after a transaction is confirmed
//! included, and reveals are built exclusively from that memory. A broadcast
//! that is rejected, dropped, or still pending when the confirmation window
//! closes leaves the loop's state untouched, so the next tick retries from a
//! consistent view.

use std::collections::HashMap;
use std::time::Duration;

use base64::prelude::*;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::cfg::FeederConfig;
use crate::client::{Chain, ClientError, TxResult};
use crate::price::{FeedError, PriceFeed, PriceObservation};
use crate::signer::{SignError, Signer};
use crate::transaction::{
    denom_for, fresh_salt, sign_bytes, vote_hash, Coin, Fee, OracleMsg, PubKey, SignDoc,
    StdSignature, StdTx,
};

/// Blocks at the end of a period during which the feeder acts. Acting any
/// earlier risks the reveal landing before its prevote's period closes;
/// acting later risks missing the period entirely.
const SUBMIT_WINDOW: u64 = 2;

/// Target wall interval between iteration starts, and the floor applied when
/// an iteration overruns the target.
const TICK_TARGET: Duration = Duration::from_secs(6);
const TICK_MIN: Duration = Duration::from_secs(5);

const CONFIRM_WINDOW: Duration = Duration::from_secs(45);
const CONFIRM_POLL: Duration = Duration::from_secs(1);

/// A prevote that made it into a block, keyed by currency in
/// [`Voter::prevote_memory`]. The reveal in the following period re-submits
/// exactly these values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedPrevote {
    pub price: String,
    pub salt: String,
    /// Vote period of the block that included the prevote.
    pub period: u64,
}

#[derive(Debug)]
pub enum TickOutcome {
    /// A transaction was confirmed included this tick.
    Submitted {
        period: u64,
        prevotes: usize,
        reveals: usize,
    },
    /// Nothing to do this tick.
    Waiting(&'static str),
}

/// Everything that aborts an iteration without touching state. The loop logs
/// these and moves on to the next tick.
#[derive(Debug, thiserror::Error)]
pub enum TickError {
    #[error("chain query failed: {0}")]
    Chain(#[from] ClientError),
    #[error("price sampling failed: {0}")]
    Prices(#[from] FeedError),
    #[error("signing failed: {0}")]
    Sign(#[from] SignError),
    #[error("transaction encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("broadcast rejected (code {code}): {raw_log}")]
    Rejected { code: u32, raw_log: String },
    #[error("transaction {txhash} failed on-chain (code {code}): {raw_log}")]
    Failed {
        txhash: String,
        code: u32,
        raw_log: String,
    },
    #[error("transaction {txhash} not included within {}s", CONFIRM_WINDOW.as_secs())]
    ConfirmTimeout { txhash: String },
}

struct PendingPrevote {
    currency: String,
    price: String,
    salt: String,
}

pub struct Voter<C, P> {
    chain: C,
    feed: P,
    signer: Box<dyn Signer>,
    cfg: FeederConfig,
    vote_period: u64,
    prevote_memory: HashMap<String, RecordedPrevote>,
    last_prevote_period: Option<u64>,
}

impl<C: Chain, P: PriceFeed> Voter<C, P> {
    pub fn new(
        chain: C,
        feed: P,
        signer: Box<dyn Signer>,
        cfg: FeederConfig,
        vote_period: u64,
    ) -> Self {
        assert!(vote_period > 0, "vote period must be positive");
        Voter {
            chain,
            feed,
            signer,
            cfg,
            vote_period,
            prevote_memory: HashMap::new(),
            last_prevote_period: None,
        }
    }

    /// Runs ticks forever, pacing them 5-6s apart. Every failure is logged
    /// and survived; a voter that crashes is worse than one that skips a
    /// period.
    pub async fn run(&mut self) {
        loop {
            let started = Instant::now();
            match self.tick().await {
                Ok(TickOutcome::Submitted {
                    period,
                    prevotes,
                    reveals,
                }) => {
                    info!(period, prevotes, reveals, "oracle transaction included");
                }
                Ok(TickOutcome::Waiting(reason)) => debug!(reason, "waiting"),
                Err(err) => warn!(%err, "skipping this tick"),
            }
            let pause = TICK_TARGET
                .saturating_sub(started.elapsed())
                .max(TICK_MIN);
            sleep(pause).await;
        }
    }

    /// One iteration of the state machine. State is only mutated in the
    /// final confirmation step.
    pub async fn tick(&mut self) -> Result<TickOutcome, TickError> {
        let height = self.chain.latest_block().await?;
        let period = height / self.vote_period;
        let index_in_period = height % self.vote_period;

        // Act in the last SUBMIT_WINDOW blocks of the period.
        if index_in_period + SUBMIT_WINDOW < self.vote_period {
            return Ok(TickOutcome::Waiting("early in vote period"));
        }
        if self.last_prevote_period == Some(period) {
            return Ok(TickOutcome::Waiting("already voted this period"));
        }

        let prices = self.feed.sample().await?;
        let account = self.chain.account(self.signer.address()).await?;

        let eligible: Vec<&PriceObservation> = prices
            .iter()
            .filter(|obs| self.cfg.denoms.allows(&obs.currency))
            .collect();

        let mut msgs = Vec::new();
        let feeder = self.signer.address().to_owned();

        // Reveals first: prices and salts committed in the previous period,
        // straight from memory, never from the current sample.
        let mut reveals = 0;
        for obs in &eligible {
            let Some(recorded) = self.prevote_memory.get(&obs.currency) else {
                continue;
            };
            if recorded.period + 1 != period {
                continue;
            }
            for validator in &self.cfg.validators {
                msgs.push(OracleMsg::Vote {
                    exchange_rate: recorded.price.clone(),
                    salt: recorded.salt.clone(),
                    denom: denom_for(&obs.currency),
                    feeder: feeder.clone(),
                    validator: validator.clone(),
                });
                reveals += 1;
            }
        }

        // Fresh prevotes for this period: one salt per currency, one
        // commitment per validator.
        let mut pending = Vec::new();
        for obs in &eligible {
            let salt = fresh_salt();
            let denom = denom_for(&obs.currency);
            for validator in &self.cfg.validators {
                msgs.push(OracleMsg::Prevote {
                    hash: vote_hash(&salt, &obs.price, &denom, validator),
                    denom: denom.clone(),
                    feeder: feeder.clone(),
                    validator: validator.clone(),
                });
            }
            pending.push(PendingPrevote {
                currency: obs.currency.clone(),
                price: obs.price.clone(),
                salt,
            });
        }

        if msgs.is_empty() {
            return Ok(TickOutcome::Waiting("no eligible currencies"));
        }
        let prevotes = msgs.len() - reveals;

        let gas = self.cfg.gas.gas_for(msgs.len());
        let fee = Fee {
            amount: vec![Coin {
                amount: self.cfg.gas.fee_for(gas).to_string(),
                denom: self.cfg.gas.fee_denom.clone(),
            }],
            gas: gas.to_string(),
        };

        let doc = SignDoc {
            account_number: account.account_number.to_string(),
            chain_id: &self.cfg.chain_id,
            fee: &fee,
            memo: &self.cfg.memo,
            msgs: &msgs,
            sequence: account.sequence.to_string(),
        };
        let signature = self.signer.sign(&sign_bytes(&doc)?).await?;

        let tx = StdTx {
            msg: msgs,
            fee,
            signatures: vec![StdSignature {
                pub_key: PubKey::secp256k1(self.signer.public_key_base64().to_owned()),
                signature: BASE64_STANDARD.encode(signature),
            }],
            memo: self.cfg.memo.clone(),
        };

        let broadcast = self.chain.broadcast(&tx).await?;
        if broadcast.code != 0 {
            return Err(TickError::Rejected {
                code: broadcast.code,
                raw_log: broadcast.raw_log.unwrap_or_default(),
            });
        }
        debug!(txhash = %broadcast.txhash, "broadcast accepted, awaiting inclusion");

        let included = self.confirm(&broadcast.txhash).await?;
        // The transaction may land in a later period than the one sampled
        // above; reveals must pair with the period that actually contains
        // the commitment.
        let included_period = included.height / self.vote_period;

        for prevote in pending {
            self.prevote_memory.insert(
                prevote.currency,
                RecordedPrevote {
                    price: prevote.price,
                    salt: prevote.salt,
                    period: included_period,
                },
            );
        }
        self.last_prevote_period = Some(included_period);

        if tracing::enabled!(tracing::Level::DEBUG) {
            self.log_onchain_prevotes().await;
        }

        Ok(TickOutcome::Submitted {
            period: included_period,
            prevotes,
            reveals,
        })
    }

    /// Polls for inclusion at 1 Hz until the window closes. Transient query
    /// failures inside the window are retried by the next poll.
    async fn confirm(&self, txhash: &str) -> Result<TxResult, TickError> {
        let deadline = Instant::now() + CONFIRM_WINDOW;
        loop {
            match self.chain.tx(txhash).await {
                Ok(Some(result)) => {
                    if result.code != 0 {
                        return Err(TickError::Failed {
                            txhash: txhash.to_owned(),
                            code: result.code,
                            raw_log: result.raw_log.unwrap_or_default(),
                        });
                    }
                    return Ok(result);
                }
                Ok(None) => {}
                // Intermittent failures are retried by the next poll;
                // anything else will not fix itself within the window.
                Err(err) if err.is_transient() => {
                    debug!(%err, txhash, "inclusion query failed, retrying")
                }
                Err(err) => return Err(err.into()),
            }
            if Instant::now() + CONFIRM_POLL > deadline {
                return Err(TickError::ConfirmTimeout {
                    txhash: txhash.to_owned(),
                });
            }
            sleep(CONFIRM_POLL).await;
        }
    }

    async fn log_onchain_prevotes(&self) {
        for recorded in self.prevote_memory.keys() {
            let denom = denom_for(recorded);
            for validator in &self.cfg.validators {
                match self.chain.prevote_record(&denom, validator).await {
                    Ok(Some(record)) => debug!(%denom, %validator, %record, "on-chain prevote"),
                    Ok(None) => debug!(%denom, %validator, "no on-chain prevote record"),
                    Err(err) => debug!(%err, "prevote record query failed"),
                }
            }
        }
    }

    #[cfg(test)]
    fn memory_snapshot(&self) -> (HashMap<String, RecordedPrevote>, Option<u64>) {
        (self.prevote_memory.clone(), self.last_prevote_period)
    }
}
