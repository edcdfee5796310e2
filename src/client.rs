//! Read and write access to the chain's LCD REST endpoint.
//!
//! One `reqwest` client is built per process; its keep-alive pool is shared
//! by every call the feeder makes.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use url::Url;

use crate::serde_util::num_as_str;
use crate::transaction::StdTx;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected status {status} from {path}")]
    Status { status: StatusCode, path: String },
    #[error("malformed response from {path}: {reason}")]
    Decode { path: String, reason: String },
}

impl ClientError {
    /// Transport failures and unexpected statuses reflect the node's
    /// momentary state and are worth retrying; an undecodable body
    /// indicates a misconfiguration.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ClientError::Decode { .. })
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Account {
    #[serde(deserialize_with = "num_as_str::deserialize")]
    pub account_number: u64,
    #[serde(deserialize_with = "num_as_str::deserialize")]
    pub sequence: u64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct OracleParams {
    /// Vote period length in blocks.
    #[serde(deserialize_with = "num_as_str::deserialize")]
    pub vote_period: u64,
}

/// Inclusion result of a transaction, from `/txs/{hash}`.
#[derive(Debug, Clone, Deserialize)]
pub struct TxResult {
    #[serde(deserialize_with = "num_as_str::deserialize")]
    pub height: u64,
    /// Application error code; absent means success.
    #[serde(default)]
    pub code: u32,
    #[serde(default)]
    pub raw_log: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastResult {
    pub txhash: String,
    #[serde(default)]
    pub code: u32,
    #[serde(default)]
    pub raw_log: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LatestBlock {
    block: Block,
}

#[derive(Debug, Deserialize)]
struct Block {
    header: BlockHeader,
}

#[derive(Debug, Deserialize)]
struct BlockHeader {
    #[serde(deserialize_with = "num_as_str::deserialize")]
    height: u64,
}

#[derive(Debug, Deserialize)]
struct AccountWrapper {
    value: Account,
}

#[derive(Debug, serde::Serialize)]
struct BroadcastRequest<'a> {
    tx: &'a StdTx,
    mode: &'a str,
}

/// The subset of chain access the voting loop uses. A trait so the loop's
/// scheduling and bookkeeping can be exercised against an in-memory chain.
#[async_trait]
pub trait Chain: Send + Sync {
    async fn latest_block(&self) -> Result<u64, ClientError>;
    async fn account(&self, address: &str) -> Result<Account, ClientError>;
    async fn broadcast(&self, tx: &StdTx) -> Result<BroadcastResult, ClientError>;
    /// `None` means the transaction is not yet included in a block.
    async fn tx(&self, hash: &str) -> Result<Option<TxResult>, ClientError>;
    /// Diagnostic read of the on-chain prevote record for a denom/validator.
    async fn prevote_record(
        &self,
        _denom: &str,
        _validator: &str,
    ) -> Result<Option<serde_json::Value>, ClientError> {
        Ok(None)
    }
}

pub struct ChainClient {
    http: reqwest::Client,
    base: String,
}

impl ChainClient {
    pub fn new(lcd: &Url) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(ChainClient {
            http,
            base: lcd.as_str().trim_end_matches('/').to_owned(),
        })
    }

    pub async fn oracle_params(&self) -> Result<OracleParams, ClientError> {
        self.get_json("/oracle/params").await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let response = self.http.get(format!("{}{path}", self.base)).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                status,
                path: path.to_owned(),
            });
        }
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| ClientError::Decode {
            path: path.to_owned(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl Chain for ChainClient {
    async fn latest_block(&self) -> Result<u64, ClientError> {
        let latest: LatestBlock = self.get_json("/blocks/latest").await?;
        Ok(latest.block.header.height)
    }

    async fn account(&self, address: &str) -> Result<Account, ClientError> {
        let wrapper: AccountWrapper = self.get_json(&format!("/auth/accounts/{address}")).await?;
        Ok(wrapper.value)
    }

    async fn broadcast(&self, tx: &StdTx) -> Result<BroadcastResult, ClientError> {
        let path = "/txs";
        let response = self
            .http
            .post(format!("{}{path}", self.base))
            .json(&BroadcastRequest { tx, mode: "sync" })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                status,
                path: path.to_owned(),
            });
        }
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| ClientError::Decode {
            path: path.to_owned(),
            reason: e.to_string(),
        })
    }

    async fn tx(&self, hash: &str) -> Result<Option<TxResult>, ClientError> {
        let path = format!("/txs/{hash}");
        let response = self.http.get(format!("{}{path}", self.base)).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ClientError::Status { status, path });
        }
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| ClientError::Decode {
                path,
                reason: e.to_string(),
            })
    }

    async fn prevote_record(
        &self,
        denom: &str,
        validator: &str,
    ) -> Result<Option<serde_json::Value>, ClientError> {
        let path = format!("/oracle/denoms/{denom}/prevotes/{validator}");
        let response = self.http.get(format!("{}{path}", self.base)).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ClientError::Status { status, path });
        }
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| ClientError::Decode {
                path,
                reason: e.to_string(),
            })
    }
}
