pub mod cfg;
pub mod client;
pub mod keystore;
#[cfg(feature = "ledger")]
pub mod ledger;
pub mod price;
mod serde_util;
pub mod signer;
pub mod transaction;
pub mod voter;
