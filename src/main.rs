use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

use oracle_feeder::cfg::{self, DenomFilter, FeederConfig, GasPolicy};
use oracle_feeder::client::{Chain, ChainClient};
use oracle_feeder::keystore;
use oracle_feeder::price::HttpPriceFeed;
use oracle_feeder::signer::{operator_address, Signer, SoftwareSigner};
use oracle_feeder::voter::Voter;

#[derive(Debug, Parser)]
#[command(name = "oracle-feeder", about = "Commit-reveal oracle price feeder")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the voting loop.
    Vote(VoteArgs),
    /// Create or replace the encrypted keystore.
    UpdateKey(UpdateKeyArgs),
}

#[derive(Debug, Args)]
struct VoteArgs {
    /// LCD REST endpoint of the chain.
    #[arg(long)]
    lcd: Url,
    /// Chain ID included in every sign doc.
    #[arg(long = "chain-id")]
    chain_id: String,
    /// Price source URL; repeat for fallback sources.
    #[arg(long = "source", required = true)]
    sources: Vec<Url>,
    /// Validator operator address; repeatable. Defaults to the operator
    /// address of the feeder key itself.
    #[arg(long = "validator")]
    validators: Vec<String>,
    /// Currencies to vote on: `all` or a comma-separated list.
    #[arg(long, default_value = "all")]
    denoms: DenomFilter,
    #[arg(long, default_value = "voter.json")]
    keystore: PathBuf,
    /// Keystore passphrase; prompted when omitted.
    #[arg(long)]
    password: Option<String>,
    /// Sign with a Ledger device instead of the keystore.
    #[arg(long)]
    ledger: bool,
    /// Bech32 prefix of account addresses.
    #[arg(long, default_value = "terra")]
    hrp: String,
    /// Denom fees are paid in.
    #[arg(long = "fee-denom", default_value = "uluna")]
    fee_denom: String,
}

#[derive(Debug, Args)]
struct UpdateKeyArgs {
    #[arg(long, default_value = "voter.json")]
    keystore: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match Cli::parse().command {
        Command::Vote(args) => vote(args).await,
        Command::UpdateKey(args) => update_key(args),
    }
}

async fn vote(args: VoteArgs) -> Result<()> {
    let signer = build_signer(&args)?;

    let mut validators = cfg::normalize_validators(args.validators);
    if validators.is_empty() {
        // A validator feeding its own oracle slot: the operator address is
        // the feeder address under the operator prefix.
        validators.push(operator_address(signer.address())?);
    }

    let client = ChainClient::new(&args.lcd)?;
    let params = client
        .oracle_params()
        .await
        .context("fetching oracle parameters")?;
    if params.vote_period == 0 {
        bail!("chain reports a zero-length vote period");
    }
    let account = client
        .account(signer.address())
        .await
        .with_context(|| format!("looking up feeder account {}", signer.address()))?;

    info!(
        feeder = signer.address(),
        ?validators,
        vote_period = params.vote_period,
        account_number = account.account_number,
        sources = args.sources.len(),
        "starting oracle feeder"
    );

    let feed = HttpPriceFeed::new(args.sources.clone())?;
    let config = FeederConfig {
        lcd: args.lcd,
        chain_id: args.chain_id,
        sources: args.sources,
        validators,
        denoms: args.denoms,
        gas: GasPolicy {
            fee_denom: args.fee_denom,
            ..GasPolicy::default()
        },
        memo: String::new(),
    };

    let mut voter = Voter::new(client, feed, signer, config, params.vote_period);
    tokio::select! {
        () = voter.run() => unreachable!("the voting loop only ends on shutdown"),
        result = tokio::signal::ctrl_c() => {
            result.context("listening for shutdown signal")?;
            info!("shutting down");
            Ok(())
        }
    }
}

fn build_signer(args: &VoteArgs) -> Result<Box<dyn Signer>> {
    if args.ledger {
        return connect_ledger(&args.hrp);
    }

    let passphrase = match &args.password {
        Some(password) => password.clone(),
        None => rpassword::prompt_password("keystore passphrase: ")
            .context("reading keystore passphrase")?,
    };
    let mnemonic = keystore::read(&args.keystore, &passphrase)?;
    let signer = SoftwareSigner::from_mnemonic(&mnemonic, &args.hrp)
        .context("deriving the feeder key from the keystore")?;
    Ok(Box::new(signer))
}

#[cfg(feature = "ledger")]
fn connect_ledger(hrp: &str) -> Result<Box<dyn Signer>> {
    let signer = oracle_feeder::ledger::LedgerSigner::connect(hrp)
        .context("connecting to the Ledger device")?;
    Ok(Box::new(signer))
}

#[cfg(not(feature = "ledger"))]
fn connect_ledger(_hrp: &str) -> Result<Box<dyn Signer>> {
    bail!("this binary was built without ledger support (enable the `ledger` feature)")
}

fn update_key(args: UpdateKeyArgs) -> Result<()> {
    let passphrase =
        rpassword::prompt_password("new passphrase: ").context("reading passphrase")?;
    if passphrase.len() < 8 {
        bail!("passphrase must be at least 8 characters");
    }
    let confirmed =
        rpassword::prompt_password("repeat passphrase: ").context("reading passphrase")?;
    if passphrase != confirmed {
        bail!("passphrases do not match");
    }

    let mnemonic =
        rpassword::prompt_password("24-word mnemonic: ").context("reading mnemonic")?;
    let mnemonic = mnemonic.trim().to_owned();
    let words = mnemonic.split_whitespace().count();
    if words != 24 {
        bail!("expected a 24-word mnemonic, got {words} words");
    }
    if bip39::Mnemonic::parse_normalized(&mnemonic).is_err() {
        bail!("that is not a valid BIP-39 mnemonic");
    }

    keystore::write(&args.keystore, &passphrase, &mnemonic)?;
    println!("keystore written to {}", args.keystore.display());
    Ok(())
}
