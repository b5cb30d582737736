//! `uob`: operator CLI for the referral chain engine.
//!
//! Every command loads the JSON state file, runs one engine operation and
//! writes the state back. Results go to stdout as JSON; logs go to stderr.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use bacon_core::anonymity::SellerAnonymizer;
use bacon_core::codes::ShareLink;
use bacon_core::fingerprint::Contact;
use bacon_core::payout::{Cents, RewardRate};
use bacon_core::MAX_DEGREES;
use clap::{Args, Parser, Subcommand, ValueEnum};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::{rngs::OsRng, RngCore};
use referral_engine::audit::{AuditSigner, AuditVerifier};
use referral_engine::clock::{Clock, SystemClock};
use referral_engine::ledger::PayoutLedger;
use referral_engine::listing::{
    Listing, ListingImage, ListingStatus, PaymentConfirmation, PaymentState, SellerContact,
};
use referral_engine::store::{ChainStore, MemoryChainStore, StoreSnapshot};
use referral_engine::types::{Actor, VerificationLevel, MS_PER_DAY};
use referral_engine::{ChainManager, EngineConfig, SaleConfirmation, ShareRequest};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const AUDIT_SIGNER_ID: &str = "uob-platform";

#[derive(Parser)]
#[command(name = "uob", version, about = "University of Bacon referral chain operator CLI")]
struct Cli {
    /// JSON state file holding every listing, chain and payout.
    #[arg(long, global = true, default_value = "uob.state.json")]
    state: PathBuf,

    /// Engine configuration (JSON). `UOB_*` variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Listing management.
    #[command(subcommand)]
    Listing(ListingCommand),

    /// Record a share and print the resulting chain position.
    Share(ShareArgs),

    /// Resolve a share link the way a prospect would see it.
    Click(ClickArgs),

    /// Complete a sale through a chain and pay out bacon.
    Sell(SellArgs),

    /// Reveal seller contact to a buyer with a captured payment.
    Reveal(RevealArgs),

    /// Check reveal receipts of a listing against a platform public key.
    VerifyReceipts(VerifyReceiptsArgs),

    /// Replay all distributions into the payout ledger.
    Ledger,

    /// Bacon per degree at a listing's asking price.
    Quote(QuoteArgs),

    /// Persist expiry of inactive chains on a listing.
    Expire(ExpireArgs),

    /// Generate an ed25519 audit keypair.
    Keygen(KeygenArgs),
}

#[derive(Subcommand)]
enum ListingCommand {
    /// Add or replace a listing.
    Add(ListingAddArgs),

    /// Show the public view of a listing and its chains.
    Show {
        /// Listing id.
        id: String,
    },

    /// Take a listing down, flag it, or put it back up.
    Moderate {
        /// Listing id.
        id: String,

        #[arg(long, value_enum)]
        status: Moderation,
    },
}

#[derive(Args)]
struct ListingAddArgs {
    #[arg(long)]
    id: String,

    #[arg(long)]
    seller: String,

    #[arg(long)]
    title: String,

    #[arg(long, default_value = "")]
    description: String,

    /// Asking price in dollars, e.g. `1000` or `19.99`.
    #[arg(long, value_parser = parse_money)]
    price: Cents,

    /// Share of the sale price paid as bacon, in percent.
    #[arg(long, default_value_t = 10)]
    reward_percent: u32,

    #[arg(long, default_value_t = MAX_DEGREES)]
    max_degrees: u8,

    #[arg(long)]
    seller_name: String,

    #[arg(long)]
    seller_email: Option<String>,

    #[arg(long)]
    seller_phone: Option<String>,

    #[arg(long)]
    seller_address: Option<String>,

    /// Image URL; repeatable.
    #[arg(long = "image")]
    images: Vec<String>,
}

#[derive(Args)]
struct ActorArgs {
    /// Acting user id.
    #[arg(long = "user")]
    user_id: String,

    #[arg(long, default_value_t = 365)]
    account_age_days: u64,

    #[arg(long, value_enum, default_value_t = Verification::Email)]
    verification: Verification,

    #[arg(long)]
    device: Option<String>,
}

impl ActorArgs {
    fn actor(&self, now_ms: u64) -> Actor {
        let mut actor = Actor::new(
            self.user_id.clone(),
            now_ms.saturating_sub(self.account_age_days * MS_PER_DAY),
        )
        .verified(self.verification.into());
        if let Some(device) = &self.device {
            actor = actor.on_device(device.clone());
        }
        actor
    }
}

#[derive(Args)]
struct ShareArgs {
    #[arg(long)]
    listing: String,

    #[command(flatten)]
    referrer: ActorArgs,

    /// Prospect email.
    #[arg(long)]
    email: Option<String>,

    /// Prospect phone.
    #[arg(long)]
    phone: Option<String>,

    /// Prospect name.
    #[arg(long)]
    name: Option<String>,

    /// Code of the chain the referrer arrived through.
    #[arg(long)]
    parent: Option<String>,
}

#[derive(Args)]
struct ClickArgs {
    /// Full share URL.
    #[arg(long, conflicts_with_all = ["chain", "referral"])]
    url: Option<String>,

    #[arg(long, requires = "referral")]
    chain: Option<String>,

    #[arg(long = "ref", requires = "chain")]
    referral: Option<String>,
}

#[derive(Args)]
struct PaymentArgs {
    #[arg(long)]
    payment_ref: String,

    /// Amount paid in dollars.
    #[arg(long, value_parser = parse_money)]
    amount: Cents,

    #[arg(long, value_enum, default_value_t = Payment::Captured)]
    payment_state: Payment,
}

impl PaymentArgs {
    fn confirmation(&self, listing_id: &str, buyer_id: &str) -> PaymentConfirmation {
        PaymentConfirmation {
            listing_id: listing_id.to_string(),
            buyer_id: buyer_id.to_string(),
            payment_reference: self.payment_ref.clone(),
            state: self.payment_state.into(),
            amount: self.amount,
        }
    }
}

#[derive(Args)]
struct SellArgs {
    /// Chain the sale is attributed to.
    #[arg(long)]
    chain: String,

    #[command(flatten)]
    buyer: ActorArgs,

    #[command(flatten)]
    payment: PaymentArgs,
}

#[derive(Args)]
struct RevealArgs {
    #[arg(long)]
    listing: String,

    #[arg(long)]
    buyer: String,

    /// Hex ed25519 secret written by `keygen`.
    #[arg(long)]
    audit_key: PathBuf,

    #[command(flatten)]
    payment: PaymentArgs,
}

#[derive(Args)]
struct VerifyReceiptsArgs {
    #[arg(long)]
    listing: String,

    /// Hex ed25519 public key written by `keygen`.
    #[arg(long)]
    audit_pub: PathBuf,
}

#[derive(Args)]
struct QuoteArgs {
    #[arg(long)]
    listing: String,
}

#[derive(Args)]
struct ExpireArgs {
    #[arg(long)]
    listing: String,
}

#[derive(Args)]
struct KeygenArgs {
    #[arg(long)]
    out_dir: PathBuf,
}

#[derive(Clone, Copy, ValueEnum)]
enum Verification {
    Unverified,
    Email,
    Phone,
    Identity,
}

impl From<Verification> for VerificationLevel {
    fn from(level: Verification) -> Self {
        match level {
            Verification::Unverified => VerificationLevel::Unverified,
            Verification::Email => VerificationLevel::Email,
            Verification::Phone => VerificationLevel::Phone,
            Verification::Identity => VerificationLevel::Identity,
        }
    }
}

/// Listing states an operator may set. `Sold` only comes from a sale.
#[derive(Clone, Copy, ValueEnum)]
enum Moderation {
    Active,
    Removed,
    Flagged,
}

impl From<Moderation> for ListingStatus {
    fn from(status: Moderation) -> Self {
        match status {
            Moderation::Active => ListingStatus::Active,
            Moderation::Removed => ListingStatus::Removed,
            Moderation::Flagged => ListingStatus::Flagged,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Payment {
    Pending,
    Authorized,
    Captured,
    Refunded,
}

impl From<Payment> for PaymentState {
    fn from(state: Payment) -> Self {
        match state {
            Payment::Pending => PaymentState::Pending,
            Payment::Authorized => PaymentState::Authorized,
            Payment::Captured => PaymentState::Captured,
            Payment::Refunded => PaymentState::Refunded,
        }
    }
}

/// On-disk CLI state: the store tables plus the anonymizer secret, so
/// anonymous identities stay stable across runs.
#[derive(Serialize, Deserialize)]
struct StateFile {
    anonymizer_secret: String,
    #[serde(default)]
    store: StoreSnapshot,
}

struct Workspace {
    secret: [u8; 32],
    store: Arc<MemoryChainStore>,
}

impl Workspace {
    fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "starting with empty state");
            return Ok(Self {
                secret: *SellerAnonymizer::generate().as_bytes(),
                store: Arc::new(MemoryChainStore::new()),
            });
        }
        let bytes = fs::read(path).with_context(|| format!("read state {}", path.display()))?;
        let state: StateFile = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse state {}", path.display()))?;
        let secret: [u8; 32] = hex::decode(state.anonymizer_secret.trim())
            .context("anonymizer secret is not hex")?
            .try_into()
            .map_err(|_| anyhow!("anonymizer secret must be 32 bytes"))?;
        Ok(Self {
            secret,
            store: Arc::new(MemoryChainStore::from_snapshot(state.store)),
        })
    }

    fn save(&self, path: &Path) -> Result<()> {
        let state = StateFile {
            anonymizer_secret: hex::encode(self.secret),
            store: self.store.snapshot(),
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(path, serde_json::to_vec_pretty(&state)?)
            .with_context(|| format!("write state {}", path.display()))
    }

    fn manager(&self, config: EngineConfig) -> ChainManager<MemoryChainStore> {
        ChainManager::new(
            Arc::clone(&self.store),
            config,
            Arc::new(SystemClock),
            SellerAnonymizer::from_bytes(self.secret),
        )
    }
}

fn parse_money(raw: &str) -> Result<Cents, String> {
    let trimmed = raw.trim().trim_start_matches('$');
    let (whole, frac) = trimmed.split_once('.').unwrap_or((trimmed, ""));
    let digits = |s: &str| s.chars().all(|c| c.is_ascii_digit());
    if whole.is_empty() || frac.len() > 2 || !digits(whole) || !digits(frac) {
        return Err(format!("invalid amount {raw:?}, expected dollars like 19.99"));
    }
    let dollars: u64 = whole.parse().map_err(|e| format!("invalid amount {raw:?}: {e}"))?;
    let cents: u64 = if frac.is_empty() {
        0
    } else {
        format!("{frac:0<2}")
            .parse()
            .map_err(|e| format!("invalid amount {raw:?}: {e}"))?
    };
    dollars
        .checked_mul(100)
        .and_then(|c| c.checked_add(cents))
        .map(Cents)
        .ok_or_else(|| format!("amount {raw:?} is too large"))
}

fn read_hex_key(path: &Path) -> Result<[u8; 32]> {
    let raw = fs::read_to_string(path).with_context(|| format!("read key {}", path.display()))?;
    hex::decode(raw.trim())
        .with_context(|| format!("key {} is not hex", path.display()))?
        .try_into()
        .map_err(|_| anyhow!("key {} must be 32 bytes", path.display()))
}

fn execute(cli: &Cli) -> Result<Value> {
    let config = EngineConfig::load(cli.config.as_deref())?;
    let workspace = Workspace::load(&cli.state)?;
    let manager = workspace.manager(config);
    let now = SystemClock.now_ms();

    let output = match &cli.command {
        Command::Listing(ListingCommand::Add(args)) => {
            let mut listing = Listing::new(
                args.id.clone(),
                args.seller.clone(),
                args.title.clone(),
                args.price,
                RewardRate::from_percent(args.reward_percent)?,
                SellerContact {
                    name: args.seller_name.clone(),
                    email: args.seller_email.clone(),
                    phone: args.seller_phone.clone(),
                    address: args.seller_address.clone(),
                    social_links: Vec::new(),
                },
            );
            if args.max_degrees == 0 || args.max_degrees > MAX_DEGREES {
                bail!("max degrees must be within 1..={MAX_DEGREES}");
            }
            listing.description = args.description.clone();
            listing.max_degrees = args.max_degrees;
            listing.images = args
                .images
                .iter()
                .map(|url| ListingImage {
                    url: url.clone(),
                    metadata: Default::default(),
                })
                .collect();
            workspace.store.insert_listing(listing)?;
            info!(listing_id = %args.id, "listing stored");
            serde_json::to_value(manager.public_listing(&args.id)?)?
        }
        Command::Listing(ListingCommand::Show { id }) => {
            let public = manager.public_listing(id)?;
            let window = manager.config().chain_inactivity_ms();
            let chains: Vec<Value> = workspace
                .store
                .chains_for_listing(id)?
                .into_iter()
                .map(|chain| -> Result<Value> {
                    let degrees = workspace.store.links(chain.id)?.len();
                    Ok(json!({
                        "chain_code": chain.code,
                        "status": chain.effective_status(now, window),
                        "degrees": degrees,
                    }))
                })
                .collect::<Result<_>>()?;
            json!({ "listing": public, "chains": chains })
        }
        Command::Listing(ListingCommand::Moderate { id, status }) => {
            let listing = workspace
                .store
                .listing(id)?
                .ok_or_else(|| anyhow!("listing {id} not found"))?;
            if listing.status == ListingStatus::Sold {
                bail!("listing {id} is sold");
            }
            let status = ListingStatus::from(*status);
            workspace.store.set_listing_status(id, status)?;
            info!(listing_id = %id, ?status, "listing status changed");
            json!({ "listing_id": id, "status": status })
        }
        Command::Share(args) => {
            let contact = (args.email.is_some() || args.phone.is_some() || args.name.is_some())
                .then(|| Contact {
                    email: args.email.clone(),
                    phone: args.phone.clone(),
                    name: args.name.clone(),
                });
            let result = manager.create_or_extend_chain(ShareRequest {
                listing_id: args.listing.clone(),
                referrer: args.referrer.actor(now),
                contact,
                parent_chain: args.parent.clone(),
            })?;
            serde_json::to_value(result)?
        }
        Command::Click(args) => {
            let (chain, referral) = match (&args.url, &args.chain, &args.referral) {
                (Some(url), _, _) => match ShareLink::parse(url)? {
                    ShareLink::Course {
                        chain_code,
                        referral_code,
                        ..
                    } => (chain_code, referral_code),
                    ShareLink::Listing { .. } => {
                        bail!("listing links carry no chain; share through a chain link")
                    }
                },
                (None, Some(chain), Some(referral)) => (chain.clone(), referral.clone()),
                _ => bail!("pass --url or both --chain and --ref"),
            };
            serde_json::to_value(manager.resolve_click(&chain, &referral)?)?
        }
        Command::Sell(args) => {
            let chain = workspace
                .store
                .chain_by_code(&args.chain)?
                .ok_or_else(|| anyhow!("link no longer valid"))?;
            let buyer = args.buyer.actor(now);
            let payment = args.payment.confirmation(&chain.listing_id, &buyer.user_id);
            let distribution = manager.complete_sale(&args.chain, SaleConfirmation { buyer, payment })?;
            serde_json::to_value(distribution)?
        }
        Command::Reveal(args) => {
            let signer = AuditSigner::new(
                AUDIT_SIGNER_ID,
                SigningKey::from_bytes(&read_hex_key(&args.audit_key)?),
            );
            let payment = args.payment.confirmation(&args.listing, &args.buyer);
            serde_json::to_value(manager.reveal(&signer, &args.listing, &args.buyer, &payment)?)?
        }
        Command::VerifyReceipts(args) => {
            let key = VerifyingKey::from_bytes(&read_hex_key(&args.audit_pub)?)
                .map_err(|e| anyhow!("invalid public key: {e}"))?;
            let verifier = AuditVerifier::new(vec![(AUDIT_SIGNER_ID.to_string(), key)]);
            let receipts: Vec<Value> = workspace
                .store
                .reveals(&args.listing)?
                .iter()
                .map(|receipt| {
                    json!({
                        "buyer_id": receipt.core.buyer_id,
                        "revealed_at_ms": receipt.core.revealed_at_ms,
                        "valid": verifier.verify(receipt).is_ok(),
                    })
                })
                .collect();
            json!({ "listing_id": args.listing, "receipts": receipts })
        }
        Command::Ledger => {
            let snapshot = workspace.store.snapshot();
            let ledger = PayoutLedger::replay(snapshot.distributions.values())?;
            serde_json::to_value(ledger.snapshot())?
        }
        Command::Quote(args) => {
            let degrees: Vec<Value> = (1..=MAX_DEGREES)
                .map(|degree| -> Result<Value> {
                    let bacon = manager.potential_bacon(&args.listing, degree)?;
                    Ok(json!({ "degree": degree, "bacon": bacon }))
                })
                .collect::<Result<_>>()?;
            json!({ "listing_id": args.listing, "degrees": degrees })
        }
        Command::Expire(args) => {
            let expired = manager.expire_stale_chains(&args.listing)?;
            json!({ "listing_id": args.listing, "expired": expired })
        }
        Command::Keygen(args) => {
            fs::create_dir_all(&args.out_dir)
                .with_context(|| format!("create {}", args.out_dir.display()))?;
            let mut secret = [0u8; 32];
            OsRng.fill_bytes(&mut secret);
            let public = SigningKey::from_bytes(&secret).verifying_key();
            fs::write(args.out_dir.join("sk.hex"), hex::encode(secret))?;
            fs::write(args.out_dir.join("pk.hex"), hex::encode(public.as_bytes()))?;
            // Keys live outside the state file.
            return Ok(json!({
                "secret": args.out_dir.join("sk.hex"),
                "public": args.out_dir.join("pk.hex"),
            }));
        }
    };

    workspace.save(&cli.state)?;
    Ok(output)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("uob=info,referral_engine=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output = execute(&cli)?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(state: &Path, args: &[&str]) -> Result<Value> {
        let mut argv = vec!["uob", "--state", state.to_str().unwrap()];
        argv.extend_from_slice(args);
        execute(&Cli::try_parse_from(argv)?)
    }

    fn add_listing(state: &Path) {
        run(
            state,
            &[
                "listing", "add", "--id", "lst-1", "--seller", "seller-1", "--title", "Bacon press",
                "--price", "1000", "--reward-percent", "20", "--seller-name", "Kevin Bacon",
                "--seller-email", "kevin@bacon.example", "--image",
                "https://cdn.example/p.jpg?uploader=kevin",
            ],
        )
        .unwrap();
    }

    #[test]
    fn money_parses_dollars_and_cents() {
        assert_eq!(parse_money("1000"), Ok(Cents(100_000)));
        assert_eq!(parse_money("$19.9"), Ok(Cents(1_990)));
        assert_eq!(parse_money("0.05"), Ok(Cents(5)));
        assert!(parse_money("1.234").is_err());
        assert!(parse_money("-3").is_err());
        assert!(parse_money("").is_err());
    }

    #[test]
    fn share_then_sell_persists_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("state.json");
        add_listing(&state);

        let first = run(
            &state,
            &["share", "--listing", "lst-1", "--user", "alice", "--email", "pat@example.com"],
        )
        .unwrap();
        assert_eq!(first["degree_position"], 1);
        let chain_code = first["chain_code"].as_str().unwrap().to_string();

        let second = run(
            &state,
            &["share", "--listing", "lst-1", "--user", "bob", "--email", "PAT@example.com "],
        )
        .unwrap();
        assert_eq!(second["chain_code"], chain_code.as_str());
        assert_eq!(second["degree_position"], 2);

        let click = run(&state, &["click", "--url", second["share_url"].as_str().unwrap()]).unwrap();
        assert_eq!(click["referrer_degree"], 2);
        assert!(!click.to_string().contains("Kevin"));

        let sale = run(
            &state,
            &[
                "sell", "--chain", &chain_code, "--user", "buyer-1", "--payment-ref", "pi_1",
                "--amount", "1000",
            ],
        )
        .unwrap();
        assert_eq!(sale["pool"], 20_000);
        assert_eq!(sale["unallocated"], 5_000);

        let ledger = run(&state, &["ledger"]).unwrap();
        assert_eq!(ledger["accounts"]["alice"]["earned"], 10_000);
        assert_eq!(ledger["accounts"]["overflow-fund"]["earned"], 5_000);
    }

    #[test]
    fn anonymous_seller_identity_is_stable_between_runs() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("state.json");
        add_listing(&state);
        let a = run(&state, &["listing", "show", "lst-1"]).unwrap();
        let b = run(&state, &["listing", "show", "lst-1"]).unwrap();
        assert_eq!(a["listing"]["seller"], b["listing"]["seller"]);
        assert_eq!(a["listing"]["images"][0]["url"], "https://cdn.example/p.jpg");
    }

    #[test]
    fn reveal_receipts_verify_with_generated_keys() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("state.json");
        let keys = dir.path().join("keys");
        add_listing(&state);
        run(&state, &["keygen", "--out-dir", keys.to_str().unwrap()]).unwrap();

        let sk = keys.join("sk.hex");
        let reveal_args = [
            "reveal", "--listing", "lst-1", "--buyer", "buyer-1", "--audit-key",
            sk.to_str().unwrap(), "--payment-ref", "pi_9", "--amount", "1000",
        ];
        let revealed = run(&state, &reveal_args).unwrap();
        assert_eq!(revealed["contact"]["email"], "kevin@bacon.example");
        assert!(run(&state, &reveal_args).is_err());

        let pk = keys.join("pk.hex");
        let verified = run(
            &state,
            &["verify-receipts", "--listing", "lst-1", "--audit-pub", pk.to_str().unwrap()],
        )
        .unwrap();
        assert_eq!(verified["receipts"][0]["valid"], true);
    }

    #[test]
    fn removed_listing_rejects_shares_until_restored() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("state.json");
        add_listing(&state);
        let share = ["share", "--listing", "lst-1", "--user", "alice"];

        let moderated = run(&state, &["listing", "moderate", "lst-1", "--status", "removed"]).unwrap();
        assert_eq!(moderated["status"], "removed");
        assert!(run(&state, &share).is_err());

        run(&state, &["listing", "moderate", "lst-1", "--status", "active"]).unwrap();
        assert_eq!(run(&state, &share).unwrap()["degree_position"], 1);
    }

    #[test]
    fn quote_lists_every_degree() {
        let dir = tempfile::tempdir().unwrap();
        let state = dir.path().join("state.json");
        add_listing(&state);
        let quote = run(&state, &["quote", "--listing", "lst-1"]).unwrap();
        let bacon: Vec<u64> = quote["degrees"]
            .as_array()
            .unwrap()
            .iter()
            .map(|d| d["bacon"].as_u64().unwrap())
            .collect();
        assert_eq!(bacon, vec![10_000, 5_000, 2_000, 1_500, 1_000, 500]);
    }
}
