//! Airgap CLI
//!
//! Command-line front end for air-gapped multisig signing:
//! - Fragment encoding and decoding
//! - Offline key generation and signing
//! - Signature verification and full in-process rounds

use airgap_core::chain::{evm, utxo};
use airgap_core::finalize::MemoryContract;
use airgap_core::proposal::DEFAULT_ACCOUNT_PATH;
use airgap_core::{
    AccountCall, AccountFinalizer, ColdSigner, ColdSignerConfig, ColdSignerEvent,
    CoordinatorConfig, CoordinatorEvent, DerivationSuffix, FinalizeOutcome, HdWallet, HexData,
    KeyDeriver, SignatureShare, SigningCoordinator, TransactionProposal, UnsignedPayload,
};
use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rand::rngs::{OsRng, StdRng};
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use std::io::{self, BufRead, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn, Level};
use ur_fragments::{DecodeSession, DecodeState};

/// Account-model wallet root used when none is given
const DEFAULT_ROOT_PATH: &str = "m/44'/60'/0'";

/// Airgap - multisig signing across an air gap
#[derive(Parser)]
#[command(name = "airgap")]
#[command(about = "Air-gapped multisig signing over animated QR fragments")]
#[command(version)]
struct Cli {
    /// Log output format
    #[arg(long, env = "AIRGAP_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Split a payload into fragments, one per line
    Encode {
        /// Payload file (stdin when omitted)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Treat the input as hex text
        #[arg(long)]
        hex: bool,

        /// Maximum segment length per fragment
        #[arg(short, long, env = "AIRGAP_CAPACITY", default_value_t = ur_fragments::DEFAULT_FRAGMENT_CAPACITY)]
        capacity: usize,
    },

    /// Reassemble fragments given in any order
    Decode {
        /// Fragment file (stdin when omitted)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Print the payload as hex
        #[arg(long)]
        hex: bool,
    },

    /// Generate a new master key
    Keygen {
        /// Write the xprv here instead of printing it
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Wallet root the printed address hangs off
        #[arg(short, long, env = "AIRGAP_ROOT_PATH", default_value = DEFAULT_ROOT_PATH)]
        root_path: String,
    },

    /// Show the signer address for a wallet root
    Address {
        /// File holding the master xprv
        #[arg(short, long, env = "AIRGAP_XPRV_FILE")]
        xprv_file: PathBuf,

        #[arg(short, long, env = "AIRGAP_ROOT_PATH", default_value = DEFAULT_ROOT_PATH)]
        root_path: String,

        /// Relative suffix below the root
        #[arg(short, long, default_value = DEFAULT_ACCOUNT_PATH)]
        suffix: String,
    },

    /// Sign a scanned request and print the signature fragments
    ColdSign {
        #[arg(short, long, env = "AIRGAP_XPRV_FILE")]
        xprv_file: PathBuf,

        #[arg(short, long, env = "AIRGAP_ROOT_PATH", default_value = DEFAULT_ROOT_PATH)]
        root_path: String,

        /// Scanned lines (stdin when omitted)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Override the per-chain fragment capacity
        #[arg(short, long, env = "AIRGAP_CAPACITY")]
        capacity: Option<usize>,
    },

    /// Check returned signatures against a signing request
    Verify {
        /// Fragments of the unsigned request
        #[arg(short, long)]
        request: PathBuf,

        /// Fragments of one returned signature, repeatable
        #[arg(short, long, required = true)]
        signature: Vec<PathBuf>,
    },

    /// Run an m-of-n contract spend between in-process devices
    Simulate {
        /// Signatures required
        #[arg(short = 'm', long, default_value_t = 2)]
        required: usize,

        /// Owners of the contract
        #[arg(short = 'n', long, default_value_t = 3)]
        total: usize,

        /// Seed for keys and camera shuffling
        #[arg(long, default_value_t = 0)]
        seed: u64,

        #[arg(short, long, env = "AIRGAP_CAPACITY")]
        capacity: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Commands::Encode {
            ref input,
            hex: as_hex,
            capacity,
        } => run_encode(input.as_deref(), as_hex, capacity)?,
        Commands::Decode {
            ref input,
            hex: as_hex,
        } => run_decode(input.as_deref(), as_hex)?,
        Commands::Keygen {
            ref out,
            ref root_path,
        } => run_keygen(out.as_deref(), root_path)?,
        Commands::Address {
            ref xprv_file,
            ref root_path,
            ref suffix,
        } => run_address(xprv_file, root_path, suffix)?,
        Commands::ColdSign {
            ref xprv_file,
            ref root_path,
            ref input,
            capacity,
        } => run_cold_sign(xprv_file, root_path, input.as_deref(), capacity)?,
        Commands::Verify {
            ref request,
            ref signature,
        } => run_verify(request, signature)?,
        Commands::Simulate {
            required,
            total,
            seed,
            capacity,
        } => run_simulate(required, total, seed, capacity).await?,
    }

    Ok(())
}

/// Logs go to stderr; stdout carries fragments and payloads
fn init_tracing(format: LogFormat) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()),
        )
        .with_writer(io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn run_encode(input: Option<&Path>, as_hex: bool, capacity: usize) -> Result<()> {
    let mut payload = read_input(input)?;
    if as_hex {
        let text = String::from_utf8(payload).context("hex input is not text")?;
        payload = hex::decode(text.trim())?;
    }

    let fragments = ur_fragments::encode_to_strings(&payload, capacity)?;
    info!(
        bytes = payload.len(),
        fragments = fragments.len(),
        capacity,
        "Payload encoded"
    );

    for fragment in &fragments {
        println!("{fragment}");
    }

    Ok(())
}

fn run_decode(input: Option<&Path>, as_hex: bool) -> Result<()> {
    let payload = decode_fragments(&read_lines(input)?)?;
    info!(bytes = payload.len(), "Payload reassembled");

    if as_hex {
        println!("{}", hex::encode(&payload));
    } else {
        match String::from_utf8(payload) {
            Ok(text) => println!("{text}"),
            Err(e) => println!("{}", hex::encode(e.as_bytes())),
        }
    }

    Ok(())
}

fn run_keygen(out: Option<&Path>, root_path: &str) -> Result<()> {
    let mut seed = [0u8; 32];
    OsRng.fill_bytes(&mut seed);
    let wallet = HdWallet::from_seed(&seed)?;
    seed.fill(0);

    let suffix: DerivationSuffix = DEFAULT_ACCOUNT_PATH.parse()?;
    let address = wallet.derive(root_path, &suffix)?.address();
    let xprv = wallet.master().to_xprv();

    match out {
        Some(path) => {
            std::fs::write(path, format!("{xprv}\n"))?;
            info!(path = ?path, "Master key saved");
        }
        None => println!("xprv: {xprv}"),
    }
    println!("Address ({root_path}/{suffix}): {address}");

    Ok(())
}

fn run_address(xprv_file: &Path, root_path: &str, suffix: &str) -> Result<()> {
    let wallet = load_wallet(xprv_file)?;
    let suffix: DerivationSuffix = suffix.parse()?;
    let address = wallet.derive(root_path, &suffix)?.address();

    println!("{address}");

    Ok(())
}

fn run_cold_sign(
    xprv_file: &Path,
    root_path: &str,
    input: Option<&Path>,
    capacity: Option<usize>,
) -> Result<()> {
    let wallet = load_wallet(xprv_file)?;
    let config = ColdSignerConfig {
        fragment_capacity: capacity,
        ..Default::default()
    };
    let mut cold = ColdSigner::new(wallet, root_path, config)?;

    for line in read_lines(input)? {
        match cold.on_scan(&line)? {
            ColdSignerEvent::Progress(p) => {
                debug!(received = p.received.len(), expected = p.expected, "Scanning")
            }
            ColdSignerEvent::Ignored => warn!(%line, "Not a fragment, ignored"),
            ColdSignerEvent::Restarted => warn!("Request corrupted, scanning again"),
            ColdSignerEvent::Signed { fragments } => {
                if let Some(request) = cold.request() {
                    info!(
                        kind = %request.txp.kind(),
                        coin = request.txp.coin(),
                        remaining = request.round.remaining,
                        "Request signed"
                    );
                }
                for fragment in &fragments {
                    println!("{fragment}");
                }
                cold.finish()?;
                return Ok(());
            }
        }
    }

    let progress = cold.progress();
    cold.cancel();
    match progress {
        Some(p) => bail!(
            "input ended with {} of {} request fragments",
            p.received.len(),
            p.expected
        ),
        None => bail!("input held no request fragments"),
    }
}

fn run_verify(request: &Path, signatures: &[PathBuf]) -> Result<()> {
    let bytes = decode_fragments(&read_lines(Some(request))?)?;
    let request = UnsignedPayload::from_bytes(&bytes)?;
    let kind = request.txp.kind();

    println!("Request:");
    println!("  Kind: {kind}");
    println!("  Coin: {}", request.txp.coin());
    println!("  Root: {}", request.root_path);
    println!(
        "  Round: {} of {} required, {} remaining",
        request.round.required - request.round.remaining,
        request.round.required,
        request.round.remaining
    );

    for path in signatures {
        let bytes = decode_fragments(&read_lines(Some(path))?)?;
        let share = SignatureShare::from_payload(kind, &bytes)?;

        match (&request.txp, &share) {
            (TransactionProposal::Account(call), SignatureShare::Account(sig)) => {
                let signer = evm::recover_address(call, sig)?;
                println!("{}: signed by {signer}", path.display());
            }
            (TransactionProposal::Utxo(proposal), SignatureShare::Utxo(sigs)) => {
                utxo::check_share(proposal, sigs)?;
                println!("{}: {} input signatures", path.display(), sigs.len());
            }
            _ => bail!("{}: signature family does not match the request", path.display()),
        }
    }

    Ok(())
}

async fn run_simulate(
    required: usize,
    total: usize,
    seed: u64,
    capacity: Option<usize>,
) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(seed);

    let signers = (0..total)
        .map(|_| {
            let mut seed = [0u8; 32];
            rng.fill_bytes(&mut seed);
            HdWallet::from_seed(&seed)
        })
        .collect::<airgap_core::Result<Vec<_>>>()?;

    let suffix: DerivationSuffix = DEFAULT_ACCOUNT_PATH.parse()?;
    let owners = signers
        .iter()
        .map(|w| w.derive(DEFAULT_ROOT_PATH, &suffix).map(|k| k.address()))
        .collect::<airgap_core::Result<Vec<_>>>()?;

    let contract = MemoryContract::new(10u128.pow(18));
    let address = contract.deploy(owners, required);
    info!(%address, required, total, "Contract deployed");

    let mut destination = [0u8; 20];
    rng.fill_bytes(&mut destination);
    let call = AccountCall {
        coin: "eth".into(),
        receive_address: address,
        destination: airgap_core::Address(destination),
        value: 10u128.pow(15),
        data: HexData::default(),
        nonce: 0,
        path: DEFAULT_ACCOUNT_PATH.into(),
        gas_price: Some(20_000_000_000),
        gas_limit: None,
    };

    let mut flow = SigningCoordinator::new(
        TransactionProposal::Account(call),
        DEFAULT_ROOT_PATH,
        required,
        total,
        CoordinatorConfig {
            fragment_capacity: capacity,
            ..Default::default()
        },
    )?;
    let cold_config = ColdSignerConfig {
        fragment_capacity: capacity,
        ..Default::default()
    };

    let mut order: Vec<usize> = (0..total).collect();
    order.shuffle(&mut rng);

    for &signer in order.iter().take(required) {
        let shown = flow.build()?;
        flow.next_step()?;
        info!(signer, fragments = shown.len(), "Request on screen");

        let mut cold = ColdSigner::new(
            signers[signer].clone(),
            DEFAULT_ROOT_PATH,
            cold_config.clone(),
        )?;
        let mut returned = None;
        for text in camera_feed(&shown, &mut rng) {
            if let ColdSignerEvent::Signed { fragments } = cold.on_scan(&text)? {
                returned = Some(fragments);
                break;
            }
        }
        let returned =
            returned.ok_or_else(|| anyhow!("signer {signer} never completed the request"))?;
        cold.finish()?;

        let mut accepted = false;
        for text in camera_feed(&returned, &mut rng) {
            match flow.on_scan(&text)? {
                CoordinatorEvent::SignatureAccepted { remaining } => {
                    info!(signer, remaining, "Signature accepted");
                    accepted = true;
                }
                CoordinatorEvent::ReadyToFinalize => {
                    info!(signer, "Threshold met");
                    accepted = true;
                }
                _ => {}
            }
            if accepted {
                break;
            }
        }
        if !accepted {
            bail!("signature from signer {signer} was never reassembled");
        }
    }

    match flow.finalize(&AccountFinalizer::new(contract.clone())).await? {
        FinalizeOutcome::Broadcast(tx) => println!("Broadcast: {tx}"),
        FinalizeOutcome::Pending { signed, required } => {
            println!("Pending: {signed} of {required} signatures")
        }
    }

    Ok(())
}

/// Every fragment once plus random repeats, shuffled, as a camera sees a
/// rotating display
fn camera_feed(fragments: &[String], rng: &mut StdRng) -> Vec<String> {
    let mut feed = fragments.to_vec();
    for _ in 0..rng.gen_range(0..=fragments.len()) {
        feed.push(fragments[rng.gen_range(0..fragments.len())].clone());
    }
    feed.shuffle(rng);
    feed
}

fn decode_fragments(lines: &[String]) -> Result<Vec<u8>> {
    let mut session = DecodeSession::new();

    for line in lines {
        match session.receive(line) {
            Ok(DecodeState::Complete) => break,
            Ok(DecodeState::InProgress { received, expected }) => {
                debug!(received, expected, "Fragment accepted")
            }
            Err(e) if e.is_malformed() => warn!(error = %e, "Skipping line"),
            Err(e) => return Err(e.into()),
        }
    }

    session.take_result().ok_or_else(|| {
        anyhow!(
            "incomplete payload: {} of {} fragments ({:.0}%)",
            session.received_indexes().len(),
            session.expected_count(),
            session.estimated_percent_complete() * 100.0
        )
    })
}

fn load_wallet(path: &Path) -> Result<HdWallet> {
    let xprv = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(xprv.trim().parse()?)
}

fn read_input(path: Option<&Path>) -> Result<Vec<u8>> {
    match path {
        Some(path) => Ok(std::fs::read(path)?),
        None => {
            let mut buf = Vec::new();
            io::stdin().read_to_end(&mut buf)?;
            Ok(buf)
        }
    }
}

fn read_lines(path: Option<&Path>) -> Result<Vec<String>> {
    let text = match path {
        Some(path) => std::fs::read_to_string(path)?,
        None => {
            let mut text = String::new();
            for line in io::stdin().lock().lines() {
                text.push_str(&line?);
                text.push('\n');
            }
            text
        }
    };

    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}
