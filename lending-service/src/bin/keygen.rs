use anyhow::{Context, Result};
use bip39::Mnemonic;
use bitcoin::Network;
use clap::Parser;
use rand::RngCore;

use quas_custody::{assemble_tree, AddressDeriver, Custodian, CustodianKeySet, TreeVariant};

#[derive(Parser)]
#[command(name = "quas-keygen")]
#[command(about = "Generate a custody seed and print the matching config", long_about = None)]
struct Cli {
    /// Network the protocol address is printed for (testnet, signet or regtest)
    #[arg(short, long, default_value = "testnet")]
    network: String,

    /// Recover from an existing mnemonic instead of generating one
    #[arg(short, long)]
    mnemonic: Option<String>,

    /// Mnemonic length for a fresh seed (12 or 24)
    #[arg(short, long, default_value = "24")]
    words: usize,
}

struct KeygenReport {
    seed_hex: String,
    master: String,
    custodians: Vec<String>,
    protocol_address: String,
}

fn parse_network(name: &str) -> Result<Network> {
    match name {
        "mainnet" | "bitcoin" => anyhow::bail!("Custody runs on test networks only, got {}", name),
        "testnet" => Ok(Network::Testnet),
        "signet" => Ok(Network::Signet),
        "regtest" => Ok(Network::Regtest),
        other => anyhow::bail!("Invalid network type: {}", other),
    }
}

fn fresh_mnemonic(words: usize) -> Result<Mnemonic> {
    let mut entropy = match words {
        12 => vec![0u8; 16],
        24 => vec![0u8; 32],
        other => anyhow::bail!("Unsupported mnemonic length: {} words", other),
    };
    rand::thread_rng().fill_bytes(&mut entropy);
    Mnemonic::from_entropy(&entropy).context("Failed to build mnemonic")
}

fn report(mnemonic: &Mnemonic, network: Network) -> Result<KeygenReport> {
    let seed_hex = hex::encode(mnemonic.to_seed(""));
    let keys = CustodianKeySet::from_seed_hex(&seed_hex).context("Failed to derive custodian keys")?;

    let tree = assemble_tree(&keys, TreeVariant::Base)?;
    let protocol = AddressDeriver::for_deployment(network)?.derive_address(
        keys.master_x_only(),
        &tree,
        network,
    )?;

    Ok(KeygenReport {
        seed_hex,
        master: keys.master_x_only().to_string(),
        custodians: Custodian::ALL
            .iter()
            .map(|c| keys.x_only(*c).to_string())
            .collect(),
        protocol_address: protocol.address().to_string(),
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let network = parse_network(&cli.network)?;

    let mnemonic = match cli.mnemonic.as_deref() {
        Some(words) => Mnemonic::parse(words).context("Invalid mnemonic")?,
        None => fresh_mnemonic(cli.words)?,
    };
    let report = report(&mnemonic, network)?;

    println!("Mnemonic (write it down, it is the only backup):");
    println!("  {}\n", mnemonic);

    println!("Master key:       {}", report.master);
    for (custodian, key) in Custodian::ALL.iter().zip(&report.custodians) {
        println!("Custodian {}:     {}", custodian, key);
    }
    println!("Protocol address: {}\n", report.protocol_address);

    println!("config.toml:");
    println!("---");
    println!("[network]");
    println!("type = \"{}\"\n", cli.network);
    println!("[server]");
    println!("host = \"0.0.0.0\"");
    println!("port = 3000\n");
    println!("[custody]");
    println!("# Prefer BITCOIN_KEY in production");
    println!("master_seed_hex = \"{}\"", report.seed_hex);
    println!("---");

    Ok(())
}
