//! Receiver keypair generator for rolegate.
//!
//! Generates a fresh keypair for a network family and prints the public
//! address, ready to paste into a group's `receivers` table. The private key
//! is written to a file only when `--out` is given.
//!
//! Usage:
//!   rolegate-keygen evm
//!   rolegate-keygen account-model --out receiver.secret

use clap::{Parser, ValueEnum};
use rolegate::network::{AccountModelFamily, EvmFamily, NetworkFamily};
use std::fs;
use std::path::PathBuf;

/// Generate a receiver keypair.
#[derive(Parser, Debug)]
#[command(name = "rolegate-keygen")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Network family to generate for.
    #[arg(value_enum)]
    kind: CliNetworkKind,

    /// File to write the private key to.
    #[arg(long, short)]
    out: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliNetworkKind {
    /// secp256k1, EIP-55 address.
    Evm,
    /// Ed25519, base58 address.
    AccountModel,
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let http = reqwest::Client::new();
    let family: Box<dyn NetworkFamily> = match cli.kind {
        CliNetworkKind::Evm => Box::new(EvmFamily::new(http)),
        CliNetworkKind::AccountModel => Box::new(AccountModelFamily::new(http)),
    };
    let keys = family.generate_keys()?;

    println!("Address: {}", keys.public_address);

    if let Some(path) = cli.out {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, format!("{}\n", keys.private_key))?;
        println!("Private key saved to: {}", path.display());
        println!("  WARNING: Keep this file secure! Anyone holding it controls the funds.");
    } else {
        println!("Private key not saved (pass --out to keep it).");
    }
    Ok(())
}
