//! EVM accounts: secp256k1 keys, checksummed addresses, ERC-20 balances.

use super::{rpc_call, NetworkConfig, NetworkFamily, NetworkKind};
use crate::error::{Error, Result};
use crate::model::KeyMaterial;
use async_trait::async_trait;
use k256::ecdsa::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde_json::json;
use sha3::{Digest, Keccak256};

/// `balanceOf(address)` selector.
const BALANCE_OF_SELECTOR: &str = "70a08231";

/// EVM network family.
pub struct EvmFamily {
    http: reqwest::Client,
}

impl EvmFamily {
    /// Create the family over a shared HTTP client.
    #[must_use]
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl NetworkFamily for EvmFamily {
    fn kind(&self) -> NetworkKind {
        NetworkKind::Evm
    }

    fn generate_keys(&self) -> Result<KeyMaterial> {
        let signing_key = SigningKey::random(&mut OsRng);
        Ok(KeyMaterial {
            public_address: address_from_key(signing_key.verifying_key()),
            private_key: format!("0x{}", hex::encode(signing_key.to_bytes())),
        })
    }

    async fn query_balance(&self, network: &NetworkConfig, address: &str) -> Result<u128> {
        let owner = parse_address(address)?;
        let data = format!("0x{BALANCE_OF_SELECTOR}{:0>64}", hex::encode(owner));
        let result = rpc_call(
            &self.http,
            &network.rpc_url,
            "eth_call",
            json!([{ "to": network.asset, "data": data }, "latest"]),
        )
        .await?;

        let word = result
            .as_str()
            .ok_or_else(|| Error::Serialization("eth_call result is not a string".to_string()))?;
        parse_uint(word)
    }
}

/// Derive the EIP-55 checksummed address of a public key.
#[must_use]
pub fn address_from_key(key: &VerifyingKey) -> String {
    let point = key.to_encoded_point(false);
    // Uncompressed SEC1 encoding starts with the 0x04 tag byte.
    let hash = Keccak256::digest(&point.as_bytes()[1..]);
    to_checksum_address(&hash[12..])
}

/// Render 20 address bytes with the EIP-55 mixed-case checksum.
#[must_use]
pub fn to_checksum_address(bytes: &[u8]) -> String {
    let lower = hex::encode(bytes);
    let hash = Keccak256::digest(lower.as_bytes());

    let mut out = String::with_capacity(2 + lower.len());
    out.push_str("0x");
    for (i, c) in lower.chars().enumerate() {
        let byte = hash[i / 2];
        let nibble = if i % 2 == 0 { byte >> 4 } else { byte & 0x0f };
        if c.is_ascii_alphabetic() && nibble >= 8 {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Parse an EVM address string.
///
/// # Errors
///
/// Returns an error if the address format is invalid.
pub fn parse_address(address: &str) -> Result<[u8; 20]> {
    if !address.starts_with("0x") && !address.starts_with("0X") {
        return Err(Error::BadRequest(format!(
            "Invalid EVM address format: must start with '0x', got: {address}"
        )));
    }

    if address.len() != 42 {
        return Err(Error::BadRequest(format!(
            "Invalid EVM address length: expected 42 characters, got {}",
            address.len()
        )));
    }

    let hex_part = &address[2..];
    if !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::BadRequest(format!(
            "Invalid EVM address: contains non-hex characters: {address}"
        )));
    }

    let bytes = hex::decode(hex_part)
        .map_err(|e| Error::BadRequest(format!("Failed to decode EVM address: {e}")))?;

    let mut address_bytes = [0u8; 20];
    address_bytes.copy_from_slice(&bytes);
    Ok(address_bytes)
}

/// Parse a `0x`-prefixed 256-bit quantity that must fit in `u128`.
fn parse_uint(word: &str) -> Result<u128> {
    let digits = word
        .strip_prefix("0x")
        .ok_or_else(|| Error::Serialization(format!("quantity without 0x prefix: {word}")))?
        .trim_start_matches('0');

    if digits.is_empty() {
        return Ok(0);
    }
    if digits.len() > 32 {
        return Err(Error::Serialization(format!(
            "quantity exceeds 128 bits: {word}"
        )));
    }
    u128::from_str_radix(digits, 16)
        .map_err(|e| Error::Serialization(format!("invalid quantity {word}: {e}")))
}
