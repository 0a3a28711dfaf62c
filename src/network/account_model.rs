//! Account-model (Solana-style) accounts: Ed25519 keys, SPL token balances.

use super::{rpc_call, NetworkConfig, NetworkFamily, NetworkKind};
use crate::error::{Error, Result};
use crate::model::KeyMaterial;
use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use rand::RngCore;
use serde_json::{json, Value};

/// Account-model network family.
pub struct AccountModelFamily {
    http: reqwest::Client,
}

impl AccountModelFamily {
    /// Create the family over a shared HTTP client.
    #[must_use]
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl NetworkFamily for AccountModelFamily {
    fn kind(&self) -> NetworkKind {
        NetworkKind::AccountModel
    }

    fn generate_keys(&self) -> Result<KeyMaterial> {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        let signing_key = SigningKey::from_bytes(&secret);

        Ok(KeyMaterial {
            public_address: bs58::encode(signing_key.verifying_key().as_bytes()).into_string(),
            // secret || public, the usual 64-byte wallet export
            private_key: bs58::encode(signing_key.to_keypair_bytes()).into_string(),
        })
    }

    async fn query_balance(&self, network: &NetworkConfig, address: &str) -> Result<u128> {
        parse_pubkey(address)?;
        let result = rpc_call(
            &self.http,
            &network.rpc_url,
            "getTokenAccountsByOwner",
            json!([address, { "mint": network.asset }, { "encoding": "jsonParsed" }]),
        )
        .await?;
        sum_token_accounts(&result)
    }
}

/// Decode a base58 public key.
///
/// # Errors
///
/// Returns an error unless `address` is base58 for exactly 32 bytes.
pub fn parse_pubkey(address: &str) -> Result<[u8; 32]> {
    let bytes = bs58::decode(address)
        .into_vec()
        .map_err(|e| Error::BadRequest(format!("Invalid base58 address {address}: {e}")))?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
        Error::BadRequest(format!(
            "Invalid address length: expected 32 bytes, got {}",
            bytes.len()
        ))
    })
}

/// Sum `tokenAmount.amount` over a `getTokenAccountsByOwner` result.
fn sum_token_accounts(result: &Value) -> Result<u128> {
    let accounts = result
        .get("value")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::Serialization("token account list missing".to_string()))?;

    accounts.iter().try_fold(0u128, |total, account| {
        let amount = account
            .pointer("/account/data/parsed/info/tokenAmount/amount")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Serialization("token account without amount".to_string()))?;
        let amount: u128 = amount
            .parse()
            .map_err(|e| Error::Serialization(format!("invalid token amount {amount}: {e}")))?;
        total
            .checked_add(amount)
            .ok_or_else(|| Error::Serialization("token balance overflow".to_string()))
    })
}
