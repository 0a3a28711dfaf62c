//! Payment requirements and price conversion.

use crate::error::{Error, Result};
use crate::model::NetworkId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version spoken with clients and the facilitator.
pub const X402_VERSION: u8 = 1;

/// The only payment scheme offered: pay exactly the quoted amount.
pub const SCHEME_EXACT: &str = "exact";

/// A price, either human money or raw atomic units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Price {
    /// Decimal money string such as `"$0.50"` or `"0.5"`.
    Money(String),
    /// Amount already expressed in atomic asset units.
    Atomic(u128),
}

impl Price {
    /// Convert to atomic units of an asset with `decimals` places.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidPrice` if the price is negative, not a
    /// number, too large, or below one atomic unit.
    pub fn to_atomic(&self, decimals: u8) -> Result<u128> {
        match self {
            Self::Money(money) => parse_money(money, decimals),
            Self::Atomic(0) => Err(Error::InvalidPrice("price is zero".to_string())),
            Self::Atomic(amount) => Ok(*amount),
        }
    }
}

/// Parse a decimal money string into atomic units, rounding down.
///
/// Accepts an optional leading `$`. Digits beyond `decimals` places are
/// truncated.
///
/// # Errors
///
/// Returns `Error::InvalidPrice` if the string is not a non-negative
/// decimal number, overflows, or rounds down to zero.
pub fn parse_money(money: &str, decimals: u8) -> Result<u128> {
    let invalid = |why: &str| Error::InvalidPrice(format!("{money:?}: {why}"));

    let trimmed = money.trim();
    let digits = trimmed.strip_prefix('$').unwrap_or(trimmed);
    if digits.starts_with('-') {
        return Err(invalid("negative"));
    }

    let (whole, fraction) = digits.split_once('.').unwrap_or((digits, ""));
    if whole.is_empty() && fraction.is_empty() {
        return Err(invalid("no digits"));
    }
    if !whole.chars().chain(fraction.chars()).all(|c| c.is_ascii_digit()) {
        return Err(invalid("not a decimal number"));
    }

    let scale = 10u128
        .checked_pow(u32::from(decimals))
        .ok_or_else(|| invalid("too many decimals"))?;

    let whole_units = if whole.is_empty() {
        0
    } else {
        whole
            .parse::<u128>()
            .map_err(|_| invalid("too large"))?
            .checked_mul(scale)
            .ok_or_else(|| invalid("too large"))?
    };

    let kept: String = fraction
        .chars()
        .chain(std::iter::repeat('0'))
        .take(usize::from(decimals))
        .collect();
    let fraction_units = if kept.is_empty() {
        0
    } else {
        kept.parse::<u128>().map_err(|_| invalid("bad fraction"))?
    };

    let total = whole_units
        .checked_add(fraction_units)
        .ok_or_else(|| invalid("too large"))?;
    if total == 0 {
        return Err(invalid("below one atomic unit"));
    }
    Ok(total)
}

/// EIP-712 domain of the asset, echoed so clients can sign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetDomain {
    /// Domain name, e.g. `USDC`.
    pub name: String,
    /// Domain version.
    pub version: String,
}

/// One acceptable way to pay, in the `accepts` wire shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirement {
    /// Payment scheme.
    pub scheme: String,
    /// Settlement network id.
    pub network: NetworkId,
    /// Amount in atomic units, as a decimal string.
    pub max_amount_required: String,
    /// Reference to what is being bought.
    pub resource: String,
    /// Human-readable description.
    pub description: String,
    /// Response MIME type.
    #[serde(default)]
    pub mime_type: String,
    /// Receiver address.
    pub pay_to: String,
    /// Validity window of the proof, in seconds.
    pub max_timeout_seconds: u64,
    /// Asset contract or mint.
    pub asset: String,
    /// Shape of the paid response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    /// Asset signing domain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<AssetDomain>,
}

impl PaymentRequirement {
    /// Required amount in atomic units.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidPrice` if the amount string is not an integer.
    pub fn amount(&self) -> Result<u128> {
        self.max_amount_required
            .parse()
            .map_err(|e| Error::InvalidPrice(format!("{}: {e}", self.max_amount_required)))
    }
}
