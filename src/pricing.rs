//! Price computation for timed access.

use crate::error::{Error, Result};

/// Total price of `duration` seconds at `price_per_unit` per
/// `unit_seconds`, in atomic asset units.
///
/// The result is `floor(price_per_unit * duration / unit_seconds)`: any
/// fractional atomic unit is dropped in the payer's favour.
///
/// # Errors
///
/// Returns `Error::BadRequest` if `unit_seconds` is zero, the product
/// overflows, or the price rounds down to zero. Access is never granted
/// for free.
pub fn total_price(price_per_unit: u64, duration: u64, unit_seconds: u64) -> Result<u128> {
    if unit_seconds == 0 {
        return Err(Error::BadRequest("pricing unit is zero".to_string()));
    }

    let total = u128::from(price_per_unit)
        .checked_mul(u128::from(duration))
        .ok_or_else(|| Error::BadRequest("price overflow".to_string()))?
        / u128::from(unit_seconds);

    if total == 0 {
        return Err(Error::BadRequest(format!(
            "a {duration}s duration rounds to a zero price"
        )));
    }
    Ok(total)
}
