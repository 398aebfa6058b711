// Copyright 2025 RISC Zero, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use thiserror::Error;

/// Number of satoshis in one coin.
pub const SATS_PER_COIN: u64 = 100_000_000;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AmountError {
    #[error("Negative amount: {0}")]
    Negative(f64),

    #[error("Amount is not finite: {0}")]
    NotFinite(f64),

    #[error("Amount out of range: {0}")]
    OutOfRange(f64),
}

/// Convert a daemon-reported coin value into satoshis.
///
/// The daemon reports values as JSON floats with 8 decimal places, so the value is rounded to the
/// nearest satoshi rather than truncated.
pub fn coins_to_sats(value: f64) -> Result<u64, AmountError> {
    if !value.is_finite() {
        return Err(AmountError::NotFinite(value));
    }
    if value < 0.0 {
        return Err(AmountError::Negative(value));
    }
    let sats = (value * SATS_PER_COIN as f64).round();
    if sats > u64::MAX as f64 {
        return Err(AmountError::OutOfRange(value));
    }
    Ok(sats as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coins_to_sats_rounds_float_noise() {
        // 0.1 + 0.2 style float noise must not lose a satoshi
        assert_eq!(coins_to_sats(12.00000001).unwrap(), 1_200_000_001);
        assert_eq!(coins_to_sats(0.29999999999999998).unwrap(), 30_000_000);
        assert_eq!(coins_to_sats(0.0).unwrap(), 0);
    }

    #[test]
    fn test_coins_to_sats_rejects_invalid() {
        assert_eq!(coins_to_sats(-1.0), Err(AmountError::Negative(-1.0)));
        assert!(matches!(coins_to_sats(f64::NAN), Err(AmountError::NotFinite(_))));
        assert!(matches!(coins_to_sats(f64::INFINITY), Err(AmountError::NotFinite(_))));
        assert!(matches!(coins_to_sats(1e20), Err(AmountError::OutOfRange(_))));
    }
}
