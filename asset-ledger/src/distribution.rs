//! Largest-remainder pro-rata allocation
//!
//! Splits an integer pool across weights so that the shares sum to the
//! pool exactly. Each recipient first gets `floor(pool * w / W)`; the
//! leftover units go one each to the largest fractional remainders, ties
//! broken by input position.

use crate::types::TokenAmount;
use crate::{Error, Result};

/// Allocate `pool` across `weights`
///
/// Errors on an empty weight list or a zero total weight. Zero weights
/// are allowed and receive nothing.
pub fn allocate_largest_remainder(pool: TokenAmount, weights: &[u64]) -> Result<Vec<TokenAmount>> {
    if weights.is_empty() {
        return Err(Error::InvalidInput("no recipients".to_string()));
    }

    let total: u128 = weights.iter().map(|w| u128::from(*w)).sum();
    if total == 0 {
        return Err(Error::InvalidInput("total weight is zero".to_string()));
    }

    let pool_wide = u128::from(pool);
    let mut shares = Vec::with_capacity(weights.len());
    let mut remainders = Vec::with_capacity(weights.len());
    let mut allocated: u128 = 0;

    for (index, weight) in weights.iter().enumerate() {
        // pool < 2^64 and weight < 2^64, so the product fits in u128
        let exact = pool_wide * u128::from(*weight);
        let share = exact / total;
        allocated += share;
        shares.push(share);
        remainders.push((exact % total, index));
    }

    let mut leftover = pool_wide - allocated;
    // Largest remainder first; equal remainders keep input order
    remainders.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    for (remainder, index) in remainders {
        if leftover == 0 {
            break;
        }
        if remainder == 0 {
            return Err(Error::InvariantViolation(
                "leftover units without fractional remainders".to_string(),
            ));
        }
        shares[index] += 1;
        leftover -= 1;
    }

    shares
        .into_iter()
        .map(|share| {
            TokenAmount::try_from(share)
                .map_err(|_| Error::InvariantViolation("share exceeds pool".to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sixty_forty() {
        assert_eq!(allocate_largest_remainder(1_000, &[60, 40]).unwrap(), vec![600, 400]);
    }

    #[test]
    fn test_three_way_odd_pool() {
        let shares = allocate_largest_remainder(100, &[1, 1, 1]).unwrap();
        assert_eq!(shares, vec![34, 33, 33]);

        let shares = allocate_largest_remainder(7, &[1, 1, 1]).unwrap();
        assert_eq!(shares, vec![3, 2, 2]);
    }

    #[test]
    fn test_largest_remainder_wins() {
        // exact shares 3.3, 3.6, 3.1 -> floors 3, 3, 3 and one leftover
        let shares = allocate_largest_remainder(10, &[33, 36, 31]).unwrap();
        assert_eq!(shares, vec![3, 4, 3]);
    }

    #[test]
    fn test_zero_weight_gets_nothing() {
        assert_eq!(allocate_largest_remainder(5, &[0, 2, 3]).unwrap(), vec![0, 2, 3]);
    }

    #[test]
    fn test_zero_pool() {
        assert_eq!(allocate_largest_remainder(0, &[1, 2]).unwrap(), vec![0, 0]);
    }

    #[test]
    fn test_extreme_values_do_not_overflow() {
        let shares = allocate_largest_remainder(u64::MAX, &[u64::MAX, u64::MAX, 1]).unwrap();
        let sum: u128 = shares.iter().map(|s| u128::from(*s)).sum();
        assert_eq!(sum, u128::from(u64::MAX));
    }

    #[test]
    fn test_rejects_degenerate_input() {
        assert!(matches!(allocate_largest_remainder(10, &[]), Err(Error::InvalidInput(_))));
        assert!(matches!(allocate_largest_remainder(10, &[0, 0]), Err(Error::InvalidInput(_))));
    }
}
