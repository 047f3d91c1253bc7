//! Arbitrary-precision decimal arithmetic (`spec.md` §3.3/§4.5).
//!
//! Represented as `coefficient * 10^(-scale)`, following the same shape as
//! the teacher's `types/decimal.rs`. Only the operations Jactl's numeric
//! tower needs are implemented: construction, the four basic operators with
//! `minScale`-aware division, comparison, and display.

use std::{cmp::Ordering, fmt, str::FromStr};

use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{Signed, Zero};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Decimal {
    coefficient: BigInt,
    /// Number of digits after the decimal point. `value = coefficient / 10^scale`.
    scale: u32,
}

impl Decimal {
    #[must_use]
    pub fn from_i64(v: i64) -> Self {
        Self { coefficient: BigInt::from(v), scale: 0 }
    }

    #[must_use]
    pub fn zero() -> Self {
        Self { coefficient: BigInt::zero(), scale: 0 }
    }

    #[must_use]
    pub fn scale(&self) -> u32 {
        self.scale
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.coefficient.is_zero()
    }

    fn rescale_to(&self, scale: u32) -> BigInt {
        if scale >= self.scale {
            &self.coefficient * BigInt::from(10u64).pow(scale - self.scale)
        } else {
            // Truncating down-scale is only used internally for comparisons
            // at a common scale chosen to be >= both operands, so this
            // branch is unreachable in practice but kept total.
            &self.coefficient / BigInt::from(10u64).pow(self.scale - scale)
        }
    }

    fn common_scale(a: &Decimal, b: &Decimal) -> u32 {
        a.scale.max(b.scale)
    }

    #[must_use]
    pub fn add(&self, other: &Decimal) -> Decimal {
        let scale = Self::common_scale(self, other);
        Decimal { coefficient: self.rescale_to(scale) + other.rescale_to(scale), scale }
    }

    #[must_use]
    pub fn sub(&self, other: &Decimal) -> Decimal {
        let scale = Self::common_scale(self, other);
        Decimal { coefficient: self.rescale_to(scale) - other.rescale_to(scale), scale }
    }

    #[must_use]
    pub fn mul(&self, other: &Decimal) -> Decimal {
        Decimal { coefficient: &self.coefficient * &other.coefficient, scale: self.scale + other.scale }
    }

    /// Division adds `min_scale` to the larger operand scale, per `spec.md`
    /// §3.3 ("Division of decimals uses a configured minimum scale (default
    /// 10) added to the maximum operand scale").
    pub fn div(&self, other: &Decimal, min_scale: u32) -> Option<Decimal> {
        if other.is_zero() {
            return None;
        }
        let result_scale = self.scale.max(other.scale) + min_scale;
        // numerator = self.coefficient * 10^(result_scale + other.scale - self.scale)
        let shift = result_scale + other.scale - self.scale;
        let numerator = &self.coefficient * BigInt::from(10u64).pow(shift);
        let (quotient, _) = numerator.div_rem(&other.coefficient);
        Some(Decimal { coefficient: quotient, scale: result_scale })
    }

    #[must_use]
    pub fn cmp_value(&self, other: &Decimal) -> Ordering {
        let scale = Self::common_scale(self, other);
        self.rescale_to(scale).cmp(&other.rescale_to(scale))
    }
}

impl FromStr for Decimal {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (sign_rest, negative) = match s.strip_prefix('-') {
            Some(rest) => (rest, true),
            None => (s.strip_prefix('+').unwrap_or(s), false),
        };
        let (int_part, frac_part) = match sign_rest.split_once('.') {
            Some((i, f)) => (i, f),
            None => (sign_rest, ""),
        };
        let digits = format!("{int_part}{frac_part}");
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(());
        }
        let mut coefficient: BigInt = digits.parse().map_err(|_| ())?;
        if negative {
            coefficient = -coefficient;
        }
        Ok(Decimal { coefficient, scale: frac_part.len() as u32 })
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let neg = self.coefficient.is_negative();
        let digits = self.coefficient.abs().to_str_radix(10);
        if self.scale == 0 {
            return write!(f, "{}{digits}", if neg { "-" } else { "" });
        }
        let scale = self.scale as usize;
        let padded = if digits.len() <= scale { format!("{:0>width$}", digits, width = scale + 1) } else { digits };
        let split_at = padded.len() - scale;
        write!(f, "{}{}.{}", if neg { "-" } else { "" }, &padded[..split_at], &padded[split_at..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_round_trips() {
        let d: Decimal = "12.340".parse().unwrap();
        assert_eq!(d.to_string(), "12.340");
    }

    #[test]
    fn division_uses_min_scale_over_max_operand_scale() {
        let a: Decimal = "1".parse().unwrap();
        let b: Decimal = "3".parse().unwrap();
        let q = a.div(&b, 10).unwrap();
        assert_eq!(q.scale(), 10);
        assert_eq!(q.to_string(), "0.3333333333");
    }

    #[test]
    fn division_by_zero_is_none() {
        let a = Decimal::from_i64(1);
        assert!(a.div(&Decimal::zero(), 10).is_none());
    }

    #[test]
    fn add_aligns_to_larger_scale() {
        let a: Decimal = "1.5".parse().unwrap();
        let b: Decimal = "0.25".parse().unwrap();
        assert_eq!(a.add(&b).to_string(), "1.75");
    }
}
